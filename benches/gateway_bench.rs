//! Criterion benchmarks for hot paths in the realtime gateway.
//!
//! Run with:
//!   cargo bench
//!
//! Covers:
//!   - Per-User Message Buffer enqueue/take_batch under contention
//!   - Message Batcher accumulation and flush
//!   - Envelope decode + validation (the per-frame hot path)

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use gateway_core::batch::{BatchStrategy, MessageBatcher};
use gateway_core::buffer::{MessageBuffer, OverflowPolicy};
use gateway_core::codec::decode_and_validate;
use gateway_core::config::{BatchConfig, BufferConfig};
use gateway_core::envelope::{Envelope, MessageType, Priority};

fn rt() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
}

fn chat_envelope() -> Envelope {
    Envelope::new(MessageType::ChatMessage, serde_json::json!({"text": "benchmark payload"}), Priority::Normal, &[])
}

// ─── Per-User Message Buffer ─────────────────────────────────────────────────

fn bench_buffer_enqueue(c: &mut Criterion) {
    c.bench_function("buffer_enqueue_single_user", |b| {
        let runtime = rt();
        b.iter_with_setup(
            || MessageBuffer::new(BufferConfig::default(), OverflowPolicy::DropOldest),
            |buffer| {
                runtime.block_on(async {
                    for _ in 0..100 {
                        black_box(buffer.enqueue("u1", chat_envelope()).await.unwrap());
                    }
                });
            },
        );
    });

    c.bench_function("buffer_enqueue_many_users", |b| {
        let runtime = rt();
        b.iter_with_setup(
            || MessageBuffer::new(BufferConfig::default(), OverflowPolicy::DropOldest),
            |buffer| {
                runtime.block_on(async {
                    for i in 0..100 {
                        let user = format!("user-{}", i % 20);
                        black_box(buffer.enqueue(&user, chat_envelope()).await.unwrap());
                    }
                });
            },
        );
    });
}

fn bench_buffer_take_batch(c: &mut Criterion) {
    let runtime = rt();
    c.bench_function("buffer_take_batch_50", |b| {
        b.iter_with_setup(
            || {
                let buffer = MessageBuffer::new(BufferConfig::default(), OverflowPolicy::DropOldest);
                runtime.block_on(async {
                    for _ in 0..50 {
                        buffer.enqueue("u1", chat_envelope()).await.unwrap();
                    }
                });
                buffer
            },
            |buffer| {
                runtime.block_on(async {
                    black_box(buffer.take_batch("u1", 50).await);
                });
            },
        );
    });
}

// ─── Message Batcher ─────────────────────────────────────────────────────────

fn bench_batcher_accumulate(c: &mut Criterion) {
    let runtime = rt();
    c.bench_function("batcher_push_and_flush_20", |b| {
        b.iter_with_setup(
            || MessageBatcher::new(BatchConfig::default(), BatchStrategy::Hybrid),
            |batcher| {
                runtime.block_on(async {
                    for _ in 0..20 {
                        batcher.push("conn:1", chat_envelope()).await;
                    }
                    black_box(batcher.flush("conn:1").await);
                });
            },
        );
    });
}

// ─── Envelope decode + validation ────────────────────────────────────────────

fn bench_decode_and_validate(c: &mut Criterion) {
    let raw = r#"{"type":"chat_message","payload":{"text":"hello world"},"timestamp":"2026-01-01T00:00:00Z"}"#;

    c.bench_function("decode_and_validate_chat_message", |b| {
        b.iter(|| {
            black_box(decode_and_validate(black_box(raw), 32 * 1024).unwrap());
        });
    });

    let raw_with_ids = r#"{"type":"chat_message","payload":{"text":"hello"},"timestamp":"2026-01-01T00:00:00Z","sender":"user-1","correlation_id":"corr-1"}"#;
    c.bench_function("decode_and_validate_with_optional_fields", |b| {
        b.iter(|| {
            black_box(decode_and_validate(black_box(raw_with_ids), 32 * 1024).unwrap());
        });
    });
}

criterion_group!(benches, bench_buffer_enqueue, bench_buffer_take_batch, bench_batcher_accumulate, bench_decode_and_validate);
criterion_main!(benches);
