//! Per-User Message Buffer.
//!
//! A bounded FIFO per user with priority-aware overflow, plus a global cap
//! shared across all users. Sends are transactional: `take_batch` moves
//! `Pending -> Sending` atomically, and the caller must follow up with
//! `ack`/`nack` — messages reverted by a crashed sender loop are recovered by
//! [`ConnectionBuffer::recover_stale_sending`] rather than lost or
//! double-delivered, since replay is idempotent via `message_id` on the
//! consumer side.

use crate::config::{BufferConfig, DEFAULT_BACKOFF_SCHEDULE_SECS};
use crate::envelope::{Envelope, Priority};
use crate::error::GatewayError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Pending,
    Sending,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    DropOldest,
    DropNewest,
    DropLowPriority,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        OverflowPolicy::DropOldest
    }
}

#[derive(Debug, Clone)]
struct BufferedMessage {
    envelope: Envelope,
    state: BufferState,
    attempt_count: u32,
    last_attempt_at: Option<Instant>,
    next_retry_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BufferStats {
    pub messages_buffered: u64,
    pub messages_delivered: u64,
    pub messages_dropped: u64,
    pub overflow_events: u64,
    pub retry_attempts: u64,
}

/// Buffers for every user, plus the global cap and counters.
pub struct MessageBuffer {
    per_user: RwLock<HashMap<String, Vec<BufferedMessage>>>,
    config: BufferConfig,
    overflow_policy: OverflowPolicy,
    stats: RwLock<BufferStats>,
}

impl MessageBuffer {
    pub fn new(config: BufferConfig, overflow_policy: OverflowPolicy) -> Self {
        Self {
            per_user: RwLock::new(HashMap::new()),
            config,
            overflow_policy,
            stats: RwLock::new(BufferStats::default()),
        }
    }

    /// Enqueue a message for `user_id`. Oversize messages never enter the
    /// buffer at all — `Overflow` is returned immediately and counted as a
    /// drop rather than silently discarded.
    pub async fn enqueue(&self, user_id: &str, envelope: Envelope) -> Result<(), GatewayError> {
        if envelope.size_bytes > self.config.max_message_size_bytes {
            self.stats.write().await.messages_dropped += 1;
            return Err(GatewayError::Overflow(format!(
                "message size {} exceeds max {}",
                envelope.size_bytes, self.config.max_message_size_bytes
            )));
        }

        let mut per_user = self.per_user.write().await;
        let queue = per_user.entry(user_id.to_string()).or_default();

        if queue.len() >= self.config.max_per_user {
            self.apply_overflow(user_id, queue, &envelope).await?;
        }

        queue.push(BufferedMessage {
            envelope,
            state: BufferState::Pending,
            attempt_count: 0,
            last_attempt_at: None,
            next_retry_at: None,
        });

        let global_len: usize = per_user.values().map(|q| q.len()).sum();
        if global_len > self.config.max_global {
            self.evict_global_oldest_low(&mut per_user).await;
        }

        self.stats.write().await.messages_buffered += 1;
        Ok(())
    }

    /// Apply the configured overflow policy to `queue` in-place, making room
    /// for one more message. Critical messages are never evicted while any
    /// non-critical message remains. Every eviction counts against
    /// `messages_dropped`; evicting a critical message (only possible once
    /// the whole queue is critical) additionally logs a `dead_letter` entry
    /// for the one evicted.
    async fn apply_overflow(&self, user_id: &str, queue: &mut Vec<BufferedMessage>, incoming: &Envelope) -> Result<(), GatewayError> {
        match self.overflow_policy {
            OverflowPolicy::DropOldest => {
                if let Some(idx) = queue.iter().position(|m| !m.envelope.critical_kind) {
                    self.evict_at(user_id, queue, idx, false).await;
                } else {
                    self.evict_at(user_id, queue, 0, true).await;
                }
            }
            OverflowPolicy::DropNewest => {
                if !incoming.critical_kind {
                    self.stats.write().await.messages_dropped += 1;
                    return Err(GatewayError::Overflow("per-user buffer full".into()));
                }
                if let Some(idx) = queue.iter().position(|m| !m.envelope.critical_kind) {
                    self.evict_at(user_id, queue, idx, false).await;
                } else {
                    self.evict_at(user_id, queue, 0, true).await;
                }
            }
            OverflowPolicy::DropLowPriority => {
                let candidate = queue
                    .iter()
                    .enumerate()
                    .filter(|(_, m)| !m.envelope.critical_kind)
                    .min_by_key(|(i, m)| (m.envelope.priority, *i));
                match candidate {
                    Some((idx, _)) => self.evict_at(user_id, queue, idx, false).await,
                    None => self.evict_at(user_id, queue, 0, true).await,
                }
            }
        }
        Ok(())
    }

    /// Remove the message at `idx`, counting it as dropped. `all_critical`
    /// marks the case where no non-critical message was available to evict
    /// instead — the oldest critical message is evicted and the drop is
    /// logged as a dead letter.
    async fn evict_at(&self, user_id: &str, queue: &mut Vec<BufferedMessage>, idx: usize, all_critical: bool) {
        let removed = queue.remove(idx);
        self.stats.write().await.messages_dropped += 1;
        if all_critical {
            warn!(message_id = %removed.envelope.message_id, user_id, dead_letter = true, "evicted a critical message from a full all-critical buffer");
        }
    }

    async fn evict_global_oldest_low(&self, per_user: &mut HashMap<String, Vec<BufferedMessage>>) {
        let target = per_user
            .iter()
            .filter_map(|(user, queue)| {
                queue
                    .iter()
                    .position(|m| m.envelope.priority == Priority::Low)
                    .map(|idx| (user.clone(), idx))
            })
            .next();

        if let Some((user, idx)) = target {
            if let Some(queue) = per_user.get_mut(&user) {
                queue.remove(idx);
            }
            drop(per_user);
            self.stats.write().await.overflow_events += 1;
        }
    }

    /// Atomically move up to `limit` `Pending` messages for `user_id` into
    /// `Sending` and return them.
    pub async fn take_batch(&self, user_id: &str, limit: usize) -> Vec<Envelope> {
        let mut per_user = self.per_user.write().await;
        let Some(queue) = per_user.get_mut(user_id) else { return Vec::new() };

        let mut taken = Vec::new();
        for msg in queue.iter_mut() {
            if taken.len() >= limit {
                break;
            }
            if msg.state == BufferState::Pending {
                msg.state = BufferState::Sending;
                msg.last_attempt_at = Some(Instant::now());
                taken.push(msg.envelope.clone());
            }
        }
        taken
    }

    /// Mark `ids` as delivered and remove them from the buffer.
    pub async fn ack(&self, user_id: &str, ids: &[Uuid]) {
        let mut per_user = self.per_user.write().await;
        if let Some(queue) = per_user.get_mut(user_id) {
            let before = queue.len();
            queue.retain(|m| !(m.state == BufferState::Sending && ids.contains(&m.envelope.message_id)));
            let removed = before - queue.len();
            if removed > 0 {
                drop(per_user);
                self.stats.write().await.messages_delivered += removed as u64;
            }
        }
    }

    /// Mark `ids` as failed: bump `attempt_count`, schedule `next_retry_at`
    /// from the backoff schedule, or dead-letter once `max_attempts` is hit.
    pub async fn nack(&self, user_id: &str, ids: &[Uuid]) {
        let mut per_user = self.per_user.write().await;
        let Some(queue) = per_user.get_mut(user_id) else { return };

        let mut dead_lettered = Vec::new();
        for msg in queue.iter_mut() {
            if msg.state != BufferState::Sending || !ids.contains(&msg.envelope.message_id) {
                continue;
            }
            msg.attempt_count += 1;
            if msg.attempt_count >= self.config.max_attempts {
                msg.state = BufferState::Failed;
                dead_lettered.push(msg.envelope.message_id);
            } else {
                msg.state = BufferState::Failed;
                let idx = (msg.attempt_count as usize).saturating_sub(1).min(DEFAULT_BACKOFF_SCHEDULE_SECS.len() - 1);
                let backoff = Duration::from_secs_f64(DEFAULT_BACKOFF_SCHEDULE_SECS[idx]);
                msg.next_retry_at = Some(Instant::now() + backoff);
            }
        }

        if !dead_lettered.is_empty() {
            queue.retain(|m| !dead_lettered.contains(&m.envelope.message_id));
            drop(per_user);
            let mut stats = self.stats.write().await;
            stats.messages_dropped += dead_lettered.len() as u64;
            for id in dead_lettered {
                warn!(message_id = %id, user_id, dead_letter = true, "message exhausted retries");
            }
        }
    }

    /// Messages whose `next_retry_at` has elapsed, ready to move back to
    /// `Pending`.
    pub async fn due_for_retry(&self, user_id: &str) -> Vec<Uuid> {
        let now = Instant::now();
        let per_user = self.per_user.read().await;
        per_user
            .get(user_id)
            .map(|queue| {
                queue
                    .iter()
                    .filter(|m| m.state == BufferState::Failed && m.next_retry_at.map(|t| t <= now).unwrap_or(false))
                    .map(|m| m.envelope.message_id)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn requeue(&self, user_id: &str, ids: &[Uuid]) {
        let mut per_user = self.per_user.write().await;
        if let Some(queue) = per_user.get_mut(user_id) {
            let mut moved = 0u64;
            for msg in queue.iter_mut() {
                if msg.state == BufferState::Failed && ids.contains(&msg.envelope.message_id) {
                    msg.state = BufferState::Pending;
                    moved += 1;
                }
            }
            drop(per_user);
            if moved > 0 {
                self.stats.write().await.retry_attempts += moved;
            }
        }
    }

    /// Revert any message stuck in `Sending` for longer than
    /// `recovery_deadline` back to `Pending` — covers a sender loop that
    /// crashed mid-delivery without acking or nacking.
    pub async fn recover_stale_sending(&self, recovery_deadline: Duration) {
        let now = Instant::now();
        let mut per_user = self.per_user.write().await;
        for queue in per_user.values_mut() {
            for msg in queue.iter_mut() {
                if msg.state == BufferState::Sending {
                    if let Some(started) = msg.last_attempt_at {
                        if now.duration_since(started) > recovery_deadline {
                            msg.state = BufferState::Pending;
                        }
                    }
                }
            }
        }
    }

    pub async fn stats(&self) -> BufferStats {
        *self.stats.read().await
    }

    pub async fn depth(&self, user_id: &str) -> usize {
        self.per_user.read().await.get(user_id).map(|q| q.len()).unwrap_or(0)
    }
}

pub fn shared(config: BufferConfig, overflow_policy: OverflowPolicy) -> Arc<MessageBuffer> {
    Arc::new(MessageBuffer::new(config, overflow_policy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageType;

    fn env(kind: MessageType, priority: Priority) -> Envelope {
        Envelope::new(kind, serde_json::json!({}), priority, MessageType::DEFAULT_CRITICAL_KINDS)
    }

    #[tokio::test]
    async fn enqueue_then_take_ack_removes_message() {
        let buffer = MessageBuffer::new(BufferConfig::default(), OverflowPolicy::DropOldest);
        buffer.enqueue("u1", env(MessageType::ChatMessage, Priority::Normal)).await.unwrap();

        let batch = buffer.take_batch("u1", 10).await;
        assert_eq!(batch.len(), 1);

        buffer.ack("u1", &[batch[0].message_id]).await;
        assert_eq!(buffer.depth("u1").await, 0);
        assert_eq!(buffer.stats().await.messages_delivered, 1);
    }

    #[tokio::test]
    async fn oversize_message_rejected_not_silently_dropped() {
        let mut config = BufferConfig::default();
        config.max_message_size_bytes = 4;
        let buffer = MessageBuffer::new(config, OverflowPolicy::DropOldest);

        let err = buffer.enqueue("u1", env(MessageType::ChatMessage, Priority::Normal)).await.unwrap_err();
        assert!(matches!(err, GatewayError::Overflow(_)));
        assert_eq!(buffer.stats().await.messages_dropped, 1);
    }

    #[tokio::test]
    async fn drop_oldest_never_evicts_critical_while_non_critical_exists() {
        let mut config = BufferConfig::default();
        config.max_per_user = 2;
        let buffer = MessageBuffer::new(config, OverflowPolicy::DropOldest);

        buffer.enqueue("u1", env(MessageType::AgentStarted, Priority::High)).await.unwrap();
        buffer.enqueue("u1", env(MessageType::ChatMessage, Priority::Normal)).await.unwrap();
        buffer.enqueue("u1", env(MessageType::ChatMessage, Priority::Low)).await.unwrap();

        assert_eq!(buffer.depth("u1").await, 2);
        let remaining = buffer.take_batch("u1", 10).await;
        assert!(remaining.iter().any(|e| e.kind == MessageType::AgentStarted));
        assert_eq!(buffer.stats().await.messages_dropped, 1);
    }

    #[tokio::test]
    async fn drop_low_priority_ties_break_oldest_first() {
        let mut config = BufferConfig::default();
        config.max_per_user = 2;
        let buffer = MessageBuffer::new(config, OverflowPolicy::DropLowPriority);

        // Two LOW-priority messages tie for eviction; the oldest (index 0)
        // must go, not the newest.
        buffer.enqueue("u1", env(MessageType::UserMessage, Priority::Low)).await.unwrap();
        buffer.enqueue("u1", env(MessageType::ChatMessage, Priority::Low)).await.unwrap();
        buffer.enqueue("u1", env(MessageType::StartAgent, Priority::Normal)).await.unwrap();

        assert_eq!(buffer.depth("u1").await, 2);
        let remaining = buffer.take_batch("u1", 10).await;
        assert!(!remaining.iter().any(|e| e.kind == MessageType::UserMessage), "the oldest tied-priority message should have been evicted");
        assert!(remaining.iter().any(|e| e.kind == MessageType::ChatMessage));
        assert!(remaining.iter().any(|e| e.kind == MessageType::StartAgent));
        assert_eq!(buffer.stats().await.messages_dropped, 1);
    }

    #[tokio::test]
    async fn all_critical_overflow_dead_letters_the_oldest() {
        let mut config = BufferConfig::default();
        config.max_per_user = 2;
        let buffer = MessageBuffer::new(config, OverflowPolicy::DropOldest);

        buffer.enqueue("u1", env(MessageType::AgentStarted, Priority::High)).await.unwrap();
        buffer.enqueue("u1", env(MessageType::AgentThinking, Priority::High)).await.unwrap();
        buffer.enqueue("u1", env(MessageType::AgentCompleted, Priority::High)).await.unwrap();

        assert_eq!(buffer.depth("u1").await, 2);
        let remaining = buffer.take_batch("u1", 10).await;
        assert!(!remaining.iter().any(|e| e.kind == MessageType::AgentStarted), "the oldest critical message should have been evicted");
        assert_eq!(buffer.stats().await.messages_dropped, 1);
    }

    #[tokio::test]
    async fn nack_schedules_retry_then_dead_letters_after_max_attempts() {
        let mut config = BufferConfig::default();
        config.max_attempts = 2;
        let buffer = MessageBuffer::new(config, OverflowPolicy::DropOldest);
        buffer.enqueue("u1", env(MessageType::ChatMessage, Priority::Normal)).await.unwrap();

        let batch = buffer.take_batch("u1", 10).await;
        let id = batch[0].message_id;

        buffer.nack("u1", &[id]).await;
        assert_eq!(buffer.depth("u1").await, 1);

        let batch2 = buffer.take_batch("u1", 10).await;
        assert!(batch2.is_empty());
        buffer.requeue("u1", &[id]).await;
        let batch3 = buffer.take_batch("u1", 10).await;
        assert_eq!(batch3.len(), 1);

        buffer.nack("u1", &[id]).await;
        assert_eq!(buffer.depth("u1").await, 0);
        assert_eq!(buffer.stats().await.messages_dropped, 1);
    }

    #[tokio::test]
    async fn global_cap_evicts_low_priority_first() {
        let mut config = BufferConfig::default();
        config.max_per_user = 100;
        config.max_global = 2;
        let buffer = MessageBuffer::new(config, OverflowPolicy::DropOldest);

        buffer.enqueue("u1", env(MessageType::ChatMessage, Priority::Low)).await.unwrap();
        buffer.enqueue("u2", env(MessageType::ChatMessage, Priority::Normal)).await.unwrap();
        buffer.enqueue("u1", env(MessageType::ChatMessage, Priority::Normal)).await.unwrap();

        assert_eq!(buffer.depth("u1").await, 1);
        assert_eq!(buffer.depth("u2").await, 1);
        assert_eq!(buffer.stats().await.overflow_events, 1);
    }
}
