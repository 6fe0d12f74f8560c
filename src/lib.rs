//! Explicit wiring root.
//!
//! `Core` owns every shared component as an `Arc` and is constructed once in
//! `main`. Nothing in this crate reaches for a `static`/`OnceCell` singleton;
//! every component that needs another holds an `Arc` handed to it at
//! construction time.

pub mod auth;
pub mod batch;
pub mod broadcast;
pub mod buffer;
pub mod circuit_breaker;
pub mod codec;
pub mod config;
pub mod envelope;
pub mod error;
pub mod heartbeat;
pub mod ipc;
pub mod pubsub;
pub mod reconnect;
pub mod registry;
pub mod retry;
pub mod retry_scheduler;
pub mod router;
pub mod security;
pub mod state_store;

use std::sync::Arc;
use std::time::{Duration, Instant};

use auth::{SecretResolver, TokenValidator};
use batch::{BatchStrategy, MessageBatcher};
use broadcast::Broadcaster;
use buffer::{MessageBuffer, OverflowPolicy};
use config::GatewayConfig;
use heartbeat::HeartbeatMonitor;
use pubsub::EventBus;
use reconnect::ReconnectionHandler;
use registry::ConnectionRegistry;
use retry_scheduler::RetryScheduler;
use router::MessageRouter;
use state_store::StateStore;

/// Every shared service the IPC layer dispatches against, wired once at
/// startup. Cloning `Arc<Core>` is how each connection task and background
/// sweep gets its references — there is exactly one `Core` per process.
pub struct Core {
    pub config: GatewayConfig,
    pub registry: Arc<ConnectionRegistry>,
    pub token_validator: Arc<TokenValidator>,
    pub heartbeat: Arc<HeartbeatMonitor>,
    pub buffer: Arc<MessageBuffer>,
    pub batcher: Arc<MessageBatcher>,
    pub broadcaster: Arc<Broadcaster>,
    pub state_store: Arc<StateStore>,
    pub reconnect: Arc<ReconnectionHandler>,
    pub router: Arc<MessageRouter>,
    pub pubsub: Arc<EventBus>,
    pub retry_scheduler: Arc<RetryScheduler>,
    pub started_at: Instant,
}

impl Core {
    pub fn new(config: GatewayConfig, secret_resolver: Arc<dyn SecretResolver>) -> Arc<Self> {
        let perf = config.performance;

        let registry = Arc::new(ConnectionRegistry::new(
            perf.max_connections_per_pool,
            perf.rate_limit_requests,
            Duration::from_secs(perf.rate_limit_window_secs),
        ));

        let token_validator = Arc::new(TokenValidator::new(
            secret_resolver,
            Duration::from_secs(config.auth.cache_ttl_secs),
        ));

        let heartbeat = Arc::new(HeartbeatMonitor::new(
            registry.clone(),
            Duration::from_secs(perf.ping_interval_secs),
            Duration::from_secs(perf.ping_timeout_secs),
            Duration::from_secs(perf.dead_after_secs),
        ));

        let buffer = Arc::new(MessageBuffer::new(config.buffer, OverflowPolicy::default()));
        let batcher = Arc::new(MessageBatcher::new(config.batch, BatchStrategy::default()));

        let broadcaster = Arc::new(Broadcaster::new(
            registry.clone(),
            buffer.clone(),
            Duration::from_millis(perf.send_timeout_ms),
            perf.broadcast_batch_size,
            Duration::from_millis(perf.broadcast_batch_timeout_ms),
            perf.disconnect_threshold_failures,
        ));

        // The distilled configuration only names one TTL for disconnection
        // snapshots; the live per-session snapshot reuses it rather than
        // inventing a second untracked default (see DESIGN.md).
        let snapshot_ttl = Duration::from_secs(perf.disconnection_snapshot_ttl_secs);
        let state_store = Arc::new(StateStore::new(snapshot_ttl, snapshot_ttl));

        let reconnect = Arc::new(ReconnectionHandler::new(
            state_store.clone(),
            buffer.clone(),
            broadcaster.clone(),
            perf.max_reconnection_attempts,
            Duration::from_secs(perf.min_reconnect_interval_secs),
        ));

        let router = Arc::new(MessageRouter::new(broadcaster.clone(), registry.clone()));
        let pubsub = Arc::new(EventBus::new());
        let retry_scheduler = Arc::new(RetryScheduler::new(buffer.clone(), Duration::from_millis(500)));

        Arc::new(Self {
            config,
            registry,
            token_validator,
            heartbeat,
            buffer,
            batcher,
            broadcaster,
            state_store,
            reconnect,
            router,
            pubsub,
            retry_scheduler,
            started_at: Instant::now(),
        })
    }
}
