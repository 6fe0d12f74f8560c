//! Broadcaster / Pools.
//!
//! Three dispatch modes over the Registry's pools (`all`, `topic`, per-user),
//! each snapshotting its target list before sending so concurrent
//! registration changes are only visible on the *next* broadcast.
//! Per-connection health bookkeeping reuses the same
//! [`CircuitBreaker`](crate::circuit_breaker::CircuitBreaker) adaptation as
//! the Heartbeat Monitor: a send timeout counts as a failure, a clean send
//! counts as a success, and the breaker's `Open` state is what marks a
//! connection a slow client.

use crate::buffer::MessageBuffer;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::envelope::Envelope;
use crate::error::GatewayError;
use crate::registry::{ConnectionId, ConnectionRegistry, ConnectionState, OutboundFrame};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::warn;

pub struct BroadcastResult {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub duration_ms: u64,
    pub slow: Vec<ConnectionId>,
}

/// Per-connection breakers plus consecutive-failure counters, kept
/// independent of [`ConnectionRegistry`] since not every caller of the
/// Registry needs slow-client bookkeeping.
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    buffer: Arc<MessageBuffer>,
    breakers: RwLock<HashMap<ConnectionId, CircuitBreaker>>,
    send_timeout: Duration,
    chunk_size: usize,
    chunk_timeout: Duration,
    disconnect_threshold_failures: u32,
}

impl Broadcaster {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        buffer: Arc<MessageBuffer>,
        send_timeout: Duration,
        chunk_size: usize,
        chunk_timeout: Duration,
        disconnect_threshold_failures: u32,
    ) -> Self {
        Self {
            registry,
            buffer,
            breakers: RwLock::new(HashMap::new()),
            send_timeout,
            chunk_size,
            chunk_timeout,
            disconnect_threshold_failures,
        }
    }

    pub async fn broadcast_all(&self, envelope: &Envelope) -> BroadcastResult {
        let targets = self.registry.all_open().await;
        self.dispatch(targets, envelope).await
    }

    pub async fn broadcast_subscription(&self, topic: &str, envelope: &Envelope) -> BroadcastResult {
        let targets = self.registry.by_room(topic).await;
        self.dispatch(targets, envelope).await
    }

    /// Send to every OPEN connection for `user_id`; if none are open, the
    /// message is enqueued in the Per-User Buffer instead of being dropped
    ///.
    pub async fn send_user(&self, user_id: &str, envelope: Envelope) -> Result<BroadcastResult, GatewayError> {
        let targets: Vec<ConnectionId> = {
            let user_connections = self.registry.by_user(user_id).await;
            let open = self.registry.all_open().await;
            user_connections.into_iter().filter(|id| open.contains(id)).collect()
        };

        if targets.is_empty() {
            self.buffer.enqueue(user_id, envelope).await?;
            return Ok(BroadcastResult { total: 0, successful: 0, failed: 0, duration_ms: 0, slow: Vec::new() });
        }

        Ok(self.dispatch(targets, &envelope).await)
    }

    /// Snapshot `targets`, split into chunks of `chunk_size`, and dispatch
    /// chunks in parallel — each chunk bounded by `chunk_timeout`.
    async fn dispatch(&self, targets: Vec<ConnectionId>, envelope: &Envelope) -> BroadcastResult {
        let started = Instant::now();
        let total = targets.len();
        let mut successful = 0usize;
        let mut failed = 0usize;
        let mut slow = Vec::new();

        for chunk in targets.chunks(self.chunk_size) {
            let sends = chunk.iter().map(|id| self.send_one(*id, envelope));
            let results = timeout(self.chunk_timeout, futures_util::future::join_all(sends)).await;

            match results {
                Ok(results) => {
                    for (id, ok) in chunk.iter().zip(results) {
                        match ok {
                            Ok(()) => successful += 1,
                            Err(is_slow) => {
                                failed += 1;
                                if is_slow {
                                    slow.push(*id);
                                }
                            }
                        }
                    }
                }
                Err(_) => {
                    // Whole chunk timed out; every connection in it counts as a failure.
                    failed += chunk.len();
                    slow.extend_from_slice(chunk);
                }
            }
        }

        BroadcastResult {
            total,
            successful,
            failed,
            duration_ms: started.elapsed().as_millis() as u64,
            slow,
        }
    }

    /// Send to a single connection with a per-send timeout. `Err(true)`
    /// means the connection is now considered slow (breaker opened);
    /// `Err(false)` means an ordinary send failure short of that.
    async fn send_one(&self, connection_id: ConnectionId, envelope: &Envelope) -> Result<(), bool> {
        let Some(socket) = self.registry.get_socket(connection_id).await else {
            return Err(false);
        };

        let breaker = self.breaker_for(connection_id).await;

        match timeout(self.send_timeout, async {
            socket.send(OutboundFrame::Envelope(envelope.clone())).map_err(|_| ())
        })
        .await
        {
            Ok(Ok(())) => {
                breaker.record_success().await;
                self.registry.reset_errors(connection_id).await;
                Ok(())
            }
            _ => {
                breaker.record_failure().await;
                self.registry.set_state(connection_id, ConnectionState::Degraded).await;
                let errors = self.registry.record_error(connection_id).await;
                warn!(connection = %connection_id, errors, "broadcast send failed or timed out");

                if errors >= self.disconnect_threshold_failures {
                    self.registry.set_state(connection_id, ConnectionState::Closing).await;
                    Err(true)
                } else {
                    Err(false)
                }
            }
        }
    }

    async fn breaker_for(&self, connection_id: ConnectionId) -> CircuitBreaker {
        if let Some(b) = self.breakers.read().await.get(&connection_id) {
            return b.clone();
        }
        let breaker = CircuitBreaker::new(connection_id.to_string(), CircuitBreakerConfig::default());
        self.breakers.write().await.insert(connection_id, breaker.clone());
        breaker
    }

    pub async fn forget(&self, connection_id: ConnectionId) {
        self.breakers.write().await.remove(&connection_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferConfig;
    use crate::buffer::OverflowPolicy;
    use crate::envelope::{MessageType, Priority};
    use tokio::sync::mpsc;

    async fn setup() -> (Arc<ConnectionRegistry>, Arc<MessageBuffer>, Broadcaster) {
        let registry = Arc::new(ConnectionRegistry::new(10, 120, Duration::from_secs(60)));
        let buffer = Arc::new(MessageBuffer::new(BufferConfig::default(), OverflowPolicy::DropOldest));
        let broadcaster = Broadcaster::new(registry.clone(), buffer.clone(), Duration::from_millis(200), 50, Duration::from_millis(100), 5);
        (registry, buffer, broadcaster)
    }

    fn env() -> Envelope {
        Envelope::new(MessageType::ChatMessage, serde_json::json!({"x": 1}), Priority::Normal, &[])
    }

    #[tokio::test]
    async fn broadcast_all_reaches_every_open_connection() {
        let (registry, _buffer, broadcaster) = setup().await;
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        registry.register(ConnectionId::new_v4(), "u1".into(), "s1".into(), tx1).await.unwrap();
        registry.register(ConnectionId::new_v4(), "u2".into(), "s2".into(), tx2).await.unwrap();

        let result = broadcaster.broadcast_all(&env()).await;
        assert_eq!(result.total, 2);
        assert_eq!(result.successful, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn send_user_falls_back_to_buffer_when_no_open_connections() {
        let (_registry, buffer, broadcaster) = setup().await;
        let result = broadcaster.send_user("offline-user", env()).await.unwrap();
        assert_eq!(result.total, 0);
        assert_eq!(buffer.depth("offline-user").await, 1);
    }

    #[tokio::test]
    async fn dropped_receiver_counts_as_failure() {
        let (registry, _buffer, broadcaster) = setup().await;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ConnectionId::new_v4();
        registry.register(id, "u1".into(), "s1".into(), tx).await.unwrap();
        drop(rx);

        let result = broadcaster.broadcast_all(&env()).await;
        assert_eq!(result.failed, 1);
    }
}
