//! Heartbeat Monitor.
//!
//! A single cooperative loop: every `ping_interval` send `ping` to every open
//! connection; if no `pong` within `ping_timeout`, transition to DEGRADED;
//! after `dead_after` of no activity, close with *going-away* and enqueue a
//! disconnection snapshot. DEGRADED/dead bookkeeping reuses the
//! [`CircuitBreaker`](crate::circuit_breaker::CircuitBreaker) adaptation
//! rather than a parallel counter scheme.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::registry::{ConnectionId, ConnectionRegistry, ConnectionState};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Per-connection heartbeat bookkeeping.
struct HeartbeatEntry {
    breaker: CircuitBreaker,
    last_activity: Instant,
}

pub struct HeartbeatMonitor {
    registry: Arc<ConnectionRegistry>,
    entries: RwLock<HashMap<ConnectionId, HeartbeatEntry>>,
    ping_interval: Duration,
    ping_timeout: Duration,
    dead_after: Duration,
}

/// Outcome of one sweep, surfaced so the caller can enqueue disconnection
/// snapshots and close sockets for connections that died this round.
pub struct SweepResult {
    pub to_ping: Vec<ConnectionId>,
    pub newly_degraded: Vec<ConnectionId>,
    pub dead: Vec<ConnectionId>,
}

impl HeartbeatMonitor {
    pub fn new(registry: Arc<ConnectionRegistry>, ping_interval: Duration, ping_timeout: Duration, dead_after: Duration) -> Self {
        Self {
            registry,
            entries: RwLock::new(HashMap::new()),
            ping_interval,
            ping_timeout,
            dead_after,
        }
    }

    pub async fn track(&self, connection_id: ConnectionId) {
        self.entries.write().await.insert(
            connection_id,
            HeartbeatEntry {
                // failure_threshold=1: a single missed pong window is enough to
                // mark DEGRADED; dead_after is enforced separately below since
                // it depends on wall-clock since last activity, not a streak.
                breaker: CircuitBreaker::new(connection_id.to_string(), CircuitBreakerConfig {
                    failure_threshold: 1,
                    success_threshold: 1,
                    timeout: self.dead_after,
                }),
                last_activity: Instant::now(),
            },
        );
    }

    pub async fn untrack(&self, connection_id: ConnectionId) {
        self.entries.write().await.remove(&connection_id);
    }

    /// `pong` resets counters.
    pub async fn record_pong(&self, connection_id: ConnectionId) {
        if let Some(entry) = self.entries.write().await.get_mut(&connection_id) {
            entry.last_activity = Instant::now();
            entry.breaker.record_success().await;
        }
        self.registry.record_activity(connection_id).await;
        self.registry.set_state(connection_id, ConnectionState::Open).await;
    }

    /// One monitoring pass: decide who to ping, who just went DEGRADED, and
    /// who has been silent longer than `dead_after`.
    pub async fn sweep(&self) -> SweepResult {
        let now = Instant::now();
        let mut to_ping = Vec::new();
        let mut newly_degraded = Vec::new();
        let mut dead = Vec::new();

        let ids: Vec<ConnectionId> = self.entries.read().await.keys().copied().collect();
        for id in ids {
            let silence = {
                let entries = self.entries.read().await;
                let Some(entry) = entries.get(&id) else { continue };
                now.duration_since(entry.last_activity)
            };

            if silence >= self.dead_after {
                dead.push(id);
                continue;
            }

            if silence >= self.ping_timeout {
                let breaker = {
                    let entries = self.entries.read().await;
                    entries.get(&id).map(|e| e.breaker.clone())
                };
                if let Some(breaker) = breaker {
                    let was_closed = breaker.state().await == CircuitState::Closed;
                    breaker.record_failure().await;
                    if was_closed {
                        newly_degraded.push(id);
                        self.registry.set_state(id, ConnectionState::Degraded).await;
                        debug!(connection = %id, "heartbeat timeout — marked degraded");
                    }
                }
            }

            to_ping.push(id);
        }

        if !dead.is_empty() {
            info!(count = dead.len(), "heartbeat monitor found dead connections");
        }

        SweepResult { to_ping, newly_degraded, dead }
    }

    pub fn ping_interval(&self) -> Duration {
        self.ping_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn registry() -> Arc<ConnectionRegistry> {
        Arc::new(ConnectionRegistry::new(10, 120, Duration::from_secs(60)))
    }

    #[tokio::test]
    async fn pong_resets_and_keeps_open() {
        let registry = registry().await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = uuid::Uuid::new_v4();
        registry.register(id, "u1".into(), "s1".into(), tx).await.unwrap();

        let monitor = HeartbeatMonitor::new(registry.clone(), Duration::from_millis(10), Duration::from_millis(20), Duration::from_millis(1000));
        monitor.track(id).await;
        monitor.record_pong(id).await;

        let result = monitor.sweep().await;
        assert!(result.dead.is_empty());
        assert!(result.newly_degraded.is_empty());
    }

    #[tokio::test]
    async fn silence_past_timeout_marks_degraded_then_dead() {
        let registry = registry().await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = uuid::Uuid::new_v4();
        registry.register(id, "u1".into(), "s1".into(), tx).await.unwrap();

        let monitor = HeartbeatMonitor::new(registry.clone(), Duration::from_millis(1), Duration::from_millis(5), Duration::from_millis(30));
        monitor.track(id).await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        let result = monitor.sweep().await;
        assert_eq!(result.newly_degraded, vec![id]);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let result = monitor.sweep().await;
        assert_eq!(result.dead, vec![id]);
    }
}
