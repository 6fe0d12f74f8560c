// SPDX-License-Identifier: MIT
//! Circuit breaker, reused here as the connection-health bookkeeping
//! primitive shared by the Heartbeat Monitor and the Broadcaster's
//! slow-client detection rather than two parallel ad hoc counters.
//!
//! A failed pong or a send timeout is a breaker failure; a pong received
//! while degraded, or a successful send, is a breaker success. `Open`
//! corresponds to a connection unhealthy enough to force-close.
//!
//! ```text
//! Closed ──(failure_threshold failures)──► Open
//!   ▲                                        │
//!   └──(success_threshold successes)──── HalfOpen ◄─(timeout elapsed)──┘
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens. Default: 5.
    pub failure_threshold: u32,
    /// Consecutive probe successes before a HalfOpen circuit closes. Default: 2.
    pub success_threshold: u32,
    /// Time an Open circuit waits before admitting one probe call. Default: 30s.
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct Counters {
    state: CircuitState,
    failures: u32,
    probe_successes: u32,
    opened_at: Option<Instant>,
}

impl Counters {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            probe_successes: 0,
            opened_at: None,
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
    }

    fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.failures = 0;
        self.probe_successes = 0;
        self.opened_at = None;
    }
}

/// Tracks whether a connection (or any resource keyed by name) is healthy
/// enough to keep using. Cheaply cloneable: clones share state via `Arc`.
#[derive(Clone)]
pub struct CircuitBreaker {
    counters: Arc<RwLock<Counters>>,
    config: Arc<CircuitBreakerConfig>,
    name: Arc<str>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            counters: Arc::new(RwLock::new(Counters::new())),
            config: Arc::new(config),
            name: Arc::from(name.into().as_str()),
        }
    }

    /// Whether a call should be attempted right now.
    ///
    /// `Closed`/`HalfOpen` always admit. `Open` admits only after `timeout`
    /// has elapsed since the last failure, at which point it upgrades to
    /// `HalfOpen` for a single probe.
    pub async fn is_allowed(&self) -> bool {
        {
            let c = self.counters.read().await;
            match c.state {
                CircuitState::Closed | CircuitState::HalfOpen => return true,
                CircuitState::Open => {
                    let elapsed = c.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
                    if elapsed < self.config.timeout {
                        return false;
                    }
                }
            }
        }

        let mut c = self.counters.write().await;
        if c.state == CircuitState::Open {
            let elapsed = c.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
            if elapsed >= self.config.timeout {
                info!(breaker = %self.name, "circuit → half_open (probe)");
                c.state = CircuitState::HalfOpen;
                c.probe_successes = 0;
            }
        }
        c.state != CircuitState::Open
    }

    pub async fn record_success(&self) {
        let mut c = self.counters.write().await;
        match c.state {
            CircuitState::HalfOpen => {
                c.probe_successes += 1;
                if c.probe_successes >= self.config.success_threshold {
                    info!(breaker = %self.name, "circuit → closed (recovered)");
                    c.reset();
                }
            }
            CircuitState::Closed => c.failures = 0,
            CircuitState::Open => {}
        }
    }

    pub async fn record_failure(&self) {
        let mut c = self.counters.write().await;
        match c.state {
            CircuitState::Closed => {
                c.failures += 1;
                if c.failures >= self.config.failure_threshold {
                    warn!(breaker = %self.name, failures = c.failures, "circuit → open");
                    c.open();
                }
            }
            CircuitState::HalfOpen => {
                warn!(breaker = %self.name, "circuit → open (probe failed)");
                c.open();
            }
            CircuitState::Open => c.opened_at = Some(Instant::now()),
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.counters.read().await.state.clone()
    }

    pub async fn failure_count(&self) -> u32 {
        self.counters.read().await.failures
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Force the circuit closed, e.g. after the connection it tracks has
    /// been replaced by a fresh reconnection.
    pub async fn force_close(&self) {
        let mut c = self.counters.write().await;
        if c.state != CircuitState::Closed {
            info!(breaker = %self.name, "circuit force-closed");
            c.reset();
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn starts_closed() {
        let cb = CircuitBreaker::new("test", fast_config());
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert!(cb.is_allowed().await);
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let cb = CircuitBreaker::new("test", fast_config());
        cb.record_failure().await;
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
        assert!(!cb.is_allowed().await);
    }

    #[tokio::test]
    async fn transitions_to_half_open_after_timeout() {
        let cb = CircuitBreaker::new("test", fast_config());
        for _ in 0..3 {
            cb.record_failure().await;
        }
        assert_eq!(cb.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(cb.is_allowed().await);
        assert_eq!(cb.state().await, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn closes_after_success_threshold_in_half_open() {
        let cb = CircuitBreaker::new("test", fast_config());
        for _ in 0..3 {
            cb.record_failure().await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cb.is_allowed().await);
        assert_eq!(cb.state().await, CircuitState::HalfOpen);

        cb.record_success().await;
        assert_eq!(cb.state().await, CircuitState::HalfOpen);
        cb.record_success().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn reopens_on_probe_failure() {
        let cb = CircuitBreaker::new("test", fast_config());
        for _ in 0..3 {
            cb.record_failure().await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cb.is_allowed().await);
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn success_resets_failure_count_in_closed() {
        let cb = CircuitBreaker::new("test", fast_config());
        cb.record_failure().await;
        cb.record_failure().await;
        cb.record_success().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert_eq!(cb.failure_count().await, 0);
    }

    #[tokio::test]
    async fn force_close_resets_open_circuit() {
        let cb = CircuitBreaker::new("test", fast_config());
        for _ in 0..3 {
            cb.record_failure().await;
        }
        assert_eq!(cb.state().await, CircuitState::Open);
        cb.force_close().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert!(cb.is_allowed().await);
    }
}
