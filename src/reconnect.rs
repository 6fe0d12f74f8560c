//! Reconnection Handler.
//!
//! Per-session state machine: `Connected -> Disconnected (with snapshot) ->
//! Reconnecting -> Restored | Failed`. Backoff between attempts is
//! client-side; this module only counts attempts and enforces
//! `min_reconnect_interval` server-side.

use crate::auth::Claims;
use crate::broadcast::Broadcaster;
use crate::buffer::MessageBuffer;
use crate::error::GatewayError;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::state_store::StateStore;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Disconnected,
    Reconnecting,
    Restored,
    Failed,
}

struct SessionRecord {
    user_id: String,
    state: SessionState,
    disconnected_at: Instant,
    attempts: u32,
    last_attempt_at: Option<Instant>,
}

/// Frame the caller should send back to the client as a result of a
/// reconnect attempt.
#[derive(Debug)]
pub enum ReconnectOutcome {
    ResyncRequired,
    Resync { snapshot: Value, resync_reason: &'static str },
    RateLimited,
    Exhausted,
}

pub struct ReconnectionHandler {
    sessions: RwLock<HashMap<String, SessionRecord>>,
    state_store: Arc<StateStore>,
    buffer: Arc<MessageBuffer>,
    broadcaster: Arc<Broadcaster>,
    max_attempts: u32,
    min_interval: Duration,
}

impl ReconnectionHandler {
    pub fn new(
        state_store: Arc<StateStore>,
        buffer: Arc<MessageBuffer>,
        broadcaster: Arc<Broadcaster>,
        max_attempts: u32,
        min_interval: Duration,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            state_store,
            buffer,
            broadcaster,
            max_attempts,
            min_interval,
        }
    }

    pub async fn mark_disconnected(&self, session_id: &str, user_id: &str) {
        self.sessions.write().await.insert(
            session_id.to_string(),
            SessionRecord {
                user_id: user_id.to_string(),
                state: SessionState::Disconnected,
                disconnected_at: Instant::now(),
                attempts: 0,
                last_attempt_at: None,
            },
        );
    }

    pub async fn mark_connected(&self, session_id: &str, user_id: &str) {
        self.sessions.write().await.insert(
            session_id.to_string(),
            SessionRecord {
                user_id: user_id.to_string(),
                state: SessionState::Connected,
                disconnected_at: Instant::now(),
                attempts: 0,
                last_attempt_at: None,
            },
        );
    }

    /// Validate ownership, load the disconnection snapshot, and build the
    /// resync frame. Does not yet drain the buffer —
    /// callers do that with [`Self::drain_buffered`] once the new socket is
    /// registered.
    pub async fn attempt_reconnect(&self, session_id: &str, claims: &Claims) -> Result<ReconnectOutcome, GatewayError> {
        let mut sessions = self.sessions.write().await;
        let Some(record) = sessions.get_mut(session_id) else {
            return Ok(ReconnectOutcome::ResyncRequired);
        };

        if record.user_id != claims.user_id() {
            return Err(GatewayError::AuthInvalid);
        }

        let now = Instant::now();
        if let Some(last) = record.last_attempt_at {
            if now.duration_since(last) < self.min_interval {
                return Ok(ReconnectOutcome::RateLimited);
            }
        }
        record.last_attempt_at = Some(now);
        record.attempts += 1;

        if record.attempts >= self.max_attempts {
            record.state = SessionState::Failed;
            return Ok(ReconnectOutcome::Exhausted);
        }

        record.state = SessionState::Reconnecting;
        drop(sessions);

        let snapshot = self.state_store.load_disconnection_state(session_id).await;
        match snapshot {
            Some(data) => Ok(ReconnectOutcome::Resync { snapshot: data, resync_reason: "reconnect" }),
            None => Ok(ReconnectOutcome::ResyncRequired),
        }
    }

    /// Drain buffered messages for `user_id` to the newly-registered
    /// connection via the Broadcaster, then mark the session `Restored`.
    ///
    /// Each message is replayed with [`retry_with_backoff`] — a socket that
    /// just finished reconnecting is the likeliest place for a send to fail
    /// transiently — before falling back to `nack`, which hands the message
    /// to the buffer's own longer-lived retry schedule.
    pub async fn drain_buffered(&self, session_id: &str, user_id: &str) -> Result<(), GatewayError> {
        let retry_config = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            multiplier: 2.0,
        };

        loop {
            let batch = self.buffer.take_batch(user_id, 50).await;
            if batch.is_empty() {
                break;
            }
            for envelope in batch {
                let id = envelope.message_id;
                let result = retry_with_backoff(&retry_config, || async {
                    let r = self.broadcaster.send_user(user_id, envelope.clone()).await?;
                    if r.failed == 0 {
                        Ok(r)
                    } else {
                        Err(GatewayError::SlowClient)
                    }
                })
                .await;

                match result {
                    Ok(_) => self.buffer.ack(user_id, &[id]).await,
                    Err(_) => self.buffer.nack(user_id, &[id]).await,
                }
            }
        }

        if let Some(record) = self.sessions.write().await.get_mut(session_id) {
            record.state = SessionState::Restored;
            record.attempts = 0;
        }
        self.state_store.clear_disconnection_state(session_id).await;
        Ok(())
    }

    pub async fn state(&self, session_id: &str) -> Option<SessionState> {
        self.sessions.read().await.get(session_id).map(|r| r.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferConfig;
    use crate::buffer::OverflowPolicy;
    use crate::registry::ConnectionRegistry;

    fn claims(user_id: &str) -> Claims {
        Claims { sub: user_id.to_string(), exp: 0, extra: Default::default() }
    }

    async fn handler() -> ReconnectionHandler {
        let state_store = Arc::new(StateStore::new(Duration::from_secs(3600), Duration::from_secs(3600)));
        let buffer = Arc::new(MessageBuffer::new(BufferConfig::default(), OverflowPolicy::DropOldest));
        let registry = Arc::new(ConnectionRegistry::new(10, 120, Duration::from_secs(60)));
        let broadcaster = Arc::new(Broadcaster::new(registry, buffer.clone(), Duration::from_millis(200), 50, Duration::from_millis(100), 5));
        ReconnectionHandler::new(state_store, buffer, broadcaster, 5, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn unknown_session_requires_fresh_resync() {
        let handler = handler().await;
        let outcome = handler.attempt_reconnect("missing", &claims("u1")).await.unwrap();
        assert!(matches!(outcome, ReconnectOutcome::ResyncRequired));
    }

    #[tokio::test]
    async fn mismatched_owner_is_rejected() {
        let handler = handler().await;
        handler.mark_disconnected("s1", "owner").await;
        let err = handler.attempt_reconnect("s1", &claims("someone-else")).await.unwrap_err();
        assert!(matches!(err, GatewayError::AuthInvalid));
    }

    #[tokio::test]
    async fn rapid_reattempt_is_rate_limited() {
        let handler = handler().await;
        handler.mark_disconnected("s1", "owner").await;
        let _ = handler.attempt_reconnect("s1", &claims("owner")).await.unwrap();
        let second = handler.attempt_reconnect("s1", &claims("owner")).await.unwrap();
        assert!(matches!(second, ReconnectOutcome::RateLimited));
    }

    #[tokio::test]
    async fn exhausting_attempts_fails_the_session() {
        let handler = handler().await;
        handler.mark_disconnected("s1", "owner").await;
        for _ in 0..4 {
            let _ = handler.attempt_reconnect("s1", &claims("owner")).await.unwrap();
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
        let outcome = handler.attempt_reconnect("s1", &claims("owner")).await.unwrap();
        assert!(matches!(outcome, ReconnectOutcome::Exhausted));
        assert_eq!(handler.state("s1").await, Some(SessionState::Failed));
    }
}
