//! Message Router.
//!
//! Single ingress for server-originated messages published by an internal
//! pub/sub, dispatched onto the Broadcaster by channel-name pattern.
//! Built directly on the Broadcaster's three dispatch modes —
//! this module is pure pattern matching and session resolution, no
//! independent delivery logic of its own.

use crate::broadcast::{Broadcaster, BroadcastResult};
use crate::envelope::Envelope;
use crate::registry::ConnectionRegistry;
use std::sync::Arc;
use tracing::debug;

pub struct MessageRouter {
    broadcaster: Arc<Broadcaster>,
    registry: Arc<ConnectionRegistry>,
}

pub enum RouteOutcome {
    Dispatched(BroadcastResult),
    UnknownChannel,
}

impl MessageRouter {
    pub fn new(broadcaster: Arc<Broadcaster>, registry: Arc<ConnectionRegistry>) -> Self {
        Self { broadcaster, registry }
    }

    /// Route `envelope` onto the channel named by `channel`.
    /// Unknown patterns are an observability event, not an error.
    pub async fn route(&self, channel: &str, envelope: Envelope) -> RouteOutcome {
        if channel == "broadcast:all" {
            return RouteOutcome::Dispatched(self.broadcaster.broadcast_all(&envelope).await);
        }

        if let Some(topic) = channel.strip_prefix("broadcast:") {
            return RouteOutcome::Dispatched(self.broadcaster.broadcast_subscription(topic, &envelope).await);
        }

        if let Some(user_id) = channel.strip_prefix("user:") {
            return match self.broadcaster.send_user(user_id, envelope).await {
                Ok(result) => RouteOutcome::Dispatched(result),
                Err(_) => RouteOutcome::UnknownChannel,
            };
        }

        if let Some(session_id) = channel.strip_prefix("session:") {
            return match self.registry.user_for_session(session_id).await {
                Some(user_id) => match self.broadcaster.send_user(&user_id, envelope).await {
                    Ok(result) => RouteOutcome::Dispatched(result),
                    Err(_) => RouteOutcome::UnknownChannel,
                },
                None => {
                    debug!(channel, "session has no known owning user — dropping");
                    RouteOutcome::UnknownChannel
                }
            };
        }

        debug!(channel, "unrecognized routing channel");
        RouteOutcome::UnknownChannel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{MessageBuffer, OverflowPolicy};
    use crate::config::BufferConfig;
    use crate::envelope::{MessageType, Priority};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn env() -> Envelope {
        Envelope::new(MessageType::ChatMessage, serde_json::json!({}), Priority::Normal, &[])
    }

    async fn router() -> (Arc<ConnectionRegistry>, MessageRouter) {
        let registry = Arc::new(ConnectionRegistry::new(10, 120, Duration::from_secs(60)));
        let buffer = Arc::new(MessageBuffer::new(BufferConfig::default(), OverflowPolicy::DropOldest));
        let broadcaster = Arc::new(Broadcaster::new(registry.clone(), buffer, Duration::from_millis(200), 50, Duration::from_millis(100), 5));
        (registry.clone(), MessageRouter::new(broadcaster, registry))
    }

    #[tokio::test]
    async fn broadcast_all_reaches_registered_connections() {
        let (registry, router) = router().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(uuid::Uuid::new_v4(), "u1".into(), "s1".into(), tx).await.unwrap();

        match router.route("broadcast:all", env()).await {
            RouteOutcome::Dispatched(result) => assert_eq!(result.successful, 1),
            RouteOutcome::UnknownChannel => panic!("expected dispatch"),
        }
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn session_channel_resolves_owning_user() {
        let (registry, router) = router().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(uuid::Uuid::new_v4(), "u1".into(), "sess-42".into(), tx).await.unwrap();

        match router.route("session:sess-42", env()).await {
            RouteOutcome::Dispatched(_) => {}
            RouteOutcome::UnknownChannel => panic!("expected dispatch"),
        }
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn unknown_channel_is_not_an_error() {
        let (_registry, router) = router().await;
        match router.route("nonsense:channel", env()).await {
            RouteOutcome::UnknownChannel => {}
            RouteOutcome::Dispatched(_) => panic!("should not dispatch"),
        }
    }
}
