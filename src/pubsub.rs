//! Internal pub/sub bus.
//!
//! The Message Router's single ingress point for server-originated
//! messages: a `tokio::sync::broadcast` channel of `(channel, envelope)`
//! pairs, so internal publishers (agent runners, admin tooling) don't need
//! to know which connections are subscribed.

use crate::envelope::Envelope;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct PublishedMessage {
    pub channel: String,
    pub envelope: Envelope,
}

/// Fan-out bus: any number of subscribers (in practice, one Message Router
/// per process) receive every published message and decide independently
/// whether it matches a channel pattern they care about.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PublishedMessage>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Publish `envelope` on `channel`. Ignored if there are no subscribers
    /// — the bus has no durability guarantee, unlike the Per-User Buffer.
    pub fn publish(&self, channel: impl Into<String>, envelope: Envelope) {
        let _ = self.tx.send(PublishedMessage { channel: channel.into(), envelope });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PublishedMessage> {
        self.tx.subscribe()
    }
}
