//! Connection Registry.
//!
//! The Registry exclusively owns connection records and sockets; every other
//! component holds a `ConnectionId` and looks up through the Registry rather
//! than holding its own reference. Per-user connection lists are
//! copy-on-write (`Arc<[ConnectionId]>` swapped under a short-held write
//! lock) over an `RwLock<HashMap<..>>` session-handle table.

use crate::envelope::Envelope;
use crate::error::GatewayError;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// A frame handed to a connection's writer task. `Envelope` goes through the
/// Message Batcher before serialization; `Ping` is a raw WebSocket control
/// frame and always bypasses batching.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Envelope(Envelope),
    Ping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Degraded,
    Closing,
    Closed,
}

/// A handle to send frames to a connection's socket task. The Registry owns
/// this; everything else only ever sees a `ConnectionId`.
pub type SocketHandle = mpsc::UnboundedSender<OutboundFrame>;

pub struct ConnectionRecord {
    pub connection_id: ConnectionId,
    pub user_id: String,
    pub session_id: String,
    pub socket: SocketHandle,
    pub connected_at: Instant,
    pub last_ping_at: Option<Instant>,
    pub last_pong_at: Option<Instant>,
    pub state: ConnectionState,
    pub subscriptions: HashSet<String>,
    pub message_count: u64,
    pub error_count: u32,
    rate_window_start: Instant,
    rate_count: u32,
}

/// Either `all`, `user:<id>`, or `room:<id>` — a named target for the
/// Broadcaster. The Registry is the source of truth for
/// pool membership; pools hold weak references keyed by `connection_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Pool {
    All,
    User(String),
    Room(String),
}

struct PerUserIndex {
    /// Copy-on-write: readers see a stable snapshot; writers swap the Arc.
    connections: Arc<[ConnectionId]>,
}

pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, ConnectionRecord>>,
    by_user: RwLock<HashMap<String, PerUserIndex>>,
    by_room: RwLock<HashMap<String, HashSet<ConnectionId>>>,
    max_per_pool: usize,
    rate_limit_requests: u32,
    rate_limit_window: Duration,
}

impl ConnectionRegistry {
    pub fn new(max_per_pool: usize, rate_limit_requests: u32, rate_limit_window: Duration) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            by_user: RwLock::new(HashMap::new()),
            by_room: RwLock::new(HashMap::new()),
            max_per_pool,
            rate_limit_requests,
            rate_limit_window,
        }
    }

    /// Register a newly-accepted connection. Rejected with `PoolFull` if the
    /// per-user pool is already at `max_per_pool`.
    pub async fn register(
        &self,
        connection_id: ConnectionId,
        user_id: String,
        session_id: String,
        socket: SocketHandle,
    ) -> Result<(), GatewayError> {
        {
            let by_user = self.by_user.read().await;
            if let Some(idx) = by_user.get(&user_id) {
                if idx.connections.len() >= self.max_per_pool {
                    return Err(GatewayError::PoolFull);
                }
            }
        }

        let now = Instant::now();
        let record = ConnectionRecord {
            connection_id,
            user_id: user_id.clone(),
            session_id,
            socket,
            connected_at: now,
            last_ping_at: None,
            last_pong_at: Some(now),
            state: ConnectionState::Open,
            subscriptions: HashSet::new(),
            message_count: 0,
            error_count: 0,
            rate_window_start: now,
            rate_count: 0,
        };

        self.connections.write().await.insert(connection_id, record);

        let mut by_user = self.by_user.write().await;
        let entry = by_user.entry(user_id).or_insert_with(|| PerUserIndex {
            connections: Arc::from([]),
        });
        let mut updated: Vec<ConnectionId> = entry.connections.iter().copied().collect();
        updated.push(connection_id);
        entry.connections = Arc::from(updated);

        Ok(())
    }

    /// Deregister a connection, dropping all subscription references before
    /// releasing the socket. Idempotent.
    pub async fn deregister(&self, connection_id: ConnectionId) {
        let record = self.connections.write().await.remove(&connection_id);
        let Some(record) = record else { return };

        let mut by_user = self.by_user.write().await;
        if let Some(idx) = by_user.get_mut(&record.user_id) {
            let updated: Vec<ConnectionId> = idx.connections.iter().copied().filter(|c| *c != connection_id).collect();
            idx.connections = Arc::from(updated);
        }
        drop(by_user);

        let mut by_room = self.by_room.write().await;
        for topic in &record.subscriptions {
            if let Some(members) = by_room.get_mut(topic) {
                members.remove(&connection_id);
            }
        }
    }

    pub async fn by_user(&self, user_id: &str) -> Vec<ConnectionId> {
        self.by_user
            .read()
            .await
            .get(user_id)
            .map(|idx| idx.connections.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn by_room(&self, room: &str) -> Vec<ConnectionId> {
        self.by_room.read().await.get(room).map(|s| s.iter().copied().collect()).unwrap_or_default()
    }

    pub async fn all_open(&self) -> Vec<ConnectionId> {
        self.connections
            .read()
            .await
            .values()
            .filter(|r| r.state == ConnectionState::Open)
            .map(|r| r.connection_id)
            .collect()
    }

    pub async fn subscribe(&self, connection_id: ConnectionId, topic: &str) {
        let mut connections = self.connections.write().await;
        if let Some(record) = connections.get_mut(&connection_id) {
            record.subscriptions.insert(topic.to_string());
        } else {
            return;
        }
        drop(connections);
        self.by_room.write().await.entry(topic.to_string()).or_default().insert(connection_id);
    }

    pub async fn unsubscribe(&self, connection_id: ConnectionId, topic: &str) {
        let mut connections = self.connections.write().await;
        if let Some(record) = connections.get_mut(&connection_id) {
            record.subscriptions.remove(topic);
        }
        drop(connections);
        if let Some(members) = self.by_room.write().await.get_mut(topic) {
            members.remove(&connection_id);
        }
    }

    pub async fn record_activity(&self, connection_id: ConnectionId) {
        if let Some(record) = self.connections.write().await.get_mut(&connection_id) {
            record.last_pong_at = Some(Instant::now());
            record.message_count += 1;
        }
    }

    /// Sliding-window rate check: `N` requests per `W` seconds per
    /// connection. On deny, callers must send a
    /// single structured `error` frame and NOT close the connection.
    pub async fn rate_check(&self, connection_id: ConnectionId) -> bool {
        let mut connections = self.connections.write().await;
        let Some(record) = connections.get_mut(&connection_id) else {
            return false;
        };
        let now = Instant::now();
        if now.duration_since(record.rate_window_start) >= self.rate_limit_window {
            record.rate_window_start = now;
            record.rate_count = 0;
        }
        record.rate_count += 1;
        record.rate_count <= self.rate_limit_requests
    }

    pub async fn set_state(&self, connection_id: ConnectionId, state: ConnectionState) {
        if let Some(record) = self.connections.write().await.get_mut(&connection_id) {
            record.state = state;
        }
    }

    pub async fn get_socket(&self, connection_id: ConnectionId) -> Option<SocketHandle> {
        self.connections.read().await.get(&connection_id).map(|r| r.socket.clone())
    }

    pub async fn get_user(&self, connection_id: ConnectionId) -> Option<String> {
        self.connections.read().await.get(&connection_id).map(|r| r.user_id.clone())
    }

    /// Resolve the owning user of a `session_id`, used by the Message
    /// Router's `session:<id>` pattern. Sessions are rare enough
    /// relative to connections that a scan is fine; if this ever shows up in
    /// a profile it gets its own index like `by_user`.
    pub async fn user_for_session(&self, session_id: &str) -> Option<String> {
        self.connections
            .read()
            .await
            .values()
            .find(|r| r.session_id == session_id)
            .map(|r| r.user_id.clone())
    }

    pub async fn record_error(&self, connection_id: ConnectionId) -> u32 {
        let mut connections = self.connections.write().await;
        if let Some(record) = connections.get_mut(&connection_id) {
            record.error_count += 1;
            record.error_count
        } else {
            0
        }
    }

    pub async fn reset_errors(&self, connection_id: ConnectionId) {
        if let Some(record) = self.connections.write().await.get_mut(&connection_id) {
            record.error_count = 0;
        }
    }

    /// Snapshot of per-pool connection counts, logged periodically at
    /// `debug` as the ambient observability surface.
    pub async fn stats(&self) -> RegistryStats {
        let by_user = self.by_user.read().await;
        RegistryStats {
            total_connections: self.connections.read().await.len(),
            total_users: by_user.len(),
            total_rooms: self.by_room.read().await.len(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RegistryStats {
    pub total_connections: usize,
    pub total_users: usize,
    pub total_rooms: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socket() -> SocketHandle {
        let (tx, _rx) = mpsc::unbounded_channel();
        tx
    }

    #[tokio::test]
    async fn register_and_lookup_by_user() {
        let registry = ConnectionRegistry::new(10, 120, Duration::from_secs(60));
        let id = Uuid::new_v4();
        registry.register(id, "user-1".into(), "sess-1".into(), socket()).await.unwrap();

        assert_eq!(registry.by_user("user-1").await, vec![id]);
        assert_eq!(registry.all_open().await, vec![id]);
    }

    #[tokio::test]
    async fn deregister_is_idempotent_and_drops_subscriptions() {
        let registry = ConnectionRegistry::new(10, 120, Duration::from_secs(60));
        let id = Uuid::new_v4();
        registry.register(id, "user-1".into(), "sess-1".into(), socket()).await.unwrap();
        registry.subscribe(id, "room:1").await;
        assert_eq!(registry.by_room("room:1").await, vec![id]);

        registry.deregister(id).await;
        assert!(registry.by_room("room:1").await.is_empty());
        assert!(registry.by_user("user-1").await.is_empty());

        // Second deregister is a no-op, not an error.
        registry.deregister(id).await;
    }

    #[tokio::test]
    async fn registration_rejected_when_pool_full() {
        let registry = ConnectionRegistry::new(1, 120, Duration::from_secs(60));
        registry.register(Uuid::new_v4(), "user-1".into(), "s1".into(), socket()).await.unwrap();

        let err = registry
            .register(Uuid::new_v4(), "user-1".into(), "s2".into(), socket())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::PoolFull));
    }

    #[tokio::test]
    async fn rate_check_denies_after_window_exceeded() {
        let registry = ConnectionRegistry::new(10, 2, Duration::from_secs(60));
        let id = Uuid::new_v4();
        registry.register(id, "user-1".into(), "s1".into(), socket()).await.unwrap();

        assert!(registry.rate_check(id).await);
        assert!(registry.rate_check(id).await);
        assert!(!registry.rate_check(id).await);
    }

    #[tokio::test]
    async fn rate_limit_is_per_connection_not_per_user() {
        // Sustained load on one connection must not affect a sibling
        // connection belonging to the same user.
        let registry = ConnectionRegistry::new(10, 1, Duration::from_secs(60));
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        registry.register(a, "user-1".into(), "s1".into(), socket()).await.unwrap();
        registry.register(b, "user-1".into(), "s2".into(), socket()).await.unwrap();

        assert!(registry.rate_check(a).await);
        assert!(!registry.rate_check(a).await);
        // b is unaffected by a's exhausted window.
        assert!(registry.rate_check(b).await);
    }
}
