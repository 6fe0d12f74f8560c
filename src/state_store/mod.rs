//! State Store.
//!
//! In-process, TTL-bound snapshot store keyed by `session_id`, backed by an
//! `RwLock<HashMap<String, Snapshot>>` session table. State version is the
//! *only* concurrency primitive visible
//! to clients: every mutating call takes `client_version` and
//! fails closed with `ConflictVersion` rather than merging on mismatch.
//! Internal writes are serialized per session by holding the write lock for
//! the entire read-modify-write, satisfying the single-writer-per-session
//! requirement without a separate per-session mutex table.

use crate::error::GatewayError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u64,
    pub agent_state: Value,
    pub conversation: Vec<Value>,
    pub ui_preferences: Value,
    pub threads: Value,
}

impl StateSnapshot {
    fn new() -> Self {
        Self {
            version: 0,
            agent_state: Value::Object(Default::default()),
            conversation: Vec::new(),
            ui_preferences: Value::Object(Default::default()),
            threads: Value::Object(Default::default()),
        }
    }
}

struct Entry {
    snapshot: StateSnapshot,
    expires_at: Instant,
}

struct DisconnectionEntry {
    data: Value,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    AgentProgress,
    ConversationMessage,
    UiPreference,
    ThreadUpdate,
}

pub enum ApplyOutcome {
    Applied { new_version: u64 },
    Conflict { server_version: u64 },
}

pub struct StateStore {
    sessions: RwLock<HashMap<String, Entry>>,
    disconnections: RwLock<HashMap<String, DisconnectionEntry>>,
    snapshot_ttl: Duration,
    disconnection_ttl: Duration,
}

impl StateStore {
    pub fn new(snapshot_ttl: Duration, disconnection_ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            disconnections: RwLock::new(HashMap::new()),
            snapshot_ttl,
            disconnection_ttl,
        }
    }

    /// Version-monotonic write: overwrites the full snapshot and resets its
    /// TTL.
    pub async fn save_connection_state(&self, session_id: &str, mut snapshot: StateSnapshot) {
        let mut sessions = self.sessions.write().await;
        let next_version = sessions.get(session_id).map(|e| e.snapshot.version + 1).unwrap_or(1);
        snapshot.version = next_version;
        sessions.insert(
            session_id.to_string(),
            Entry { snapshot, expires_at: Instant::now() + self.snapshot_ttl },
        );
    }

    /// The most recent non-expired snapshot, or `None` if missing/expired.
    pub async fn load(&self, session_id: &str) -> Option<StateSnapshot> {
        let sessions = self.sessions.read().await;
        let entry = sessions.get(session_id)?;
        if entry.expires_at > Instant::now() {
            Some(entry.snapshot.clone())
        } else {
            None
        }
    }

    /// Apply a typed partial update. Held under a single write-lock
    /// acquisition for the whole read-modify-write, which is what makes
    /// internal mutation single-writer-per-session without a
    /// separate per-session mutex.
    pub async fn apply_update(
        &self,
        session_id: &str,
        update_type: UpdateType,
        data: Value,
        client_version: u64,
    ) -> Result<ApplyOutcome, GatewayError> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Entry { snapshot: StateSnapshot::new(), expires_at: Instant::now() + self.snapshot_ttl });

        if entry.expires_at <= Instant::now() {
            entry.snapshot = StateSnapshot::new();
        }

        if client_version != entry.snapshot.version {
            return Ok(ApplyOutcome::Conflict { server_version: entry.snapshot.version });
        }

        match update_type {
            UpdateType::AgentProgress => merge_object(&mut entry.snapshot.agent_state, &data),
            UpdateType::ConversationMessage => entry.snapshot.conversation.push(data),
            UpdateType::UiPreference => merge_object(&mut entry.snapshot.ui_preferences, &data),
            UpdateType::ThreadUpdate => merge_object(&mut entry.snapshot.threads, &data),
        }

        entry.snapshot.version += 1;
        entry.expires_at = Instant::now() + self.snapshot_ttl;
        Ok(ApplyOutcome::Applied { new_version: entry.snapshot.version })
    }

    /// Generalized partial update addressing nested keys by dotted path,
    /// e.g. `"agent_state.tool_calls.0.status"`. Replace-at-leaf
    /// semantics: the final path segment's value is replaced wholesale,
    /// creating intermediate objects as needed, matching
    /// `state_synchronization_manager`'s behavior in the system this module
    /// was distilled from.
    pub async fn apply_dotted_path(
        &self,
        session_id: &str,
        updates: &HashMap<String, Value>,
        client_version: u64,
    ) -> Result<ApplyOutcome, GatewayError> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Entry { snapshot: StateSnapshot::new(), expires_at: Instant::now() + self.snapshot_ttl });

        if entry.expires_at <= Instant::now() {
            entry.snapshot = StateSnapshot::new();
        }

        if client_version != entry.snapshot.version {
            return Ok(ApplyOutcome::Conflict { server_version: entry.snapshot.version });
        }

        let mut root = serde_json::to_value(&entry.snapshot).unwrap_or(Value::Null);
        for (path, value) in updates {
            set_dotted_path(&mut root, path, value.clone());
        }
        if let Ok(mut restored) = serde_json::from_value::<StateSnapshot>(root) {
            restored.version = entry.snapshot.version + 1;
            entry.snapshot = restored;
        }

        entry.expires_at = Instant::now() + self.snapshot_ttl;
        Ok(ApplyOutcome::Applied { new_version: entry.snapshot.version })
    }

    /// Separate TTL-bound snapshot used only for reconnection replay —
    /// distinct from the live session snapshot so a
    /// disconnection doesn't race with new `apply_update` calls from other
    /// connections of the same user.
    pub async fn save_disconnection_state(&self, session_id: &str, data: Value) {
        self.disconnections.write().await.insert(
            session_id.to_string(),
            DisconnectionEntry { data, expires_at: Instant::now() + self.disconnection_ttl },
        );
    }

    pub async fn load_disconnection_state(&self, session_id: &str) -> Option<Value> {
        let map = self.disconnections.read().await;
        let entry = map.get(session_id)?;
        if entry.expires_at > Instant::now() {
            Some(entry.data.clone())
        } else {
            None
        }
    }

    pub async fn clear_disconnection_state(&self, session_id: &str) {
        self.disconnections.write().await.remove(session_id);
    }
}

fn merge_object(target: &mut Value, patch: &Value) {
    if let (Value::Object(target), Value::Object(patch)) = (target, patch) {
        for (k, v) in patch {
            target.insert(k.clone(), v.clone());
        }
    }
}

fn set_dotted_path(root: &mut Value, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let mut cursor = root;
    for (i, segment) in segments.iter().enumerate() {
        let is_last = i == segments.len() - 1;
        if !cursor.is_object() {
            *cursor = Value::Object(Default::default());
        }
        let obj = cursor.as_object_mut().unwrap();
        if is_last {
            obj.insert(segment.to_string(), value);
            return;
        }
        cursor = obj.entry(segment.to_string()).or_insert_with(|| Value::Object(Default::default()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> StateStore {
        StateStore::new(Duration::from_secs(3600), Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn apply_update_requires_matching_version() {
        let store = store();
        let result = store
            .apply_update("s1", UpdateType::AgentProgress, serde_json::json!({"step": 1}), 0)
            .await
            .unwrap();
        assert!(matches!(result, ApplyOutcome::Applied { new_version: 1 }));

        let stale = store
            .apply_update("s1", UpdateType::AgentProgress, serde_json::json!({"step": 2}), 0)
            .await
            .unwrap();
        assert!(matches!(stale, ApplyOutcome::Conflict { server_version: 1 }));
    }

    #[tokio::test]
    async fn conversation_message_appends_not_merges() {
        let store = store();
        store
            .apply_update("s1", UpdateType::ConversationMessage, serde_json::json!({"text": "hi"}), 0)
            .await
            .unwrap();
        store
            .apply_update("s1", UpdateType::ConversationMessage, serde_json::json!({"text": "there"}), 1)
            .await
            .unwrap();

        let snapshot = store.load("s1").await.unwrap();
        assert_eq!(snapshot.conversation.len(), 2);
        assert_eq!(snapshot.version, 2);
    }

    #[tokio::test]
    async fn dotted_path_creates_intermediate_objects() {
        let store = store();
        let mut updates = HashMap::new();
        updates.insert("agent_state.tool_calls.status".to_string(), serde_json::json!("running"));
        let result = store.apply_dotted_path("s1", &updates, 0).await.unwrap();
        assert!(matches!(result, ApplyOutcome::Applied { new_version: 1 }));

        let snapshot = store.load("s1").await.unwrap();
        assert_eq!(snapshot.agent_state["tool_calls"]["status"], serde_json::json!("running"));
    }

    #[tokio::test]
    async fn disconnection_state_is_independent_of_live_snapshot() {
        let store = store();
        store.save_disconnection_state("s1", serde_json::json!({"pending": true})).await;
        store
            .apply_update("s1", UpdateType::AgentProgress, serde_json::json!({"step": 1}), 0)
            .await
            .unwrap();

        assert!(store.load_disconnection_state("s1").await.is_some());
        store.clear_disconnection_state("s1").await;
        assert!(store.load_disconnection_state("s1").await.is_none());
    }
}
