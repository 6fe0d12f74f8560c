//! Message envelope, priority, and the closed message-type set.
//!
//! `MessageType` is a discriminated union with an exhaustive `match` at every
//! use site. A client/server mismatch here is a release blocker, not a
//! runtime concern this crate can paper over; keeping the enum closed is
//! what makes mismatches a compile error instead of a silently-dropped
//! frame.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Ping,
    Pong,
    ConnectionEstablished,
    Error,
    UserMessage,
    ChatMessage,
    StartAgent,
    StopAgent,
    AgentStarted,
    AgentThinking,
    AgentUpdate,
    AgentCompleted,
    ToolExecuting,
    ToolCompleted,
    CreateThread,
    SwitchThread,
    DeleteThread,
    ThreadHistory,
    StreamChunk,
    StreamComplete,
    StateSnapshot,
    StateUpdated,
    StateResync,
    VersionConflict,
}

impl MessageType {
    /// Types considered critical regardless of the envelope's `priority` —
    /// the configured set of agent lifecycle events.
    pub const DEFAULT_CRITICAL_KINDS: &'static [MessageType] = &[
        MessageType::AgentStarted,
        MessageType::AgentThinking,
        MessageType::ToolExecuting,
        MessageType::ToolCompleted,
        MessageType::AgentCompleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::ConnectionEstablished => "connection_established",
            MessageType::Error => "error",
            MessageType::UserMessage => "user_message",
            MessageType::ChatMessage => "chat_message",
            MessageType::StartAgent => "start_agent",
            MessageType::StopAgent => "stop_agent",
            MessageType::AgentStarted => "agent_started",
            MessageType::AgentThinking => "agent_thinking",
            MessageType::AgentUpdate => "agent_update",
            MessageType::AgentCompleted => "agent_completed",
            MessageType::ToolExecuting => "tool_executing",
            MessageType::ToolCompleted => "tool_completed",
            MessageType::CreateThread => "create_thread",
            MessageType::SwitchThread => "switch_thread",
            MessageType::DeleteThread => "delete_thread",
            MessageType::ThreadHistory => "thread_history",
            MessageType::StreamChunk => "stream_chunk",
            MessageType::StreamComplete => "stream_complete",
            MessageType::StateSnapshot => "state_snapshot",
            MessageType::StateUpdated => "state_updated",
            MessageType::StateResync => "state_resync",
            MessageType::VersionConflict => "version_conflict",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered `{LOW < NORMAL < HIGH < CRITICAL}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Wire-format envelope. `type`/`payload`/`timestamp` are
/// required; `sender`/`correlation_id` are optional opaque identifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEnvelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub payload: serde_json::Value,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// Internal envelope used once a `WireEnvelope` has been validated and
/// normalized: `size_bytes` is computed at enqueue and cached,
/// and `critical_kind` has been resolved against the configured set.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub message_id: uuid::Uuid,
    pub kind: MessageType,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub critical_kind: bool,
    pub created_at: std::time::Instant,
    pub size_bytes: usize,
    pub sender: Option<String>,
    pub correlation_id: Option<String>,
}

impl Envelope {
    /// Build an `Envelope` from a type/payload pair, computing `size_bytes`
    /// and resolving `critical_kind` against `critical_kinds`.
    pub fn new(kind: MessageType, payload: serde_json::Value, priority: Priority, critical_kinds: &[MessageType]) -> Self {
        let size_bytes = serde_json::to_vec(&payload).map(|v| v.len()).unwrap_or(0);
        let critical_kind = priority == Priority::Critical || critical_kinds.contains(&kind);
        Self {
            message_id: uuid::Uuid::new_v4(),
            kind,
            payload,
            priority,
            critical_kind,
            created_at: std::time::Instant::now(),
            size_bytes,
            sender: None,
            correlation_id: None,
        }
    }

    pub fn to_wire(&self) -> WireEnvelope {
        WireEnvelope {
            kind: self.kind,
            payload: self.payload.clone(),
            timestamp: crate::codec::format_timestamp_now(),
            sender: self.sender.clone(),
            correlation_id: self.correlation_id.clone(),
        }
    }
}
