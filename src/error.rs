//! Error kinds shared across every component.
//!
//! Client-addressable kinds are turned into `error` frames while the
//! connection stays open; connection-fatal kinds close the socket with the
//! matching close code; `Internal` is logged with a correlation id and
//! surfaced to the client as a generic message.

use serde::Serialize;
use serde_json::Value;

/// Severity carried in the `error` frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("missing, expired, or invalid signature")]
    AuthInvalid,
    #[error("malformed authentication material")]
    AuthMalformed,
    #[error("secret resolver unavailable: {0}")]
    AuthUnavailable(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("overflow: {0}")]
    Overflow(String),
    #[error("rate limit exceeded")]
    RateLimit,
    #[error("pool is full")]
    PoolFull,
    #[error("slow client")]
    SlowClient,
    #[error("message exhausted retries and was dead-lettered: {0}")]
    DeadLetter(String),
    #[error("version conflict: client={client_version} server={server_version}")]
    ConflictVersion { client_version: u64, server_version: u64 },
    #[error("reconnection attempts exhausted")]
    ReconnectExhausted,
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Machine-readable `error_code` string used in the `error` frame.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::AuthInvalid => "AUTH_INVALID",
            GatewayError::AuthMalformed => "AUTH_MALFORMED",
            GatewayError::AuthUnavailable(_) => "AUTH_UNAVAILABLE",
            GatewayError::Validation(_) => "VALIDATION",
            GatewayError::Overflow(_) => "OVERFLOW",
            GatewayError::RateLimit => "RATE_LIMIT",
            GatewayError::PoolFull => "POOL_FULL",
            GatewayError::SlowClient => "SLOW_CLIENT",
            GatewayError::DeadLetter(_) => "DEAD_LETTER",
            GatewayError::ConflictVersion { .. } => "CONFLICT_VERSION",
            GatewayError::ReconnectExhausted => "RECONNECT_EXHAUSTED",
            GatewayError::Internal(_) => "INTERNAL",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            GatewayError::Validation(_) | GatewayError::RateLimit | GatewayError::ConflictVersion { .. } => {
                Severity::Medium
            }
            GatewayError::Overflow(_) | GatewayError::SlowClient | GatewayError::DeadLetter(_) => Severity::High,
            GatewayError::AuthInvalid
            | GatewayError::AuthMalformed
            | GatewayError::AuthUnavailable(_)
            | GatewayError::PoolFull
            | GatewayError::ReconnectExhausted => Severity::Critical,
            GatewayError::Internal(_) => Severity::Low,
        }
    }

    /// Whether this error kind requires closing the connection.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            GatewayError::AuthInvalid | GatewayError::PoolFull | GatewayError::SlowClient
        )
    }

    /// WebSocket close code to use when `is_connection_fatal()`.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            GatewayError::AuthInvalid => Some(1008),
            GatewayError::PoolFull => Some(1011),
            GatewayError::SlowClient => Some(1011),
            GatewayError::ReconnectExhausted => Some(4003),
            _ => None,
        }
    }

    /// Render the `error` frame payload for this error.
    pub fn to_frame(&self, details: Value) -> ErrorFrame {
        ErrorFrame {
            error_code: self.code(),
            error_message: self.to_string(),
            details,
            severity: self.severity(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorFrame {
    pub error_code: &'static str,
    pub error_message: String,
    pub details: Value,
    pub severity: Severity,
}

pub type Result<T> = std::result::Result<T, GatewayError>;
