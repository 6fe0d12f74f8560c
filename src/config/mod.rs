//! Layered configuration: CLI/env > TOML file > built-in defaults.
//!
//! Every tunable is a field here, never a magic number at the call site.
//! Production tuning of these defaults is the operator's responsibility.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_PORT: u16 = 4300;

// ─── TOML config file ─────────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
struct TomlConfig {
    port: Option<u16>,
    log: Option<String>,
    auth: Option<AuthConfig>,
    buffer: Option<BufferConfig>,
    batch: Option<BatchConfig>,
    performance: Option<PerformanceConfig>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── Auth ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Upper bound on the validated-claims cache TTL, in seconds.
    pub cache_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { cache_ttl_secs: 60 }
    }
}

// ─── Buffer ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub max_per_user: usize,
    pub max_global: usize,
    pub max_message_size_bytes: usize,
    pub max_attempts: u32,
    pub max_memory_buffer_mb: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_per_user: 200,
            max_global: 1000,
            max_message_size_bytes: 32 * 1024,
            max_attempts: 4,
            max_memory_buffer_mb: 100,
        }
    }
}

/// Backoff schedule, seconds.
pub const DEFAULT_BACKOFF_SCHEDULE_SECS: &[f64] = &[0.5, 1.0, 2.0, 5.0];

// ─── Batch ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_wait_ms: u64,
    pub max_batch_size: usize,
    pub max_batch_bytes: usize,
    pub priority_threshold: crate::envelope::Priority,
    pub adaptive_min: usize,
    pub adaptive_max: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_wait_ms: 100,
            max_batch_size: 50,
            max_batch_bytes: 500 * 1024,
            priority_threshold: crate::envelope::Priority::High,
            adaptive_min: 10,
            adaptive_max: 200,
        }
    }
}

// ─── Performance / broadcast / heartbeat ─────────────────────

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    pub ping_interval_secs: u64,
    pub ping_timeout_secs: u64,
    pub dead_after_secs: u64,
    pub rate_limit_requests: u32,
    pub rate_limit_window_secs: u64,
    pub max_connections_per_pool: usize,
    pub broadcast_batch_size: usize,
    pub broadcast_batch_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub disconnect_threshold_failures: u32,
    pub drain_deadline_secs: u64,
    pub disconnection_snapshot_ttl_secs: u64,
    pub max_reconnection_attempts: u32,
    pub min_reconnect_interval_secs: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 15,
            ping_timeout_secs: 30,
            dead_after_secs: 60,
            rate_limit_requests: 120,
            rate_limit_window_secs: 60,
            max_connections_per_pool: 1000,
            broadcast_batch_size: 100,
            broadcast_batch_timeout_ms: 50,
            send_timeout_ms: 1000,
            disconnect_threshold_failures: 5,
            drain_deadline_secs: 5,
            disconnection_snapshot_ttl_secs: 3600,
            max_reconnection_attempts: 5,
            min_reconnect_interval_secs: 1,
        }
    }
}

// ─── GatewayConfig ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    pub auth: AuthConfig,
    pub buffer: BufferConfig,
    pub batch: BatchConfig,
    pub performance: PerformanceConfig,
}

impl GatewayConfig {
    /// Build config from CLI/env args plus an optional TOML file.
    ///
    /// Priority (highest to lowest): CLI / env (passed as `Some(..)` from
    /// clap) > TOML file at `{data_dir}/config.toml` > built-in defaults.
    pub fn new(port: Option<u16>, data_dir: Option<PathBuf>, log: Option<String>) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        Self {
            port: port.or(toml.port).unwrap_or(DEFAULT_PORT),
            log: log.or(toml.log).unwrap_or_else(|| "info".to_string()),
            auth: toml.auth.unwrap_or_default(),
            buffer: toml.buffer.unwrap_or_default(),
            batch: toml.batch.unwrap_or_default(),
            performance: toml.performance.unwrap_or_default(),
            data_dir,
        }
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("realtime-gateway");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local").join("share").join("realtime-gateway");
        }
    }
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("realtime-gateway");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("realtime-gateway");
        }
    }
    PathBuf::from(".realtime-gateway")
}
