//! Configuration loading for the sync server.
//!
//! Configuration is loaded from a TOML file (default: `oplog.toml`).

use serde::Deserialize;
use std::path::PathBuf;
use sync_core::ValidationConfig;

/// Root configuration for the sync server.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Rate limiting and request bounds.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Snapshot engine configuration.
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    /// Retention/compaction job configuration.
    #[serde(default)]
    pub retention: RetentionConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP server (default: 0.0.0.0:8080).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
    /// Maximum serialized payload size per operation (default: 20 MiB,
    /// sized for full backups).
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    /// Per-user storage quota in bytes (default: 100 MiB).
    #[serde(default = "default_quota_bytes")]
    pub quota_bytes: u64,
}

/// Rate limiting and request bound configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Upload requests allowed per user per window (default: 100).
    #[serde(default = "default_uploads_per_window")]
    pub uploads_per_window: u32,
    /// Length of the per-user upload window in seconds (default: 60).
    #[serde(default = "default_upload_window_secs")]
    pub upload_window_secs: u64,
    /// Aggregate requests per second across all users (default: 1000).
    #[serde(default = "default_global_requests_per_second")]
    pub global_requests_per_second: u32,
    /// Maximum operations per upload batch (default: 500).
    #[serde(default = "default_max_ops_per_upload")]
    pub max_ops_per_upload: usize,
    /// Maximum tracked rate-limit/dedup entries (default: 10000).
    #[serde(default = "default_max_cache_entries")]
    pub max_cache_entries: usize,
    /// TTL for request deduplication entries in seconds (default: 300).
    #[serde(default = "default_dedup_ttl_secs")]
    pub dedup_ttl_secs: u64,
    /// Future clock drift tolerated before clamping, in ms (default: 5 min).
    #[serde(default = "default_max_clock_drift_ms")]
    pub max_clock_drift_ms: i64,
    /// Maximum operation age before rejection, in ms (default: 30 days).
    #[serde(default = "default_max_op_age_ms")]
    pub max_op_age_ms: i64,
    /// Default download page size (default: 500).
    #[serde(default = "default_download_limit")]
    pub default_download_limit: u32,
    /// Maximum download page size (default: 1000).
    #[serde(default = "default_max_download_limit")]
    pub max_download_limit: u32,
    /// How recently a device must have been seen to count as online,
    /// in seconds (default: 300).
    #[serde(default = "default_online_threshold_secs")]
    pub online_threshold_secs: u64,
}

/// Snapshot engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotConfig {
    /// How long a cached snapshot may be served without regeneration,
    /// in seconds (default: 300).
    #[serde(default = "default_snapshot_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Maximum operations a single generation may replay (default: 100000).
    #[serde(default = "default_max_ops_per_snapshot")]
    pub max_ops_per_snapshot: u64,
    /// Operations fetched per replay batch (default: 10000).
    #[serde(default = "default_replay_batch_size")]
    pub replay_batch_size: u32,
    /// Maximum compressed cached snapshot size (default: 50 MiB).
    #[serde(default = "default_max_compressed_bytes")]
    pub max_compressed_bytes: usize,
    /// Maximum decompressed cached snapshot size (default: 100 MiB).
    /// Caps memory when reading back the cache.
    #[serde(default = "default_max_decompressed_bytes")]
    pub max_decompressed_bytes: usize,
}

/// Retention/compaction job configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Retention window in days (default: 30).
    #[serde(default = "default_retention_days")]
    pub days: u32,
    /// Interval between runs in seconds (default: 86400 = daily).
    #[serde(default = "default_retention_interval_secs")]
    pub interval_secs: u64,
    /// Delay before the first run after startup in seconds (default: 300).
    #[serde(default = "default_retention_initial_delay_secs")]
    pub initial_delay_secs: u64,
    /// Enable the retention task (default: true).
    #[serde(default = "default_retention_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("oplog.db")
}

fn default_max_payload_bytes() -> usize {
    20 * 1024 * 1024 // 20 MiB
}

fn default_quota_bytes() -> u64 {
    100 * 1024 * 1024 // 100 MiB
}

fn default_uploads_per_window() -> u32 {
    100
}

fn default_upload_window_secs() -> u64 {
    60
}

fn default_global_requests_per_second() -> u32 {
    1000
}

fn default_max_ops_per_upload() -> usize {
    500
}

fn default_max_cache_entries() -> usize {
    10_000
}

fn default_dedup_ttl_secs() -> u64 {
    300
}

fn default_max_clock_drift_ms() -> i64 {
    5 * 60 * 1000
}

fn default_max_op_age_ms() -> i64 {
    30 * 24 * 60 * 60 * 1000
}

fn default_download_limit() -> u32 {
    500
}

fn default_max_download_limit() -> u32 {
    1000
}

fn default_online_threshold_secs() -> u64 {
    300
}

fn default_snapshot_cache_ttl_secs() -> u64 {
    300
}

fn default_max_ops_per_snapshot() -> u64 {
    100_000
}

fn default_replay_batch_size() -> u32 {
    10_000
}

fn default_max_compressed_bytes() -> usize {
    50 * 1024 * 1024 // 50 MiB
}

fn default_max_decompressed_bytes() -> usize {
    100 * 1024 * 1024 // 100 MiB
}

fn default_retention_days() -> u32 {
    30
}

fn default_retention_interval_secs() -> u64 {
    86_400
}

fn default_retention_initial_delay_secs() -> u64 {
    300
}

fn default_retention_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
            max_payload_bytes: default_max_payload_bytes(),
            quota_bytes: default_quota_bytes(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            uploads_per_window: default_uploads_per_window(),
            upload_window_secs: default_upload_window_secs(),
            global_requests_per_second: default_global_requests_per_second(),
            max_ops_per_upload: default_max_ops_per_upload(),
            max_cache_entries: default_max_cache_entries(),
            dedup_ttl_secs: default_dedup_ttl_secs(),
            max_clock_drift_ms: default_max_clock_drift_ms(),
            max_op_age_ms: default_max_op_age_ms(),
            default_download_limit: default_download_limit(),
            max_download_limit: default_max_download_limit(),
            online_threshold_secs: default_online_threshold_secs(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_snapshot_cache_ttl_secs(),
            max_ops_per_snapshot: default_max_ops_per_snapshot(),
            replay_batch_size: default_replay_batch_size(),
            max_compressed_bytes: default_max_compressed_bytes(),
            max_decompressed_bytes: default_max_decompressed_bytes(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            days: default_retention_days(),
            interval_secs: default_retention_interval_secs(),
            initial_delay_secs: default_retention_initial_delay_secs(),
            enabled: default_retention_enabled(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Validation bounds derived from this configuration.
    pub fn validation(&self) -> ValidationConfig {
        ValidationConfig {
            max_payload_bytes: self.storage.max_payload_bytes,
            max_clock_drift_ms: self.limits.max_clock_drift_ms,
            max_op_age_ms: self.limits.max_op_age_ms,
        }
    }

    /// Retention cutoff window in milliseconds.
    pub fn retention_window_ms(&self) -> i64 {
        self.retention.days as i64 * 24 * 60 * 60 * 1000
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}
