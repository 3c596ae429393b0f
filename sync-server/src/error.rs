//! Error types for the sync server.

use std::path::PathBuf;
use sync_types::Seq;

/// Main error type for server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Snapshot generation error.
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An operation with this id was already stored.
    ///
    /// Normally caught by the pre-insert check; this variant exists so a
    /// racing insert maps to a per-operation rejection instead of failing
    /// the whole batch.
    #[error("duplicate operation id: {op_id}")]
    DuplicateOperation {
        /// The operation id that collided.
        op_id: String,
    },

    /// A stored operation kind label was unrecognized.
    #[error("corrupt row: {0}")]
    CorruptRow(String),

    /// Invalid database path.
    #[error("invalid database path: {path}")]
    InvalidPath {
        /// The offending path.
        path: PathBuf,
    },
}

/// Snapshot generation and restore errors.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// Storage failure during replay.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Requested sequence is below 1.
    #[error("target sequence must be at least 1")]
    SeqTooLow,

    /// Requested sequence is beyond the user's log.
    #[error("target sequence {target} exceeds latest sequence {latest}")]
    SeqBeyondLatest {
        /// The requested sequence.
        target: Seq,
        /// The user's current high-water mark.
        latest: Seq,
    },

    /// The replay range contains encrypted payloads the server cannot merge.
    #[error(
        "cannot replay: {count} operations have encrypted payloads; \
         server-side restore is unavailable with end-to-end encryption enabled"
    )]
    EncryptedOps {
        /// Number of encrypted operations in the range.
        count: u64,
    },

    /// Replay would cover more operations than the configured cap.
    #[error("too many operations to replay ({count}, max {max})")]
    TooManyOps {
        /// Operations the replay would cover.
        count: u64,
        /// Configured ceiling.
        max: u64,
    },
}

impl SnapshotError {
    /// Whether this error is the caller's fault (bad request) rather than
    /// a server-side failure.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SnapshotError::SeqTooLow
                | SnapshotError::SeqBeyondLatest { .. }
                | SnapshotError::EncryptedOps { .. }
        )
    }
}

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
