//! Storage layer for the sync server.
//!
//! One SQLite database holds the per-user operation log, sync state
//! (sequence high-water mark plus the cached snapshot), and device records.

mod sqlite;

pub use sqlite::SqliteStore;

use std::time::{SystemTime, UNIX_EPOCH};
use sync_types::{OpKind, Seq, UserId};

/// Current wall clock in milliseconds since the epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// The cached snapshot blob for a user.
#[derive(Debug, Clone)]
pub struct SnapshotBlob {
    /// Gzip-compressed projection JSON.
    pub data: Vec<u8>,
    /// Last operation applied to the cached state.
    pub seq: Seq,
    /// When the snapshot was generated, in ms.
    pub generated_at: i64,
}

/// A full-state operation row, as listed for restore points and compaction.
#[derive(Debug, Clone)]
pub struct FullStateOp {
    /// Position in the log.
    pub server_seq: Seq,
    /// Which full-state kind it is.
    pub kind: OpKind,
    /// The client that produced it.
    pub client_id: String,
    /// Client timestamp in ms.
    pub timestamp: i64,
}

/// A user's sync-state row as seen by the retention job.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotCoverage {
    /// The user.
    pub user_id: UserId,
    /// Last operation covered by the durable snapshot.
    pub last_snapshot_seq: Seq,
    /// When that snapshot was generated, in ms.
    pub snapshot_at: i64,
}
