//! # sync-server
//!
//! Server-ordered operation-log sync engine.
//!
//! Clients append typed mutation records ("operations") to a per-user log;
//! the server validates them, detects causal conflicts via vector clocks,
//! assigns a strictly increasing sequence number per user, and serves the
//! log back to other devices, which replay it to reconstruct state.
//!
//! ## Architecture
//!
//! ```text
//! Device A ──┐                       ┌── Device B
//!            │       HTTP/JSON       │
//!            ├──────────────────────►│
//!            │                       │
//!        ┌───┴───────────────────────┴───┐
//!        │          sync-server          │
//!        │  rate limit · dedup · quota   │
//!        │  validate · conflict · seq    │
//!        │  ┌─────────────────────────┐  │
//!        │  │  SQLite (operation log, │  │
//!        │  │  sync state, devices)   │  │
//!        │  └─────────────────────────┘  │
//!        │  snapshots · retention        │
//!        └───────────────────────────────┘
//! ```
//!
//! ## Request flow
//!
//! Uploads pass through RateLimitGuard and RequestDedupCache, then the
//! UploadCoordinator runs each batch in one serializable transaction:
//! validate → detect conflict → allocate seq → re-check conflict →
//! duplicate pre-check → persist. Downloads go through DownloadService
//! (gap detection, snapshot-skip); snapshots through SnapshotEngine
//! (incremental replay over a compressed cache). A periodic
//! RetentionCompactor deletes snapshot-covered history past the retention
//! window and stale devices.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod conflict;
pub mod dedup;
pub mod download;
pub mod error;
pub mod http;
pub mod limits;
pub mod quota;
pub mod retention;
pub mod server;
pub mod snapshot;
pub mod storage;
pub mod upload;
