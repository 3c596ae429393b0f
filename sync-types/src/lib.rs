//! # sync-types
//!
//! Data model and wire types for the oplog-sync operation-log engine.
//!
//! This crate provides the foundational types used across all oplog-sync
//! crates:
//! - [`UserId`], [`Seq`] - Identity and ordering types
//! - [`VectorClock`], [`ClockOrdering`] - Causality tracking
//! - [`Operation`], [`ServerOperation`], [`OpKind`] - The operation log itself
//! - [`ErrorCode`] - Per-operation rejection codes
//! - Request/response messages for the sync HTTP surface

#![warn(missing_docs)]
#![warn(clippy::all)]

mod clock;
mod error;
mod ids;
mod messages;
mod op;

pub use clock::{
    sanitize_clock, ClockError, ClockOrdering, VectorClock, MAX_CLOCK_COUNTER, MAX_CLOCK_ENTRIES,
    MAX_CLOCK_KEY_LEN,
};
pub use error::ErrorCode;
pub use ids::{Seq, UserId};
pub use messages::{
    AckRequest, AckResponse, DownloadOpsResponse, RestorePoint, RestorePointsResponse,
    SnapshotReason, SnapshotResponse, SnapshotUploadRequest, SnapshotUploadResponse,
    StatusResponse, UploadOpsRequest, UploadOpsResponse, UploadResult,
};
pub use op::{OpKind, Operation, ServerOperation, UnknownOpKind, WILDCARD_ENTITY_TYPE};
