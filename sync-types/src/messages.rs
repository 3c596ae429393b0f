//! Request/response messages for the sync HTTP surface.
//!
//! Routing and schema parsing live outside the engine; these are the shapes
//! the coordinators produce and consume.

use crate::{ErrorCode, OpKind, Operation, Seq, ServerOperation, VectorClock};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of `POST /ops`: a batch of operations from one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadOpsRequest {
    /// Operations in client submission order.
    pub ops: Vec<Operation>,
    /// The uploading client; every op must carry the same client id.
    pub client_id: String,
    /// Highest server seq this client has applied; enables piggybacking.
    #[serde(default)]
    pub last_known_server_seq: Option<Seq>,
    /// Client-chosen id for retry deduplication.
    #[serde(default)]
    pub request_id: Option<String>,
}

/// Per-operation outcome of an upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadResult {
    /// The operation this result refers to.
    pub op_id: String,
    /// Whether the operation was accepted and stored.
    pub accepted: bool,
    /// Assigned sequence number when accepted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_seq: Option<Seq>,
    /// Human-readable rejection reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Machine-readable rejection code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
}

impl UploadResult {
    /// Result for an accepted operation.
    pub fn accepted(op_id: impl Into<String>, server_seq: Seq) -> Self {
        Self {
            op_id: op_id.into(),
            accepted: true,
            server_seq: Some(server_seq),
            error: None,
            error_code: None,
        }
    }

    /// Result for a rejected operation.
    pub fn rejected(op_id: impl Into<String>, code: ErrorCode, error: impl Into<String>) -> Self {
        Self {
            op_id: op_id.into(),
            accepted: false,
            server_seq: None,
            error: Some(error.into()),
            error_code: Some(code),
        }
    }
}

/// Response to `POST /ops`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadOpsResponse {
    /// One result per submitted operation, aligned by position.
    pub results: Vec<UploadResult>,
    /// Operations from other clients since `last_known_server_seq`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_ops: Option<Vec<ServerOperation>>,
    /// Current high-water mark of the user's log.
    pub latest_seq: Seq,
    /// Set when cached results from a duplicate request were returned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deduplicated: Option<bool>,
}

/// Response to `GET /ops`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadOpsResponse {
    /// Operations after the requested sequence, ascending.
    pub ops: Vec<ServerOperation>,
    /// Whether more operations remain beyond this page.
    pub has_more: bool,
    /// Current high-water mark of the user's log.
    pub latest_seq: Seq,
    /// Set when the client cannot reach consistency by replaying this page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gap_detected: Option<bool>,
    /// Seq of the newest full-state op, when one shaped this response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_snapshot_seq: Option<Seq>,
    /// Aggregated clock of the operations skipped by snapshot-skip.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_vector_clock: Option<VectorClock>,
    /// Server wall clock in ms, for client drift detection.
    pub server_time: i64,
}

/// Body of `POST /snapshot`: a full application state from one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotUploadRequest {
    /// The full projected state.
    pub state: Value,
    /// The uploading client.
    pub client_id: String,
    /// Why the client pushed a full state.
    pub reason: SnapshotReason,
    /// The client's clock at export time.
    #[serde(default)]
    pub vector_clock: Value,
    /// Client schema version.
    #[serde(default)]
    pub schema_version: Option<u32>,
    /// True when `state` is an encrypted blob.
    #[serde(default)]
    pub is_payload_encrypted: bool,
}

/// Client-declared reason for a snapshot upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotReason {
    /// First sync from this client.
    Initial,
    /// Recovery after local corruption or gap.
    Recovery,
    /// Schema migration rewrote the local state.
    Migration,
}

/// Response to `POST /snapshot`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotUploadResponse {
    /// Whether the synthetic import operation was accepted.
    pub accepted: bool,
    /// Assigned sequence number when accepted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_seq: Option<Seq>,
    /// Rejection reason when not accepted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response to `GET /snapshot` and `GET /restore/:server_seq`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotResponse {
    /// Projected state: entity type -> entity id -> merged payload.
    pub state: Value,
    /// Last operation applied to this state.
    pub server_seq: Seq,
    /// When this snapshot was generated, in ms.
    pub generated_at: i64,
}

/// Response to `GET /status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Current high-water mark of the user's log.
    pub latest_seq: Seq,
    /// Devices seen within the online threshold.
    pub devices_online: u32,
    /// Operations not yet acknowledged by the slowest device.
    pub pending_ops: u64,
    /// Age of the cached snapshot in ms, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_age_ms: Option<i64>,
    /// Bytes of operation payloads currently stored.
    pub storage_used_bytes: u64,
    /// Per-user storage ceiling in bytes.
    pub storage_quota_bytes: u64,
}

/// Body of `POST /devices/:client_id/ack`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AckRequest {
    /// Highest server seq the device has durably applied.
    pub acked_seq: Seq,
}

/// Response to a device ack.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AckResponse {
    /// The recorded sequence.
    pub acked_seq: Seq,
}

/// A named rollback checkpoint: one full-state operation in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestorePoint {
    /// Position of the full-state op in the log.
    pub server_seq: Seq,
    /// Client timestamp of the full-state op, in ms.
    pub timestamp: i64,
    /// Which full-state kind produced it.
    pub kind: OpKind,
    /// The client that produced it.
    pub client_id: String,
    /// Human-readable label for pickers.
    pub description: String,
}

/// Response to `GET /restore-points`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestorePointsResponse {
    /// Available checkpoints, newest first.
    pub restore_points: Vec<RestorePoint>,
}
