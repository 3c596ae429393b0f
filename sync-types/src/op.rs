//! Operation types: the records that make up the per-user log.

use crate::{Seq, VectorClock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Entity type marking a full-state or bulk operation.
pub const WILDCARD_ENTITY_TYPE: &str = "ALL";

/// The kind of mutation an operation carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    /// Create an entity (payload is the full entity).
    #[serde(rename = "CRT")]
    Create,
    /// Update an entity (payload is a shallow patch).
    #[serde(rename = "UPD")]
    Update,
    /// Delete an entity.
    #[serde(rename = "DEL")]
    Delete,
    /// Move/reorder an entity (payload is a shallow patch).
    #[serde(rename = "MOV")]
    Move,
    /// Mutate several entities of one type at once.
    #[serde(rename = "BATCH")]
    Batch,
    /// Full-state import from another sync source.
    #[serde(rename = "SYNC_IMPORT")]
    SyncImport,
    /// Full-state restore from a backup file.
    #[serde(rename = "BACKUP_IMPORT")]
    BackupImport,
    /// Full-state replacement written by automatic repair.
    #[serde(rename = "REPAIR")]
    Repair,
}

impl OpKind {
    /// Whether this kind replaces the entire projected state on replay.
    ///
    /// Full-state operations are restore points: everything before them in
    /// the log is logically superseded.
    pub fn is_full_state(&self) -> bool {
        matches!(
            self,
            OpKind::SyncImport | OpKind::BackupImport | OpKind::Repair
        )
    }

    /// Canonical wire/storage label for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Create => "CRT",
            OpKind::Update => "UPD",
            OpKind::Delete => "DEL",
            OpKind::Move => "MOV",
            OpKind::Batch => "BATCH",
            OpKind::SyncImport => "SYNC_IMPORT",
            OpKind::BackupImport => "BACKUP_IMPORT",
            OpKind::Repair => "REPAIR",
        }
    }
}

impl FromStr for OpKind {
    type Err = UnknownOpKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CRT" => Ok(OpKind::Create),
            "UPD" => Ok(OpKind::Update),
            "DEL" => Ok(OpKind::Delete),
            "MOV" => Ok(OpKind::Move),
            "BATCH" => Ok(OpKind::Batch),
            "SYNC_IMPORT" => Ok(OpKind::SyncImport),
            "BACKUP_IMPORT" => Ok(OpKind::BackupImport),
            "REPAIR" => Ok(OpKind::Repair),
            other => Err(UnknownOpKind(other.to_string())),
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for an unrecognized stored operation kind label.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown operation kind: {0}")]
pub struct UnknownOpKind(pub String);

/// A client-submitted mutation record, immutable once accepted.
///
/// The vector clock arrives as raw JSON so that sanitization (which drops
/// bad entries instead of rejecting the operation) stays a validator
/// concern rather than a deserialization failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Globally unique, client-generated, time-sortable id.
    pub id: String,
    /// The client (device) that produced this operation.
    pub client_id: String,
    /// Free-form action label from the client's store; never interpreted.
    pub action_type: String,
    /// Mutation kind.
    pub op_kind: OpKind,
    /// Entity type this operation touches ("ALL" for full-state/bulk ops).
    pub entity_type: String,
    /// Target entity id (required for non-bulk ops).
    #[serde(default)]
    pub entity_id: Option<String>,
    /// Target entity ids for batch operations.
    #[serde(default)]
    pub entity_ids: Option<Vec<String>>,
    /// Opaque payload: object, string (encrypted blob), or null.
    #[serde(default)]
    pub payload: Value,
    /// Raw per-client logical clock, sanitized by the validator.
    #[serde(default)]
    pub vector_clock: Value,
    /// Client wall-clock timestamp in ms.
    pub timestamp: i64,
    /// Client schema version (1..=100).
    pub schema_version: u32,
    /// True when the payload is an end-to-end encrypted blob.
    ///
    /// Carried through storage and downloads untouched; the engine never
    /// interprets encrypted payloads.
    #[serde(default)]
    pub is_payload_encrypted: bool,
}

/// An operation accepted, ordered, and stored by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerOperation {
    /// Server-assigned position in the per-user log.
    pub server_seq: Seq,
    /// Client-generated operation id.
    pub id: String,
    /// The client that produced this operation.
    pub client_id: String,
    /// Free-form action label.
    pub action_type: String,
    /// Mutation kind.
    pub op_kind: OpKind,
    /// Entity type.
    pub entity_type: String,
    /// Target entity id.
    pub entity_id: Option<String>,
    /// Target entity ids for batch operations.
    pub entity_ids: Option<Vec<String>>,
    /// Opaque payload.
    pub payload: Value,
    /// Sanitized vector clock.
    pub vector_clock: VectorClock,
    /// Client timestamp in ms (clamped against clock drift at upload).
    pub timestamp: i64,
    /// Client schema version.
    pub schema_version: u32,
    /// Whether the payload is an encrypted blob.
    pub is_payload_encrypted: bool,
    /// Server receipt time in ms.
    pub received_at: i64,
}
