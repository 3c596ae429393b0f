//! Per-operation rejection codes shared between server and clients.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine-readable code attached to every rejected operation or request.
///
/// Clients branch on these: validation codes mean "fix the payload",
/// conflict codes mean "fetch piggybacked ops, merge, retry",
/// `DuplicateOperation` means "already applied, treat as success", and
/// `InternalError` means "retry the whole batch later".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Operation id missing, empty, or overlong.
    InvalidOpId,
    /// Operation kind not in the known set.
    InvalidOpType,
    /// Entity type missing, empty, or overlong.
    InvalidEntityType,
    /// Entity id malformed or overlong.
    InvalidEntityId,
    /// Operation kind requires an entity target but none was given.
    MissingEntityId,
    /// Operation client id does not match the batch's declared client id.
    ClientIdMismatch,
    /// Payload failed shape or complexity validation.
    InvalidPayload,
    /// Payload exceeds the configured size ceiling.
    PayloadTooLarge,
    /// Schema version outside the supported range.
    InvalidSchemaVersion,
    /// Vector clock container was malformed beyond repair.
    InvalidVectorClock,
    /// Operation timestamp is older than the accepted window.
    InvalidTimestamp,
    /// Another client modified the same entity concurrently.
    ConflictConcurrent,
    /// The server already has a newer version of this entity.
    ConflictStale,
    /// An operation with this id was already accepted.
    DuplicateOperation,
    /// Per-user upload rate limit exceeded.
    RateLimited,
    /// Per-user storage quota exceeded.
    StorageQuotaExceeded,
    /// Requested server-side replay covers encrypted payloads.
    EncryptedOpsNotSupported,
    /// Transient transactional failure; the whole batch should be retried.
    InternalError,
}

impl ErrorCode {
    /// Canonical wire label for this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidOpId => "INVALID_OP_ID",
            ErrorCode::InvalidOpType => "INVALID_OP_TYPE",
            ErrorCode::InvalidEntityType => "INVALID_ENTITY_TYPE",
            ErrorCode::InvalidEntityId => "INVALID_ENTITY_ID",
            ErrorCode::MissingEntityId => "MISSING_ENTITY_ID",
            ErrorCode::ClientIdMismatch => "CLIENT_ID_MISMATCH",
            ErrorCode::InvalidPayload => "INVALID_PAYLOAD",
            ErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorCode::InvalidSchemaVersion => "INVALID_SCHEMA_VERSION",
            ErrorCode::InvalidVectorClock => "INVALID_VECTOR_CLOCK",
            ErrorCode::InvalidTimestamp => "INVALID_TIMESTAMP",
            ErrorCode::ConflictConcurrent => "CONFLICT_CONCURRENT",
            ErrorCode::ConflictStale => "CONFLICT_STALE",
            ErrorCode::DuplicateOperation => "DUPLICATE_OPERATION",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::StorageQuotaExceeded => "STORAGE_QUOTA_EXCEEDED",
            ErrorCode::EncryptedOpsNotSupported => "ENCRYPTED_OPS_NOT_SUPPORTED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
