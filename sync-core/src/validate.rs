//! Field-level validation of incoming operations.
//!
//! `validate` is a pure function: it takes an untrusted [`Operation`], the
//! batch's declared client id, and the server's clock, and returns either a
//! normalized [`ValidatedOp`] or the first failure. Checks short-circuit in
//! a fixed order so rejection codes are deterministic.

use crate::payload::{self, PayloadError, DEFAULT_MAX_PAYLOAD_BYTES};
use sync_types::{sanitize_clock, ErrorCode, OpKind, Operation, VectorClock, WILDCARD_ENTITY_TYPE};
use thiserror::Error;

/// Maximum length of an operation id.
pub const MAX_OP_ID_LEN: usize = 255;

/// Maximum length of an entity type label.
pub const MAX_ENTITY_TYPE_LEN: usize = 255;

/// Maximum length of an entity id.
pub const MAX_ENTITY_ID_LEN: usize = 255;

/// Supported schema version range.
pub const SCHEMA_VERSION_RANGE: std::ops::RangeInclusive<u32> = 1..=100;

/// Tunable validation bounds, derived from server configuration.
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    /// Serialized payload ceiling in bytes.
    pub max_payload_bytes: usize,
    /// How far into the future a client timestamp may point before being
    /// clamped (never rejected).
    pub max_clock_drift_ms: i64,
    /// How far into the past a client timestamp may point before the
    /// operation is rejected outright.
    pub max_op_age_ms: i64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            max_clock_drift_ms: 5 * 60 * 1000,
            max_op_age_ms: 30 * 24 * 60 * 60 * 1000,
        }
    }
}

/// Entity ids an operation targets, resolved once at the validation
/// boundary so conflict detection and replay never re-interpret the
/// `entity_id`/`entity_ids` union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityTargets {
    /// Bulk, wildcard, or full-state operation: no per-entity target.
    None,
    /// A single entity.
    One(String),
    /// Several entities of the same type (batch operations).
    Many(Vec<String>),
}

impl EntityTargets {
    /// Iterate over the targeted entity ids (empty for `None`).
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        let ids: &[String] = match self {
            EntityTargets::None => &[],
            EntityTargets::One(id) => std::slice::from_ref(id),
            EntityTargets::Many(ids) => ids,
        };
        ids.iter().map(String::as_str)
    }
}

/// An operation that passed validation, with its union-shaped fields
/// resolved into normalized form.
#[derive(Debug, Clone)]
pub struct ValidatedOp {
    /// The original operation, with its timestamp clamped if needed.
    pub op: Operation,
    /// Sanitized vector clock.
    pub clock: VectorClock,
    /// Resolved entity targets.
    pub targets: EntityTargets,
    /// True when the timestamp was clamped against future clock drift.
    pub drift_clamped: bool,
    /// How many malformed clock entries were silently dropped.
    pub stripped_clock_entries: usize,
}

/// First validation failure for an operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ValidationError {
    /// Machine-readable rejection code.
    pub code: ErrorCode,
    /// Human-readable reason.
    pub message: String,
}

impl ValidationError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Validate an incoming operation.
///
/// On success the returned [`ValidatedOp`] carries the (possibly clamped)
/// operation plus its sanitized clock and resolved targets; the caller is
/// responsible for emitting an audit event when `drift_clamped` is set.
pub fn validate(
    mut op: Operation,
    expected_client_id: &str,
    now_ms: i64,
    cfg: &ValidationConfig,
) -> Result<ValidatedOp, ValidationError> {
    if op.id.is_empty() {
        return Err(ValidationError::new(
            ErrorCode::InvalidOpId,
            "operation id is empty",
        ));
    }
    if op.id.len() > MAX_OP_ID_LEN {
        return Err(ValidationError::new(
            ErrorCode::InvalidOpId,
            "operation id too long",
        ));
    }

    if op.entity_type.is_empty() {
        return Err(ValidationError::new(
            ErrorCode::InvalidEntityType,
            "entity type is empty",
        ));
    }
    if op.entity_type.len() > MAX_ENTITY_TYPE_LEN {
        return Err(ValidationError::new(
            ErrorCode::InvalidEntityType,
            "entity type too long",
        ));
    }

    if op.client_id != expected_client_id {
        return Err(ValidationError::new(
            ErrorCode::ClientIdMismatch,
            format!(
                "operation client id {:?} does not match batch client id",
                op.client_id
            ),
        ));
    }

    payload::validate_shape(op.op_kind, &op.payload).map_err(payload_error)?;
    payload::validate_complexity(op.op_kind, &op.payload).map_err(payload_error)?;
    payload::validate_size(&op.payload, cfg.max_payload_bytes).map_err(payload_error)?;

    if let Some(entity_id) = &op.entity_id {
        if entity_id.is_empty() || entity_id.len() > MAX_ENTITY_ID_LEN {
            return Err(ValidationError::new(
                ErrorCode::InvalidEntityId,
                "entity id malformed or too long",
            ));
        }
    }
    if let Some(entity_ids) = &op.entity_ids {
        if entity_ids
            .iter()
            .any(|id| id.is_empty() || id.len() > MAX_ENTITY_ID_LEN)
        {
            return Err(ValidationError::new(
                ErrorCode::InvalidEntityId,
                "batch entity id malformed or too long",
            ));
        }
    }

    let targets = resolve_targets(&op);
    if op.op_kind == OpKind::Delete && targets == EntityTargets::None {
        return Err(ValidationError::new(
            ErrorCode::MissingEntityId,
            "DEL operation requires an entity id",
        ));
    }

    if !SCHEMA_VERSION_RANGE.contains(&op.schema_version) {
        return Err(ValidationError::new(
            ErrorCode::InvalidSchemaVersion,
            format!("schema version {} out of range", op.schema_version),
        ));
    }

    let (clock, stripped_clock_entries) = sanitize_clock(&op.vector_clock)
        .map_err(|e| ValidationError::new(ErrorCode::InvalidVectorClock, e.to_string()))?;

    // Fast client clocks are clamped, never rejected: rejecting would lose
    // the mutation entirely, while clamping only costs timestamp accuracy.
    let drift_ceiling = now_ms + cfg.max_clock_drift_ms;
    let drift_clamped = op.timestamp > drift_ceiling;
    if drift_clamped {
        op.timestamp = drift_ceiling;
    }

    if op.timestamp < now_ms - cfg.max_op_age_ms {
        return Err(ValidationError::new(
            ErrorCode::InvalidTimestamp,
            "operation is older than the accepted window",
        ));
    }

    Ok(ValidatedOp {
        op,
        clock,
        targets,
        drift_clamped,
        stripped_clock_entries,
    })
}

fn payload_error(err: PayloadError) -> ValidationError {
    let code = match err {
        PayloadError::TooLarge { .. } => ErrorCode::PayloadTooLarge,
        _ => ErrorCode::InvalidPayload,
    };
    ValidationError::new(code, err.to_string())
}

fn resolve_targets(op: &Operation) -> EntityTargets {
    if op.op_kind.is_full_state() || op.entity_type == WILDCARD_ENTITY_TYPE {
        return EntityTargets::None;
    }
    if let Some(ids) = &op.entity_ids {
        if !ids.is_empty() {
            return EntityTargets::Many(ids.clone());
        }
    }
    match &op.entity_id {
        Some(id) => EntityTargets::One(id.clone()),
        None => EntityTargets::None,
    }
}
