//! Conflict detection against the stored log.
//!
//! Looks up the latest stored operation per targeted entity and applies the
//! pure decision table from `sync-core`. Runs twice per accepted operation:
//! once before sequence allocation and once after, so a competing insert
//! between the two phases is still caught.

use crate::error::StorageResult;
use crate::storage::SqliteStore;
use sqlx::sqlite::SqliteConnection;
use sync_core::conflict::{judge, ConflictVerdict};
use sync_core::ValidatedOp;
use sync_types::{ErrorCode, VectorClock};

/// Outcome of checking one operation against the stored log.
#[derive(Debug, Clone)]
pub struct ConflictCheck {
    /// Whether a conflict was found.
    pub has_conflict: bool,
    /// Rejection code for the conflict.
    pub error_code: Option<ErrorCode>,
    /// Human-readable reason.
    pub reason: Option<String>,
    /// The stored clock the operation lost against.
    pub existing_clock: Option<VectorClock>,
}

impl ConflictCheck {
    fn clear() -> Self {
        Self {
            has_conflict: false,
            error_code: None,
            reason: None,
            existing_clock: None,
        }
    }

    fn conflict(verdict: ConflictVerdict, reason: String, existing: VectorClock) -> Self {
        Self {
            has_conflict: true,
            error_code: verdict.error_code(),
            reason: Some(reason),
            existing_clock: Some(existing),
        }
    }
}

/// Detects causal conflicts between incoming operations and the stored log.
#[derive(Clone)]
pub struct ConflictDetector {
    store: SqliteStore,
}

impl ConflictDetector {
    /// Create a detector over the given store.
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    /// Check an incoming operation inside the upload transaction.
    ///
    /// Full-state operations and operations without resolvable entity
    /// targets bypass detection entirely; they don't compete at entity
    /// granularity. Batch operations are checked per target id and the
    /// first conflicting id rejects the whole operation.
    pub async fn detect(
        &self,
        conn: &mut SqliteConnection,
        user: sync_types::UserId,
        validated: &ValidatedOp,
    ) -> StorageResult<ConflictCheck> {
        if validated.op.op_kind.is_full_state() {
            return Ok(ConflictCheck::clear());
        }

        for entity_id in validated.targets.ids() {
            let existing = self
                .store
                .latest_op_for_entity(&mut *conn, user, &validated.op.entity_type, entity_id)
                .await?;

            let Some((existing_clock, existing_client)) = existing else {
                continue; // no prior operation for this entity
            };

            let verdict = judge(
                &validated.clock,
                &validated.op.client_id,
                &existing_clock,
                &existing_client,
            );

            match verdict {
                ConflictVerdict::Accept => {}
                ConflictVerdict::Concurrent => {
                    return Ok(ConflictCheck::conflict(
                        verdict,
                        format!(
                            "concurrent modification detected for {}:{}",
                            validated.op.entity_type, entity_id
                        ),
                        existing_clock,
                    ));
                }
                ConflictVerdict::EqualClockDifferentClient => {
                    return Ok(ConflictCheck::conflict(
                        verdict,
                        format!(
                            "equal clocks from different clients for {}:{}",
                            validated.op.entity_type, entity_id
                        ),
                        existing_clock,
                    ));
                }
                ConflictVerdict::Stale => {
                    return Ok(ConflictCheck::conflict(
                        verdict,
                        format!(
                            "stale operation: server has newer version of {}:{}",
                            validated.op.entity_type, entity_id
                        ),
                        existing_clock,
                    ));
                }
            }
        }

        Ok(ConflictCheck::clear())
    }
}
