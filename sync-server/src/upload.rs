//! Upload coordination: validate, detect conflicts, allocate sequence
//! numbers, and persist operations.
//!
//! A batch is the unit of atomicity: one transaction per batch. Per-op
//! failures (validation, conflict, duplicate) reject that operation and the
//! batch continues; a transaction-level failure fails every operation in
//! the batch with a retryable code and nothing is applied.

use crate::conflict::ConflictDetector;
use crate::error::{StorageError, StorageResult};
use crate::storage::{now_ms, SqliteStore};
use sqlx::sqlite::SqliteConnection;
use sync_core::validate::{validate, ValidationConfig};
use sync_types::{ErrorCode, Operation, UploadResult, UserId};

/// Coordinates the per-batch upload protocol.
#[derive(Clone)]
pub struct UploadCoordinator {
    store: SqliteStore,
    detector: ConflictDetector,
    validation: ValidationConfig,
}

impl UploadCoordinator {
    /// Create a coordinator over the given store.
    pub fn new(store: SqliteStore, validation: ValidationConfig) -> Self {
        let detector = ConflictDetector::new(store.clone());
        Self {
            store,
            detector,
            validation,
        }
    }

    /// Process a batch of operations for one user.
    ///
    /// Always returns one result per submitted operation, aligned by
    /// position. When the surrounding transaction fails (busy database,
    /// serialization failure), every result carries `INTERNAL_ERROR` and
    /// the client is expected to retry the entire batch.
    pub async fn upload_batch(
        &self,
        user: UserId,
        client_id: &str,
        ops: &[Operation],
    ) -> Vec<UploadResult> {
        let now = now_ms();
        match self.run_batch(user, client_id, ops, now).await {
            Ok(results) => results,
            Err(err) => {
                tracing::error!(
                    user_id = user.value(),
                    client_id,
                    error = %err,
                    "upload transaction failed; batch rolled back"
                );
                ops.iter()
                    .map(|op| {
                        UploadResult::rejected(
                            &op.id,
                            ErrorCode::InternalError,
                            "transaction failed, retry the batch",
                        )
                    })
                    .collect()
            }
        }
    }

    async fn run_batch(
        &self,
        user: UserId,
        client_id: &str,
        ops: &[Operation],
        now: i64,
    ) -> StorageResult<Vec<UploadResult>> {
        let mut tx = self.store.begin().await?;

        self.store.ensure_sync_state(&mut *tx, user).await?;

        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            let result = self
                .process_op(&mut *tx, user, client_id, op.clone(), now)
                .await?;
            results.push(result);
        }

        self.store.upsert_device(&mut *tx, user, client_id, now).await?;

        tx.commit().await?;
        Ok(results)
    }

    /// Process a single operation inside the batch transaction.
    ///
    /// Only unexpected storage failures return `Err` (forcing rollback);
    /// every per-operation rejection is a normal `Ok` result.
    async fn process_op(
        &self,
        conn: &mut SqliteConnection,
        user: UserId,
        client_id: &str,
        op: Operation,
        now: i64,
    ) -> StorageResult<UploadResult> {
        let op_id = op.id.clone();
        let op_kind = op.op_kind;

        let validated = match validate(op, client_id, now, &self.validation) {
            Ok(validated) => validated,
            Err(err) => {
                tracing::info!(
                    event = "op_rejected",
                    user_id = user.value(),
                    client_id,
                    op_id = %op_id,
                    op_kind = %op_kind,
                    error_code = %err.code,
                    reason = %err,
                    "operation failed validation"
                );
                return Ok(UploadResult::rejected(op_id, err.code, err.message));
            }
        };

        if validated.drift_clamped {
            tracing::warn!(
                event = "timestamp_clamped",
                user_id = user.value(),
                client_id,
                op_id = %op_id,
                "client clock ahead of server; timestamp clamped"
            );
        }
        if validated.stripped_clock_entries > 0 {
            tracing::debug!(
                user_id = user.value(),
                op_id = %op_id,
                stripped = validated.stripped_clock_entries,
                "dropped malformed vector clock entries"
            );
        }

        let check = self.detector.detect(&mut *conn, user, &validated).await?;
        if check.has_conflict {
            return Ok(self.reject_conflict(user, client_id, &op_id, check));
        }

        // The only seq-granting action. Inside the same transaction as the
        // conflict checks so the race window is bounded by the isolation
        // level rather than wall clock.
        let server_seq = self.store.allocate_seq(&mut *conn, user).await?;

        // Second check: a concurrent transaction may have inserted a
        // competing op between the first check and the allocation. A
        // rejection here strands the allocated seq; sequence numbers are
        // not guaranteed contiguous.
        let recheck = self.detector.detect(&mut *conn, user, &validated).await?;
        if recheck.has_conflict {
            return Ok(self.reject_conflict(user, client_id, &op_id, recheck));
        }

        // Idempotency pre-check before insert: a constraint abort inside
        // the batch transaction must not cascade into failing unrelated
        // operations.
        if self.store.op_exists(&mut *conn, user, &op_id).await? {
            tracing::info!(
                event = "op_rejected",
                user_id = user.value(),
                client_id,
                op_id = %op_id,
                error_code = %ErrorCode::DuplicateOperation,
                "duplicate operation id"
            );
            return Ok(UploadResult::rejected(
                op_id,
                ErrorCode::DuplicateOperation,
                "duplicate operation id",
            ));
        }

        match self
            .store
            .insert_op(&mut *conn, user, &validated, server_seq, now)
            .await
        {
            Ok(()) => Ok(UploadResult::accepted(op_id, server_seq)),
            // Fallback for a duplicate that slipped past the pre-check.
            Err(StorageError::DuplicateOperation { .. }) => Ok(UploadResult::rejected(
                op_id,
                ErrorCode::DuplicateOperation,
                "duplicate operation id",
            )),
            Err(err) => Err(err),
        }
    }

    fn reject_conflict(
        &self,
        user: UserId,
        client_id: &str,
        op_id: &str,
        check: crate::conflict::ConflictCheck,
    ) -> UploadResult {
        let code = check.error_code.unwrap_or(ErrorCode::ConflictConcurrent);
        let reason = check
            .reason
            .unwrap_or_else(|| "conflicting operation".to_string());
        tracing::info!(
            event = "op_rejected",
            user_id = user.value(),
            client_id,
            op_id = %op_id,
            error_code = %code,
            reason,
            "operation conflicts with stored log"
        );
        UploadResult::rejected(op_id, code, reason)
    }
}
