//! Retention and compaction.
//!
//! The periodic job deletes operations that are both stale (past the
//! retention window) and covered by a durable snapshot. Un-snapshotted
//! history is never deleted. The job also prunes devices silent for the
//! whole window. On-demand compaction frees storage for an upload by
//! deleting restore points oldest-first, always keeping at least one so an
//! account never loses its last recoverable state.

use crate::config::RetentionConfig;
use crate::dedup::RequestDedupCache;
use crate::error::StorageResult;
use crate::limits::RateLimitGuard;
use crate::quota::StorageQuotaGuard;
use crate::storage::{now_ms, SqliteStore};
use std::sync::Arc;
use std::time::Duration;
use sync_types::{Seq, UserId};
use tokio::time::interval;

/// What a retention run deleted.
#[derive(Debug, Clone, Default)]
pub struct RetentionReport {
    /// Operations deleted across all users.
    pub ops_deleted: u64,
    /// Stale device rows deleted.
    pub devices_deleted: u64,
    /// Users whose operations were touched (storage recomputed for these).
    pub affected_user_ids: Vec<UserId>,
}

/// Outcome of on-demand quota compaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactionOutcome {
    /// Whether the quota is now satisfied.
    pub success: bool,
    /// Bytes freed across all iterations.
    pub freed_bytes: u64,
    /// Restore points deleted.
    pub deleted_restore_points: u32,
    /// Operations deleted (including the restore points themselves).
    pub deleted_ops: u64,
}

/// Background retention job and quota-driven compaction.
#[derive(Clone)]
pub struct RetentionCompactor {
    store: SqliteStore,
    quota: StorageQuotaGuard,
    window_ms: i64,
}

impl RetentionCompactor {
    /// Create a compactor over the given store.
    pub fn new(store: SqliteStore, quota: StorageQuotaGuard, window_ms: i64) -> Self {
        Self {
            store,
            quota,
            window_ms,
        }
    }

    /// One retention pass. Sub-task failures are logged and isolated: a
    /// failing delete for one user never blocks the others.
    pub async fn run(&self) -> RetentionReport {
        let now = now_ms();
        let cutoff = now - self.window_ms;
        let mut report = RetentionReport::default();

        match self.store.snapshot_coverage().await {
            Ok(covered) => {
                for row in covered {
                    // Only delete history that is both stale and superseded
                    // by a snapshot fresh enough to cover the window.
                    if row.snapshot_at < cutoff {
                        continue;
                    }
                    match self
                        .store
                        .delete_covered_ops(row.user_id, row.last_snapshot_seq, cutoff)
                        .await
                    {
                        Ok(0) => {}
                        Ok(deleted) => {
                            report.ops_deleted += deleted;
                            report.affected_user_ids.push(row.user_id);
                        }
                        Err(err) => {
                            tracing::error!(
                                user_id = row.user_id.value(),
                                error = %err,
                                "retention: failed to delete covered ops"
                            );
                        }
                    }
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "retention: failed to list snapshot coverage");
            }
        }

        match self.store.delete_stale_devices(cutoff).await {
            Ok(deleted) => report.devices_deleted = deleted,
            Err(err) => {
                tracing::error!(error = %err, "retention: failed to delete stale devices");
            }
        }

        for user in &report.affected_user_ids {
            if let Err(err) = self.quota.recompute(*user).await {
                tracing::error!(
                    user_id = user.value(),
                    error = %err,
                    "retention: failed to recompute storage"
                );
            }
        }

        if report.ops_deleted > 0 || report.devices_deleted > 0 {
            tracing::info!(
                ops_deleted = report.ops_deleted,
                devices_deleted = report.devices_deleted,
                users = report.affected_user_ids.len(),
                "retention pass complete"
            );
        } else {
            tracing::debug!("retention pass: nothing to delete");
        }

        report
    }

    /// Free storage so an upload of `incoming_bytes` can proceed.
    ///
    /// Deletes the oldest restore point (and everything up to it) per
    /// iteration while the quota remains exceeded. When a single restore
    /// point remains it is preserved (only the operations strictly before
    /// it are dropped) and failure is reported if that still doesn't
    /// satisfy the quota.
    pub async fn free_storage_for_upload(
        &self,
        user: UserId,
        incoming_bytes: u64,
    ) -> StorageResult<CompactionOutcome> {
        let quota = self.quota.quota_bytes();
        let start_usage = self.quota.recompute(user).await?;
        let mut usage = start_usage;
        let mut outcome = CompactionOutcome::default();

        loop {
            if usage + incoming_bytes <= quota {
                outcome.success = true;
                break;
            }

            let points = self
                .store
                .full_state_seqs_asc(self.store.pool(), user)
                .await?;

            match points.as_slice() {
                [] => break, // nothing recoverable to trade for space
                [only] => {
                    // Minimum viable recovery state: keep the point, drop
                    // everything before it, and stop either way.
                    let deleted = self.store.delete_ops_before(user, *only).await?;
                    outcome.deleted_ops += deleted;
                    self.discard_cache_if_covered(user, Seq::new(only.value() - 1))
                        .await?;
                    usage = self.quota.recompute(user).await?;
                    outcome.success = usage + incoming_bytes <= quota;
                    break;
                }
                [oldest, ..] => {
                    let deleted = self.store.delete_ops_up_to(user, *oldest).await?;
                    outcome.deleted_ops += deleted;
                    outcome.deleted_restore_points += 1;
                    self.discard_cache_if_covered(user, *oldest).await?;
                    tracing::info!(
                        user_id = user.value(),
                        restore_point = oldest.value(),
                        deleted,
                        "compaction: deleted oldest restore point"
                    );
                    if deleted == 0 {
                        break; // nothing was freed; avoid spinning
                    }
                    usage = self.quota.recompute(user).await?;
                }
            }
        }

        outcome.freed_bytes = start_usage.saturating_sub(usage);
        if !outcome.success {
            tracing::warn!(
                user_id = user.value(),
                freed = outcome.freed_bytes,
                usage,
                quota,
                "compaction could not satisfy quota"
            );
        }
        Ok(outcome)
    }

    /// Drop the cached snapshot when compaction deleted its basis.
    async fn discard_cache_if_covered(&self, user: UserId, upto: Seq) -> StorageResult<()> {
        let cached = self
            .store
            .load_snapshot_blob(self.store.pool(), user)
            .await?;
        if let Some(blob) = cached {
            if blob.seq <= upto {
                tracing::info!(
                    user_id = user.value(),
                    cached_seq = blob.seq.value(),
                    "compaction: clearing snapshot cache covered by delete"
                );
                self.store.clear_snapshot_blob(user).await?;
            }
        }
        Ok(())
    }
}

/// Spawn the periodic retention task.
///
/// Runs once shortly after startup, then on the configured interval. Also
/// sweeps the in-memory rate-limit and dedup caches each pass.
pub fn spawn_retention_task(
    compactor: Arc<RetentionCompactor>,
    limits: RateLimitGuard,
    dedup: RequestDedupCache,
    config: RetentionConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !config.enabled {
            tracing::info!("retention task disabled");
            return;
        }

        tracing::info!(
            interval_secs = config.interval_secs,
            initial_delay_secs = config.initial_delay_secs,
            "retention task started"
        );

        tokio::time::sleep(Duration::from_secs(config.initial_delay_secs)).await;

        let mut timer = interval(Duration::from_secs(config.interval_secs));
        loop {
            timer.tick().await;
            let report = compactor.run().await;
            let now = now_ms();
            let limit_entries = limits.cleanup_expired(now);
            let dedup_entries = dedup.cleanup_expired(now);
            tracing::debug!(
                ops_deleted = report.ops_deleted,
                limit_entries_dropped = limit_entries,
                dedup_entries_dropped = dedup_entries,
                "retention tick complete"
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::UploadCoordinator;
    use serde_json::json;
    use sync_core::validate::ValidationConfig;
    use sync_types::{OpKind, Operation};

    const USER: UserId = UserId::new(1);
    const WINDOW_MS: i64 = 30 * 24 * 60 * 60 * 1000;

    fn compactor(store: &SqliteStore, quota_bytes: u64) -> RetentionCompactor {
        RetentionCompactor::new(
            store.clone(),
            StorageQuotaGuard::new(store.clone(), quota_bytes),
            WINDOW_MS,
        )
    }

    fn op(id: &str, kind: OpKind, entity: Option<&str>, counter: u64) -> Operation {
        Operation {
            id: id.to_string(),
            client_id: "client-a".to_string(),
            action_type: "test".to_string(),
            op_kind: kind,
            entity_type: if kind.is_full_state() {
                "ALL".to_string()
            } else {
                "TASK".to_string()
            },
            entity_id: entity.map(str::to_string),
            entity_ids: None,
            payload: json!({"data": "x".repeat(64)}),
            vector_clock: json!({"client-a": counter}),
            timestamp: now_ms(),
            schema_version: 1,
            is_payload_encrypted: false,
        }
    }

    async fn seed(store: &SqliteStore, ops: &[Operation]) {
        let upload = UploadCoordinator::new(store.clone(), ValidationConfig::default());
        for o in ops {
            let results = upload
                .upload_batch(USER, "client-a", std::slice::from_ref(o))
                .await;
            assert!(results[0].accepted, "seed failed: {:?}", results[0]);
        }
    }

    async fn age_ops(store: &SqliteStore, upto_seq: u64, received_at: i64) {
        sqlx::query("UPDATE operations SET received_at = ?1 WHERE user_id = ?2 AND server_seq <= ?3")
            .bind(received_at)
            .bind(USER.value())
            .bind(upto_seq as i64)
            .execute(store.pool())
            .await
            .unwrap();
    }

    async fn set_snapshot(store: &SqliteStore, seq: u64, at: i64) {
        store.ensure_sync_state(store.pool(), USER).await.unwrap();
        store
            .store_snapshot_blob(store.pool(), USER, b"\x1f\x8b", Seq::new(seq), at)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn deletes_only_stale_and_covered_ops() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed(
            &store,
            &[
                op("op-1", OpKind::Create, Some("t1"), 1),
                op("op-2", OpKind::Create, Some("t2"), 2),
                op("op-3", OpKind::Create, Some("t3"), 3),
            ],
        )
        .await;

        // Ops 1-2 are ancient; snapshot covers up to seq 2 and is fresh.
        age_ops(&store, 2, now_ms() - WINDOW_MS - 1000).await;
        set_snapshot(&store, 2, now_ms()).await;

        let report = compactor(&store, u64::MAX).run().await;
        assert_eq!(report.ops_deleted, 2);
        assert_eq!(report.affected_user_ids, vec![USER]);
        assert_eq!(
            store.min_seq(store.pool(), USER).await.unwrap(),
            Some(Seq::new(3))
        );
    }

    #[tokio::test]
    async fn never_deletes_unsnapshotted_history() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed(&store, &[op("op-1", OpKind::Create, Some("t1"), 1)]).await;
        age_ops(&store, 1, now_ms() - WINDOW_MS - 1000).await;
        // No snapshot at all.

        let report = compactor(&store, u64::MAX).run().await;
        assert_eq!(report.ops_deleted, 0);
        assert!(store.min_seq(store.pool(), USER).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_snapshot_blocks_deletion() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed(&store, &[op("op-1", OpKind::Create, Some("t1"), 1)]).await;
        age_ops(&store, 1, now_ms() - WINDOW_MS - 1000).await;
        // The snapshot itself is older than the window, so it cannot
        // vouch for the deleted range.
        set_snapshot(&store, 1, now_ms() - WINDOW_MS - 1000).await;

        let report = compactor(&store, u64::MAX).run().await;
        assert_eq!(report.ops_deleted, 0);
    }

    #[tokio::test]
    async fn ops_newer_than_snapshot_seq_survive() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed(
            &store,
            &[
                op("op-1", OpKind::Create, Some("t1"), 1),
                op("op-2", OpKind::Create, Some("t2"), 2),
            ],
        )
        .await;
        age_ops(&store, 2, now_ms() - WINDOW_MS - 1000).await;
        // Snapshot only covers seq 1; op 2 is stale but uncovered.
        set_snapshot(&store, 1, now_ms()).await;

        let report = compactor(&store, u64::MAX).run().await;
        assert_eq!(report.ops_deleted, 1);
        assert_eq!(
            store.min_seq(store.pool(), USER).await.unwrap(),
            Some(Seq::new(2))
        );
    }

    #[tokio::test]
    async fn stale_devices_are_pruned() {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .upsert_device(store.pool(), USER, "ancient", now_ms() - WINDOW_MS - 1000)
            .await
            .unwrap();
        store
            .upsert_device(store.pool(), USER, "fresh", now_ms())
            .await
            .unwrap();

        let report = compactor(&store, u64::MAX).run().await;
        assert_eq!(report.devices_deleted, 1);
        assert_eq!(store.online_device_count(USER, 0).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn compaction_succeeds_immediately_when_under_quota() {
        let store = SqliteStore::in_memory().await.unwrap();
        let outcome = compactor(&store, 1_000_000)
            .free_storage_for_upload(USER, 10)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.deleted_restore_points, 0);
        assert_eq!(outcome.deleted_ops, 0);
        assert_eq!(outcome.freed_bytes, 0);
    }

    #[tokio::test]
    async fn compaction_fails_without_restore_points() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed(
            &store,
            &[
                op("op-1", OpKind::Create, Some("t1"), 1),
                op("op-2", OpKind::Create, Some("t2"), 2),
            ],
        )
        .await;

        let outcome = compactor(&store, 10)
            .free_storage_for_upload(USER, 10)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.deleted_restore_points, 0);
        assert_eq!(outcome.deleted_ops, 0);
    }

    #[tokio::test]
    async fn compaction_deletes_oldest_points_until_satisfied() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed(
            &store,
            &[
                op("op-1", OpKind::SyncImport, None, 1), // seq 1, oldest point
                op("op-2", OpKind::Create, Some("t2"), 2), // seq 2
                op("op-3", OpKind::SyncImport, None, 3), // seq 3
                op("op-4", OpKind::Create, Some("t4"), 4), // seq 4
                op("op-5", OpKind::SyncImport, None, 5), // seq 5, newest point
            ],
        )
        .await;

        // Each payload is ~75 bytes; quota forces deleting the two oldest
        // restore points (seqs 1-4) but keeping the newest.
        let quota = 100;
        let outcome = compactor(&store, quota)
            .free_storage_for_upload(USER, 0)
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.deleted_restore_points, 2);
        assert_eq!(outcome.deleted_ops, 4);
        assert!(outcome.freed_bytes > 0);
        assert_eq!(
            store.min_seq(store.pool(), USER).await.unwrap(),
            Some(Seq::new(5))
        );
    }

    #[tokio::test]
    async fn compaction_never_deletes_the_last_restore_point() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed(
            &store,
            &[
                op("op-1", OpKind::Create, Some("t1"), 1), // seq 1
                op("op-2", OpKind::SyncImport, None, 2),   // seq 2, first point
                op("op-3", OpKind::Create, Some("t3"), 3), // seq 3
                op("op-4", OpKind::SyncImport, None, 4),   // seq 4, must survive
            ],
        )
        .await;

        // Quota of 0 can never be satisfied.
        let outcome = compactor(&store, 0)
            .free_storage_for_upload(USER, 1)
            .await
            .unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.deleted_restore_points, 1);
        // Ops 1-2 went with the first point, op 3 went in the
        // keep-last-point pass; seq 4 survives as the recovery floor.
        assert_eq!(outcome.deleted_ops, 3);
        let remaining = store
            .ops_after(store.pool(), USER, Seq::zero(), None, 10)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].server_seq, Seq::new(4));
        assert_eq!(remaining[0].op_kind, OpKind::SyncImport);

        // Repeated invocations stop at the same floor instead of deleting it.
        let again = compactor(&store, 0)
            .free_storage_for_upload(USER, 1)
            .await
            .unwrap();
        assert!(!again.success);
        assert_eq!(again.deleted_restore_points, 0);
        assert_eq!(again.deleted_ops, 0);
    }

    #[tokio::test]
    async fn compaction_clears_covered_snapshot_cache() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed(
            &store,
            &[
                op("op-1", OpKind::SyncImport, None, 1),
                op("op-2", OpKind::Create, Some("t2"), 2),
                op("op-3", OpKind::SyncImport, None, 3),
            ],
        )
        .await;
        // Cache sits at the oldest restore point.
        set_snapshot(&store, 1, now_ms()).await;

        compactor(&store, 0).free_storage_for_upload(USER, 1).await.unwrap();

        assert!(store
            .load_snapshot_blob(store.pool(), USER)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn compaction_keeps_cache_ahead_of_deletes() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed(
            &store,
            &[
                op("op-1", OpKind::SyncImport, None, 1),
                op("op-2", OpKind::Create, Some("t2"), 2),
                op("op-3", OpKind::SyncImport, None, 3),
                op("op-4", OpKind::Create, Some("t4"), 4),
            ],
        )
        .await;
        // Cache is newer than anything compaction will delete.
        set_snapshot(&store, 4, now_ms()).await;

        compactor(&store, u64::MAX)
            .free_storage_for_upload(USER, 0)
            .await
            .unwrap();

        assert!(store
            .load_snapshot_blob(store.pool(), USER)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn retention_task_respects_disabled_flag() {
        let store = SqliteStore::in_memory().await.unwrap();
        let compactor = Arc::new(compactor(&store, u64::MAX));
        let limits = RateLimitGuard::new(&crate::config::LimitsConfig::default());
        let dedup = RequestDedupCache::new(&crate::config::LimitsConfig::default());
        let config = RetentionConfig {
            enabled: false,
            ..RetentionConfig::default()
        };

        let handle = spawn_retention_task(compactor, limits, dedup, config);
        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("task should exit when disabled")
            .expect("task should not panic");
    }
}
