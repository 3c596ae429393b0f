//! Download service: serves operations since a client-provided sequence,
//! with gap detection and the snapshot-skip optimization.

use crate::config::LimitsConfig;
use crate::error::StorageResult;
use crate::storage::{now_ms, SqliteStore};
use sync_types::{DownloadOpsResponse, Seq, UserId};

/// Serves the read path of the sync protocol.
#[derive(Clone)]
pub struct DownloadService {
    store: SqliteStore,
    default_limit: u32,
    max_limit: u32,
}

impl DownloadService {
    /// Create a download service over the given store.
    pub fn new(store: SqliteStore, limits: &LimitsConfig) -> Self {
        Self {
            store,
            default_limit: limits.default_download_limit,
            max_limit: limits.max_download_limit,
        }
    }

    /// Operations after `since_seq`, with pagination, gap detection, and
    /// snapshot-skip.
    ///
    /// All reads happen inside one transaction so the page, the high-water
    /// mark, and the gap verdict describe the same instant.
    pub async fn get_ops_since(
        &self,
        user: UserId,
        since_seq: Seq,
        exclude_client: Option<&str>,
        limit: Option<u32>,
    ) -> StorageResult<DownloadOpsResponse> {
        let limit = limit
            .unwrap_or(self.default_limit)
            .clamp(1, self.max_limit);

        let mut tx = self.store.begin().await?;

        let latest_seq = self.store.last_seq(&mut *tx, user).await?;
        let full_state_seq = self.store.latest_full_state_seq(&mut *tx, user).await?;

        // Snapshot-skip: when the client is behind the newest restore
        // point, start them at the restore point itself instead of sending
        // superseded pre-restore history.
        let mut effective_since = since_seq;
        let mut snapshot_vector_clock = None;
        if let Some(snap_seq) = full_state_seq {
            let restart_from = Seq::new(snap_seq.value().saturating_sub(1));
            if since_seq < restart_from {
                effective_since = restart_from;
                snapshot_vector_clock = Some(
                    self.store
                        .merged_clock_through(&mut *tx, user, restart_from)
                        .await?,
                );
                tracing::debug!(
                    user_id = user.value(),
                    since_seq = since_seq.value(),
                    snapshot_seq = snap_seq.value(),
                    "snapshot-skip raised download start point"
                );
            }
        }

        // Fetch one extra row to learn whether more pages remain.
        let mut ops = self
            .store
            .ops_after(&mut *tx, user, effective_since, exclude_client, limit + 1)
            .await?;
        let has_more = ops.len() as u32 > limit;
        if has_more {
            ops.truncate(limit as usize);
        }

        let mut gap_detected = false;
        // A fresh client (sinceSeq == 0) cannot have a gap by definition.
        if since_seq.value() > 0 {
            if since_seq > latest_seq {
                // Client is ahead of the server: data loss or reset on our side.
                gap_detected = true;
                tracing::warn!(
                    user_id = user.value(),
                    since_seq = since_seq.value(),
                    latest_seq = latest_seq.value(),
                    "gap: client is ahead of server log"
                );
            }

            // Retention deleted operations the client never saw. This check
            // holds even with exclude_client: deletions are not attributable
            // to the excluded client.
            if latest_seq.value() > 0 {
                if let Some(min_seq) = self.store.min_seq(&mut *tx, user).await? {
                    if since_seq.value() + 1 < min_seq.value() {
                        gap_detected = true;
                        tracing::warn!(
                            user_id = user.value(),
                            since_seq = since_seq.value(),
                            min_seq = min_seq.value(),
                            "gap: oldest retained op is beyond client position"
                        );
                    }
                }

                // A jump at the head of the page. Skipped when
                // exclude_client is set (the missing rows may simply be the
                // client's own), and measured against the effective start so
                // snapshot-skip doesn't read as data loss.
                if exclude_client.is_none() {
                    if let Some(first) = ops.first() {
                        if first.server_seq.value() > effective_since.value() + 1 {
                            gap_detected = true;
                            tracing::warn!(
                                user_id = user.value(),
                                expected = effective_since.value() + 1,
                                got = first.server_seq.value(),
                                "gap: missing run at head of page"
                            );
                        }
                    }
                }
            }
        }

        tx.commit().await?;

        Ok(DownloadOpsResponse {
            ops,
            has_more,
            latest_seq,
            gap_detected: gap_detected.then_some(true),
            latest_snapshot_seq: full_state_seq,
            snapshot_vector_clock,
            server_time: now_ms(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::UploadCoordinator;
    use serde_json::json;
    use sync_core::validate::ValidationConfig;
    use sync_types::{OpKind, Operation};

    const USER: UserId = UserId::new(1);

    fn service(store: &SqliteStore) -> DownloadService {
        DownloadService::new(store.clone(), &LimitsConfig::default())
    }

    fn op(id: &str, client: &str, entity: &str, counter: u64) -> Operation {
        Operation {
            id: id.to_string(),
            client_id: client.to_string(),
            action_type: "test".to_string(),
            op_kind: OpKind::Update,
            entity_type: "TASK".to_string(),
            entity_id: Some(entity.to_string()),
            entity_ids: None,
            payload: json!({"title": id}),
            vector_clock: json!({ (client): counter }),
            timestamp: now_ms(),
            schema_version: 1,
            is_payload_encrypted: false,
        }
    }

    fn import_op(id: &str, client: &str, counter: u64) -> Operation {
        Operation {
            id: id.to_string(),
            client_id: client.to_string(),
            action_type: "import".to_string(),
            op_kind: OpKind::SyncImport,
            entity_type: "ALL".to_string(),
            entity_id: None,
            entity_ids: None,
            payload: json!({"TASK": {}}),
            vector_clock: json!({ (client): counter }),
            timestamp: now_ms(),
            schema_version: 1,
            is_payload_encrypted: false,
        }
    }

    async fn seed(store: &SqliteStore, ops: &[Operation]) {
        let upload = UploadCoordinator::new(store.clone(), ValidationConfig::default());
        for o in ops {
            let client = o.client_id.clone();
            let results = upload.upload_batch(USER, &client, std::slice::from_ref(o)).await;
            assert!(results[0].accepted, "seed failed: {:?}", results[0]);
        }
    }

    async fn delete_seqs(store: &SqliteStore, seqs: &[u64]) {
        for seq in seqs {
            sqlx::query("DELETE FROM operations WHERE user_id = ?1 AND server_seq = ?2")
                .bind(USER.value())
                .bind(*seq as i64)
                .execute(store.pool())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn fresh_client_never_sees_a_gap() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed(
            &store,
            &[op("op-1", "a", "t1", 1), op("op-2", "a", "t2", 1)],
        )
        .await;

        let resp = service(&store)
            .get_ops_since(USER, Seq::zero(), None, None)
            .await
            .unwrap();
        assert_eq!(resp.ops.len(), 2);
        assert_eq!(resp.latest_seq, Seq::new(2));
        assert!(resp.gap_detected.is_none());
    }

    #[tokio::test]
    async fn continuous_log_has_no_gap() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed(
            &store,
            &[
                op("op-1", "a", "t1", 1),
                op("op-2", "a", "t2", 1),
                op("op-3", "a", "t3", 1),
            ],
        )
        .await;

        let resp = service(&store)
            .get_ops_since(USER, Seq::new(1), None, None)
            .await
            .unwrap();
        assert!(resp.gap_detected.is_none());
        assert_eq!(resp.ops.len(), 2);
        assert_eq!(resp.ops[0].server_seq, Seq::new(2));
    }

    #[tokio::test]
    async fn middle_deletion_is_a_gap() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed(
            &store,
            &[
                op("op-1", "a", "t1", 1),
                op("op-2", "a", "t2", 1),
                op("op-3", "a", "t3", 1),
                op("op-4", "a", "t4", 1),
            ],
        )
        .await;
        delete_seqs(&store, &[2, 3]).await;

        let resp = service(&store)
            .get_ops_since(USER, Seq::new(1), None, None)
            .await
            .unwrap();
        assert_eq!(resp.gap_detected, Some(true));
        assert_eq!(resp.ops.len(), 1);
        assert_eq!(resp.ops[0].server_seq, Seq::new(4));
    }

    #[tokio::test]
    async fn purged_prefix_is_a_gap() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed(
            &store,
            &[
                op("op-1", "a", "t1", 1),
                op("op-2", "a", "t2", 1),
                op("op-3", "a", "t3", 1),
                op("op-4", "a", "t4", 1),
            ],
        )
        .await;
        store.delete_ops_up_to(USER, Seq::new(2)).await.unwrap();

        let resp = service(&store)
            .get_ops_since(USER, Seq::new(1), None, None)
            .await
            .unwrap();
        assert_eq!(resp.gap_detected, Some(true));
        assert_eq!(resp.ops.len(), 2);
    }

    #[tokio::test]
    async fn purged_prefix_gap_survives_exclude_client() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed(
            &store,
            &[
                op("op-1", "a", "t1", 1),
                op("op-2", "a", "t2", 1),
                op("op-3", "b", "t3", 1),
            ],
        )
        .await;
        store.delete_ops_up_to(USER, Seq::new(2)).await.unwrap();

        // The min-seq check is not attributable to the excluded client.
        let resp = service(&store)
            .get_ops_since(USER, Seq::new(1), Some("b"), None)
            .await
            .unwrap();
        assert_eq!(resp.gap_detected, Some(true));
    }

    #[tokio::test]
    async fn client_ahead_of_server_is_a_gap() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed(&store, &[op("op-1", "a", "t1", 1)]).await;

        let resp = service(&store)
            .get_ops_since(USER, Seq::new(9), None, None)
            .await
            .unwrap();
        assert_eq!(resp.gap_detected, Some(true));
        assert!(resp.ops.is_empty());
    }

    #[tokio::test]
    async fn client_with_history_against_empty_server_is_a_gap() {
        let store = SqliteStore::in_memory().await.unwrap();

        let resp = service(&store)
            .get_ops_since(USER, Seq::new(5), None, None)
            .await
            .unwrap();
        assert_eq!(resp.gap_detected, Some(true));
        assert_eq!(resp.latest_seq, Seq::zero());
    }

    #[tokio::test]
    async fn own_client_jump_is_not_a_gap() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed(
            &store,
            &[
                op("op-1", "a", "t1", 1),
                op("op-2", "a", "t2", 1),
                op("op-3", "b", "t3", 1),
            ],
        )
        .await;

        // From seq 1 excluding client a, the next row is seq 3. The jump is
        // attributable to a's own ops, so it must not read as data loss.
        let resp = service(&store)
            .get_ops_since(USER, Seq::new(1), Some("a"), None)
            .await
            .unwrap();
        assert!(resp.gap_detected.is_none());
        assert_eq!(resp.ops.len(), 1);
        assert_eq!(resp.ops[0].server_seq, Seq::new(3));
    }

    #[tokio::test]
    async fn pagination_sets_has_more() {
        let store = SqliteStore::in_memory().await.unwrap();
        let ops: Vec<Operation> = (0..5)
            .map(|i| op(&format!("op-{i}"), "a", &format!("t{i}"), 1))
            .collect();
        seed(&store, &ops).await;

        let resp = service(&store)
            .get_ops_since(USER, Seq::zero(), None, Some(3))
            .await
            .unwrap();
        assert_eq!(resp.ops.len(), 3);
        assert!(resp.has_more);

        let rest = service(&store)
            .get_ops_since(USER, resp.ops.last().unwrap().server_seq, None, Some(3))
            .await
            .unwrap();
        assert_eq!(rest.ops.len(), 2);
        assert!(!rest.has_more);
    }

    #[tokio::test]
    async fn snapshot_skip_starts_at_restore_point() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed(
            &store,
            &[
                op("op-1", "a", "t1", 1),
                op("op-2", "a", "t2", 1),
                import_op("op-3", "a", 2),
                op("op-4", "a", "t4", 3),
            ],
        )
        .await;

        let resp = service(&store)
            .get_ops_since(USER, Seq::zero(), None, None)
            .await
            .unwrap();

        // Client receives the restore point itself plus everything after,
        // never the superseded history.
        assert_eq!(resp.ops.len(), 2);
        assert_eq!(resp.ops[0].server_seq, Seq::new(3));
        assert_eq!(resp.ops[0].op_kind, OpKind::SyncImport);
        assert_eq!(resp.latest_snapshot_seq, Some(Seq::new(3)));
        assert!(resp.gap_detected.is_none());

        // The skipped ops' clocks are aggregated for the client.
        let clock = resp.snapshot_vector_clock.unwrap();
        assert_eq!(clock.get("a"), 1);
    }

    #[tokio::test]
    async fn snapshot_skip_leaves_caught_up_clients_alone() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed(
            &store,
            &[
                op("op-1", "a", "t1", 1),
                import_op("op-2", "a", 2),
                op("op-3", "a", "t3", 3),
            ],
        )
        .await;

        // Client already past the restore point: start point untouched.
        let resp = service(&store)
            .get_ops_since(USER, Seq::new(2), None, None)
            .await
            .unwrap();
        assert_eq!(resp.ops.len(), 1);
        assert_eq!(resp.ops[0].server_seq, Seq::new(3));
        assert!(resp.snapshot_vector_clock.is_none());
        assert!(resp.gap_detected.is_none());
    }

    #[tokio::test]
    async fn snapshot_skip_jump_is_not_a_gap() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed(
            &store,
            &[
                op("op-1", "a", "t1", 1),
                op("op-2", "a", "t2", 1),
                op("op-3", "a", "t3", 1),
                import_op("op-4", "a", 2),
                op("op-5", "a", "t5", 3),
            ],
        )
        .await;

        // since=1 would naively expect seq 2 next; the skip delivers 4.
        let resp = service(&store)
            .get_ops_since(USER, Seq::new(1), None, None)
            .await
            .unwrap();
        assert!(resp.gap_detected.is_none());
        assert_eq!(resp.ops[0].server_seq, Seq::new(4));
    }

    #[tokio::test]
    async fn real_gap_after_snapshot_is_still_detected() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed(
            &store,
            &[
                import_op("op-1", "a", 1),
                op("op-2", "a", "t2", 2),
                op("op-3", "a", "t3", 3),
                op("op-4", "a", "t4", 4),
            ],
        )
        .await;
        delete_seqs(&store, &[3]).await;

        let resp = service(&store)
            .get_ops_since(USER, Seq::new(2), None, None)
            .await
            .unwrap();
        assert_eq!(resp.gap_detected, Some(true));
    }
}
