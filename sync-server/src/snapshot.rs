//! Snapshot engine: materializes projected state by replaying the log.
//!
//! A cached snapshot (gzip-compressed JSON on the user's sync-state row)
//! makes generation incremental: only operations past the cached sequence
//! are replayed. The cache is invalidated implicitly, staleness being decided
//! purely by comparing sequences.

use crate::config::SnapshotConfig;
use crate::error::{SnapshotError, StorageResult};
use crate::storage::{now_ms, SnapshotBlob, SqliteStore};
use dashmap::DashMap;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use std::io::Read;
use std::sync::Arc;
use sync_core::Projection;
use sync_types::{OpKind, RestorePoint, Seq, SnapshotResponse, UserId};

/// Materializes and caches projected state for users.
#[derive(Clone)]
pub struct SnapshotEngine {
    store: SqliteStore,
    config: SnapshotConfig,
    /// Per-user in-flight generation locks. Concurrent snapshot requests
    /// for the same user queue here instead of replaying twice; the second
    /// request finds a fresh cache and returns quickly.
    generation_locks: Arc<DashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl SnapshotEngine {
    /// Create an engine over the given store.
    pub fn new(store: SqliteStore, config: SnapshotConfig) -> Self {
        Self {
            store,
            config,
            generation_locks: Arc::new(DashMap::new()),
        }
    }

    /// The cached snapshot, if present and readable.
    ///
    /// Oversized or corrupt cache blobs are discarded rather than served;
    /// callers fall back to a full rebuild.
    pub async fn cached(&self, user: UserId) -> StorageResult<Option<SnapshotResponse>> {
        let blob = self.store.load_snapshot_blob(self.store.pool(), user).await?;
        Ok(blob.and_then(|blob| self.decode_blob(user, &blob)))
    }

    /// Generate the snapshot at the user's current high-water mark,
    /// replaying incrementally from the cached state when possible.
    pub async fn generate(&self, user: UserId) -> Result<SnapshotResponse, SnapshotError> {
        let lock = self
            .generation_locks
            .entry(user.value())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.generate_locked(user).await
        };
        // Drop the lock slot once nobody else is queued on it, so the map
        // tracks in-flight users rather than every user ever seen.
        self.generation_locks
            .remove_if(&user.value(), |_, slot| Arc::strong_count(slot) == 2);
        result
    }

    async fn generate_locked(&self, user: UserId) -> Result<SnapshotResponse, SnapshotError> {
        let mut tx = self.store.begin().await.map_err(SnapshotError::Storage)?;

        let latest_seq = self.store.last_seq(&mut *tx, user).await?;

        let (mut state, start_seq, had_cache) = match self
            .store
            .load_snapshot_blob(&mut *tx, user)
            .await?
            .and_then(|blob| self.decode_projection(user, &blob))
        {
            Some((projection, seq)) => (projection, seq, true),
            None => (Projection::new(), Seq::zero(), false),
        };

        if had_cache && start_seq >= latest_seq {
            tx.commit().await.map_err(crate::error::StorageError::Database)?;
            return Ok(SnapshotResponse {
                state: state.to_value(),
                server_seq: start_seq,
                generated_at: now_ms(),
            });
        }

        let to_replay = latest_seq.value().saturating_sub(start_seq.value());
        if to_replay > self.config.max_ops_per_snapshot {
            return Err(SnapshotError::TooManyOps {
                count: to_replay,
                max: self.config.max_ops_per_snapshot,
            });
        }

        self.replay_range(&mut tx, user, &mut state, start_seq, latest_seq)
            .await?;

        let generated_at = now_ms();
        let state_value = state.to_value();
        let compressed = compress(&state_value);
        if compressed.len() <= self.config.max_compressed_bytes {
            self.store.ensure_sync_state(&mut *tx, user).await?;
            self.store
                .store_snapshot_blob(&mut *tx, user, &compressed, latest_seq, generated_at)
                .await?;
        } else {
            tracing::error!(
                user_id = user.value(),
                size = compressed.len(),
                limit = self.config.max_compressed_bytes,
                "snapshot too large to cache, serving uncached"
            );
        }

        tx.commit().await.map_err(crate::error::StorageError::Database)?;

        Ok(SnapshotResponse {
            state: state_value,
            server_seq: latest_seq,
            generated_at,
        })
    }

    /// Reconstruct the state as of `target_seq` (point-in-time restore).
    ///
    /// The result is not cached; restores are rare and must not displace
    /// the incremental cache at the head of the log.
    pub async fn generate_at_seq(
        &self,
        user: UserId,
        target_seq: Seq,
    ) -> Result<SnapshotResponse, SnapshotError> {
        if target_seq.value() < 1 {
            return Err(SnapshotError::SeqTooLow);
        }

        let mut tx = self.store.begin().await.map_err(SnapshotError::Storage)?;

        let latest_seq = self.store.last_seq(&mut *tx, user).await?;
        if target_seq > latest_seq {
            return Err(SnapshotError::SeqBeyondLatest {
                target: target_seq,
                latest: latest_seq,
            });
        }

        // Use the cache as the replay base only when it predates the target.
        let (mut state, start_seq) = match self
            .store
            .load_snapshot_blob(&mut *tx, user)
            .await?
            .filter(|blob| blob.seq <= target_seq)
            .and_then(|blob| self.decode_projection(user, &blob))
        {
            Some((projection, seq)) => (projection, seq),
            None => (Projection::new(), Seq::zero()),
        };

        let to_replay = target_seq.value().saturating_sub(start_seq.value());
        if to_replay > self.config.max_ops_per_snapshot {
            return Err(SnapshotError::TooManyOps {
                count: to_replay,
                max: self.config.max_ops_per_snapshot,
            });
        }

        // Encrypted payloads are opaque; a restore that covers them would
        // silently produce wrong state, so refuse instead.
        let encrypted = self
            .store
            .count_encrypted_in_range(&mut *tx, user, start_seq, target_seq)
            .await?;
        if encrypted > 0 {
            return Err(SnapshotError::EncryptedOps { count: encrypted });
        }

        self.replay_range(&mut tx, user, &mut state, start_seq, target_seq)
            .await?;

        tx.commit().await.map_err(crate::error::StorageError::Database)?;

        Ok(SnapshotResponse {
            state: state.to_value(),
            server_seq: target_seq,
            generated_at: now_ms(),
        })
    }

    /// Full-state operations as named rollback checkpoints, newest first.
    pub async fn restore_points(
        &self,
        user: UserId,
        limit: u32,
    ) -> StorageResult<Vec<RestorePoint>> {
        let ops = self
            .store
            .full_state_ops(self.store.pool(), user, limit)
            .await?;
        Ok(ops
            .into_iter()
            .map(|op| RestorePoint {
                server_seq: op.server_seq,
                timestamp: op.timestamp,
                kind: op.kind,
                client_id: op.client_id,
                description: describe_restore_point(op.kind).to_string(),
            })
            .collect())
    }

    /// Cache a known-good state (used after a snapshot upload was accepted
    /// through the normal operation path).
    pub async fn cache_state(
        &self,
        user: UserId,
        state: &Value,
        server_seq: Seq,
    ) -> StorageResult<()> {
        let compressed = compress(state);
        if compressed.len() > self.config.max_compressed_bytes {
            tracing::error!(
                user_id = user.value(),
                size = compressed.len(),
                limit = self.config.max_compressed_bytes,
                "snapshot too large, skipping cache"
            );
            return Ok(());
        }
        self.store
            .ensure_sync_state(self.store.pool(), user)
            .await?;
        self.store
            .store_snapshot_blob(self.store.pool(), user, &compressed, server_seq, now_ms())
            .await
    }

    async fn replay_range(
        &self,
        tx: &mut sqlx::Transaction<'static, sqlx::Sqlite>,
        user: UserId,
        state: &mut Projection,
        from: Seq,
        upto: Seq,
    ) -> Result<(), SnapshotError> {
        let mut current = from;
        let mut skipped_encrypted = 0u64;

        while current < upto {
            let batch = self
                .store
                .ops_in_range(&mut **tx, user, current, upto, self.config.replay_batch_size)
                .await?;
            let Some(last) = batch.last() else {
                break;
            };
            current = last.server_seq;
            for op in &batch {
                if !state.apply(op) {
                    skipped_encrypted += 1;
                }
            }
        }

        if skipped_encrypted > 0 {
            tracing::warn!(
                user_id = user.value(),
                skipped = skipped_encrypted,
                "skipped encrypted operations during snapshot replay"
            );
        }
        Ok(())
    }

    fn decode_blob(&self, user: UserId, blob: &SnapshotBlob) -> Option<SnapshotResponse> {
        let (projection, seq) = self.decode_projection(user, blob)?;
        Some(SnapshotResponse {
            state: projection.to_value(),
            server_seq: seq,
            generated_at: blob.generated_at,
        })
    }

    fn decode_projection(
        &self,
        user: UserId,
        blob: &SnapshotBlob,
    ) -> Option<(Projection, Seq)> {
        let bytes = match decompress(&blob.data, self.config.max_decompressed_bytes) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(
                    user_id = user.value(),
                    error = %err,
                    "discarding unreadable cached snapshot"
                );
                return None;
            }
        };
        match serde_json::from_slice::<Value>(&bytes)
            .map_err(|e| e.to_string())
            .and_then(|v| Projection::from_value(v).map_err(|e| e.to_string()))
        {
            Ok(projection) => Some((projection, blob.seq)),
            Err(err) => {
                tracing::error!(
                    user_id = user.value(),
                    error = %err,
                    "discarding corrupt cached snapshot"
                );
                None
            }
        }
    }
}

/// Human-readable label for a restore point kind.
pub fn describe_restore_point(kind: OpKind) -> &'static str {
    match kind {
        OpKind::SyncImport => "Full sync import",
        OpKind::BackupImport => "Backup restore",
        OpKind::Repair => "Auto-repair",
        _ => "State snapshot",
    }
}

fn compress(state: &Value) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    serde_json::to_writer(&mut encoder, state).expect("projection serializes");
    encoder.finish().expect("gzip in-memory write")
}

fn decompress(data: &[u8], max_bytes: usize) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data).take(max_bytes as u64 + 1);
    let mut bytes = Vec::new();
    decoder.read_to_end(&mut bytes)?;
    if bytes.len() > max_bytes {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "decompressed snapshot exceeds size ceiling",
        ));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::UploadCoordinator;
    use serde_json::json;
    use sync_core::validate::ValidationConfig;
    use sync_types::Operation;

    const USER: UserId = UserId::new(1);

    fn engine(store: &SqliteStore) -> SnapshotEngine {
        SnapshotEngine::new(store.clone(), SnapshotConfig::default())
    }

    fn op(id: &str, kind: OpKind, entity: Option<&str>, payload: Value, counter: u64) -> Operation {
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
            payload,
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

    #[tokio::test]
    async fn empty_user_generates_empty_state() {
        let store = SqliteStore::in_memory().await.unwrap();
        let snapshot = engine(&store).generate(USER).await.unwrap();
        assert_eq!(snapshot.server_seq, Seq::zero());
        assert_eq!(snapshot.state, json!({}));
    }

    #[tokio::test]
    async fn generate_replays_crud_chain() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed(
            &store,
            &[
                op("op-1", OpKind::Create, Some("t1"), json!({"title": "a", "done": false}), 1),
                op("op-2", OpKind::Update, Some("t1"), json!({"done": true}), 2),
                op("op-3", OpKind::Create, Some("t2"), json!({"title": "b"}), 3),
                op("op-4", OpKind::Delete, Some("t2"), json!(null), 4),
            ],
        )
        .await;

        let snapshot = engine(&store).generate(USER).await.unwrap();
        assert_eq!(snapshot.server_seq, Seq::new(4));
        assert_eq!(
            snapshot.state,
            json!({"TASK": {"t1": {"title": "a", "done": true}}})
        );
    }

    #[tokio::test]
    async fn generate_is_incremental_over_the_cache() {
        let store = SqliteStore::in_memory().await.unwrap();
        let engine = engine(&store);

        seed(
            &store,
            &[op("op-1", OpKind::Create, Some("t1"), json!({"title": "a"}), 1)],
        )
        .await;
        let first = engine.generate(USER).await.unwrap();
        assert_eq!(first.server_seq, Seq::new(1));

        // The cache now sits at seq 1; the next generation replays only op 2.
        seed(
            &store,
            &[op("op-2", OpKind::Update, Some("t1"), json!({"done": true}), 2)],
        )
        .await;
        let second = engine.generate(USER).await.unwrap();
        assert_eq!(second.server_seq, Seq::new(2));
        assert_eq!(
            second.state,
            json!({"TASK": {"t1": {"title": "a", "done": true}}})
        );

        let cached = engine.cached(USER).await.unwrap().unwrap();
        assert_eq!(cached.server_seq, Seq::new(2));
    }

    #[tokio::test]
    async fn full_state_import_supersedes_history() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed(
            &store,
            &[
                op("op-1", OpKind::Create, Some("t1"), json!({"title": "old"}), 1),
                op(
                    "op-2",
                    OpKind::SyncImport,
                    None,
                    json!({"PROJECT": {"p1": {"name": "fresh"}}}),
                    2,
                ),
            ],
        )
        .await;

        let snapshot = engine(&store).generate(USER).await.unwrap();
        assert_eq!(
            snapshot.state,
            json!({"PROJECT": {"p1": {"name": "fresh"}}})
        );
    }

    #[tokio::test]
    async fn generate_at_seq_truncates_replay() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed(
            &store,
            &[
                op("op-1", OpKind::Create, Some("t1"), json!({"title": "a"}), 1),
                op("op-2", OpKind::Update, Some("t1"), json!({"done": true}), 2),
                op("op-3", OpKind::Delete, Some("t1"), json!(null), 3),
            ],
        )
        .await;

        let at_two = engine(&store).generate_at_seq(USER, Seq::new(2)).await.unwrap();
        assert_eq!(at_two.server_seq, Seq::new(2));
        assert_eq!(
            at_two.state,
            json!({"TASK": {"t1": {"title": "a", "done": true}}})
        );
    }

    #[tokio::test]
    async fn generate_at_seq_validates_bounds() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed(
            &store,
            &[op("op-1", OpKind::Create, Some("t1"), json!({"title": "a"}), 1)],
        )
        .await;
        let engine = engine(&store);

        assert!(matches!(
            engine.generate_at_seq(USER, Seq::zero()).await,
            Err(SnapshotError::SeqTooLow)
        ));
        assert!(matches!(
            engine.generate_at_seq(USER, Seq::new(5)).await,
            Err(SnapshotError::SeqBeyondLatest { .. })
        ));
    }

    #[tokio::test]
    async fn generate_at_seq_refuses_encrypted_ranges() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut encrypted = op("op-1", OpKind::Create, Some("t1"), json!("ciphertext"), 1);
        encrypted.is_payload_encrypted = true;
        seed(&store, &[encrypted]).await;

        let err = engine(&store)
            .generate_at_seq(USER, Seq::new(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::EncryptedOps { count: 1 }));
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn restore_points_are_listed_newest_first() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed(
            &store,
            &[
                op("op-1", OpKind::SyncImport, None, json!({}), 1),
                op("op-2", OpKind::Create, Some("t1"), json!({"title": "a"}), 2),
                op("op-3", OpKind::BackupImport, None, json!({}), 3),
            ],
        )
        .await;

        let points = engine(&store).restore_points(USER, 10).await.unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].server_seq, Seq::new(3));
        assert_eq!(points[0].kind, OpKind::BackupImport);
        assert_eq!(points[0].description, "Backup restore");
        assert_eq!(points[1].server_seq, Seq::new(1));
        assert_eq!(points[1].description, "Full sync import");
    }

    #[tokio::test]
    async fn oversized_snapshot_is_served_but_not_cached() {
        let store = SqliteStore::in_memory().await.unwrap();
        let config = SnapshotConfig {
            max_compressed_bytes: 8, // absurdly small: nothing fits
            ..SnapshotConfig::default()
        };
        let engine = SnapshotEngine::new(store.clone(), config);

        seed(
            &store,
            &[op("op-1", OpKind::Create, Some("t1"), json!({"title": "a"}), 1)],
        )
        .await;

        let snapshot = engine.generate(USER).await.unwrap();
        assert_eq!(snapshot.server_seq, Seq::new(1));
        assert!(engine.cached(USER).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_cache_blob_is_discarded_and_rebuilt() {
        let store = SqliteStore::in_memory().await.unwrap();
        seed(
            &store,
            &[op("op-1", OpKind::Create, Some("t1"), json!({"title": "a"}), 1)],
        )
        .await;

        // Plant garbage where the cache blob lives.
        store
            .store_snapshot_blob(store.pool(), USER, b"not gzip at all", Seq::new(1), 1)
            .await
            .unwrap();

        let engine = engine(&store);
        assert!(engine.cached(USER).await.unwrap().is_none());

        let snapshot = engine.generate(USER).await.unwrap();
        assert_eq!(
            snapshot.state,
            json!({"TASK": {"t1": {"title": "a"}}})
        );
    }

    #[tokio::test]
    async fn compress_roundtrip() {
        let value = json!({"TASK": {"t1": {"title": "hello"}}});
        let packed = compress(&value);
        let bytes = decompress(&packed, 1024 * 1024).unwrap();
        let back: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, value);
    }

    #[tokio::test]
    async fn decompress_caps_output_size() {
        let value = json!({"data": "x".repeat(4096)});
        let packed = compress(&value);
        assert!(decompress(&packed, 16).is_err());
    }
}
