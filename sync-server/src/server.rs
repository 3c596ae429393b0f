//! Main SyncServer coordination.
//!
//! `SyncServer` owns storage and every engine component, and is handed to
//! request handlers explicitly. There is no process-wide singleton, so
//! tests construct one over an in-memory store and swap nothing.

use crate::config::Config;
use crate::dedup::RequestDedupCache;
use crate::download::DownloadService;
use crate::error::ServerError;
use crate::limits::RateLimitGuard;
use crate::quota::StorageQuotaGuard;
use crate::retention::RetentionCompactor;
use crate::snapshot::SnapshotEngine;
use crate::storage::{now_ms, SqliteStore};
use crate::upload::UploadCoordinator;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use sync_core::payload::serialized_size;
use sync_types::{
    Operation, OpKind, Seq, SnapshotUploadRequest, SnapshotUploadResponse, StatusResponse,
    UploadOpsRequest, UploadOpsResponse, UserId, WILDCARD_ENTITY_TYPE,
};

/// Operational metrics for monitoring sync activity.
///
/// All counters are monotonically increasing (reset only on restart).
/// Thread-safe via `AtomicU64` — no locks needed for incrementing.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    /// Total upload requests handled.
    pub uploads_total: AtomicU64,
    /// Total operations accepted and stored.
    pub ops_accepted: AtomicU64,
    /// Total operations rejected (validation, conflict, duplicate).
    pub ops_rejected: AtomicU64,
    /// Total download requests handled.
    pub downloads_total: AtomicU64,
    /// Total snapshot requests served (cached or generated).
    pub snapshots_served: AtomicU64,
    /// Total requests rejected by rate limiting.
    pub rate_limit_hits: AtomicU64,
    /// Total upload retries answered from the dedup cache.
    pub dedup_hits: AtomicU64,
    /// Total uploads rejected for storage quota.
    pub quota_rejections: AtomicU64,
    /// Total unexpected server errors.
    pub errors_total: AtomicU64,
}

/// Why an upload was rejected before any operation was attempted.
#[derive(Debug)]
pub enum UploadRejection {
    /// Per-user or global rate limit exceeded.
    RateLimited,
    /// The batch exceeds the configured operation count.
    BatchTooLarge {
        /// Configured maximum.
        max: usize,
    },
    /// The user is out of storage and compaction could not free enough.
    QuotaExceeded {
        /// Current usage in bytes.
        used: u64,
        /// Configured quota in bytes.
        quota: u64,
    },
    /// Unexpected server-side failure.
    Internal(ServerError),
}

impl From<ServerError> for UploadRejection {
    fn from(err: ServerError) -> Self {
        UploadRejection::Internal(err)
    }
}

impl From<crate::error::StorageError> for UploadRejection {
    fn from(err: crate::error::StorageError) -> Self {
        UploadRejection::Internal(err.into())
    }
}

/// The sync engine behind the HTTP surface.
pub struct SyncServer {
    config: Config,
    store: SqliteStore,
    upload: UploadCoordinator,
    download: DownloadService,
    snapshots: SnapshotEngine,
    compactor: Arc<RetentionCompactor>,
    quota: StorageQuotaGuard,
    limits: RateLimitGuard,
    dedup: RequestDedupCache,
    metrics: SyncMetrics,
}

impl std::fmt::Debug for SyncServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncServer")
            .field("config", &self.config)
            .field("limits", &self.limits)
            .field("dedup", &self.dedup)
            .finish_non_exhaustive()
    }
}

impl SyncServer {
    /// Wire up every component over one store.
    pub fn new(config: Config, store: SqliteStore) -> Self {
        let quota = StorageQuotaGuard::new(store.clone(), config.storage.quota_bytes);
        let upload = UploadCoordinator::new(store.clone(), config.validation());
        let download = DownloadService::new(store.clone(), &config.limits);
        let snapshots = SnapshotEngine::new(store.clone(), config.snapshot.clone());
        let compactor = Arc::new(RetentionCompactor::new(
            store.clone(),
            quota.clone(),
            config.retention_window_ms(),
        ));
        let limits = RateLimitGuard::new(&config.limits);
        let dedup = RequestDedupCache::new(&config.limits);

        Self {
            config,
            store,
            upload,
            download,
            snapshots,
            compactor,
            quota,
            limits,
            dedup,
            metrics: SyncMetrics::default(),
        }
    }

    /// Server configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The storage layer.
    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    /// The download service.
    pub fn download(&self) -> &DownloadService {
        &self.download
    }

    /// The snapshot engine.
    pub fn snapshots(&self) -> &SnapshotEngine {
        &self.snapshots
    }

    /// The retention compactor (shared with the background task).
    pub fn compactor(&self) -> Arc<RetentionCompactor> {
        self.compactor.clone()
    }

    /// The rate-limit guard (shared with the background task).
    pub fn limits(&self) -> RateLimitGuard {
        self.limits.clone()
    }

    /// The dedup cache (shared with the background task).
    pub fn dedup(&self) -> RequestDedupCache {
        self.dedup.clone()
    }

    /// Operational metrics.
    pub fn metrics(&self) -> &SyncMetrics {
        &self.metrics
    }

    /// The full upload pipeline: rate limit, dedup, quota, batch, piggyback.
    pub async fn handle_upload(
        &self,
        user: UserId,
        req: UploadOpsRequest,
    ) -> Result<UploadOpsResponse, UploadRejection> {
        self.metrics.uploads_total.fetch_add(1, Ordering::Relaxed);
        let now = now_ms();

        // Rate limits come before deduplication so a retry storm cannot
        // bypass them by replaying a cached request id.
        if let Err(err) = self
            .limits
            .check_global()
            .and_then(|()| self.limits.check_upload(user, now))
        {
            self.metrics.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                event = "rate_limited",
                user_id = user.value(),
                client_id = %req.client_id,
                reason = %err,
                "upload rejected by rate limit"
            );
            return Err(UploadRejection::RateLimited);
        }

        let max_ops = self.config.limits.max_ops_per_upload;
        if req.ops.len() > max_ops {
            return Err(UploadRejection::BatchTooLarge { max: max_ops });
        }

        // A retried request returns its original per-op decisions, but the
        // piggybacked ops are recomputed against *this* request's
        // last_known_server_seq: a cached decision must never suppress
        // operations from other clients that arrived since the first try.
        if let Some(request_id) = &req.request_id {
            if let Some(cached) = self.dedup.get(user, request_id, now) {
                self.metrics.dedup_hits.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    user_id = user.value(),
                    request_id = %request_id,
                    "returning cached upload results"
                );
                let (new_ops, latest_seq) = self
                    .piggyback(user, &req.client_id, req.last_known_server_seq)
                    .await?;
                return Ok(UploadOpsResponse {
                    results: cached,
                    new_ops,
                    latest_seq,
                    deduplicated: Some(true),
                });
            }
        }

        // Quota, with on-demand compaction between check and rejection.
        let incoming_bytes: u64 = req
            .ops
            .iter()
            .map(|op| serialized_size(&op.payload) as u64)
            .sum();
        let mut check = self.quota.check(user, incoming_bytes).await?;
        if !check.allowed {
            let outcome = self
                .compactor
                .free_storage_for_upload(user, incoming_bytes)
                .await?;
            if !outcome.success {
                self.metrics.quota_rejections.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    event = "quota_exceeded",
                    user_id = user.value(),
                    used = check.current_usage,
                    quota = check.quota,
                    freed = outcome.freed_bytes,
                    "upload rejected: storage quota exceeded"
                );
                return Err(UploadRejection::QuotaExceeded {
                    used: check.current_usage,
                    quota: check.quota,
                });
            }
            check = self.quota.check(user, incoming_bytes).await?;
            if !check.allowed {
                self.metrics.quota_rejections.fetch_add(1, Ordering::Relaxed);
                return Err(UploadRejection::QuotaExceeded {
                    used: check.current_usage,
                    quota: check.quota,
                });
            }
        }

        let results = self.upload.upload_batch(user, &req.client_id, &req.ops).await;

        let accepted = results.iter().filter(|r| r.accepted).count() as u64;
        let rejected = results.len() as u64 - accepted;
        self.metrics.ops_accepted.fetch_add(accepted, Ordering::Relaxed);
        self.metrics.ops_rejected.fetch_add(rejected, Ordering::Relaxed);
        tracing::info!(
            user_id = user.value(),
            client_id = %req.client_id,
            accepted,
            rejected,
            "upload processed"
        );

        if let Some(request_id) = &req.request_id {
            self.dedup.store(user, request_id, &results, now);
        }

        if accepted > 0 {
            self.quota.recompute(user).await?;
        }

        let (new_ops, latest_seq) = self
            .piggyback(user, &req.client_id, req.last_known_server_seq)
            .await?;

        Ok(UploadOpsResponse {
            results,
            new_ops,
            latest_seq,
            deduplicated: None,
        })
    }

    /// Wrap a full client state as a synthetic import operation and run it
    /// through the normal upload path, then cache the resulting snapshot.
    pub async fn handle_snapshot_upload(
        &self,
        user: UserId,
        req: SnapshotUploadRequest,
    ) -> Result<SnapshotUploadResponse, UploadRejection> {
        let incoming_bytes = serialized_size(&req.state) as u64;
        let check = self.quota.check(user, incoming_bytes).await?;
        if !check.allowed {
            let outcome = self
                .compactor
                .free_storage_for_upload(user, incoming_bytes)
                .await?;
            if !outcome.success {
                self.metrics.quota_rejections.fetch_add(1, Ordering::Relaxed);
                return Err(UploadRejection::QuotaExceeded {
                    used: check.current_usage,
                    quota: check.quota,
                });
            }
        }

        let op = Operation {
            id: uuid::Uuid::now_v7().to_string(),
            client_id: req.client_id.clone(),
            action_type: "importAllData".to_string(),
            op_kind: OpKind::SyncImport,
            entity_type: WILDCARD_ENTITY_TYPE.to_string(),
            entity_id: None,
            entity_ids: None,
            payload: req.state.clone(),
            vector_clock: req.vector_clock,
            timestamp: now_ms(),
            schema_version: req.schema_version.unwrap_or(1),
            is_payload_encrypted: req.is_payload_encrypted,
        };

        let results = self
            .upload
            .upload_batch(user, &req.client_id, std::slice::from_ref(&op))
            .await;
        let result = &results[0];

        if result.accepted {
            if let Some(server_seq) = result.server_seq {
                // The uploaded state IS the projection at that seq; caching
                // it spares the next snapshot request a full replay.
                if !req.is_payload_encrypted {
                    self.snapshots
                        .cache_state(user, &req.state, server_seq)
                        .await?;
                }
                self.quota.recompute(user).await?;
            }
            tracing::info!(
                user_id = user.value(),
                client_id = %req.client_id,
                reason = ?req.reason,
                "snapshot upload accepted"
            );
        }

        Ok(SnapshotUploadResponse {
            accepted: result.accepted,
            server_seq: result.server_seq,
            error: result.error.clone(),
        })
    }

    /// Current sync status for one user.
    pub async fn status(&self, user: UserId) -> Result<StatusResponse, ServerError> {
        let now = now_ms();
        let latest_seq = self.store.last_seq(self.store.pool(), user).await?;
        let online_cutoff = now - (self.config.limits.online_threshold_secs as i64) * 1000;
        let devices_online = self.store.online_device_count(user, online_cutoff).await?;

        let pending_ops = match self.store.min_acked_seq(user).await? {
            Some(min_acked) => latest_seq.value().saturating_sub(min_acked.value()),
            None => 0,
        };

        let snapshot_age_ms = self
            .store
            .load_snapshot_blob(self.store.pool(), user)
            .await?
            .map(|blob| now - blob.generated_at);

        Ok(StatusResponse {
            latest_seq,
            devices_online,
            pending_ops,
            snapshot_age_ms,
            storage_used_bytes: self.quota.used_bytes(user).await?,
            storage_quota_bytes: self.quota.quota_bytes(),
        })
    }

    /// Record a device's acknowledged sequence (informational only; never
    /// drives retention). Returns false for unknown devices.
    pub async fn record_ack(
        &self,
        user: UserId,
        client_id: &str,
        acked: Seq,
    ) -> Result<bool, ServerError> {
        Ok(self
            .store
            .record_device_ack(user, client_id, acked, now_ms())
            .await?)
    }

    async fn piggyback(
        &self,
        user: UserId,
        client_id: &str,
        last_known: Option<Seq>,
    ) -> Result<(Option<Vec<sync_types::ServerOperation>>, Seq), UploadRejection> {
        match last_known {
            Some(since) => {
                let resp = self
                    .download
                    .get_ops_since(user, since, Some(client_id), Some(100))
                    .await?;
                let new_ops = (!resp.ops.is_empty()).then_some(resp.ops);
                Ok((new_ops, resp.latest_seq))
            }
            None => {
                let latest = self.store.last_seq(self.store.pool(), user).await?;
                Ok((None, latest))
            }
        }
    }
}
