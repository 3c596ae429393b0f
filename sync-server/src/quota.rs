//! Per-user storage accounting and quota authorization.

use crate::error::StorageResult;
use crate::storage::SqliteStore;
use sync_types::UserId;

/// Outcome of a quota check.
#[derive(Debug, Clone, Copy)]
pub struct QuotaCheck {
    /// Whether the upload may proceed.
    pub allowed: bool,
    /// Current usage in bytes (recomputed when it mattered).
    pub current_usage: u64,
    /// The configured quota in bytes.
    pub quota: u64,
}

/// Computes storage usage and authorizes uploads against the quota.
#[derive(Clone)]
pub struct StorageQuotaGuard {
    store: SqliteStore,
    quota_bytes: u64,
}

impl StorageQuotaGuard {
    /// Create a guard over the given store.
    pub fn new(store: SqliteStore, quota_bytes: u64) -> Self {
        Self { store, quota_bytes }
    }

    /// The configured per-user quota in bytes.
    pub fn quota_bytes(&self) -> u64 {
        self.quota_bytes
    }

    /// Authorize an upload of `incoming_bytes`.
    ///
    /// The persisted usage figure can be stale after retention deletes, so
    /// an apparent overflow triggers a recomputation before the request is
    /// actually denied.
    pub async fn check(&self, user: UserId, incoming_bytes: u64) -> StorageResult<QuotaCheck> {
        let mut usage = self.store.storage_used(user).await?;
        if usage + incoming_bytes > self.quota_bytes {
            usage = self.recompute(user).await?;
        }
        Ok(QuotaCheck {
            allowed: usage + incoming_bytes <= self.quota_bytes,
            current_usage: usage,
            quota: self.quota_bytes,
        })
    }

    /// Recompute the user's usage from stored payloads and persist it.
    pub async fn recompute(&self, user: UserId) -> StorageResult<u64> {
        let bytes = self.store.payload_bytes(user).await?;
        self.store.set_storage_used(user, bytes).await?;
        Ok(bytes)
    }

    /// The last persisted usage figure.
    pub async fn used_bytes(&self, user: UserId) -> StorageResult<u64> {
        self.store.storage_used(user).await
    }
}
