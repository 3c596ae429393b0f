//! Request deduplication for upload retries.
//!
//! Clients attach a `request_id` to uploads; when a response is lost in
//! transit they retry with the same id and get the original accept/reject
//! decisions back instead of a wall of DUPLICATE_OPERATION rejections.
//! Only the per-op results are cached; piggybacked operations are always
//! recomputed against the retry's own `last_known_server_seq`.

use crate::config::LimitsConfig;
use dashmap::DashMap;
use std::sync::Arc;
use sync_types::{UploadResult, UserId};

#[derive(Debug, Clone)]
struct DedupEntry {
    processed_at: i64,
    results: Vec<UploadResult>,
}

/// Bounded, per-process cache of recent upload results keyed by
/// `(user, request_id)`.
#[derive(Clone)]
pub struct RequestDedupCache {
    entries: Arc<DashMap<(i64, String), DedupEntry>>,
    ttl_ms: i64,
    max_entries: usize,
}

impl std::fmt::Debug for RequestDedupCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDedupCache")
            .field("entries", &self.entries.len())
            .field("ttl_ms", &self.ttl_ms)
            .finish()
    }
}

impl RequestDedupCache {
    /// Create a cache from configuration.
    pub fn new(config: &LimitsConfig) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl_ms: (config.dedup_ttl_secs * 1000) as i64,
            max_entries: config.max_cache_entries,
        }
    }

    /// Cached results for a request id, if present and unexpired.
    pub fn get(&self, user: UserId, request_id: &str, now: i64) -> Option<Vec<UploadResult>> {
        let key = (user.value(), request_id.to_string());
        let entry = self.entries.get(&key)?;
        if now - entry.processed_at > self.ttl_ms {
            drop(entry);
            self.entries.remove(&key);
            return None;
        }
        Some(entry.results.clone())
    }

    /// Remember the results of a processed request.
    pub fn store(&self, user: UserId, request_id: &str, results: &[UploadResult], now: i64) {
        let key = (user.value(), request_id.to_string());
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            self.evict_one(now);
        }
        self.entries.insert(
            key,
            DedupEntry {
                processed_at: now,
                results: results.to_vec(),
            },
        );
    }

    /// Drop expired entries. Called from the periodic job.
    pub fn cleanup_expired(&self, now: i64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now - entry.processed_at <= self.ttl_ms);
        before - self.entries.len()
    }

    /// Number of cached requests (for metrics).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_one(&self, now: i64) {
        if self.cleanup_expired(now) > 0 {
            return;
        }
        let victim = self.entries.iter().next().map(|e| e.key().clone());
        if let Some(key) = victim {
            self.entries.remove(&key);
        }
    }
}
