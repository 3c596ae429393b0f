//! Rate limiting for the sync server.
//!
//! Two layers sit in front of the upload coordinator:
//! - a per-user fixed-window counter, bounded in entry count so a burst of
//!   distinct users cannot grow memory without bound;
//! - a global requests-per-second limiter (via the governor crate) that
//!   caps aggregate throughput even when every individual user is within
//!   their own window.
//!
//! Both are per-process. A multi-instance deployment needs sticky routing
//! or a shared store; that is outside this design.

use crate::config::LimitsConfig;
use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use sync_types::UserId;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: i64,
}

/// Per-user upload windows plus the global throughput cap.
#[derive(Clone)]
pub struct RateLimitGuard {
    windows: Arc<DashMap<i64, Window>>,
    max_per_window: u32,
    window_ms: i64,
    max_entries: usize,
    global: Arc<DirectLimiter>,
}

impl std::fmt::Debug for RateLimitGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitGuard")
            .field("tracked_users", &self.windows.len())
            .field("max_per_window", &self.max_per_window)
            .field("window_ms", &self.window_ms)
            .finish()
    }
}

impl RateLimitGuard {
    /// Create limiters from configuration.
    ///
    /// # Panics
    ///
    /// Panics if `global_requests_per_second` or `uploads_per_window` is 0.
    pub fn new(config: &LimitsConfig) -> Self {
        assert!(config.uploads_per_window > 0, "uploads_per_window must be > 0");
        let global_rps = NonZeroU32::new(config.global_requests_per_second)
            .expect("global_requests_per_second must be > 0");

        Self {
            windows: Arc::new(DashMap::new()),
            max_per_window: config.uploads_per_window,
            window_ms: (config.upload_window_secs * 1000) as i64,
            max_entries: config.max_cache_entries,
            global: Arc::new(RateLimiter::direct(Quota::per_second(global_rps))),
        }
    }

    /// Count one upload attempt against the user's window.
    pub fn check_upload(&self, user: UserId, now: i64) -> Result<(), RateLimitError> {
        let key = user.value();

        if let Some(mut entry) = self.windows.get_mut(&key) {
            if now <= entry.reset_at {
                if entry.count >= self.max_per_window {
                    return Err(RateLimitError::UserLimitExceeded);
                }
                entry.count += 1;
                return Ok(());
            }
        }

        // New user or expired window: (re)open a window, keeping the map
        // bounded first.
        if !self.windows.contains_key(&key) && self.windows.len() >= self.max_entries {
            self.evict_one(now);
        }
        self.windows.insert(
            key,
            Window {
                count: 1,
                reset_at: now + self.window_ms,
            },
        );
        Ok(())
    }

    /// Check the aggregate request rate across all users.
    pub fn check_global(&self) -> Result<(), RateLimitError> {
        self.global
            .check()
            .map_err(|_| RateLimitError::GlobalLimitExceeded)
    }

    /// Drop windows that have expired. Called from the periodic job.
    pub fn cleanup_expired(&self, now: i64) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, window| now <= window.reset_at);
        before - self.windows.len()
    }

    /// Number of users currently tracked (for metrics).
    pub fn tracked_users(&self) -> usize {
        self.windows.len()
    }

    fn evict_one(&self, now: i64) {
        // Prefer dropping expired windows; otherwise sacrifice an arbitrary
        // entry so the map never exceeds its bound.
        if self.cleanup_expired(now) > 0 {
            return;
        }
        let victim = self.windows.iter().next().map(|e| *e.key());
        if let Some(key) = victim {
            self.windows.remove(&key);
        }
    }
}

/// Rate limit error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    /// Too many uploads from this user in the current window.
    UserLimitExceeded,
    /// Aggregate request rate exceeded across all users.
    GlobalLimitExceeded,
}

impl std::fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserLimitExceeded => write!(f, "upload rate limit exceeded"),
            Self::GlobalLimitExceeded => write!(f, "global rate limit exceeded"),
        }
    }
}

impl std::error::Error for RateLimitError {}
