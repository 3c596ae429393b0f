//! Prometheus metrics endpoint.

use crate::server::SyncServer;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Prometheus metrics handler.
///
/// Returns metrics in Prometheus text format.
/// Includes both gauges (current state) and counters (monotonic since startup).
pub async fn metrics_handler(Extension(server): Extension<Arc<SyncServer>>) -> impl IntoResponse {
    let m = server.metrics();

    // Gauges — current state
    let tracked_users = server.limits().tracked_users();
    let dedup_entries = server.dedup().len();

    // Counters — monotonic since startup
    let uploads = m.uploads_total.load(Ordering::Relaxed);
    let accepted = m.ops_accepted.load(Ordering::Relaxed);
    let rejected = m.ops_rejected.load(Ordering::Relaxed);
    let downloads = m.downloads_total.load(Ordering::Relaxed);
    let snapshots = m.snapshots_served.load(Ordering::Relaxed);
    let rate_limits = m.rate_limit_hits.load(Ordering::Relaxed);
    let dedup_hits = m.dedup_hits.load(Ordering::Relaxed);
    let quota_rejections = m.quota_rejections.load(Ordering::Relaxed);
    let errors = m.errors_total.load(Ordering::Relaxed);

    let body = format!(
        r#"# HELP oplog_sync_info Server information
# TYPE oplog_sync_info gauge
oplog_sync_info{{version="{version}"}} 1

# HELP oplog_sync_rate_limit_windows Users with an active rate-limit window
# TYPE oplog_sync_rate_limit_windows gauge
oplog_sync_rate_limit_windows {tracked_users}

# HELP oplog_sync_dedup_entries Cached request dedup entries
# TYPE oplog_sync_dedup_entries gauge
oplog_sync_dedup_entries {dedup_entries}

# HELP oplog_sync_uploads_total Total upload requests handled
# TYPE oplog_sync_uploads_total counter
oplog_sync_uploads_total {uploads}

# HELP oplog_sync_ops_accepted_total Total operations accepted and stored
# TYPE oplog_sync_ops_accepted_total counter
oplog_sync_ops_accepted_total {accepted}

# HELP oplog_sync_ops_rejected_total Total operations rejected
# TYPE oplog_sync_ops_rejected_total counter
oplog_sync_ops_rejected_total {rejected}

# HELP oplog_sync_downloads_total Total download requests handled
# TYPE oplog_sync_downloads_total counter
oplog_sync_downloads_total {downloads}

# HELP oplog_sync_snapshots_served_total Total snapshot requests served
# TYPE oplog_sync_snapshots_served_total counter
oplog_sync_snapshots_served_total {snapshots}

# HELP oplog_sync_rate_limit_hits_total Total rate limit rejections
# TYPE oplog_sync_rate_limit_hits_total counter
oplog_sync_rate_limit_hits_total {rate_limits}

# HELP oplog_sync_dedup_hits_total Total upload retries served from cache
# TYPE oplog_sync_dedup_hits_total counter
oplog_sync_dedup_hits_total {dedup_hits}

# HELP oplog_sync_quota_rejections_total Total uploads rejected for storage quota
# TYPE oplog_sync_quota_rejections_total counter
oplog_sync_quota_rejections_total {quota_rejections}

# HELP oplog_sync_errors_total Total unexpected server errors
# TYPE oplog_sync_errors_total counter
oplog_sync_errors_total {errors}
"#,
        version = env!("CARGO_PKG_VERSION"),
    );

    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
