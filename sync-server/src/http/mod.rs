//! HTTP surface for the sync engine.
//!
//! Routing and body parsing live here; authentication is an external
//! collaborator: an upstream middleware (or reverse proxy) verifies the
//! caller and forwards the resolved user id in the `x-user-id` header,
//! which the [`AuthUser`] extractor trusts. Every handler operates strictly
//! within that user's partition.

pub mod health;
mod metrics;

use crate::error::SnapshotError;
use crate::server::{SyncServer, UploadRejection};
use crate::storage::now_ms;
use axum::extract::{FromRequestParts, Path, Query};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use sync_types::{AckRequest, AckResponse, RestorePointsResponse, Seq, SnapshotUploadRequest, UploadOpsRequest, UserId};

pub use health::HealthStatus;

/// Build the HTTP router with all endpoints.
pub fn build_router(server: Arc<SyncServer>) -> Router {
    Router::new()
        .route("/ops", post(upload_ops).get(download_ops))
        .route("/snapshot", get(get_snapshot).post(post_snapshot))
        .route("/status", get(get_status))
        .route("/devices/:client_id/ack", post(post_ack))
        .route("/restore-points", get(get_restore_points))
        .route("/restore/:server_seq", get(get_restore_at))
        .route("/health", get(health::health_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .layer(Extension(server))
}

/// The authenticated user, resolved by upstream auth middleware.
pub struct AuthUser(pub UserId);

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
            .map(|id| AuthUser(UserId::new(id)))
            .ok_or_else(|| {
                error_response(StatusCode::UNAUTHORIZED, json!({"error": "unauthenticated"}))
            })
    }
}

fn error_response(status: StatusCode, body: serde_json::Value) -> Response {
    (status, Json(body)).into_response()
}

fn internal_error(err: impl std::fmt::Display) -> Response {
    tracing::error!(error = %err, "request failed");
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({"error": "internal server error"}),
    )
}

fn rejection_response(rejection: UploadRejection) -> Response {
    match rejection {
        UploadRejection::RateLimited => error_response(
            StatusCode::TOO_MANY_REQUESTS,
            json!({"error": "rate limited", "error_code": "RATE_LIMITED"}),
        ),
        UploadRejection::BatchTooLarge { max } => error_response(
            StatusCode::BAD_REQUEST,
            json!({"error": format!("too many operations per upload (max {max})")}),
        ),
        UploadRejection::QuotaExceeded { used, quota } => error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            json!({
                "error": "storage quota exceeded",
                "error_code": "STORAGE_QUOTA_EXCEEDED",
                "storage_used_bytes": used,
                "storage_quota_bytes": quota,
            }),
        ),
        UploadRejection::Internal(err) => internal_error(err),
    }
}

async fn upload_ops(
    Extension(server): Extension<Arc<SyncServer>>,
    AuthUser(user): AuthUser,
    Json(req): Json<UploadOpsRequest>,
) -> Response {
    match server.handle_upload(user, req).await {
        Ok(response) => Json(response).into_response(),
        Err(rejection) => rejection_response(rejection),
    }
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    since_seq: u64,
    limit: Option<u32>,
    exclude_client: Option<String>,
}

async fn download_ops(
    Extension(server): Extension<Arc<SyncServer>>,
    AuthUser(user): AuthUser,
    Query(query): Query<DownloadQuery>,
) -> Response {
    server
        .metrics()
        .downloads_total
        .fetch_add(1, Ordering::Relaxed);

    match server
        .download()
        .get_ops_since(
            user,
            Seq::new(query.since_seq),
            query.exclude_client.as_deref(),
            query.limit,
        )
        .await
    {
        Ok(response) => Json(response).into_response(),
        Err(err) => internal_error(err),
    }
}

async fn get_snapshot(
    Extension(server): Extension<Arc<SyncServer>>,
    AuthUser(user): AuthUser,
) -> Response {
    server
        .metrics()
        .snapshots_served
        .fetch_add(1, Ordering::Relaxed);

    let ttl_ms = (server.config().snapshot.cache_ttl_secs * 1000) as i64;
    match server.snapshots().cached(user).await {
        Ok(Some(cached)) if now_ms() - cached.generated_at < ttl_ms => {
            tracing::debug!(
                user_id = user.value(),
                seq = cached.server_seq.value(),
                "serving cached snapshot"
            );
            return Json(cached).into_response();
        }
        Ok(_) => {}
        Err(err) => return internal_error(err),
    }

    match server.snapshots().generate(user).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => internal_error(err),
    }
}

async fn post_snapshot(
    Extension(server): Extension<Arc<SyncServer>>,
    AuthUser(user): AuthUser,
    Json(req): Json<SnapshotUploadRequest>,
) -> Response {
    match server.handle_snapshot_upload(user, req).await {
        Ok(response) => Json(response).into_response(),
        Err(rejection) => rejection_response(rejection),
    }
}

async fn get_status(
    Extension(server): Extension<Arc<SyncServer>>,
    AuthUser(user): AuthUser,
) -> Response {
    match server.status(user).await {
        Ok(status) => Json(status).into_response(),
        Err(err) => internal_error(err),
    }
}

async fn post_ack(
    Extension(server): Extension<Arc<SyncServer>>,
    AuthUser(user): AuthUser,
    Path(client_id): Path<String>,
    Json(req): Json<AckRequest>,
) -> Response {
    match server.record_ack(user, &client_id, req.acked_seq).await {
        Ok(true) => Json(AckResponse {
            acked_seq: req.acked_seq,
        })
        .into_response(),
        Ok(false) => error_response(StatusCode::NOT_FOUND, json!({"error": "unknown device"})),
        Err(err) => internal_error(err),
    }
}

#[derive(Debug, Deserialize)]
struct RestorePointsQuery {
    limit: Option<u32>,
}

async fn get_restore_points(
    Extension(server): Extension<Arc<SyncServer>>,
    AuthUser(user): AuthUser,
    Query(query): Query<RestorePointsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(30);
    if !(1..=100).contains(&limit) {
        return error_response(
            StatusCode::BAD_REQUEST,
            json!({"error": "invalid limit parameter (must be 1-100)"}),
        );
    }

    match server.snapshots().restore_points(user, limit).await {
        Ok(restore_points) => Json(RestorePointsResponse { restore_points }).into_response(),
        Err(err) => internal_error(err),
    }
}

async fn get_restore_at(
    Extension(server): Extension<Arc<SyncServer>>,
    AuthUser(user): AuthUser,
    Path(server_seq): Path<u64>,
) -> Response {
    match server
        .snapshots()
        .generate_at_seq(user, Seq::new(server_seq))
        .await
    {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) if err.is_client_error() => {
            let code = match &err {
                SnapshotError::EncryptedOps { .. } => Some("ENCRYPTED_OPS_NOT_SUPPORTED"),
                _ => None,
            };
            error_response(
                StatusCode::BAD_REQUEST,
                json!({"error": err.to_string(), "error_code": code}),
            )
        }
        Err(err) => internal_error(err),
    }
}
