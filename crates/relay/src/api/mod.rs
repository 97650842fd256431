// REST surface over page sessions: synchronous reads of live state plus the
// lock and version commands that do not need a socket.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use onezone_common::types::{LockInfo, PageContent, PageVersion};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::auth::jwt::JwtAccessTokenService;
use crate::auth::middleware::{require_bearer_auth, AuthenticatedUser};
use crate::rate_limit::{RateBucket, RateLimitDecision};
use crate::server::RelayState;
use crate::session::SessionError;

#[derive(Debug, Serialize)]
struct PageResponse {
    page_id: Uuid,
    seq: u64,
    page: PageContent,
    latest_version: Option<i32>,
}

#[derive(Debug, Serialize)]
struct LockStatusResponse {
    page_id: Uuid,
    locked: bool,
    lock: Option<LockInfo>,
}

#[derive(Debug, Serialize)]
struct BreakLockResponse {
    page_id: Uuid,
    broken: Option<LockInfo>,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    cursor: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    items: Vec<PageVersion>,
    next_cursor: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SnapshotRequest {
    #[serde(default)]
    change_summary: Option<String>,
}

pub fn router(state: RelayState, jwt_service: Arc<JwtAccessTokenService>) -> Router {
    Router::new()
        .route("/v1/pages/{page_id}", get(get_page))
        .route("/v1/pages/{page_id}/presence", get(get_presence))
        .route("/v1/pages/{page_id}/lock", get(get_lock).post(acquire_lock).delete(release_lock))
        .route("/v1/pages/{page_id}/lock/heartbeat", post(heartbeat_lock))
        .route("/v1/pages/{page_id}/lock/break", post(break_lock))
        .route("/v1/pages/{page_id}/versions", get(list_versions).post(create_version))
        .route("/v1/pages/{page_id}/versions/{version_number}/restore", post(restore_version))
        .route_layer(middleware::from_fn_with_state(jwt_service, require_bearer_auth))
        .with_state(state)
}

async fn get_page(
    State(state): State<RelayState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(page_id): Path<Uuid>,
) -> Result<impl IntoResponse, SessionError> {
    let live = state.registry.state(page_id, user.user_id).await?;
    Ok(Json(PageResponse {
        page_id,
        seq: live.seq,
        page: live.page,
        latest_version: live.latest_version,
    }))
}

async fn get_presence(
    State(state): State<RelayState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(page_id): Path<Uuid>,
) -> Result<impl IntoResponse, SessionError> {
    let live = state.registry.state(page_id, user.user_id).await?;
    Ok(Json(live.collaboration()))
}

// ── Locks ──────────────────────────────────────────────────────────────

async fn get_lock(
    State(state): State<RelayState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(page_id): Path<Uuid>,
) -> Result<impl IntoResponse, SessionError> {
    let live = state.registry.state(page_id, user.user_id).await?;
    Ok(Json(LockStatusResponse { page_id, locked: live.lock.is_some(), lock: live.lock }))
}

async fn acquire_lock(
    State(state): State<RelayState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(page_id): Path<Uuid>,
) -> Result<impl IntoResponse, SessionError> {
    enforce_rate_limit(&state, user.user_id, RateBucket::Mutate).await?;
    let lock = state.registry.acquire_lock(page_id, user.user_id).await?;
    Ok((StatusCode::CREATED, Json(lock)))
}

async fn release_lock(
    State(state): State<RelayState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(page_id): Path<Uuid>,
) -> Result<impl IntoResponse, SessionError> {
    enforce_rate_limit(&state, user.user_id, RateBucket::Mutate).await?;
    state.registry.release_lock(page_id, user.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn heartbeat_lock(
    State(state): State<RelayState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(page_id): Path<Uuid>,
) -> Result<impl IntoResponse, SessionError> {
    let lock = state.registry.heartbeat(page_id, user.user_id).await?;
    Ok(Json(lock))
}

async fn break_lock(
    State(state): State<RelayState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(page_id): Path<Uuid>,
) -> Result<impl IntoResponse, SessionError> {
    enforce_rate_limit(&state, user.user_id, RateBucket::Mutate).await?;
    let broken = state.registry.break_lock(page_id, user.user_id).await?;
    if let Some(lock) = &broken {
        info!(
            page_id = %page_id,
            actor_id = %user.user_id,
            previous_holder = %lock.holder_id,
            "page lock broken"
        );
    }
    Ok(Json(BreakLockResponse { page_id, broken }))
}

// ── Versions ───────────────────────────────────────────────────────────

async fn list_versions(
    State(state): State<RelayState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(page_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, SessionError> {
    enforce_rate_limit(&state, user.user_id, RateBucket::Search).await?;
    let page = state
        .registry
        .history(page_id, user.user_id, query.cursor.as_deref(), query.limit)
        .await?;
    Ok(Json(HistoryResponse {
        items: page.items,
        next_cursor: page.next_cursor.map(|cursor| cursor.encode()),
    }))
}

async fn create_version(
    State(state): State<RelayState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(page_id): Path<Uuid>,
    payload: Option<Json<SnapshotRequest>>,
) -> Result<impl IntoResponse, SessionError> {
    enforce_rate_limit(&state, user.user_id, RateBucket::Mutate).await?;
    let Json(request) = payload.unwrap_or_default();
    let summary = request.change_summary.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    let version = state.registry.snapshot(page_id, user.user_id, summary).await?;
    Ok((StatusCode::CREATED, Json(version)))
}

async fn restore_version(
    State(state): State<RelayState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path((page_id, version_number)): Path<(Uuid, i32)>,
) -> Result<impl IntoResponse, SessionError> {
    enforce_rate_limit(&state, user.user_id, RateBucket::Mutate).await?;
    let restored = state.registry.restore(page_id, user.user_id, version_number).await?;
    Ok((StatusCode::CREATED, Json(restored)))
}

pub(crate) async fn enforce_rate_limit(
    state: &RelayState,
    user_id: Uuid,
    bucket: RateBucket,
) -> Result<(), SessionError> {
    match state.limiter.check(user_id, bucket).await {
        RateLimitDecision::Allowed => Ok(()),
        RateLimitDecision::Limited { retry_after_secs } => {
            info!(user_id = %user_id, bucket = bucket.as_str(), retry_after_secs, "rate limited");
            Err(SessionError::RateLimited { retry_after_secs })
        }
    }
}
