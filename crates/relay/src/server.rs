// HTTP router assembly and the request middleware stack.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tracing::{error, info, warn};

use crate::auth::jwt::JwtAccessTokenService;
use crate::cors::cors_layer;
use crate::error::{
    attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope,
    ErrorCode, RelayError,
};
use crate::metrics::RelayMetrics;
use crate::rate_limit::RateLimiter;
use crate::session::SessionRegistry;
use crate::{api, ws};

pub const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Shared by the REST and WebSocket handlers.
#[derive(Clone)]
pub struct RelayState {
    pub registry: SessionRegistry,
    pub limiter: Arc<RateLimiter>,
}

impl RelayState {
    pub fn new(registry: SessionRegistry, limiter: Arc<RateLimiter>) -> Self {
        Self { registry, limiter }
    }
}

pub fn build_router(
    state: RelayState,
    jwt_service: Arc<JwtAccessTokenService>,
    metrics: Arc<RelayMetrics>,
    cors_origins: Option<&str>,
) -> Router {
    let router = Router::new()
        .route("/healthz", get(healthz))
        .merge(
            Router::new()
                .route("/metrics", get(render_metrics))
                .with_state(Arc::clone(&metrics)),
        )
        .merge(ws::router(state.clone(), Arc::clone(&jwt_service)))
        .merge(api::router(state, jwt_service));

    apply_middleware(router, metrics).layer(cors_layer(cors_origins))
}

pub fn apply_middleware(router: Router, metrics: Arc<RelayMetrics>) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn_with_state(metrics, request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn render_metrics(State(metrics): State<Arc<RelayMetrics>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics.render_prometheus(),
    )
}

/// Resolves when the process receives Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(error = %error, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!(error = %error, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            RelayError::from_code(ErrorCode::InternalError).into_response()
        }
    }
}

async fn request_context_middleware(
    State(metrics): State<Arc<RelayMetrics>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    let latency_ms = started_at.elapsed().as_millis() as u64;
    let status = response.status().as_u16();
    metrics.record_http_request(method.as_str(), &path, status, latency_ms);
    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status,
        latency_ms,
        "request completed"
    );

    response
}
