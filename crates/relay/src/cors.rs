// Browser origin policy for the REST and WebSocket endpoints.

use std::time::Duration;

use axum::http::{header, HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::error::REQUEST_ID_HEADER;

/// Origins allowed when `ONEZONE_RELAY_CORS_ORIGINS` is unset.
const DEV_ORIGINS: &[&str] = &[
    "http://localhost:3000",
    "http://localhost:5173",
    "http://127.0.0.1:3000",
    "http://127.0.0.1:5173",
];

const PREFLIGHT_MAX_AGE: Duration = Duration::from_secs(3600);

/// `"*"` allows any origin without credentials; a comma-separated list
/// allows exactly those origins; `None` falls back to local dev servers.
pub fn cors_layer(origins: Option<&str>) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static(REQUEST_ID_HEADER),
        ])
        .expose_headers([HeaderName::from_static(REQUEST_ID_HEADER), header::RETRY_AFTER])
        .max_age(PREFLIGHT_MAX_AGE);

    match origins.map(str::trim) {
        Some("*") => base.allow_origin(AllowOrigin::any()),
        Some(list) => base.allow_origin(parse_origins(list)).allow_credentials(true),
        None => base.allow_origin(parse_origins(&DEV_ORIGINS.join(","))).allow_credentials(true),
    }
}

fn parse_origins(list: &str) -> Vec<HeaderValue> {
    list.split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, routing::get, Router};
    use tower::ServiceExt;

    async fn preflight(origins: Option<&str>, origin: &str) -> axum::response::Response {
        Router::new()
            .route("/v1/pages/x", get(|| async { "ok" }))
            .layer(cors_layer(origins))
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/v1/pages/x")
                    .header("origin", origin)
                    .header("access-control-request-method", "POST")
                    .body(Body::empty())
                    .expect("preflight request should build"),
            )
            .await
            .expect("preflight should return a response")
    }

    #[tokio::test]
    async fn dev_origins_are_allowed_with_credentials() {
        let response = preflight(None, "http://localhost:5173").await;

        assert_eq!(response.headers()["access-control-allow-origin"], "http://localhost:5173");
        assert_eq!(response.headers()["access-control-allow-credentials"], "true");
        assert_eq!(response.headers()["access-control-max-age"], "3600");
    }

    #[tokio::test]
    async fn unknown_origin_gets_no_allow_header() {
        let response = preflight(None, "https://evil.example.com").await;
        assert!(response.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn configured_list_replaces_dev_defaults() {
        let origins = Some("https://app.onezone.dev, https://staging.onezone.dev");

        let allowed = preflight(origins, "https://staging.onezone.dev").await;
        assert_eq!(
            allowed.headers()["access-control-allow-origin"],
            "https://staging.onezone.dev"
        );

        let dev = preflight(origins, "http://localhost:3000").await;
        assert!(dev.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn wildcard_drops_credentials() {
        let response = preflight(Some("*"), "https://anything.example.com").await;

        assert_eq!(response.headers()["access-control-allow-origin"], "*");
        assert!(response.headers().get("access-control-allow-credentials").is_none());
    }

    #[test]
    fn blank_entries_are_skipped() {
        assert_eq!(parse_origins(" https://a.dev ,, https://b.dev , ").len(), 2);
    }
}
