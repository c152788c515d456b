//! Axum router construction.
//!
//! The [`app`] function wires the upload endpoint and the operational
//! endpoints to their handlers and returns a ready-to-serve
//! [`axum::Router`].

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::errors::{generate_request_id, panic_response};
use crate::handlers::upload::upload_file;
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::AppState;

/// Allowance for multipart boundaries and part headers on top of the file.
const FORM_OVERHEAD_BYTES: u64 = 64 * 1024;

// -- OpenAPI specification ----------------------------------------------------

/// OpenAPI documentation for the upload API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "assetlift Upload API",
        version = "0.1.0",
        description = "Proxy that stores uploaded files in Google Cloud Storage"
    ),
    paths(health_check, crate::handlers::upload::upload_file),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "Upload", description = "File upload"),
    )
)]
struct ApiDoc;

/// Build the axum [`Router`] with all routes and middleware.
pub fn app(state: Arc<AppState>) -> Router {
    let body_limit = state.config.server.upload_limit() + FORM_OVERHEAD_BYTES;
    let request_timeout = state.config.server.request_timeout();

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/openapi.json", get(openapi_json))
        .route("/upload", post(upload_file))
        .with_state(state)
        // Layer ordering: inner layers run first, outer layers wrap them.
        // The file-size check in the handler is authoritative; this bound
        // stops oversized bodies from being buffered at all.
        .layer(DefaultBodyLimit::max(body_limit as usize))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        // metrics_middleware is outermost (captures full request lifecycle).
        .layer(middleware::from_fn(metrics_middleware))
}

// -- Common headers middleware -----------------------------------------------

/// Adds `x-request-id` and `server` to every response.
async fn common_headers_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    if !headers.contains_key("x-request-id") {
        if let Ok(value) = HeaderValue::from_str(&generate_request_id()) {
            headers.insert("x-request-id", value);
        }
    }
    headers.insert("server", HeaderValue::from_static("assetlift"));

    response
}

// -- Health check ------------------------------------------------------------

/// `GET /health` -- Returns `{"status": "ok"}` with 200 OK.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    operation_id = "HealthCheck",
    responses(
        (status = 200, description = "Health check OK")
    )
)]
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

/// `GET /openapi.json` -- The generated OpenAPI document.
async fn openapi_json() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::CredentialProvider;
    use crate::config::{Config, CredentialsConfig};
    use crate::storage::memory::MemoryWriter;
    use axum::body::Body;
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        let mut config = Config::default();
        config.credentials = CredentialsConfig {
            access_token: Some("ya29.test".to_string()),
            ..CredentialsConfig::default()
        };
        let credentials = CredentialProvider::from_config(&config.credentials).unwrap();
        Arc::new(AppState {
            config,
            credentials: Arc::new(credentials),
            writer: Arc::new(MemoryWriter::new()),
        })
    }

    async fn get(uri: &str) -> Response {
        app(test_state())
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let response = get("/health").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["server"], "assetlift");
        assert_eq!(response.headers()["x-request-id"].len(), 32);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], br#"{"status":"ok"}"#);
    }

    #[tokio::test]
    async fn test_openapi_lists_upload() {
        let response = get("/openapi.json").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(doc["paths"]["/upload"]["post"].is_object());
        assert!(doc["paths"]["/health"]["get"].is_object());
    }

    #[tokio::test]
    async fn test_upload_requires_post() {
        let response = get("/upload").await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_cors_preflight_allowed() {
        let response = app(test_state())
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/upload")
                    .header("origin", "http://localhost:3000")
                    .header("access-control-request-method", "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .contains_key("access-control-allow-origin"));
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let response = get("/nope").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
