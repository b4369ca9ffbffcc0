#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderName, Method, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use rarcrack_api::config::ServerConfig;
use rarcrack_api::routes;
use rarcrack_api::state::AppState;
use rarcrack_api::ws::SubscriptionGateway;
use rarcrack_core::store::MemoryTaskStore;
use rarcrack_events::{MemoryRelay, ReconnectConfig};

/// Multipart boundary used by [`multipart_body`].
pub const BOUNDARY: &str = "rarcrack-test-boundary";

/// Everything a test needs to drive the app and inspect its collaborators.
pub struct TestApp {
    pub router: Router,
    pub store: Arc<MemoryTaskStore>,
    pub relay: MemoryRelay,
    pub gateway: Arc<SubscriptionGateway>,
    /// Keeps the upload directory alive for the test's duration.
    pub upload_dir: tempfile::TempDir,
}

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config(upload_dir: PathBuf) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        upload_dir,
    }
}

/// Reconnect quickly so relay outage tests finish fast.
pub fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        multiplier: 2.0,
    }
}

/// Build the full application router with all middleware layers, backed by
/// an in-memory store and relay.
///
/// This mirrors the router construction in `main.rs` so integration tests
/// exercise the same middleware stack production uses.
pub fn build_test_app() -> TestApp {
    let upload_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryTaskStore::new());
    let relay = MemoryRelay::default();
    let gateway = Arc::new(SubscriptionGateway::start(
        Arc::new(relay.clone()),
        fast_reconnect(),
    ));

    let state = AppState {
        store: store.clone(),
        config: Arc::new(test_config(upload_dir.path().to_path_buf())),
        gateway: Arc::clone(&gateway),
    };

    let cors = CorsLayer::new()
        .allow_origin(["http://localhost:5173".parse().unwrap()])
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE])
        .allow_credentials(true)
        .max_age(Duration::from_secs(3600));

    let request_id_header = HeaderName::from_static("x-request-id");

    let router = Router::new()
        .merge(routes::health::router())
        .nest("/api/v1", routes::api_routes())
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(30),
        ))
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        .layer(cors)
        .with_state(state);

    TestApp {
        router,
        store,
        relay,
        gateway,
        upload_dir,
    }
}

/// Send a GET request.
pub async fn get(app: Router, uri: &str) -> Response {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.oneshot(request).await.unwrap()
}

/// Send a multipart POST request built by [`multipart_body`].
pub async fn post_multipart(app: Router, uri: &str, body: Vec<u8>) -> Response {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(
            CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap();
    app.oneshot(request).await.unwrap()
}

/// Collect a response body as JSON.
pub async fn body_json(response: Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Encode text fields and an optional `archive` file as multipart/form-data.
pub fn multipart_body(fields: &[(&str, &str)], archive: Option<&[u8]>) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    if let Some(data) = archive {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"archive\"; filename=\"secret.rar\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}
