//! Integration tests for the cross-origin policy and ambient endpoints.
//!
//! Verifies that:
//! - Preflight from the configured origin succeeds with the allow headers
//! - Preflight from any other origin is rejected
//! - Actual responses to the configured origin carry allow-origin
//! - GET /health reports upstream readiness and every response has a request ID

use std::sync::Arc;

use axum::body::Body;
use http::Request;
use tower::ServiceExt;

use ark_relay::completion::CompletionClient;
use ark_relay::config::{ApiKey, Config, CorsConfig, UpstreamConfig};
use ark_relay::relay::{create_router, AppState};

const ALLOWED_ORIGIN: &str = "http://localhost:8080";

fn app_with(upstream: UpstreamConfig) -> axum::Router {
    let config = Config {
        cors: CorsConfig {
            allowed_origin: ALLOWED_ORIGIN.to_string(),
            max_age_secs: 3600,
        },
        upstream,
        ..Config::default()
    };
    let client = CompletionClient::new(config.upstream.clone()).expect("build client");
    create_router(AppState {
        client,
        config: Arc::new(config),
    })
    .expect("build router")
}

fn app() -> axum::Router {
    app_with(UpstreamConfig::default())
}

fn preflight(origin: &str) -> Request<Body> {
    Request::builder()
        .method("OPTIONS")
        .uri("/api/ai")
        .header("origin", origin)
        .header("access-control-request-method", "POST")
        .header("access-control-request-headers", "content-type")
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_preflight_from_allowed_origin_succeeds() {
    let response = app().oneshot(preflight(ALLOWED_ORIGIN)).await.unwrap();

    assert!(response.status().is_success());
    let headers = response.headers();
    assert_eq!(
        headers.get("access-control-allow-origin").unwrap(),
        ALLOWED_ORIGIN
    );
    assert_eq!(headers.get("access-control-allow-methods").unwrap(), "POST");
    assert_eq!(
        headers.get("access-control-allow-headers").unwrap(),
        "content-type"
    );
    assert_eq!(
        headers.get("access-control-allow-credentials").unwrap(),
        "true"
    );
    assert_eq!(headers.get("access-control-max-age").unwrap(), "3600");
}

#[tokio::test]
async fn test_preflight_from_other_origin_rejected() {
    let response = app()
        .oneshot(preflight("http://evil.example"))
        .await
        .unwrap();

    assert_eq!(response.status(), http::StatusCode::BAD_REQUEST);
    assert!(response
        .headers()
        .get("access-control-allow-origin")
        .is_none());

    let body = axum::body::to_bytes(response.into_body(), 1024)
        .await
        .unwrap();
    assert_eq!(body, "Disallowed CORS origin");
}

#[tokio::test]
async fn test_preflight_without_origin_rejected() {
    let request = Request::builder()
        .method("OPTIONS")
        .uri("/api/ai")
        .header("access-control-request-method", "POST")
        .body(Body::empty())
        .unwrap();

    let response = app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), http::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_actual_response_to_allowed_origin_has_cors_headers() {
    // An empty input is rejected locally, so no upstream is needed
    let request = Request::post("/api/ai")
        .header("origin", ALLOWED_ORIGIN)
        .header("content-type", "application/json")
        .body(Body::from(r#"{"input": ""}"#))
        .unwrap();

    let response = app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), http::StatusCode::BAD_REQUEST);
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .unwrap(),
        ALLOWED_ORIGIN
    );
}

#[tokio::test]
async fn test_health_reports_upstream_readiness() {
    let request = Request::get("/health").body(Body::empty()).unwrap();
    let response = app().oneshot(request).await.unwrap();

    assert_eq!(response.status(), http::StatusCode::OK);
    let request_id = response
        .headers()
        .get("x-request-id")
        .expect("x-request-id header")
        .to_str()
        .unwrap()
        .to_string();
    assert!(uuid::Uuid::parse_str(&request_id).is_ok());

    let body = axum::body::to_bytes(response.into_body(), 1024)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["upstream_ready"], false);

    let ready = app_with(UpstreamConfig {
        api_key: Some(ApiKey::from("k")),
        model_id: Some("ep-1".to_string()),
        ..UpstreamConfig::default()
    });
    let response = ready
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = axum::body::to_bytes(response.into_body(), 1024)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["upstream_ready"], true);
}

#[tokio::test]
async fn test_request_ids_are_unique() {
    let router = app();
    let first = router
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let second = router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_ne!(
        first.headers().get("x-request-id"),
        second.headers().get("x-request-id")
    );
}
