//! HTTP server setup and configuration.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::handlers;
use crate::completion::CompletionClient;
use crate::config::{Config, ConfigError, CorsConfig};

/// Response header carrying the per-request correlation ID (UUID v4).
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub client: CompletionClient,
    pub config: Arc<Config>,
}

/// Correlation ID assigned to each inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestId(pub Uuid);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Attach a fresh [`RequestId`] to the request and echo it in the response.
async fn assign_request_id(mut request: Request, next: Next) -> Response {
    let request_id = RequestId(Uuid::new_v4());
    request.extensions_mut().insert(request_id);

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

/// Reject CORS preflights whose origin is not the configured one.
///
/// `CorsLayer` alone answers such preflights without allow headers; this turns
/// them into an explicit 400.
async fn reject_foreign_preflight(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let is_preflight = request.method() == Method::OPTIONS
        && request
            .headers()
            .contains_key(header::ACCESS_CONTROL_REQUEST_METHOD);

    if is_preflight {
        let origin = request
            .headers()
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok());
        if origin != Some(state.config.cors.allowed_origin.as_str()) {
            tracing::warn!(origin = ?origin, "Rejected CORS preflight from disallowed origin");
            return (StatusCode::BAD_REQUEST, "Disallowed CORS origin").into_response();
        }
    }

    next.run(request).await
}

/// Build the CORS policy: one exact origin, any method and header.
fn cors_layer(cors: &CorsConfig) -> Result<CorsLayer, ConfigError> {
    let origin = HeaderValue::from_str(&cors.allowed_origin).map_err(|e| {
        ConfigError::Validation(format!(
            "cors.allowed_origin '{}' is not a valid header value: {}",
            cors.allowed_origin, e
        ))
    })?;

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::exact(origin))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
        .expose_headers([HeaderName::from_static(REQUEST_ID_HEADER)])
        .max_age(Duration::from_secs(cors.max_age_secs)))
}

/// Create the axum router with all endpoints.
pub fn create_router(state: AppState) -> crate::Result<Router> {
    let cors = cors_layer(&state.config.cors)?;

    let router = Router::new()
        .route("/api/ai", post(handlers::relay_completion))
        .route("/health", get(handlers::health))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(assign_request_id))
                .layer(middleware::from_fn_with_state(
                    state.clone(),
                    reject_foreign_preflight,
                ))
                .layer(cors),
        )
        .with_state(state);

    Ok(router)
}

/// Run the HTTP server.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let listen_addr = config.server.listen.clone();
    let client = CompletionClient::new(config.upstream.clone())?;

    let state = AppState {
        client,
        config: Arc::new(config),
    };

    let app = create_router(state)?;

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, "Starting ark-relay server");

    axum::serve(listener, app).await?;

    Ok(())
}
