//! HTTP request handlers.

use axum::{
    extract::{rejection::JsonRejection, Extension, State},
    response::{IntoResponse, Response},
    Json,
};

use super::server::{AppState, RequestId};
use super::stream::event_stream_response;
use super::types::{RelayRequest, RelayResponse};
use crate::completion::{flatten_failure, Completion};
use crate::error::Error;

/// Handle POST /api/ai
///
/// Validation failures are rejected before the upstream is contacted.
/// Upstream setup failures are reported as `{"result": null}` with 200.
pub async fn relay_completion(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    payload: Result<Json<RelayRequest>, JsonRejection>,
) -> Result<Response, Error> {
    let Json(request) = payload.map_err(|rejection| {
        tracing::warn!(
            request_id = %request_id,
            error = %rejection.body_text(),
            "Rejected malformed relay request"
        );
        Error::BadRequest(rejection.body_text())
    })?;

    let prompt = request.prompt().map_err(|e| {
        tracing::warn!(request_id = %request_id, error = %e, "Rejected relay request");
        e
    })?;

    tracing::info!(
        request_id = %request_id,
        stream = request.stream,
        prompt_chars = prompt.chars().count(),
        "Received relay request"
    );

    let completion = state.client.complete(prompt, None, request.stream).await;

    let response = match flatten_failure(completion) {
        Some(Completion::Stream(fragments)) => event_stream_response(fragments),
        Some(Completion::Text(text)) => Json(RelayResponse { result: Some(text) }).into_response(),
        None => Json(RelayResponse { result: None }).into_response(),
    };

    Ok(response)
}

/// Handle GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "ark-relay",
        "upstream_ready": state.client.is_ready(),
    }))
}
