//! Chat-completion client for the upstream provider.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

use super::sse::SseDecoder;
use super::types::{ChatCompletionRequest, ChatCompletionResponse, Message};
use crate::config::{UpstreamConfig, API_KEY_VAR, MODEL_ID_VAR};
use crate::error::{Error, Result};

/// System prompt used when the caller does not supply one.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant";
/// Sampling temperature sent with every request.
pub const TEMPERATURE: f32 = 0.7;
/// Maximum generated tokens per request.
pub const MAX_TOKENS: u32 = 1024;
/// Nucleus-sampling threshold sent with every request.
pub const TOP_P: f32 = 0.9;

/// Fragments buffered between the upstream reader and the relay.
const FRAGMENT_CHANNEL_CAPACITY: usize = 32;

/// Result of a completion call.
pub enum Completion {
    /// The full message text (non-streaming).
    Text(String),
    /// Incremental fragments, in arrival order (streaming).
    Stream(FragmentStream),
}

/// Lazy, finite, non-restartable sequence of text fragments.
///
/// Backed by a bounded channel fed by a producer task. Dropping the stream
/// closes the channel, which stops the producer and releases the upstream
/// connection. A mid-stream upstream failure arrives as a single `Err` item,
/// after which the stream ends.
pub struct FragmentStream {
    inner: ReceiverStream<Result<String>>,
}

impl FragmentStream {
    /// Create a connected producer handle and fragment stream.
    pub(crate) fn channel(capacity: usize) -> (mpsc::Sender<Result<String>>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            tx,
            Self {
                inner: ReceiverStream::new(rx),
            },
        )
    }
}

impl Stream for FragmentStream {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// How the producer side of a fragment stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpOutcome {
    /// Upstream closed the body normally.
    Completed {
        fragments: usize,
        chars: usize,
        done_received: bool,
    },
    /// The consumer went away before upstream finished.
    Cancelled { fragments: usize },
    /// The upstream body failed or reported an error part way through.
    Interrupted { fragments: usize },
}

/// Send decoded fragments in order, draining `decoded`.
///
/// Returns `false` once the consumer has gone away.
async fn forward(
    tx: &mpsc::Sender<Result<String>>,
    decoded: &mut Vec<String>,
    full_response: &mut String,
    fragments: &mut usize,
) -> bool {
    for fragment in decoded.drain(..) {
        full_response.push_str(&fragment);
        *fragments += 1;
        if tx.send(Ok(fragment)).await.is_err() {
            return false;
        }
    }
    true
}

/// Read an upstream SSE byte stream and push its text fragments into `tx`.
///
/// Stops as soon as the receiving side is dropped. Body read errors, in-band
/// provider errors and undecodable events are forwarded to the consumer as a
/// single `Err` after the fragments that preceded them.
pub(crate) async fn pump_fragments<S, E>(bytes: S, tx: mpsc::Sender<Result<String>>) -> PumpOutcome
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let mut bytes = std::pin::pin!(bytes);
    let mut decoder = SseDecoder::new();
    let mut decoded = Vec::new();
    let mut full_response = String::new();
    let mut fragments = 0usize;

    loop {
        let next = tokio::select! {
            biased;
            _ = tx.closed() => {
                tracing::info!(fragments, "Client went away, abandoning upstream stream");
                return PumpOutcome::Cancelled { fragments };
            }
            next = bytes.next() => next,
        };

        let finished = next.is_none();
        let status = match next {
            Some(Ok(chunk)) => decoder.feed(&chunk, &mut decoded),
            Some(Err(e)) => Err(Error::StreamInterrupted(e.to_string())),
            None => decoder.finish(&mut decoded),
        };

        if !forward(&tx, &mut decoded, &mut full_response, &mut fragments).await {
            tracing::info!(fragments, "Client went away, abandoning upstream stream");
            return PumpOutcome::Cancelled { fragments };
        }

        if let Err(e) = status {
            tracing::error!(error = %e, fragments, "Error streaming from provider");
            // Receiver may already be gone; the stream ends either way
            let _ = tx.send(Err(e)).await;
            return PumpOutcome::Interrupted { fragments };
        }

        if finished {
            break;
        }
    }

    if !decoder.done_received() {
        tracing::debug!("Upstream closed stream without [DONE]");
    }
    tracing::info!(
        fragments,
        chars = full_response.chars().count(),
        finish_reason = ?decoder.finish_reason(),
        "Stream complete"
    );
    tracing::debug!(text = %full_response, "Streamed completion text");

    PumpOutcome::Completed {
        fragments,
        chars: full_response.chars().count(),
        done_received: decoder.done_received(),
    }
}

/// Client for the upstream chat-completion API.
///
/// Cheap to clone; holds no per-request state.
#[derive(Clone)]
pub struct CompletionClient {
    http: reqwest::Client,
    upstream: Arc<UpstreamConfig>,
}

impl CompletionClient {
    /// Build a client with its own HTTP connection pool.
    ///
    /// No timeout is applied unless `upstream.timeout_secs` is set.
    pub fn new(upstream: UpstreamConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(secs) = upstream.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let http = builder.build()?;
        Ok(Self::with_http_client(http, upstream))
    }

    /// Build a client around an existing `reqwest::Client`.
    pub fn with_http_client(http: reqwest::Client, upstream: UpstreamConfig) -> Self {
        Self {
            http,
            upstream: Arc::new(upstream),
        }
    }

    /// Whether both the credential and the model id are configured.
    pub fn is_ready(&self) -> bool {
        self.upstream.api_key.is_some() && self.upstream.model_id.is_some()
    }

    /// Run one completion, returning either the full text or a fragment stream.
    pub async fn complete(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        stream: bool,
    ) -> Result<Completion> {
        if stream {
            self.complete_stream(prompt, system_prompt)
                .await
                .map(Completion::Stream)
        } else {
            self.complete_text(prompt, system_prompt)
                .await
                .map(Completion::Text)
        }
    }

    /// Run a non-streaming completion and return the message text.
    pub async fn complete_text(&self, prompt: &str, system_prompt: Option<&str>) -> Result<String> {
        let request = self.build_request(prompt, system_prompt, false)?;
        let response = self.send(&request).await?;

        let parsed: ChatCompletionResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to parse provider response");
            Error::Provider(format!("Failed to parse provider response: {}", e))
        })?;

        parsed
            .first_text()
            .ok_or_else(|| Error::Provider("Provider returned no choices".to_string()))
    }

    /// Start a streaming completion.
    ///
    /// Errors while establishing the call are returned here; errors after the
    /// stream has started are delivered through the returned stream.
    pub async fn complete_stream(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
    ) -> Result<FragmentStream> {
        let request = self.build_request(prompt, system_prompt, true)?;
        let response = self.send(&request).await?;

        let (tx, fragments) = FragmentStream::channel(FRAGMENT_CHANNEL_CAPACITY);
        tokio::spawn(
            async move {
                let outcome = pump_fragments(response.bytes_stream(), tx).await;
                tracing::debug!(?outcome, "Fragment producer finished");
            }
            .instrument(tracing::Span::current()),
        );

        Ok(fragments)
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.upstream.base_url.trim_end_matches('/')
        )
    }

    fn build_request(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        stream: bool,
    ) -> Result<ChatCompletionRequest> {
        if prompt.trim().is_empty() {
            return Err(Error::BadRequest("prompt must not be empty".to_string()));
        }
        let model = self
            .upstream
            .model_id
            .clone()
            .ok_or(Error::MissingSetting(MODEL_ID_VAR))?;

        Ok(ChatCompletionRequest {
            model,
            messages: vec![
                Message::system(system_prompt.unwrap_or(DEFAULT_SYSTEM_PROMPT)),
                Message::user(prompt),
            ],
            temperature: TEMPERATURE,
            max_tokens: MAX_TOKENS,
            top_p: TOP_P,
            stream,
        })
    }

    /// POST the request and check the status; the body is left unread.
    async fn send(&self, request: &ChatCompletionRequest) -> Result<reqwest::Response> {
        let api_key = self
            .upstream
            .api_key
            .as_ref()
            .ok_or(Error::MissingSetting(API_KEY_VAR))?;

        tracing::debug!(
            model = %request.model,
            stream = request.stream,
            "Sending completion request"
        );

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(api_key.expose_secret())
            .json(request)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to reach provider");
                Error::Upstream(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %error_body, "Provider returned error");
            return Err(Error::Provider(format!(
                "Provider returned {}: {}",
                status, error_body
            )));
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiKey;
    use futures::stream;

    fn sse_event(content: &str) -> Bytes {
        Bytes::from(format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"index": 0, "delta": {"content": content}}]})
        ))
    }

    fn ready_upstream() -> UpstreamConfig {
        UpstreamConfig {
            api_key: Some(ApiKey::from("key")),
            model_id: Some("ep-test".to_string()),
            ..UpstreamConfig::default()
        }
    }

    async fn drain(mut fragments: FragmentStream) -> Vec<Result<String>> {
        let mut items = Vec::new();
        while let Some(item) = fragments.next().await {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn pump_forwards_fragments_in_order() {
        let (tx, fragments) = FragmentStream::channel(4);
        let bytes = stream::iter(vec![
            Ok::<_, std::io::Error>(sse_event("One")),
            Ok(sse_event(", Two")),
            Ok(sse_event(", Three")),
            Ok(Bytes::from_static(b"data: [DONE]\n\n")),
        ]);

        let producer = tokio::spawn(pump_fragments(bytes, tx));
        let items = drain(fragments).await;
        let texts: Vec<String> = items.into_iter().map(|r| r.unwrap()).collect();

        assert_eq!(texts, vec!["One", ", Two", ", Three"]);
        assert_eq!(
            producer.await.unwrap(),
            PumpOutcome::Completed {
                fragments: 3,
                chars: 15,
                done_received: true,
            }
        );
    }

    #[tokio::test]
    async fn pump_propagates_mid_stream_failure() {
        let (tx, fragments) = FragmentStream::channel(4);
        let bytes = stream::iter(vec![
            Ok(sse_event("One")),
            Err(std::io::Error::other("connection reset")),
            Ok(sse_event("never")),
        ]);

        let producer = tokio::spawn(pump_fragments(bytes, tx));
        let items = drain(fragments).await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "One");
        match &items[1] {
            Err(Error::StreamInterrupted(msg)) => assert!(msg.contains("connection reset")),
            other => panic!("expected StreamInterrupted, got {:?}", other.as_ref().map(|s| s.as_str())),
        }
        assert_eq!(
            producer.await.unwrap(),
            PumpOutcome::Interrupted { fragments: 1 }
        );
    }

    #[tokio::test]
    async fn pump_propagates_in_band_provider_error() {
        let (tx, fragments) = FragmentStream::channel(4);
        let bytes = stream::iter(vec![
            Ok::<_, std::io::Error>(sse_event("One")),
            Ok(Bytes::from_static(
                b"data: {\"error\":{\"message\":\"content filtered\"}}\n\n",
            )),
            Ok(sse_event("never")),
        ]);

        let producer = tokio::spawn(pump_fragments(bytes, tx));
        let items = drain(fragments).await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "One");
        match &items[1] {
            Err(Error::StreamInterrupted(msg)) => assert!(msg.contains("content filtered")),
            other => panic!("expected StreamInterrupted, got {:?}", other.as_ref().map(|s| s.as_str())),
        }
        assert_eq!(
            producer.await.unwrap(),
            PumpOutcome::Interrupted { fragments: 1 }
        );
    }

    #[tokio::test]
    async fn pump_propagates_undecodable_event_after_preceding_fragments() {
        let (tx, fragments) = FragmentStream::channel(4);
        // Both events arrive in the same network chunk
        let mut chunk = sse_event("One").to_vec();
        chunk.extend_from_slice(b"data: {not json\n\n");
        let bytes = stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from(chunk))]);

        let producer = tokio::spawn(pump_fragments(bytes, tx));
        let items = drain(fragments).await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "One");
        assert!(matches!(items[1], Err(Error::StreamInterrupted(_))));
        assert_eq!(
            producer.await.unwrap(),
            PumpOutcome::Interrupted { fragments: 1 }
        );
    }

    #[tokio::test]
    async fn pump_stops_when_consumer_drops() {
        let (tx, mut fragments) = FragmentStream::channel(1);
        // Upstream sends one event and then stalls forever
        let bytes = stream::iter(vec![Ok::<_, std::io::Error>(sse_event("One"))])
            .chain(stream::pending());

        let producer = tokio::spawn(pump_fragments(bytes, tx));
        assert_eq!(fragments.next().await.unwrap().unwrap(), "One");
        drop(fragments);

        assert_eq!(
            producer.await.unwrap(),
            PumpOutcome::Cancelled { fragments: 1 }
        );
    }

    #[test]
    fn build_request_uses_fixed_sampling_and_default_system_prompt() {
        let client = CompletionClient::with_http_client(reqwest::Client::new(), ready_upstream());
        let request = client.build_request("hello", None, false).unwrap();

        assert_eq!(request.model, "ep-test");
        assert_eq!(request.messages[0], Message::system(DEFAULT_SYSTEM_PROMPT));
        assert_eq!(request.messages[1], Message::user("hello"));
        assert_eq!(request.temperature, TEMPERATURE);
        assert_eq!(request.max_tokens, MAX_TOKENS);
        assert_eq!(request.top_p, TOP_P);
        assert!(!request.stream);
    }

    #[test]
    fn build_request_rejects_empty_prompt() {
        let client = CompletionClient::with_http_client(reqwest::Client::new(), ready_upstream());
        assert!(matches!(
            client.build_request("  ", None, true),
            Err(Error::BadRequest(_))
        ));
    }

    #[test]
    fn build_request_requires_model_id() {
        let upstream = UpstreamConfig {
            model_id: None,
            ..ready_upstream()
        };
        let client = CompletionClient::with_http_client(reqwest::Client::new(), upstream);
        assert!(matches!(
            client.build_request("hi", None, false),
            Err(Error::MissingSetting(MODEL_ID_VAR))
        ));
        assert!(!client.is_ready());
    }

    #[test]
    fn endpoint_strips_trailing_slash() {
        let upstream = UpstreamConfig {
            base_url: "http://127.0.0.1:1/api/v3/".to_string(),
            ..ready_upstream()
        };
        let client = CompletionClient::with_http_client(reqwest::Client::new(), upstream);
        assert_eq!(client.endpoint(), "http://127.0.0.1:1/api/v3/chat/completions");
    }
}
