//! Event-stream relay of completion fragments to the HTTP client.
//!
//! Each fragment becomes one body write, as raw text with no `data:` framing.
//! A mid-stream upstream failure aborts the body without an error payload.

use std::pin::Pin;
use std::task::{ready, Context, Poll};

use axum::body::Body;
use axum::http::{header, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::Stream;

use crate::completion::FragmentStream;

/// Response header telling reverse proxies (nginx) not to buffer.
pub const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// Progress of a single streamed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    AwaitingFirstChunk,
    RelayingChunks,
    Completed,
}

/// Response body that forwards fragments as they arrive.
pub struct RelayBody {
    fragments: FragmentStream,
    state: RelayState,
    relayed: usize,
}

impl RelayBody {
    pub fn new(fragments: FragmentStream) -> Self {
        Self {
            fragments,
            state: RelayState::AwaitingFirstChunk,
            relayed: 0,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }
}

impl Stream for RelayBody {
    type Item = std::result::Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.state == RelayState::Completed {
            return Poll::Ready(None);
        }

        match ready!(Pin::new(&mut self.fragments).poll_next(cx)) {
            Some(Ok(fragment)) => {
                if self.state == RelayState::AwaitingFirstChunk {
                    tracing::debug!("First fragment relayed");
                    self.state = RelayState::RelayingChunks;
                }
                self.relayed += 1;
                Poll::Ready(Some(Ok(Bytes::from(fragment))))
            }
            Some(Err(e)) => {
                tracing::warn!(
                    error = %e,
                    relayed = self.relayed,
                    "Upstream failed mid-stream, closing connection"
                );
                self.state = RelayState::Completed;
                Poll::Ready(Some(Err(std::io::Error::other(e))))
            }
            None => {
                tracing::debug!(relayed = self.relayed, "Event stream completed");
                self.state = RelayState::Completed;
                Poll::Ready(None)
            }
        }
    }
}

/// Build the `text/event-stream` response for a fragment stream.
pub fn event_stream_response(fragments: FragmentStream) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
            (X_ACCEL_BUFFERING, "no"),
        ],
        Body::from_stream(RelayBody::new(fragments)),
    )
        .into_response()
}
