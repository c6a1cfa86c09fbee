//! Completion client module.
//!
//! Issues chat-completion calls against the upstream provider and exposes the
//! result either as full text or as a [`FragmentStream`] of incremental text.

mod client;
mod sse;
pub mod types;

pub use client::{
    Completion, CompletionClient, FragmentStream, PumpOutcome, DEFAULT_SYSTEM_PROMPT, MAX_TOKENS,
    TEMPERATURE, TOP_P,
};

use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::Result;

/// Flatten a completion result to `Option`, logging the failure.
///
/// Keeps the relay's `{"result": null}` contract for setup failures while the
/// client itself stays typed.
pub fn flatten_failure<T>(result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::error!(error = %e, "Completion request failed");
            None
        }
    }
}

/// Run one prompt and write the answer to `out`, followed by a newline.
///
/// Streamed fragments are flushed as they arrive. Setup failures are logged
/// and reported as `Ok(false)` with nothing written; a failure after streaming
/// has started is returned as an error.
pub async fn write_answer<W>(
    client: &CompletionClient,
    prompt: &str,
    system_prompt: Option<&str>,
    stream: bool,
    out: &mut W,
) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    let Some(completion) = flatten_failure(client.complete(prompt, system_prompt, stream).await)
    else {
        return Ok(false);
    };

    match completion {
        Completion::Text(text) => out.write_all(text.as_bytes()).await?,
        Completion::Stream(mut fragments) => {
            while let Some(fragment) = fragments.next().await {
                out.write_all(fragment?.as_bytes()).await?;
                out.flush().await?;
            }
        }
    }
    out.write_all(b"\n").await?;
    out.flush().await?;
    Ok(true)
}
