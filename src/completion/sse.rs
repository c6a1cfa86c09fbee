//! Line-buffered decoding of upstream SSE streaming responses.
//!
//! [`SseDecoder`] reassembles `data:` lines across TCP chunk boundaries and
//! turns each OpenAI-compatible chunk into its incremental text, if any.
//! An in-band error event, an undecodable `data:` payload or an oversized
//! line ends decoding with [`Error::StreamInterrupted`].

use super::types::ChatCompletionChunk;
use crate::error::{Error, Result};

/// Longest partial line kept while waiting for a newline.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Incremental SSE decoder for chat-completion chunks.
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
    done_received: bool,
    finish_reason: Option<String>,
}

impl SseDecoder {
    /// Create a new decoder with empty state.
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            done_received: false,
            finish_reason: None,
        }
    }

    /// Feed a chunk of bytes, appending the text fragments it completes to `fragments`.
    ///
    /// On error, `fragments` still holds everything decoded before the failing line.
    pub fn feed(&mut self, bytes: &[u8], fragments: &mut Vec<String>) -> Result<()> {
        self.buffer.extend_from_slice(bytes);

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.process_line(&line, fragments)?;
        }

        if self.buffer.len() > MAX_LINE_BYTES {
            let buffered = self.buffer.len();
            self.buffer.clear();
            return Err(Error::StreamInterrupted(format!(
                "SSE line exceeded {} bytes ({} buffered)",
                MAX_LINE_BYTES, buffered
            )));
        }

        Ok(())
    }

    /// Flush any remaining buffered bytes as a final line.
    pub fn finish(&mut self, fragments: &mut Vec<String>) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let line = std::mem::take(&mut self.buffer);
        self.process_line(&line, fragments)
    }

    /// Whether `data: [DONE]` has been seen.
    pub fn done_received(&self) -> bool {
        self.done_received
    }

    /// The finish_reason from the last chunk that carried one.
    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    /// Process a single complete SSE line (terminator included).
    fn process_line(&mut self, raw: &[u8], fragments: &mut Vec<String>) -> Result<()> {
        let line = std::str::from_utf8(raw)
            .map_err(|e| Error::StreamInterrupted(format!("SSE line is not UTF-8: {}", e)))?;
        let line = line.trim_end_matches(['\r', '\n']);

        // event:, id:, retry: and comment lines carry no completion data
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(());
        };
        let data = data.strip_prefix(' ').unwrap_or(data);
        self.process_data(data, fragments)
    }

    /// Process the payload of a `data:` line.
    fn process_data(&mut self, data: &str, fragments: &mut Vec<String>) -> Result<()> {
        if self.done_received {
            return Ok(());
        }
        let trimmed = data.trim();
        if trimmed == "[DONE]" {
            self.done_received = true;
            return Ok(());
        }
        if trimmed.is_empty() {
            return Ok(());
        }

        let chunk: ChatCompletionChunk = serde_json::from_str(data).map_err(|e| {
            Error::StreamInterrupted(format!("Undecodable SSE data line: {}", e))
        })?;

        if let Some(message) = chunk.error_message() {
            return Err(Error::StreamInterrupted(format!(
                "Provider reported an error mid-stream: {}",
                message
            )));
        }
        if let Some(reason) = chunk.finish_reason() {
            self.finish_reason = Some(reason.to_string());
        }
        if let Some(fragment) = chunk.fragment() {
            fragments.push(fragment.to_string());
        }
        Ok(())
    }
}
