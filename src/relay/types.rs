//! Request and response bodies for the relay endpoint.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Body of `POST /api/ai`.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayRequest {
    /// The user prompt. Optional here so a missing field gets the same 400 as an empty one.
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub stream: bool,
}

impl RelayRequest {
    /// The prompt, if it is present and not blank.
    pub fn prompt(&self) -> Result<&str> {
        match self.input.as_deref() {
            Some(input) if !input.trim().is_empty() => Ok(input),
            Some(_) => Err(Error::BadRequest("input must not be empty".to_string())),
            None => Err(Error::BadRequest("input is required".to_string())),
        }
    }
}

/// Non-streaming response body. `result` is null when the upstream call failed.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RelayResponse {
    pub result: Option<String>,
}
