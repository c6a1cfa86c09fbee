//! HTTP relay module.
//!
//! Serves `POST /api/ai`, which forwards a prompt to the completion client and
//! answers with either a JSON result or a raw `text/event-stream` body.

mod handlers;
mod server;
pub mod stream;
pub mod types;

pub use server::{create_router, run_server, AppState, RequestId, REQUEST_ID_HEADER};
pub use stream::{event_stream_response, RelayBody, RelayState};
pub use types::{RelayRequest, RelayResponse};
