//! ark-relay - Streaming HTTP relay for hosted chat-completion models
//!
//! This library provides the completion client, the HTTP relay endpoint
//! and the configuration they are built from.

pub mod completion;
pub mod config;
pub mod error;
pub mod relay;

pub use config::Config;
pub use error::{Error, Result};
