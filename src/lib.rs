pub mod call;
pub mod config;
pub mod engine;
pub mod protocol;
pub mod signaling;
pub mod telemetry;

use thiserror::Error;

pub use call::{join_call, Call, CallEvent};
pub use config::CallConfig;

/// Failures surfaced by the call stack. Variants mirror the seams they
/// originate from so callers can decide what is retryable.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("setup failed: {0}")]
    Setup(String),
    #[error("signaling failure: {0}")]
    Signaling(String),
    #[error("media engine failure: {0}")]
    Engine(String),
    #[error("channel closed")]
    ChannelClosed,
}

impl CallError {
    pub fn setup(message: impl Into<String>) -> Self {
        Self::Setup(message.into())
    }

    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine(message.into())
    }
}
