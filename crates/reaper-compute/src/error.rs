//! Compute API error types.

use thiserror::Error;

/// Errors that fail a whole compute call.
#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("compute api returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("failed to obtain access token: {0}")]
    Auth(String),

    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl ComputeError {
    /// Whether the provider rejected the call for rate or quota reasons.
    pub fn is_throttling(&self) -> bool {
        is_throttling(&self.to_string())
    }
}

pub type ComputeResult<T> = Result<T, ComputeError>;

/// Known throttling signatures, matched case-insensitively.
const THROTTLING_SIGNATURES: &[&str] = &["rate limit", "quota exceeded"];

/// Classify provider error text as throttling.
pub fn is_throttling(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    THROTTLING_SIGNATURES.iter().any(|sig| message.contains(sig))
}
