//! Service-specific error types
//!
//! Outward failures follow the relay's (code, message) convention: `-1` for
//! generic failures, `429` when the retry budget died on rate limits, and a
//! passthrough of whatever the last classification produced otherwise.
//! Per-attempt failures never surface here; they are absorbed by the retry
//! loop and only the terminal outcome becomes a `RelayError`.

use thiserror::Error;

/// Terminal request failures surfaced to the caller.
#[derive(Error, Debug)]
pub enum RelayError {
    /// No usable credential at request start or during failover.
    #[error("credential pool exhausted: {0}")]
    PoolExhausted(String),

    /// The shared challenge artifact could not be refreshed. Fatal before the
    /// backend is ever invoked.
    #[error("challenge fetch failed: {0}")]
    ChallengeFetch(String),

    /// The attempt budget ran out; carries the last classification's outward
    /// code and message.
    #[error("{message}")]
    Exhausted { code: i32, message: String },

    /// The backend answered successfully but streamed no content at all.
    /// Not a backend error.
    #[error("empty response from backend")]
    EmptyResponse,

    /// Stream consumption failed after the call had already succeeded.
    #[error("response stream failed: {0}")]
    Stream(String),
}

impl RelayError {
    /// Outward error code.
    pub fn code(&self) -> i32 {
        match self {
            RelayError::Exhausted { code, .. } => *code,
            RelayError::PoolExhausted(_)
            | RelayError::ChallengeFetch(_)
            | RelayError::EmptyResponse
            | RelayError::Stream(_) => -1,
        }
    }

    /// HTTP status for the outward code: 429 maps through, everything else
    /// is an internal server error.
    pub fn http_status(&self) -> u16 {
        if self.code() == 429 { 429 } else { 500 }
    }
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, RelayError>;
