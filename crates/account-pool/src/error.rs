//! Error types for pool operations
//!
//! Unknown tokens are deliberately not an error: `set_status` and `release`
//! treat them as no-ops so racing callers never have a failure path.

/// Errors from pool and challenge-cache operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("credential pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("challenge fetch failed: {0}")]
    ChallengeFetch(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
