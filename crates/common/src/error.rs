//! Startup and configuration errors
//!
//! Everything here is trouble getting the relay off the ground: a config
//! file that cannot be read or parsed, or a value that fails validation.
//! Runtime failures (pool, challenge, backend) live in the crates that
//! produce them.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A config value failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed config file: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result alias for configuration loading.
pub type Result<T> = std::result::Result<T, Error>;
