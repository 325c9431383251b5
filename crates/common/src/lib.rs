//! Common types for chat-relay

mod error;
mod redact;

pub use error::{Error, Result};
pub use redact::redact;
