//! Backend collaborator interfaces for the chat relay
//!
//! Defines the `ChatBackend` trait that decouples the retry orchestrator and
//! the health sweep from the concrete HTTP client. A backend is anything that
//! can run one streaming chat turn with a (credential, challenge) pair and
//! answer a lightweight remaining-quota probe for a credential.
//!
//! Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
//! (`Arc<dyn ChatBackend>`), the same seam shape the rest of the workspace
//! relies on.

pub mod classify;

pub use classify::{FailureKind, classify, requires_challenge_refresh};

use std::future::Future;
use std::pin::Pin;

use futures_util::Stream;
use serde::{Deserialize, Serialize};

/// Default browser fingerprint used before the challenge service has answered.
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36 Edg/125.0.0.0";
const DEFAULT_LANG: &str = "cn-ZN,cn;q=0.9";

/// Proof-of-browser context required by the backend: the challenge cookie plus
/// the fingerprint fields the cookie was issued against. The cookie and the
/// fingerprint must be sent together or the backend rejects the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub cookie: String,
    pub user_agent: String,
    pub lang: String,
}

impl Default for Challenge {
    fn default() -> Self {
        Self {
            cookie: String::new(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            lang: DEFAULT_LANG.to_string(),
        }
    }
}

/// One message of a normalized chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

/// A normalized chat turn as accepted by the relay's completion entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub stream: bool,
    /// Client-supplied stop sequences; the relay appends its own defaults.
    #[serde(default)]
    pub stop: Vec<String>,
}

/// Errors surfaced by a backend call.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// HTTP/protocol-level failure with the upstream status code.
    #[error("backend returned status {code}: {message}")]
    Status { code: u16, message: String },

    /// The credential's usage quota is spent, independent of status code.
    #[error("backend quota exhausted for credential")]
    QuotaExhausted,

    /// Connection-level fault: DNS, TLS, reset, malformed frame.
    #[error("backend network error: {0}")]
    Network(String),
}

/// Lazy sequence of response text chunks pushed by the backend.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, BackendError>> + Send>>;

/// Boxed future used by `ChatBackend` methods for dyn-compatibility.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Abstraction over the remote chat backend.
///
/// The orchestrator calls `send_chat` with the credential it acquired from the
/// pool and the current challenge snapshot; the health sweep calls
/// `remaining_quota` to decide whether a sidelined credential can come back.
/// Neither method imposes a timeout itself — `send_chat` is bounded by the
/// outer request deadline, and the sweep wraps the probe in its own timeout.
pub trait ChatBackend: Send + Sync {
    /// Run one chat turn, returning the streamed response chunks.
    fn send_chat<'a>(
        &'a self,
        credential: &'a str,
        challenge: &'a Challenge,
        request: &'a ChatRequest,
    ) -> BoxFuture<'a, Result<ChunkStream, BackendError>>;

    /// Probe how many requests the credential has left.
    fn remaining_quota<'a>(
        &'a self,
        credential: &'a str,
        challenge: &'a Challenge,
    ) -> BoxFuture<'a, Result<u32, BackendError>>;
}
