//! Retry and failover orchestration
//!
//! Runs one chat request against the backend with up to three attempts, each
//! on a freshly acquired credential. Failure classification decides what each
//! failed attempt costs: rate limits and rejections disable the credential,
//! transient faults leave it alone. Every credential touched by the request is
//! released when the request ends, win or lose, so a transiently-failed
//! credential returns to rotation without ever being retried within the same
//! request.

use std::sync::Arc;

use account_pool::{ChallengeCache, CredentialPool, CredentialStatus};
use backend::{ChatBackend, ChatRequest, FailureKind, classify, requires_challenge_refresh};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::RelayError;
use crate::metrics;
use crate::stream::{Matcher, StopSequenceMatcher, drain};

/// Attempt budget per request.
pub const MAX_ATTEMPTS: usize = 3;

/// Stop sequence applied to every response on top of the request's own.
const DEFAULT_STOP: &str = "\n\nHuman:";

pub struct Orchestrator {
    pool: Arc<CredentialPool>,
    cache: Arc<ChallengeCache>,
    backend: Arc<dyn ChatBackend>,
}

impl Orchestrator {
    pub fn new(
        pool: Arc<CredentialPool>,
        cache: Arc<ChallengeCache>,
        backend: Arc<dyn ChatBackend>,
    ) -> Self {
        Self {
            pool,
            cache,
            backend,
        }
    }

    /// Execute a chat request with retry and failover.
    ///
    /// Returns the complete response text. When `sink` is given, chunks are
    /// additionally forwarded through it as they arrive, but only once an
    /// attempt's stream has started; failed attempts never leak output.
    pub async fn execute(
        &self,
        request: &ChatRequest,
        sink: Option<mpsc::Sender<String>>,
    ) -> Result<String, RelayError> {
        let mut used: Vec<String> = Vec::new();
        let result = self.run_attempts(request, sink, &mut used).await;
        for token in &used {
            self.pool.release(token).await;
        }
        result
    }

    async fn run_attempts(
        &self,
        request: &ChatRequest,
        sink: Option<mpsc::Sender<String>>,
        used: &mut Vec<String>,
    ) -> Result<String, RelayError> {
        let mut last_code = -1;
        let mut last_message = String::from("all attempts failed");

        for attempt in 1..=MAX_ATTEMPTS {
            let lease = self
                .pool
                .acquire()
                .await
                .map_err(|e| RelayError::PoolExhausted(e.to_string()))?;
            used.push(lease.token.clone());

            // Challenge trouble is environmental, not credential-specific:
            // retrying with another credential cannot help, so it is fatal.
            let challenge = self
                .cache
                .ensure_valid()
                .await
                .map_err(|e| RelayError::ChallengeFetch(e.to_string()))?;

            debug!(
                attempt,
                credential = %common::redact(&lease.token),
                "dispatching chat attempt"
            );

            match self.backend.send_chat(&lease.token, &challenge, request).await {
                Ok(chunks) => {
                    metrics::record_attempt("success");
                    let cancel = CancellationToken::new();
                    let outcome = drain(chunks, build_matchers(request), cancel, sink.as_ref())
                        .await
                        .map_err(|e| RelayError::Stream(e.to_string()))?;

                    if outcome.text.is_empty() && !outcome.cancelled {
                        return Err(RelayError::EmptyResponse);
                    }
                    return Ok(outcome.text);
                }
                Err(err) => {
                    let kind = classify(&err);
                    metrics::record_attempt(kind.label());
                    warn!(
                        attempt,
                        credential = %common::redact(&lease.token),
                        kind = kind.label(),
                        error = %err,
                        "chat attempt failed"
                    );

                    match kind {
                        FailureKind::RateLimited => {
                            self.pool
                                .set_status(&lease.token, CredentialStatus::Disabled)
                                .await;
                            if requires_challenge_refresh(&err) {
                                self.cache.invalidate().await;
                            }
                        }
                        FailureKind::Unauthorized => {
                            self.pool
                                .set_status(&lease.token, CredentialStatus::Disabled)
                                .await;
                        }
                        // Transient: the credential stays leased until the
                        // request ends, keeping it out of this request's own
                        // failover rotation.
                        FailureKind::Transient => {}
                    }

                    last_code = kind.outward_code();
                    last_message = err.to_string();
                }
            }
        }

        Err(RelayError::Exhausted {
            code: last_code,
            message: last_message,
        })
    }
}

/// One stop-sequence matcher per configured stop, plus the default stop when
/// the request does not already carry it.
fn build_matchers(request: &ChatRequest) -> Vec<Box<dyn Matcher>> {
    let mut matchers: Vec<Box<dyn Matcher>> = request
        .stop
        .iter()
        .map(|s| Box::new(StopSequenceMatcher::new(s.clone())) as Box<dyn Matcher>)
        .collect();
    if !request.stop.iter().any(|s| s == DEFAULT_STOP) {
        matchers.push(Box::new(StopSequenceMatcher::new(DEFAULT_STOP)));
    }
    matchers
}

#[cfg(test)]
mod tests {
    use super::*;
    use backend::{BackendError, BoxFuture, Challenge, ChunkStream, Message};
    use futures_util::stream;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    #[derive(Clone)]
    enum ChatScript {
        Chunks(Vec<&'static str>),
        Status(u16),
        QuotaGone,
        NetworkError,
    }

    struct ScriptedBackend {
        scripts: HashMap<String, ChatScript>,
        invocations: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn new(scripts: &[(&str, ChatScript)]) -> Self {
            Self {
                scripts: scripts
                    .iter()
                    .map(|(token, script)| (token.to_string(), script.clone()))
                    .collect(),
                invocations: Mutex::new(Vec::new()),
            }
        }

        fn invocations(&self) -> Vec<String> {
            self.invocations.lock().unwrap().clone()
        }
    }

    impl ChatBackend for ScriptedBackend {
        fn send_chat<'a>(
            &'a self,
            credential: &'a str,
            _challenge: &'a Challenge,
            _request: &'a ChatRequest,
        ) -> BoxFuture<'a, Result<ChunkStream, BackendError>> {
            let script = self.scripts.get(credential).cloned();
            self.invocations.lock().unwrap().push(credential.to_string());
            Box::pin(async move {
                match script {
                    Some(ChatScript::Chunks(chunks)) => {
                        let items: Vec<Result<String, BackendError>> =
                            chunks.iter().map(|c| Ok(c.to_string())).collect();
                        Ok(Box::pin(stream::iter(items)) as ChunkStream)
                    }
                    Some(ChatScript::Status(code)) => Err(BackendError::Status {
                        code,
                        message: format!("backend returned {code}"),
                    }),
                    Some(ChatScript::QuotaGone) => Err(BackendError::QuotaExhausted),
                    Some(ChatScript::NetworkError) => {
                        Err(BackendError::Network("connection reset".into()))
                    }
                    None => Err(BackendError::Network("unscripted credential".into())),
                }
            })
        }

        fn remaining_quota<'a>(
            &'a self,
            _credential: &'a str,
            _challenge: &'a Challenge,
        ) -> BoxFuture<'a, Result<u32, BackendError>> {
            Box::pin(async { Ok(1) })
        }
    }

    async fn start_clearance_server() -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("http://{addr}/clearance");

        tokio::spawn(async move {
            let app = axum::Router::new().route(
                "/clearance",
                axum::routing::get(move || {
                    let hits = hits_clone.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        (
                            [(axum::http::header::CONTENT_TYPE, "application/json")],
                            r#"{"data":{"cookie":"cf_clearance=abc","userAgent":"TestAgent/1.0","lang":"en-US"}}"#,
                        )
                    }
                }),
            );
            axum::serve(listener, app).await.unwrap();
        });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        (url, hits)
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "test-model".into(),
            messages: vec![Message {
                role: "user".into(),
                content: "hello".into(),
            }],
            stream: false,
            stop: Vec::new(),
        }
    }

    struct Setup {
        orchestrator: Orchestrator,
        pool: Arc<CredentialPool>,
        backend: Arc<ScriptedBackend>,
        clearance_hits: Arc<AtomicUsize>,
    }

    async fn setup(tokens: &[&str], scripts: &[(&str, ChatScript)]) -> Setup {
        let (url, clearance_hits) = start_clearance_server().await;
        let pool = Arc::new(CredentialPool::new(
            tokens.iter().map(|t| t.to_string()).collect(),
        ));
        let cache = Arc::new(ChallengeCache::new(reqwest::Client::new(), url));
        let backend = Arc::new(ScriptedBackend::new(scripts));
        let orchestrator = Orchestrator::new(pool.clone(), cache.clone(), backend.clone());
        Setup {
            orchestrator,
            pool,
            backend,
            clearance_hits,
        }
    }

    #[tokio::test]
    async fn failover_to_second_credential_after_rate_limit() {
        let s = setup(
            &["token-aaaa", "token-bbbb"],
            &[
                ("token-aaaa", ChatScript::Status(403)),
                ("token-bbbb", ChatScript::Chunks(vec!["hi ", "there"])),
            ],
        )
        .await;

        let text = s.orchestrator.execute(&request(), None).await.unwrap();

        assert_eq!(text, "hi there");
        assert_eq!(s.backend.invocations(), vec!["token-aaaa", "token-bbbb"]);
        // 403 disables the first credential and invalidates the challenge,
        // so the second attempt refetched it
        let health = s.pool.health().await;
        assert_eq!(health["credentials_disabled"], 1);
        assert_eq!(s.clearance_hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn three_quota_failures_exhaust_with_429() {
        let s = setup(
            &["token-aaaa", "token-bbbb", "token-cccc"],
            &[
                ("token-aaaa", ChatScript::QuotaGone),
                ("token-bbbb", ChatScript::QuotaGone),
                ("token-cccc", ChatScript::QuotaGone),
            ],
        )
        .await;

        let err = s.orchestrator.execute(&request(), None).await.unwrap_err();

        match err {
            RelayError::Exhausted { code, .. } => assert_eq!(code, 429),
            other => panic!("expected Exhausted, got {other:?}"),
        }
        assert_eq!(s.backend.invocations().len(), 3);
        assert_eq!(s.pool.health().await["credentials_disabled"], 3);
    }

    #[tokio::test]
    async fn empty_pool_fails_without_invoking_backend() {
        let s = setup(&[], &[]).await;

        let err = s.orchestrator.execute(&request(), None).await.unwrap_err();

        assert!(matches!(err, RelayError::PoolExhausted(_)));
        assert!(s.backend.invocations().is_empty());
    }

    #[tokio::test]
    async fn challenge_fetch_failure_is_fatal_and_releases_credential() {
        let pool = Arc::new(CredentialPool::new(vec!["token-aaaa".into()]));
        let cache = Arc::new(ChallengeCache::new(
            reqwest::Client::new(),
            "http://127.0.0.1:1/clearance".into(),
        ));
        let backend = Arc::new(ScriptedBackend::new(&[(
            "token-aaaa",
            ChatScript::Chunks(vec!["never reached"]),
        )]));
        let orchestrator = Orchestrator::new(pool.clone(), cache, backend.clone());

        let err = orchestrator.execute(&request(), None).await.unwrap_err();

        assert!(matches!(err, RelayError::ChallengeFetch(_)));
        assert!(backend.invocations().is_empty(), "fatal before the backend call");
        assert_eq!(pool.available_count().await, 1, "credential must be released");
    }

    #[tokio::test]
    async fn empty_stream_is_an_empty_response_error() {
        let s = setup(
            &["token-aaaa"],
            &[("token-aaaa", ChatScript::Chunks(vec![]))],
        )
        .await;

        let err = s.orchestrator.execute(&request(), None).await.unwrap_err();

        assert!(matches!(err, RelayError::EmptyResponse));
        assert_eq!(err.code(), -1);
        assert_eq!(s.pool.available_count().await, 1);
    }

    #[tokio::test]
    async fn transient_failure_keeps_credential_and_fails_over() {
        let s = setup(
            &["token-aaaa", "token-bbbb"],
            &[
                ("token-aaaa", ChatScript::NetworkError),
                ("token-bbbb", ChatScript::Chunks(vec!["recovered"])),
            ],
        )
        .await;

        let text = s.orchestrator.execute(&request(), None).await.unwrap();

        assert_eq!(text, "recovered");
        // The transiently-failed credential was released, not disabled
        assert_eq!(s.pool.health().await["credentials_disabled"], 0);
        assert_eq!(s.pool.available_count().await, 2);
    }

    #[tokio::test]
    async fn transient_failures_never_retry_the_same_credential() {
        let s = setup(
            &["token-aaaa", "token-bbbb", "token-cccc"],
            &[
                ("token-aaaa", ChatScript::NetworkError),
                ("token-bbbb", ChatScript::NetworkError),
                ("token-cccc", ChatScript::NetworkError),
            ],
        )
        .await;

        let err = s.orchestrator.execute(&request(), None).await.unwrap_err();

        match err {
            RelayError::Exhausted { code, .. } => assert_eq!(code, -1),
            other => panic!("expected Exhausted, got {other:?}"),
        }
        let mut invocations = s.backend.invocations();
        invocations.sort();
        invocations.dedup();
        assert_eq!(invocations.len(), 3, "each attempt must use a distinct credential");
        // All released at request end
        assert_eq!(s.pool.available_count().await, 3);
    }

    #[tokio::test]
    async fn unauthorized_disables_without_touching_challenge() {
        let s = setup(
            &["token-aaaa", "token-bbbb"],
            &[
                ("token-aaaa", ChatScript::Status(401)),
                ("token-bbbb", ChatScript::Chunks(vec!["ok"])),
            ],
        )
        .await;

        let text = s.orchestrator.execute(&request(), None).await.unwrap();

        assert_eq!(text, "ok");
        assert_eq!(s.pool.health().await["credentials_disabled"], 1);
        // 401 is not a challenge problem: one initial fetch only
        assert_eq!(s.clearance_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn default_stop_sequence_truncates_response() {
        let s = setup(
            &["token-aaaa"],
            &[(
                "token-aaaa",
                ChatScript::Chunks(vec!["the answer\n\nHuman: next question"]),
            )],
        )
        .await;

        let text = s.orchestrator.execute(&request(), None).await.unwrap();
        assert_eq!(text, "the answer");
    }

    #[tokio::test]
    async fn request_stop_sequences_apply_alongside_default() {
        let s = setup(
            &["token-aaaa"],
            &[("token-aaaa", ChatScript::Chunks(vec!["abcENDxyz"]))],
        )
        .await;

        let mut req = request();
        req.stop = vec!["END".into()];
        let text = s.orchestrator.execute(&req, None).await.unwrap();
        assert_eq!(text, "abc");
    }

    #[tokio::test]
    async fn cancelled_response_with_no_text_is_not_empty_response() {
        let s = setup(
            &["token-aaaa"],
            &[(
                "token-aaaa",
                ChatScript::Chunks(vec!["\n\nHuman: echo of the prompt"]),
            )],
        )
        .await;

        // The stop fired before any content; that is a deliberate truncation,
        // not a backend malfunction
        let text = s.orchestrator.execute(&request(), None).await.unwrap();
        assert_eq!(text, "");
    }

    #[tokio::test]
    async fn sink_receives_streamed_chunks() {
        let s = setup(
            &["token-aaaa"],
            &[("token-aaaa", ChatScript::Chunks(vec!["alpha ", "beta"]))],
        )
        .await;

        let (tx, mut rx) = mpsc::channel(16);
        let text = s.orchestrator.execute(&request(), Some(tx)).await.unwrap();

        assert_eq!(text, "alpha beta");
        let mut streamed = String::new();
        while let Some(piece) = rx.recv().await {
            streamed.push_str(&piece);
        }
        assert_eq!(streamed, "alpha beta");
    }
}
