//! HTTP chat backend
//!
//! Talks to the upstream chat service over its SSE interface. Credentials are
//! session cookies; the challenge artifact contributes the clearance cookie
//! and the browser fingerprint headers the service expects alongside it.

use backend::{BackendError, BoxFuture, Challenge, ChatBackend, ChatRequest, ChunkStream};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

/// Marker in the upstream error body for a fully spent subscription.
const ZERO_QUOTA_MARKER: &str = "ZERO QUOTA";

pub struct HttpChatBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpChatBackend {
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        credential: &str,
        challenge: &Challenge,
    ) -> reqwest::RequestBuilder {
        let cookie = if challenge.cookie.is_empty() {
            credential.to_string()
        } else {
            format!("{credential}; {}", challenge.cookie)
        };
        self.client
            .request(method, format!("{}{path}", self.base_url))
            .header(reqwest::header::COOKIE, cookie)
            .header(reqwest::header::USER_AGENT, &challenge.user_agent)
            .header(reqwest::header::ACCEPT_LANGUAGE, &challenge.lang)
    }
}

/// Map a non-success upstream response to a backend error, recognizing the
/// spent-quota marker in the body.
async fn error_from_response(response: reqwest::Response) -> BackendError {
    let code = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    if body.contains(ZERO_QUOTA_MARKER) {
        return BackendError::QuotaExhausted;
    }
    BackendError::Status {
        code,
        message: body,
    }
}

#[derive(Debug, Deserialize)]
struct SseEvent {
    #[serde(default)]
    token: String,
}

#[derive(Debug, Deserialize)]
struct QuotaResponse {
    remaining: u32,
}

/// Turn an SSE body into a stream of content tokens.
///
/// Lines are `data: <json>` events carrying a `token` field; `data: [DONE]`
/// ends the stream. Anything unparseable is skipped, a transport error ends
/// the stream after surfacing once.
fn sse_chunk_stream(response: reqwest::Response) -> ChunkStream {
    type ByteStream =
        std::pin::Pin<Box<dyn futures_util::Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>;
    let bytes: ByteStream = Box::pin(response.bytes_stream());

    let stream = futures_util::stream::unfold(
        (bytes, String::new(), false),
        |(mut bytes, mut buffer, done)| async move {
            if done {
                return None;
            }
            loop {
                if let Some(pos) = buffer.find('\n') {
                    let line: String = buffer.drain(..=pos).collect();
                    let line = line.trim_end();
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        return None;
                    }
                    match serde_json::from_str::<SseEvent>(data) {
                        Ok(event) if !event.token.is_empty() => {
                            return Some((Ok(event.token), (bytes, buffer, false)));
                        }
                        Ok(_) => continue,
                        Err(err) => {
                            debug!(%err, "skipping unparseable stream event");
                            continue;
                        }
                    }
                }

                match bytes.next().await {
                    Some(Ok(chunk)) => buffer.push_str(&String::from_utf8_lossy(&chunk)),
                    Some(Err(err)) => {
                        return Some((
                            Err(BackendError::Network(err.to_string())),
                            (bytes, buffer, true),
                        ));
                    }
                    None => return None,
                }
            }
        },
    );
    Box::pin(stream)
}

impl ChatBackend for HttpChatBackend {
    fn send_chat<'a>(
        &'a self,
        credential: &'a str,
        challenge: &'a Challenge,
        request: &'a ChatRequest,
    ) -> BoxFuture<'a, Result<ChunkStream, BackendError>> {
        Box::pin(async move {
            let response = self
                .request(reqwest::Method::POST, "/api/chat", credential, challenge)
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .json(&json!({
                    "model": request.model,
                    "messages": request.messages,
                }))
                .send()
                .await
                .map_err(|e| BackendError::Network(e.to_string()))?;

            if !response.status().is_success() {
                return Err(error_from_response(response).await);
            }
            Ok(sse_chunk_stream(response))
        })
    }

    fn remaining_quota<'a>(
        &'a self,
        credential: &'a str,
        challenge: &'a Challenge,
    ) -> BoxFuture<'a, Result<u32, BackendError>> {
        Box::pin(async move {
            let response = self
                .request(reqwest::Method::GET, "/api/quota", credential, challenge)
                .send()
                .await
                .map_err(|e| BackendError::Network(e.to_string()))?;

            if !response.status().is_success() {
                return Err(error_from_response(response).await);
            }

            let quota: QuotaResponse = response
                .json()
                .await
                .map_err(|e| BackendError::Network(format!("invalid quota payload: {e}")))?;
            Ok(quota.remaining)
        })
    }
}
