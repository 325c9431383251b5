//! Shared challenge-artifact cache
//!
//! The backend refuses calls without a valid browser-challenge cookie, and
//! obtaining one is expensive (a headless-browser helper solves it). The cache
//! holds the single process-wide artifact and makes sure that however many
//! requests race on a stale artifact, exactly one fetch hits the helper.
//!
//! Double-checked locking: the fast path takes the read lock and returns the
//! cached artifact when valid; the slow path takes the write lock, re-checks
//! (another caller may have refreshed while we waited), and only then fetches.
//! The fetch happens under the write lock, which is what deduplicates
//! concurrent refreshes.

use backend::Challenge;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct ClearanceResponse {
    data: ClearanceData,
}

#[derive(Debug, Deserialize)]
struct ClearanceData {
    cookie: String,
    #[serde(rename = "userAgent")]
    user_agent: String,
    lang: String,
}

struct CacheState {
    challenge: Challenge,
    valid: bool,
}

/// Thread-safe cache around the single challenge artifact.
pub struct ChallengeCache {
    client: reqwest::Client,
    endpoint: String,
    state: RwLock<CacheState>,
}

impl ChallengeCache {
    /// Create a cache fetching from the given clearance endpoint URL.
    /// The artifact starts invalid with the default fingerprint.
    pub fn new(client: reqwest::Client, endpoint: String) -> Self {
        Self {
            client,
            endpoint,
            state: RwLock::new(CacheState {
                challenge: Challenge::default(),
                valid: false,
            }),
        }
    }

    /// Cache backed by the co-located challenge service on localhost.
    pub fn for_port(client: reqwest::Client, port: u16) -> Self {
        Self::new(client, format!("http://127.0.0.1:{port}/clearance"))
    }

    /// Return a valid challenge artifact, fetching one if needed.
    ///
    /// Concurrent callers observing an invalid artifact trigger exactly one
    /// fetch. A failed fetch leaves the cache invalid and surfaces the error;
    /// nothing partial is ever stored.
    pub async fn ensure_valid(&self) -> Result<Challenge> {
        {
            let state = self.state.read().await;
            if state.valid {
                return Ok(state.challenge.clone());
            }
        }

        let mut state = self.state.write().await;
        if state.valid {
            // Refreshed by whoever held the write lock before us
            return Ok(state.challenge.clone());
        }

        let challenge = self.fetch().await?;
        info!("challenge artifact refreshed");
        state.challenge = challenge.clone();
        state.valid = true;
        Ok(challenge)
    }

    /// Drop the artifact's validity. Idempotent; the next `ensure_valid`
    /// triggers one fresh fetch.
    pub async fn invalidate(&self) {
        let mut state = self.state.write().await;
        if state.valid || !state.challenge.cookie.is_empty() {
            info!("challenge artifact invalidated");
        }
        state.challenge.cookie.clear();
        state.valid = false;
    }

    /// Snapshot of the current artifact regardless of validity. The sweep
    /// probes with whatever fingerprint is on hand, even an empty cookie.
    pub async fn current(&self) -> Challenge {
        self.state.read().await.challenge.clone()
    }

    /// Whether the cached artifact is currently valid.
    pub async fn is_valid(&self) -> bool {
        self.state.read().await.valid
    }

    async fn fetch(&self) -> Result<Challenge> {
        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|e| Error::ChallengeFetch(e.to_string()))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "challenge service returned error");
            return Err(Error::ChallengeFetch(format!(
                "challenge service returned {status}: {body}"
            )));
        }

        let parsed: ClearanceResponse = response
            .json()
            .await
            .map_err(|e| Error::ChallengeFetch(format!("invalid clearance payload: {e}")))?;

        Ok(Challenge {
            cookie: parsed.data.cookie,
            user_agent: parsed.data.user_agent,
            lang: parsed.data.lang,
        })
    }
}
