//! Credential state machine and round-robin selection
//!
//! The pool owns every credential's token and health status. Selection is
//! round-robin among `Available` entries; acquisition marks the entry
//! `InFlight` under the same lock, so two concurrent requests can never lease
//! the same credential.
//!
//! Release is conditional: it restores `Available` only while the entry is
//! still `InFlight`. A sweep or a failure classification that disabled the
//! credential in the meantime wins over the release.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Runtime status of a pooled credential.
///
/// Transitions:
/// - Available → InFlight (acquired by a request)
/// - InFlight → Available (released, still in flight)
/// - InFlight → Disabled (backend rejected it mid-request)
/// - Disabled → Available (sweep probe reports remaining quota)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStatus {
    Available,
    InFlight,
    Disabled,
}

impl CredentialStatus {
    /// Status label for health output and logging.
    pub fn label(&self) -> &'static str {
        match self {
            CredentialStatus::Available => "available",
            CredentialStatus::InFlight => "in_flight",
            CredentialStatus::Disabled => "disabled",
        }
    }
}

#[derive(Debug)]
struct Entry {
    token: String,
    status: CredentialStatus,
    last_probed: Option<Instant>,
}

/// An acquired credential, valid for the duration of one request.
#[derive(Debug)]
pub struct Lease {
    pub token: String,
}

/// Pool of rotating backend credentials.
///
/// A single `RwLock` guards the entry table; the rotation index is a separate
/// `AtomicUsize` so the scan start point advances even when a scan fails.
pub struct CredentialPool {
    entries: RwLock<Vec<Entry>>,
    next_index: AtomicUsize,
}

impl CredentialPool {
    /// Create a pool from the configured token list. Duplicates are dropped;
    /// every credential starts `Available`.
    pub fn new(tokens: Vec<String>) -> Self {
        let mut entries: Vec<Entry> = Vec::with_capacity(tokens.len());
        for token in tokens {
            if entries.iter().any(|e| e.token == token) {
                warn!(credential = %common::redact(&token), "duplicate credential ignored");
                continue;
            }
            entries.push(Entry {
                token,
                status: CredentialStatus::Available,
                last_probed: None,
            });
        }
        info!(credentials = entries.len(), "credential pool initialized");
        Self {
            entries: RwLock::new(entries),
            next_index: AtomicUsize::new(0),
        }
    }

    /// Acquire the next available credential via round-robin and mark it
    /// `InFlight`. Returns `PoolExhausted` with pool counts when nothing is
    /// available.
    pub async fn acquire(&self) -> Result<Lease> {
        let mut entries = self.entries.write().await;
        let n = entries.len();
        if n == 0 {
            return Err(Error::PoolExhausted(exhausted_message(0, 0, 0, 0)));
        }

        let start = self.next_index.fetch_add(1, Ordering::Relaxed) % n;
        for offset in 0..n {
            let idx = (start + offset) % n;
            if entries[idx].status == CredentialStatus::Available {
                entries[idx].status = CredentialStatus::InFlight;
                debug!(
                    credential = %common::redact(&entries[idx].token),
                    "credential acquired"
                );
                return Ok(Lease {
                    token: entries[idx].token.clone(),
                });
            }
        }

        let (total, available, in_flight, disabled) = count(&entries);
        Err(Error::PoolExhausted(exhausted_message(
            total, available, in_flight, disabled,
        )))
    }

    /// Release a credential back to the pool.
    ///
    /// Restores `Available` only if the entry is still `InFlight`; a
    /// `Disabled` set by a concurrent sweep or failure report is preserved.
    /// Unknown tokens are ignored.
    pub async fn release(&self, token: &str) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.iter_mut().find(|e| e.token == token) {
            if entry.status == CredentialStatus::InFlight {
                entry.status = CredentialStatus::Available;
                debug!(credential = %common::redact(token), "credential released");
            } else {
                debug!(
                    credential = %common::redact(token),
                    status = entry.status.label(),
                    "release skipped, credential no longer in flight"
                );
            }
        }
    }

    /// Set a credential's status directly. Idempotent; unknown tokens are a
    /// no-op so racing callers never observe an error.
    pub async fn set_status(&self, token: &str, status: CredentialStatus) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.iter_mut().find(|e| e.token == token) {
            if entry.status != status {
                info!(
                    credential = %common::redact(token),
                    from = entry.status.label(),
                    to = status.label(),
                    "credential status changed"
                );
            }
            entry.status = status;
        }
    }

    /// Record that a credential was just probed by the health sweep.
    pub async fn mark_probed(&self, token: &str) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.iter_mut().find(|e| e.token == token) {
            entry.last_probed = Some(Instant::now());
        }
    }

    /// Snapshot of (token, status) pairs for the sweep.
    pub async fn snapshot(&self) -> Vec<(String, CredentialStatus)> {
        self.entries
            .read()
            .await
            .iter()
            .map(|e| (e.token.clone(), e.status))
            .collect()
    }

    /// Number of credentials currently usable by a new request.
    pub async fn available_count(&self) -> usize {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| e.status == CredentialStatus::Available)
            .count()
    }

    /// Pool health summary for the health endpoint.
    ///
    /// Status mapping: all available → healthy, some available → degraded,
    /// none available → unhealthy. Tokens appear redacted.
    pub async fn health(&self) -> serde_json::Value {
        let entries = self.entries.read().await;
        let now = Instant::now();

        let mut credentials = Vec::new();
        for entry in entries.iter() {
            let probed_secs_ago = entry
                .last_probed
                .map(|at| now.saturating_duration_since(at).as_secs());
            credentials.push(serde_json::json!({
                "credential": common::redact(&entry.token),
                "status": entry.status.label(),
                "last_probed_secs_ago": probed_secs_ago,
            }));
        }

        let (total, available, in_flight, disabled) = count(&entries);
        let pool_status = if available == total && total > 0 {
            "healthy"
        } else if available > 0 || in_flight > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": pool_status,
            "credentials_total": total,
            "credentials_available": available,
            "credentials_in_flight": in_flight,
            "credentials_disabled": disabled,
            "credentials": credentials,
        })
    }
}

fn count(entries: &[Entry]) -> (usize, usize, usize, usize) {
    let total = entries.len();
    let mut available = 0usize;
    let mut in_flight = 0usize;
    let mut disabled = 0usize;
    for entry in entries {
        match entry.status {
            CredentialStatus::Available => available += 1,
            CredentialStatus::InFlight => in_flight += 1,
            CredentialStatus::Disabled => disabled += 1,
        }
    }
    (total, available, in_flight, disabled)
}

fn exhausted_message(total: usize, available: usize, in_flight: usize, disabled: usize) -> String {
    serde_json::json!({
        "error": {
            "type": "pool_exhausted",
            "message": "no usable credential",
            "pool": {
                "credentials_total": total,
                "credentials_available": available,
                "credentials_in_flight": in_flight,
                "credentials_disabled": disabled,
            }
        }
    })
    .to_string()
}
