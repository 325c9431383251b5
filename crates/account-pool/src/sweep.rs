//! Periodic credential health sweep
//!
//! Spawns a background task that probes every credential currently sidelined
//! (in flight or disabled) against the backend's remaining-quota endpoint.
//! Credentials reporting quota left come back `Available`; credentials the
//! backend rejects stay `Disabled`; a stale-challenge answer invalidates the
//! shared cache so the next request refreshes it. The sweep runs independently
//! of request handling and serializes its writes through the pool lock.

use std::sync::Arc;
use std::time::Duration;

use backend::{ChatBackend, FailureKind, classify, requires_challenge_refresh};
use tracing::{debug, info, warn};

use crate::challenge::ChallengeCache;
use crate::pool::{CredentialPool, CredentialStatus};

/// Upper bound on a single probe so one unresponsive credential cannot stall
/// the whole sweep.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Spawn the recurring sweep task. Runs every `interval`; the immediate first
/// tick is skipped since all credentials start fresh.
pub fn spawn_sweep_task(
    pool: Arc<CredentialPool>,
    cache: Arc<ChallengeCache>,
    backend: Arc<dyn ChatBackend>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            sweep_cycle(&pool, &cache, backend.as_ref()).await;
        }
    })
}

/// Run one sweep cycle over every non-available credential.
async fn sweep_cycle(pool: &CredentialPool, cache: &ChallengeCache, backend: &dyn ChatBackend) {
    let snapshot = pool.snapshot().await;
    let challenge = cache.current().await;

    for (token, status) in snapshot {
        if status == CredentialStatus::Available {
            continue;
        }

        let probe = backend.remaining_quota(&token, &challenge);
        let result = match tokio::time::timeout(PROBE_TIMEOUT, probe).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    credential = %common::redact(&token),
                    timeout_secs = PROBE_TIMEOUT.as_secs(),
                    "quota probe timed out"
                );
                continue;
            }
        };

        pool.mark_probed(&token).await;

        match result {
            Ok(count) if count > 0 => {
                info!(
                    credential = %common::redact(&token),
                    remaining = count,
                    "probe reports quota left, credential available again"
                );
                pool.set_status(&token, CredentialStatus::Available).await;
            }
            Ok(_) => {
                debug!(credential = %common::redact(&token), "probe reports zero quota");
                pool.set_status(&token, CredentialStatus::Disabled).await;
            }
            Err(err) if requires_challenge_refresh(&err) => {
                // Stale challenge, not a credential problem: refresh the shared
                // artifact and let the next cycle retry the probe.
                warn!(
                    credential = %common::redact(&token),
                    "probe rejected by challenge, invalidating artifact"
                );
                cache.invalidate().await;
            }
            Err(err) => match classify(&err) {
                FailureKind::Unauthorized | FailureKind::RateLimited => {
                    warn!(
                        credential = %common::redact(&token),
                        error = %err,
                        "probe rejected credential, keeping it disabled"
                    );
                    pool.set_status(&token, CredentialStatus::Disabled).await;
                }
                FailureKind::Transient => {
                    debug!(
                        credential = %common::redact(&token),
                        error = %err,
                        "probe failed transiently, status unchanged"
                    );
                }
            },
        }
    }
}
