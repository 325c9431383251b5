//! Credential pool and shared challenge cache for the chat relay
//!
//! Manages the rotating set of backend credentials with per-credential health
//! status, the single process-wide challenge artifact, and the periodic sweep
//! that probes sidelined credentials back to life.
//!
//! Credential lifecycle:
//! 1. Config supplies the flat token list → every credential starts `Available`
//! 2. A request acquires the next credential round-robin → `InFlight`
//! 3. Backend rejects it (quota, auth, stale challenge) → `Disabled`
//! 4. Request finishes → release restores `Available` only if still `InFlight`
//! 5. The background sweep probes non-available credentials every cycle and
//!    resets the ones that report remaining quota
//!
//! The challenge artifact is shared by all requests and fetched at most once
//! per invalidation, however many callers race on it.

pub mod challenge;
pub mod error;
pub mod pool;
pub mod sweep;

pub use challenge::ChallengeCache;
pub use error::{Error, Result};
pub use pool::{CredentialPool, CredentialStatus, Lease};
pub use sweep::spawn_sweep_task;
