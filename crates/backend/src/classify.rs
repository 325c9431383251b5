//! Failure classification for backend responses
//!
//! Each failure class maps to a different recovery action in the retry loop:
//! rate-limited failures disable the credential and surface outward code 429,
//! unauthorized failures disable the credential quietly, transient failures
//! leave pool state untouched and simply burn an attempt.

use crate::BackendError;

/// Classification of a failed backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Quota spent or challenge rejected (403): disable the credential,
    /// outward code 429.
    RateLimited,
    /// Credential rejected by the backend (any other status above 400):
    /// disable the credential.
    Unauthorized,
    /// Network fault or a status the backend may recover from: no pool action.
    Transient,
}

impl FailureKind {
    /// Outward (code, message) convention: 429 for rate-limited failures,
    /// -1 for everything else.
    pub fn outward_code(&self) -> i32 {
        match self {
            FailureKind::RateLimited => 429,
            FailureKind::Unauthorized | FailureKind::Transient => -1,
        }
    }

    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Unauthorized => "unauthorized",
            FailureKind::Transient => "transient",
        }
    }
}

/// Classify a backend error.
///
/// 403 is treated as rate-limited rather than unauthorized: the backend
/// answers 403 when the challenge cookie has gone stale, and the caller is
/// expected to refresh the challenge and rotate credentials. The explicit
/// quota-exhausted signal classifies the same way regardless of status code.
pub fn classify(err: &BackendError) -> FailureKind {
    match err {
        BackendError::QuotaExhausted => FailureKind::RateLimited,
        BackendError::Status { code: 403, .. } => FailureKind::RateLimited,
        BackendError::Status { code, .. } if *code > 400 => FailureKind::Unauthorized,
        BackendError::Status { .. } | BackendError::Network(_) => FailureKind::Transient,
    }
}

/// Whether this failure means the shared challenge artifact is stale and must
/// be invalidated before the next attempt. Only a 403 says so.
pub fn requires_challenge_refresh(err: &BackendError) -> bool {
    matches!(err, BackendError::Status { code: 403, .. })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> BackendError {
        BackendError::Status {
            code,
            message: "test".into(),
        }
    }

    #[test]
    fn quota_exhausted_is_rate_limited() {
        assert_eq!(classify(&BackendError::QuotaExhausted), FailureKind::RateLimited);
    }

    #[test]
    fn status_403_is_rate_limited() {
        assert_eq!(classify(&status(403)), FailureKind::RateLimited);
    }

    #[test]
    fn status_401_is_unauthorized() {
        assert_eq!(classify(&status(401)), FailureKind::Unauthorized);
    }

    #[test]
    fn status_above_400_is_unauthorized() {
        assert_eq!(classify(&status(500)), FailureKind::Unauthorized);
        assert_eq!(classify(&status(502)), FailureKind::Unauthorized);
    }

    #[test]
    fn status_400_is_transient() {
        // 400 is not "above 400" — no credential action
        assert_eq!(classify(&status(400)), FailureKind::Transient);
    }

    #[test]
    fn network_error_is_transient() {
        assert_eq!(
            classify(&BackendError::Network("connection reset".into())),
            FailureKind::Transient
        );
    }

    #[test]
    fn only_403_requires_challenge_refresh() {
        assert!(requires_challenge_refresh(&status(403)));
        assert!(!requires_challenge_refresh(&status(401)));
        assert!(!requires_challenge_refresh(&BackendError::QuotaExhausted));
        assert!(!requires_challenge_refresh(&BackendError::Network("x".into())));
    }

    #[test]
    fn outward_codes_follow_convention() {
        assert_eq!(FailureKind::RateLimited.outward_code(), 429);
        assert_eq!(FailureKind::Unauthorized.outward_code(), -1);
        assert_eq!(FailureKind::Transient.outward_code(), -1);
    }

    #[test]
    fn labels_are_stable() {
        assert_eq!(FailureKind::RateLimited.label(), "rate_limited");
        assert_eq!(FailureKind::Unauthorized.label(), "unauthorized");
        assert_eq!(FailureKind::Transient.label(), "transient");
    }
}
