//! Failure taxonomy for the sign-in flow.
//!
//! Every failure that reaches a caller of this crate carries exactly one of
//! these kinds; collaborator errors are mapped at the orchestration boundary
//! and never leak upward as free text to be sniffed.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use super::contracts::{ExchangeError, StoreError};

/// Which layer of the flow a timeout was enforced by.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowStage {
    Exchange,
    Establish,
    Overall,
}

impl fmt::Display for FlowStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exchange => write!(f, "credential exchange"),
            Self::Establish => write!(f, "session establishment"),
            Self::Overall => write!(f, "sign-in flow"),
        }
    }
}

/// Fieldless classification of [`FlowError`] for retry predicates and
/// user-facing routing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    NetworkTransient,
    Rejected,
    Malformed,
    Cancelled,
    Timeout,
    CsrfMissing,
    CsrfExpired,
    CsrfMismatch,
    StaleRead,
    Storage,
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("transient network failure: {0}")]
    NetworkTransient(String),
    #[error("credential exchange rejected: {0}")]
    Rejected(String),
    #[error("malformed exchange response: {0}")]
    Malformed(String),
    #[error("attempt superseded by a newer sign-in")]
    Cancelled,
    #[error("{stage} timed out after {}ms", .elapsed.as_millis())]
    Timeout { stage: FlowStage, elapsed: Duration },
    #[error("no pending state token")]
    CsrfMissing,
    #[error("state token expired")]
    CsrfExpired,
    #[error("state token mismatch")]
    CsrfMismatch,
    #[error("stale session read")]
    StaleRead,
    #[error("session storage failure: {0}")]
    Storage(String),
}

impl FlowError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NetworkTransient(_) => ErrorKind::NetworkTransient,
            Self::Rejected(_) => ErrorKind::Rejected,
            Self::Malformed(_) => ErrorKind::Malformed,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::CsrfMissing => ErrorKind::CsrfMissing,
            Self::CsrfExpired => ErrorKind::CsrfExpired,
            Self::CsrfMismatch => ErrorKind::CsrfMismatch,
            Self::StaleRead => ErrorKind::StaleRead,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Only transient network failures are ever worth retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkTransient(_))
    }
}

impl From<ExchangeError> for FlowError {
    fn from(err: ExchangeError) -> Self {
        match err {
            ExchangeError::Transient(message) => Self::NetworkTransient(message),
            ExchangeError::Rejected(message) => Self::Rejected(message),
            ExchangeError::Malformed(message) => Self::Malformed(message),
        }
    }
}

impl From<StoreError> for FlowError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Stale => Self::StaleRead,
            StoreError::Unavailable(message) => Self::Storage(message),
        }
    }
}

/// Terminal failure of one `start_auth_flow` call: the mapped taxonomy error
/// plus how long the flow ran before settling.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct FlowFailure {
    error: FlowError,
    duration: Duration,
}

impl FlowFailure {
    pub(crate) fn new(error: FlowError, duration: Duration) -> Self {
        Self { error, duration }
    }

    #[must_use]
    pub fn error(&self) -> &FlowError {
        &self.error
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.duration
    }

    #[must_use]
    pub fn into_error(self) -> FlowError {
        self.error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_one_to_one() {
        assert_eq!(
            FlowError::NetworkTransient("dns".to_string()).kind(),
            ErrorKind::NetworkTransient
        );
        assert_eq!(FlowError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            FlowError::Timeout {
                stage: FlowStage::Establish,
                elapsed: Duration::from_secs(3),
            }
            .kind(),
            ErrorKind::Timeout
        );
        assert_eq!(FlowError::CsrfMissing.kind(), ErrorKind::CsrfMissing);
        assert_eq!(FlowError::StaleRead.kind(), ErrorKind::StaleRead);
    }

    #[test]
    fn only_transient_is_retryable() {
        assert!(FlowError::NetworkTransient("reset".to_string()).is_retryable());
        assert!(!FlowError::Rejected("denied".to_string()).is_retryable());
        assert!(!FlowError::Cancelled.is_retryable());
        assert!(!FlowError::CsrfMismatch.is_retryable());
    }

    #[test]
    fn exchange_errors_map_to_taxonomy() {
        let err: FlowError = ExchangeError::Transient("reset".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::NetworkTransient);
        let err: FlowError = ExchangeError::Rejected("bad code".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::Rejected);
        let err: FlowError = ExchangeError::Malformed("no token".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::Malformed);
    }

    #[test]
    fn store_errors_map_to_taxonomy() {
        let err: FlowError = StoreError::Stale.into();
        assert_eq!(err.kind(), ErrorKind::StaleRead);
        let err: FlowError = StoreError::Unavailable("quota".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::Storage);
    }

    #[test]
    fn timeout_display_includes_stage_and_elapsed() {
        let err = FlowError::Timeout {
            stage: FlowStage::Exchange,
            elapsed: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "credential exchange timed out after 1500ms");
    }

    #[test]
    fn failure_exposes_kind_and_duration() {
        let failure = FlowFailure::new(FlowError::Cancelled, Duration::from_millis(42));
        assert_eq!(failure.kind(), ErrorKind::Cancelled);
        assert_eq!(failure.duration(), Duration::from_millis(42));
        assert_eq!(failure.to_string(), "attempt superseded by a newer sign-in");
    }
}
