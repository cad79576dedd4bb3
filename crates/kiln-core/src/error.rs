//! Error types for the Kiln job queue.
//!
//! [`StoreError`] is the contract-level error every [`JobStore`](crate::JobStore)
//! backend returns. [`Error`] is what callers of the queue façade see.

use thiserror::Error;

use crate::{JobId, LeaseToken};

/// Errors returned by a job store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} does not exist")]
    NotFound(JobId),

    #[error("no running job holds lease {0}")]
    UnknownToken(LeaseToken),

    #[error("dependency {0} does not exist")]
    InvalidDependency(JobId),

    #[error("lease token does not match the current claim of job {0}")]
    TokenMismatch(JobId),

    #[error("job {0} is already finished")]
    AlreadyFinished(JobId),

    #[error("job {0} is not pending")]
    NotPending(JobId),

    #[error("job {0} has unfinished dependencies")]
    NotReady(JobId),

    #[error("job {0} is still a dependency of other jobs")]
    HasDependants(JobId),

    #[error("invalid graph reference: {0}")]
    InvalidGraph(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("{backend} store unavailable: {message}")]
    Unavailable {
        backend: &'static str,
        message: String,
    },
}

impl StoreError {
    pub fn unavailable(backend: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            backend,
            message: err.to_string(),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Caller-facing error kinds.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid dependency: {0}")]
    InvalidDependency(String),

    /// The lease was reclaimed by another worker. Benign for the caller.
    #[error("token mismatch: {0}")]
    TokenMismatch(String),

    /// Double finish. Indicates a bug upstream.
    #[error("already finished: {0}")]
    AlreadyFinished(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Backend I/O or connection failure. Callers retry with backoff.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl Error {
    /// Whether the operation may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_))
    }

    /// Whether the caller can ignore this error without losing correctness.
    pub fn is_benign(&self) -> bool {
        matches!(self, Error::TokenMismatch(_))
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        let message = err.to_string();
        match err {
            StoreError::NotFound(_) | StoreError::UnknownToken(_) => Error::NotFound(message),
            StoreError::InvalidDependency(_) | StoreError::InvalidGraph(_) => {
                Error::InvalidDependency(message)
            }
            StoreError::TokenMismatch(_) => Error::TokenMismatch(message),
            StoreError::AlreadyFinished(_) => Error::AlreadyFinished(message),
            StoreError::NotPending(_) | StoreError::NotReady(_) | StoreError::HasDependants(_) => {
                Error::Conflict(message)
            }
            // A record we cannot decode is reported as missing rather than
            // poisoning the caller.
            StoreError::Corrupt(_) => Error::NotFound(message),
            StoreError::Unavailable { .. } => Error::StoreUnavailable(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_caller_kinds() {
        let id = JobId::new();

        assert!(matches!(
            Error::from(StoreError::NotFound(id)),
            Error::NotFound(_)
        ));
        assert!(matches!(
            Error::from(StoreError::InvalidDependency(id)),
            Error::InvalidDependency(_)
        ));
        assert!(matches!(
            Error::from(StoreError::HasDependants(id)),
            Error::Conflict(_)
        ));
        assert!(matches!(
            Error::from(StoreError::Corrupt("bad json".into())),
            Error::NotFound(_)
        ));
    }

    #[test]
    fn test_only_unavailable_is_retryable() {
        let id = JobId::new();
        let unavailable: Error = StoreError::unavailable("fs", "disk full").into();
        assert!(unavailable.is_retryable());
        assert!(!Error::from(StoreError::AlreadyFinished(id)).is_retryable());
    }

    #[test]
    fn test_token_mismatch_is_benign() {
        let id = JobId::new();
        assert!(Error::from(StoreError::TokenMismatch(id)).is_benign());
        assert!(!Error::from(StoreError::AlreadyFinished(id)).is_benign());
    }
}
