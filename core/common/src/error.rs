//! Common error types for rdmsync.

use thiserror::Error;

/// Top-level error type for sync engine operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A plugin or destination does not implement the requested capability.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The acting user has no edit rights, or the credential was rejected.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The dataset lock is held by another job.
    #[error("job for {0} is already in progress")]
    JobInProgress(String),

    /// Remote backend could not be reached or timed out.
    #[error("Network error: {0}")]
    Network(String),

    /// The destination repository rejected or failed a call.
    #[error("Destination error: {0}")]
    Destination(String),

    /// Bytes did not hash to the expected value.
    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    /// Stop signal or job deadline fired.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Shared key-value store failure.
    #[error("Store error: {0}")]
    Store(String),
}

impl Error {
    /// Whether this error came from the stop signal or a deadline.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    /// Whether this is a permission failure.
    pub fn is_permission(&self) -> bool {
        matches!(self, Error::PermissionDenied(_))
    }

    /// Whether a job that failed with this error may be attempted again.
    ///
    /// Integrity errors are retryable: a corrupted download heals on the
    /// next attempt, a systematic mismatch runs out of retries.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::PermissionDenied(_)
                | Error::InvalidInput(_)
                | Error::Unsupported(_)
                | Error::JobInProgress(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(Error::Network("timeout".into()).is_retryable());
        assert!(Error::DataIntegrity("mismatch".into()).is_retryable());
        assert!(Error::Cancelled("stop".into()).is_retryable());
        assert!(!Error::PermissionDenied("no edit".into()).is_retryable());
        assert!(!Error::JobInProgress("doi:X".into()).is_retryable());
        assert!(!Error::Unsupported("search".into()).is_retryable());
    }

    #[test]
    fn test_in_progress_message() {
        let err = Error::JobInProgress("doi:10.5072/FK2".into());
        assert_eq!(err.to_string(), "job for doi:10.5072/FK2 is already in progress");
    }
}
