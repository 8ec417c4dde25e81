use thiserror::Error;
use super::types::FailureKind;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Server rejected upload: status code {status}")]
    ServerRejected {
        status: u16,
    },

    #[error("Upload was cancelled")]
    Cancelled,

    #[error("Batch contains no files")]
    EmptyBatch,

    #[error("Destination URL is missing")]
    MissingDestination,

    #[error("Invalid destination URL {url}: {message}")]
    InvalidDestination {
        url: String,
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Manager shutdown")]
    ManagerShutdown,
}

impl UploadError {
    pub fn source_unavailable(message: impl Into<String>) -> Self {
        Self::SourceUnavailable(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Terminal failure kind recorded on an item when a job ends with this error.
    ///
    /// Local IO errors while reading the body count as the source going away;
    /// everything the job cannot attribute to the source or the server is
    /// treated as a transport failure.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            UploadError::SourceUnavailable(_) | UploadError::Io(_) => FailureKind::SourceUnavailable,
            UploadError::ServerRejected { .. } => FailureKind::ServerRejected,
            UploadError::Cancelled => FailureKind::Cancelled,
            _ => FailureKind::Transport,
        }
    }
}

/// Error alias
pub type Result<T, E = UploadError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_mapping() {
        assert_eq!(
            UploadError::source_unavailable("gone").failure_kind(),
            FailureKind::SourceUnavailable
        );
        assert_eq!(
            UploadError::ServerRejected { status: 503 }.failure_kind(),
            FailureKind::ServerRejected
        );
        assert_eq!(UploadError::Cancelled.failure_kind(), FailureKind::Cancelled);
        assert_eq!(UploadError::internal("boom").failure_kind(), FailureKind::Transport);
    }

    #[test]
    fn test_only_cancellation_is_not_retryable() {
        assert!(FailureKind::Transport.is_retryable());
        assert!(FailureKind::ServerRejected.is_retryable());
        assert!(FailureKind::SourceUnavailable.is_retryable());
        assert!(!FailureKind::Cancelled.is_retryable());
    }
}
