//! Error types for the reconciliation engine.

use thiserror::Error;

use crate::types::ResourceId;

/// Failure reported by a remote control plane, classified by how the engine
/// must react to it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The addressed resource does not exist. A legitimate outcome for reads.
    #[error("not found: {0}")]
    NotFound(String),

    /// A dependency (usually the parent) is not ready to accept the call yet.
    #[error("not ready: {0}")]
    NotReady(String),

    /// The remote asked us to slow down.
    #[error("throttled: {0}")]
    Throttled(String),

    /// Transport or service failure that may clear on its own.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Any rejection not in the retryable set.
    #[error("{0}")]
    Fatal(String),
}

impl RemoteError {
    /// Whether the retry loop may try the call again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotReady(_) | Self::Throttled(_) | Self::Unavailable(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Main error type for engine operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The declared spec is invalid; raised before any remote call.
    #[error("validation error: {0}")]
    Validation(String),

    /// The remote answered with a shape the mapper cannot interpret.
    #[error("malformed response for {id}: {reason}")]
    MalformedResponse { id: String, reason: String },

    /// The remote rejected the call.
    #[error("{operation} {id} failed: {source}")]
    Fatal {
        operation: &'static str,
        id: String,
        #[source]
        source: RemoteError,
    },

    /// The caller canceled while the operation was in flight or backing off.
    #[error("{operation} {id} canceled after {attempts} attempt(s)")]
    Canceled {
        operation: &'static str,
        id: String,
        attempts: u32,
    },

    /// The retry budget ran out while the remote kept answering retryably.
    #[error("{operation} {id} gave up after {attempts} attempt(s): {last}")]
    RetryExhausted {
        operation: &'static str,
        id: String,
        attempts: u32,
        last: RemoteError,
    },

    /// The addressed remote resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A destroyed instance is still present remotely.
    #[error("{0} not destroyed")]
    NotDestroyed(ResourceId),

    /// Tracking store failure.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a malformed-response error for the given identifier
    pub fn malformed(id: &ResourceId, reason: impl Into<String>) -> Self {
        Self::MalformedResponse {
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    /// True when the caller gave up rather than the remote rejecting.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled { .. })
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classes() {
        assert!(RemoteError::NotReady("cluster modifying".into()).is_retryable());
        assert!(RemoteError::Throttled("rate exceeded".into()).is_retryable());
        assert!(RemoteError::Unavailable("connection reset".into()).is_retryable());
        assert!(!RemoteError::NotFound("c1".into()).is_retryable());
        assert!(!RemoteError::Fatal("access denied".into()).is_retryable());
    }

    #[test]
    fn fatal_message_names_operation_and_id() {
        let err = Error::Fatal {
            operation: "create",
            id: "c1:logging".into(),
            source: RemoteError::Fatal("InvalidS3BucketNameFault".into()),
        };
        assert_eq!(
            err.to_string(),
            "create c1:logging failed: InvalidS3BucketNameFault"
        );
    }

    #[test]
    fn canceled_is_distinct_from_fatal() {
        let err = Error::Canceled {
            operation: "create",
            id: "c1:logging".into(),
            attempts: 3,
        };
        assert!(err.is_canceled());
        assert!(err.to_string().contains("canceled after 3"));
    }
}
