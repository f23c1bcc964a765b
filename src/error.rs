//! Error types for the event store client.

use crate::event::ExpectedVersion;

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur during client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Invalid argument provided by caller (empty batch, batch size out of range).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Expected version did not match the stream's current version.
    #[error("concurrency conflict on stream '{stream}': expected {expected}, current {current:?}")]
    ConcurrencyConflict {
        stream: String,
        expected: ExpectedVersion,
        current: Option<u64>,
    },

    /// Stream does not exist (or was soft-deleted).
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    /// Stream was tombstoned and can never be written again.
    #[error("stream deleted: {0}")]
    StreamDeleted(String),

    /// Persistent subscription group does not exist.
    #[error("subscription group '{group}' not found on stream '{stream}'")]
    SubscriptionNotFound { stream: String, group: String },

    /// Persistent subscription group already exists.
    #[error("subscription group '{group}' already exists on stream '{stream}'")]
    AlreadyExists { stream: String, group: String },

    /// Group refused another subscriber.
    #[error("subscription group '{group}' on stream '{stream}' has reached {max} subscribers")]
    MaximumSubscribersReached {
        stream: String,
        group: String,
        max: usize,
    },

    /// Input text is not a valid event envelope.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// JSON (de)serialization failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// File access failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to reach the store or the connection was lost.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Store did not answer in time.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Subscription channel was dropped before the operation completed.
    #[error("subscription dropped: {0}")]
    SubscriptionDropped(String),

    /// Blocking call issued from a worker-pool thread.
    #[error("blocking call '{0}' issued from a client worker thread")]
    BlockingInWorker(&'static str),

    /// Invalid client configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// Returns true for "not found" conditions (stream or subscription group).
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ClientError::StreamNotFound(_) | ClientError::SubscriptionNotFound { .. }
        )
    }

    /// Returns true if this is an expected-version mismatch.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ClientError::ConcurrencyConflict { .. })
    }

    /// Returns true if the caller supplied a bad argument.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, ClientError::InvalidArgument(_))
    }

    /// Returns true if this is a connection or timeout error.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, ClientError::Connection(_) | ClientError::Timeout(_))
    }

    /// Returns true if repeating the same call may succeed.
    ///
    /// Only transport failures qualify. Conflicts need a fresh read first,
    /// and everything else fails the same way again.
    pub fn is_retryable(&self) -> bool {
        self.is_connection_error()
    }
}

/// Outcome of a delete: either the target was removed or it did not exist.
///
/// Deletes are idempotent from the caller's point of view, so "not found" is
/// a normal value rather than an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal<T> {
    /// Target existed and was removed.
    Removed(T),
    /// Target did not exist.
    NotFound,
}

impl<T> Removal<T> {
    pub fn is_removed(&self) -> bool {
        matches!(self, Removal::Removed(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Removal::NotFound)
    }

    /// Returns the removal result, if any.
    pub fn removed(self) -> Option<T> {
        match self {
            Removal::Removed(value) => Some(value),
            Removal::NotFound => None,
        }
    }
}
