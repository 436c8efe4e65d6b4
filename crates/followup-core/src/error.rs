//! Error types shared by every follow-up crate.

use thiserror::Error;

/// Main error type for the follow-up scheduler.
#[derive(Error, Debug)]
pub enum FollowUpError {
    /// SQLite error from the schedule store or dispatch queue.
    #[error("database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    /// No follow-up with this id exists in the store.
    #[error("follow-up not found: {0}")]
    NotFound(String),

    /// The scheduling request cannot produce a valid record.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// The delivery collaborator rejected or failed the send.
    #[error("delivery failed: {message}")]
    Delivery { message: String, permanent: bool },

    #[error("personalization failed: {0}")]
    Personalization(String),

    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    #[error("queue error: {0}")]
    Queue(String),

    /// A read-only collaborator lookup (subjects, linked work, history) failed.
    #[error("lookup failed: {0}")]
    Lookup(String),
}

impl FollowUpError {
    /// Transient delivery failure that should go back through the retry policy.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Delivery {
            message: message.into(),
            permanent: false,
        }
    }

    /// Delivery failure that no amount of retrying will fix (e.g. invalid contact).
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Delivery {
            message: message.into(),
            permanent: true,
        }
    }

    /// Whether the dispatch queue should schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Delivery { permanent, .. } => !permanent,
            Self::Timeout { .. } | Self::Io(_) | Self::Database(_) | Self::Lookup(_) => true,
            Self::NotFound(_)
            | Self::InvalidSchedule(_)
            | Self::Config(_)
            | Self::Json(_)
            | Self::Personalization(_)
            | Self::Queue(_) => false,
        }
    }
}

impl From<rusqlite::Error> for FollowUpError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

/// Result type alias for the follow-up crates.
pub type Result<T> = std::result::Result<T, FollowUpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(FollowUpError::transient("503").is_retryable());
        assert!(!FollowUpError::permanent("bad number").is_retryable());
        assert!(!FollowUpError::NotFound("x".into()).is_retryable());
        assert!(
            FollowUpError::Timeout {
                operation: "deliver".into(),
                after_ms: 10
            }
            .is_retryable()
        );
    }
}
