//! Error types for leadership operations

use concord_store::{CodecError, StoreError, StoreErrorKind};
use thiserror::Error;

/// Leadership-related errors
#[derive(Clone, Debug, Error)]
pub enum LeadershipError {
    /// The election record kept changing under every retry
    #[error("leadership conflict on topic '{0}'")]
    Conflict(String),

    /// A stored election record could not be decoded
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Backing store failure
    #[error("Store error: {0}")]
    Store(String),

    /// The task committing the operation died before reporting back
    #[error("leadership operation interrupted: {0}")]
    Interrupted(String),
}

impl LeadershipError {
    /// Whether retrying against fresh state may succeed.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub(crate) fn from_store<E: StoreError>(topic: &str, error: &E) -> Self {
        match error.kind() {
            StoreErrorKind::Conflict => Self::Conflict(topic.to_string()),
            _ => Self::Store(error.to_string()),
        }
    }
}

/// Result type for leadership operations
pub type LeadershipResult<T> = Result<T, LeadershipError>;

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_store_conflicts_stay_retryable() {
        let conflict = concord_store_memory::Error::Conflict {
            key: "leadership:t".to_string(),
            expected: Some(1),
            actual: Some(2),
        };

        let error = LeadershipError::from_store("t", &conflict);
        assert_matches!(&error, LeadershipError::Conflict(topic) if topic == "t");
        assert!(error.is_conflict());
        assert!(!LeadershipError::Store("down".to_string()).is_conflict());
    }
}
