use concord_store::{StoreError, StoreErrorKind};
use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// A compare-and-swap found a different version than expected.
    #[error("version conflict on '{key}': expected {expected:?}, found {actual:?}")]
    Conflict {
        /// Full key of the entry.
        key: String,
        /// Version the writer read.
        expected: Option<u64>,
        /// Version currently stored.
        actual: Option<u64>,
    },
}

impl StoreError for Error {
    fn kind(&self) -> StoreErrorKind {
        match self {
            Self::Conflict { .. } => StoreErrorKind::Conflict,
        }
    }
}
