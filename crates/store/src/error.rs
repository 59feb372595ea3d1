use std::error::Error;
use std::fmt::{self, Debug};

/// Marker trait for `Store` errors.
pub trait StoreError: Debug + Error + Send + Sync + 'static {
    /// Returns the kind of this error.
    fn kind(&self) -> StoreErrorKind;

    /// Whether the failed operation lost a compare-and-swap race and may be
    /// retried against fresh state.
    fn is_conflict(&self) -> bool {
        self.kind() == StoreErrorKind::Conflict
    }
}

/// The kind of store error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StoreErrorKind {
    /// A versioned write lost against a concurrent writer.
    Conflict,

    /// A stored value could not be encoded or decoded.
    Codec,

    /// The backend could not be reached.
    Unavailable,

    /// Other/unknown error.
    Other,
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}
