use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A value tagged with the store version that committed it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    /// The stored value.
    pub value: T,

    /// Version assigned by the store on commit.
    pub version: u64,

    /// Wall-clock commit time in milliseconds since the Unix epoch.
    pub creation_time: u64,
}

impl<T> Versioned<T> {
    /// Create a versioned value.
    pub const fn new(value: T, version: u64, creation_time: u64) -> Self {
        Self {
            value,
            version,
            creation_time,
        }
    }

    /// Transform the value, keeping version metadata.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Versioned<U> {
        Versioned {
            value: f(self.value),
            version: self.version,
            creation_time: self.creation_time,
        }
    }

    /// Fallible variant of [`Versioned::map`].
    ///
    /// # Errors
    ///
    /// Propagates the error returned by `f`.
    pub fn try_map<U, E>(self, f: impl FnOnce(T) -> Result<U, E>) -> Result<Versioned<U>, E> {
        Ok(Versioned {
            value: f(self.value)?,
            version: self.version,
            creation_time: self.creation_time,
        })
    }
}

/// A committed mutation, as seen by store subscribers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StoreEvent {
    /// A previously absent key was written.
    Insert {
        /// Key relative to the watcher's scope.
        key: String,
        /// The committed entry.
        new: Versioned<Bytes>,
    },

    /// An existing key was overwritten.
    Update {
        /// Key relative to the watcher's scope.
        key: String,
        /// The entry that was replaced.
        old: Versioned<Bytes>,
        /// The committed entry.
        new: Versioned<Bytes>,
    },

    /// A key was removed.
    Remove {
        /// Key relative to the watcher's scope.
        key: String,
        /// The entry that was removed.
        old: Versioned<Bytes>,
    },
}

impl StoreEvent {
    /// The key this event concerns.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Insert { key, .. } | Self::Update { key, .. } | Self::Remove { key, .. } => key,
        }
    }

    /// The entry after the mutation, `None` for removals.
    #[must_use]
    pub const fn new_value(&self) -> Option<&Versioned<Bytes>> {
        match self {
            Self::Insert { new, .. } | Self::Update { new, .. } => Some(new),
            Self::Remove { .. } => None,
        }
    }

    /// The entry before the mutation, `None` for inserts.
    #[must_use]
    pub const fn old_value(&self) -> Option<&Versioned<Bytes>> {
        match self {
            Self::Update { old, .. } | Self::Remove { old, .. } => Some(old),
            Self::Insert { .. } => None,
        }
    }

    pub(crate) fn strip_prefix(self, prefix: &str) -> Option<Self> {
        let relative = |key: String| key.strip_prefix(prefix).map(ToString::to_string);

        Some(match self {
            Self::Insert { key, new } => Self::Insert {
                key: relative(key)?,
                new,
            },
            Self::Update { key, old, new } => Self::Update {
                key: relative(key)?,
                old,
                new,
            },
            Self::Remove { key, old } => Self::Remove {
                key: relative(key)?,
                old,
            },
        })
    }
}
