//! Abstract interface for the versioned key-value store backing persisted
//! coordination state.
//!
//! The only strong primitive offered is an atomic compare-and-swap keyed on
//! the version of the current entry. Every mutation is announced to
//! subscribers through a [`StoreWatcher`] in commit order.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod codec;
mod error;
mod versioned;
mod watch;

pub use codec::{CborSerializer, CodecError, JsonSerializer, Serializer};
pub use error::{StoreError, StoreErrorKind};
pub use versioned::{StoreEvent, Versioned};
pub use watch::{StoreWatcher, WatchError};

use async_trait::async_trait;
use bytes::Bytes;

/// A versioned key-value store with asynchronous operations.
///
/// Versions are assigned by the store and strictly increase across every
/// write it accepts, so a larger version always denotes a later commit of the
/// same key.
#[async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    /// Backend error type.
    type Error: StoreError;

    /// Fetch the current entry for `key`.
    async fn get<K: Into<String> + Send>(
        &self,
        key: K,
    ) -> Result<Option<Versioned<Bytes>>, Self::Error>;

    /// List keys, relative to this store's scope.
    async fn keys(&self) -> Result<Vec<String>, Self::Error>;

    /// Unconditionally write `bytes`, returning the previous entry if any.
    async fn put<K: Into<String> + Send>(
        &self,
        key: K,
        bytes: Bytes,
    ) -> Result<Option<Versioned<Bytes>>, Self::Error>;

    /// Remove `key`, returning the entry that was removed if any.
    async fn remove<K: Into<String> + Send>(
        &self,
        key: K,
    ) -> Result<Option<Versioned<Bytes>>, Self::Error>;

    /// Compare-and-swap.
    ///
    /// Writes `bytes` only if the current version of `key` equals
    /// `expected_version`, where `None` means the key must be absent. Returns
    /// the newly committed entry.
    ///
    /// # Errors
    ///
    /// Fails with an error of kind [`StoreErrorKind::Conflict`] if the entry
    /// moved on since it was read.
    async fn replace<K: Into<String> + Send>(
        &self,
        key: K,
        expected_version: Option<u64>,
        bytes: Bytes,
    ) -> Result<Versioned<Bytes>, Self::Error>;

    /// Subscribe to the events of every subsequent commit within this scope.
    fn watch(&self) -> StoreWatcher;
}

/// A store that must be scoped before use.
pub trait Store1: Clone + Send + Sync + 'static {
    /// Backend error type.
    type Error: StoreError;

    /// The scoped store type.
    type Scoped: Store<Error = Self::Error>;

    /// Narrow this store to keys under `scope`. Scopes share the underlying
    /// data with their parent.
    fn scope<S: Into<String> + Send>(&self, scope: S) -> Self::Scoped;
}
