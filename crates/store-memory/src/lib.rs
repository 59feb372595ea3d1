//! In-memory (single process) implementation of the versioned store for
//! tests and local development.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use concord_store::{Store, Store1, StoreEvent, StoreWatcher, Versioned};
use tokio::sync::{Mutex, broadcast};
use tracing::trace;

/// Default number of events buffered for slow watchers.
const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct Entries {
    map: HashMap<String, Versioned<Bytes>>,
    last_version: u64,
}

impl Entries {
    fn commit(&mut self, key: String, value: Bytes) -> (Option<Versioned<Bytes>>, Versioned<Bytes>) {
        self.last_version += 1;
        let new = Versioned::new(value, self.last_version, now_millis());
        let old = self.map.insert(key, new.clone());
        (old, new)
    }
}

/// In-memory versioned key-value store.
///
/// Clones and scopes share the same entries and event channel.
#[derive(Clone, Debug)]
pub struct MemoryStore {
    entries: Arc<Mutex<Entries>>,
    events: broadcast::Sender<StoreEvent>,
    prefix: Option<String>,
}

impl MemoryStore {
    /// Creates a new `MemoryStore`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Creates a new `MemoryStore` buffering at most `capacity` events per
    /// watcher before it lags.
    #[must_use]
    pub fn with_event_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            entries: Arc::new(Mutex::new(Entries::default())),
            events,
            prefix: None,
        }
    }

    fn get_key<K: Into<String>>(&self, key: K) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}:{}", prefix, key.into()),
            None => key.into(),
        }
    }

    fn key_prefix(&self) -> String {
        self.prefix
            .as_ref()
            .map_or_else(String::new, |prefix| format!("{prefix}:"))
    }

    fn publish(&self, event: StoreEvent) {
        trace!("memory store commit: {:?}", event.key());
        // No watchers is not an error.
        let _ = self.events.send(event);
    }

    fn changed(key: String, old: Option<Versioned<Bytes>>, new: Versioned<Bytes>) -> StoreEvent {
        match old {
            Some(old) => StoreEvent::Update { key, old, new },
            None => StoreEvent::Insert { key, new },
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Error = Error;

    async fn get<K: Into<String> + Send>(
        &self,
        key: K,
    ) -> Result<Option<Versioned<Bytes>>, Self::Error> {
        let entries = self.entries.lock().await;
        Ok(entries.map.get(&self.get_key(key)).cloned())
    }

    async fn keys(&self) -> Result<Vec<String>, Self::Error> {
        let prefix = self.key_prefix();
        let entries = self.entries.lock().await;
        Ok(entries
            .map
            .keys()
            .filter_map(|key| key.strip_prefix(prefix.as_str()))
            .map(ToString::to_string)
            .collect())
    }

    async fn put<K: Into<String> + Send>(
        &self,
        key: K,
        bytes: Bytes,
    ) -> Result<Option<Versioned<Bytes>>, Self::Error> {
        let key = self.get_key(key);
        let mut entries = self.entries.lock().await;
        let (old, new) = entries.commit(key.clone(), bytes);

        // Published under the lock so subscribers observe commit order.
        self.publish(Self::changed(key, old.clone(), new));
        Ok(old)
    }

    async fn remove<K: Into<String> + Send>(
        &self,
        key: K,
    ) -> Result<Option<Versioned<Bytes>>, Self::Error> {
        let key = self.get_key(key);
        let mut entries = self.entries.lock().await;
        let old = entries.map.remove(&key);

        if let Some(old) = &old {
            self.publish(StoreEvent::Remove {
                key,
                old: old.clone(),
            });
        }
        Ok(old)
    }

    async fn replace<K: Into<String> + Send>(
        &self,
        key: K,
        expected_version: Option<u64>,
        bytes: Bytes,
    ) -> Result<Versioned<Bytes>, Self::Error> {
        let key = self.get_key(key);
        let mut entries = self.entries.lock().await;

        let actual = entries.map.get(&key).map(|entry| entry.version);
        if actual != expected_version {
            return Err(Error::Conflict {
                key,
                expected: expected_version,
                actual,
            });
        }

        let (old, new) = entries.commit(key.clone(), bytes);
        self.publish(Self::changed(key, old, new.clone()));
        Ok(new)
    }

    fn watch(&self) -> StoreWatcher {
        StoreWatcher::new(self.events.subscribe(), self.key_prefix())
    }
}

impl Store1 for MemoryStore {
    type Error = Error;
    type Scoped = Self;

    fn scope<S: Into<String> + Send>(&self, scope: S) -> Self::Scoped {
        let new_scope = match &self.prefix {
            Some(existing_scope) => format!("{}:{}", existing_scope, scope.into()),
            None => scope.into(),
        };

        Self {
            entries: self.entries.clone(),
            events: self.events.clone(),
            prefix: Some(new_scope),
        }
    }
}

fn now_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use concord_store::{StoreError, StoreErrorKind};

    #[tokio::test]
    async fn test_put_returns_previous() {
        let store = MemoryStore::new();

        let first = store
            .put("key", Bytes::from_static(b"one"))
            .await
            .unwrap();
        assert_eq!(first, None);

        let second = store
            .put("key", Bytes::from_static(b"two"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.value, Bytes::from_static(b"one"));

        let current = store.get("key").await.unwrap().unwrap();
        assert_eq!(current.value, Bytes::from_static(b"two"));
        assert!(current.version > second.version);
    }

    #[tokio::test]
    async fn test_remove() {
        let store = MemoryStore::new();
        store.put("key", Bytes::from_static(b"v")).await.unwrap();

        let removed = store.remove("key").await.unwrap();
        assert_eq!(removed.map(|v| v.value), Some(Bytes::from_static(b"v")));
        assert_eq!(store.get("key").await.unwrap(), None);
        assert_eq!(store.remove("key").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_replace_is_compare_and_swap() {
        let store = MemoryStore::new();

        let created = store
            .replace("key", None, Bytes::from_static(b"a"))
            .await
            .unwrap();

        // Absent expectation against a present key.
        let err = store
            .replace("key", None, Bytes::from_static(b"b"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::Conflict);

        let updated = store
            .replace("key", Some(created.version), Bytes::from_static(b"b"))
            .await
            .unwrap();

        // Stale version.
        let err = store
            .replace("key", Some(created.version), Bytes::from_static(b"c"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_matches!(err, Error::Conflict { actual: Some(v), .. } if v == updated.version);
    }

    #[tokio::test]
    async fn test_scopes_share_data_but_not_keys() {
        let store = MemoryStore::new();
        let scoped = store.scope("leaders");

        scoped.put("topic", Bytes::from_static(b"v")).await.unwrap();

        assert_eq!(store.get("topic").await.unwrap(), None);
        assert!(store.get("leaders:topic").await.unwrap().is_some());
        assert_eq!(scoped.keys().await.unwrap(), vec!["topic".to_string()]);

        let nested = scoped.scope("inner");
        nested.put("k", Bytes::from_static(b"v")).await.unwrap();
        assert!(store.get("leaders:inner:k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_watch_delivers_events_in_commit_order() {
        let store = MemoryStore::new();
        let scoped = store.scope("meta");
        let mut watcher = scoped.watch();

        store.put("unrelated", Bytes::from_static(b"x")).await.unwrap();
        scoped.put("k", Bytes::from_static(b"1")).await.unwrap();
        scoped.put("k", Bytes::from_static(b"2")).await.unwrap();
        scoped.remove("k").await.unwrap();

        assert_matches!(watcher.recv().await, Ok(StoreEvent::Insert { key, .. }) if key == "k");
        assert_matches!(
            watcher.recv().await,
            Ok(StoreEvent::Update { old, new, .. }) if old.value == "1" && new.value == "2"
        );
        assert_matches!(watcher.recv().await, Ok(StoreEvent::Remove { .. }));
    }

    #[tokio::test]
    async fn test_failed_replace_publishes_nothing() {
        let store = MemoryStore::new();
        let mut watcher = store.watch();

        store
            .replace("key", Some(9), Bytes::from_static(b"v"))
            .await
            .unwrap_err();
        store.put("other", Bytes::from_static(b"v")).await.unwrap();

        assert_eq!(watcher.recv().await.unwrap().key(), "other");
    }
}
