//! Election records persisted in a versioned store
//!
//! One record per topic, keyed by [`RECORD_PREFIX`] followed by the topic
//! name. Keys without the prefix belong to someone else and are ignored, so
//! the store may be shared with other users. Records are rewritten with
//! compare-and-swap and never removed.

use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use concord_store::{
    CborSerializer, Serializer, Store, StoreError, StoreEvent, StoreWatcher, Versioned,
};
use rand::Rng;
use tracing::{debug, warn};

use crate::config::LeadershipConfig;
use crate::election::ElectionState;
use crate::error::{LeadershipError, LeadershipResult};
use crate::leadership::Leadership;

/// Key prefix of election records.
pub const RECORD_PREFIX: &str = "election/";

fn record_key(topic: &str) -> String {
    format!("{RECORD_PREFIX}{topic}")
}

/// Outcome of [`LeadershipStore::update`].
#[derive(Clone, Debug)]
pub struct Committed<R> {
    /// Value returned by the operation
    pub outcome: R,
    /// The record after the operation, `None` if the topic has no record
    pub leadership: Option<Versioned<Leadership>>,
}

/// Store-backed election records.
#[derive(Clone, Debug)]
pub struct LeadershipStore<S, Z = CborSerializer> {
    store: S,
    serializer: Z,
    retry_attempts: usize,
    retry_backoff_max: Duration,
}

impl<S: Store> LeadershipStore<S> {
    /// Create a store encoding records as CBOR.
    pub fn new(store: S, config: &LeadershipConfig) -> Self {
        Self::with_serializer(store, CborSerializer, config)
    }
}

impl<S: Store, Z: Serializer> LeadershipStore<S, Z> {
    /// Create a store with a custom serializer.
    pub fn with_serializer(store: S, serializer: Z, config: &LeadershipConfig) -> Self {
        Self {
            store,
            serializer,
            retry_attempts: config.retry_attempts.max(1),
            retry_backoff_max: config.retry_backoff_max,
        }
    }

    fn decode(&self, topic: &str, entry: Versioned<Bytes>) -> LeadershipResult<Versioned<Leadership>> {
        entry.try_map(|bytes| {
            let state: ElectionState = self.serializer.decode(&bytes)?;
            Ok(Leadership::from_state(topic, &state))
        })
    }

    /// Current record of `topic`.
    ///
    /// # Errors
    ///
    /// Fails if the store is unavailable or the record is undecodable.
    pub async fn get(&self, topic: &str) -> LeadershipResult<Option<Versioned<Leadership>>> {
        let entry = self
            .store
            .get(record_key(topic))
            .await
            .map_err(|e| LeadershipError::from_store(topic, &e))?;

        entry.map(|entry| self.decode(topic, entry)).transpose()
    }

    /// Every topic with a record.
    ///
    /// # Errors
    ///
    /// Fails if the store is unavailable.
    pub async fn topics(&self) -> LeadershipResult<Vec<String>> {
        let keys = self
            .store
            .keys()
            .await
            .map_err(|e| LeadershipError::Store(e.to_string()))?;

        Ok(keys
            .iter()
            .filter_map(|key| key.strip_prefix(RECORD_PREFIX))
            .map(ToString::to_string)
            .collect())
    }

    /// Every record.
    ///
    /// # Errors
    ///
    /// Fails if the store is unavailable or a record is undecodable.
    pub async fn all(&self) -> LeadershipResult<Vec<Versioned<Leadership>>> {
        let mut records = Vec::new();
        for topic in self.topics().await? {
            if let Some(record) = self.get(&topic).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Apply `operation` to the record of `topic` and commit it.
    ///
    /// The operation receives the current state and the commit time in
    /// milliseconds. It may run several times, once per attempt; nothing is
    /// written when it leaves the state untouched.
    ///
    /// # Errors
    ///
    /// Fails with [`LeadershipError::Conflict`] when every attempt lost a
    /// race, or with the store error that interrupted the loop.
    pub async fn update<R, F>(&self, topic: &str, operation: F) -> LeadershipResult<Committed<R>>
    where
        R: Send,
        F: Fn(&mut ElectionState, u64) -> R + Send + Sync,
    {
        for attempt in 1..=self.retry_attempts {
            let current = self
                .store
                .get(record_key(topic))
                .await
                .map_err(|e| LeadershipError::from_store(topic, &e))?;

            let (expected, creation_time, mut state) = match current {
                Some(entry) => (
                    Some(entry.version),
                    entry.creation_time,
                    self.serializer.decode::<ElectionState>(&entry.value)?,
                ),
                None => (None, 0, ElectionState::default()),
            };
            let before = state.clone();
            let outcome = operation(&mut state, now_millis());

            if state == before {
                let leadership = expected.map(|version| {
                    Versioned::new(Leadership::from_state(topic, &state), version, creation_time)
                });
                return Ok(Committed {
                    outcome,
                    leadership,
                });
            }

            let bytes = self.serializer.encode(&state)?;
            match self.store.replace(record_key(topic), expected, bytes).await {
                Ok(committed) => {
                    debug!(
                        "Committed election of '{}' at version {} (term {})",
                        topic,
                        committed.version,
                        state.term()
                    );
                    return Ok(Committed {
                        outcome,
                        leadership: Some(committed.map(|_| Leadership::from_state(topic, &state))),
                    });
                }
                Err(e) if e.is_conflict() => {
                    let delay = self.retry_delay();
                    debug!(
                        "Election commit of '{}' conflicted (attempt {}), retrying in {:?}",
                        topic, attempt, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(LeadershipError::from_store(topic, &e)),
            }
        }

        warn!(
            "Giving up on election of '{}' after {} attempts",
            topic, self.retry_attempts
        );
        Err(LeadershipError::Conflict(topic.to_string()))
    }

    /// Subscribe to record changes committed after this call.
    pub fn watch(&self) -> StoreWatcher {
        self.store.watch()
    }

    /// Decode a store event into the record it committed.
    ///
    /// # Errors
    ///
    /// Fails if the committed record is undecodable.
    pub fn decode_event(&self, event: StoreEvent) -> LeadershipResult<Option<Versioned<Leadership>>> {
        let Some(topic) = event.key().strip_prefix(RECORD_PREFIX).map(ToString::to_string) else {
            return Ok(None);
        };

        match event {
            StoreEvent::Insert { new, .. } | StoreEvent::Update { new, .. } => {
                self.decode(&topic, new).map(Some)
            }
            StoreEvent::Remove { .. } => {
                warn!("Election record of '{}' was removed from the store", topic);
                Ok(None)
            }
        }
    }

    fn retry_delay(&self) -> Duration {
        let ceiling = u64::try_from(self.retry_backoff_max.as_millis()).unwrap_or(u64::MAX);
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..ceiling))
    }
}

fn now_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default()
}
