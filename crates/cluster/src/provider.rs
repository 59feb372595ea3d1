//! Authoritative storage of cluster metadata

use std::collections::BTreeSet;
use std::pin::Pin;

use async_trait::async_trait;
use concord_identifiers::{NodeId, PartitionId};
use concord_store::{
    CborSerializer, Serializer, Store, StoreError, StoreEvent, StoreWatcher, Versioned,
    WatchError,
};
use futures::Stream;
use futures::stream;
use tracing::{debug, warn};

use crate::error::{ClusterError, ClusterResult};
use crate::event::ClusterMetadataEvent;
use crate::metadata::ClusterMetadata;

/// Stream of metadata replacements.
pub type MetadataEventStream = Pin<Box<dyn Stream<Item = ClusterMetadataEvent> + Send>>;

const METADATA_KEY: &str = "metadata";
const ACTIVE_MEMBERS_PREFIX: &str = "active-members";
const MAX_CAS_ATTEMPTS: usize = 16;

/// Source of truth for the cluster definition and the set of partition
/// members that have caught up and are actively serving.
#[async_trait]
pub trait ClusterMetadataProvider: Send + Sync + 'static {
    /// Current metadata with its store version.
    async fn get_cluster_metadata(&self) -> ClusterResult<Option<Versioned<ClusterMetadata>>>;

    /// Replace the metadata if the stored version still equals
    /// `expected_version` (`None` when nothing is stored yet).
    ///
    /// # Errors
    ///
    /// Fails with a retryable [`ClusterError::Conflict`] on a stale write.
    async fn set_cluster_metadata(
        &self,
        metadata: ClusterMetadata,
        expected_version: Option<u64>,
    ) -> ClusterResult<Versioned<ClusterMetadata>>;

    /// Promote a nominal member of `partition` to active. Returns `false` if
    /// the node is not a nominal member or is already active.
    async fn add_active_partition_member(
        &self,
        partition: PartitionId,
        node: &NodeId,
    ) -> ClusterResult<bool>;

    /// Demote an active member. Returns whether it was active.
    async fn remove_active_partition_member(
        &self,
        partition: PartitionId,
        node: &NodeId,
    ) -> ClusterResult<bool>;

    /// Members currently serving `partition`. May lag or lead nominal
    /// membership.
    async fn get_active_partition_members(
        &self,
        partition: PartitionId,
    ) -> ClusterResult<BTreeSet<NodeId>>;

    /// Subscribe to metadata replacements committed after this call.
    fn watch(&self) -> MetadataEventStream;
}

/// Metadata provider persisting into a versioned [`Store`].
#[derive(Clone, Debug)]
pub struct StoreMetadataProvider<S, Z = CborSerializer> {
    store: S,
    serializer: Z,
}

impl<S: Store> StoreMetadataProvider<S> {
    /// Create a provider encoding values as CBOR.
    pub const fn new(store: S) -> Self {
        Self {
            store,
            serializer: CborSerializer,
        }
    }
}

impl<S: Store, Z: Serializer> StoreMetadataProvider<S, Z> {
    /// Create a provider with a custom serializer.
    pub const fn with_serializer(store: S, serializer: Z) -> Self {
        Self { store, serializer }
    }

    fn active_key(partition: PartitionId) -> String {
        format!("{ACTIVE_MEMBERS_PREFIX}:{partition}")
    }

    async fn read_active(
        &self,
        partition: PartitionId,
    ) -> ClusterResult<(Option<u64>, BTreeSet<NodeId>)> {
        let entry = self
            .store
            .get(Self::active_key(partition))
            .await
            .map_err(|e| ClusterError::from_store(&e))?;

        match entry {
            Some(entry) => Ok((Some(entry.version), self.serializer.decode(&entry.value)?)),
            None => Ok((None, BTreeSet::new())),
        }
    }

    /// Read-modify-write of one partition's active set. `update` returns
    /// `false` to leave the set untouched.
    async fn update_active(
        &self,
        partition: PartitionId,
        update: impl Fn(&mut BTreeSet<NodeId>) -> bool + Send + Sync,
    ) -> ClusterResult<bool> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let (version, mut members) = self.read_active(partition).await?;
            if !update(&mut members) {
                return Ok(false);
            }

            let bytes = self.serializer.encode(&members)?;
            match self
                .store
                .replace(Self::active_key(partition), version, bytes)
                .await
            {
                Ok(_) => return Ok(true),
                Err(e) if e.is_conflict() => {
                    debug!(
                        "Active member update of partition {} conflicted (attempt {})",
                        partition, attempt
                    );
                }
                Err(e) => return Err(ClusterError::from_store(&e)),
            }
        }

        Err(ClusterError::Conflict(format!(
            "active members of partition {partition} kept changing"
        )))
    }
}

#[async_trait]
impl<S: Store, Z: Serializer> ClusterMetadataProvider for StoreMetadataProvider<S, Z> {
    async fn get_cluster_metadata(&self) -> ClusterResult<Option<Versioned<ClusterMetadata>>> {
        let entry = self
            .store
            .get(METADATA_KEY)
            .await
            .map_err(|e| ClusterError::from_store(&e))?;

        entry
            .map(|entry| entry.try_map(|bytes| self.serializer.decode(&bytes)))
            .transpose()
            .map_err(Into::into)
    }

    async fn set_cluster_metadata(
        &self,
        metadata: ClusterMetadata,
        expected_version: Option<u64>,
    ) -> ClusterResult<Versioned<ClusterMetadata>> {
        let bytes = self.serializer.encode(&metadata)?;
        let committed = self
            .store
            .replace(METADATA_KEY, expected_version, bytes)
            .await
            .map_err(|e| ClusterError::from_store(&e))?;

        debug!(
            "Stored cluster metadata '{}' at version {}",
            metadata.name(),
            committed.version
        );
        Ok(committed.map(|_| metadata))
    }

    async fn add_active_partition_member(
        &self,
        partition: PartitionId,
        node: &NodeId,
    ) -> ClusterResult<bool> {
        let Some(metadata) = self.get_cluster_metadata().await? else {
            return Ok(false);
        };
        let is_member = metadata
            .value
            .partition(partition)
            .is_some_and(|p| p.contains(node));
        if !is_member {
            return Ok(false);
        }

        self.update_active(partition, |members| members.insert(node.clone()))
            .await
    }

    async fn remove_active_partition_member(
        &self,
        partition: PartitionId,
        node: &NodeId,
    ) -> ClusterResult<bool> {
        self.update_active(partition, |members| members.remove(node))
            .await
    }

    async fn get_active_partition_members(
        &self,
        partition: PartitionId,
    ) -> ClusterResult<BTreeSet<NodeId>> {
        Ok(self.read_active(partition).await?.1)
    }

    fn watch(&self) -> MetadataEventStream {
        let state = (self.store.watch(), self.serializer.clone());
        Box::pin(stream::unfold(state, |(mut watcher, serializer)| async move {
            let event = next_metadata_event(&mut watcher, &serializer).await?;
            Some((event, (watcher, serializer)))
        }))
    }
}

async fn next_metadata_event<Z: Serializer>(
    watcher: &mut StoreWatcher,
    serializer: &Z,
) -> Option<ClusterMetadataEvent> {
    loop {
        let (old, new) = match watcher.recv().await {
            Ok(StoreEvent::Insert { key, new }) if key == METADATA_KEY => (None, new),
            Ok(StoreEvent::Update { key, old, new }) if key == METADATA_KEY => (Some(old), new),
            Ok(_) => continue,
            Err(WatchError::Lagged(skipped)) => {
                warn!("Metadata watcher skipped {} store events", skipped);
                continue;
            }
            Err(WatchError::Closed) => return None,
        };

        let decoded = old
            .map(|old| serializer.decode::<ClusterMetadata>(&old.value))
            .transpose()
            .and_then(|old| Ok((old, serializer.decode::<ClusterMetadata>(&new.value)?)));

        match decoded {
            Ok((old, metadata)) => {
                return Some(ClusterMetadataEvent {
                    old,
                    new: metadata,
                    version: new.version,
                });
            }
            Err(e) => warn!("Ignoring undecodable cluster metadata: {}", e),
        }
    }
}
