//! Cluster metadata: the authoritative node set and partition table

use std::collections::{BTreeMap, BTreeSet};

use concord_identifiers::{NodeId, PartitionId};
use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, ClusterResult};
use crate::node::ControllerNode;
use crate::partition::Partition;

/// Immutable description of a cluster.
///
/// Every partition member is guaranteed to be one of `nodes`. Metadata is
/// never edited in place; producers build a new value and replace the stored
/// one wholesale.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawClusterMetadata")]
pub struct ClusterMetadata {
    provider_id: String,
    name: String,
    nodes: BTreeSet<ControllerNode>,
    partitions: BTreeMap<PartitionId, Partition>,
}

#[derive(Deserialize)]
struct RawClusterMetadata {
    provider_id: String,
    name: String,
    nodes: BTreeSet<ControllerNode>,
    partitions: BTreeMap<PartitionId, Partition>,
}

impl TryFrom<RawClusterMetadata> for ClusterMetadata {
    type Error = ClusterError;

    fn try_from(raw: RawClusterMetadata) -> Result<Self, Self::Error> {
        ClusterMetadataBuilder::new(raw.provider_id, raw.name)
            .nodes(raw.nodes)
            .partitions(raw.partitions.into_values())
            .build()
    }
}

impl ClusterMetadata {
    /// Create metadata.
    ///
    /// # Panics
    ///
    /// Panics if a partition references a node outside `nodes` or two
    /// partitions share an id. Use [`ClusterMetadata::builder`] to validate
    /// untrusted input instead.
    #[must_use]
    pub fn new(
        provider_id: impl Into<String>,
        name: impl Into<String>,
        nodes: impl IntoIterator<Item = ControllerNode>,
        partitions: impl IntoIterator<Item = Partition>,
    ) -> Self {
        match ClusterMetadataBuilder::new(provider_id, name)
            .nodes(nodes)
            .partitions(partitions)
            .build()
        {
            Ok(metadata) => metadata,
            Err(e) => panic!("invalid cluster metadata: {e}"),
        }
    }

    /// Start building metadata.
    pub fn builder(
        provider_id: impl Into<String>,
        name: impl Into<String>,
    ) -> ClusterMetadataBuilder {
        ClusterMetadataBuilder::new(provider_id, name)
    }

    /// Identifier of the provider that produced this metadata.
    #[must_use]
    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    /// Cluster name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cluster nodes, ordered by id.
    #[must_use]
    pub const fn nodes(&self) -> &BTreeSet<ControllerNode> {
        &self.nodes
    }

    /// Look up a node by id.
    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&ControllerNode> {
        self.nodes.iter().find(|node| node.id() == id)
    }

    /// Whether `id` is a cluster node.
    #[must_use]
    pub fn contains_node(&self, id: &NodeId) -> bool {
        self.node(id).is_some()
    }

    /// Ids of the cluster nodes.
    #[must_use]
    pub fn node_ids(&self) -> BTreeSet<NodeId> {
        self.nodes.iter().map(|node| node.id().clone()).collect()
    }

    /// Partitions, ordered by id.
    pub fn partitions(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.values()
    }

    /// Look up a partition.
    #[must_use]
    pub fn partition(&self, id: PartitionId) -> Option<&Partition> {
        self.partitions.get(&id)
    }

    /// Ids of all partitions.
    #[must_use]
    pub fn partition_ids(&self) -> BTreeSet<PartitionId> {
        self.partitions.keys().copied().collect()
    }

    /// Builder seeded with this metadata's contents.
    #[must_use]
    pub fn to_builder(&self) -> ClusterMetadataBuilder {
        ClusterMetadataBuilder::new(self.provider_id.clone(), self.name.clone())
            .nodes(self.nodes.iter().cloned())
            .partitions(self.partitions.values().cloned())
    }

    /// Whether two generations describe the same partition layout.
    #[must_use]
    pub fn same_partitions(&self, other: &Self) -> bool {
        self.partitions == other.partitions
    }
}

/// Validating builder for [`ClusterMetadata`].
#[derive(Clone, Debug)]
pub struct ClusterMetadataBuilder {
    provider_id: String,
    name: String,
    nodes: BTreeSet<ControllerNode>,
    partitions: Vec<Partition>,
}

impl ClusterMetadataBuilder {
    fn new(provider_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            name: name.into(),
            nodes: BTreeSet::new(),
            partitions: Vec::new(),
        }
    }

    /// Replace the node set.
    #[must_use]
    pub fn nodes(mut self, nodes: impl IntoIterator<Item = ControllerNode>) -> Self {
        self.nodes = nodes.into_iter().collect();
        self
    }

    /// Add or replace a single node.
    #[must_use]
    pub fn node(mut self, node: ControllerNode) -> Self {
        self.nodes.replace(node);
        self
    }

    /// Remove a node and strip it from every partition.
    #[must_use]
    pub fn without_node(mut self, id: &NodeId) -> Self {
        self.nodes.retain(|node| node.id() != id);
        self.partitions = self
            .partitions
            .iter()
            .map(|partition| partition.without(id))
            .collect();
        self
    }

    /// Replace the partitions.
    #[must_use]
    pub fn partitions(mut self, partitions: impl IntoIterator<Item = Partition>) -> Self {
        self.partitions = partitions.into_iter().collect();
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// Fails if a partition references a node outside the node set or two
    /// partitions share an id.
    pub fn build(self) -> ClusterResult<ClusterMetadata> {
        let ids: BTreeSet<&NodeId> = self.nodes.iter().map(ControllerNode::id).collect();
        let mut partitions = BTreeMap::new();

        for partition in self.partitions {
            if let Some(node) = partition.members().iter().find(|m| !ids.contains(m)) {
                return Err(ClusterError::UnknownPartitionMember {
                    partition: partition.id(),
                    node: node.clone(),
                });
            }
            if partitions.contains_key(&partition.id()) {
                return Err(ClusterError::DuplicatePartition(partition.id()));
            }
            partitions.insert(partition.id(), partition);
        }

        Ok(ClusterMetadata {
            provider_id: self.provider_id,
            name: self.name,
            nodes: self.nodes,
            partitions,
        })
    }
}
