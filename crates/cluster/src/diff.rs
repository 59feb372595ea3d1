//! Differences between two generations of cluster metadata
//!
//! Diffs are derived values; they are computed on demand from two immutable
//! snapshots and never persisted.

use std::collections::{BTreeMap, BTreeSet};

use concord_identifiers::{NodeId, PartitionId};

use crate::metadata::ClusterMetadata;
use crate::node::ControllerNode;
use crate::partition::Partition;

/// Node and partition changes between an old and a new metadata generation.
#[derive(Clone, Debug)]
pub struct ClusterMetadataDiff {
    old: Option<ClusterMetadata>,
    new: ClusterMetadata,
    nodes_added: BTreeSet<ControllerNode>,
    nodes_removed: BTreeSet<NodeId>,
}

impl ClusterMetadataDiff {
    /// Diff `new` against `old`. A missing `old` is treated as an empty
    /// cluster.
    #[must_use]
    pub fn new(old: Option<&ClusterMetadata>, new: &ClusterMetadata) -> Self {
        let old_ids = old.map(ClusterMetadata::node_ids).unwrap_or_default();
        let new_ids = new.node_ids();

        let nodes_added = new
            .nodes()
            .iter()
            .filter(|node| !old_ids.contains(node.id()))
            .cloned()
            .collect();
        let nodes_removed = old_ids.difference(&new_ids).cloned().collect();

        Self {
            old: old.cloned(),
            new: new.clone(),
            nodes_added,
            nodes_removed,
        }
    }

    /// Nodes present in the new generation only.
    #[must_use]
    pub const fn nodes_added(&self) -> &BTreeSet<ControllerNode> {
        &self.nodes_added
    }

    /// Ids of nodes present in the old generation only.
    #[must_use]
    pub const fn nodes_removed(&self) -> &BTreeSet<NodeId> {
        &self.nodes_removed
    }

    /// Whether the node sets differ.
    #[must_use]
    pub fn nodes_changed(&self) -> bool {
        !self.nodes_added.is_empty() || !self.nodes_removed.is_empty()
    }

    /// Per-partition membership diffs.
    ///
    /// # Panics
    ///
    /// Panics if the two generations do not define the same partition ids.
    /// Changing the partition count is a re-formation of the cluster, not an
    /// incremental change.
    #[must_use]
    pub fn partition_diffs(&self) -> BTreeMap<PartitionId, PartitionDiff> {
        let Some(old) = &self.old else {
            return self
                .new
                .partitions()
                .map(|partition| (partition.id(), PartitionDiff::new(None, partition)))
                .collect();
        };

        let old_ids = old.partition_ids();
        let new_ids = self.new.partition_ids();
        assert!(
            old_ids == new_ids,
            "partition ids changed between metadata generations: {old_ids:?} -> {new_ids:?}"
        );

        self.new
            .partitions()
            .map(|partition| {
                let previous = old.partition(partition.id());
                (partition.id(), PartitionDiff::new(previous, partition))
            })
            .collect()
    }
}

/// Membership change of a single partition.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PartitionDiff {
    id: PartitionId,
    added: BTreeSet<NodeId>,
    removed: BTreeSet<NodeId>,
}

impl PartitionDiff {
    /// Diff `new` against `old`. A missing `old` is treated as a partition
    /// without members.
    ///
    /// # Panics
    ///
    /// Panics if both partitions are given and their ids differ.
    #[must_use]
    pub fn new(old: Option<&Partition>, new: &Partition) -> Self {
        let empty = BTreeSet::new();
        let old_members = match old {
            Some(old) => {
                assert_eq!(old.id(), new.id(), "diffing different partitions");
                old.members()
            }
            None => &empty,
        };

        Self {
            id: new.id(),
            added: new.members().difference(old_members).cloned().collect(),
            removed: old_members.difference(new.members()).cloned().collect(),
        }
    }

    /// The partition this diff describes.
    #[must_use]
    pub const fn id(&self) -> PartitionId {
        self.id
    }

    /// Whether `node` joined the partition.
    #[must_use]
    pub fn is_added(&self, node: &NodeId) -> bool {
        self.added.contains(node)
    }

    /// Whether `node` left the partition.
    #[must_use]
    pub fn is_removed(&self, node: &NodeId) -> bool {
        self.removed.contains(node)
    }

    /// Whether membership changed at all.
    #[must_use]
    pub fn has_changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }

    /// Nodes that joined.
    #[must_use]
    pub const fn added(&self) -> &BTreeSet<NodeId> {
        &self.added
    }

    /// Nodes that left.
    #[must_use]
    pub const fn removed(&self) -> &BTreeSet<NodeId> {
        &self.removed
    }
}
