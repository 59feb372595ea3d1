//! Keyspace partitions and their default layout

use std::collections::BTreeSet;

use concord_identifiers::{NodeId, PartitionId};
use serde::{Deserialize, Serialize};

/// A slice of the shared keyspace and the nodes that nominally own it.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    id: PartitionId,
    members: BTreeSet<NodeId>,
}

impl Partition {
    /// Create a partition.
    pub fn new(id: PartitionId, members: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            id,
            members: members.into_iter().collect(),
        }
    }

    /// The partition id.
    #[must_use]
    pub const fn id(&self) -> PartitionId {
        self.id
    }

    /// Nominal members.
    #[must_use]
    pub const fn members(&self) -> &BTreeSet<NodeId> {
        &self.members
    }

    /// Whether `node` is a nominal member.
    #[must_use]
    pub fn contains(&self, node: &NodeId) -> bool {
        self.members.contains(node)
    }

    /// A copy of this partition without `node`.
    #[must_use]
    pub fn without(&self, node: &NodeId) -> Self {
        let mut members = self.members.clone();
        members.remove(node);
        Self {
            id: self.id,
            members,
        }
    }
}

/// Lay out one partition per node.
///
/// Nodes are sorted by id and partition `i` is owned by nodes
/// `i, i+1, .., i+size-1`, wrapping around. `size` is clamped to the number of
/// nodes, so every node owns exactly `size` partitions.
#[must_use]
pub fn default_partitions(nodes: &BTreeSet<NodeId>, size: usize) -> Vec<Partition> {
    let sorted: Vec<&NodeId> = nodes.iter().collect();
    let count = sorted.len();
    let size = size.clamp(1, count.max(1));

    (0..count)
        .map(|i| {
            let members = (0..size).map(|j| sorted[(i + j) % count].clone());
            Partition::new(partition_id(i), members)
        })
        .collect()
}

fn partition_id(index: usize) -> PartitionId {
    PartitionId::new(u32::try_from(index).unwrap_or(u32::MAX))
}
