//! Error types for cluster operations

use concord_identifiers::{NodeId, PartitionId};
use concord_store::{CodecError, StoreError, StoreErrorKind};
use thiserror::Error;

/// Cluster-related errors
#[derive(Clone, Debug, Error)]
pub enum ClusterError {
    /// A cluster must contain at least one node
    #[error("cannot form a cluster without nodes")]
    EmptyCluster,

    /// A partition lists a node that is not part of the cluster
    #[error("partition {partition} references unknown node {node}")]
    UnknownPartitionMember {
        /// Offending partition
        partition: PartitionId,
        /// Node missing from the node set
        node: NodeId,
    },

    /// Two partitions share an id
    #[error("duplicate partition {0}")]
    DuplicatePartition(PartitionId),

    /// Metadata was written concurrently; retry against fresh state
    #[error("cluster metadata conflict: {0}")]
    Conflict(String),

    /// No metadata has been stored yet
    #[error("cluster metadata is not initialized")]
    NoMetadata,

    /// Reading or parsing a cluster definition failed
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Stored metadata could not be decoded
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Backing store failure
    #[error("Store error: {0}")]
    Store(String),
}

impl ClusterError {
    /// Whether the operation lost a compare-and-swap race.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Map a backend error, preserving conflicts.
    pub fn from_store<E: StoreError>(error: &E) -> Self {
        match error.kind() {
            StoreErrorKind::Conflict => Self::Conflict(error.to_string()),
            _ => Self::Store(error.to_string()),
        }
    }
}

/// Result type for cluster operations
pub type ClusterResult<T> = Result<T, ClusterError>;
