//! Cluster membership and metadata
//!
//! This crate provides:
//! - Controller nodes, partitions and versioned cluster metadata
//! - Diffing between metadata generations
//! - The node directory with heartbeat based liveness
//! - A version-aware membership view
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod config;
pub mod diff;
pub mod error;
pub mod event;
pub mod manager;
pub mod membership;
pub mod metadata;
pub mod node;
pub mod partition;
pub mod provider;
pub mod service;

pub use config::{ClusterConfig, ClusterDefinition, DEFAULT_PARTITION_SIZE};
pub use diff::{ClusterMetadataDiff, PartitionDiff};
pub use error::{ClusterError, ClusterResult};
pub use event::{
    ClusterEvent, ClusterEventType, ClusterMetadataEvent, EventListener, ListenerId,
    ListenerRegistry,
};
pub use manager::ClusterManager;
pub use membership::{Member, MembershipGroup, MembershipManager, MembershipService};
pub use metadata::{ClusterMetadata, ClusterMetadataBuilder};
pub use node::{ControllerNode, DEFAULT_PORT, NodeState};
pub use partition::{Partition, default_partitions};
pub use provider::{ClusterMetadataProvider, MetadataEventStream, StoreMetadataProvider};
pub use service::{ClusterAdminService, ClusterService};

pub use concord_identifiers::{NodeId, PartitionId};
