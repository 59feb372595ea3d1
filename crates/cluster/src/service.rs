//! Service interfaces of the node directory

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use concord_identifiers::NodeId;
use semver::Version;

use crate::error::ClusterResult;
use crate::event::{ClusterEvent, ClusterMetadataEvent, EventListener, ListenerId};
use crate::node::{ControllerNode, NodeState};

/// Read access to the set of known nodes.
///
/// Lookups of unknown ids return `None`, never an error.
pub trait ClusterService: Send + Sync + 'static {
    /// The local node.
    fn get_local_node(&self) -> ControllerNode;

    /// All known nodes, ordered by id.
    fn get_nodes(&self) -> Vec<ControllerNode>;

    /// A node by id.
    fn get_node(&self, id: &NodeId) -> Option<ControllerNode>;

    /// Liveness of a node.
    fn get_state(&self, id: &NodeId) -> Option<NodeState>;

    /// When the node's state last changed.
    fn get_last_updated(&self, id: &NodeId) -> Option<DateTime<Utc>>;

    /// Software version last advertised by a node.
    fn get_version(&self, id: &NodeId) -> Option<Version>;

    /// Register a callback for lifecycle events.
    fn add_listener(&self, listener: EventListener<ClusterEvent>) -> ListenerId;

    /// Unregister a callback.
    fn remove_listener(&self, id: ListenerId) -> bool;

    /// Register a callback for replacements of the cluster definition.
    ///
    /// Coordination services restart themselves when an event reports
    /// [`ClusterMetadataEvent::requires_restart`].
    fn add_metadata_listener(&self, listener: EventListener<ClusterMetadataEvent>) -> ListenerId;

    /// Unregister a metadata callback.
    fn remove_metadata_listener(&self, id: ListenerId) -> bool;
}

/// Privileged operations on the cluster definition.
#[async_trait]
pub trait ClusterAdminService: ClusterService {
    /// Replace the whole cluster definition with `nodes`, laid out with
    /// `partition_size` members per partition (or the configured default).
    ///
    /// This is destructive: every node restarts its coordination services
    /// once the new definition reaches its metadata listeners.
    ///
    /// # Errors
    ///
    /// Fails with [`ClusterError::EmptyCluster`](crate::ClusterError::EmptyCluster)
    /// if `nodes` is empty.
    async fn form_cluster(
        &self,
        nodes: Vec<ControllerNode>,
        partition_size: Option<usize>,
    ) -> ClusterResult<()>;

    /// Add a node to the cluster definition, or update its address.
    async fn add_node(&self, node: ControllerNode) -> ClusterResult<()>;

    /// Remove a node from the definition and from every partition.
    async fn remove_node(&self, id: &NodeId) -> ClusterResult<()>;

    /// Announce whether the local node has finished starting.
    async fn mark_fully_started(&self, started: bool);
}
