//! Node directory backed by stored metadata and peer heartbeats

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use concord_bootable::{BootError, Bootable};
use concord_identifiers::NodeId;
use concord_store::{CborSerializer, Serializer};
use concord_transport::{ClusterCommunicator, Envelope, HandlerError, handler_fn};
use futures::StreamExt;
use parking_lot::RwLock;
use semver::Version;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ClusterConfig;
use crate::error::{ClusterError, ClusterResult};
use crate::event::{
    ClusterEvent, ClusterEventType, ClusterMetadataEvent, EventListener, ListenerId,
    ListenerRegistry,
};
use crate::metadata::ClusterMetadata;
use crate::node::{ControllerNode, NodeState};
use crate::partition::default_partitions;
use crate::provider::ClusterMetadataProvider;
use crate::service::{ClusterAdminService, ClusterService};

/// Subject heartbeats are exchanged on
pub const HEARTBEAT_SUBJECT: &str = "cluster-heartbeat";

/// Provider id recorded in metadata produced by admin operations
const ADMIN_PROVIDER_ID: &str = "admin";

/// Name given to a cluster formed without prior metadata
const DEFAULT_CLUSTER_NAME: &str = "default";

#[derive(Debug, Serialize, Deserialize)]
struct Heartbeat {
    node: ControllerNode,
    state: NodeState,
    version: Version,
}

#[derive(Clone, Debug)]
struct NodeRecord {
    node: ControllerNode,
    state: NodeState,
    last_updated: DateTime<Utc>,
    last_heard: Instant,
    version: Option<Version>,
}

impl NodeRecord {
    fn new(node: ControllerNode, state: NodeState) -> Self {
        Self {
            node,
            state,
            last_updated: Utc::now(),
            last_heard: Instant::now(),
            version: None,
        }
    }

    /// Move to `state`, returning the event describing the transition.
    fn transition(&mut self, state: NodeState) -> Option<ClusterEvent> {
        if self.state == state {
            return None;
        }

        self.state = state;
        self.last_updated = Utc::now();

        let event_type = match state {
            NodeState::Inactive => ClusterEventType::InstanceDeactivated,
            NodeState::Active => ClusterEventType::InstanceActivated,
            NodeState::Ready => ClusterEventType::InstanceReady,
        };
        Some(ClusterEvent::new(event_type, self.node.clone()))
    }
}

#[derive(Debug, Default)]
struct Directory {
    records: HashMap<NodeId, NodeRecord>,
    applied_version: u64,
}

/// State shared with background tasks and message handlers
struct DirectoryShared {
    local: ControllerNode,
    config: ClusterConfig,
    directory: RwLock<Directory>,
    listeners: ListenerRegistry<ClusterEvent>,
    metadata_listeners: ListenerRegistry<ClusterMetadataEvent>,
}

impl DirectoryShared {
    /// Directory holding only the local node, active at its configured version.
    fn new(local: ControllerNode, config: ClusterConfig) -> Self {
        let mut directory = Directory::default();
        directory.records.insert(
            local.id().clone(),
            NodeRecord {
                version: Some(config.version.clone()),
                ..NodeRecord::new(local.clone(), NodeState::Active)
            },
        );

        Self {
            local,
            config,
            directory: RwLock::new(directory),
            listeners: ListenerRegistry::new(),
            metadata_listeners: ListenerRegistry::new(),
        }
    }

    fn local_state(&self) -> NodeState {
        self.directory
            .read()
            .records
            .get(self.local.id())
            .map_or(NodeState::Active, |record| record.state)
    }

    fn publish(&self, events: Vec<ClusterEvent>) {
        for event in events {
            debug!(
                "Cluster event {:?} for {}",
                event.event_type,
                event.subject.id()
            );
            self.listeners.publish(&event);
        }
    }

    /// Reconcile the directory with a committed metadata generation.
    ///
    /// Generations older than the last applied one are ignored, so the
    /// direct path and the watch path may race freely.
    fn apply_metadata(&self, version: u64, metadata: &ClusterMetadata) {
        let mut events = Vec::new();
        {
            let mut directory = self.directory.write();
            if version <= directory.applied_version {
                return;
            }
            directory.applied_version = version;

            for node in metadata.nodes() {
                match directory.records.get_mut(node.id()) {
                    Some(record) => record.node = node.clone(),
                    None => {
                        directory
                            .records
                            .insert(node.id().clone(), NodeRecord::new(node.clone(), NodeState::Inactive));
                        events.push(ClusterEvent::new(
                            ClusterEventType::InstanceAdded,
                            node.clone(),
                        ));
                    }
                }
            }

            let removed: Vec<NodeId> = directory
                .records
                .keys()
                .filter(|id| *id != self.local.id() && !metadata.contains_node(id))
                .cloned()
                .collect();
            for id in removed {
                if let Some(record) = directory.records.remove(&id) {
                    events.push(ClusterEvent::new(
                        ClusterEventType::InstanceRemoved,
                        record.node,
                    ));
                }
            }
        }

        info!(
            "Applied cluster metadata version {} ({} nodes)",
            version,
            metadata.nodes().len()
        );
        self.publish(events);
    }

    fn record_heartbeat(&self, heartbeat: Heartbeat) {
        let events = {
            let mut directory = self.directory.write();
            let Some(record) = directory.records.get_mut(heartbeat.node.id()) else {
                debug!(
                    "Ignoring heartbeat from {} which is not a cluster member",
                    heartbeat.node.id()
                );
                return;
            };

            record.last_heard = Instant::now();
            record.node = heartbeat.node;
            let previous = record.version.replace(heartbeat.version.clone());

            let mut events: Vec<ClusterEvent> =
                record.transition(heartbeat.state).into_iter().collect();
            if previous.is_some_and(|previous| previous != heartbeat.version) {
                info!(
                    "{} now runs version {}",
                    record.node.id(),
                    heartbeat.version
                );
                events.push(ClusterEvent::new(
                    ClusterEventType::InstanceUpdated,
                    record.node.clone(),
                ));
            }
            events
        };

        self.publish(events);
    }

    fn detect_failures(&self) {
        let timeout = self.config.failure_timeout;
        let events: Vec<ClusterEvent> = {
            let mut directory = self.directory.write();
            directory
                .records
                .values_mut()
                .filter(|record| record.node.id() != self.local.id())
                .filter(|record| record.state.is_active() && record.last_heard.elapsed() > timeout)
                .filter_map(|record| {
                    warn!(
                        "No heartbeat from {} for {:?}, marking inactive",
                        record.node.id(),
                        record.last_heard.elapsed()
                    );
                    record.transition(NodeState::Inactive)
                })
                .collect()
        };

        self.publish(events);
    }

    fn set_local_state(&self, state: NodeState) {
        let event = {
            let mut directory = self.directory.write();
            let record = directory
                .records
                .entry(self.local.id().clone())
                .or_insert_with(|| NodeRecord::new(self.local.clone(), NodeState::Active));
            record.version = Some(self.config.version.clone());
            record.transition(state)
        };

        self.publish(event.into_iter().collect());
    }

    fn peers(&self) -> Vec<NodeId> {
        self.directory
            .read()
            .records
            .keys()
            .filter(|id| *id != self.local.id())
            .cloned()
            .collect()
    }

    fn heartbeat(&self) -> Heartbeat {
        Heartbeat {
            node: self.local.clone(),
            state: self.local_state(),
            version: self.config.version.clone(),
        }
    }
}

/// Bootable state for background tasks
#[derive(Default)]
struct BootableState {
    tasks: Vec<JoinHandle<()>>,
    shutdown_signals: Vec<oneshot::Sender<()>>,
}

/// Tracks cluster nodes and their liveness
///
/// The node set follows the metadata held by the provider; liveness follows
/// heartbeats exchanged over the communicator.
pub struct ClusterManager<P>
where
    P: ClusterMetadataProvider,
{
    shared: Arc<DirectoryShared>,
    provider: Arc<P>,
    communicator: Arc<dyn ClusterCommunicator>,
    bootable_state: Mutex<BootableState>,
}

impl<P> ClusterManager<P>
where
    P: ClusterMetadataProvider,
{
    /// Create a cluster manager for `local`
    pub fn new(
        local: ControllerNode,
        provider: Arc<P>,
        communicator: Arc<dyn ClusterCommunicator>,
        config: ClusterConfig,
    ) -> Self {
        info!(
            "Creating cluster manager for node {} with heartbeat interval {:?}",
            local.id(),
            config.heartbeat_interval
        );

        Self {
            shared: Arc::new(DirectoryShared::new(local, config)),
            provider,
            communicator,
            bootable_state: Mutex::new(BootableState::default()),
        }
    }

    /// The metadata provider
    pub const fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    /// Read-modify-write of the stored metadata
    ///
    /// `update` returns `None` to leave the metadata untouched.
    async fn update_metadata<F>(&self, update: F) -> ClusterResult<()>
    where
        F: Fn(Option<&ClusterMetadata>) -> ClusterResult<Option<ClusterMetadata>> + Send + Sync,
    {
        for attempt in 1..=self.shared.config.metadata_retry_attempts {
            let current = self.provider.get_cluster_metadata().await?;
            let Some(next) = update(current.as_ref().map(|v| &v.value))? else {
                return Ok(());
            };

            match self
                .provider
                .set_cluster_metadata(next, current.map(|v| v.version))
                .await
            {
                Ok(committed) => {
                    self.shared
                        .apply_metadata(committed.version, &committed.value);
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    debug!("Metadata update conflicted (attempt {})", attempt);
                }
                Err(e) => return Err(e),
            }
        }

        Err(ClusterError::Conflict(
            "cluster metadata kept changing".to_string(),
        ))
    }

    async fn load_metadata(&self) -> ClusterResult<()> {
        let local = self.shared.local.clone();
        let bootstrap = self.shared.config.bootstrap.clone();
        let partition_size = self.shared.config.default_partition_size;

        self.update_metadata(|current| {
            if current.is_some() {
                return Ok(None);
            }

            match &bootstrap {
                Some(metadata) => Ok(Some(metadata.clone())),
                None => {
                    let ids = BTreeSet::from([local.id().clone()]);
                    ClusterMetadata::builder(ADMIN_PROVIDER_ID, DEFAULT_CLUSTER_NAME)
                        .nodes([local.clone()])
                        .partitions(default_partitions(&ids, partition_size))
                        .build()
                        .map(Some)
                }
            }
        })
        .await?;

        // Another node may have initialized the store first.
        if let Some(current) = self.provider.get_cluster_metadata().await? {
            self.shared.apply_metadata(current.version, &current.value);
        }

        Ok(())
    }

    fn register_heartbeat_handler(&self) {
        let shared = self.shared.clone();
        self.communicator.add_subscriber(
            HEARTBEAT_SUBJECT,
            handler_fn(move |envelope: Envelope| {
                let shared = shared.clone();
                async move {
                    let heartbeat: Heartbeat = CborSerializer
                        .decode(&envelope.payload)
                        .map_err(HandlerError::new)?;

                    if heartbeat.node.id() != &envelope.sender {
                        return Err(HandlerError::new(format!(
                            "heartbeat for {} sent by {}",
                            heartbeat.node.id(),
                            envelope.sender
                        )));
                    }

                    shared.record_heartbeat(heartbeat);
                    Ok(Bytes::new())
                }
            }),
        );
    }

    fn spawn_heartbeat_task(&self, mut shutdown_rx: oneshot::Receiver<()>) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let communicator = self.communicator.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(shared.config.heartbeat_interval);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        shared.detect_failures();

                        let payload = match CborSerializer.encode(&shared.heartbeat()) {
                            Ok(payload) => payload,
                            Err(e) => {
                                error!("Failed to encode heartbeat: {}", e);
                                continue;
                            }
                        };
                        communicator
                            .multicast(HEARTBEAT_SUBJECT, payload, &shared.peers())
                            .await;
                    }
                    _ = &mut shutdown_rx => {
                        debug!("Heartbeat task for {} shutting down", shared.local.id());
                        break;
                    }
                }
            }
        })
    }

    fn spawn_metadata_task(&self, mut shutdown_rx: oneshot::Receiver<()>) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let mut events = self.provider.watch();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.next() => {
                        let Some(event) = event else {
                            warn!("Cluster metadata stream closed");
                            break;
                        };

                        if event.requires_restart() {
                            info!(
                                "Partition layout changed at version {}, signalling coordination restart",
                                event.version
                            );
                        }
                        shared.apply_metadata(event.version, &event.new);
                        shared.metadata_listeners.publish(&event);
                    }
                    _ = &mut shutdown_rx => {
                        debug!("Metadata task for {} shutting down", shared.local.id());
                        break;
                    }
                }
            }
        })
    }
}

impl<P> ClusterService for ClusterManager<P>
where
    P: ClusterMetadataProvider,
{
    fn get_local_node(&self) -> ControllerNode {
        self.shared.local.clone()
    }

    fn get_nodes(&self) -> Vec<ControllerNode> {
        let mut nodes: Vec<ControllerNode> = self
            .shared
            .directory
            .read()
            .records
            .values()
            .map(|record| record.node.clone())
            .collect();
        nodes.sort();
        nodes
    }

    fn get_node(&self, id: &NodeId) -> Option<ControllerNode> {
        self.shared
            .directory
            .read()
            .records
            .get(id)
            .map(|record| record.node.clone())
    }

    fn get_state(&self, id: &NodeId) -> Option<NodeState> {
        self.shared
            .directory
            .read()
            .records
            .get(id)
            .map(|record| record.state)
    }

    fn get_last_updated(&self, id: &NodeId) -> Option<DateTime<Utc>> {
        self.shared
            .directory
            .read()
            .records
            .get(id)
            .map(|record| record.last_updated)
    }

    fn get_version(&self, id: &NodeId) -> Option<Version> {
        self.shared
            .directory
            .read()
            .records
            .get(id)
            .and_then(|record| record.version.clone())
    }

    fn add_listener(&self, listener: EventListener<ClusterEvent>) -> ListenerId {
        self.shared.listeners.add_listener(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.listeners.remove_listener(id)
    }

    fn add_metadata_listener(&self, listener: EventListener<ClusterMetadataEvent>) -> ListenerId {
        self.shared.metadata_listeners.add_listener(listener)
    }

    fn remove_metadata_listener(&self, id: ListenerId) -> bool {
        self.shared.metadata_listeners.remove_listener(id)
    }
}

#[async_trait]
impl<P> ClusterAdminService for ClusterManager<P>
where
    P: ClusterMetadataProvider,
{
    async fn form_cluster(
        &self,
        nodes: Vec<ControllerNode>,
        partition_size: Option<usize>,
    ) -> ClusterResult<()> {
        if nodes.is_empty() {
            return Err(ClusterError::EmptyCluster);
        }

        let size = partition_size.unwrap_or(self.shared.config.default_partition_size);
        let ids: BTreeSet<NodeId> = nodes.iter().map(|node| node.id().clone()).collect();
        info!(
            "Forming cluster of {} nodes with partition size {}",
            ids.len(),
            size
        );

        self.update_metadata(|current| {
            let name = current.map_or(DEFAULT_CLUSTER_NAME, ClusterMetadata::name);
            ClusterMetadata::builder(ADMIN_PROVIDER_ID, name)
                .nodes(nodes.iter().cloned())
                .partitions(default_partitions(&ids, size))
                .build()
                .map(Some)
        })
        .await
    }

    async fn add_node(&self, node: ControllerNode) -> ClusterResult<()> {
        info!("Adding node {} to cluster", node);

        self.update_metadata(|current| {
            let current = current.ok_or(ClusterError::NoMetadata)?;
            if current
                .node(node.id())
                .is_some_and(|existing| existing.same_endpoint(&node))
            {
                return Ok(None);
            }
            current.to_builder().node(node.clone()).build().map(Some)
        })
        .await
    }

    async fn remove_node(&self, id: &NodeId) -> ClusterResult<()> {
        info!("Removing node {} from cluster", id);

        self.update_metadata(|current| {
            let current = current.ok_or(ClusterError::NoMetadata)?;
            if !current.contains_node(id) {
                return Ok(None);
            }
            current.to_builder().without_node(id).build().map(Some)
        })
        .await
    }

    async fn mark_fully_started(&self, started: bool) {
        let state = if started {
            NodeState::Ready
        } else {
            NodeState::Active
        };
        info!("Marking local node {} as {}", self.shared.local.id(), state);
        self.shared.set_local_state(state);
    }
}

#[async_trait]
impl<P> Bootable for ClusterManager<P>
where
    P: ClusterMetadataProvider,
{
    fn name(&self) -> &str {
        "ClusterManager"
    }

    async fn start(&self) -> Result<(), BootError> {
        let mut state = self.bootable_state.lock().await;
        if !state.tasks.is_empty() {
            debug!("ClusterManager already started");
            return Ok(());
        }

        info!("Starting ClusterManager for node {}", self.shared.local.id());

        // Watch before loading so no replacement slips between the two.
        let (metadata_tx, metadata_rx) = oneshot::channel();
        let metadata_task = self.spawn_metadata_task(metadata_rx);

        if let Err(e) = self.load_metadata().await {
            metadata_task.abort();
            return Err(e.into());
        }
        self.register_heartbeat_handler();

        let (heartbeat_tx, heartbeat_rx) = oneshot::channel();
        let heartbeat_task = self.spawn_heartbeat_task(heartbeat_rx);

        state.tasks = vec![metadata_task, heartbeat_task];
        state.shutdown_signals = vec![metadata_tx, heartbeat_tx];

        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BootError> {
        info!("Shutting down ClusterManager for node {}", self.shared.local.id());

        self.communicator.remove_subscriber(HEARTBEAT_SUBJECT);

        let mut state = self.bootable_state.lock().await;
        for signal in state.shutdown_signals.drain(..) {
            let _ = signal.send(());
        }

        for task in state.tasks.drain(..) {
            match tokio::time::timeout(Duration::from_secs(5), task).await {
                Ok(Ok(())) => debug!("ClusterManager task shut down cleanly"),
                Ok(Err(e)) => error!("ClusterManager task panicked: {}", e),
                Err(_) => error!("ClusterManager task did not shut down within timeout"),
            }
        }

        info!("ClusterManager shutdown complete");
        Ok(())
    }

    async fn wait(&self) {
        let handles: Vec<_> = {
            let state = self.bootable_state.lock().await;
            state.tasks.iter().map(JoinHandle::abort_handle).collect()
        };

        while !handles.iter().all(tokio::task::AbortHandle::is_finished) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tracing_test::traced_test;

    fn node(name: &str) -> ControllerNode {
        ControllerNode::with_default_port(
            NodeId::new(name).unwrap(),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
        )
    }

    fn metadata(names: &[&str]) -> ClusterMetadata {
        ClusterMetadata::builder("test", "lab")
            .nodes(names.iter().map(|name| node(name)))
            .build()
            .unwrap()
    }

    fn shared(failure_timeout: Duration) -> DirectoryShared {
        DirectoryShared::new(
            node("n1"),
            ClusterConfig {
                failure_timeout,
                ..ClusterConfig::default()
            },
        )
    }

    fn heartbeat(name: &str, state: NodeState) -> Heartbeat {
        Heartbeat {
            node: node(name),
            state,
            version: Version::new(0, 1, 0),
        }
    }

    #[test]
    fn test_stale_metadata_generation_ignored() {
        let shared = shared(Duration::from_secs(3));
        let mut events = shared.listeners.subscribe();

        shared.apply_metadata(2, &metadata(&["n1", "n2"]));
        shared.apply_metadata(1, &metadata(&["n1"]));
        shared.apply_metadata(2, &metadata(&["n1"]));

        assert!(shared.directory.read().records.contains_key(&NodeId::new("n2").unwrap()));
        let added: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        // The local node is known from the start, so only n2 is new.
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].event_type, ClusterEventType::InstanceAdded);
        assert_eq!(added[0].subject.id().as_str(), "n2");
    }

    #[test]
    fn test_heartbeat_from_unknown_node_ignored() {
        let shared = shared(Duration::from_secs(3));
        shared.apply_metadata(1, &metadata(&["n1"]));

        shared.record_heartbeat(heartbeat("n9", NodeState::Active));
        assert!(!shared.directory.read().records.contains_key(&NodeId::new("n9").unwrap()));
    }

    #[test]
    #[traced_test]
    fn test_silent_peer_marked_inactive() {
        let shared = shared(Duration::ZERO);
        shared.apply_metadata(1, &metadata(&["n1", "n2"]));
        shared.record_heartbeat(heartbeat("n2", NodeState::Ready));

        let n2 = NodeId::new("n2").unwrap();
        assert_eq!(shared.directory.read().records[&n2].state, NodeState::Ready);

        std::thread::sleep(Duration::from_millis(5));
        shared.detect_failures();

        let directory = shared.directory.read();
        assert_eq!(directory.records[&n2].state, NodeState::Inactive);
        // The local node never times itself out.
        assert_eq!(
            directory.records[&NodeId::new("n1").unwrap()].state,
            NodeState::Active
        );
        assert!(logs_contain("marking inactive"));
    }

    #[test]
    fn test_version_change_is_published() {
        let shared = shared(Duration::from_secs(3));
        shared.apply_metadata(1, &metadata(&["n1", "n2"]));
        shared.record_heartbeat(heartbeat("n2", NodeState::Active));
        let mut events = shared.listeners.subscribe();

        shared.record_heartbeat(heartbeat("n2", NodeState::Active));
        assert!(events.try_recv().is_err());

        shared.record_heartbeat(Heartbeat {
            version: Version::new(0, 2, 0),
            ..heartbeat("n2", NodeState::Active)
        });

        let event = events.try_recv().unwrap();
        assert_eq!(event.event_type, ClusterEventType::InstanceUpdated);
        assert_eq!(event.subject.id().as_str(), "n2");
        assert_eq!(
            shared.directory.read().records[&NodeId::new("n2").unwrap()].version,
            Some(Version::new(0, 2, 0))
        );
    }

    #[test]
    fn test_local_state_reaches_heartbeat() {
        let shared = shared(Duration::from_secs(3));
        shared.set_local_state(NodeState::Ready);

        let heartbeat = shared.heartbeat();
        assert_eq!(heartbeat.state, NodeState::Ready);
        assert_eq!(heartbeat.node.id(), shared.local.id());
        assert!(shared.peers().is_empty());
    }
}
