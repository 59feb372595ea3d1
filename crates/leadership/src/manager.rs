//! Store-backed leadership service

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use concord_bootable::{BootError, Bootable};
use concord_cluster::{
    ClusterEvent, ClusterEventType, ClusterMetadataEvent, ClusterService, EventListener,
    ListenerId, ListenerRegistry,
};
use concord_identifiers::NodeId;
use concord_store::{CborSerializer, Serializer, Store, Versioned, WatchError};
use dashmap::DashSet;
use parking_lot::RwLock;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::LeadershipConfig;
use crate::election::ElectionState;
use crate::error::{LeadershipError, LeadershipResult};
use crate::event::{LeadershipEvent, derive_events};
use crate::leadership::Leadership;
use crate::service::{LeadershipAdminService, LeadershipService};
use crate::store::LeadershipStore;

/// State shared with background tasks and spawned operations
struct LeadershipShared<S, Z> {
    local: NodeId,
    config: LeadershipConfig,
    store: LeadershipStore<S, Z>,
    board: RwLock<HashMap<String, Versioned<Leadership>>>,
    /// Serializes board updates with their event delivery.
    publish_lock: parking_lot::Mutex<()>,
    active_topics: DashSet<String>,
    listeners: ListenerRegistry<LeadershipEvent>,
}

impl<S: Store, Z: Serializer> LeadershipShared<S, Z> {
    fn leadership(&self, topic: &str) -> Option<Leadership> {
        self.board.read().get(topic).map(|record| record.value.clone())
    }

    /// Replace a board entry with a strictly newer record, notifying
    /// listeners of the change if `notify` is set.
    fn apply(&self, record: Versioned<Leadership>, notify: bool) {
        let _ordered = self.publish_lock.lock();

        let events = {
            let mut board = self.board.write();
            let previous = match board.get(&record.value.topic) {
                Some(current) if current.version >= record.version => return,
                Some(current) => current.value.clone(),
                None => Leadership::empty(record.value.topic.clone()),
            };
            let events = if notify {
                derive_events(&previous, &record.value)
            } else {
                Vec::new()
            };
            board.insert(record.value.topic.clone(), record);
            events
        };

        for event in events {
            debug!(
                "Leadership event {:?} for '{}' (epoch {})",
                event.event_type, event.subject.topic, event.subject.epoch
            );
            self.listeners.publish(&event);
        }
    }

    async fn commit<R, F>(&self, topic: &str, operation: F) -> LeadershipResult<R>
    where
        R: Send,
        F: Fn(&mut ElectionState, u64) -> R + Send + Sync,
    {
        let committed = self.store.update(topic, operation).await?;
        if let Some(record) = committed.leadership {
            self.apply(record, true);
        }
        Ok(committed.outcome)
    }

    /// Re-read every record. Records that cannot be read are skipped.
    async fn resync(&self, notify: bool) -> LeadershipResult<()> {
        for topic in self.store.topics().await? {
            match self.store.get(&topic).await {
                Ok(Some(record)) => self.apply(record, notify),
                Ok(None) => {}
                Err(e) => warn!("Skipping election record of '{}': {}", topic, e),
            }
        }
        Ok(())
    }

    /// Remove `node` from every topic. A failing topic does not stop the
    /// others; the first failure is reported once all were attempted.
    async fn evict(&self, node: &NodeId) -> LeadershipResult<()> {
        let mut first_error = None;
        for topic in self.store.topics().await? {
            if let Err(e) = self
                .commit(&topic, |state, now| state.evict(node, now))
                .await
            {
                warn!("Failed to evict {} from '{}': {}", node, topic, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Catch up with missed commits and rejoin races the local node was
    /// evicted from while still contesting them.
    async fn reconcile(&self) {
        if let Err(e) = self.resync(true).await {
            warn!("Failed to re-read leadership records: {}", e);
            return;
        }

        let evicted: Vec<String> = self
            .active_topics
            .iter()
            .map(|topic| topic.key().clone())
            .filter(|topic| {
                !self
                    .leadership(topic)
                    .is_some_and(|leadership| leadership.is_candidate(&self.local))
            })
            .collect();

        for topic in evicted {
            info!("Rejoining leadership race for '{}'", topic);
            let result = self
                .commit(&topic, |state, now| {
                    self.active_topics.contains(&topic) && state.run(&self.local, now)
                })
                .await;
            if let Err(e) = result {
                warn!("Failed to rejoin leadership race for '{}': {}", topic, e);
            }
        }
    }

    /// Rebuild after the cluster definition was replaced: re-read every
    /// record and run again for every topic the local node contests.
    async fn restart(&self) {
        if let Err(e) = self.resync(true).await {
            warn!("Failed to re-read leadership records on restart: {}", e);
        }

        let topics: Vec<String> = self
            .active_topics
            .iter()
            .map(|topic| topic.key().clone())
            .collect();
        for topic in topics {
            let result = self
                .commit(&topic, |state, now| {
                    self.active_topics.contains(&topic) && state.run(&self.local, now)
                })
                .await;
            if let Err(e) = result {
                warn!("Failed to run again for '{}' on restart: {}", topic, e);
            }
        }
    }
}

/// Run an election operation to completion even if the caller goes away.
async fn spawn_operation<T, F>(operation: F) -> LeadershipResult<T>
where
    T: Send + 'static,
    F: Future<Output = LeadershipResult<T>> + Send + 'static,
{
    tokio::spawn(operation)
        .await
        .map_err(|e| LeadershipError::Interrupted(e.to_string()))?
}

/// Bootable state for background tasks
#[derive(Default)]
struct BootableState {
    tasks: Vec<JoinHandle<()>>,
    shutdown_signals: Vec<oneshot::Sender<()>>,
    cluster_listener: Option<ListenerId>,
    metadata_listener: Option<ListenerId>,
}

/// Leadership service backed by a versioned store
///
/// Every node runs one manager over the same store. Commits go straight to
/// the store; the local board follows the store's change stream and a
/// periodic re-read.
pub struct LeadershipManager<S, Z = CborSerializer>
where
    S: Store,
    Z: Serializer,
{
    shared: Arc<LeadershipShared<S, Z>>,
    cluster: Arc<dyn ClusterService>,
    bootable_state: Mutex<BootableState>,
}

impl<S: Store> LeadershipManager<S> {
    /// Create a manager for the local node of `cluster`, encoding records as
    /// CBOR.
    pub fn new(cluster: Arc<dyn ClusterService>, store: S, config: LeadershipConfig) -> Self {
        Self::with_serializer(cluster, store, CborSerializer, config)
    }
}

impl<S: Store, Z: Serializer> LeadershipManager<S, Z> {
    /// Create a manager with a custom serializer.
    pub fn with_serializer(
        cluster: Arc<dyn ClusterService>,
        store: S,
        serializer: Z,
        config: LeadershipConfig,
    ) -> Self {
        let local = cluster.get_local_node().id().clone();
        info!(
            "Creating leadership manager for node {} with reconcile interval {:?}",
            local, config.reconcile_interval
        );

        Self {
            shared: Arc::new(LeadershipShared {
                local,
                store: LeadershipStore::with_serializer(store, serializer, &config),
                config,
                board: RwLock::new(HashMap::new()),
                publish_lock: parking_lot::Mutex::new(()),
                active_topics: DashSet::new(),
                listeners: ListenerRegistry::new(),
            }),
            cluster,
            bootable_state: Mutex::new(BootableState::default()),
        }
    }

    fn spawn_watch_task(&self, mut shutdown_rx: oneshot::Receiver<()>) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let mut watcher = shared.store.watch();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = watcher.recv() => match event {
                        Ok(event) => match shared.store.decode_event(event) {
                            Ok(Some(record)) => shared.apply(record, true),
                            Ok(None) => {}
                            Err(e) => warn!("Ignoring undecodable election record: {}", e),
                        },
                        Err(WatchError::Lagged(skipped)) => {
                            warn!("Leadership watcher skipped {} store events, resyncing", skipped);
                            if let Err(e) = shared.resync(true).await {
                                warn!("Resync after lag failed: {}", e);
                            }
                        }
                        Err(WatchError::Closed) => {
                            warn!("Leadership store watch closed");
                            break;
                        }
                    },
                    _ = &mut shutdown_rx => {
                        debug!("Leadership watch task for {} shutting down", shared.local);
                        break;
                    }
                }
            }
        })
    }

    fn spawn_reconcile_task(&self, mut shutdown_rx: oneshot::Receiver<()>) -> JoinHandle<()> {
        let shared = self.shared.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(shared.config.reconcile_interval);
            // The first tick completes immediately; start has just synced.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => shared.reconcile().await,
                    _ = &mut shutdown_rx => {
                        debug!("Leadership reconcile task for {} shutting down", shared.local);
                        break;
                    }
                }
            }
        })
    }

    fn spawn_purge_task(
        &self,
        mut departed_rx: mpsc::UnboundedReceiver<NodeId>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) -> JoinHandle<()> {
        let shared = self.shared.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    node = departed_rx.recv() => {
                        let Some(node) = node else {
                            break;
                        };
                        info!("Evicting departed node {} from all leadership races", node);
                        if let Err(e) = shared.evict(&node).await {
                            warn!("Failed to evict {}: {}", node, e);
                        }
                    }
                    _ = &mut shutdown_rx => {
                        debug!("Leadership purge task for {} shutting down", shared.local);
                        break;
                    }
                }
            }
        })
    }

    fn spawn_restart_task(
        &self,
        mut restart_rx: mpsc::UnboundedReceiver<u64>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) -> JoinHandle<()> {
        let shared = self.shared.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    version = restart_rx.recv() => {
                        let Some(version) = version else {
                            break;
                        };
                        info!(
                            "Cluster re-formed at metadata version {}, restarting leadership on {}",
                            version, shared.local
                        );
                        shared.restart().await;
                    }
                    _ = &mut shutdown_rx => {
                        debug!("Leadership restart task for {} shutting down", shared.local);
                        break;
                    }
                }
            }
        })
    }

    fn restart_listener(
        restart_tx: mpsc::UnboundedSender<u64>,
    ) -> EventListener<ClusterMetadataEvent> {
        Arc::new(move |event: &ClusterMetadataEvent| {
            if event.requires_restart() {
                let _ = restart_tx.send(event.version);
            }
        })
    }

    fn departure_listener(&self, departed_tx: mpsc::UnboundedSender<NodeId>) -> EventListener<ClusterEvent> {
        let local = self.shared.local.clone();
        let evict_inactive = self.shared.config.evict_inactive;

        Arc::new(move |event: &ClusterEvent| {
            let departed = match event.event_type {
                ClusterEventType::InstanceRemoved => true,
                ClusterEventType::InstanceDeactivated => evict_inactive,
                _ => false,
            };
            if departed && event.subject.id() != &local {
                let _ = departed_tx.send(event.subject.id().clone());
            }
        })
    }
}

#[async_trait]
impl<S: Store, Z: Serializer> LeadershipService for LeadershipManager<S, Z> {
    fn local_node_id(&self) -> &NodeId {
        &self.shared.local
    }

    fn get_leader(&self, topic: &str) -> Option<NodeId> {
        self.shared
            .board
            .read()
            .get(topic)
            .and_then(|record| record.value.leader.clone())
    }

    fn get_leadership(&self, topic: &str) -> Option<Leadership> {
        self.shared.leadership(topic)
    }

    fn get_candidates_for(&self, topic: &str) -> Vec<NodeId> {
        self.shared
            .board
            .read()
            .get(topic)
            .map(|record| record.value.candidates.clone())
            .unwrap_or_default()
    }

    fn get_candidates(&self) -> BTreeMap<String, Vec<NodeId>> {
        self.shared
            .board
            .read()
            .iter()
            .map(|(topic, record)| (topic.clone(), record.value.candidates.clone()))
            .collect()
    }

    fn get_leader_board(&self) -> BTreeMap<String, Leadership> {
        self.shared
            .board
            .read()
            .iter()
            .filter(|(_, record)| record.value.leader.is_some())
            .map(|(topic, record)| (topic.clone(), record.value.clone()))
            .collect()
    }

    fn owned_topics(&self, node: &NodeId) -> BTreeSet<String> {
        self.shared
            .board
            .read()
            .iter()
            .filter(|(_, record)| record.value.is_leader(node))
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    async fn run_for_leadership(&self, topic: &str) -> LeadershipResult<Leadership> {
        let shared = self.shared.clone();
        let topic = topic.to_string();

        spawn_operation(async move {
            debug!("Running for leadership of '{}'", topic);
            shared.active_topics.insert(topic.clone());
            shared
                .commit(&topic, |state, now| state.run(&shared.local, now))
                .await?;
            Ok(shared
                .leadership(&topic)
                .unwrap_or_else(|| Leadership::empty(topic.clone())))
        })
        .await
    }

    async fn withdraw(&self, topic: &str) -> LeadershipResult<()> {
        let shared = self.shared.clone();
        let topic = topic.to_string();

        spawn_operation(async move {
            debug!("Withdrawing from leadership of '{}'", topic);
            shared.active_topics.remove(&topic);
            shared
                .commit(&topic, |state, now| state.evict(&shared.local, now))
                .await?;
            Ok(())
        })
        .await
    }

    async fn stepdown(&self, topic: &str) -> LeadershipResult<bool> {
        let shared = self.shared.clone();
        let topic = topic.to_string();

        spawn_operation(async move {
            let stepped_down = shared
                .commit(&topic, |state, now| state.stepdown(&shared.local, now))
                .await?;
            info!(
                "Stepdown of {} from '{}': {}",
                shared.local, topic, stepped_down
            );
            Ok(stepped_down)
        })
        .await
    }

    fn add_listener(&self, listener: EventListener<LeadershipEvent>) -> ListenerId {
        self.shared.listeners.add_listener(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.listeners.remove_listener(id)
    }
}

#[async_trait]
impl<S: Store, Z: Serializer> LeadershipAdminService for LeadershipManager<S, Z> {
    async fn transfer_leadership(&self, topic: &str, node: &NodeId) -> LeadershipResult<bool> {
        let shared = self.shared.clone();
        let topic = topic.to_string();
        let node = node.clone();

        spawn_operation(async move {
            info!("Transferring leadership of '{}' to {}", topic, node);
            shared
                .commit(&topic, |state, now| state.transfer(&node, now))
                .await
        })
        .await
    }

    async fn make_top_candidate(&self, topic: &str, node: &NodeId) -> LeadershipResult<bool> {
        let shared = self.shared.clone();
        let topic = topic.to_string();
        let node = node.clone();

        spawn_operation(async move {
            info!("Promoting {} to top candidate of '{}'", node, topic);
            shared
                .commit(&topic, |state, now| state.promote(&node, now))
                .await
        })
        .await
    }

    async fn demote(&self, topic: &str, node: &NodeId) -> LeadershipResult<bool> {
        let shared = self.shared.clone();
        let topic = topic.to_string();
        let node = node.clone();

        spawn_operation(async move {
            info!("Demoting {} in '{}'", node, topic);
            shared
                .commit(&topic, |state, _| state.demote(&node))
                .await
        })
        .await
    }

    async fn unregister(&self, node: &NodeId) -> LeadershipResult<()> {
        let shared = self.shared.clone();
        let node = node.clone();

        spawn_operation(async move {
            info!("Unregistering {} from all leadership races", node);
            shared.evict(&node).await
        })
        .await
    }
}

#[async_trait]
impl<S: Store, Z: Serializer> Bootable for LeadershipManager<S, Z> {
    fn name(&self) -> &str {
        "LeadershipManager"
    }

    async fn start(&self) -> Result<(), BootError> {
        let mut state = self.bootable_state.lock().await;
        if !state.tasks.is_empty() {
            debug!("LeadershipManager already started");
            return Ok(());
        }

        info!("Starting LeadershipManager for node {}", self.shared.local);

        // Watch before the initial read so no commit slips between the two.
        let (watch_tx, watch_rx) = oneshot::channel();
        let watch_task = self.spawn_watch_task(watch_rx);

        // Records committed before start are history, not news.
        if let Err(e) = self.shared.resync(false).await {
            watch_task.abort();
            return Err(e.into());
        }

        let (departed_tx, departed_rx) = mpsc::unbounded_channel();
        state.cluster_listener = Some(
            self.cluster
                .add_listener(self.departure_listener(departed_tx)),
        );

        let (purge_tx, purge_rx) = oneshot::channel();
        let purge_task = self.spawn_purge_task(departed_rx, purge_rx);

        let (reconcile_tx, reconcile_rx) = oneshot::channel();
        let reconcile_task = self.spawn_reconcile_task(reconcile_rx);

        let (restart_events_tx, restart_events_rx) = mpsc::unbounded_channel();
        state.metadata_listener = Some(
            self.cluster
                .add_metadata_listener(Self::restart_listener(restart_events_tx)),
        );

        let (restart_tx, restart_rx) = oneshot::channel();
        let restart_task = self.spawn_restart_task(restart_events_rx, restart_rx);

        state.tasks = vec![watch_task, purge_task, reconcile_task, restart_task];
        state.shutdown_signals = vec![watch_tx, purge_tx, reconcile_tx, restart_tx];

        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BootError> {
        info!("Shutting down LeadershipManager for node {}", self.shared.local);

        if self.shared.config.withdraw_on_shutdown {
            let topics: Vec<String> = self
                .shared
                .active_topics
                .iter()
                .map(|topic| topic.key().clone())
                .collect();
            for topic in topics {
                if let Err(e) = self.withdraw(&topic).await {
                    warn!("Failed to withdraw from '{}' on shutdown: {}", topic, e);
                }
            }
        }

        let mut state = self.bootable_state.lock().await;
        if let Some(id) = state.cluster_listener.take() {
            self.cluster.remove_listener(id);
        }
        if let Some(id) = state.metadata_listener.take() {
            self.cluster.remove_metadata_listener(id);
        }

        for signal in state.shutdown_signals.drain(..) {
            let _ = signal.send(());
        }

        for task in state.tasks.drain(..) {
            match tokio::time::timeout(Duration::from_secs(5), task).await {
                Ok(Ok(())) => debug!("LeadershipManager task shut down cleanly"),
                Ok(Err(e)) => error!("LeadershipManager task panicked: {}", e),
                Err(_) => error!("LeadershipManager task did not shut down within timeout"),
            }
        }

        info!("LeadershipManager shutdown complete");
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
