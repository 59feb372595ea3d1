//! Elections between managers sharing one in-memory store

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use concord_bootable::Bootable;
use concord_cluster::{
    ClusterEvent, ClusterEventType, ClusterMetadata, ClusterMetadataEvent, ClusterService,
    ControllerNode, EventListener, ListenerId, ListenerRegistry, NodeId, NodeState, Partition,
    PartitionId,
};
use concord_leadership::{
    LeadershipAdminService, LeadershipConfig, LeadershipError, LeadershipEvent,
    LeadershipEventType, LeadershipManager, LeadershipService, RECORD_PREFIX, RoleInfo,
};
use concord_store::{Store, Store1};
use concord_store_memory::MemoryStore;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use semver::Version;

fn id(name: &str) -> NodeId {
    NodeId::new(name).unwrap()
}

fn node(name: &str) -> ControllerNode {
    ControllerNode::with_default_port(id(name), IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Directory of a single node whose events are driven by the test.
struct ScriptedCluster {
    local: ControllerNode,
    listeners: ListenerRegistry<ClusterEvent>,
    metadata_listeners: ListenerRegistry<ClusterMetadataEvent>,
}

impl ScriptedCluster {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            local: node(name),
            listeners: ListenerRegistry::new(),
            metadata_listeners: ListenerRegistry::new(),
        })
    }

    fn emit(&self, event_type: ClusterEventType, name: &str) {
        self.listeners
            .publish(&ClusterEvent::new(event_type, node(name)));
    }

    /// Replace a one-partition definition of `old` members with one of `new`.
    fn reform(&self, old: &[&str], new: &[&str], version: u64) {
        let definition = |names: &[&str]| {
            ClusterMetadata::new(
                "test",
                "lab",
                names.iter().map(|name| node(name)),
                [Partition::new(
                    PartitionId::new(0),
                    names.iter().map(|name| id(name)),
                )],
            )
        };
        self.metadata_listeners.publish(&ClusterMetadataEvent {
            old: Some(definition(old)),
            new: definition(new),
            version,
        });
    }
}

impl ClusterService for ScriptedCluster {
    fn get_local_node(&self) -> ControllerNode {
        self.local.clone()
    }

    fn get_nodes(&self) -> Vec<ControllerNode> {
        vec![self.local.clone()]
    }

    fn get_node(&self, id: &NodeId) -> Option<ControllerNode> {
        (id == self.local.id()).then(|| self.local.clone())
    }

    fn get_state(&self, id: &NodeId) -> Option<NodeState> {
        (id == self.local.id()).then_some(NodeState::Active)
    }

    fn get_last_updated(&self, _id: &NodeId) -> Option<DateTime<Utc>> {
        None
    }

    fn get_version(&self, _id: &NodeId) -> Option<Version> {
        None
    }

    fn add_listener(&self, listener: EventListener<ClusterEvent>) -> ListenerId {
        self.listeners.add_listener(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove_listener(id)
    }

    fn add_metadata_listener(&self, listener: EventListener<ClusterMetadataEvent>) -> ListenerId {
        self.metadata_listeners.add_listener(listener)
    }

    fn remove_metadata_listener(&self, id: ListenerId) -> bool {
        self.metadata_listeners.remove_listener(id)
    }
}

type Manager = LeadershipManager<<MemoryStore as Store1>::Scoped>;

struct Member {
    cluster: Arc<ScriptedCluster>,
    manager: Arc<Manager>,
    events: Arc<Mutex<Vec<LeadershipEvent>>>,
}

async fn member(store: &MemoryStore, name: &str, config: LeadershipConfig) -> Member {
    let cluster = ScriptedCluster::new(name);
    let manager = Arc::new(LeadershipManager::new(
        cluster.clone(),
        store.scope("leadership"),
        config,
    ));

    let events: Arc<Mutex<Vec<LeadershipEvent>>> = Arc::default();
    let sink = events.clone();
    manager.add_listener(Arc::new(move |event: &LeadershipEvent| {
        sink.lock().push(event.clone());
    }));

    manager.start().await.unwrap();
    Member {
        cluster,
        manager,
        events,
    }
}

fn config() -> LeadershipConfig {
    LeadershipConfig {
        retry_backoff_max: Duration::from_millis(10),
        reconcile_interval: Duration::from_millis(50),
        ..LeadershipConfig::default()
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_stepdown_hands_over_with_new_epoch() {
    let _ = tracing_subscriber::fmt::try_init();

    let store = MemoryStore::new();
    let a = member(&store, "a", config()).await;
    let b = member(&store, "b", config()).await;

    let leadership = a.manager.run_for_leadership("device:1").await.unwrap();
    assert_eq!(leadership.leader, Some(id("a")));
    assert_eq!(leadership.epoch, 1);

    let leadership = b.manager.run_for_leadership("device:1").await.unwrap();
    assert_eq!(leadership.leader, Some(id("a")));
    assert_eq!(leadership.candidates, vec![id("a"), id("b")]);
    assert_eq!(leadership.epoch, 1);

    assert!(!b.manager.stepdown("device:1").await.unwrap());
    assert!(a.manager.stepdown("device:1").await.unwrap());

    let leadership = a.manager.get_leadership("device:1").unwrap();
    assert_eq!(leadership.leader, Some(id("b")));
    assert_eq!(leadership.candidates, vec![id("b"), id("a")]);
    assert_eq!(leadership.epoch, 2);

    // The other node follows through the store.
    wait_until(|| b.manager.get_leader("device:1") == Some(id("b"))).await;
    assert_eq!(
        b.manager.owned_topics(&id("b")),
        BTreeSet::from(["device:1".to_string()])
    );
    assert!(b.manager.owned_topics(&id("a")).is_empty());

    let role = RoleInfo::from(&b.manager.get_leadership("device:1").unwrap());
    assert_eq!(role.master, Some(id("b")));
    assert_eq!(role.backups, vec![id("a")]);

    a.manager.shutdown().await.unwrap();
    b.manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_sole_candidate_stepdown_is_reelected() {
    let store = MemoryStore::new();
    let a = member(&store, "a", config()).await;

    a.manager.run_for_leadership("t").await.unwrap();
    assert!(!a.manager.stepdown("t").await.unwrap());

    let leadership = a.manager.get_leadership("t").unwrap();
    assert_eq!(leadership.leader, Some(id("a")));
    assert_eq!(leadership.epoch, 2);
    assert!(a
        .events
        .lock()
        .iter()
        .any(|e| e.event_type == LeadershipEventType::LeaderReelected));

    a.manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_admin_reordering() {
    let store = MemoryStore::new();
    let a = member(&store, "a", config()).await;
    let b = member(&store, "b", config()).await;
    let c = member(&store, "c", config()).await;

    for m in [&a, &b, &c] {
        m.manager.run_for_leadership("t").await.unwrap();
    }

    wait_until(|| a.manager.get_candidates_for("t").len() == 3).await;

    // Demoting the leader is refused and changes nothing.
    let before = a.manager.get_leadership("t").unwrap();
    assert!(!a.manager.demote("t", &id("a")).await.unwrap());
    assert_eq!(a.manager.get_leadership("t").unwrap(), before);

    assert!(a.manager.demote("t", &id("b")).await.unwrap());
    assert_eq!(a.manager.get_candidates_for("t"), vec![id("a"), id("c"), id("b")]);

    assert!(!a.manager.make_top_candidate("t", &id("z")).await.unwrap());
    assert!(a.manager.promote_to_top_of_candidate_list("t", &id("b")).await.unwrap());
    let leadership = a.manager.get_leadership("t").unwrap();
    assert_eq!(leadership.leader, Some(id("b")));
    assert_eq!(leadership.epoch, 2);

    assert!(a.manager.transfer_leadership("t", &id("c")).await.unwrap());
    assert!(!a.manager.transfer_leadership("t", &id("z")).await.unwrap());
    assert_eq!(a.manager.get_leader("t"), Some(id("c")));
    assert_eq!(a.manager.get_leadership("t").unwrap().epoch, 3);

    for m in [a, b, c] {
        m.manager.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_unregister_boots_then_elects() {
    // No reconciliation, so the evicted node does not rejoin mid-test.
    let quiet = LeadershipConfig {
        reconcile_interval: Duration::from_secs(60),
        ..config()
    };
    let store = MemoryStore::new();
    let a = member(&store, "a", quiet.clone()).await;
    let b = member(&store, "b", quiet).await;

    a.manager.run_for_leadership("t1").await.unwrap();
    b.manager.run_for_leadership("t1").await.unwrap();
    b.manager.run_for_leadership("t2").await.unwrap();
    a.manager.run_for_leadership("t2").await.unwrap();
    wait_until(|| {
        b.manager.get_candidates_for("t1").len() == 2
            && b.manager.get_candidates_for("t2").len() == 2
    })
    .await;
    b.events.lock().clear();

    b.manager.unregister(&id("a")).await.unwrap();

    assert_eq!(b.manager.get_candidates_for("t1"), vec![id("b")]);
    assert_eq!(b.manager.get_candidates_for("t2"), vec![id("b")]);

    let t1: Vec<LeadershipEventType> = b
        .events
        .lock()
        .iter()
        .filter(|e| e.subject.topic == "t1")
        .map(|e| e.event_type)
        .collect();
    assert_eq!(
        t1[..2].to_vec(),
        vec![
            LeadershipEventType::LeaderBooted,
            LeadershipEventType::LeaderElected
        ]
    );

    let t2: Vec<LeadershipEventType> = b
        .events
        .lock()
        .iter()
        .filter(|e| e.subject.topic == "t2")
        .map(|e| e.event_type)
        .collect();
    assert_eq!(t2, vec![LeadershipEventType::CandidatesChanged]);

    let board = b.manager.get_leader_board();
    assert_eq!(board.len(), 2);
    assert!(board.values().all(|l| l.leader == Some(id("b"))));

    a.manager.shutdown().await.unwrap();
    b.manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unregister_continues_past_unreadable_record() {
    let quiet = LeadershipConfig {
        reconcile_interval: Duration::from_secs(60),
        ..config()
    };
    let store = MemoryStore::new();
    let a = member(&store, "a", quiet.clone()).await;
    let b = member(&store, "b", quiet).await;

    let topics: Vec<String> = (0..8).map(|i| format!("t{i}")).collect();
    for topic in &topics {
        a.manager.run_for_leadership(topic).await.unwrap();
    }
    store
        .scope("leadership")
        .put(format!("{RECORD_PREFIX}t3-corrupt"), Bytes::from_static(b"junk"))
        .await
        .unwrap();

    let result = b.manager.unregister(&id("a")).await;
    assert_matches!(result, Err(LeadershipError::Codec(_)));

    for topic in &topics {
        assert!(
            b.manager.get_candidates_for(topic).is_empty(),
            "a still contests {topic}"
        );
    }
    assert!(b.manager.owned_topics(&id("a")).is_empty());

    a.manager.shutdown().await.unwrap();
    b.manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_removed_node_is_purged() {
    let store = MemoryStore::new();
    let a = member(
        &store,
        "a",
        LeadershipConfig {
            withdraw_on_shutdown: false,
            ..config()
        },
    )
    .await;
    let b = member(&store, "b", config()).await;

    a.manager.run_for_leadership("t").await.unwrap();
    b.manager.run_for_leadership("t").await.unwrap();
    a.manager.shutdown().await.unwrap();

    // Deactivation alone is not enough by default.
    b.cluster.emit(ClusterEventType::InstanceDeactivated, "a");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(b.manager.get_leader("t"), Some(id("a")));

    b.cluster.emit(ClusterEventType::InstanceRemoved, "a");
    wait_until(|| b.manager.get_leader("t") == Some(id("b"))).await;
    assert_eq!(b.manager.get_leadership("t").unwrap().epoch, 2);

    b.manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_evicted_candidate_rejoins_active_topic() {
    let store = MemoryStore::new();
    let a = member(&store, "a", config()).await;
    let b = member(&store, "b", config()).await;

    a.manager.run_for_leadership("t").await.unwrap();
    b.manager.run_for_leadership("t").await.unwrap();

    // An operator wrongly evicts a live node.
    b.manager.unregister(&id("a")).await.unwrap();
    assert_eq!(b.manager.get_candidates_for("t"), vec![id("b")]);

    wait_until(|| b.manager.get_candidates_for("t") == vec![id("b"), id("a")]).await;

    // Withdrawn topics are not rejoined.
    a.manager.withdraw("t").await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(b.manager.get_candidates_for("t"), vec![id("b")]);

    a.manager.shutdown().await.unwrap();
    b.manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_epochs_survive_total_withdrawal() {
    let store = MemoryStore::new();
    let a = member(&store, "a", config()).await;

    a.manager.run_for_leadership("t").await.unwrap();
    a.manager.withdraw("t").await.unwrap();

    let leadership = a.manager.get_leadership("t").unwrap();
    assert_eq!(leadership.leader, None);
    assert!(a.manager.get_leader_board().is_empty());
    assert_eq!(a.manager.get_candidates().get("t"), Some(&Vec::new()));
    a.manager.shutdown().await.unwrap();

    // A fresh manager over the same store continues the term sequence.
    let restarted = member(&store, "a", config()).await;
    let leadership = restarted.manager.run_for_leadership("t").await.unwrap();
    assert_eq!(leadership.epoch, 2);
    restarted.manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_abandoned_run_still_commits() {
    let store = MemoryStore::new();
    let a = member(&store, "a", config()).await;

    // Polled once, then dropped by the elapsed timeout.
    let _ = tokio::time::timeout(Duration::ZERO, a.manager.run_for_leadership("t")).await;

    wait_until(|| a.manager.get_leader("t") == Some(id("a"))).await;
    assert_eq!(a.manager.get_candidates_for("t"), vec![id("a")]);

    a.manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_withdraws_from_contested_topics() {
    let store = MemoryStore::new();
    let a = member(&store, "a", config()).await;
    let b = member(&store, "b", config()).await;

    a.manager.run_for_leadership("t").await.unwrap();
    b.manager.run_for_leadership("t").await.unwrap();

    a.manager.shutdown().await.unwrap();
    wait_until(|| b.manager.get_leader("t") == Some(id("b"))).await;

    b.manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reformed_cluster_restarts_elections() {
    let quiet = LeadershipConfig {
        reconcile_interval: Duration::from_secs(60),
        ..config()
    };
    let store = MemoryStore::new();
    let a = member(&store, "a", quiet.clone()).await;
    let b = member(&store, "b", quiet).await;

    a.manager.run_for_leadership("t").await.unwrap();
    b.manager.unregister(&id("a")).await.unwrap();
    wait_until(|| a.manager.get_candidates_for("t").is_empty()).await;

    // Same partition layout: nothing to restart.
    a.cluster.reform(&["a", "b"], &["a", "b"], 2);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(a.manager.get_candidates_for("t").is_empty());

    a.cluster.reform(&["a", "b"], &["a", "b", "c"], 3);
    wait_until(|| a.manager.get_leader("t") == Some(id("a"))).await;
    assert_eq!(a.manager.get_leadership("t").unwrap().epoch, 2);

    a.manager.shutdown().await.unwrap();
    b.manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_started_manager_reports_no_past_elections() {
    let store = MemoryStore::new();
    let a = member(&store, "a", config()).await;
    a.manager.run_for_leadership("t").await.unwrap();

    let b = member(&store, "b", config()).await;
    assert_eq!(b.manager.get_leader("t"), Some(id("a")));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(b.events.lock().is_empty());

    // Later commits are reported as usual.
    a.manager.withdraw("t").await.unwrap();
    wait_until(|| {
        b.events
            .lock()
            .iter()
            .any(|e| e.event_type == LeadershipEventType::LeaderBooted)
    })
    .await;

    a.manager.shutdown().await.unwrap();
    b.manager.shutdown().await.unwrap();
}
