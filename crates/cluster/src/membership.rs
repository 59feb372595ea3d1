//! Version-aware projection of the node directory
//!
//! During a rolling upgrade nodes running different software versions share
//! the cluster. This view groups them by version so components can restrict
//! themselves to peers running the same code as the local node.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};

use concord_identifiers::NodeId;
use parking_lot::RwLock;
use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::event::{ClusterEvent, ListenerId};
use crate::service::ClusterService;

/// A node together with the software version it runs.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Member {
    /// Node id
    pub node_id: NodeId,
    /// Advertised software version
    pub version: Version,
}

/// All members running one software version.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MembershipGroup {
    /// Shared version
    pub version: Version,
    /// Members running it
    pub members: BTreeSet<Member>,
}

/// Read-only membership queries.
pub trait MembershipService: Send + Sync + 'static {
    /// The local node as a member.
    fn get_local_member(&self) -> Member;

    /// Members running the local node's version.
    fn get_members(&self) -> BTreeSet<Member>;

    /// Members running `version`.
    fn get_members_for(&self, version: &Version) -> BTreeSet<Member>;

    /// One group per known version, ordered by version.
    fn get_groups(&self) -> Vec<MembershipGroup>;

    /// The group running `version`.
    fn get_group(&self, version: &Version) -> Option<MembershipGroup>;

    /// A member by node id.
    fn get_member(&self, id: &NodeId) -> Option<Member>;
}

#[derive(Debug)]
struct MembershipView {
    local: Member,
    groups: BTreeMap<Version, MembershipGroup>,
}

impl MembershipView {
    /// Nodes whose version is not yet known are left out until they
    /// advertise one.
    fn compute(cluster: &dyn ClusterService) -> Self {
        let local_id = cluster.get_local_node().id().clone();
        let local_version = cluster
            .get_version(&local_id)
            .unwrap_or_else(|| Version::new(0, 0, 0));

        let mut groups: BTreeMap<Version, MembershipGroup> = BTreeMap::new();
        for node in cluster.get_nodes() {
            let Some(version) = cluster.get_version(node.id()) else {
                continue;
            };
            groups
                .entry(version.clone())
                .or_insert_with(|| MembershipGroup {
                    version: version.clone(),
                    members: BTreeSet::new(),
                })
                .members
                .insert(Member {
                    node_id: node.id().clone(),
                    version,
                });
        }

        Self {
            local: Member {
                node_id: local_id,
                version: local_version,
            },
            groups,
        }
    }
}

/// Membership view kept current by a cluster listener.
pub struct MembershipManager {
    cluster: Arc<dyn ClusterService>,
    view: Arc<RwLock<MembershipView>>,
    listener_id: ListenerId,
}

impl MembershipManager {
    /// Build the view and start following cluster events.
    pub fn new(cluster: Arc<dyn ClusterService>) -> Self {
        let view = Arc::new(RwLock::new(MembershipView::compute(cluster.as_ref())));

        let weak_cluster: Weak<dyn ClusterService> = Arc::downgrade(&cluster);
        let weak_view = Arc::downgrade(&view);
        let listener_id = cluster.add_listener(Arc::new(move |event: &ClusterEvent| {
            if let (Some(cluster), Some(view)) = (weak_cluster.upgrade(), weak_view.upgrade()) {
                debug!(
                    "Recomputing membership after {:?} for {}",
                    event.event_type,
                    event.subject.id()
                );
                *view.write() = MembershipView::compute(cluster.as_ref());
            }
        }));

        Self {
            cluster,
            view,
            listener_id,
        }
    }

    /// Recompute the view immediately.
    pub fn refresh(&self) {
        *self.view.write() = MembershipView::compute(self.cluster.as_ref());
    }
}

impl Drop for MembershipManager {
    fn drop(&mut self) {
        self.cluster.remove_listener(self.listener_id);
    }
}

impl MembershipService for MembershipManager {
    fn get_local_member(&self) -> Member {
        self.view.read().local.clone()
    }

    fn get_members(&self) -> BTreeSet<Member> {
        let view = self.view.read();
        view.groups
            .get(&view.local.version)
            .map(|group| group.members.clone())
            .unwrap_or_default()
    }

    fn get_members_for(&self, version: &Version) -> BTreeSet<Member> {
        self.view
            .read()
            .groups
            .get(version)
            .map(|group| group.members.clone())
            .unwrap_or_default()
    }

    fn get_groups(&self) -> Vec<MembershipGroup> {
        self.view.read().groups.values().cloned().collect()
    }

    fn get_group(&self, version: &Version) -> Option<MembershipGroup> {
        self.view.read().groups.get(version).cloned()
    }

    fn get_member(&self, id: &NodeId) -> Option<Member> {
        self.view
            .read()
            .groups
            .values()
            .flat_map(|group| group.members.iter())
            .find(|member| &member.node_id == id)
            .cloned()
    }
}
