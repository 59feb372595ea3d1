//! Leadership service interfaces

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use concord_cluster::{EventListener, ListenerId};
use concord_identifiers::NodeId;

use crate::error::LeadershipResult;
use crate::event::LeadershipEvent;
use crate::leadership::Leadership;

/// Leader election on behalf of the local node.
///
/// Reads are served from a local board that follows the store, so they may
/// briefly lag commits made by other nodes.
#[async_trait]
pub trait LeadershipService: Send + Sync + 'static {
    /// The node this service runs elections for.
    fn local_node_id(&self) -> &NodeId;

    /// Leader of `topic`.
    fn get_leader(&self, topic: &str) -> Option<NodeId>;

    /// Full leadership of `topic`, `None` if no record exists.
    fn get_leadership(&self, topic: &str) -> Option<Leadership>;

    /// Candidates of `topic` in succession order.
    fn get_candidates_for(&self, topic: &str) -> Vec<NodeId>;

    /// Candidates of every known topic.
    fn get_candidates(&self) -> BTreeMap<String, Vec<NodeId>>;

    /// Leadership of every topic that currently has a leader.
    fn get_leader_board(&self) -> BTreeMap<String, Leadership>;

    /// Topics led by `node`.
    fn owned_topics(&self, node: &NodeId) -> BTreeSet<String>;

    /// Enter the race for `topic`.
    ///
    /// Idempotent. Resolves once the candidacy is durably recorded, with the
    /// resulting leadership. Dropping the future does not abort a commit that
    /// already started.
    ///
    /// # Errors
    ///
    /// Fails if the commit could not be made.
    async fn run_for_leadership(&self, topic: &str) -> LeadershipResult<Leadership>;

    /// Leave the race for `topic`, handing leadership on if held.
    ///
    /// # Errors
    ///
    /// Fails if the commit could not be made.
    async fn withdraw(&self, topic: &str) -> LeadershipResult<()>;

    /// Give up leadership of `topic` while staying a candidate.
    ///
    /// Returns `false` if the local node does not lead the topic, or is its
    /// only candidate; in the latter case the election is rerun and keeps it
    /// in office under a new term.
    ///
    /// # Errors
    ///
    /// Fails if the commit could not be made.
    async fn stepdown(&self, topic: &str) -> LeadershipResult<bool>;

    /// Register a callback for leadership events.
    fn add_listener(&self, listener: EventListener<LeadershipEvent>) -> ListenerId;

    /// Unregister a callback. Returns whether it was registered.
    fn remove_listener(&self, id: ListenerId) -> bool;
}

/// Administrative control over elections of any node.
#[async_trait]
pub trait LeadershipAdminService: LeadershipService {
    /// Hand leadership of `topic` to `node`.
    ///
    /// Returns `false` if `node` is not a candidate.
    ///
    /// # Errors
    ///
    /// Fails if the commit could not be made.
    async fn transfer_leadership(&self, topic: &str, node: &NodeId) -> LeadershipResult<bool>;

    /// Move `node` to the head of the candidates of `topic`, which also makes
    /// it leader.
    ///
    /// Returns `false` if `node` is not a candidate.
    ///
    /// # Errors
    ///
    /// Fails if the commit could not be made.
    async fn make_top_candidate(&self, topic: &str, node: &NodeId) -> LeadershipResult<bool>;

    /// Alias of [`LeadershipAdminService::make_top_candidate`].
    ///
    /// # Errors
    ///
    /// Fails if the commit could not be made.
    async fn promote_to_top_of_candidate_list(
        &self,
        topic: &str,
        node: &NodeId,
    ) -> LeadershipResult<bool> {
        self.make_top_candidate(topic, node).await
    }

    /// Move `node` to the back of the candidates of `topic`.
    ///
    /// Returns `false` if `node` leads the topic or is not a candidate.
    ///
    /// # Errors
    ///
    /// Fails if the commit could not be made.
    async fn demote(&self, topic: &str, node: &NodeId) -> LeadershipResult<bool>;

    /// Remove `node` from every topic, electing successors where it led.
    ///
    /// # Errors
    ///
    /// Fails if any commit could not be made.
    async fn unregister(&self, node: &NodeId) -> LeadershipResult<()>;
}
