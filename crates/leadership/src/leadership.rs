//! Leadership snapshots

use concord_identifiers::NodeId;
use serde::{Deserialize, Serialize};

use crate::election::ElectionState;

/// The current term holder of a topic.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Leader {
    /// Node holding the term
    pub node_id: NodeId,
    /// Term number, unique per topic
    pub term: u64,
    /// Milliseconds since the Unix epoch at which the term began
    pub term_start_time: u64,
}

/// Immutable view of one topic's election.
///
/// When `leader` is present it is always `candidates[0]`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Leadership {
    /// Contention topic
    pub topic: String,
    /// Current leader
    pub leader: Option<NodeId>,
    /// Candidates in succession order
    pub candidates: Vec<NodeId>,
    /// Term of the current or most recent leader
    pub epoch: u64,
    /// Start of that term, milliseconds since the Unix epoch
    pub elected_time: u64,
}

impl Leadership {
    /// A topic nobody has contested yet.
    #[must_use]
    pub fn empty(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            leader: None,
            candidates: Vec::new(),
            epoch: 0,
            elected_time: 0,
        }
    }

    pub(crate) fn from_state(topic: impl Into<String>, state: &ElectionState) -> Self {
        Self {
            topic: topic.into(),
            leader: state.leader().cloned(),
            candidates: state.candidates().to_vec(),
            epoch: state.term(),
            elected_time: state.term_start_time(),
        }
    }

    /// Term details of the current leader.
    #[must_use]
    pub fn leader_info(&self) -> Option<Leader> {
        self.leader.as_ref().map(|node_id| Leader {
            node_id: node_id.clone(),
            term: self.epoch,
            term_start_time: self.elected_time,
        })
    }

    /// Whether `node` is contesting the topic.
    #[must_use]
    pub fn is_candidate(&self, node: &NodeId) -> bool {
        self.candidates.contains(node)
    }

    /// Whether `node` currently leads the topic.
    #[must_use]
    pub fn is_leader(&self, node: &NodeId) -> bool {
        self.leader.as_ref() == Some(node)
    }
}

/// Mastership projection of a [`Leadership`].
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct RoleInfo {
    /// The leader
    pub master: Option<NodeId>,
    /// Remaining candidates in succession order
    pub backups: Vec<NodeId>,
}

impl From<&Leadership> for RoleInfo {
    fn from(leadership: &Leadership) -> Self {
        Self {
            master: leadership.leader.clone(),
            backups: leadership
                .candidates
                .iter()
                .filter(|candidate| Some(*candidate) != leadership.leader.as_ref())
                .cloned()
                .collect(),
        }
    }
}
