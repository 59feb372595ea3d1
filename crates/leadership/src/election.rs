//! Per-topic election state machine
//!
//! An [`ElectionState`] is the persisted record of one topic. Every mutation
//! keeps the leader equal to the head of the candidate list and draws a fresh
//! term whenever leadership moves. The term counter lives in the record, which
//! is never deleted, so terms are not reused after every candidate withdraws.

use concord_identifiers::NodeId;
use serde::{Deserialize, Serialize};

/// Persisted election record of one topic.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ElectionState {
    candidates: Vec<NodeId>,
    leader: Option<NodeId>,
    term: u64,
    term_start_time: u64,
}

impl ElectionState {
    /// Candidates in succession order.
    #[must_use]
    pub fn candidates(&self) -> &[NodeId] {
        &self.candidates
    }

    /// Current leader.
    #[must_use]
    pub const fn leader(&self) -> Option<&NodeId> {
        self.leader.as_ref()
    }

    /// Term of the current or most recent leader.
    #[must_use]
    pub const fn term(&self) -> u64 {
        self.term
    }

    /// Start of the current term in milliseconds.
    #[must_use]
    pub const fn term_start_time(&self) -> u64 {
        self.term_start_time
    }

    /// Whether `node` is a candidate.
    #[must_use]
    pub fn is_candidate(&self, node: &NodeId) -> bool {
        self.candidates.contains(node)
    }

    fn is_leader(&self, node: &NodeId) -> bool {
        self.leader.as_ref() == Some(node)
    }

    fn new_term(&mut self, now: u64) {
        self.term += 1;
        self.term_start_time = now;
    }

    /// Make the head of the list the leader, opening a term if it changed.
    fn elect_head(&mut self, now: u64) {
        let head = self.candidates.first().cloned();
        if head.is_some() && head != self.leader {
            self.new_term(now);
        }
        self.leader = head;
    }

    /// Append `node` to the candidates. Returns `false` if it already runs.
    pub fn run(&mut self, node: &NodeId, now: u64) -> bool {
        if self.is_candidate(node) {
            return false;
        }
        self.candidates.push(node.clone());
        self.elect_head(now);
        true
    }

    /// Remove `node`, electing the next candidate if it led.
    pub fn evict(&mut self, node: &NodeId, now: u64) -> bool {
        let Some(position) = self.candidates.iter().position(|c| c == node) else {
            return false;
        };
        self.candidates.remove(position);
        self.elect_head(now);
        true
    }

    /// Move the leader `node` to the back of the list and elect the new head.
    ///
    /// A sole candidate cannot hand leadership over: the election is rerun,
    /// keeps it in office under a new term, and `false` is returned.
    pub fn stepdown(&mut self, node: &NodeId, now: u64) -> bool {
        if !self.is_leader(node) {
            return false;
        }
        if self.candidates.len() == 1 {
            self.new_term(now);
            return false;
        }
        self.candidates.rotate_left(1);
        self.elect_head(now);
        true
    }

    /// Reorder so `node` heads the list, making it leader. Returns `false` if
    /// it is not a candidate.
    pub fn promote(&mut self, node: &NodeId, now: u64) -> bool {
        let Some(position) = self.candidates.iter().position(|c| c == node) else {
            return false;
        };
        let promoted = self.candidates.remove(position);
        self.candidates.insert(0, promoted);
        self.elect_head(now);
        true
    }

    /// Hand leadership to `node`. Returns whether it leads afterwards.
    pub fn transfer(&mut self, node: &NodeId, now: u64) -> bool {
        self.promote(node, now) && self.is_leader(node)
    }

    /// Move `node` to the back of the list. Refused for the leader and for
    /// nodes that are not candidates.
    pub fn demote(&mut self, node: &NodeId) -> bool {
        if self.is_leader(node) {
            return false;
        }
        let Some(position) = self.candidates.iter().position(|c| c == node) else {
            return false;
        };
        let demoted = self.candidates.remove(position);
        self.candidates.push(demoted);
        true
    }
}
