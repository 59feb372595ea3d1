//! Leadership change notifications

use chrono::{DateTime, Utc};

use crate::leadership::Leadership;

/// Kinds of leadership change.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum LeadershipEventType {
    /// A node took over the topic
    LeaderElected,
    /// An election ran and kept the same leader under a new term
    LeaderReelected,
    /// The leader lost the topic; the subject carries its last term
    LeaderBooted,
    /// The candidate list changed; the leader field is not authoritative
    CandidatesChanged,
}

/// A leadership change of one topic.
#[derive(Clone, Debug)]
pub struct LeadershipEvent {
    /// Kind of change
    pub event_type: LeadershipEventType,
    /// Leadership the event refers to
    pub subject: Leadership,
    /// Local time the change was observed
    pub time: DateTime<Utc>,
}

impl LeadershipEvent {
    /// Create an event observed now.
    #[must_use]
    pub fn new(event_type: LeadershipEventType, subject: Leadership) -> Self {
        Self {
            event_type,
            subject,
            time: Utc::now(),
        }
    }
}

/// Events describing the move from `old` to `new`, in delivery order.
///
/// A booted leader is reported before its successor is elected.
#[must_use]
pub fn derive_events(old: &Leadership, new: &Leadership) -> Vec<LeadershipEvent> {
    let mut events = Vec::new();

    if old.leader == new.leader {
        if new.leader.is_some() && new.epoch > old.epoch {
            events.push(LeadershipEvent::new(
                LeadershipEventType::LeaderReelected,
                new.clone(),
            ));
        }
    } else {
        if old.leader.is_some() {
            events.push(LeadershipEvent::new(
                LeadershipEventType::LeaderBooted,
                old.clone(),
            ));
        }
        if new.leader.is_some() {
            events.push(LeadershipEvent::new(
                LeadershipEventType::LeaderElected,
                new.clone(),
            ));
        }
    }

    if old.candidates != new.candidates {
        events.push(LeadershipEvent::new(
            LeadershipEventType::CandidatesChanged,
            new.clone(),
        ));
    }

    events
}
