//! Per-topic leader election
//!
//! Nodes contend for named topics; the head of each topic's candidate list
//! leads it. Election records live in a versioned store and are only ever
//! changed by compare-and-swap, so every node converges on the same leader
//! and terms are never reused.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod config;
pub mod election;
pub mod error;
pub mod event;
pub mod leadership;
pub mod manager;
pub mod service;
pub mod store;

pub use config::LeadershipConfig;
pub use election::ElectionState;
pub use error::{LeadershipError, LeadershipResult};
pub use event::{LeadershipEvent, LeadershipEventType, derive_events};
pub use leadership::{Leader, Leadership, RoleInfo};
pub use manager::LeadershipManager;
pub use service::{LeadershipAdminService, LeadershipService};
pub use store::{Committed, LeadershipStore, RECORD_PREFIX};
