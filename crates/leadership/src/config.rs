//! Leadership manager configuration

use std::time::Duration;

/// Configuration for the leadership manager
#[derive(Clone, Debug)]
pub struct LeadershipConfig {
    /// Attempts made by an election commit before the conflict is surfaced
    pub retry_attempts: usize,
    /// Retries wait a random delay below this ceiling
    pub retry_backoff_max: Duration,
    /// Interval at which the local board is re-read from the store
    pub reconcile_interval: Duration,
    /// Also evict candidates whose node was marked inactive, not only removed
    pub evict_inactive: bool,
    /// Withdraw from every contested topic on shutdown
    pub withdraw_on_shutdown: bool,
}

impl Default for LeadershipConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 10,
            retry_backoff_max: Duration::from_millis(150),
            reconcile_interval: Duration::from_secs(2),
            evict_inactive: false,
            withdraw_on_shutdown: true,
        }
    }
}
