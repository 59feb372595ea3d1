//! Proxy configuration

use std::time::Duration;

/// Configuration for [`ProxyManager`](crate::ProxyManager)
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// How long a proxied call waits for its reply
    pub timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }
}
