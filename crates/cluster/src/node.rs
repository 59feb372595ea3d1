//! Controller nodes and their liveness states

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

use concord_identifiers::NodeId;
use serde::{Deserialize, Serialize};

/// Default TCP port for cluster communication.
pub const DEFAULT_PORT: u16 = 9876;

/// A controller process participating in the cluster.
///
/// Identity is the node id alone: two descriptors with the same id and
/// different addresses are the same node at different points in time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ControllerNode {
    id: NodeId,
    ip: IpAddr,
    #[serde(default = "default_port")]
    tcp_port: u16,
}

const fn default_port() -> u16 {
    DEFAULT_PORT
}

impl ControllerNode {
    /// Create a node descriptor.
    #[must_use]
    pub const fn new(id: NodeId, ip: IpAddr, tcp_port: u16) -> Self {
        Self { id, ip, tcp_port }
    }

    /// Create a node descriptor on [`DEFAULT_PORT`].
    #[must_use]
    pub const fn with_default_port(id: NodeId, ip: IpAddr) -> Self {
        Self::new(id, ip, DEFAULT_PORT)
    }

    /// The node id.
    #[must_use]
    pub const fn id(&self) -> &NodeId {
        &self.id
    }

    /// The node's IP address.
    #[must_use]
    pub const fn ip(&self) -> IpAddr {
        self.ip
    }

    /// The node's cluster port.
    #[must_use]
    pub const fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    /// The node's cluster socket address.
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp_port)
    }

    /// Whether both descriptors agree on identity and address.
    #[must_use]
    pub fn same_endpoint(&self, other: &Self) -> bool {
        self.id == other.id && self.ip == other.ip && self.tcp_port == other.tcp_port
    }
}

impl PartialEq for ControllerNode {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ControllerNode {}

impl Hash for ControllerNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for ControllerNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ControllerNode {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl fmt::Display for ControllerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.socket_addr())
    }
}

/// Liveness of a node as seen by the local directory.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum NodeState {
    /// Not heard from within the failure timeout.
    Inactive,

    /// Reachable, still starting up.
    Active,

    /// Reachable and fully started.
    Ready,
}

impl NodeState {
    /// Whether the node is reachable.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Active | Self::Ready)
    }

    /// Whether the node has finished starting.
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Inactive => "INACTIVE",
            Self::Active => "ACTIVE",
            Self::Ready => "READY",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;

    #[test]
    fn test_identity_ignores_address() {
        let id = NodeId::new("n1").unwrap();
        let a = ControllerNode::new(id.clone(), IpAddr::V4(Ipv4Addr::LOCALHOST), 1000);
        let b = ControllerNode::new(id, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 2000);

        assert_eq!(a, b);
        assert!(!a.same_endpoint(&b));

        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_port_defaults_when_missing() {
        let node: ControllerNode =
            serde_json::from_str(r#"{"id":"n1","ip":"127.0.0.1"}"#).unwrap();
        assert_eq!(node.tcp_port(), DEFAULT_PORT);
    }

    #[test]
    fn test_state_predicates() {
        assert!(!NodeState::Inactive.is_active());
        assert!(NodeState::Active.is_active());
        assert!(NodeState::Ready.is_active());
        assert!(NodeState::Ready.is_ready());
        assert!(!NodeState::Active.is_ready());
    }
}
