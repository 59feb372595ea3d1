//! Node directory configuration and cluster definition files

use std::collections::BTreeSet;
use std::fs::File;
use std::io::Read;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use concord_identifiers::{NodeId, PartitionId};
use semver::Version;
use serde::Deserialize;

use crate::error::{ClusterError, ClusterResult};
use crate::metadata::ClusterMetadata;
use crate::node::{ControllerNode, DEFAULT_PORT};
use crate::partition::{Partition, default_partitions};

/// Default interval between heartbeats
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);

/// Default silence after which a peer is considered inactive
const DEFAULT_FAILURE_TIMEOUT: Duration = Duration::from_secs(3);

/// Default number of members per partition
pub const DEFAULT_PARTITION_SIZE: usize = 3;

/// Provider id recorded in metadata loaded from a definition file
pub const FILE_PROVIDER_ID: &str = "file";

/// Configuration for the cluster manager
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    /// Interval at which heartbeats are sent to peers
    pub heartbeat_interval: Duration,
    /// Silence after which a peer is marked inactive
    pub failure_timeout: Duration,
    /// Members per partition when forming a cluster without an explicit size
    pub default_partition_size: usize,
    /// Software version advertised to peers
    pub version: Version,
    /// Metadata written on first start when none is stored yet
    pub bootstrap: Option<ClusterMetadata>,
    /// Attempts made by metadata read-modify-write operations
    pub metadata_retry_attempts: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            failure_timeout: DEFAULT_FAILURE_TIMEOUT,
            default_partition_size: DEFAULT_PARTITION_SIZE,
            version: Version::new(0, 1, 0),
            bootstrap: None,
            metadata_retry_attempts: 8,
        }
    }
}

/// A node entry in a definition file
#[derive(Clone, Debug, Deserialize)]
pub struct NodeDefinition {
    /// Node id
    pub id: NodeId,
    /// Node address
    pub ip: IpAddr,
    /// Cluster port, [`DEFAULT_PORT`] when omitted
    #[serde(default)]
    pub port: Option<u16>,
}

/// A partition entry in a definition file
#[derive(Clone, Debug, Deserialize)]
pub struct PartitionDefinition {
    /// Partition id
    pub id: u32,
    /// Nominal members
    pub members: Vec<NodeId>,
}

/// JSON description of a cluster used to seed the metadata store
///
/// ```json
/// {
///   "name": "default",
///   "nodes": [{ "id": "n1", "ip": "10.0.0.1" }],
///   "partitions": [{ "id": 0, "members": ["n1"] }]
/// }
/// ```
///
/// When `partitions` is omitted the default layout is generated with
/// `partition_size` members per partition.
#[derive(Clone, Debug, Deserialize)]
pub struct ClusterDefinition {
    /// Cluster name
    pub name: String,
    /// Cluster nodes
    pub nodes: Vec<NodeDefinition>,
    /// Explicit partition layout
    #[serde(default)]
    pub partitions: Option<Vec<PartitionDefinition>>,
    /// Members per generated partition
    #[serde(default)]
    pub partition_size: Option<usize>,
}

impl ClusterDefinition {
    /// Load a definition from a JSON file
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ClusterResult<Self> {
        let mut file = File::open(path).map_err(|e| {
            ClusterError::Configuration(format!("Failed to open cluster definition: {e}"))
        })?;

        let mut content = String::new();
        file.read_to_string(&mut content).map_err(|e| {
            ClusterError::Configuration(format!("Failed to read cluster definition: {e}"))
        })?;

        Self::from_json(&content)
    }

    /// Parse a definition from JSON text
    ///
    /// # Errors
    ///
    /// Fails if the text is not a valid definition.
    pub fn from_json(content: &str) -> ClusterResult<Self> {
        serde_json::from_str(content).map_err(|e| {
            ClusterError::Configuration(format!("Failed to parse cluster definition: {e}"))
        })
    }

    /// Convert into validated metadata
    ///
    /// # Errors
    ///
    /// Fails if the definition has no nodes or a partition names an unknown
    /// node.
    pub fn into_metadata(self) -> ClusterResult<ClusterMetadata> {
        if self.nodes.is_empty() {
            return Err(ClusterError::EmptyCluster);
        }

        let nodes: Vec<ControllerNode> = self
            .nodes
            .into_iter()
            .map(|n| ControllerNode::new(n.id, n.ip, n.port.unwrap_or(DEFAULT_PORT)))
            .collect();

        let partitions = match self.partitions {
            Some(partitions) => partitions
                .into_iter()
                .map(|p| Partition::new(PartitionId::new(p.id), p.members))
                .collect(),
            None => {
                let ids: BTreeSet<NodeId> = nodes.iter().map(|n| n.id().clone()).collect();
                default_partitions(&ids, self.partition_size.unwrap_or(DEFAULT_PARTITION_SIZE))
            }
        };

        ClusterMetadata::builder(FILE_PROVIDER_ID, self.name)
            .nodes(nodes)
            .partitions(partitions)
            .build()
    }
}
