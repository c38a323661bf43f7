use crate::membership::types::Node;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Boot-time cluster shape: which nodes participate and how aggressively
/// the control-plane state is replicated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Configuration {
    pub nodes: Vec<SocketAddr>,
    /// Replica acknowledgements required for a synchronous write.
    pub replication_factor: usize,
    /// Replica peers that may be lost before the log is considered corrupt.
    pub failover_factor: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDeploymentInfo {
    pub node: Node,
    pub deployment_id: String,
    pub booted: bool,
    pub failed: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceCounters {
    pub cpu_usage: f32,
    pub mem_used_mb: u64,
    pub mem_total_mb: u64,
}

/// One line of the admin-visible event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub at_ms: u64,
    pub message: String,
}
