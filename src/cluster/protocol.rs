//! Cluster Administration Protocol
//!
//! Endpoints and DTOs for the admin tooling: health, topology, permissions,
//! boot, and shutdown.

use crate::membership::types::{NodeId, Permissions};
use serde::{Deserialize, Serialize};

pub const ENDPOINT_PING: &str = "/cluster/ping";
pub const ENDPOINT_INFO: &str = "/cluster/info";
pub const ENDPOINT_PERF: &str = "/cluster/perf";
pub const ENDPOINT_NODES: &str = "/cluster/nodes";
pub const ENDPOINT_MASTERS: &str = "/cluster/masters";
pub const ENDPOINT_DEPLOYMENT: &str = "/cluster/deployment";
pub const ENDPOINT_ATTACH: &str = "/cluster/attach";
pub const ENDPOINT_DETACH: &str = "/cluster/detach";
pub const ENDPOINT_PERMISSIONS: &str = "/cluster/permissions";
pub const ENDPOINT_BOOT: &str = "/cluster/boot";
pub const ENDPOINT_SHUTDOWN: &str = "/cluster/shutdown";
pub const ENDPOINT_SHUTDOWN_SYNC: &str = "/cluster/shutdown_sync";
pub const ENDPOINT_LOG_DUMP: &str = "/cluster/logdump";

#[derive(Debug, Serialize, Deserialize)]
pub struct PingResponse {
    pub deployment_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DetachRequest {
    pub node_id: NodeId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetPermissionsRequest {
    pub node_id: NodeId,
    pub permissions: Permissions,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AdminAck {
    pub ok: bool,
}
