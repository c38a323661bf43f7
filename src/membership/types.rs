use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Instant;

/// Unique identifier for a node in the cluster.
/// Wrapper around a UUID string to ensure global uniqueness across restarts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    /// Generates a new random UUID v4-based NodeId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Role a node plays in the control plane.
///
/// Exactly one `Master` is active at a time; `Alt` nodes are hot standbys
/// that also hold task-log replicas. `Slave` nodes execute tasks. `Idle`
/// nodes are attached but not yet assigned a role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeType {
    Master,
    Alt,
    Slave,
    Idle,
}

/// Bit-set of what a node is allowed to do.
///
/// `SLAVE` gates task execution, `MASTER` gates hosting process and task
/// managers. A node with `NONE` is excluded from worker selection entirely.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Permissions(pub u8);

impl Permissions {
    pub const NONE: Permissions = Permissions(0);
    pub const SLAVE: Permissions = Permissions(1);
    pub const MASTER: Permissions = Permissions(2);
    pub const ALL: Permissions = Permissions(3);

    /// True when every bit of `required` is present in `self`.
    pub fn allows(self, required: Permissions) -> bool {
        self.0 & required.0 == required.0
    }
}

/// Represents the lifecycle state of a node from the perspective of the local failure detector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NodeState {
    /// The node is healthy and responsive.
    Alive,
    /// The node has missed the heartbeat window and is suspected to be down.
    /// It can transition back to `Alive` if it refutes the suspicion, or to `Dead` if it times out.
    Suspect,
    /// The node is confirmed failed and is effectively removed from the cluster view.
    Dead,
}

/// Represents a single member in the cluster.
///
/// Contains identity, network addressing, role, and current lifecycle state.
/// The `incarnation` field is a logical clock used to order updates and
/// resolve conflicts (e.g., refuting a false "Suspect" claim).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique ID of the node.
    pub id: NodeId,
    /// UDP address used for the gossip protocol.
    pub gossip_addr: SocketAddr,
    /// TCP address used for the HTTP API (task dispatch, replication, admin).
    pub http_addr: SocketAddr,
    /// Control-plane role.
    pub node_type: NodeType,
    /// What this node may be asked to do.
    pub permissions: Permissions,
    /// Current health state (Alive/Suspect/Dead).
    pub state: NodeState,
    /// Logical clock for versioning the node's state. Higher numbers take precedence.
    pub incarnation: u64,

    /// Local timestamp of when this node was last heard from.
    /// Not serialized over the network; used only by the local failure detector.
    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

/// The wire protocol for inter-node communication via UDP.
///
/// Implements the messages required for the SWIM-style membership protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    /// A direct health check sent to a peer.
    /// Also carries the sender's current incarnation number for state dissemination.
    Ping { from: NodeId, incarnation: u64 },

    /// Response to a Ping, confirming the target is alive.
    /// Carries the sender's membership view to speed up convergence; role and
    /// permission changes disseminate through this piggyback.
    Ack {
        from: NodeId,
        incarnation: u64,
        members: Vec<Node>,
    },

    /// Request sent by a new node to a seed node to enter the cluster.
    Join { node: Node },

    /// Message broadcasting that a specific node is suspected to be dead.
    /// This triggers the "Suspect" state transition on receiving nodes.
    Suspect { node_id: NodeId, incarnation: u64 },

    /// Message broadcasting that a node is alive.
    /// Often used to refute a "Suspect" message (Self-Defense).
    Alive { node_id: NodeId, incarnation: u64 },
}
