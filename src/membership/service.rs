use anyhow::Result;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use std::{net::SocketAddr, time::Duration};
use tokio::net::UdpSocket;
use tokio::sync::{RwLock, broadcast};
use tracing::info;

use super::types::{GossipMessage, Node, NodeId, NodeState, NodeType, Permissions};

const GOSSIP_INTERVAL: Duration = Duration::from_millis(500);
const FAILURE_DETECTION_INTERVAL: Duration = Duration::from_secs(2);
const SUSPECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEAD_TIMEOUT: Duration = Duration::from_secs(10);

/// SWIM-style gossip membership.
///
/// Keeps the local view of the cluster, detects failures, and publishes a
/// `NodeId` on the failure channel whenever a member is declared dead. Task
/// managers and the worker pool subscribe to that channel to drive recovery.
pub struct MembershipService {
    pub local_node: Node,
    pub members: Arc<DashMap<NodeId, Node>>,
    socket: Arc<UdpSocket>,
    incarnation: Arc<RwLock<u64>>,
    failure_tx: broadcast::Sender<NodeId>,
}

impl MembershipService {
    pub async fn new(
        bind_addr: SocketAddr,
        http_addr: SocketAddr,
        node_type: NodeType,
        permissions: Permissions,
        seed_nodes: Vec<SocketAddr>,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let bound_addr = socket.local_addr()?;
        let incarnation_counter = Arc::new(RwLock::new(1));
        let current_inc = *incarnation_counter.read().await;
        let local_node = Node {
            id: NodeId::new(),
            gossip_addr: bound_addr,
            http_addr,
            node_type,
            permissions,
            state: NodeState::Alive,
            incarnation: current_inc,
            last_seen: Some(Instant::now()),
        };
        let members = Arc::new(DashMap::new());
        members.insert(local_node.id.clone(), local_node.clone());
        if !seed_nodes.is_empty() {
            info!("Joining cluster via {} seed node(s)", seed_nodes.len());

            for seed_node in seed_nodes.iter() {
                let msg = GossipMessage::Join {
                    node: local_node.clone(),
                };

                let encoded = bincode::serialize(&msg)?;
                socket.send_to(&encoded, seed_node).await?;
                info!("Sent join request to {}", seed_node);
            }
        }

        let (failure_tx, _) = broadcast::channel(64);

        Ok(Arc::new(Self {
            local_node,
            members,
            socket: Arc::new(socket),
            incarnation: incarnation_counter,
            failure_tx,
        }))
    }

    pub async fn start(self: Arc<Self>) {
        tracing::info!("Starting membership service...");

        let _gossip_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.gossip_loop().await;
            })
        };

        let _receive_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.receive_loop().await;
            })
        };

        let _failure_detection_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.failure_detection_loop().await;
            })
        };

        tracing::info!("All background tasks started");
    }

    /// Subscribe to dead-node notifications.
    pub fn subscribe_failures(&self) -> broadcast::Receiver<NodeId> {
        self.failure_tx.subscribe()
    }

    pub fn get_alive_members(&self) -> Vec<Node> {
        self.members
            .iter()
            .filter(|entry| entry.value().state == NodeState::Alive)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn get_member(&self, node_id: &NodeId) -> Option<Node> {
        self.members.get(node_id).map(|entry| entry.value().clone())
    }

    pub fn get_all_members(&self) -> Vec<Node> {
        self.members
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Overrides a member's permission bits. Disseminates through the ack
    /// piggyback on subsequent gossip rounds.
    pub fn set_permissions(&self, node_id: &NodeId, permissions: Permissions) -> bool {
        match self.members.get_mut(node_id) {
            Some(mut member) => {
                member.permissions = permissions;
                member.incarnation += 1;
                true
            }
            None => false,
        }
    }

    pub fn set_node_type(&self, node_id: &NodeId, node_type: NodeType) -> bool {
        match self.members.get_mut(node_id) {
            Some(mut member) => {
                member.node_type = node_type;
                member.incarnation += 1;
                true
            }
            None => false,
        }
    }

    /// Registers a node directly in the local view (admin attach). The node
    /// will be pinged on the next gossip round and confirm itself.
    pub fn register_node(&self, node: Node) {
        let mut node = node;
        node.last_seen = Some(Instant::now());
        self.members.insert(node.id.clone(), node);
    }

    /// Forcibly declares a member dead (admin detach or pool eviction).
    pub fn declare_dead(&self, node_id: &NodeId) {
        let mut was_alive = false;
        if let Some(mut member) = self.members.get_mut(node_id) {
            if member.state != NodeState::Dead {
                member.state = NodeState::Dead;
                was_alive = true;
            }
        }
        if was_alive {
            let _ = self.failure_tx.send(node_id.clone());
        }
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(GOSSIP_INTERVAL);

        loop {
            interval.tick().await;

            let alive_members: Vec<Node> = self
                .members
                .iter()
                .filter(|entry| {
                    entry.value().id != self.local_node.id
                        && entry.value().state == NodeState::Alive
                })
                .map(|entry| entry.value().clone())
                .collect();

            if alive_members.is_empty() {
                continue;
            }

            use rand::Rng;
            let idx = rand::thread_rng().gen_range(0..alive_members.len());
            let target = &alive_members[idx];

            let incarnation = *self.incarnation.read().await;
            let msg = GossipMessage::Ping {
                from: self.local_node.id.clone(),
                incarnation,
            };

            if let Ok(encoded) = bincode::serialize(&msg) {
                if let Err(e) = self.socket.send_to(&encoded, target.gossip_addr).await {
                    tracing::warn!("Failed to send ping to {:?}: {}", target.id, e);
                } else {
                    tracing::debug!("Sent ping to {:?}", target.id);
                }
            } else {
                tracing::error!("Failed to serialize GossipMessage::Ping");
            }
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => match bincode::deserialize::<GossipMessage>(&buf[..len]) {
                    Ok(msg) => {
                        if let Err(e) = self.handle_message(msg, src).await {
                            tracing::error!("Error handling message from {}: {}", src, e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to deserialize message from {}: {}", src, e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_message(&self, msg: GossipMessage, src: SocketAddr) -> Result<()> {
        match msg {
            GossipMessage::Ping { from, incarnation } => {
                self.handle_ping(from, incarnation, src).await?;
            }

            GossipMessage::Ack {
                from,
                incarnation,
                members,
            } => {
                self.handle_ack(from, incarnation, members).await?;
            }

            GossipMessage::Join { node } => {
                self.handle_join(node).await?;
            }

            GossipMessage::Suspect {
                node_id,
                incarnation,
            } => {
                self.handle_suspect(node_id, incarnation).await?;
            }

            GossipMessage::Alive {
                node_id,
                incarnation,
            } => {
                self.handle_alive(node_id, incarnation).await?;
            }
        }

        Ok(())
    }

    async fn handle_ping(&self, from: NodeId, from_incarnation: u64, src: SocketAddr) -> Result<()> {
        tracing::debug!("Received ping from {:?}", from);

        if let Some(mut member) = self.members.get_mut(&from) {
            member.last_seen = Some(Instant::now());

            if from_incarnation > member.incarnation {
                member.incarnation = from_incarnation;
            }
        } else {
            tracing::info!("Discovered new member via ping: {:?} at {}", from, src);

            // Role and permissions arrive with the next ack piggyback; until
            // then the node is treated as an idle bystander.
            let new_node = Node {
                id: from.clone(),
                gossip_addr: src,
                http_addr: src,
                node_type: NodeType::Idle,
                permissions: Permissions::NONE,
                state: NodeState::Alive,
                incarnation: from_incarnation,
                last_seen: Some(Instant::now()),
            };

            self.members.insert(new_node.id.clone(), new_node);
        }

        let all_members: Vec<Node> = self
            .members
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let my_incarnation = *self.incarnation.read().await;
        let reply = GossipMessage::Ack {
            from: self.local_node.id.clone(),
            incarnation: my_incarnation,
            members: all_members,
        };

        let encoded = bincode::serialize(&reply)?;
        self.socket.send_to(&encoded, src).await?;

        tracing::debug!("Sent ack to {:?} with {} members", from, self.members.len());

        Ok(())
    }

    async fn handle_ack(&self, from: NodeId, from_incarnation: u64, members: Vec<Node>) -> Result<()> {
        tracing::debug!(
            "Received ack from {:?} (inc={}) with {} members",
            from,
            from_incarnation,
            members.len()
        );

        if let Some(mut member) = self.members.get_mut(&from) {
            if from_incarnation > member.incarnation {
                member.incarnation = from_incarnation;
                member.last_seen = Some(Instant::now());
            }
        }

        for member in members {
            self.merge_member(member).await;
        }

        Ok(())
    }

    async fn merge_member(&self, new_member: Node) {
        if new_member.id == self.local_node.id {
            return;
        }

        let mut declared_dead = None;

        match self.members.get_mut(&new_member.id) {
            Some(mut existing) => {
                if new_member.incarnation > existing.incarnation {
                    tracing::debug!(
                        "Updating {:?}: inc {} -> {}",
                        new_member.id,
                        existing.incarnation,
                        new_member.incarnation,
                    );

                    if existing.state != NodeState::Dead && new_member.state == NodeState::Dead {
                        declared_dead = Some(new_member.id.clone());
                    }

                    existing.state = new_member.state;
                    existing.node_type = new_member.node_type;
                    existing.permissions = new_member.permissions;
                    existing.incarnation = new_member.incarnation;
                    existing.last_seen = Some(Instant::now());
                } else if new_member.incarnation == existing.incarnation
                    && new_member.state == NodeState::Alive
                    && existing.state == NodeState::Suspect
                {
                    tracing::info!("{:?} refuted suspicion", new_member.id);
                    existing.state = NodeState::Alive;
                    existing.last_seen = Some(Instant::now());
                }
            }
            None => {
                tracing::info!(
                    "Discovered new member: {:?} at {}",
                    new_member.id,
                    new_member.gossip_addr
                );

                let mut member_with_timestamp = new_member;
                member_with_timestamp.last_seen = Some(Instant::now());

                self.members
                    .insert(member_with_timestamp.id.clone(), member_with_timestamp);
            }
        }

        if let Some(node_id) = declared_dead {
            let _ = self.failure_tx.send(node_id);
        }
    }

    async fn handle_suspect(&self, node_id: NodeId, incarnation: u64) -> Result<()> {
        if node_id == self.local_node.id {
            // Self-defense: bump our incarnation and refute.
            let my_incarnation = {
                let mut inc = self.incarnation.write().await;
                *inc += 1;
                *inc
            };

            tracing::info!("Refuting suspicion against the local node");

            let msg = GossipMessage::Alive {
                node_id: node_id.clone(),
                incarnation: my_incarnation,
            };

            self.broadcast_message(msg).await;

            if let Some(mut existing) = self.members.get_mut(&node_id) {
                existing.incarnation = my_incarnation;
                existing.state = NodeState::Alive;
                existing.last_seen = Some(Instant::now());
            }

            return Ok(());
        }

        match self.members.get_mut(&node_id) {
            Some(mut existing) => {
                if incarnation > existing.incarnation {
                    tracing::info!(
                        "Node {:?} at {} suspected",
                        existing.id,
                        existing.gossip_addr
                    );
                    existing.state = NodeState::Suspect;
                    existing.incarnation = incarnation;
                    existing.last_seen = Some(Instant::now());
                }
            }
            None => {
                tracing::debug!("Suspected node {:?} doesn't exist", node_id);
            }
        }

        Ok(())
    }

    async fn handle_alive(&self, node_id: NodeId, incarnation: u64) -> Result<()> {
        match self.members.get_mut(&node_id) {
            Some(mut existing) => {
                if incarnation > existing.incarnation {
                    tracing::info!(
                        "Node {:?} at {} is now Alive (inc={})",
                        existing.id,
                        existing.gossip_addr,
                        incarnation
                    );
                    existing.state = NodeState::Alive;
                    existing.incarnation = incarnation;
                    existing.last_seen = Some(Instant::now());
                } else if incarnation == existing.incarnation && existing.state == NodeState::Suspect
                {
                    tracing::info!(
                        "Node {:?} at {} successfully refuted suspicion",
                        existing.id,
                        existing.gossip_addr,
                    );
                    existing.state = NodeState::Alive;
                    existing.incarnation = incarnation;
                    existing.last_seen = Some(Instant::now());
                }
            }
            None => {
                tracing::debug!("Alive message for unknown node {:?}", node_id);
            }
        }

        Ok(())
    }

    async fn handle_join(&self, mut node: Node) -> Result<()> {
        tracing::info!(
            "Node {:?} ({:?}) joining cluster at {}",
            node.id,
            node.node_type,
            node.gossip_addr
        );

        node.last_seen = Some(Instant::now());

        self.members.insert(node.id.clone(), node);

        tracing::info!("Cluster size now: {}", self.members.len());

        Ok(())
    }

    async fn failure_detection_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(FAILURE_DETECTION_INTERVAL);

        loop {
            interval.tick().await;
            let now = Instant::now();

            let mut messages_to_broadcast = Vec::new();
            let mut newly_dead = Vec::new();

            for mut entry in self.members.iter_mut() {
                let member = entry.value_mut();

                if member.id == self.local_node.id {
                    continue;
                }

                if let Some(last_seen) = member.last_seen {
                    let elapsed = now.duration_since(last_seen);

                    match member.state {
                        NodeState::Alive => {
                            if elapsed > SUSPECT_TIMEOUT {
                                tracing::warn!(
                                    "Node {:?} suspected (no contact for {:?})",
                                    member.id,
                                    elapsed
                                );

                                member.state = NodeState::Suspect;

                                let msg = GossipMessage::Suspect {
                                    node_id: member.id.clone(),
                                    incarnation: member.incarnation,
                                };

                                messages_to_broadcast.push(msg);
                            }
                        }

                        NodeState::Suspect => {
                            if elapsed > DEAD_TIMEOUT {
                                tracing::warn!(
                                    "Node {:?} declared DEAD (no contact for {:?})",
                                    member.id,
                                    elapsed
                                );

                                member.state = NodeState::Dead;
                                newly_dead.push(member.id.clone());
                            }
                        }

                        NodeState::Dead => {
                            tracing::debug!(
                                "Node {:?} DEAD (no contact for {:?})",
                                member.id,
                                elapsed
                            );
                        }
                    }
                } else {
                    member.last_seen = Some(now);
                }
            }

            for msg in messages_to_broadcast {
                self.broadcast_message(msg).await;
            }

            for node_id in newly_dead {
                let _ = self.failure_tx.send(node_id);
                tracing::info!(
                    "Cluster size now: {} alive nodes",
                    self.get_alive_members().len()
                );
            }
        }
    }

    async fn broadcast_message(&self, msg: GossipMessage) {
        if let Ok(encoded) = bincode::serialize(&msg) {
            for entry in self.members.iter() {
                let member = entry.value();

                if member.id == self.local_node.id {
                    continue;
                }

                if member.state == NodeState::Alive {
                    if let Err(e) = self.socket.send_to(&encoded, member.gossip_addr).await {
                        tracing::warn!("Failed to broadcast to {:?}: {}", member.id, e);
                    }
                }
            }
        }
    }
}
