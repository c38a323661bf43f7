use super::types::*;
use crate::membership::{
    service::MembershipService,
    types::{Node, NodeId, NodeType, Permissions},
};
use crate::process::types::now_ms;
use crate::tasklog::log::ReplicatedTaskLog;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};
use sysinfo::System;
use tokio::sync::Notify;

const EVENT_LOG_CAPACITY: usize = 256;

/// Node administration surface.
///
/// Not an actor: every operation is a short, lock-guarded mutation or a
/// read, served directly from the HTTP handlers. Also the sink for
/// `FailCluster` signals raised by the process manager's fault handler.
pub struct ClusterManager {
    membership: Arc<MembershipService>,
    log: Arc<ReplicatedTaskLog>,
    deployment_id: String,
    booted: RwLock<Option<Configuration>>,
    failed: RwLock<Option<String>>,
    events: Mutex<VecDeque<ClusterEvent>>,
    shutdown: Arc<Notify>,
}

impl ClusterManager {
    pub fn new(membership: Arc<MembershipService>, log: Arc<ReplicatedTaskLog>) -> Arc<Self> {
        Arc::new(Self {
            membership,
            log,
            deployment_id: uuid::Uuid::new_v4().to_string(),
            booted: RwLock::new(None),
            failed: RwLock::new(None),
            events: Mutex::new(VecDeque::new()),
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn record_event(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{}", message);

        let mut events = self.events.lock().expect("event log lock");
        if events.len() >= EVENT_LOG_CAPACITY {
            events.pop_front();
        }
        events.push_back(ClusterEvent {
            at_ms: now_ms(),
            message,
        });
    }

    pub fn ping(&self) -> String {
        self.deployment_id.clone()
    }

    pub fn deployment_id(&self) -> &str {
        &self.deployment_id
    }

    pub fn deployment_info(&self) -> NodeDeploymentInfo {
        NodeDeploymentInfo {
            node: self.membership.local_node.clone(),
            deployment_id: self.deployment_id.clone(),
            booted: self.booted.read().expect("boot lock").is_some(),
            failed: self.failed.read().expect("fail lock").clone(),
        }
    }

    pub fn performance_counters(&self) -> PerformanceCounters {
        let mut sys = System::new_all();
        sys.refresh_cpu();
        sys.refresh_memory();
        let cpu_usage = sys.global_cpu_info().cpu_usage();
        // sysinfo returns bytes for memory values.
        let mem_total_mb = sys.total_memory() / (1024 * 1024);
        let mem_used_mb = sys.used_memory() / (1024 * 1024);

        PerformanceCounters {
            cpu_usage,
            mem_used_mb,
            mem_total_mb,
        }
    }

    pub fn all_nodes(&self) -> Vec<Node> {
        self.membership.get_all_members()
    }

    /// The active master plus its hot standbys.
    pub fn master_and_alts(&self) -> Vec<Node> {
        self.membership
            .get_all_members()
            .into_iter()
            .filter(|node| matches!(node.node_type, NodeType::Master | NodeType::Alt))
            .collect()
    }

    pub fn attach(&self, node: Node) {
        self.record_event(format!("Attached node {:?} at {}", node.id, node.gossip_addr));
        self.membership.register_node(node);
    }

    pub fn detach(&self, node_id: &NodeId) {
        self.record_event(format!("Detached node {:?}", node_id));
        self.membership.declare_dead(node_id);
    }

    pub fn set_node_permissions(&self, node_id: &NodeId, permissions: Permissions) -> bool {
        let changed = self.membership.set_permissions(node_id, permissions);
        if changed {
            self.record_event(format!(
                "Permissions of {:?} set to {:?}",
                node_id, permissions
            ));
        }
        changed
    }

    /// Applies the boot configuration: replication policy for the task log
    /// and the local node's promotion to master.
    pub fn master_boot(&self, config: Configuration) {
        self.log
            .set_replication(config.replication_factor, config.failover_factor);
        self.membership
            .set_node_type(&self.membership.local_node.id, NodeType::Master);

        self.record_event(format!(
            "Master boot: {} node(s), replication factor {}, failover factor {}",
            config.nodes.len(),
            config.replication_factor,
            config.failover_factor
        ));

        *self.booted.write().expect("boot lock") = Some(config);
    }

    pub fn boot_configuration(&self) -> Option<Configuration> {
        self.booted.read().expect("boot lock").clone()
    }

    pub fn log_dump(&self) -> Vec<ClusterEvent> {
        self.events
            .lock()
            .expect("event log lock")
            .iter()
            .cloned()
            .collect()
    }

    /// Raised by the process manager's fault handler. The cluster keeps
    /// serving admin traffic so an operator can inspect and restart it.
    pub fn fail_cluster(&self, reason: &str) {
        self.record_event(format!("Cluster failure signalled: {}", reason));
        *self.failed.write().expect("fail lock") = Some(reason.to_string());
    }

    pub fn is_failed(&self) -> Option<String> {
        self.failed.read().expect("fail lock").clone()
    }

    /// Triggers node shutdown; `main` waits on this notification.
    pub fn shutdown(&self) {
        self.record_event("Shutdown requested");
        self.shutdown.notify_waiters();
    }

    pub fn shutdown_signal(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::types::NodeState;
    use std::time::Instant;

    async fn harness() -> Arc<ClusterManager> {
        let membership = MembershipService::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:0".parse().unwrap(),
            NodeType::Alt,
            Permissions::ALL,
            vec![],
        )
        .await
        .unwrap();
        let log = ReplicatedTaskLog::new(membership.clone(), 0, 0);
        ClusterManager::new(membership, log)
    }

    fn node(id: &str, node_type: NodeType) -> Node {
        Node {
            id: NodeId(id.to_string()),
            gossip_addr: "127.0.0.1:5000".parse().unwrap(),
            http_addr: "127.0.0.1:6000".parse().unwrap(),
            node_type,
            permissions: Permissions::SLAVE,
            state: NodeState::Alive,
            incarnation: 1,
            last_seen: Some(Instant::now()),
        }
    }

    #[tokio::test]
    async fn test_master_boot_promotes_local_node() {
        let cluster = harness().await;
        assert!(cluster.boot_configuration().is_none());

        cluster.master_boot(Configuration {
            nodes: vec!["127.0.0.1:5001".parse().unwrap()],
            replication_factor: 2,
            failover_factor: 1,
        });

        assert!(cluster.boot_configuration().is_some());
        let masters = cluster.master_and_alts();
        assert_eq!(masters.len(), 1);
        assert_eq!(masters[0].node_type, NodeType::Master);
    }

    #[tokio::test]
    async fn test_attach_detach_roundtrip() {
        let cluster = harness().await;

        cluster.attach(node("w-1", NodeType::Slave));
        assert_eq!(cluster.all_nodes().len(), 2);

        cluster.detach(&NodeId("w-1".to_string()));
        let detached = cluster
            .all_nodes()
            .into_iter()
            .find(|n| n.id == NodeId("w-1".to_string()))
            .unwrap();
        assert_eq!(detached.state, NodeState::Dead);
    }

    #[tokio::test]
    async fn test_fail_cluster_is_recorded() {
        let cluster = harness().await;
        assert!(cluster.is_failed().is_none());

        cluster.fail_cluster("replication quorum lost");

        assert!(cluster.is_failed().unwrap().contains("quorum"));
        assert!(
            cluster
                .log_dump()
                .iter()
                .any(|event| event.message.contains("Cluster failure"))
        );
    }

    #[tokio::test]
    async fn test_event_log_is_bounded() {
        let cluster = harness().await;
        for i in 0..400 {
            cluster.record_event(format!("event {}", i));
        }
        assert_eq!(cluster.log_dump().len(), EVENT_LOG_CAPACITY);
    }
}
