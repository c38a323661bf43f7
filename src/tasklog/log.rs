use super::protocol::*;
use super::types::*;
use crate::errors::RuntimeError;
use crate::membership::{
    service::MembershipService,
    types::{NodeId, Permissions},
};

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Mutations buffered per origin while waiting for a sequence gap to fill.
/// Beyond this the replica assumes the gap is permanent and applies anyway.
const MAX_PENDING_PER_ORIGIN: usize = 1024;

/// Quorum-replicated, in-memory record of every dispatched-but-unfinished
/// task.
///
/// The node hosting a task manager holds the primary copy; every other
/// master-capable node (Master or Alt permission bit) holds a replica that
/// mutations are pushed to. Each mutation carries a per-origin sequence
/// number so replicas apply one origin's writes in submission order, and an
/// op id so retried deliveries are dropped.
///
/// The same structure serves both roles: origin (mutating methods) and
/// replica (`apply_mutation`, driven by the HTTP handler).
pub struct ReplicatedTaskLog {
    entries: DashMap<TaskId, TaskLogEntry>,
    membership: Arc<MembershipService>,
    http_client: reqwest::Client,
    replication_factor: AtomicUsize,
    failover_factor: AtomicUsize,
    boot_replicas: AtomicUsize,
    seq: AtomicU64,

    // Replica-side apply state.
    applied_ops: DashMap<String, u64>,
    origin_seq: DashMap<NodeId, u64>,
    pending: DashMap<NodeId, BTreeMap<u64, LogMutation>>,
}

impl ReplicatedTaskLog {
    pub fn new(
        membership: Arc<MembershipService>,
        replication_factor: usize,
        failover_factor: usize,
    ) -> Arc<Self> {
        let log = Arc::new(Self {
            entries: DashMap::new(),
            membership,
            http_client: reqwest::Client::new(),
            replication_factor: AtomicUsize::new(replication_factor),
            failover_factor: AtomicUsize::new(failover_factor),
            boot_replicas: AtomicUsize::new(0),
            seq: AtomicU64::new(0),
            applied_ops: DashMap::new(),
            origin_seq: DashMap::new(),
            pending: DashMap::new(),
        });
        log.boot_replicas
            .store(log.replica_peers().len(), Ordering::SeqCst);
        log
    }

    /// Reconfigures the replication policy (master boot) and re-baselines
    /// the failover accounting against the current replica set.
    pub fn set_replication(&self, replication_factor: usize, failover_factor: usize) {
        self.replication_factor
            .store(replication_factor, Ordering::SeqCst);
        self.failover_factor
            .store(failover_factor, Ordering::SeqCst);
        self.boot_replicas
            .store(self.replica_peers().len(), Ordering::SeqCst);
    }

    fn replica_peers(&self) -> Vec<crate::membership::types::Node> {
        let local = &self.membership.local_node.id;
        self.membership
            .get_alive_members()
            .into_iter()
            .filter(|node| &node.id != local && node.permissions.allows(Permissions::MASTER))
            .collect()
    }

    // ------------------------------------------------------------------
    // Origin-side mutations
    // ------------------------------------------------------------------

    /// Appends (or overwrites, keyed by `TaskId`) entries. Overwriting is
    /// what reassigns a task to a fresh worker on retry.
    pub async fn log(
        &self,
        entries: Vec<TaskLogEntry>,
        mode: ReplicationMode,
    ) -> Result<(), RuntimeError> {
        for entry in &entries {
            self.entries.insert(entry.task_id.clone(), entry.clone());
        }
        self.broadcast(LogOp::Append(entries), mode).await
    }

    /// Removes entries; ids that are not logged are ignored.
    pub async fn unlog(
        &self,
        task_ids: Vec<TaskId>,
        mode: ReplicationMode,
    ) -> Result<(), RuntimeError> {
        for task_id in &task_ids {
            self.entries.remove(task_id);
        }
        self.broadcast(LogOp::Remove(task_ids), mode).await
    }

    async fn broadcast(&self, op: LogOp, mode: ReplicationMode) -> Result<(), RuntimeError> {
        let mutation = LogMutation {
            op_id: uuid::Uuid::new_v4().to_string(),
            origin: self.membership.local_node.id.clone(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            op,
        };

        let peers = self.replica_peers();

        match mode {
            ReplicationMode::Async => {
                let client = self.http_client.clone();
                let targets: Vec<_> = peers.into_iter().map(|node| node.http_addr).collect();
                tokio::spawn(async move {
                    for addr in targets {
                        let url = format!("http://{}{}", addr, ENDPOINT_LOG_REPLICATE);
                        if let Err(e) = post_with_retry(&client, url, &mutation).await {
                            tracing::warn!("Async log replication to {} failed: {}", addr, e);
                        }
                    }
                });
                Ok(())
            }
            ReplicationMode::Sync => {
                let required = self.replication_factor.load(Ordering::SeqCst);
                let mut acked = 0usize;

                for node in &peers {
                    let url = format!("http://{}{}", node.http_addr, ENDPOINT_LOG_REPLICATE);
                    match post_with_retry(&self.http_client, url, &mutation).await {
                        Ok(_) => acked += 1,
                        Err(e) => {
                            tracing::warn!(
                                "Sync log replication to {:?} failed: {}",
                                node.id,
                                e
                            );
                        }
                    }
                }

                if acked < required {
                    return Err(RuntimeError::BroadcastFailure {
                        acked,
                        required,
                    });
                }
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn is_logged(&self, task_id: &TaskId) -> bool {
        self.entries.contains_key(task_id)
    }

    pub fn get(&self, task_id: &TaskId) -> Option<TaskLogEntry> {
        self.entries.get(task_id).map(|entry| entry.value().clone())
    }

    /// All entries currently assigned to `worker`. The recovery oracle.
    pub fn retrieve_by_worker(&self, worker: &NodeId) -> Vec<TaskLogEntry> {
        self.entries
            .iter()
            .filter(|entry| &entry.value().worker == worker)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// All entries belonging to `process_id`. Drives the kill cascade.
    pub fn retrieve_by_process(&self, process_id: &ProcessId) -> Vec<TaskLogEntry> {
        self.entries
            .iter()
            .filter(|entry| &entry.value().payload.process_id == process_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// All entries sharing `task_id`'s parent (within the same process), the
    /// task itself included. Used when a choice branch wins and its siblings
    /// get cancelled.
    pub fn sibling_tasks(&self, task_id: &TaskId) -> Vec<TaskLogEntry> {
        let (parent, process_id) = match self.entries.get(task_id) {
            Some(entry) => (
                entry.value().parent_task_id.clone(),
                entry.value().payload.process_id.clone(),
            ),
            None => return vec![],
        };

        self.entries
            .iter()
            .filter(|entry| {
                entry.value().parent_task_id == parent
                    && entry.value().payload.process_id == process_id
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Number of outstanding entries assigned to `worker`; the load metric
    /// the pool balances on.
    pub fn worker_load(&self, worker: &NodeId) -> usize {
        self.entries
            .iter()
            .filter(|entry| &entry.value().worker == worker)
            .count()
    }

    pub fn dump(&self) -> Vec<TaskLogEntry> {
        self.entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Lost-replica accounting: the log is corrupt once more peers than the
    /// failover factor have been lost since the last (re)baseline.
    pub fn verify_health(&self) -> Result<(), RuntimeError> {
        let boot = self.boot_replicas.load(Ordering::SeqCst);
        let alive = self.replica_peers().len();
        let lost = boot.saturating_sub(alive);
        let failover = self.failover_factor.load(Ordering::SeqCst);

        if lost > failover {
            return Err(RuntimeError::LogCorrupt { lost, failover });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Replica-side apply
    // ------------------------------------------------------------------

    /// Applies a mutation received from another node. Returns whether the
    /// mutation mutated the local store (false for duplicates).
    pub fn apply_mutation(&self, mutation: LogMutation) -> bool {
        if self.applied_ops.contains_key(&mutation.op_id) {
            return false;
        }
        if self.applied_ops.len() > 10_000 {
            self.applied_ops.clear();
        }
        self.applied_ops.insert(mutation.op_id.clone(), mutation.seq);

        let origin = mutation.origin.clone();
        let last = self.origin_seq.get(&origin).map(|seq| *seq.value());

        match last {
            None => {
                // First contact with this origin; accept its numbering as-is.
                self.origin_seq.insert(origin.clone(), mutation.seq);
                self.apply_op(mutation.op);
            }
            Some(last) if mutation.seq <= last => {
                tracing::debug!(
                    "Dropping stale mutation seq {} from {:?} (applied up to {})",
                    mutation.seq,
                    origin,
                    last
                );
                return false;
            }
            Some(last) if mutation.seq == last + 1 => {
                self.origin_seq.insert(origin.clone(), mutation.seq);
                self.apply_op(mutation.op);
                self.drain_pending(&origin);
            }
            Some(last) => {
                let mut buffer = self.pending.entry(origin.clone()).or_default();
                if buffer.len() >= MAX_PENDING_PER_ORIGIN {
                    tracing::warn!(
                        "Pending buffer for {:?} overflowed at seq gap {}..{}; applying out of order",
                        origin,
                        last,
                        mutation.seq
                    );
                    let seq = mutation.seq;
                    drop(buffer);
                    self.origin_seq.insert(origin.clone(), seq);
                    self.apply_op(mutation.op);
                    self.drain_pending(&origin);
                } else {
                    buffer.insert(mutation.seq, mutation);
                }
            }
        }

        true
    }

    fn drain_pending(&self, origin: &NodeId) {
        loop {
            let next = {
                let last = match self.origin_seq.get(origin) {
                    Some(seq) => *seq.value(),
                    None => return,
                };
                match self.pending.get_mut(origin) {
                    Some(mut buffer) => buffer.remove(&(last + 1)),
                    None => return,
                }
            };

            match next {
                Some(mutation) => {
                    self.origin_seq.insert(origin.clone(), mutation.seq);
                    self.apply_op(mutation.op);
                }
                None => return,
            }
        }
    }

    fn apply_op(&self, op: LogOp) {
        match op {
            LogOp::Append(entries) => {
                for entry in entries {
                    self.entries.insert(entry.task_id.clone(), entry);
                }
            }
            LogOp::Remove(task_ids) => {
                for task_id in task_ids {
                    self.entries.remove(&task_id);
                }
            }
        }
    }
}

async fn post_with_retry<T: serde::Serialize>(
    client: &reqwest::Client,
    url: String,
    payload: &T,
) -> anyhow::Result<()> {
    let mut delay_ms = 150u64;
    let attempts = 3;

    for attempt in 0..attempts {
        let response = client
            .post(url.clone())
            .json(payload)
            .timeout(std::time::Duration::from_millis(500))
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            Ok(resp) => {
                if attempt + 1 == attempts {
                    return Err(anyhow::anyhow!("replication rejected: {}", resp.status()));
                }
            }
            Err(e) => {
                if attempt + 1 == attempts {
                    return Err(anyhow::anyhow!(e));
                }
            }
        }

        let jitter = rand::random::<u64>() % 50;
        tokio::time::sleep(std::time::Duration::from_millis(delay_ms + jitter)).await;
        delay_ms = (delay_ms * 2).min(1200);
    }

    Err(anyhow::anyhow!("Retry attempts exhausted"))
}
