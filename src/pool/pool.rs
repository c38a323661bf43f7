use crate::membership::{
    service::MembershipService,
    types::{Node, NodeId, Permissions},
};
use crate::tasklog::log::ReplicatedTaskLog;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Selection layer over the membership view.
///
/// Eligible workers are alive nodes carrying the `Slave` permission bit;
/// `Permissions::NONE` excludes a node entirely. Selection is least-loaded
/// with a rotating tie-break, where load is the number of outstanding log
/// entries assigned to the worker.
pub struct WorkerPool {
    membership: Arc<MembershipService>,
    log: Arc<ReplicatedTaskLog>,
    cursor: AtomicUsize,
}

impl WorkerPool {
    pub fn new(membership: Arc<MembershipService>, log: Arc<ReplicatedTaskLog>) -> Arc<Self> {
        Arc::new(Self {
            membership,
            log,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Alive members allowed to execute tasks, sorted by id so every caller
    /// observes the same ordering.
    fn eligible(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .membership
            .get_alive_members()
            .into_iter()
            .filter(|node| node.permissions.allows(Permissions::SLAVE))
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Returns one worker, or `None` when no eligible worker exists.
    pub fn select(&self) -> Option<Node> {
        self.select_many(1).map(|mut nodes| nodes.remove(0))
    }

    /// Atomic batch selection for parallel fan-outs: either the full batch
    /// or `None`, never a partial reservation. When the batch is wider than
    /// the set of eligible workers, workers are reused round-robin so a
    /// small cluster can still run wide fan-outs.
    pub fn select_many(&self, n: usize) -> Option<Vec<Node>> {
        let eligible = self.eligible();
        if eligible.is_empty() || n == 0 {
            return if n == 0 { Some(vec![]) } else { None };
        }

        let offset = self.cursor.fetch_add(1, Ordering::Relaxed);

        // Projected load per candidate: current log assignments plus what
        // this batch is about to add.
        let mut loads: Vec<usize> = eligible
            .iter()
            .map(|node| self.log.worker_load(&node.id))
            .collect();

        let mut picks = Vec::with_capacity(n);
        for round in 0..n {
            let mut best = None;
            for i in 0..eligible.len() {
                // Rotate the scan start so ties spread across the pool.
                let idx = (offset + round + i) % eligible.len();
                match best {
                    None => best = Some(idx),
                    Some(current) => {
                        if loads[idx] < loads[current] {
                            best = Some(idx);
                        }
                    }
                }
            }
            let idx = best.expect("eligible is non-empty");
            loads[idx] += 1;
            picks.push(eligible[idx].clone());
        }

        Some(picks)
    }

    pub fn available_worker_count(&self) -> usize {
        self.eligible().len()
    }

    /// Evicts a worker from the pool. The membership service emits the
    /// failure event that task managers consume to drive recovery.
    pub fn on_worker_failure(&self, worker: &NodeId) {
        tracing::warn!("Worker {:?} removed from pool", worker);
        self.membership.declare_dead(worker);
    }
}
