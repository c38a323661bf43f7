use super::protocol::{RecordMutation, RecordOp, ENDPOINT_PROCESS_REPLICATE};
use super::types::*;
use crate::errors::RuntimeError;
use crate::membership::{service::MembershipService, types::Permissions};
use crate::tasklog::types::{ProcessId, ReplicationMode};

use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// The replicated table of process records.
///
/// The master holds the authoritative copy; Alt nodes hold replicas kept in
/// step by pushed record mutations, so a failover can answer queries for
/// every admitted process. Terminal records stay until a client clears them.
pub struct ProcessMonitor {
    records: DashMap<ProcessId, ProcessRecord>,
    by_request: DashMap<String, ProcessId>,
    membership: Arc<MembershipService>,
    http_client: reqwest::Client,
    replication_factor: AtomicUsize,
    applied_ops: DashMap<String, u64>,
}

impl ProcessMonitor {
    pub fn new(membership: Arc<MembershipService>, replication_factor: usize) -> Arc<Self> {
        Arc::new(Self {
            records: DashMap::new(),
            by_request: DashMap::new(),
            membership,
            http_client: reqwest::Client::new(),
            replication_factor: AtomicUsize::new(replication_factor),
            applied_ops: DashMap::new(),
        })
    }

    pub fn set_replication(&self, replication_factor: usize) {
        self.replication_factor
            .store(replication_factor, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------
    // Authoritative-side mutations
    // ------------------------------------------------------------------

    pub async fn insert(
        &self,
        record: ProcessRecord,
        mode: ReplicationMode,
    ) -> Result<(), RuntimeError> {
        self.by_request
            .insert(record.request_id.clone(), record.process_id.clone());
        self.records
            .insert(record.process_id.clone(), record.clone());
        self.replicate(RecordOp::Upsert(record), mode).await
    }

    /// Applies a legal state transition; illegal ones are ignored so stale
    /// messages can never regress a record.
    pub async fn set_state(&self, process_id: &ProcessId, next: ProcessState) -> bool {
        let updated = {
            match self.records.get_mut(process_id) {
                Some(mut record) => {
                    if record.state.can_transition(next) {
                        record.state = next;
                        if next == ProcessState::Running && record.started_at_ms.is_none() {
                            record.started_at_ms = Some(now_ms());
                        }
                        Some(record.clone())
                    } else {
                        tracing::debug!(
                            "Refusing transition {:?} -> {:?} for {:?}",
                            record.state,
                            next,
                            process_id
                        );
                        None
                    }
                }
                None => None,
            }
        };

        match updated {
            Some(record) => {
                let _ = self
                    .replicate(RecordOp::Upsert(record), ReplicationMode::Async)
                    .await;
                true
            }
            None => false,
        }
    }

    /// Records the terminal result, deriving the terminal state from it.
    /// A record that is already terminal is never overwritten (a straggler
    /// result after a kill must not resurrect the process).
    pub async fn set_result(
        &self,
        process_id: &ProcessId,
        result: ExecuteResult,
        mode: ReplicationMode,
    ) -> Result<bool, RuntimeError> {
        let next = match &result {
            ExecuteResult::Success(_) => ProcessState::Completed,
            ExecuteResult::InitError(_) | ExecuteResult::Fault(_) => ProcessState::Failed,
            ExecuteResult::Killed => ProcessState::Killed,
        };

        let updated = {
            match self.records.get_mut(process_id) {
                Some(mut record) => {
                    if record.state.is_terminal() {
                        None
                    } else {
                        record.state = next;
                        record.result = Some(result);
                        Some(record.clone())
                    }
                }
                None => None,
            }
        };

        match updated {
            Some(record) => {
                self.replicate(RecordOp::Upsert(record), mode).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Frees a terminal record. Store artifacts tied to the process (logs,
    /// spilled values) are cleaned up here, at clearing time.
    pub async fn clear(&self, process_id: &ProcessId) -> Result<(), RuntimeError> {
        let record = self
            .records
            .get(process_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RuntimeError::ProcessNotFound(process_id.0.clone()))?;

        if !record.state.is_terminal() {
            return Err(RuntimeError::ProcessStillActive(process_id.0.clone()));
        }

        self.records.remove(process_id);
        self.by_request.remove(&record.request_id);
        tracing::debug!("Cleared record and stored artifacts for {:?}", process_id);

        self.replicate(RecordOp::Remove(process_id.clone()), ReplicationMode::Async)
            .await
    }

    /// Frees every terminal record; running processes are left alone.
    /// Returns how many records were cleared.
    pub async fn clear_all(&self) -> Result<usize, RuntimeError> {
        let terminal: Vec<ProcessId> = self
            .records
            .iter()
            .filter(|entry| entry.value().state.is_terminal())
            .map(|entry| entry.key().clone())
            .collect();

        let count = terminal.len();
        for process_id in terminal {
            self.clear(&process_id).await?;
        }
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn get(&self, process_id: &ProcessId) -> Option<ProcessRecord> {
        self.records
            .get(process_id)
            .map(|entry| entry.value().clone())
    }

    pub fn all(&self) -> Vec<ProcessRecord> {
        self.records
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Idempotent-admission lookup: an already-admitted request id resolves
    /// to its existing record.
    pub fn lookup_request(&self, request_id: &str) -> Option<ProcessRecord> {
        let process_id = self
            .by_request
            .get(request_id)
            .map(|entry| entry.value().clone())?;
        self.get(&process_id)
    }

    pub fn count(&self) -> usize {
        self.records.len()
    }

    // ------------------------------------------------------------------
    // Replication
    // ------------------------------------------------------------------

    async fn replicate(&self, op: RecordOp, mode: ReplicationMode) -> Result<(), RuntimeError> {
        let mutation = RecordMutation {
            op_id: uuid::Uuid::new_v4().to_string(),
            op,
        };

        let local = &self.membership.local_node.id;
        let peers: Vec<_> = self
            .membership
            .get_alive_members()
            .into_iter()
            .filter(|node| &node.id != local && node.permissions.allows(Permissions::MASTER))
            .collect();

        match mode {
            ReplicationMode::Async => {
                let client = self.http_client.clone();
                let targets: Vec<_> = peers.into_iter().map(|node| node.http_addr).collect();
                tokio::spawn(async move {
                    for addr in targets {
                        let url = format!("http://{}{}", addr, ENDPOINT_PROCESS_REPLICATE);
                        if let Err(e) = post_with_retry(&client, url, &mutation).await {
                            tracing::warn!("Record replication to {} failed: {}", addr, e);
                        }
                    }
                });
                Ok(())
            }
            ReplicationMode::Sync => {
                let required = self.replication_factor.load(Ordering::SeqCst);
                let mut acked = 0usize;

                for node in &peers {
                    let url = format!("http://{}{}", node.http_addr, ENDPOINT_PROCESS_REPLICATE);
                    match post_with_retry(&self.http_client, url, &mutation).await {
                        Ok(_) => acked += 1,
                        Err(e) => {
                            tracing::warn!("Record replication to {:?} failed: {}", node.id, e);
                        }
                    }
                }

                if acked < required {
                    return Err(RuntimeError::BroadcastFailure { acked, required });
                }
                Ok(())
            }
        }
    }

    /// Replica-side apply. Upserts never regress a terminal record.
    pub fn apply_mutation(&self, mutation: RecordMutation) -> bool {
        if self.applied_ops.contains_key(&mutation.op_id) {
            return false;
        }
        if self.applied_ops.len() > 10_000 {
            self.applied_ops.clear();
        }
        self.applied_ops.insert(mutation.op_id.clone(), now_ms());

        match mutation.op {
            RecordOp::Upsert(record) => {
                let regress = self
                    .records
                    .get(&record.process_id)
                    .map(|existing| existing.value().state.is_terminal() && !record.state.is_terminal())
                    .unwrap_or(false);
                if regress {
                    return false;
                }
                self.by_request
                    .insert(record.request_id.clone(), record.process_id.clone());
                self.records.insert(record.process_id.clone(), record);
            }
            RecordOp::Remove(process_id) => {
                if let Some((_, record)) = self.records.remove(&process_id) {
                    self.by_request.remove(&record.request_id);
                }
            }
        }

        true
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
