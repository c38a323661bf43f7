use super::messages::TaskManagerMsg;
use super::protocol::TaskOutcome;
use crate::errors::RuntimeError;
use crate::membership::{service::MembershipService, types::Node, types::NodeId};
use crate::pool::pool::WorkerPool;
use crate::scheduler::scheduler::SchedulerHandle;
use crate::tasklog::log::ReplicatedTaskLog;
use crate::tasklog::types::*;
use crate::worker::protocol::{CancelTasksRequest, ExecuteTaskRequest, ENDPOINT_CANCEL, ENDPOINT_EXECUTE};

use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Delay before a message that found no eligible worker is re-enqueued to
/// the manager's own mailbox. Bounded, so self-retries never spin.
const SELF_RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Cloneable mailbox handle for a per-process task manager.
#[derive(Clone)]
pub struct TaskManagerHandle {
    tx: mpsc::UnboundedSender<TaskManagerMsg>,
}

impl TaskManagerHandle {
    #[cfg(test)]
    pub(crate) fn from_channel(tx: mpsc::UnboundedSender<TaskManagerMsg>) -> Self {
        Self { tx }
    }

    pub async fn create_root_task(
        &self,
        process_id: ProcessId,
        body: serde_json::Value,
    ) -> Result<TaskId, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(TaskManagerMsg::CreateRootTask {
            reply,
            process_id,
            body,
        });
        rx.await
            .unwrap_or_else(|_| Err(RuntimeError::SystemFailure("task manager gone".into())))
    }

    pub async fn create_tasks(
        &self,
        process_id: ProcessId,
        parent_task_id: TaskId,
        bodies: Vec<serde_json::Value>,
    ) -> Result<Vec<TaskId>, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(TaskManagerMsg::CreateTasks {
            reply,
            process_id,
            parent_task_id,
            bodies,
        });
        rx.await
            .unwrap_or_else(|_| Err(RuntimeError::SystemFailure("task manager gone".into())))
    }

    pub fn leaf_task_complete(&self, task_id: TaskId) {
        let _ = self.tx.send(TaskManagerMsg::LeafTaskComplete { task_id });
    }

    pub async fn final_task_complete(&self, task_id: TaskId) -> Result<(), RuntimeError> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(TaskManagerMsg::FinalTaskComplete { reply, task_id });
        rx.await
            .unwrap_or_else(|_| Err(RuntimeError::SystemFailure("task manager gone".into())))
    }

    pub fn task_result(&self, header: TaskHeader, outcome: TaskOutcome) {
        let _ = self.tx.send(TaskManagerMsg::TaskResult { header, outcome });
    }

    pub fn recover(&self, worker: NodeId) {
        let _ = self.tx.send(TaskManagerMsg::Recover { worker });
    }

    pub async fn cancel_sibling_tasks(&self, task_id: TaskId) -> Result<(), RuntimeError> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(TaskManagerMsg::CancelSiblingTasks { reply, task_id });
        rx.await
            .unwrap_or_else(|_| Err(RuntimeError::SystemFailure("task manager gone".into())))
    }

    pub async fn cancel_process_tasks(&self) -> Result<(), RuntimeError> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(TaskManagerMsg::CancelProcessTasks { reply });
        rx.await
            .unwrap_or_else(|_| Err(RuntimeError::SystemFailure("task manager gone".into())))
    }

    pub async fn is_valid_task(&self, task_id: TaskId) -> bool {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(TaskManagerMsg::IsValidTask { reply, task_id });
        rx.await.unwrap_or(false)
    }

    pub async fn active_task_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(TaskManagerMsg::GetActiveTaskCount { reply });
        rx.await.unwrap_or(0)
    }

    pub fn set_scheduler(&self, scheduler: SchedulerHandle) {
        let _ = self.tx.send(TaskManagerMsg::SetScheduler(scheduler));
    }

    pub fn stop(&self) {
        let _ = self.tx.send(TaskManagerMsg::Stop);
    }
}

/// Lookup table from process id to its task manager, used by the HTTP
/// handlers that receive worker callbacks.
pub struct TaskManagerDirectory {
    inner: DashMap<ProcessId, TaskManagerHandle>,
}

impl TaskManagerDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: DashMap::new(),
        })
    }

    pub fn register(&self, process_id: ProcessId, handle: TaskManagerHandle) {
        self.inner.insert(process_id, handle);
    }

    pub fn unregister(&self, process_id: &ProcessId) {
        self.inner.remove(process_id);
    }

    pub fn get(&self, process_id: &ProcessId) -> Option<TaskManagerHandle> {
        self.inner.get(process_id).map(|entry| entry.value().clone())
    }
}

/// Per-process state machine driving every task from dispatch to
/// completion, including retry and recovery.
///
/// Runs as an actor: one spawned loop drains the mailbox, so all state
/// mutations serialize. The log-then-post ordering is part of the algorithm;
/// a failed post never loses a task because the log still holds its entry.
pub struct TaskManager {
    process_id: ProcessId,
    dependencies: Vec<String>,
    log: Arc<ReplicatedTaskLog>,
    pool: Arc<WorkerPool>,
    membership: Arc<MembershipService>,
    http_client: reqwest::Client,
    retry_requested: HashSet<TaskId>,
    processing: HashSet<TaskId>,
    scheduler: Option<SchedulerHandle>,
    self_tx: mpsc::UnboundedSender<TaskManagerMsg>,
}

impl TaskManager {
    pub fn spawn(
        process_id: ProcessId,
        dependencies: Vec<String>,
        log: Arc<ReplicatedTaskLog>,
        pool: Arc<WorkerPool>,
        membership: Arc<MembershipService>,
    ) -> TaskManagerHandle {
        let (tx, rx) = mpsc::unbounded_channel();

        let manager = TaskManager {
            process_id,
            dependencies,
            log,
            pool,
            membership,
            http_client: reqwest::Client::new(),
            retry_requested: HashSet::new(),
            processing: HashSet::new(),
            scheduler: None,
            self_tx: tx.clone(),
        };

        tokio::spawn(manager.run(rx));

        TaskManagerHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<TaskManagerMsg>) {
        tracing::debug!("Task manager for {:?} started", self.process_id);

        while let Some(msg) = rx.recv().await {
            if matches!(msg, TaskManagerMsg::Stop) {
                break;
            }
            self.handle(msg).await;
        }

        tracing::debug!("Task manager for {:?} stopped", self.process_id);
    }

    async fn handle(&mut self, msg: TaskManagerMsg) {
        match msg {
            TaskManagerMsg::CreateRootTask {
                reply,
                process_id,
                body,
            } => {
                let worker = match self.pool.select() {
                    Some(worker) => worker,
                    None => {
                        self.requeue(TaskManagerMsg::CreateRootTask {
                            reply,
                            process_id,
                            body,
                        });
                        return;
                    }
                };

                let task_id = TaskId::new();
                let payload = self.payload(process_id, task_id.clone(), None, body);
                let entry = TaskLogEntry {
                    task_id: task_id.clone(),
                    parent_task_id: None,
                    worker: worker.id.clone(),
                    payload: payload.clone(),
                };

                match self.log.log(vec![entry], ReplicationMode::Sync).await {
                    Ok(()) => {
                        let _ = reply.send(Ok(task_id));
                        self.post_task(worker, payload).await;
                    }
                    Err(e) => {
                        tracing::error!("Failed to log root task: {}", e);
                        let _ = reply.send(Err(e));
                    }
                }
            }

            TaskManagerMsg::CreateTasks {
                reply,
                process_id,
                parent_task_id,
                bodies,
            } => {
                let workers = match self.pool.select_many(bodies.len()) {
                    Some(workers) => workers,
                    None => {
                        self.requeue(TaskManagerMsg::CreateTasks {
                            reply,
                            process_id,
                            parent_task_id,
                            bodies,
                        });
                        return;
                    }
                };

                let mut entries = Vec::with_capacity(bodies.len());
                let mut posts = Vec::with_capacity(bodies.len());
                for (worker, body) in workers.into_iter().zip(bodies) {
                    let task_id = TaskId::new();
                    let payload = self.payload(
                        process_id.clone(),
                        task_id.clone(),
                        Some(parent_task_id.clone()),
                        body,
                    );
                    entries.push(TaskLogEntry {
                        task_id,
                        parent_task_id: Some(parent_task_id.clone()),
                        worker: worker.id.clone(),
                        payload: payload.clone(),
                    });
                    posts.push((worker, payload));
                }

                // Children are logged before the parent is unlogged. A crash
                // between the two leaves both logged, and recovery reissues
                // the parent, which is idempotent from the scheduler's view.
                match self.log.log(entries.clone(), ReplicationMode::Sync).await {
                    Ok(()) => {
                        let _ = self
                            .log
                            .unlog(vec![parent_task_id], ReplicationMode::Async)
                            .await;

                        let ids = entries.iter().map(|e| e.task_id.clone()).collect();
                        let _ = reply.send(Ok(ids));

                        for (worker, payload) in posts {
                            self.post_task(worker, payload).await;
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to log child tasks: {}", e);
                        let _ = reply.send(Err(e));
                    }
                }
            }

            TaskManagerMsg::LeafTaskComplete { task_id } => {
                self.processing.remove(&task_id);
                let _ = self
                    .log
                    .unlog(vec![task_id], ReplicationMode::Async)
                    .await;
            }

            TaskManagerMsg::FinalTaskComplete { reply, task_id } => {
                self.processing.remove(&task_id);
                let result = self.log.unlog(vec![task_id], ReplicationMode::Sync).await;
                let _ = reply.send(result);
            }

            TaskManagerMsg::TaskResult { header, outcome } => {
                if !self.log.is_logged(&header.task_id) {
                    tracing::warn!(
                        "Dropping result for unlogged task {:?} (duplicate or cancelled)",
                        header.task_id
                    );
                    return;
                }

                self.processing.insert(header.task_id.clone());

                match &self.scheduler {
                    Some(scheduler) => scheduler.task_result(header, outcome),
                    None => {
                        tracing::error!(
                            "Result for {:?} arrived before the scheduler was wired",
                            header.task_id
                        );
                    }
                }
            }

            TaskManagerMsg::RetryTask { task_id, payload } => {
                if !self.retry_requested.contains(&task_id) {
                    tracing::debug!("Ignoring duplicate retry for {:?}", task_id);
                    return;
                }

                let worker = match self.pool.select() {
                    Some(worker) => worker,
                    None => {
                        self.requeue(TaskManagerMsg::RetryTask { task_id, payload });
                        return;
                    }
                };

                let entry = TaskLogEntry {
                    task_id: task_id.clone(),
                    parent_task_id: payload.parent_task_id.clone(),
                    worker: worker.id.clone(),
                    payload: payload.clone(),
                };

                match self.log.log(vec![entry], ReplicationMode::Sync).await {
                    Ok(()) => {
                        self.retry_requested.remove(&task_id);
                        self.post_task(worker, payload).await;
                    }
                    Err(e) => {
                        tracing::error!("Failed to relog {:?} for retry: {}", task_id, e);
                        self.requeue(TaskManagerMsg::RetryTask { task_id, payload });
                    }
                }
            }

            TaskManagerMsg::Recover { worker } => {
                let orphaned = self.log.retrieve_by_worker(&worker);
                tracing::info!(
                    "Recovering {} task(s) from failed worker {:?}",
                    orphaned.len(),
                    worker
                );

                for entry in orphaned {
                    if entry.payload.process_id != self.process_id {
                        continue;
                    }
                    // A task whose result is already being settled does not
                    // need reissue; only its completion is pending.
                    if self.processing.contains(&entry.task_id) {
                        continue;
                    }
                    // At most one recovery attempt in flight per task.
                    if !self.retry_requested.insert(entry.task_id.clone()) {
                        continue;
                    }
                    let _ = self.self_tx.send(TaskManagerMsg::RetryTask {
                        task_id: entry.task_id,
                        payload: entry.payload,
                    });
                }
            }

            TaskManagerMsg::CancelSiblingTasks { reply, task_id } => {
                let siblings = self.log.sibling_tasks(&task_id);
                let result = self.cancel_entries(siblings).await;
                let _ = reply.send(result);
            }

            TaskManagerMsg::CancelProcessTasks { reply } => {
                let entries = self.log.retrieve_by_process(&self.process_id);
                let result = self.cancel_entries(entries).await;
                self.retry_requested.clear();
                self.processing.clear();
                let _ = reply.send(result);
            }

            TaskManagerMsg::IsValidTask { reply, task_id } => {
                let _ = reply.send(self.log.is_logged(&task_id));
            }

            TaskManagerMsg::GetActiveTaskCount { reply } => {
                let _ = reply.send(self.log.retrieve_by_process(&self.process_id).len());
            }

            TaskManagerMsg::SetScheduler(scheduler) => {
                self.scheduler = Some(scheduler);
            }

            TaskManagerMsg::Stop => {}
        }
    }

    fn payload(
        &self,
        process_id: ProcessId,
        task_id: TaskId,
        parent_task_id: Option<TaskId>,
        body: serde_json::Value,
    ) -> TaskPayload {
        TaskPayload {
            process_id,
            task_id,
            parent_task_id,
            body,
            dependencies: self.dependencies.clone(),
        }
    }

    /// Re-enqueues a message to our own mailbox after a bounded backoff.
    /// Keeps the actor responsive instead of blocking on a resource.
    fn requeue(&self, msg: TaskManagerMsg) {
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(SELF_RETRY_BACKOFF).await;
            let _ = tx.send(msg);
        });
    }

    /// Unlogs a batch of entries, then cancels them on their workers. The
    /// unlog is synchronous; worker-side cancellation is best-effort and
    /// failures are logged, never propagated.
    async fn cancel_entries(&mut self, entries: Vec<TaskLogEntry>) -> Result<(), RuntimeError> {
        if entries.is_empty() {
            return Ok(());
        }

        let ids: Vec<TaskId> = entries.iter().map(|e| e.task_id.clone()).collect();
        self.log.unlog(ids.clone(), ReplicationMode::Sync).await?;

        for id in &ids {
            self.retry_requested.remove(id);
            self.processing.remove(id);
        }

        let mut by_worker: HashMap<NodeId, Vec<TaskId>> = HashMap::new();
        for entry in entries {
            by_worker.entry(entry.worker).or_default().push(entry.task_id);
        }

        for (worker_id, task_ids) in by_worker {
            let Some(node) = self.membership.get_member(&worker_id) else {
                continue;
            };
            let client = self.http_client.clone();
            let url = format!("http://{}{}", node.http_addr, ENDPOINT_CANCEL);
            tokio::spawn(async move {
                let request = CancelTasksRequest { task_ids };
                if let Err(e) = post_with_retry(&client, url, &request).await {
                    tracing::warn!("Cancellation on {:?} failed: {}", worker_id, e);
                }
            });
        }

        Ok(())
    }

    /// Sends `ExecuteTask` to the chosen worker. Always called after the
    /// task is logged: a failed post marks the task retry-pending and the
    /// log entry keeps it alive.
    async fn post_task(&mut self, worker: Node, payload: TaskPayload) {
        let url = format!("http://{}{}", worker.http_addr, ENDPOINT_EXECUTE);
        let request = ExecuteTaskRequest {
            payload: payload.clone(),
            origin: self.membership.local_node.http_addr,
        };

        match post_with_retry(&self.http_client, url, &request).await {
            Ok(()) => {
                tracing::debug!("Posted task {:?} to {:?}", payload.task_id, worker.id);
            }
            Err(e) => {
                tracing::warn!(
                    "Posting task {:?} to {:?} failed, scheduling retry: {}",
                    payload.task_id,
                    worker.id,
                    e
                );
                self.retry_requested.insert(payload.task_id.clone());
                let _ = self.self_tx.send(TaskManagerMsg::RetryTask {
                    task_id: payload.task_id.clone(),
                    payload,
                });
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
                    return Err(anyhow::anyhow!("request rejected: {}", resp.status()));
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
