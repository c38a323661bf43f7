use super::protocol::*;
use super::registry::TaskHandlerRegistry;
use crate::scheduler::body::ComputationBody;
use crate::tasklog::types::{TaskId, TaskPayload};
use crate::taskman::protocol::{
    GroupMode, IsValidResponse, TaskOutcome, TaskResultRequest, ENDPOINT_TASK_RESULT,
    ENDPOINT_TASK_VALID,
};
use crate::tasklog::types::TaskHeader;

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;

/// Worker-side execution runtime.
///
/// Accepts `ExecuteTask` dispatches, runs them on spawned tasks tracked by
/// id so cancellation can abort them, and posts the outcome back to the
/// origin task manager. Delivery is at-least-once end to end: the origin
/// drops results for tasks it no longer has logged.
pub struct WorkerRuntime {
    registry: Arc<TaskHandlerRegistry>,
    running: DashMap<TaskId, tokio::task::JoinHandle<()>>,
    http_client: reqwest::Client,
}

impl WorkerRuntime {
    pub fn new(registry: Arc<TaskHandlerRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            running: DashMap::new(),
            http_client: reqwest::Client::new(),
        })
    }

    /// Accepts a dispatched task. Returns immediately; the work happens on
    /// a spawned task so the dispatch HTTP call never blocks on user code.
    pub fn execute(self: &Arc<Self>, request: ExecuteTaskRequest) {
        let task_id = request.payload.task_id.clone();
        let runtime = self.clone();

        let handle = tokio::spawn(async move {
            runtime.run_task(request.payload, request.origin).await;
        });

        self.running.insert(task_id.clone(), handle);

        // The spawned task may already have finished (and missed its own
        // cleanup because the insert had not happened yet).
        let finished = self
            .running
            .get(&task_id)
            .map(|handle| handle.is_finished())
            .unwrap_or(false);
        if finished {
            self.running.remove(&task_id);
        }
    }

    async fn run_task(self: Arc<Self>, payload: TaskPayload, origin: SocketAddr) {
        let task_id = payload.task_id.clone();

        // Zombie short-circuit: a task unlogged since dispatch (cancelled,
        // or completed by another worker after a spurious retry) is not
        // worth executing. An unreachable origin is treated as valid; the
        // origin's duplicate filter is the real gate.
        if !self.probe_validity(&payload, origin).await {
            tracing::info!("Skipping zombie task {:?}", task_id);
            self.running.remove(&task_id);
            return;
        }

        let outcome = evaluate(&self.registry, &payload.body).await;

        let request = TaskResultRequest {
            header: TaskHeader {
                process_id: payload.process_id.clone(),
                task_id: task_id.clone(),
            },
            outcome,
        };

        let url = format!("http://{}{}", origin, ENDPOINT_TASK_RESULT);
        if let Err(e) = post_with_retry(&self.http_client, url, &request).await {
            // The log entry survives on the origin; recovery will reissue.
            tracing::warn!("Failed to report result for {:?}: {}", task_id, e);
        }

        self.running.remove(&task_id);
    }

    async fn probe_validity(&self, payload: &TaskPayload, origin: SocketAddr) -> bool {
        let url = format!(
            "http://{}{}/{}/{}",
            origin, ENDPOINT_TASK_VALID, payload.process_id.0, payload.task_id.0
        );

        let response = self
            .http_client
            .get(url)
            .timeout(std::time::Duration::from_millis(500))
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => match resp.json::<IsValidResponse>().await {
                Ok(body) => body.valid,
                Err(_) => true,
            },
            _ => true,
        }
    }

    /// Best-effort cancellation: abort whatever is still running. A task
    /// that already posted its result is unaffected; the origin drops that
    /// result because the entry is unlogged.
    pub fn cancel(&self, task_ids: &[TaskId]) -> usize {
        let mut cancelled = 0;
        for task_id in task_ids {
            if let Some((_, handle)) = self.running.remove(task_id) {
                handle.abort();
                cancelled += 1;
                tracing::debug!("Aborted task {:?}", task_id);
            }
        }
        cancelled
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }
}

/// Evaluates one body one level deep: leaves run through the registry,
/// composites unfold into a spawn request for the scheduler.
pub async fn evaluate(
    registry: &Arc<TaskHandlerRegistry>,
    body: &serde_json::Value,
) -> TaskOutcome {
    let parsed = match ComputationBody::parse(body) {
        Ok(parsed) => parsed,
        Err(e) => return TaskOutcome::Fault(e.to_string()),
    };

    match parsed {
        ComputationBody::Leaf { handler, payload } => {
            match registry.execute(&handler, payload).await {
                Ok(value) => TaskOutcome::Value(value),
                Err(e) => TaskOutcome::Fault(e.to_string()),
            }
        }
        ComputationBody::Parallel { children } => {
            if children.is_empty() {
                return TaskOutcome::Value(serde_json::Value::Array(vec![]));
            }
            TaskOutcome::Spawn {
                mode: GroupMode::Parallel,
                children: children.iter().map(|child| child.to_value()).collect(),
            }
        }
        ComputationBody::Choice { children } => {
            if children.is_empty() {
                return TaskOutcome::Fault("choice with no branches".to_string());
            }
            TaskOutcome::Spawn {
                mode: GroupMode::Choice,
                children: children.iter().map(|child| child.to_value()).collect(),
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
