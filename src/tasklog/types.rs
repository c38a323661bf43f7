use crate::membership::types::NodeId;
use serde::{Deserialize, Serialize};

/// Cluster-unique identifier of a user-submitted process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub String);

impl ProcessId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Globally unique identifier of a single task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// `(ProcessId, TaskId)` header carried on every task-related wire message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TaskHeader {
    pub process_id: ProcessId,
    pub task_id: TaskId,
}

/// The unit of work shipped to a worker.
///
/// The body is opaque to the log and the task manager; only the scheduler
/// and the worker runtime interpret it. The dependency manifest is likewise
/// an opaque list of assembly ids observed but never inspected here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskPayload {
    pub process_id: ProcessId,
    pub task_id: TaskId,
    pub parent_task_id: Option<TaskId>,
    pub body: serde_json::Value,
    pub dependencies: Vec<String>,
}

/// One outstanding task: the payload plus the worker currently responsible
/// for it. Exactly one entry exists per in-flight task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskLogEntry {
    pub task_id: TaskId,
    pub parent_task_id: Option<TaskId>,
    pub worker: NodeId,
    pub payload: TaskPayload,
}

/// Durability directive attached to every log mutation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReplicationMode {
    /// Fire-and-forget to replica peers; local apply only is guaranteed.
    Async,
    /// Ack only after the configured number of replica peers acknowledged.
    Sync,
}
