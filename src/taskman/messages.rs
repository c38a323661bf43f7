use super::protocol::TaskOutcome;
use crate::errors::RuntimeError;
use crate::membership::types::NodeId;
use crate::scheduler::scheduler::SchedulerHandle;
use crate::tasklog::types::{ProcessId, TaskHeader, TaskId, TaskPayload};
use tokio::sync::oneshot;

/// The task manager's mailbox alphabet. One message is processed to
/// completion at a time; messages carrying a `reply` are acknowledged only
/// after their durability requirement is met.
pub enum TaskManagerMsg {
    /// Create the first task of a process. Acked after the log quorum.
    CreateRootTask {
        reply: oneshot::Sender<Result<TaskId, RuntimeError>>,
        process_id: ProcessId,
        body: serde_json::Value,
    },

    /// Create 1..N children of `parent_task_id`. Children are logged before
    /// the parent is unlogged; the ack covers the child log only.
    CreateTasks {
        reply: oneshot::Sender<Result<Vec<TaskId>, RuntimeError>>,
        process_id: ProcessId,
        parent_task_id: TaskId,
        bodies: Vec<serde_json::Value>,
    },

    /// A terminal leaf with no children; just unlog.
    LeafTaskComplete { task_id: TaskId },

    /// Root completion; unlog is synchronous so completion is durable.
    FinalTaskComplete {
        reply: oneshot::Sender<Result<(), RuntimeError>>,
        task_id: TaskId,
    },

    /// Forwarded from a worker. Relayed to the scheduler iff still logged.
    TaskResult {
        header: TaskHeader,
        outcome: TaskOutcome,
    },

    /// Reissue a task on a fresh worker. Ignored unless the id is pending
    /// retry (duplicate-retry suppression).
    RetryTask { task_id: TaskId, payload: TaskPayload },

    /// A worker died; requeue everything it held that is not already being
    /// processed.
    Recover { worker: NodeId },

    /// Choice semantics: unlog all tasks sharing `task_id`'s parent and
    /// cancel them on their workers.
    CancelSiblingTasks {
        reply: oneshot::Sender<Result<(), RuntimeError>>,
        task_id: TaskId,
    },

    /// Kill cascade: unlog every task of this process and cancel them on
    /// their workers.
    CancelProcessTasks {
        reply: oneshot::Sender<Result<(), RuntimeError>>,
    },

    /// Exposes `is_logged` to workers (zombie short-circuit).
    IsValidTask {
        reply: oneshot::Sender<bool>,
        task_id: TaskId,
    },

    GetActiveTaskCount { reply: oneshot::Sender<usize> },

    /// Second phase of the manager/scheduler wiring.
    SetScheduler(SchedulerHandle),

    /// Ends the actor loop. Sent by the process manager at deactivation;
    /// the scheduler's mailbox closes transitively once the manager drops
    /// its handle.
    Stop,
}
