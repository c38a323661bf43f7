//! Task Manager Network Protocol
//!
//! DTOs and endpoints served on the node hosting a task manager: workers
//! post results back here and query whether a task is still wanted.

use crate::tasklog::types::TaskHeader;
use serde::{Deserialize, Serialize};

/// Endpoint workers post `TaskResultRequest` to.
pub const ENDPOINT_TASK_RESULT: &str = "/taskman/result";
/// Endpoint workers query to short-circuit zombie executions
/// (`GET /taskman/valid/:process_id/:task_id`).
pub const ENDPOINT_TASK_VALID: &str = "/taskman/valid";

/// How a group of spawned children combines.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum GroupMode {
    /// All children must report; results aggregate in order.
    Parallel,
    /// First child to report wins; the rest are cancelled.
    Choice,
}

/// What a worker produced for one task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TaskOutcome {
    /// A leaf computed a value.
    Value(serde_json::Value),
    /// A composite node unfolded one level into child bodies.
    Spawn {
        mode: GroupMode,
        children: Vec<serde_json::Value>,
    },
    /// Execution failed in user code; fails the process.
    Fault(String),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskResultRequest {
    pub header: TaskHeader,
    pub outcome: TaskOutcome,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskResultResponse {
    pub accepted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IsValidResponse {
    pub valid: bool,
}
