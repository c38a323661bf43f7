//! Worker Network Protocol
//!
//! DTOs and endpoints served on executor nodes: the dispatch endpoint task
//! managers post payloads to, and the best-effort cancellation endpoint.

use crate::tasklog::types::{TaskId, TaskPayload};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

pub const ENDPOINT_EXECUTE: &str = "/worker/execute";
pub const ENDPOINT_CANCEL: &str = "/worker/cancel";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteTaskRequest {
    pub payload: TaskPayload,
    /// HTTP address of the node hosting the task manager; results and
    /// validity probes go back there.
    pub origin: SocketAddr,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecuteTaskResponse {
    pub accepted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelTasksRequest {
    pub task_ids: Vec<TaskId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelTasksResponse {
    pub cancelled: usize,
}
