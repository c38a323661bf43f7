//! Task Log Network Protocol
//!
//! DTOs and endpoints for replicating log mutations from the origin (the
//! node hosting a task manager) to its replica peers, and for pulling a full
//! dump when a replica needs to resynchronize.

use super::types::{TaskId, TaskLogEntry};
use crate::membership::types::NodeId;
use serde::{Deserialize, Serialize};

/// Endpoint for applying a single log mutation on a replica.
pub const ENDPOINT_LOG_REPLICATE: &str = "/tasklog/replicate";
/// Endpoint for pulling the full replica state (resync after a gap).
pub const ENDPOINT_LOG_DUMP: &str = "/tasklog/dump";

/// A single mutation of the task log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum LogOp {
    /// Append (or overwrite, keyed by `TaskId`) one or more entries.
    Append(Vec<TaskLogEntry>),
    /// Remove entries; missing ids are ignored.
    Remove(Vec<TaskId>),
}

/// Replication envelope for a mutation.
///
/// `seq` is a per-origin sequence number: replicas apply mutations from one
/// origin strictly in sequence order, which preserves the submission order
/// of the owning task manager. `op_id` allows retried deliveries to be
/// dropped as duplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMutation {
    pub op_id: String,
    pub origin: NodeId,
    pub seq: u64,
    pub op: LogOp,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReplicateLogResponse {
    pub applied: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogDumpResponse {
    pub entries: Vec<TaskLogEntry>,
}
