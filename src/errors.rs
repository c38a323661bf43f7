//! Typed errors for the fault points of the runtime.
//!
//! Most internal plumbing uses `anyhow::Result`; the variants below exist for
//! the failures that have defined handling semantics at the protocol
//! boundary (client-visible replies, fault escalation, retry decisions).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The submitted process image is malformed. Surfaces to the client as a
    /// process that failed initialization.
    #[error("invalid submission: {0}")]
    InvalidSubmission(String),

    /// A synchronous replication round got fewer acknowledgements than the
    /// configured replication factor. Fatal for the owning process.
    #[error("replication broadcast failed: {acked} of {required} replicas acknowledged")]
    BroadcastFailure { acked: usize, required: usize },

    /// Too many replica peers lost; the task log can no longer guarantee
    /// durability of outstanding entries.
    #[error("task log corrupt: {lost} replica peers lost, failover factor is {failover}")]
    LogCorrupt { lost: usize, failover: usize },

    /// A per-process component could not be brought up. Client-visible but
    /// recoverable for the cluster.
    #[error("failed to activate {component}: {reason}")]
    ActivationFailure {
        component: &'static str,
        reason: String,
    },

    /// Transport-level failure talking to another node. Converted to a retry
    /// at dispatch sites, never surfaced to clients.
    #[error("communication failure with {addr}: {reason}")]
    Communication { addr: String, reason: String },

    /// Unrecoverable condition in the process-management plane.
    #[error("system failure: {0}")]
    SystemFailure(String),

    #[error("unknown process {0}")]
    ProcessNotFound(String),

    /// Returned for clear requests against a process that is still running.
    #[error("process {0} has not reached a terminal state")]
    ProcessStillActive(String),
}

impl RuntimeError {
    /// Whether this error must escalate to `triggerSystemFault` rather than
    /// being mapped to a typed client reply.
    pub fn is_system_fault(&self) -> bool {
        matches!(
            self,
            RuntimeError::BroadcastFailure { .. }
                | RuntimeError::LogCorrupt { .. }
                | RuntimeError::SystemFailure(_)
        )
    }
}
