//! Replicated Task Log Module
//!
//! The durable record of every task that has been dispatched but not yet
//! acknowledged complete; the recovery oracle. A task that is logged will
//! eventually complete: worker loss reassigns its entry, master-replica loss
//! is absorbed by quorum replication up to the failover factor.
//!
//! ## Submodules
//! - **`types`**: ids, payloads, log entries, the replication directive.
//! - **`log`**: the `ReplicatedTaskLog` itself (origin and replica roles).
//! - **`protocol`**: HTTP DTOs for pushing mutations to replica peers.
//! - **`handlers`**: the replica-side axum endpoints.

pub mod handlers;
pub mod log;
pub mod protocol;
pub mod types;

#[cfg(test)]
mod tests;
