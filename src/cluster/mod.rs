//! Cluster Administration Module
//!
//! The node administration surface consumed by operator tooling: liveness,
//! deployment info, performance counters, topology control (attach, detach,
//! permissions, master boot), the cluster event log, and shutdown. Also the
//! sink for cluster-wide failure signals raised by the process manager.

pub mod handlers;
pub mod manager;
pub mod protocol;
pub mod types;
