//! Task Manager Module
//!
//! The per-process state machine that owns every task from dispatch to
//! completion. One actor per process: it logs tasks before posting them,
//! converts worker failures into reissues, suppresses duplicate retries and
//! duplicate results, and serializes every log mutation it originates.
//!
//! ## Submodules
//! - **`messages`**: the mailbox alphabet.
//! - **`manager`**: the actor, its cloneable handle, and the directory the
//!   HTTP layer uses to route worker callbacks.
//! - **`protocol`**: worker-facing DTOs (results, validity probes).
//! - **`handlers`**: the axum endpoints backing those DTOs.

pub mod handlers;
pub mod manager;
pub mod messages;
pub mod protocol;

#[cfg(test)]
mod tests;
