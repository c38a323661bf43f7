//! Worker Runtime Module
//!
//! The executor side of the runtime: accepts dispatched payloads, runs leaf
//! handlers, unfolds composite bodies one level, reports outcomes back to
//! the origin task manager, and aborts work on cancellation. Execution is
//! idempotent-under-duplicate-delivery, not exactly-once: the origin's log
//! is the arbiter of which results count.
//!
//! ## Submodules
//! - **`registry`**: maps handler names to executable code.
//! - **`runtime`**: spawned-task execution with abort-based cancellation.
//! - **`protocol`**: the dispatch and cancellation DTOs.
//! - **`handlers`**: the axum endpoints.

pub mod handlers;
pub mod protocol;
pub mod registry;
pub mod runtime;
