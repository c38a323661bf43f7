//! Process Manager Module
//!
//! The admission plane: validates submissions, allocates process ids,
//! activates the per-process scheduler/task-manager pair, and exposes the
//! client-facing query and control surface. Owns the replicated table of
//! process records.
//!
//! ## Submodules
//! - **`types`**: records, images, states, the result envelope.
//! - **`monitor`**: the replicated record table.
//! - **`manager`**: the admission actor and its handles.
//! - **`protocol`**: the client wire protocol (tagged unions).
//! - **`handlers`**: the axum endpoints, including the error mapping.

pub mod handlers;
pub mod manager;
pub mod monitor;
pub mod protocol;
pub mod types;
