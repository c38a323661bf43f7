//! Worker Pool Module
//!
//! Load-balanced worker selection over the membership view, including the
//! atomic batch selection that parallel fan-outs require: a task group is
//! logged atomically, so its workers are reserved atomically too.

pub mod pool;
