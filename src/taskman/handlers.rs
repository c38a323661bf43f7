//! HTTP handlers for worker callbacks.
//!
//! Workers post task results here and probe task validity before spending
//! cycles on a possibly-cancelled execution. Both routes resolve the target
//! task manager through the `TaskManagerDirectory`.

use super::manager::TaskManagerDirectory;
use super::protocol::*;
use crate::tasklog::types::{ProcessId, TaskId};

use axum::{Extension, Json, extract::Path, http::StatusCode};
use std::sync::Arc;

pub async fn handle_task_result(
    Extension(directory): Extension<Arc<TaskManagerDirectory>>,
    Json(req): Json<TaskResultRequest>,
) -> (StatusCode, Json<TaskResultResponse>) {
    match directory.get(&req.header.process_id) {
        Some(manager) => {
            manager.task_result(req.header, req.outcome);
            (StatusCode::OK, Json(TaskResultResponse { accepted: true }))
        }
        None => {
            tracing::warn!(
                "Result for unknown process {:?} dropped",
                req.header.process_id
            );
            (
                StatusCode::NOT_FOUND,
                Json(TaskResultResponse { accepted: false }),
            )
        }
    }
}

pub async fn handle_is_valid_task(
    Extension(directory): Extension<Arc<TaskManagerDirectory>>,
    Path((process_id, task_id)): Path<(String, String)>,
) -> (StatusCode, Json<IsValidResponse>) {
    let valid = match directory.get(&ProcessId(process_id)) {
        Some(manager) => manager.is_valid_task(TaskId(task_id)).await,
        None => false,
    };

    (StatusCode::OK, Json(IsValidResponse { valid }))
}
