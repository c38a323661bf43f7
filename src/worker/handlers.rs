//! HTTP handlers exposed on executor nodes.

use super::protocol::*;
use super::runtime::WorkerRuntime;

use axum::{Extension, Json, http::StatusCode};
use std::sync::Arc;

pub async fn handle_execute_task(
    Extension(runtime): Extension<Arc<WorkerRuntime>>,
    Json(request): Json<ExecuteTaskRequest>,
) -> (StatusCode, Json<ExecuteTaskResponse>) {
    tracing::debug!(
        "Accepted task {:?} from {}",
        request.payload.task_id,
        request.origin
    );
    runtime.execute(request);
    (StatusCode::OK, Json(ExecuteTaskResponse { accepted: true }))
}

pub async fn handle_cancel_tasks(
    Extension(runtime): Extension<Arc<WorkerRuntime>>,
    Json(request): Json<CancelTasksRequest>,
) -> (StatusCode, Json<CancelTasksResponse>) {
    let cancelled = runtime.cancel(&request.task_ids);
    tracing::info!(
        "Cancelled {} of {} requested task(s)",
        cancelled,
        request.task_ids.len()
    );
    (StatusCode::OK, Json(CancelTasksResponse { cancelled }))
}
