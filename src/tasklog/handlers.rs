//! HTTP handlers for the replica side of the task log.
//!
//! Origins push `LogMutation`s here; a replica that detected a gap it could
//! not fill pulls the full dump and rebuilds.

use super::log::ReplicatedTaskLog;
use super::protocol::*;

use axum::{Extension, Json, http::StatusCode};
use std::sync::Arc;

pub async fn handle_log_replicate(
    Extension(log): Extension<Arc<ReplicatedTaskLog>>,
    Json(mutation): Json<LogMutation>,
) -> (StatusCode, Json<ReplicateLogResponse>) {
    let applied = log.apply_mutation(mutation);
    (StatusCode::OK, Json(ReplicateLogResponse { applied }))
}

pub async fn handle_log_dump(
    Extension(log): Extension<Arc<ReplicatedTaskLog>>,
) -> (StatusCode, Json<LogDumpResponse>) {
    (
        StatusCode::OK,
        Json(LogDumpResponse {
            entries: log.dump(),
        }),
    )
}
