//! Client-facing HTTP surface of the process manager.
//!
//! A single endpoint accepts the tagged request union and dispatches to the
//! manager actor. Error mapping happens here: activation failures stay
//! typed, system failures reply `SystemFailed`, and anything that escalated
//! (broadcast failure, log corruption) replies `SystemCorrupted`.

use super::manager::ProcessManagerHandle;
use super::monitor::ProcessMonitor;
use super::protocol::*;
use crate::errors::RuntimeError;

use axum::{Extension, Json, http::StatusCode};
use std::sync::Arc;

fn value_reply(correlation_id: &str, value: serde_json::Value) -> ProcessReply {
    ProcessReply::Value {
        correlation_id: correlation_id.to_string(),
        value,
    }
}

fn error_reply(correlation_id: &str, error: RuntimeError) -> ProcessReply {
    let message = match &error {
        RuntimeError::ActivationFailure { .. } => error.to_string(),
        RuntimeError::SystemFailure(_) => "SystemFailed".to_string(),
        e if e.is_system_fault() => "SystemCorrupted".to_string(),
        _ => error.to_string(),
    };

    ProcessReply::Exception {
        correlation_id: correlation_id.to_string(),
        error: message,
    }
}

fn json_or_error<T: serde::Serialize>(
    correlation_id: &str,
    result: Result<T, RuntimeError>,
) -> ProcessReply {
    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(value) => value_reply(correlation_id, value),
            Err(e) => error_reply(correlation_id, RuntimeError::SystemFailure(e.to_string())),
        },
        Err(e) => error_reply(correlation_id, e),
    }
}

pub async fn handle_process_api(
    Extension(manager): Extension<ProcessManagerHandle>,
    Json(request): Json<ProcessRequest>,
) -> (StatusCode, Json<ProcessReply>) {
    let correlation_id = request.correlation_id().to_string();

    let reply = match request {
        ProcessRequest::CreateDynamicProcess {
            request_id, image, ..
        } => json_or_error(
            &correlation_id,
            manager.create_dynamic_process(request_id, image).await,
        ),

        ProcessRequest::GetProcessInfo { process_id, .. } => {
            json_or_error(&correlation_id, manager.get_process_info(process_id).await)
        }

        ProcessRequest::GetAllProcessInfo { .. } => {
            let infos = manager.get_all_process_info().await;
            json_or_error(&correlation_id, Ok::<_, RuntimeError>(infos))
        }

        ProcessRequest::ClearProcessInfo { process_id, .. } => json_or_error(
            &correlation_id,
            manager.clear_process_info(process_id).await,
        ),

        ProcessRequest::ClearAllProcessInfo { .. } => {
            json_or_error(&correlation_id, manager.clear_all_process_info().await)
        }

        ProcessRequest::KillProcess { process_id, .. } => {
            json_or_error(&correlation_id, manager.kill_process(process_id).await)
        }

        ProcessRequest::RequestDependencies { dependencies, .. } => {
            let missing = manager.request_dependencies(dependencies).await;
            json_or_error(&correlation_id, Ok::<_, RuntimeError>(missing))
        }

        ProcessRequest::LoadAssemblies { assemblies, .. } => {
            let infos = manager.load_assemblies(assemblies).await;
            json_or_error(&correlation_id, Ok::<_, RuntimeError>(infos))
        }

        ProcessRequest::GetAssemblyLoadInfo { dependencies, .. } => {
            let infos = manager.get_assembly_load_info(dependencies).await;
            json_or_error(&correlation_id, Ok::<_, RuntimeError>(infos))
        }
    };

    (StatusCode::OK, Json(reply))
}

pub async fn handle_process_replicate(
    Extension(monitor): Extension<Arc<ProcessMonitor>>,
    Json(mutation): Json<RecordMutation>,
) -> (StatusCode, Json<RecordReplicateResponse>) {
    let applied = monitor.apply_mutation(mutation);
    (StatusCode::OK, Json(RecordReplicateResponse { applied }))
}
