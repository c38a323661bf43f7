//! Client ↔ Process Manager Wire Protocol
//!
//! One endpoint, one tagged request union, one tagged reply union. Every
//! request carries a correlation id that is echoed on the reply. Replies are
//! either `Value` (operation-specific JSON) or `Exception` (a message shaped
//! by the error-mapping policy).

use super::types::{AssemblyImage, ProcessImage, ProcessRecord};
use crate::tasklog::types::ProcessId;
use serde::{Deserialize, Serialize};

/// The client-facing API endpoint.
pub const ENDPOINT_PROCESS_API: &str = "/process/api";
/// Internal endpoint replica peers receive record mutations on.
pub const ENDPOINT_PROCESS_REPLICATE: &str = "/process/replicate";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ProcessRequest {
    CreateDynamicProcess {
        correlation_id: String,
        request_id: String,
        image: ProcessImage,
    },
    GetProcessInfo {
        correlation_id: String,
        process_id: ProcessId,
    },
    GetAllProcessInfo {
        correlation_id: String,
    },
    ClearProcessInfo {
        correlation_id: String,
        process_id: ProcessId,
    },
    ClearAllProcessInfo {
        correlation_id: String,
    },
    KillProcess {
        correlation_id: String,
        process_id: ProcessId,
    },
    RequestDependencies {
        correlation_id: String,
        dependencies: Vec<String>,
    },
    LoadAssemblies {
        correlation_id: String,
        assemblies: Vec<AssemblyImage>,
    },
    GetAssemblyLoadInfo {
        correlation_id: String,
        dependencies: Vec<String>,
    },
}

impl ProcessRequest {
    pub fn correlation_id(&self) -> &str {
        match self {
            ProcessRequest::CreateDynamicProcess { correlation_id, .. }
            | ProcessRequest::GetProcessInfo { correlation_id, .. }
            | ProcessRequest::GetAllProcessInfo { correlation_id }
            | ProcessRequest::ClearProcessInfo { correlation_id, .. }
            | ProcessRequest::ClearAllProcessInfo { correlation_id }
            | ProcessRequest::KillProcess { correlation_id, .. }
            | ProcessRequest::RequestDependencies { correlation_id, .. }
            | ProcessRequest::LoadAssemblies { correlation_id, .. }
            | ProcessRequest::GetAssemblyLoadInfo { correlation_id, .. } => correlation_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessReply {
    Value {
        correlation_id: String,
        value: serde_json::Value,
    },
    Exception {
        correlation_id: String,
        error: String,
    },
}

/// A replicated mutation of the process-record table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordMutation {
    pub op_id: String,
    pub op: RecordOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RecordOp {
    Upsert(ProcessRecord),
    Remove(ProcessId),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordReplicateResponse {
    pub applied: bool,
}
