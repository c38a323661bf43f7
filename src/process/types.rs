use crate::tasklog::types::ProcessId;
use serde::{Deserialize, Serialize};

/// Lifecycle of a process record.
///
/// Transitions are monotone along
/// `Initialized → Created → Running → (Completed | Failed | Killed)`;
/// `Recovering` is a transient overlay entered only from `Running` and left
/// back to it. A record in a terminal state never changes again.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProcessState {
    Initialized,
    Created,
    Running,
    Recovering,
    Completed,
    Failed,
    Killed,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessState::Completed | ProcessState::Failed | ProcessState::Killed
        )
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition(self, next: ProcessState) -> bool {
        if self == next {
            return false;
        }
        match (self, next) {
            (s, _) if s.is_terminal() => false,
            (ProcessState::Initialized, ProcessState::Created) => true,
            (ProcessState::Created, ProcessState::Running) => true,
            (ProcessState::Running, ProcessState::Recovering) => true,
            (ProcessState::Recovering, ProcessState::Running) => true,
            // Any live state may fail or be killed; completion requires Running.
            (_, ProcessState::Failed) | (_, ProcessState::Killed) => true,
            (ProcessState::Running, ProcessState::Completed) => true,
            (ProcessState::Recovering, ProcessState::Completed) => true,
            _ => false,
        }
    }
}

/// Terminal result envelope of a process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ExecuteResult {
    /// The submission never started executing (user error).
    InitError(String),
    /// User code faulted during execution.
    Fault(String),
    /// The computed value.
    Success(serde_json::Value),
    /// Killed on request; distinguishable from a fault.
    Killed,
}

/// What a client submits: everything needed to run a computation, with the
/// body and return-type descriptor left opaque to the control plane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessImage {
    pub name: String,
    pub body: serde_json::Value,
    pub return_type: String,
    pub type_name: String,
    pub client_id: String,
    pub dependencies: Vec<String>,
}

/// The persisted, replicated record of a process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessRecord {
    pub process_id: ProcessId,
    pub request_id: String,
    pub name: String,
    pub type_name: String,
    pub return_type: String,
    pub dependencies: Vec<String>,
    pub state: ProcessState,
    pub created_at_ms: u64,
    pub started_at_ms: Option<u64>,
    pub result: Option<ExecuteResult>,
}

impl ProcessRecord {
    pub fn new(process_id: ProcessId, request_id: String, image: &ProcessImage) -> Self {
        Self {
            process_id,
            request_id,
            name: image.name.clone(),
            type_name: image.type_name.clone(),
            return_type: image.return_type.clone(),
            dependencies: image.dependencies.clone(),
            state: ProcessState::Initialized,
            created_at_ms: now_ms(),
            started_at_ms: None,
            result: None,
        }
    }
}

/// Client-facing view: the record plus live execution counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub record: ProcessRecord,
    pub worker_count: usize,
    pub active_task_count: usize,
}

/// An uploaded assembly, opaque to the control plane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssemblyImage {
    pub id: String,
    pub name: String,
    pub blob: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssemblyLoadInfo {
    pub id: String,
    pub loaded: bool,
}

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
