use super::monitor::ProcessMonitor;
use super::types::*;
use crate::cluster::manager::ClusterManager;
use crate::errors::RuntimeError;
use crate::membership::{service::MembershipService, types::NodeId, types::Permissions};
use crate::pool::pool::WorkerPool;
use crate::scheduler::body::ComputationBody;
use crate::scheduler::scheduler::{Scheduler, SchedulerHandle};
use crate::tasklog::log::ReplicatedTaskLog;
use crate::tasklog::types::{ProcessId, ReplicationMode};
use crate::taskman::manager::{TaskManager, TaskManagerDirectory, TaskManagerHandle};

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

pub enum ProcessManagerMsg {
    CreateDynamicProcess {
        reply: oneshot::Sender<Result<ProcessRecord, RuntimeError>>,
        request_id: String,
        image: ProcessImage,
    },
    GetProcessInfo {
        reply: oneshot::Sender<Result<ProcessInfo, RuntimeError>>,
        process_id: ProcessId,
    },
    GetAllProcessInfo {
        reply: oneshot::Sender<Vec<ProcessInfo>>,
    },
    KillProcess {
        reply: oneshot::Sender<Result<ProcessRecord, RuntimeError>>,
        process_id: ProcessId,
    },
    ClearProcessInfo {
        reply: oneshot::Sender<Result<(), RuntimeError>>,
        process_id: ProcessId,
    },
    ClearAllProcessInfo {
        reply: oneshot::Sender<Result<usize, RuntimeError>>,
    },
    RequestDependencies {
        reply: oneshot::Sender<Vec<String>>,
        dependencies: Vec<String>,
    },
    LoadAssemblies {
        reply: oneshot::Sender<Vec<AssemblyLoadInfo>>,
        assemblies: Vec<AssemblyImage>,
    },
    GetAssemblyLoadInfo {
        reply: oneshot::Sender<Vec<AssemblyLoadInfo>>,
        dependencies: Vec<String>,
    },
    /// Side channel from a scheduler: the terminal result of a process.
    ProcessResult {
        process_id: ProcessId,
        result: ExecuteResult,
    },
    /// Side channel from a scheduler: an unrecoverable replication or
    /// wiring failure underneath a process.
    ProcessFaulted {
        process_id: ProcessId,
        reason: String,
    },
    /// A worker died; fan the recovery signal out to every live process.
    WorkerFailed(NodeId),
}

/// Cloneable mailbox handle for the process manager.
#[derive(Clone)]
pub struct ProcessManagerHandle {
    tx: mpsc::UnboundedSender<ProcessManagerMsg>,
}

impl ProcessManagerHandle {
    pub async fn create_dynamic_process(
        &self,
        request_id: String,
        image: ProcessImage,
    ) -> Result<ProcessRecord, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(ProcessManagerMsg::CreateDynamicProcess {
            reply,
            request_id,
            image,
        });
        rx.await
            .unwrap_or_else(|_| Err(RuntimeError::SystemFailure("process manager gone".into())))
    }

    pub async fn get_process_info(
        &self,
        process_id: ProcessId,
    ) -> Result<ProcessInfo, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(ProcessManagerMsg::GetProcessInfo { reply, process_id });
        rx.await
            .unwrap_or_else(|_| Err(RuntimeError::SystemFailure("process manager gone".into())))
    }

    pub async fn get_all_process_info(&self) -> Vec<ProcessInfo> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(ProcessManagerMsg::GetAllProcessInfo { reply });
        rx.await.unwrap_or_default()
    }

    pub async fn kill_process(&self, process_id: ProcessId) -> Result<ProcessRecord, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(ProcessManagerMsg::KillProcess { reply, process_id });
        rx.await
            .unwrap_or_else(|_| Err(RuntimeError::SystemFailure("process manager gone".into())))
    }

    pub async fn clear_process_info(&self, process_id: ProcessId) -> Result<(), RuntimeError> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(ProcessManagerMsg::ClearProcessInfo { reply, process_id });
        rx.await
            .unwrap_or_else(|_| Err(RuntimeError::SystemFailure("process manager gone".into())))
    }

    pub async fn clear_all_process_info(&self) -> Result<usize, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(ProcessManagerMsg::ClearAllProcessInfo { reply });
        rx.await
            .unwrap_or_else(|_| Err(RuntimeError::SystemFailure("process manager gone".into())))
    }

    pub async fn request_dependencies(&self, dependencies: Vec<String>) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(ProcessManagerMsg::RequestDependencies {
            reply,
            dependencies,
        });
        rx.await.unwrap_or_default()
    }

    pub async fn load_assemblies(&self, assemblies: Vec<AssemblyImage>) -> Vec<AssemblyLoadInfo> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(ProcessManagerMsg::LoadAssemblies { reply, assemblies });
        rx.await.unwrap_or_default()
    }

    pub async fn get_assembly_load_info(&self, dependencies: Vec<String>) -> Vec<AssemblyLoadInfo> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(ProcessManagerMsg::GetAssemblyLoadInfo {
            reply,
            dependencies,
        });
        rx.await.unwrap_or_default()
    }

    pub fn worker_failed(&self, worker: NodeId) {
        let _ = self.tx.send(ProcessManagerMsg::WorkerFailed(worker));
    }

    /// The side channel schedulers publish terminal results on.
    pub fn result_sink(&self) -> ResultSink {
        ResultSink {
            tx: self.tx.clone(),
        }
    }
}

/// Write-only view of the process manager's mailbox handed to schedulers.
#[derive(Clone)]
pub struct ResultSink {
    tx: mpsc::UnboundedSender<ProcessManagerMsg>,
}

impl ResultSink {
    #[cfg(test)]
    pub(crate) fn from_channel(tx: mpsc::UnboundedSender<ProcessManagerMsg>) -> Self {
        Self { tx }
    }

    pub fn publish_result(&self, process_id: ProcessId, result: ExecuteResult) {
        let _ = self
            .tx
            .send(ProcessManagerMsg::ProcessResult { process_id, result });
    }

    pub fn publish_system_fault(&self, process_id: ProcessId, reason: String) {
        let _ = self
            .tx
            .send(ProcessManagerMsg::ProcessFaulted { process_id, reason });
    }
}

struct ActiveProcess {
    taskman: TaskManagerHandle,
    #[allow(dead_code)]
    scheduler: SchedulerHandle,
}

/// Cluster-singleton admission controller.
///
/// Validates submissions, allocates process ids, activates the per-process
/// scheduler/task-manager pair, and answers every client-facing query. All
/// failures are caught here and mapped per the error policy; the one
/// deliberate escalation is `trigger_system_fault`, which deactivates the
/// manager and signals cluster-wide failure.
pub struct ProcessManager {
    monitor: Arc<ProcessMonitor>,
    log: Arc<ReplicatedTaskLog>,
    pool: Arc<WorkerPool>,
    membership: Arc<MembershipService>,
    directory: Arc<TaskManagerDirectory>,
    cluster: Arc<ClusterManager>,
    assemblies: DashMap<String, AssemblyImage>,
    active: HashMap<ProcessId, ActiveProcess>,
    faulted: bool,
    self_tx: mpsc::UnboundedSender<ProcessManagerMsg>,
}

impl ProcessManager {
    pub fn spawn(
        monitor: Arc<ProcessMonitor>,
        log: Arc<ReplicatedTaskLog>,
        pool: Arc<WorkerPool>,
        membership: Arc<MembershipService>,
        directory: Arc<TaskManagerDirectory>,
        cluster: Arc<ClusterManager>,
    ) -> ProcessManagerHandle {
        let (tx, rx) = mpsc::unbounded_channel();

        let manager = ProcessManager {
            monitor,
            log,
            pool,
            membership,
            directory,
            cluster,
            assemblies: DashMap::new(),
            active: HashMap::new(),
            faulted: false,
            self_tx: tx.clone(),
        };

        tokio::spawn(manager.run(rx));

        ProcessManagerHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ProcessManagerMsg>) {
        tracing::info!("Process manager started");

        while let Some(msg) = rx.recv().await {
            self.handle(msg).await;
            if self.faulted {
                break;
            }
        }

        tracing::warn!("Process manager deactivated");
    }

    async fn handle(&mut self, msg: ProcessManagerMsg) {
        match msg {
            ProcessManagerMsg::CreateDynamicProcess {
                reply,
                request_id,
                image,
            } => {
                let result = self.create_dynamic_process(request_id, image).await;
                if let Err(e) = &result {
                    if e.is_system_fault() {
                        self.trigger_system_fault(&e.to_string());
                    }
                }
                let _ = reply.send(result);
            }

            ProcessManagerMsg::GetProcessInfo { reply, process_id } => {
                let _ = reply.send(self.process_info(process_id).await);
            }

            ProcessManagerMsg::GetAllProcessInfo { reply } => {
                let mut infos = Vec::new();
                for record in self.monitor.all() {
                    if let Ok(info) = self.process_info(record.process_id.clone()).await {
                        infos.push(info);
                    }
                }
                let _ = reply.send(infos);
            }

            ProcessManagerMsg::KillProcess { reply, process_id } => {
                let result = self.kill_process(process_id).await;
                if let Err(e) = &result {
                    if e.is_system_fault() {
                        self.trigger_system_fault(&e.to_string());
                    }
                }
                let _ = reply.send(result);
            }

            ProcessManagerMsg::ClearProcessInfo { reply, process_id } => {
                let _ = reply.send(self.monitor.clear(&process_id).await);
            }

            ProcessManagerMsg::ClearAllProcessInfo { reply } => {
                let _ = reply.send(self.monitor.clear_all().await);
            }

            ProcessManagerMsg::RequestDependencies {
                reply,
                dependencies,
            } => {
                let missing = dependencies
                    .into_iter()
                    .filter(|id| !self.assemblies.contains_key(id))
                    .collect();
                let _ = reply.send(missing);
            }

            ProcessManagerMsg::LoadAssemblies { reply, assemblies } => {
                let mut infos = Vec::with_capacity(assemblies.len());
                for assembly in assemblies {
                    infos.push(AssemblyLoadInfo {
                        id: assembly.id.clone(),
                        loaded: true,
                    });
                    self.assemblies.insert(assembly.id.clone(), assembly);
                }
                let _ = reply.send(infos);
            }

            ProcessManagerMsg::GetAssemblyLoadInfo {
                reply,
                dependencies,
            } => {
                let infos = dependencies
                    .into_iter()
                    .map(|id| AssemblyLoadInfo {
                        loaded: self.assemblies.contains_key(&id),
                        id,
                    })
                    .collect();
                let _ = reply.send(infos);
            }

            ProcessManagerMsg::ProcessResult { process_id, result } => {
                match self
                    .monitor
                    .set_result(&process_id, result, ReplicationMode::Async)
                    .await
                {
                    Ok(true) => self.deactivate(&process_id),
                    Ok(false) => {
                        tracing::debug!(
                            "Late result for {:?} ignored (already terminal)",
                            process_id
                        );
                    }
                    Err(e) => tracing::warn!("Failed to persist result: {}", e),
                }
            }

            ProcessManagerMsg::ProcessFaulted { process_id, reason } => {
                let _ = self
                    .monitor
                    .set_result(
                        &process_id,
                        ExecuteResult::Fault(format!("system fault: {}", reason)),
                        ReplicationMode::Async,
                    )
                    .await;
                self.deactivate(&process_id);
                self.trigger_system_fault(&reason);
            }

            ProcessManagerMsg::WorkerFailed(worker) => {
                tracing::info!(
                    "Propagating failure of {:?} to {} live process(es)",
                    worker,
                    self.active.len()
                );
                for pair in self.active.values() {
                    pair.taskman.recover(worker.clone());
                }
            }
        }
    }

    async fn create_dynamic_process(
        &mut self,
        request_id: String,
        image: ProcessImage,
    ) -> Result<ProcessRecord, RuntimeError> {
        // Idempotent per request id: concurrent duplicate submissions land
        // here serially and the second one sees the first one's record.
        if let Some(existing) = self.monitor.lookup_request(&request_id) {
            tracing::info!(
                "Duplicate submission {} resolved to {:?}",
                request_id,
                existing.process_id
            );
            return Ok(existing);
        }

        if !self
            .membership
            .local_node
            .permissions
            .allows(Permissions::MASTER)
        {
            return Err(RuntimeError::ActivationFailure {
                component: "process manager",
                reason: "local node lacks the Master permission".into(),
            });
        }

        let process_id = ProcessId::new();
        let mut record = ProcessRecord::new(process_id.clone(), request_id, &image);

        // User errors fail the process, not the cluster: the record is
        // persisted in its terminal state and returned to the client.
        if let Err(e) = ComputationBody::parse(&image.body) {
            record.state = ProcessState::Failed;
            record.result = Some(ExecuteResult::InitError(e.to_string()));
            self.monitor
                .insert(record.clone(), ReplicationMode::Sync)
                .await?;
            return Ok(record);
        }

        self.monitor
            .insert(record.clone(), ReplicationMode::Sync)
            .await?;

        let taskman = TaskManager::spawn(
            process_id.clone(),
            image.dependencies.clone(),
            self.log.clone(),
            self.pool.clone(),
            self.membership.clone(),
        );
        let sink = ResultSink {
            tx: self.self_tx.clone(),
        };
        let scheduler = Scheduler::spawn(process_id.clone(), taskman.clone(), sink);
        taskman.set_scheduler(scheduler.clone());

        self.directory.register(process_id.clone(), taskman.clone());
        self.active.insert(
            process_id.clone(),
            ActiveProcess { taskman, scheduler: scheduler.clone() },
        );

        self.monitor
            .set_state(&process_id, ProcessState::Created)
            .await;

        scheduler.new_process(process_id.clone(), image.body);

        self.monitor
            .set_state(&process_id, ProcessState::Running)
            .await;

        self.monitor
            .get(&process_id)
            .ok_or_else(|| RuntimeError::SystemFailure("record vanished after admit".into()))
    }

    async fn kill_process(
        &mut self,
        process_id: ProcessId,
    ) -> Result<ProcessRecord, RuntimeError> {
        let record = self
            .monitor
            .get(&process_id)
            .ok_or_else(|| RuntimeError::ProcessNotFound(process_id.0.clone()))?;

        if record.state.is_terminal() {
            return Ok(record);
        }

        // Cancel first: the reply must not race outstanding log entries.
        if let Some(pair) = self.active.get(&process_id) {
            pair.taskman.cancel_process_tasks().await?;
        }

        self.deactivate(&process_id);

        self.monitor
            .set_result(&process_id, ExecuteResult::Killed, ReplicationMode::Sync)
            .await?;

        self.monitor
            .get(&process_id)
            .ok_or_else(|| RuntimeError::ProcessNotFound(process_id.0.clone()))
    }

    async fn process_info(&self, process_id: ProcessId) -> Result<ProcessInfo, RuntimeError> {
        let record = self
            .monitor
            .get(&process_id)
            .ok_or_else(|| RuntimeError::ProcessNotFound(process_id.0.clone()))?;

        let active_task_count = match self.active.get(&process_id) {
            Some(pair) => pair.taskman.active_task_count().await,
            None => 0,
        };

        Ok(ProcessInfo {
            record,
            worker_count: self.pool.available_worker_count(),
            active_task_count,
        })
    }

    /// Tears down the per-process pair. Stopping the task manager drops its
    /// scheduler handle, which closes the scheduler's mailbox in turn.
    fn deactivate(&mut self, process_id: &ProcessId) {
        self.directory.unregister(process_id);
        if let Some(pair) = self.active.remove(process_id) {
            pair.taskman.stop();
        }
    }

    /// The deliberate escalation point: mark ourselves deactivated and tell
    /// the cluster manager the control plane is compromised. Clients get a
    /// `SystemCorrupted` reply through the error mapping in the handlers.
    fn trigger_system_fault(&mut self, reason: &str) {
        tracing::error!("System fault in the process manager: {}", reason);
        self.faulted = true;
        for (process_id, pair) in self.active.drain() {
            self.directory.unregister(&process_id);
            pair.taskman.stop();
        }
        self.cluster.fail_cluster(reason);
    }
}
