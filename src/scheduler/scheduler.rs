use crate::process::manager::ResultSink;
use crate::process::types::ExecuteResult;
use crate::tasklog::types::{ProcessId, TaskHeader, TaskId};
use crate::taskman::manager::TaskManagerHandle;
use crate::taskman::protocol::{GroupMode, TaskOutcome};

use std::collections::HashMap;
use tokio::sync::mpsc;

pub enum SchedulerMsg {
    /// Sent exactly once per process by the process manager.
    NewProcess {
        process_id: ProcessId,
        body: serde_json::Value,
    },
    /// Worker-returned result, relayed by the task manager.
    TaskResult {
        header: TaskHeader,
        outcome: TaskOutcome,
    },
}

/// Cloneable mailbox handle for a per-process scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerMsg>,
}

impl SchedulerHandle {
    #[cfg(test)]
    pub(crate) fn from_channel(tx: mpsc::UnboundedSender<SchedulerMsg>) -> Self {
        Self { tx }
    }

    pub fn new_process(&self, process_id: ProcessId, body: serde_json::Value) {
        let _ = self.tx.send(SchedulerMsg::NewProcess { process_id, body });
    }

    pub fn task_result(&self, header: TaskHeader, outcome: TaskOutcome) {
        let _ = self.tx.send(SchedulerMsg::TaskResult { header, outcome });
    }
}

/// One unsettled wave of spawned children, keyed by their parent task.
struct Group {
    mode: GroupMode,
    results: Vec<Option<serde_json::Value>>,
    member_index: HashMap<TaskId, usize>,
}

impl Group {
    fn is_complete(&self) -> bool {
        self.results.iter().all(|slot| slot.is_some())
    }

    fn aggregate(&mut self) -> serde_json::Value {
        serde_json::Value::Array(
            self.results
                .iter_mut()
                .map(|slot| slot.take().unwrap_or(serde_json::Value::Null))
                .collect(),
        )
    }
}

/// Per-process scheduler: consumes worker results, produces the next wave
/// of child tasks, and folds settled waves back up the computation tree
/// until the root value emerges.
///
/// Driven by — never driving — the task manager: every task it wants
/// created goes through `CreateTasks`/`CreateRootTask`, and every result it
/// sees has already passed the task manager's duplicate filter.
pub struct Scheduler {
    process_id: ProcessId,
    taskman: TaskManagerHandle,
    results: ResultSink,
    root_task: Option<TaskId>,
    groups: HashMap<TaskId, Group>,
    child_parent: HashMap<TaskId, TaskId>,
    finished: bool,
}

impl Scheduler {
    pub fn spawn(
        process_id: ProcessId,
        taskman: TaskManagerHandle,
        results: ResultSink,
    ) -> SchedulerHandle {
        let (tx, rx) = mpsc::unbounded_channel();

        let scheduler = Scheduler {
            process_id,
            taskman,
            results,
            root_task: None,
            groups: HashMap::new(),
            child_parent: HashMap::new(),
            finished: false,
        };

        tokio::spawn(scheduler.run(rx));

        SchedulerHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SchedulerMsg>) {
        while let Some(msg) = rx.recv().await {
            self.handle(msg).await;
        }
        tracing::debug!("Scheduler for {:?} stopped", self.process_id);
    }

    async fn handle(&mut self, msg: SchedulerMsg) {
        match msg {
            SchedulerMsg::NewProcess { process_id, body } => {
                match self.taskman.create_root_task(process_id, body).await {
                    Ok(task_id) => {
                        tracing::info!(
                            "Process {:?} rooted at task {:?}",
                            self.process_id,
                            task_id
                        );
                        self.root_task = Some(task_id);
                    }
                    Err(e) => {
                        tracing::error!(
                            "Failed to root process {:?}: {}",
                            self.process_id,
                            e
                        );
                        self.finished = true;
                        self.results
                            .publish_system_fault(self.process_id.clone(), e.to_string());
                    }
                }
            }

            SchedulerMsg::TaskResult { header, outcome } => {
                if self.finished {
                    tracing::debug!(
                        "Ignoring result for {:?}: process already settled",
                        header.task_id
                    );
                    return;
                }

                match outcome {
                    TaskOutcome::Fault(reason) => {
                        tracing::warn!(
                            "Task {:?} faulted, failing process {:?}: {}",
                            header.task_id,
                            self.process_id,
                            reason
                        );
                        self.finished = true;
                        if let Err(e) = self.taskman.cancel_process_tasks().await {
                            tracing::warn!("Cleanup after fault failed: {}", e);
                        }
                        self.results
                            .publish_result(self.process_id.clone(), ExecuteResult::Fault(reason));
                    }

                    TaskOutcome::Spawn { mode, children } => {
                        if children.is_empty() {
                            // Degenerate composite; settles immediately.
                            self.settle(header.task_id, serde_json::Value::Array(vec![]), true)
                                .await;
                            return;
                        }

                        let parent = header.task_id.clone();
                        let expected = children.len();

                        match self
                            .taskman
                            .create_tasks(self.process_id.clone(), parent.clone(), children)
                            .await
                        {
                            Ok(task_ids) => {
                                let mut member_index = HashMap::with_capacity(expected);
                                for (idx, task_id) in task_ids.iter().enumerate() {
                                    member_index.insert(task_id.clone(), idx);
                                    self.child_parent.insert(task_id.clone(), parent.clone());
                                }
                                self.groups.insert(
                                    parent,
                                    Group {
                                        mode,
                                        results: vec![None; expected],
                                        member_index,
                                    },
                                );
                            }
                            Err(e) => {
                                tracing::error!(
                                    "Spawning wave under {:?} failed: {}",
                                    parent,
                                    e
                                );
                                self.finished = true;
                                self.results.publish_system_fault(
                                    self.process_id.clone(),
                                    e.to_string(),
                                );
                            }
                        }
                    }

                    TaskOutcome::Value(value) => {
                        self.settle(header.task_id, value, true).await;
                    }
                }
            }
        }
    }

    /// Folds a settled value up the tree. `from_worker` is true only for
    /// the first hop (an actual worker result, whose log entry still needs
    /// releasing); synthesized parent values were unlogged when their wave
    /// was created.
    async fn settle(&mut self, task_id: TaskId, value: serde_json::Value, from_worker: bool) {
        let mut current = (task_id, value, from_worker);

        loop {
            let (task_id, value, from_worker) = current;

            if self.root_task.as_ref() == Some(&task_id) {
                self.finished = true;
                if let Err(e) = self.taskman.final_task_complete(task_id).await {
                    tracing::error!("Durable completion failed: {}", e);
                    self.results
                        .publish_system_fault(self.process_id.clone(), e.to_string());
                    return;
                }
                tracing::info!("Process {:?} completed", self.process_id);
                self.results
                    .publish_result(self.process_id.clone(), ExecuteResult::Success(value));
                return;
            }

            let Some(parent) = self.child_parent.get(&task_id).cloned() else {
                tracing::warn!("Value for unknown task {:?} dropped", task_id);
                return;
            };

            let Some(group) = self.groups.get_mut(&parent) else {
                tracing::warn!("Group for {:?} already settled", parent);
                return;
            };

            match group.mode {
                GroupMode::Parallel => {
                    let idx = group.member_index[&task_id];
                    group.results[idx] = Some(value);

                    if from_worker {
                        self.taskman.leaf_task_complete(task_id);
                    }

                    if self.groups[&parent].is_complete() {
                        let mut group = self.groups.remove(&parent).expect("group present");
                        for member in group.member_index.keys() {
                            self.child_parent.remove(member);
                        }
                        current = (parent, group.aggregate(), false);
                        continue;
                    }
                    return;
                }

                GroupMode::Choice => {
                    // First value wins; siblings (the winner included) are
                    // unlogged in one batch and cancelled on their workers.
                    if from_worker {
                        if let Err(e) = self.taskman.cancel_sibling_tasks(task_id.clone()).await {
                            tracing::warn!("Sibling cancellation failed: {}", e);
                        }
                    }

                    let group = self.groups.remove(&parent).expect("group present");
                    for member in group.member_index.keys() {
                        self.child_parent.remove(member);
                    }
                    current = (parent, value, false);
                    continue;
                }
            }
        }
    }
}
