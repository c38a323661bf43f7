//! Scheduler Module Tests
//!
//! ## Test Scopes
//! - **Body model**: parsing and round-tripping of computation trees.
//! - **Wave driving**: the scheduler's conversation with a scripted task
//!   manager — root creation, parallel aggregation in child order, choice
//!   with sibling cancellation, and fault propagation.

#[cfg(test)]
mod tests {
    use crate::process::manager::{ProcessManagerMsg, ResultSink};
    use crate::process::types::ExecuteResult;
    use crate::scheduler::body::ComputationBody;
    use crate::scheduler::scheduler::{Scheduler, SchedulerHandle};
    use crate::tasklog::types::{ProcessId, TaskHeader, TaskId};
    use crate::taskman::manager::TaskManagerHandle;
    use crate::taskman::messages::TaskManagerMsg;
    use crate::taskman::protocol::{GroupMode, TaskOutcome};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const TICK: Duration = Duration::from_secs(2);

    // ============================================================
    // BODY MODEL
    // ============================================================

    #[test]
    fn test_body_parse_leaf() {
        let value = serde_json::json!({"leaf": {"handler": "value", "payload": 42}});
        let body = ComputationBody::parse(&value).unwrap();

        match body {
            ComputationBody::Leaf { handler, payload } => {
                assert_eq!(handler, "value");
                assert_eq!(payload, serde_json::json!(42));
            }
            other => panic!("Expected leaf, got {:?}", other),
        }
    }

    #[test]
    fn test_body_parse_nested() {
        let value = serde_json::json!({
            "parallel": {"children": [
                {"leaf": {"handler": "value", "payload": 1}},
                {"choice": {"children": [
                    {"leaf": {"handler": "value", "payload": 2}}
                ]}}
            ]}
        });

        let body = ComputationBody::parse(&value).unwrap();
        assert_eq!(ComputationBody::parse(&body.to_value()).unwrap(), body);
    }

    #[test]
    fn test_body_parse_rejects_garbage() {
        assert!(ComputationBody::parse(&serde_json::json!({"nope": 1})).is_err());
        assert!(ComputationBody::parse(&serde_json::json!(17)).is_err());
    }

    #[test]
    fn test_body_leaf_payload_defaults_to_null() {
        let value = serde_json::json!({"leaf": {"handler": "tick"}});
        match ComputationBody::parse(&value).unwrap() {
            ComputationBody::Leaf { payload, .. } => assert!(payload.is_null()),
            other => panic!("Expected leaf, got {:?}", other),
        }
    }

    // ============================================================
    // WAVE DRIVING (scripted task manager)
    // ============================================================

    struct Script {
        scheduler: SchedulerHandle,
        taskman_rx: mpsc::UnboundedReceiver<TaskManagerMsg>,
        manager_rx: mpsc::UnboundedReceiver<ProcessManagerMsg>,
        process_id: ProcessId,
    }

    fn start() -> Script {
        let (taskman_tx, taskman_rx) = mpsc::unbounded_channel();
        let (manager_tx, manager_rx) = mpsc::unbounded_channel();
        let process_id = ProcessId("proc-1".to_string());

        let scheduler = Scheduler::spawn(
            process_id.clone(),
            TaskManagerHandle::from_channel(taskman_tx),
            ResultSink::from_channel(manager_tx),
        );

        Script {
            scheduler,
            taskman_rx,
            manager_rx,
            process_id,
        }
    }

    fn header(process_id: &ProcessId, task_id: &TaskId) -> TaskHeader {
        TaskHeader {
            process_id: process_id.clone(),
            task_id: task_id.clone(),
        }
    }

    async fn expect_root(script: &mut Script) -> TaskId {
        let msg = timeout(TICK, script.taskman_rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        match msg {
            TaskManagerMsg::CreateRootTask { reply, .. } => {
                let root = TaskId("root".to_string());
                reply.send(Ok(root.clone())).unwrap();
                root
            }
            _ => panic!("Expected CreateRootTask"),
        }
    }

    async fn expect_wave(script: &mut Script, expected_parent: &TaskId, prefix: &str) -> Vec<TaskId> {
        let msg = timeout(TICK, script.taskman_rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        match msg {
            TaskManagerMsg::CreateTasks {
                reply,
                parent_task_id,
                bodies,
                ..
            } => {
                assert_eq!(&parent_task_id, expected_parent);
                let ids: Vec<TaskId> = (0..bodies.len())
                    .map(|i| TaskId(format!("{}-{}", prefix, i)))
                    .collect();
                reply.send(Ok(ids.clone())).unwrap();
                ids
            }
            _ => panic!("Expected CreateTasks"),
        }
    }

    async fn expect_terminal_result(script: &mut Script) -> ExecuteResult {
        let msg = timeout(TICK, script.manager_rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        match msg {
            ProcessManagerMsg::ProcessResult { result, .. } => result,
            ProcessManagerMsg::ProcessFaulted { reason, .. } => {
                panic!("Unexpected system fault: {}", reason)
            }
            _ => panic!("Expected ProcessResult"),
        }
    }

    #[tokio::test]
    async fn test_single_leaf_process_completes() {
        let mut script = start();
        let pid = script.process_id.clone();

        script
            .scheduler
            .new_process(pid.clone(), serde_json::json!({"leaf": {"handler": "value"}}));
        let root = expect_root(&mut script).await;

        script
            .scheduler
            .task_result(header(&pid, &root), TaskOutcome::Value(serde_json::json!(42)));

        // Root completion is made durable before the result publishes.
        match timeout(TICK, script.taskman_rx.recv()).await.unwrap().unwrap() {
            TaskManagerMsg::FinalTaskComplete { reply, task_id } => {
                assert_eq!(task_id, root);
                reply.send(Ok(())).unwrap();
            }
            _ => panic!("Expected FinalTaskComplete"),
        }

        match expect_terminal_result(&mut script).await {
            ExecuteResult::Success(value) => assert_eq!(value, serde_json::json!(42)),
            other => panic!("Expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_parallel_wave_aggregates_in_child_order() {
        let mut script = start();
        let pid = script.process_id.clone();

        script
            .scheduler
            .new_process(pid.clone(), serde_json::json!({"parallel": {"children": []}}));
        let root = expect_root(&mut script).await;

        let bodies: Vec<serde_json::Value> = (1..=3)
            .map(|i| serde_json::json!({"leaf": {"handler": "value", "payload": i}}))
            .collect();
        script.scheduler.task_result(
            header(&pid, &root),
            TaskOutcome::Spawn {
                mode: GroupMode::Parallel,
                children: bodies,
            },
        );
        let children = expect_wave(&mut script, &root, "c").await;

        // Results arrive out of order; the aggregate must not.
        for idx in [1usize, 0, 2] {
            script.scheduler.task_result(
                header(&pid, &children[idx]),
                TaskOutcome::Value(serde_json::json!(idx + 1)),
            );
        }

        let mut leaf_completions = 0;
        loop {
            match timeout(TICK, script.taskman_rx.recv()).await.unwrap().unwrap() {
                TaskManagerMsg::LeafTaskComplete { .. } => leaf_completions += 1,
                TaskManagerMsg::FinalTaskComplete { reply, task_id } => {
                    assert_eq!(task_id, root);
                    reply.send(Ok(())).unwrap();
                    break;
                }
                _ => panic!("Unexpected message"),
            }
        }
        assert_eq!(leaf_completions, 3);

        match expect_terminal_result(&mut script).await {
            ExecuteResult::Success(value) => {
                assert_eq!(value, serde_json::json!([1, 2, 3]));
            }
            other => panic!("Expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_choice_first_value_wins_and_cancels_siblings() {
        let mut script = start();
        let pid = script.process_id.clone();

        script
            .scheduler
            .new_process(pid.clone(), serde_json::json!({"choice": {"children": []}}));
        let root = expect_root(&mut script).await;

        script.scheduler.task_result(
            header(&pid, &root),
            TaskOutcome::Spawn {
                mode: GroupMode::Choice,
                children: vec![
                    serde_json::json!({"leaf": {"handler": "value", "payload": "a"}}),
                    serde_json::json!({"leaf": {"handler": "value", "payload": "b"}}),
                ],
            },
        );
        let children = expect_wave(&mut script, &root, "c").await;

        script.scheduler.task_result(
            header(&pid, &children[1]),
            TaskOutcome::Value(serde_json::json!("fast")),
        );

        match timeout(TICK, script.taskman_rx.recv()).await.unwrap().unwrap() {
            TaskManagerMsg::CancelSiblingTasks { reply, task_id } => {
                assert_eq!(task_id, children[1]);
                reply.send(Ok(())).unwrap();
            }
            _ => panic!("Expected CancelSiblingTasks"),
        }

        match timeout(TICK, script.taskman_rx.recv()).await.unwrap().unwrap() {
            TaskManagerMsg::FinalTaskComplete { reply, .. } => reply.send(Ok(())).unwrap(),
            _ => panic!("Expected FinalTaskComplete"),
        }

        match expect_terminal_result(&mut script).await {
            ExecuteResult::Success(value) => assert_eq!(value, serde_json::json!("fast")),
            other => panic!("Expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fault_fails_the_process_and_cancels() {
        let mut script = start();
        let pid = script.process_id.clone();

        script
            .scheduler
            .new_process(pid.clone(), serde_json::json!({"leaf": {"handler": "boom"}}));
        let root = expect_root(&mut script).await;

        script.scheduler.task_result(
            header(&pid, &root),
            TaskOutcome::Fault("division by zero".to_string()),
        );

        match timeout(TICK, script.taskman_rx.recv()).await.unwrap().unwrap() {
            TaskManagerMsg::CancelProcessTasks { reply } => reply.send(Ok(())).unwrap(),
            _ => panic!("Expected CancelProcessTasks"),
        }

        match expect_terminal_result(&mut script).await {
            ExecuteResult::Fault(reason) => assert!(reason.contains("division")),
            other => panic!("Expected fault, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_results_after_settlement_are_ignored() {
        let mut script = start();
        let pid = script.process_id.clone();

        script
            .scheduler
            .new_process(pid.clone(), serde_json::json!({"leaf": {"handler": "value"}}));
        let root = expect_root(&mut script).await;

        script
            .scheduler
            .task_result(header(&pid, &root), TaskOutcome::Value(serde_json::json!(1)));

        match timeout(TICK, script.taskman_rx.recv()).await.unwrap().unwrap() {
            TaskManagerMsg::FinalTaskComplete { reply, .. } => reply.send(Ok(())).unwrap(),
            _ => panic!("Expected FinalTaskComplete"),
        }
        let _ = expect_terminal_result(&mut script).await;

        // A straggler after settlement must not produce a second result.
        script
            .scheduler
            .task_result(header(&pid, &root), TaskOutcome::Value(serde_json::json!(2)));

        assert!(
            timeout(Duration::from_millis(300), script.manager_rx.recv())
                .await
                .is_err(),
            "No further terminal result expected"
        );
    }
}
