//! Task Manager Module Tests
//!
//! Exercises the dispatch state machine against a real loopback worker stub:
//! log-then-post ordering, recovery reassignment, duplicate suppression, and
//! the cancellation paths.

#[cfg(test)]
mod tests {
    use crate::membership::service::MembershipService;
    use crate::membership::types::{Node, NodeId, NodeState, NodeType, Permissions};
    use crate::pool::pool::WorkerPool;
    use crate::scheduler::scheduler::{SchedulerHandle, SchedulerMsg};
    use crate::tasklog::log::ReplicatedTaskLog;
    use crate::tasklog::types::*;
    use crate::taskman::manager::{TaskManager, TaskManagerHandle};
    use crate::taskman::protocol::TaskOutcome;
    use crate::worker::protocol::*;

    use axum::routing::post;
    use axum::{Extension, Json, Router};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const TICK: Duration = Duration::from_secs(3);

    struct Harness {
        log: Arc<ReplicatedTaskLog>,
        taskman: TaskManagerHandle,
        process_id: ProcessId,
        executes: mpsc::UnboundedReceiver<ExecuteTaskRequest>,
        cancels: mpsc::UnboundedReceiver<CancelTasksRequest>,
        worker_id: NodeId,
    }

    async fn stub_execute(
        Extension(tx): Extension<mpsc::UnboundedSender<ExecuteTaskRequest>>,
        Json(req): Json<ExecuteTaskRequest>,
    ) -> Json<ExecuteTaskResponse> {
        let _ = tx.send(req);
        Json(ExecuteTaskResponse { accepted: true })
    }

    async fn stub_cancel(
        Extension(tx): Extension<mpsc::UnboundedSender<CancelTasksRequest>>,
        Json(req): Json<CancelTasksRequest>,
    ) -> Json<CancelTasksResponse> {
        let cancelled = req.task_ids.len();
        let _ = tx.send(req);
        Json(CancelTasksResponse { cancelled })
    }

    async fn spawn_stub_worker() -> (
        SocketAddr,
        mpsc::UnboundedReceiver<ExecuteTaskRequest>,
        mpsc::UnboundedReceiver<CancelTasksRequest>,
    ) {
        let (execute_tx, execute_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = mpsc::unbounded_channel();

        let app = Router::new()
            .route(ENDPOINT_EXECUTE, post(stub_execute))
            .route(ENDPOINT_CANCEL, post(stub_cancel))
            .layer(Extension(execute_tx))
            .layer(Extension(cancel_tx));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (addr, execute_rx, cancel_rx)
    }

    fn stub_node(id: &str, http_addr: SocketAddr) -> Node {
        Node {
            id: NodeId(id.to_string()),
            gossip_addr: "127.0.0.1:1".parse().unwrap(),
            http_addr,
            node_type: NodeType::Slave,
            permissions: Permissions::SLAVE,
            state: NodeState::Alive,
            incarnation: 1,
            last_seen: Some(Instant::now()),
        }
    }

    async fn harness() -> Harness {
        let membership = MembershipService::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:0".parse().unwrap(),
            NodeType::Master,
            Permissions::MASTER,
            vec![],
        )
        .await
        .unwrap();

        let (worker_addr, executes, cancels) = spawn_stub_worker().await;
        let worker_id = NodeId("stub-worker".to_string());
        membership.register_node(stub_node("stub-worker", worker_addr));

        let log = ReplicatedTaskLog::new(membership.clone(), 0, 0);
        let pool = WorkerPool::new(membership.clone(), log.clone());
        let process_id = ProcessId("proc-1".to_string());
        let taskman = TaskManager::spawn(
            process_id.clone(),
            vec!["dep-1".to_string()],
            log.clone(),
            pool,
            membership.clone(),
        );

        Harness {
            log,
            taskman,
            process_id,
            executes,
            cancels,
            worker_id,
        }
    }

    fn leaf_body(n: u64) -> serde_json::Value {
        serde_json::json!({"leaf": {"handler": "value", "payload": n}})
    }

    // ============================================================
    // DISPATCH
    // ============================================================

    #[tokio::test]
    async fn test_create_root_task_logs_then_posts() {
        let mut h = harness().await;

        let task_id = h
            .taskman
            .create_root_task(h.process_id.clone(), leaf_body(1))
            .await
            .expect("Root creation failed");

        assert!(h.log.is_logged(&task_id));

        let dispatched = timeout(TICK, h.executes.recv()).await.unwrap().unwrap();
        assert_eq!(dispatched.payload.task_id, task_id);
        assert_eq!(dispatched.payload.parent_task_id, None);
        assert_eq!(dispatched.payload.dependencies, vec!["dep-1".to_string()]);
    }

    #[tokio::test]
    async fn test_create_tasks_logs_children_before_parent_unlog() {
        let mut h = harness().await;

        let parent = h
            .taskman
            .create_root_task(h.process_id.clone(), leaf_body(0))
            .await
            .unwrap();
        let _ = timeout(TICK, h.executes.recv()).await.unwrap().unwrap();

        let children = h
            .taskman
            .create_tasks(
                h.process_id.clone(),
                parent.clone(),
                vec![leaf_body(1), leaf_body(2), leaf_body(3)],
            )
            .await
            .expect("Wave creation failed");

        assert_eq!(children.len(), 3);
        for child in &children {
            assert!(h.log.is_logged(child), "Child must be logged");
        }
        assert!(!h.log.is_logged(&parent), "Parent must be unlogged");

        for _ in 0..3 {
            let dispatched = timeout(TICK, h.executes.recv()).await.unwrap().unwrap();
            assert_eq!(dispatched.payload.parent_task_id, Some(parent.clone()));
        }
    }

    #[tokio::test]
    async fn test_dispatch_waits_for_a_worker() {
        // No workers registered: the message self-retries until one shows up.
        let membership = MembershipService::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:0".parse().unwrap(),
            NodeType::Master,
            Permissions::MASTER,
            vec![],
        )
        .await
        .unwrap();
        let log = ReplicatedTaskLog::new(membership.clone(), 0, 0);
        let pool = WorkerPool::new(membership.clone(), log.clone());
        let process_id = ProcessId("proc-1".to_string());
        let taskman =
            TaskManager::spawn(process_id.clone(), vec![], log.clone(), pool, membership.clone());

        let pending = {
            let taskman = taskman.clone();
            let process_id = process_id.clone();
            tokio::spawn(async move { taskman.create_root_task(process_id, leaf_body(1)).await })
        };

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!pending.is_finished(), "Creation must block on selection");

        let (worker_addr, mut executes, _cancels) = spawn_stub_worker().await;
        membership.register_node(stub_node("late-worker", worker_addr));

        let task_id = timeout(TICK, pending).await.unwrap().unwrap().unwrap();
        assert!(log.is_logged(&task_id));
        let _ = timeout(TICK, executes.recv()).await.unwrap().unwrap();
    }

    // ============================================================
    // RESULTS
    // ============================================================

    #[tokio::test]
    async fn test_result_for_unlogged_task_is_dropped() {
        let h = harness().await;

        let (scheduler_tx, mut scheduler_rx) = mpsc::unbounded_channel();
        h.taskman
            .set_scheduler(SchedulerHandle::from_channel(scheduler_tx));

        let header = TaskHeader {
            process_id: h.process_id.clone(),
            task_id: TaskId("never-logged".to_string()),
        };
        h.taskman
            .task_result(header, TaskOutcome::Value(serde_json::json!(1)));

        assert!(
            timeout(Duration::from_millis(300), scheduler_rx.recv())
                .await
                .is_err(),
            "Duplicate result must not reach the scheduler"
        );
    }

    #[tokio::test]
    async fn test_result_for_logged_task_reaches_scheduler() {
        let mut h = harness().await;

        let (scheduler_tx, mut scheduler_rx) = mpsc::unbounded_channel();
        h.taskman
            .set_scheduler(SchedulerHandle::from_channel(scheduler_tx));

        let task_id = h
            .taskman
            .create_root_task(h.process_id.clone(), leaf_body(1))
            .await
            .unwrap();
        let _ = timeout(TICK, h.executes.recv()).await.unwrap().unwrap();

        let header = TaskHeader {
            process_id: h.process_id.clone(),
            task_id: task_id.clone(),
        };
        h.taskman
            .task_result(header, TaskOutcome::Value(serde_json::json!(7)));

        match timeout(TICK, scheduler_rx.recv()).await.unwrap().unwrap() {
            SchedulerMsg::TaskResult { header, .. } => assert_eq!(header.task_id, task_id),
            _ => panic!("Expected TaskResult relay"),
        }
    }

    // ============================================================
    // RECOVERY
    // ============================================================

    #[tokio::test]
    async fn test_recover_reassigns_to_live_worker() {
        let mut h = harness().await;

        // An entry stranded on a worker that is not in the pool anymore.
        let dead = NodeId("dead-worker".to_string());
        let task_id = TaskId::new();
        let payload = TaskPayload {
            process_id: h.process_id.clone(),
            task_id: task_id.clone(),
            parent_task_id: None,
            body: leaf_body(9),
            dependencies: vec![],
        };
        h.log
            .log(
                vec![TaskLogEntry {
                    task_id: task_id.clone(),
                    parent_task_id: None,
                    worker: dead.clone(),
                    payload,
                }],
                ReplicationMode::Sync,
            )
            .await
            .unwrap();

        h.taskman.recover(dead.clone());

        let dispatched = timeout(TICK, h.executes.recv()).await.unwrap().unwrap();
        assert_eq!(dispatched.payload.task_id, task_id);

        let entry = h.log.get(&task_id).expect("Entry must survive recovery");
        assert_eq!(entry.worker, h.worker_id);

        // A second recovery pass finds nothing on the dead worker.
        h.taskman.recover(dead);
        assert!(
            timeout(Duration::from_millis(300), h.executes.recv())
                .await
                .is_err(),
            "No duplicate reissue expected"
        );
    }

    // ============================================================
    // CANCELLATION
    // ============================================================

    #[tokio::test]
    async fn test_cancel_sibling_tasks_unlogs_and_notifies_workers() {
        let mut h = harness().await;

        let parent = h
            .taskman
            .create_root_task(h.process_id.clone(), leaf_body(0))
            .await
            .unwrap();
        let _ = timeout(TICK, h.executes.recv()).await.unwrap().unwrap();

        let children = h
            .taskman
            .create_tasks(
                h.process_id.clone(),
                parent,
                vec![leaf_body(1), leaf_body(2), leaf_body(3)],
            )
            .await
            .unwrap();
        for _ in 0..3 {
            let _ = timeout(TICK, h.executes.recv()).await.unwrap().unwrap();
        }

        h.taskman
            .cancel_sibling_tasks(children[0].clone())
            .await
            .expect("Cancellation failed");

        for child in &children {
            assert!(!h.log.is_logged(child));
        }
        assert_eq!(h.taskman.active_task_count().await, 0);

        let cancelled = timeout(TICK, h.cancels.recv()).await.unwrap().unwrap();
        assert_eq!(cancelled.task_ids.len(), 3);
    }

    #[tokio::test]
    async fn test_cancel_process_tasks_empties_the_log() {
        let mut h = harness().await;

        let root = h
            .taskman
            .create_root_task(h.process_id.clone(), leaf_body(0))
            .await
            .unwrap();
        let _ = timeout(TICK, h.executes.recv()).await.unwrap().unwrap();

        assert!(h.taskman.is_valid_task(root.clone()).await);

        h.taskman
            .cancel_process_tasks()
            .await
            .expect("Kill cascade failed");

        assert_eq!(h.log.count(), 0);
        assert!(!h.taskman.is_valid_task(root).await);

        let cancelled = timeout(TICK, h.cancels.recv()).await.unwrap().unwrap();
        assert_eq!(cancelled.task_ids.len(), 1);
    }

    #[tokio::test]
    async fn test_active_task_count_tracks_process_entries() {
        let mut h = harness().await;
        assert_eq!(h.taskman.active_task_count().await, 0);

        let _ = h
            .taskman
            .create_root_task(h.process_id.clone(), leaf_body(1))
            .await
            .unwrap();
        let _ = timeout(TICK, h.executes.recv()).await.unwrap().unwrap();

        assert_eq!(h.taskman.active_task_count().await, 1);

        // Entries of another process are not ours to count.
        h.log
            .log(
                vec![TaskLogEntry {
                    task_id: TaskId::new(),
                    parent_task_id: None,
                    worker: h.worker_id.clone(),
                    payload: TaskPayload {
                        process_id: ProcessId("other".to_string()),
                        task_id: TaskId::new(),
                        parent_task_id: None,
                        body: leaf_body(1),
                        dependencies: vec![],
                    },
                }],
                ReplicationMode::Async,
            )
            .await
            .unwrap();

        assert_eq!(h.taskman.active_task_count().await, 1);
    }
}
