//! Task Log Module Tests
//!
//! ## Test Scopes
//! - **Mutations**: append/remove idempotency and the queries recovery and
//!   cancellation depend on.
//! - **Replication**: quorum accounting on synchronous writes and the
//!   replica-side apply path (dedup, per-origin ordering, gap buffering).

#[cfg(test)]
mod tests {
    use crate::membership::service::MembershipService;
    use crate::membership::types::{NodeId, NodeType, Permissions};
    use crate::tasklog::log::ReplicatedTaskLog;
    use crate::tasklog::protocol::{LogMutation, LogOp};
    use crate::tasklog::types::*;
    use std::sync::Arc;

    async fn single_node_log() -> Arc<ReplicatedTaskLog> {
        let membership = MembershipService::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:0".parse().unwrap(),
            NodeType::Master,
            Permissions::ALL,
            vec![],
        )
        .await
        .expect("Failed to create membership");

        ReplicatedTaskLog::new(membership, 0, 0)
    }

    fn entry(process: &str, task: &str, parent: Option<&str>, worker: &str) -> TaskLogEntry {
        let task_id = TaskId(task.to_string());
        let process_id = ProcessId(process.to_string());
        let parent_task_id = parent.map(|p| TaskId(p.to_string()));
        TaskLogEntry {
            task_id: task_id.clone(),
            parent_task_id: parent_task_id.clone(),
            worker: NodeId(worker.to_string()),
            payload: TaskPayload {
                process_id,
                task_id,
                parent_task_id,
                body: serde_json::json!({"leaf": {"handler": "value", "payload": 1}}),
                dependencies: vec![],
            },
        }
    }

    // ============================================================
    // MUTATIONS AND QUERIES
    // ============================================================

    #[tokio::test]
    async fn test_log_and_unlog() {
        let log = single_node_log().await;

        log.log(vec![entry("p1", "t1", None, "w1")], ReplicationMode::Sync)
            .await
            .unwrap();

        assert!(log.is_logged(&TaskId("t1".to_string())));
        assert_eq!(log.count(), 1);

        log.unlog(vec![TaskId("t1".to_string())], ReplicationMode::Sync)
            .await
            .unwrap();

        assert!(!log.is_logged(&TaskId("t1".to_string())));
        assert_eq!(log.count(), 0);
    }

    #[tokio::test]
    async fn test_unlog_missing_ids_is_ignored() {
        let log = single_node_log().await;

        log.unlog(vec![TaskId("ghost".to_string())], ReplicationMode::Sync)
            .await
            .expect("Unlogging a missing id must not fail");

        assert_eq!(log.count(), 0);
    }

    #[tokio::test]
    async fn test_log_overwrite_reassigns_worker() {
        let log = single_node_log().await;

        log.log(vec![entry("p1", "t1", None, "w1")], ReplicationMode::Sync)
            .await
            .unwrap();
        // Same task id, fresh worker: the retry path.
        log.log(vec![entry("p1", "t1", None, "w2")], ReplicationMode::Sync)
            .await
            .unwrap();

        assert_eq!(log.count(), 1, "Logging is idempotent on TaskId");
        let stored = log.get(&TaskId("t1".to_string())).unwrap();
        assert_eq!(stored.worker, NodeId("w2".to_string()));
    }

    #[tokio::test]
    async fn test_retrieve_by_worker_and_process() {
        let log = single_node_log().await;

        log.log(
            vec![
                entry("p1", "t1", None, "w1"),
                entry("p1", "t2", Some("t1"), "w2"),
                entry("p2", "t3", None, "w1"),
            ],
            ReplicationMode::Sync,
        )
        .await
        .unwrap();

        let on_w1 = log.retrieve_by_worker(&NodeId("w1".to_string()));
        assert_eq!(on_w1.len(), 2);

        let of_p1 = log.retrieve_by_process(&ProcessId("p1".to_string()));
        assert_eq!(of_p1.len(), 2);

        assert_eq!(log.worker_load(&NodeId("w1".to_string())), 2);
        assert_eq!(log.worker_load(&NodeId("w2".to_string())), 1);
    }

    #[tokio::test]
    async fn test_sibling_tasks_share_parent_within_process() {
        let log = single_node_log().await;

        log.log(
            vec![
                entry("p1", "c1", Some("parent"), "w1"),
                entry("p1", "c2", Some("parent"), "w2"),
                entry("p1", "c3", Some("parent"), "w3"),
                entry("p1", "other", Some("elsewhere"), "w1"),
                entry("p2", "foreign", Some("parent"), "w1"),
            ],
            ReplicationMode::Sync,
        )
        .await
        .unwrap();

        let siblings = log.sibling_tasks(&TaskId("c2".to_string()));
        let mut ids: Vec<String> = siblings.iter().map(|e| e.task_id.0.clone()).collect();
        ids.sort();

        assert_eq!(ids, vec!["c1", "c2", "c3"]);
    }

    #[tokio::test]
    async fn test_sibling_tasks_of_unlogged_task_is_empty() {
        let log = single_node_log().await;
        assert!(log.sibling_tasks(&TaskId("nope".to_string())).is_empty());
    }

    // ============================================================
    // REPLICATION
    // ============================================================

    #[tokio::test]
    async fn test_sync_write_fails_below_quorum() {
        let membership = MembershipService::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:0".parse().unwrap(),
            NodeType::Master,
            Permissions::ALL,
            vec![],
        )
        .await
        .unwrap();

        // Two acks required, zero replica peers in the cluster.
        let log = ReplicatedTaskLog::new(membership, 2, 1);

        let result = log
            .log(vec![entry("p1", "t1", None, "w1")], ReplicationMode::Sync)
            .await;

        match result {
            Err(crate::errors::RuntimeError::BroadcastFailure { acked, required }) => {
                assert_eq!(acked, 0);
                assert_eq!(required, 2);
            }
            other => panic!("Expected BroadcastFailure, got {:?}", other.err()),
        }
    }

    fn mutation(op_id: &str, origin: &str, seq: u64, op: LogOp) -> LogMutation {
        LogMutation {
            op_id: op_id.to_string(),
            origin: NodeId(origin.to_string()),
            seq,
            op,
        }
    }

    #[tokio::test]
    async fn test_apply_mutation_dedup() {
        let log = single_node_log().await;

        let m = mutation(
            "op-1",
            "origin-1",
            1,
            LogOp::Append(vec![entry("p1", "t1", None, "w1")]),
        );

        assert!(log.apply_mutation(m.clone()));
        assert!(!log.apply_mutation(m), "Duplicate op id must be dropped");
        assert_eq!(log.count(), 1);
    }

    #[tokio::test]
    async fn test_apply_mutation_in_order() {
        let log = single_node_log().await;

        log.apply_mutation(mutation(
            "op-1",
            "origin-1",
            1,
            LogOp::Append(vec![entry("p1", "t1", None, "w1")]),
        ));
        log.apply_mutation(mutation(
            "op-2",
            "origin-1",
            2,
            LogOp::Remove(vec![TaskId("t1".to_string())]),
        ));

        assert_eq!(log.count(), 0);
    }

    #[tokio::test]
    async fn test_apply_mutation_buffers_gap() {
        let log = single_node_log().await;

        log.apply_mutation(mutation(
            "op-1",
            "origin-1",
            1,
            LogOp::Append(vec![entry("p1", "t1", None, "w1")]),
        ));

        // Seq 3 arrives before seq 2: the removal of t1 must wait so that
        // the append of t2 (seq 2) is not reordered behind it.
        log.apply_mutation(mutation(
            "op-3",
            "origin-1",
            3,
            LogOp::Remove(vec![TaskId("t2".to_string())]),
        ));
        assert!(
            log.is_logged(&TaskId("t1".to_string())),
            "Gapped mutation must not apply early"
        );
        assert_eq!(log.count(), 1);

        log.apply_mutation(mutation(
            "op-2",
            "origin-1",
            2,
            LogOp::Append(vec![entry("p1", "t2", None, "w2")]),
        ));

        // Seq 2 applied, then the buffered seq 3 drained right after it.
        assert!(log.is_logged(&TaskId("t1".to_string())));
        assert!(!log.is_logged(&TaskId("t2".to_string())));
        assert_eq!(log.count(), 1);
    }

    #[tokio::test]
    async fn test_apply_mutation_drops_stale_seq() {
        let log = single_node_log().await;

        log.apply_mutation(mutation(
            "op-5",
            "origin-1",
            5,
            LogOp::Append(vec![entry("p1", "t5", None, "w1")]),
        ));

        // Replays below the applied watermark are duplicates.
        let applied = log.apply_mutation(mutation(
            "op-4",
            "origin-1",
            4,
            LogOp::Append(vec![entry("p1", "t4", None, "w1")]),
        ));

        assert!(!applied);
        assert!(!log.is_logged(&TaskId("t4".to_string())));
    }

    #[tokio::test]
    async fn test_log_health_degrades_with_lost_replicas() {
        let log = single_node_log().await;
        // Baseline of zero replicas, failover factor zero: still healthy.
        assert!(log.verify_health().is_ok());
    }
}
