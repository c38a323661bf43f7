use axum::routing::{get, post};
use axum::{Extension, Router};
use distributed_runtime::cluster::handlers::*;
use distributed_runtime::cluster::manager::ClusterManager;
use distributed_runtime::cluster::protocol as cluster_protocol;
use distributed_runtime::membership::service::MembershipService;
use distributed_runtime::membership::types::{NodeType, Permissions};
use distributed_runtime::pool::pool::WorkerPool;
use distributed_runtime::process::handlers::{handle_process_api, handle_process_replicate};
use distributed_runtime::process::manager::ProcessManager;
use distributed_runtime::process::monitor::ProcessMonitor;
use distributed_runtime::process::protocol::{ENDPOINT_PROCESS_API, ENDPOINT_PROCESS_REPLICATE};
use distributed_runtime::tasklog::handlers::{handle_log_dump, handle_log_replicate};
use distributed_runtime::tasklog::log::ReplicatedTaskLog;
use distributed_runtime::tasklog::protocol::{ENDPOINT_LOG_DUMP, ENDPOINT_LOG_REPLICATE};
use distributed_runtime::taskman::handlers::{handle_is_valid_task, handle_task_result};
use distributed_runtime::taskman::manager::TaskManagerDirectory;
use distributed_runtime::taskman::protocol::{ENDPOINT_TASK_RESULT, ENDPOINT_TASK_VALID};
use distributed_runtime::worker::handlers::{handle_cancel_tasks, handle_execute_task};
use distributed_runtime::worker::protocol::{ENDPOINT_CANCEL, ENDPOINT_EXECUTE};
use distributed_runtime::worker::registry::TaskHandlerRegistry;
use distributed_runtime::worker::runtime::WorkerRuntime;
use std::net::SocketAddr;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!(
            "Usage: {} --bind <addr:port> [--seed <addr:port>] [--master]",
            args[0]
        );
        eprintln!("Example: {} --bind 127.0.0.1:5000 --master", args[0]);
        eprintln!(
            "Example: {} --bind 127.0.0.1:5001 --seed 127.0.0.1:5000",
            args[0]
        );

        std::process::exit(1);
    }

    let mut bind_addr: Option<SocketAddr> = None;
    let mut seed_nodes: Vec<SocketAddr> = vec![];
    let mut is_master = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" => {
                bind_addr = Some(args[i + 1].parse()?);
                i += 2;
            }
            "--seed" => {
                seed_nodes.push(args[i + 1].parse()?);
                i += 2;
            }
            "--master" => {
                is_master = true;
                i += 1;
            }
            _ => {
                i += 1;
            }
        }
    }

    let bind_addr = bind_addr.expect("--bind is required");

    tracing::info!("Starting node on {}", bind_addr);
    if !seed_nodes.is_empty() {
        tracing::info!("Seed nodes: {:?}", seed_nodes);
    } else {
        tracing::info!("Starting as seed node (founder)");
    }

    // 1. Membership (UDP gossip). The HTTP port sits a fixed offset above
    //    the gossip port.
    let http_port = bind_addr.port() + 1000;
    let http_addr = SocketAddr::new(bind_addr.ip(), http_port);

    let node_type = if is_master {
        NodeType::Master
    } else {
        NodeType::Slave
    };
    let permissions = if is_master {
        Permissions::ALL
    } else {
        Permissions::SLAVE
    };

    let membership = MembershipService::new(
        bind_addr,
        http_addr,
        node_type,
        permissions,
        seed_nodes,
    )
    .await?;
    tracing::info!("Node ID: {:?}", membership.local_node.id);

    // 2. Replicated control-plane state.
    let replication_factor = std::env::var("REPLICATION_FACTOR")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(0);
    let failover_factor = std::env::var("FAILOVER_FACTOR")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(0);

    let log = ReplicatedTaskLog::new(membership.clone(), replication_factor, failover_factor);
    let monitor = ProcessMonitor::new(membership.clone(), replication_factor);
    let pool = WorkerPool::new(membership.clone(), log.clone());

    // 3. Worker runtime with the built-in handlers.
    let registry = TaskHandlerRegistry::new();
    registry.register("value", |payload| async move { Ok(payload) });
    registry.register("sum", |payload| async move {
        let total: f64 = payload
            .as_array()
            .map(|values| values.iter().filter_map(|v| v.as_f64()).sum())
            .unwrap_or(0.0);
        Ok(serde_json::json!(total))
    });
    let runtime = WorkerRuntime::new(registry);

    // 4. Control plane.
    let directory = TaskManagerDirectory::new();
    let cluster = ClusterManager::new(membership.clone(), log.clone());
    let process_manager = ProcessManager::spawn(
        monitor.clone(),
        log.clone(),
        pool.clone(),
        membership.clone(),
        directory.clone(),
        cluster.clone(),
    );

    // 5. HTTP router.
    let app = Router::new()
        // Client-facing process API + record replication
        .route(ENDPOINT_PROCESS_API, post(handle_process_api))
        .route(ENDPOINT_PROCESS_REPLICATE, post(handle_process_replicate))
        // Task log replication
        .route(ENDPOINT_LOG_REPLICATE, post(handle_log_replicate))
        .route(ENDPOINT_LOG_DUMP, get(handle_log_dump))
        // Worker callbacks
        .route(ENDPOINT_TASK_RESULT, post(handle_task_result))
        .route(
            &format!("{}/:process_id/:task_id", ENDPOINT_TASK_VALID),
            get(handle_is_valid_task),
        )
        // Worker dispatch surface
        .route(ENDPOINT_EXECUTE, post(handle_execute_task))
        .route(ENDPOINT_CANCEL, post(handle_cancel_tasks))
        // Admin surface
        .route(cluster_protocol::ENDPOINT_PING, get(handle_ping))
        .route(cluster_protocol::ENDPOINT_INFO, get(handle_deployment_info))
        .route(
            cluster_protocol::ENDPOINT_PERF,
            get(handle_performance_counters),
        )
        .route(cluster_protocol::ENDPOINT_NODES, get(handle_all_nodes))
        .route(cluster_protocol::ENDPOINT_MASTERS, get(handle_masters))
        .route(
            cluster_protocol::ENDPOINT_DEPLOYMENT,
            get(handle_deployment_id),
        )
        .route(cluster_protocol::ENDPOINT_ATTACH, post(handle_attach))
        .route(cluster_protocol::ENDPOINT_DETACH, post(handle_detach))
        .route(
            cluster_protocol::ENDPOINT_PERMISSIONS,
            post(handle_set_permissions),
        )
        .route(cluster_protocol::ENDPOINT_BOOT, post(handle_master_boot))
        .route(cluster_protocol::ENDPOINT_SHUTDOWN, post(handle_shutdown))
        .route(
            cluster_protocol::ENDPOINT_SHUTDOWN_SYNC,
            post(handle_shutdown_sync),
        )
        .route(
            cluster_protocol::ENDPOINT_LOG_DUMP,
            get(handle_event_log_dump),
        )
        .layer(Extension(membership.clone()))
        .layer(Extension(log.clone()))
        .layer(Extension(monitor.clone()))
        .layer(Extension(directory.clone()))
        .layer(Extension(runtime.clone()))
        .layer(Extension(cluster.clone()))
        .layer(Extension(process_manager.clone()));

    // 6. Spawn membership and the failure pump that turns dead-node events
    //    into recovery signals.
    let service_clone = membership.clone();
    tokio::spawn(async move {
        service_clone.start().await;
    });

    let mut failures = membership.subscribe_failures();
    let pm_for_failures = process_manager.clone();
    tokio::spawn(async move {
        loop {
            match failures.recv().await {
                Ok(worker) => {
                    tracing::warn!("Worker {:?} declared dead, recovering", worker);
                    pm_for_failures.worker_failed(worker);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Failure pump lagged, {} event(s) skipped", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // 7. Periodic log health check: replica loss beyond the failover factor
    //    is a cluster-level failure.
    let log_health = log.clone();
    let cluster_health = cluster.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));
        loop {
            interval.tick().await;
            if let Err(e) = log_health.verify_health() {
                cluster_health.fail_cluster(&e.to_string());
            }
        }
    });

    // 8. Serve until ctrl-c or an admin shutdown.
    tracing::info!("HTTP server listening on {}", http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    let shutdown = cluster.shutdown_signal();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = shutdown.notified() => {}
            }
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}
