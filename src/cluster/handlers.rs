//! HTTP handlers for the cluster administration surface.

use super::manager::ClusterManager;
use super::protocol::*;
use super::types::*;
use crate::membership::types::Node;

use axum::{Extension, Json, http::StatusCode};
use std::sync::Arc;

pub async fn handle_ping(
    Extension(cluster): Extension<Arc<ClusterManager>>,
) -> Json<PingResponse> {
    Json(PingResponse {
        deployment_id: cluster.ping(),
    })
}

pub async fn handle_deployment_info(
    Extension(cluster): Extension<Arc<ClusterManager>>,
) -> Json<NodeDeploymentInfo> {
    Json(cluster.deployment_info())
}

pub async fn handle_performance_counters(
    Extension(cluster): Extension<Arc<ClusterManager>>,
) -> Json<PerformanceCounters> {
    Json(cluster.performance_counters())
}

pub async fn handle_all_nodes(
    Extension(cluster): Extension<Arc<ClusterManager>>,
) -> Json<Vec<Node>> {
    Json(cluster.all_nodes())
}

pub async fn handle_masters(
    Extension(cluster): Extension<Arc<ClusterManager>>,
) -> Json<Vec<Node>> {
    Json(cluster.master_and_alts())
}

pub async fn handle_deployment_id(
    Extension(cluster): Extension<Arc<ClusterManager>>,
) -> Json<PingResponse> {
    Json(PingResponse {
        deployment_id: cluster.deployment_id().to_string(),
    })
}

pub async fn handle_attach(
    Extension(cluster): Extension<Arc<ClusterManager>>,
    Json(node): Json<Node>,
) -> (StatusCode, Json<AdminAck>) {
    cluster.attach(node);
    (StatusCode::OK, Json(AdminAck { ok: true }))
}

pub async fn handle_detach(
    Extension(cluster): Extension<Arc<ClusterManager>>,
    Json(request): Json<DetachRequest>,
) -> (StatusCode, Json<AdminAck>) {
    cluster.detach(&request.node_id);
    (StatusCode::OK, Json(AdminAck { ok: true }))
}

pub async fn handle_set_permissions(
    Extension(cluster): Extension<Arc<ClusterManager>>,
    Json(request): Json<SetPermissionsRequest>,
) -> (StatusCode, Json<AdminAck>) {
    let ok = cluster.set_node_permissions(&request.node_id, request.permissions);
    let status = if ok { StatusCode::OK } else { StatusCode::NOT_FOUND };
    (status, Json(AdminAck { ok }))
}

pub async fn handle_master_boot(
    Extension(cluster): Extension<Arc<ClusterManager>>,
    Json(config): Json<Configuration>,
) -> (StatusCode, Json<AdminAck>) {
    cluster.master_boot(config);
    (StatusCode::OK, Json(AdminAck { ok: true }))
}

pub async fn handle_shutdown(
    Extension(cluster): Extension<Arc<ClusterManager>>,
) -> Json<AdminAck> {
    cluster.shutdown();
    Json(AdminAck { ok: true })
}

/// Shutdown variant that only acks once the notification has been observed
/// by the serve loop (bounded wait).
pub async fn handle_shutdown_sync(
    Extension(cluster): Extension<Arc<ClusterManager>>,
) -> Json<AdminAck> {
    cluster.shutdown();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    Json(AdminAck { ok: true })
}

pub async fn handle_event_log_dump(
    Extension(cluster): Extension<Arc<ClusterManager>>,
) -> Json<Vec<ClusterEvent>> {
    Json(cluster.log_dump())
}
