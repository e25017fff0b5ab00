//! REST API handlers.
//!
//! Each handler calls into the `ClusterManager` or the elasticity
//! controller and wraps the outcome in the `{success, data, error}`
//! envelope. Failures map to a status code by error kind.

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, warn};

use minicloud_scheduler::{CompletionReport, SchedulerError};
use minicloud_state::{ErrorKind, NodeType};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn failure(e: SchedulerError) -> Response {
    let status = if e.is_not_found() {
        StatusCode::NOT_FOUND
    } else {
        match e.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::StateConflict => StatusCode::CONFLICT,
            ErrorKind::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::ConsistencyViolation => StatusCode::INTERNAL_SERVER_ERROR,
        }
    };
    match e.kind() {
        ErrorKind::ConsistencyViolation => error!(error = %e, "registry consistency violation"),
        ErrorKind::BackendUnavailable => warn!(error = %e, "backend call failed"),
        _ => {}
    }
    error_response(&e.to_string(), status)
}

fn respond<T: serde::Serialize>(result: Result<T, SchedulerError>) -> Response {
    match result {
        Ok(data) => ApiResponse::ok(data).into_response(),
        Err(e) => failure(e),
    }
}

fn log_response(log: Result<Option<String>, SchedulerError>, what: &str) -> Response {
    match log {
        Ok(Some(text)) => ApiResponse::ok(text).into_response(),
        Ok(None) => error_response(&format!("no log for {what} yet"), StatusCode::NOT_FOUND),
        Err(e) => failure(e),
    }
}

// ── Query parameters ───────────────────────────────────────────

#[derive(Deserialize)]
pub struct PodNameQuery {
    pub pod_name: String,
}

#[derive(Deserialize)]
pub struct PodQuery {
    pub pod_id: String,
}

#[derive(Deserialize)]
pub struct OptionalPodQuery {
    pub pod_id: Option<String>,
}

#[derive(Deserialize)]
pub struct RegisterNodeQuery {
    pub node_name: String,
    pub node_type: NodeType,
    pub pod_id: Option<String>,
}

#[derive(Deserialize)]
pub struct NodeQuery {
    pub node_id: String,
}

#[derive(Deserialize)]
pub struct OptionalNodeQuery {
    pub node_id: Option<String>,
}

#[derive(Deserialize)]
pub struct LaunchJobQuery {
    pub job_name: String,
    pub job_id: String,
}

#[derive(Deserialize)]
pub struct JobQuery {
    pub job_id: String,
}

#[derive(Deserialize)]
pub struct ServerStatsQuery {
    pub pod_id: String,
    pub node_id: Option<String>,
}

#[derive(Deserialize)]
pub struct ThresholdQuery {
    pub pod_id: String,
    pub value: f64,
}

#[derive(Deserialize)]
pub struct ElasticityQuery {
    pub pod_id: String,
    pub min_nodes: u32,
    pub max_nodes: u32,
}

// ── Cluster ────────────────────────────────────────────────────

/// POST /cloud
pub async fn initialize(State(state): State<ApiState>) -> Response {
    let tier = state.manager.tier().name.clone();
    respond(
        state
            .manager
            .initialize()
            .await
            .map(|fresh| json!({ "initialized": fresh, "tier": tier })),
    )
}

// ── Pods ───────────────────────────────────────────────────────

/// GET /cloud/pod
pub async fn list_pods(State(state): State<ApiState>) -> Response {
    respond(state.manager.provisioner.pods().await)
}

/// POST /cloud/pod?pod_name=
pub async fn register_pod(
    State(state): State<ApiState>,
    Query(q): Query<PodNameQuery>,
) -> Response {
    match state.manager.provisioner.register_pod(&q.pod_name).await {
        Ok(pod_id) => (
            StatusCode::CREATED,
            ApiResponse::ok(json!({ "pod_id": pod_id, "pod_name": q.pod_name })),
        )
            .into_response(),
        Err(e) => failure(e),
    }
}

/// DELETE /cloud/pod?pod_id=
pub async fn remove_pod(State(state): State<ApiState>, Query(q): Query<PodQuery>) -> Response {
    respond(
        state
            .manager
            .provisioner
            .remove_pod(&q.pod_id)
            .await
            .map(|()| json!({ "pod_id": q.pod_id })),
    )
}

// ── Nodes ──────────────────────────────────────────────────────

/// GET /cloud/node?pod_id=
pub async fn list_nodes(
    State(state): State<ApiState>,
    Query(q): Query<OptionalPodQuery>,
) -> Response {
    respond(state.manager.provisioner.nodes(q.pod_id.as_deref()).await)
}

/// POST /cloud/node?node_name=&node_type=&pod_id=
pub async fn register_node(
    State(state): State<ApiState>,
    Query(q): Query<RegisterNodeQuery>,
) -> Response {
    match state
        .manager
        .provisioner
        .register_node(&q.node_name, q.node_type, q.pod_id.as_deref())
        .await
    {
        Ok(node) => (StatusCode::CREATED, ApiResponse::ok(node)).into_response(),
        Err(e) => failure(e),
    }
}

/// DELETE /cloud/node?node_id=
pub async fn remove_node(State(state): State<ApiState>, Query(q): Query<NodeQuery>) -> Response {
    respond(
        state
            .manager
            .provisioner
            .remove_node(&q.node_id)
            .await
            .map(|()| json!({ "node_id": q.node_id })),
    )
}

/// GET /cloud/node/log?node_id=
pub async fn node_log(State(state): State<ApiState>, Query(q): Query<NodeQuery>) -> Response {
    log_response(
        state.manager.jobs.node_log(&q.node_id).await,
        &format!("node {}", q.node_id),
    )
}

// ── Jobs ───────────────────────────────────────────────────────

/// GET /cloud/job?node_id=
pub async fn list_jobs(
    State(state): State<ApiState>,
    Query(q): Query<OptionalNodeQuery>,
) -> Response {
    respond(state.manager.jobs.jobs(q.node_id.as_deref()).await)
}

/// POST /cloud/job?job_name=&job_id=, body is the script.
pub async fn launch_job(
    State(state): State<ApiState>,
    Query(q): Query<LaunchJobQuery>,
    script: Bytes,
) -> Response {
    let node_id = match state.manager.jobs.launch(&q.job_name, &q.job_id, script).await {
        Ok(node_id) => node_id,
        Err(e) => return failure(e),
    };
    let (node_name, pod_id) = {
        let cluster = state.manager.cluster().lock().await;
        match cluster.node(&node_id) {
            Ok(node) => (Some(node.node_name.clone()), Some(node.pod_id.clone())),
            Err(_) => (None, None),
        }
    };
    (
        StatusCode::ACCEPTED,
        ApiResponse::ok(json!({
            "job_id": q.job_id,
            "node_id": node_id,
            "node_name": node_name,
            "pod_id": pod_id,
        })),
    )
        .into_response()
}

/// DELETE /cloud/job?job_id=
pub async fn abort_job(State(state): State<ApiState>, Query(q): Query<JobQuery>) -> Response {
    respond(
        state
            .manager
            .jobs
            .abort(&q.job_id)
            .await
            .map(|node_id| json!({ "job_id": q.job_id, "node_id": node_id })),
    )
}

/// GET /cloud/job/log?job_id=
pub async fn job_log(State(state): State<ApiState>, Query(q): Query<JobQuery>) -> Response {
    log_response(
        state.manager.jobs.job_log(&q.job_id).await,
        &format!("job {}", q.job_id),
    )
}

// ── Servers ────────────────────────────────────────────────────

/// GET /cloud/server?pod_id=&node_id=
pub async fn server_stats(
    State(state): State<ApiState>,
    Query(q): Query<ServerStatsQuery>,
) -> Response {
    respond(
        state
            .manager
            .provisioner
            .server_stats(&q.pod_id, q.node_id.as_deref())
            .await,
    )
}

/// POST /cloud/server/launch?pod_id=
pub async fn launch_servers(State(state): State<ApiState>, Query(q): Query<PodQuery>) -> Response {
    respond(
        state
            .manager
            .provisioner
            .launch_servers(&q.pod_id)
            .await
            .map(|launched| {
                launched
                    .into_iter()
                    .map(|(node_id, port)| json!({ "node_id": node_id, "port": port }))
                    .collect::<Vec<_>>()
            }),
    )
}

/// POST /cloud/server/pause?pod_id=
pub async fn pause_servers(State(state): State<ApiState>, Query(q): Query<PodQuery>) -> Response {
    respond(state.manager.provisioner.pause_servers(&q.pod_id).await)
}

/// POST /cloud/server/resume?pod_id=
pub async fn resume_servers(State(state): State<ApiState>, Query(q): Query<PodQuery>) -> Response {
    respond(state.manager.provisioner.resume_servers(&q.pod_id).await)
}

// ── Elasticity ─────────────────────────────────────────────────

/// POST /cloud/elasticity/lower?pod_id=&value=
pub async fn set_lower_threshold(
    State(state): State<ApiState>,
    Query(q): Query<ThresholdQuery>,
) -> Response {
    respond(
        state
            .controller
            .set_lower_threshold(&q.pod_id, q.value)
            .await
            .map(|()| json!({ "pod_id": q.pod_id, "lower_threshold": q.value })),
    )
}

/// POST /cloud/elasticity/upper?pod_id=&value=
pub async fn set_upper_threshold(
    State(state): State<ApiState>,
    Query(q): Query<ThresholdQuery>,
) -> Response {
    respond(
        state
            .controller
            .set_upper_threshold(&q.pod_id, q.value)
            .await
            .map(|()| json!({ "pod_id": q.pod_id, "upper_threshold": q.value })),
    )
}

/// POST /cloud/elasticity/enable?pod_id=&min_nodes=&max_nodes=
pub async fn enable_elasticity(
    State(state): State<ApiState>,
    Query(q): Query<ElasticityQuery>,
) -> Response {
    respond(
        state
            .controller
            .enable(&q.pod_id, q.min_nodes, q.max_nodes)
            .await,
    )
}

/// POST /cloud/elasticity/disable?pod_id=
pub async fn disable_elasticity(
    State(state): State<ApiState>,
    Query(q): Query<PodQuery>,
) -> Response {
    respond(
        state
            .controller
            .disable(&q.pod_id)
            .await
            .map(|()| json!({ "pod_id": q.pod_id, "is_elastic": false })),
    )
}

// ── Internal ───────────────────────────────────────────────────

/// POST /internal/callback
pub async fn job_callback(
    State(state): State<ApiState>,
    Json(report): Json<CompletionReport>,
) -> Response {
    respond(
        state
            .manager
            .jobs
            .complete(&report)
            .await
            .map(|()| json!({ "job_id": report.job_id })),
    )
}

/// GET /internal/available
pub async fn available(State(state): State<ApiState>) -> impl IntoResponse {
    let available = state.manager.scheduler.has_available_nodes().await;
    ApiResponse::ok(json!({ "available": available }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use minicloud_autoscale::ElasticityController;
    use minicloud_backend::MemoryBackend;
    use minicloud_core::MinicloudConfig;
    use minicloud_scheduler::ClusterManager;
    use minicloud_state::ClusterError;

    fn test_state(dir: &tempfile::TempDir) -> ApiState {
        let mut config = MinicloudConfig::scaffold("http://127.0.0.1:1", "http://callback");
        config.cluster.work_dir = dir.path().join("work").display().to_string();
        let manager =
            Arc::new(ClusterManager::from_config(&config, Arc::new(MemoryBackend::new())).unwrap());
        let controller = Arc::new(ElasticityController::new(manager.clone()));
        ApiState {
            manager,
            controller,
        }
    }

    #[test]
    fn error_kinds_map_to_status_codes() {
        let cases = [
            (
                SchedulerError::from(ClusterError::PodNotFound("p".into())),
                StatusCode::NOT_FOUND,
            ),
            (
                SchedulerError::from(ClusterError::DuplicateName("p".into())),
                StatusCode::BAD_REQUEST,
            ),
            (
                SchedulerError::from(ClusterError::NoAvailableNodes),
                StatusCode::CONFLICT,
            ),
            (
                SchedulerError::from(ClusterError::ConsistencyViolation("x".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                SchedulerError::Io(std::io::Error::other("disk")),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                SchedulerError::from(ClusterError::Entropy("getrandom failed".into())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(failure(err).status(), status);
        }
    }

    #[tokio::test]
    async fn list_pods_before_init_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let resp = list_pods(State(test_state(&dir))).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn initialize_then_list_pods() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        assert_eq!(initialize(State(state.clone())).await.status(), StatusCode::OK);
        assert_eq!(initialize(State(state.clone())).await.status(), StatusCode::OK);
        assert_eq!(list_pods(State(state)).await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_job_log_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        initialize(State(state.clone())).await;
        let resp = job_log(
            State(state),
            Query(JobQuery {
                job_id: "j9".to_string(),
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn available_reports_false_without_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        initialize(State(state.clone())).await;
        let resp = available(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
