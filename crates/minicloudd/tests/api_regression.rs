//! API regression tests.
//!
//! Drives the full router against the in-memory backend: pods, job nodes,
//! the job lifecycle with its completion callback, and elastic server pods.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use minicloud_api::build_router;
use minicloud_autoscale::{ElasticityController, ScaleDecision};
use minicloud_backend::MemoryBackend;
use minicloud_backend::memory::Op;
use minicloud_core::MinicloudConfig;
use minicloud_scheduler::ClusterManager;

struct Harness {
    router: Router,
    controller: Arc<ElasticityController>,
    backend: Arc<MemoryBackend>,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = MinicloudConfig::scaffold("http://127.0.0.1:1", "http://callback");
    config.cluster.work_dir = dir.path().join("work").display().to_string();

    let backend = Arc::new(MemoryBackend::new());
    let manager = Arc::new(ClusterManager::from_config(&config, backend.clone()).unwrap());
    let controller = Arc::new(ElasticityController::new(manager.clone()));
    Harness {
        router: build_router(manager, controller.clone()),
        controller,
        backend,
        _dir: dir,
    }
}

async fn call(router: &Router, method: &str, uri: &str, body: Body) -> (StatusCode, Value) {
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body)
        .unwrap();
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn get(router: &Router, uri: &str) -> (StatusCode, Value) {
    call(router, "GET", uri, Body::empty()).await
}

async fn post(router: &Router, uri: &str) -> (StatusCode, Value) {
    call(router, "POST", uri, Body::empty()).await
}

/// Initialize and create pod `batch` with one job node `w1`.
async fn batch_pod(h: &Harness) -> (String, String) {
    let (status, _) = post(&h.router, "/cloud").await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = post(&h.router, "/cloud/pod?pod_name=batch").await;
    assert_eq!(status, StatusCode::CREATED);
    let pod_id = body["data"]["pod_id"].as_str().unwrap().to_string();

    let (status, body) = post(
        &h.router,
        &format!("/cloud/node?node_name=w1&node_type=job&pod_id={pod_id}"),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["status"], "idle");
    let node_id = body["data"]["node_id"].as_str().unwrap().to_string();
    (pod_id, node_id)
}

async fn callback(router: &Router, job_id: &str, node_id: &str, output: &str) -> StatusCode {
    let report = json!({
        "job_id": job_id,
        "node_id": node_id,
        "exit_code": 0,
        "output": output,
    });
    call(
        router,
        "POST",
        "/internal/callback",
        Body::from(report.to_string()),
    )
    .await
    .0
}

#[tokio::test]
async fn routes_refuse_work_before_initialize() {
    let h = harness();
    let (status, body) = get(&h.router, "/cloud/pod").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);

    let (status, _) = post(&h.router, "/cloud/pod?pod_name=batch").await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn initialize_is_idempotent_and_creates_default_pod() {
    let h = harness();
    let (_, first) = post(&h.router, "/cloud").await;
    assert_eq!(first["data"]["initialized"], true);
    assert_eq!(first["data"]["tier"], "small");

    let (status, second) = post(&h.router, "/cloud").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["data"]["initialized"], false);

    let (_, pods) = get(&h.router, "/cloud/pod").await;
    let pods = pods["data"].as_array().unwrap();
    assert_eq!(pods.len(), 1);
    assert_eq!(pods[0]["pod_name"], "default");
}

#[tokio::test]
async fn job_runs_to_completion_through_callback() {
    let h = harness();
    let (pod_id, node_id) = batch_pod(&h).await;

    let (status, body) = call(
        &h.router,
        "POST",
        "/cloud/job?job_name=hello&job_id=j1",
        Body::from("echo hello"),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["data"]["node_id"], node_id.as_str());
    assert_eq!(body["data"]["node_name"], "w1");
    assert_eq!(body["data"]["pod_id"], pod_id.as_str());

    let container = h.backend.container(&node_id).unwrap();
    assert_eq!(container.bundles.len(), 1);
    assert_eq!(container.execs.len(), 1);

    let (_, availability) = get(&h.router, "/internal/available").await;
    assert_eq!(availability["data"]["available"], false);

    // Only node is busy.
    let (status, _) = call(
        &h.router,
        "POST",
        "/cloud/job?job_name=hello&job_id=j2",
        Body::from("echo again"),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    assert_eq!(callback(&h.router, "j1", &node_id, "hello\n").await, StatusCode::OK);

    let (_, availability) = get(&h.router, "/internal/available").await;
    assert_eq!(availability["data"]["available"], true);

    let (_, jobs) = get(&h.router, &format!("/cloud/job?node_id={node_id}")).await;
    let jobs = jobs["data"].as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["status"], "completed");
    assert_eq!(jobs[0]["exit_code"], 0);

    let (status, log) = get(&h.router, "/cloud/job/log?job_id=j1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(log["data"], "hello\n");

    let (status, log) = get(&h.router, &format!("/cloud/node/log?node_id={node_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(log["data"].as_str().unwrap().contains("hello"));
}

#[tokio::test]
async fn duplicate_job_id_is_rejected() {
    let h = harness();
    let (_, node_id) = batch_pod(&h).await;
    post(&h.router, "/cloud/job?job_name=a&job_id=j1").await;
    callback(&h.router, "j1", &node_id, "").await;

    let (status, _) = post(&h.router, "/cloud/job?job_name=b&job_id=j1").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn late_callback_after_abort_is_a_consistency_violation() {
    let h = harness();
    let (_, node_id) = batch_pod(&h).await;
    post(&h.router, "/cloud/job?job_name=slow&job_id=j1").await;

    let (status, body) = call(&h.router, "DELETE", "/cloud/job?job_id=j1", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["node_id"], node_id.as_str());

    assert_eq!(
        callback(&h.router, "j1", &node_id, "too late").await,
        StatusCode::INTERNAL_SERVER_ERROR
    );

    let (_, jobs) = get(&h.router, "/cloud/job").await;
    assert_eq!(jobs["data"][0]["status"], "aborted");
    let (_, availability) = get(&h.router, "/internal/available").await;
    assert_eq!(availability["data"]["available"], true);
}

#[tokio::test]
async fn failed_launch_marks_job_failed_and_frees_node() {
    let h = harness();
    batch_pod(&h).await;
    h.backend.fail(Op::Exec);

    let (status, _) = post(&h.router, "/cloud/job?job_name=x&job_id=j1").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let (_, jobs) = get(&h.router, "/cloud/job").await;
    assert_eq!(jobs["data"][0]["status"], "failed");
    let (_, availability) = get(&h.router, "/internal/available").await;
    assert_eq!(availability["data"]["available"], true);
}

#[tokio::test]
async fn unsafe_job_id_is_rejected() {
    let h = harness();
    batch_pod(&h).await;
    let (status, _) = post(&h.router, "/cloud/job?job_name=x&job_id=..%2Fetc").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let h = harness();
    post(&h.router, "/cloud").await;

    let (status, _) = call(&h.router, "DELETE", "/cloud/pod?pod_id=nope", Body::empty()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = call(&h.router, "DELETE", "/cloud/node?node_id=nope", Body::empty()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = get(&h.router, "/cloud/job/log?job_id=nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn pod_with_nodes_cannot_be_removed() {
    let h = harness();
    let (pod_id, node_id) = batch_pod(&h).await;

    let uri = format!("/cloud/pod?pod_id={pod_id}");
    let (status, _) = call(&h.router, "DELETE", &uri, Body::empty()).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let node_uri = format!("/cloud/node?node_id={node_id}");
    let (status, _) = call(&h.router, "DELETE", &node_uri, Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert!(h.backend.container(&node_id).is_none());

    let (status, _) = call(&h.router, "DELETE", &uri, Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn server_nodes_launch_pause_and_resume() {
    let h = harness();
    post(&h.router, "/cloud").await;
    let (_, pod) = post(&h.router, "/cloud/pod?pod_name=web").await;
    let pod_id = pod["data"]["pod_id"].as_str().unwrap().to_string();

    let (_, node) = post(
        &h.router,
        &format!("/cloud/node?node_name=s1&node_type=server&pod_id={pod_id}"),
    )
    .await;
    assert_eq!(node["data"]["status"], "new");

    let (status, launched) = post(&h.router, &format!("/cloud/server/launch?pod_id={pod_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(launched["data"].as_array().unwrap().len(), 1);
    assert_eq!(launched["data"][0]["port"], node["data"]["port"]);

    let (_, paused) = post(&h.router, &format!("/cloud/server/pause?pod_id={pod_id}")).await;
    assert_eq!(paused["data"].as_array().unwrap().len(), 1);
    let (_, nodes) = get(&h.router, &format!("/cloud/node?pod_id={pod_id}")).await;
    assert_eq!(nodes["data"][0]["status"], "paused");

    let (_, resumed) = post(&h.router, &format!("/cloud/server/resume?pod_id={pod_id}")).await;
    assert_eq!(resumed["data"].as_array().unwrap().len(), 1);

    let (status, stats) = get(&h.router, &format!("/cloud/server?pod_id={pod_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn elastic_pod_scales_with_load() {
    let h = harness();
    post(&h.router, "/cloud").await;
    let (_, pod) = post(&h.router, "/cloud/pod?pod_name=web").await;
    let pod_id = pod["data"]["pod_id"].as_str().unwrap().to_string();

    let (status, body) = post(
        &h.router,
        &format!("/cloud/elasticity/enable?pod_id={pod_id}&min_nodes=2&max_nodes=3"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["is_elastic"], true);
    assert_eq!(body["data"]["total_nodes"], 2);

    // Job nodes are refused once the pod is elastic.
    let (status, _) = post(
        &h.router,
        &format!("/cloud/node?node_name=w1&node_type=job&pod_id={pod_id}"),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Each of two servers gets 0.25 CPU; 0.24 used is 96%.
    h.backend.set_cpu_all(0.24);
    let decisions = h.controller.tick().await;
    assert_eq!(decisions, vec![(pod_id.clone(), ScaleDecision::ScaleUp)]);

    let (_, nodes) = get(&h.router, &format!("/cloud/node?pod_id={pod_id}")).await;
    assert_eq!(nodes["data"].as_array().unwrap().len(), 3);

    let (status, _) = post(
        &h.router,
        &format!("/cloud/elasticity/lower?pod_id={pod_id}&value=90"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post(&h.router, &format!("/cloud/elasticity/disable?pod_id={pod_id}")).await;
    assert_eq!(status, StatusCode::OK);
    let (_, pods) = get(&h.router, "/cloud/pod").await;
    let web = pods["data"]
        .as_array()
        .unwrap()
        .iter()
        .find(|p| p["pod_id"] == pod_id.as_str())
        .unwrap()
        .clone();
    assert_eq!(web["is_elastic"], false);
    assert_eq!(web["total_nodes"], 3);
}
