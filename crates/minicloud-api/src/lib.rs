//! minicloud-api — HTTP surface for operators, the upstream manager and
//! job launchers.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/cloud` | Initialize the cluster |
//! | GET / POST / DELETE | `/cloud/pod` | List, register, remove pods |
//! | GET / POST / DELETE | `/cloud/node` | List, register, remove nodes |
//! | GET | `/cloud/node/log` | All job logs of a node |
//! | GET / POST / DELETE | `/cloud/job` | List, launch, abort jobs |
//! | GET | `/cloud/job/log` | Log of one job |
//! | GET | `/cloud/server` | Live server stats of a pod |
//! | POST | `/cloud/server/{launch,pause,resume}` | Server operations on a pod |
//! | POST | `/cloud/elasticity/{lower,upper}` | Threshold setters |
//! | POST | `/cloud/elasticity/{enable,disable}` | Elasticity switch |
//! | POST | `/internal/callback` | Job completion callback |
//! | GET | `/internal/available` | Whether a job node is assignable |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use minicloud_autoscale::ElasticityController;
use minicloud_scheduler::ClusterManager;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<ClusterManager>,
    pub controller: Arc<ElasticityController>,
}

/// Build the complete router.
pub fn build_router(manager: Arc<ClusterManager>, controller: Arc<ElasticityController>) -> Router {
    let state = ApiState {
        manager,
        controller,
    };

    Router::new()
        .route("/cloud", post(handlers::initialize))
        .route(
            "/cloud/pod",
            get(handlers::list_pods)
                .post(handlers::register_pod)
                .delete(handlers::remove_pod),
        )
        .route(
            "/cloud/node",
            get(handlers::list_nodes)
                .post(handlers::register_node)
                .delete(handlers::remove_node),
        )
        .route("/cloud/node/log", get(handlers::node_log))
        .route(
            "/cloud/job",
            get(handlers::list_jobs)
                .post(handlers::launch_job)
                .delete(handlers::abort_job),
        )
        .route("/cloud/job/log", get(handlers::job_log))
        .route("/cloud/server", get(handlers::server_stats))
        .route("/cloud/server/launch", post(handlers::launch_servers))
        .route("/cloud/server/pause", post(handlers::pause_servers))
        .route("/cloud/server/resume", post(handlers::resume_servers))
        .route("/cloud/elasticity/lower", post(handlers::set_lower_threshold))
        .route("/cloud/elasticity/upper", post(handlers::set_upper_threshold))
        .route("/cloud/elasticity/enable", post(handlers::enable_elasticity))
        .route("/cloud/elasticity/disable", post(handlers::disable_elasticity))
        .route("/internal/callback", post(handlers::job_callback))
        .route("/internal/available", get(handlers::available))
        .with_state(state)
}
