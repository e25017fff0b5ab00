//! Scheduler — hands idle JobNodes to incoming jobs.
//!
//! Assignment is the check-pop-mark sequence over the available queue. It
//! runs entirely under the registry lock so two concurrent launches can
//! never observe the same node as idle. Nothing in here awaits anything
//! but that lock.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use minicloud_state::{Cluster, ClusterError, NodeId};

use crate::error::SchedulerResult;

/// The registry shared by request handlers and the elasticity loop.
pub type SharedCluster = Arc<Mutex<Cluster>>;

#[derive(Clone)]
pub struct Scheduler {
    cluster: SharedCluster,
}

impl Scheduler {
    pub fn new(cluster: SharedCluster) -> Self {
        Self { cluster }
    }

    pub fn cluster(&self) -> &SharedCluster {
        &self.cluster
    }

    /// Bind a new job to the head of the available queue.
    ///
    /// On return the job is `Running`, indexed, and its node is `Running`.
    pub async fn assign(&self, job_id: &str, job_name: &str) -> SchedulerResult<NodeId> {
        let mut cluster = self.cluster.lock().await;

        // Reject reused ids before touching the queue.
        if cluster.find_job(job_id).is_some() {
            return Err(ClusterError::DuplicateJobId(job_id.to_string()).into());
        }

        let node_id = cluster.pop_available_job_node()?;
        if let Err(e) = cluster.bind_job(&node_id, job_id, job_name) {
            cluster.release_job_node(&node_id)?;
            return Err(e.into());
        }

        debug!(%job_id, %node_id, "job assigned");
        Ok(node_id)
    }

    /// Return a JobNode to the tail of the available queue.
    pub async fn release(&self, node_id: &str) -> SchedulerResult<()> {
        self.cluster.lock().await.release_job_node(node_id)?;
        debug!(%node_id, "node released");
        Ok(())
    }

    pub async fn has_available_nodes(&self) -> bool {
        self.cluster.lock().await.has_available_nodes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minicloud_core::TierLimits;
    use minicloud_state::{ClusterSettings, JobNodeStatus, Node};

    async fn scheduler_with_nodes(ids: &[&str]) -> Scheduler {
        let mut cluster = Cluster::new(ClusterSettings::default());
        cluster
            .initialize(TierLimits {
                name: "small".to_string(),
                cpu_limit: 0.5,
                mem_limit: 1 << 29,
                node_limit: 3,
                cpu_available: 0.5,
            })
            .unwrap();
        let pod = cluster.default_pod_id().unwrap();
        for id in ids {
            cluster.add_node(Node::job(id, id, &pod)).unwrap();
        }
        Scheduler::new(Arc::new(Mutex::new(cluster)))
    }

    #[tokio::test]
    async fn second_assign_on_single_node_finds_nothing() {
        let scheduler = scheduler_with_nodes(&["w1"]).await;
        assert_eq!(scheduler.assign("j1", "first").await.unwrap(), "w1");
        assert!(!scheduler.has_available_nodes().await);

        let err = scheduler.assign("j2", "second").await.unwrap_err();
        assert!(matches!(
            err,
            crate::SchedulerError::Cluster(ClusterError::NoAvailableNodes)
        ));
    }

    #[tokio::test]
    async fn concurrent_assigns_never_share_a_node() {
        let scheduler = scheduler_with_nodes(&["a", "b", "c"]).await;
        let mut handles = Vec::new();
        for i in 0..6 {
            let s = scheduler.clone();
            handles.push(tokio::spawn(async move { s.assign(&format!("j{i}"), "job").await }));
        }

        let mut assigned = Vec::new();
        for h in handles {
            if let Ok(node) = h.await.unwrap() {
                assigned.push(node);
            }
        }
        assigned.sort();
        assert_eq!(assigned, vec!["a", "b", "c"]);

        let cluster = scheduler.cluster().lock().await;
        assert_eq!(cluster.running_count(), 3);
        cluster.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn duplicate_job_id_leaves_queue_untouched() {
        let scheduler = scheduler_with_nodes(&["a", "b"]).await;
        scheduler.assign("j1", "job").await.unwrap();
        assert!(scheduler.assign("j1", "again").await.is_err());

        let cluster = scheduler.cluster().lock().await;
        assert_eq!(cluster.available_nodes(), vec!["b"]);
        cluster.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn release_appends_to_tail() {
        let scheduler = scheduler_with_nodes(&["a", "b"]).await;
        let node = scheduler.assign("j1", "job").await.unwrap();
        {
            let mut cluster = scheduler.cluster().lock().await;
            cluster.take_running_job("j1").unwrap();
        }
        scheduler.release(&node).await.unwrap();

        let cluster = scheduler.cluster().lock().await;
        assert_eq!(cluster.available_nodes(), vec!["b", "a"]);
        let status = cluster.node("a").unwrap().as_job_node().unwrap().status;
        assert_eq!(status, JobNodeStatus::Idle);
    }
}
