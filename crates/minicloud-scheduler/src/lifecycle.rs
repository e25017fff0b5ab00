//! Job lifecycle — launch, completion callback, abort and logs.
//!
//! `launch` reserves a node through the [`Scheduler`], ships the bundle and
//! returns as soon as the detached exec has started. Completion arrives
//! later through [`JobLifecycle::complete`], driven by the launcher's
//! callback. Abort frees the node immediately and leaves the in-container
//! process alone, so a late callback for an aborted job is rejected.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use minicloud_backend::ExecutionBackend;
use minicloud_state::{ClusterError, Job, NodeId};

use crate::bundle::JobBundle;
use crate::error::{SchedulerError, SchedulerResult, is_safe_ident};
use crate::logs::LogStore;
use crate::notify::Notifier;
use crate::scheduler::Scheduler;

/// Body of the inbound completion callback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionReport {
    pub job_id: String,
    pub node_id: String,
    pub exit_code: i32,
    #[serde(default)]
    pub output: String,
}

pub struct JobLifecycle {
    scheduler: Scheduler,
    backend: Arc<dyn ExecutionBackend>,
    logs: LogStore,
    notifier: Notifier,
    work_dir: PathBuf,
    callback_base: String,
}

impl JobLifecycle {
    pub fn new(
        scheduler: Scheduler,
        backend: Arc<dyn ExecutionBackend>,
        work_dir: PathBuf,
        callback_base: &str,
        manager_base: &str,
    ) -> Self {
        Self {
            scheduler,
            backend,
            logs: LogStore::new(work_dir.clone()),
            notifier: Notifier::new(manager_base),
            work_dir,
            callback_base: callback_base.to_string(),
        }
    }

    /// Start a job on the next available node. Returns the node id.
    pub async fn launch(&self, job_name: &str, job_id: &str, script: Bytes) -> SchedulerResult<NodeId> {
        if !is_safe_ident(job_id) {
            return Err(SchedulerError::InvalidJobId(job_id.to_string()));
        }

        let node_id = self.scheduler.assign(job_id, job_name).await?;
        if let Err(e) = self.ship(&node_id, job_id, script).await {
            warn!(%job_id, %node_id, error = %e, "job launch failed");
            self.fail(&node_id, job_id).await;
            return Err(e);
        }

        info!(%job_id, %job_name, %node_id, "job launched");
        Ok(node_id)
    }

    async fn ship(&self, node_id: &str, job_id: &str, script: Bytes) -> SchedulerResult<()> {
        let bundle = JobBundle::new(job_id, node_id, script, &self.callback_base);
        bundle.persist(&self.work_dir).await?;
        self.backend.push_bundle(node_id, bundle.to_tar()?).await?;
        self.backend.exec_detached(node_id, &bundle.command()).await?;
        Ok(())
    }

    /// Mark a job that never got going as failed and free its node. A no-op
    /// when the job was aborted while the launch was in flight.
    async fn fail(&self, node_id: &str, job_id: &str) {
        let mut cluster = self.scheduler.cluster().lock().await;
        if cluster.running_job_node(job_id).map(String::as_str) != Some(node_id) {
            return;
        }
        let result = cluster
            .take_running_job(job_id)
            .and_then(|_| cluster.hosted_job_mut(node_id, job_id)?.fail())
            .and_then(|()| cluster.release_job_node(node_id));
        if let Err(e) = result {
            error!(%job_id, %node_id, error = %e, "could not record job failure");
        }
    }

    /// Record a job's completion as reported by its launcher.
    ///
    /// A report for a job that is not running, or that names the wrong node,
    /// is a consistency violation and changes nothing.
    pub async fn complete(&self, report: &CompletionReport) -> SchedulerResult<()> {
        let CompletionReport {
            job_id, node_id, ..
        } = report;
        {
            let mut cluster = self.scheduler.cluster().lock().await;
            match cluster.running_job_node(job_id) {
                None => {
                    error!(%job_id, %node_id, "completion callback for a job that is not running");
                    return Err(ClusterError::ConsistencyViolation(format!(
                        "completion reported for job {job_id}, which is not running"
                    ))
                    .into());
                }
                Some(bound) if bound != node_id => {
                    error!(%job_id, %node_id, %bound, "completion callback names the wrong node");
                    return Err(ClusterError::ConsistencyViolation(format!(
                        "job {job_id} runs on {bound}, not {node_id}"
                    ))
                    .into());
                }
                Some(_) => {}
            }

            cluster.take_running_job(job_id)?;
            cluster
                .hosted_job_mut(node_id, job_id)?
                .complete(report.exit_code)?;
            cluster.release_job_node(node_id)?;
        }

        // The job is already committed; a lost log must not hide that.
        if let Err(e) = self.logs.write(node_id, job_id, &report.output).await {
            error!(%job_id, %node_id, error = %e, "job log could not be persisted");
        }
        self.notifier.notify_completion(job_id);
        info!(%job_id, %node_id, exit_code = report.exit_code, "job completed");
        Ok(())
    }

    /// Abort a running job and free its node. The process inside the
    /// container is not signalled.
    pub async fn abort(&self, job_id: &str) -> SchedulerResult<NodeId> {
        let mut cluster = self.scheduler.cluster().lock().await;
        let node_id = cluster.take_running_job(job_id)?;
        cluster.hosted_job_mut(&node_id, job_id)?.abort()?;
        cluster.release_job_node(&node_id)?;
        info!(%job_id, %node_id, "job aborted");
        Ok(node_id)
    }

    pub async fn jobs(&self, node_id: Option<&str>) -> SchedulerResult<Vec<Job>> {
        Ok(self.scheduler.cluster().lock().await.jobs(node_id)?)
    }

    /// The persisted log of a job, `None` if it has not finished yet.
    pub async fn job_log(&self, job_id: &str) -> SchedulerResult<Option<String>> {
        if !is_safe_ident(job_id) {
            return Err(SchedulerError::InvalidJobId(job_id.to_string()));
        }
        let node_id = {
            let cluster = self.scheduler.cluster().lock().await;
            cluster.find_job(job_id).map(|j| j.node_id.clone())
        };
        let log = match node_id {
            Some(node_id) => self.logs.read_job(&node_id, job_id).await?,
            None => self.logs.find_job(job_id).await?,
        };
        Ok(log)
    }

    /// Every log persisted for a node, `None` if there are none.
    pub async fn node_log(&self, node_id: &str) -> SchedulerResult<Option<String>> {
        if !is_safe_ident(node_id) {
            return Err(SchedulerError::InvalidNodeName(node_id.to_string()));
        }
        Ok(self.logs.read_node(node_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minicloud_backend::MemoryBackend;
    use minicloud_backend::memory::Op;
    use minicloud_core::TierLimits;
    use minicloud_state::{Cluster, ClusterSettings, JobNodeStatus, JobStatus, Node};
    use tokio::sync::Mutex;

    struct Fixture {
        jobs: JobLifecycle,
        scheduler: Scheduler,
        backend: Arc<MemoryBackend>,
        dir: tempfile::TempDir,
    }

    async fn fixture(nodes: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
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
        for name in nodes {
            let spec = minicloud_backend::NodeSpec::new("ubuntu", name);
            let id = backend.create_node(&spec).await.unwrap();
            backend.start_node(&id).await.unwrap();
            cluster.add_node(Node::job(&id[..12], name, &pod)).unwrap();
        }
        let scheduler = Scheduler::new(Arc::new(Mutex::new(cluster)));
        let jobs = JobLifecycle::new(
            scheduler.clone(),
            backend.clone(),
            dir.path().to_path_buf(),
            "http://callback:8000",
            "http://127.0.0.1:1",
        );
        Fixture {
            jobs,
            scheduler,
            backend,
            dir,
        }
    }

    fn report(job_id: &str, node_id: &str, output: &str) -> CompletionReport {
        CompletionReport {
            job_id: job_id.to_string(),
            node_id: node_id.to_string(),
            exit_code: 0,
            output: output.to_string(),
        }
    }

    #[tokio::test]
    async fn launch_ships_bundle_and_runs_detached() {
        let f = fixture(&["w1"]).await;
        let node = f
            .jobs
            .launch("build", "j1", Bytes::from_static(b"echo hi"))
            .await
            .unwrap();

        let container = f.backend.container(&node).unwrap();
        assert_eq!(container.bundles.len(), 1);
        assert_eq!(
            container.execs,
            vec![vec!["/bin/bash".to_string(), "/minicloud/jobs/j1/run.sh".to_string()]]
        );
        assert!(f.dir.path().join(&node).join("j1").join("script.sh").exists());
        assert!(!f.scheduler.has_available_nodes().await);
    }

    #[tokio::test]
    async fn launch_then_complete_frees_node() {
        let f = fixture(&["w1"]).await;
        let node = f
            .jobs
            .launch("build", "j1", Bytes::from_static(b"echo hi"))
            .await
            .unwrap();

        let mut done = report("j1", &node, "hi\n");
        done.exit_code = 3;
        f.jobs.complete(&done).await.unwrap();

        assert!(f.scheduler.has_available_nodes().await);
        let jobs = f.jobs.jobs(None).await.unwrap();
        assert_eq!(jobs[0].status, JobStatus::Completed);
        assert_eq!(jobs[0].exit_code, Some(3));
        assert_eq!(f.jobs.job_log("j1").await.unwrap().as_deref(), Some("hi\n"));
        assert!(f.jobs.node_log(&node).await.unwrap().unwrap().contains("hi"));
        f.scheduler.cluster().lock().await.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn second_launch_on_busy_node_is_rejected() {
        let f = fixture(&["w1"]).await;
        f.jobs.launch("a", "j1", Bytes::new()).await.unwrap();
        let err = f.jobs.launch("b", "j2", Bytes::new()).await.unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Cluster(ClusterError::NoAvailableNodes)
        ));
    }

    #[tokio::test]
    async fn backend_failure_marks_job_failed() {
        let f = fixture(&["w1"]).await;
        f.backend.fail(Op::Exec);
        let err = f.jobs.launch("a", "j1", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Backend(_)));

        let jobs = f.jobs.jobs(None).await.unwrap();
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert!(f.scheduler.has_available_nodes().await);
        f.scheduler.cluster().lock().await.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn abort_frees_node_and_rejects_late_callback() {
        let f = fixture(&["w2"]).await;
        let node = f.jobs.launch("a", "j2", Bytes::new()).await.unwrap();

        assert_eq!(f.jobs.abort("j2").await.unwrap(), node);
        {
            let cluster = f.scheduler.cluster().lock().await;
            let status = cluster.node(&node).unwrap().as_job_node().unwrap().status;
            assert_eq!(status, JobNodeStatus::Idle);
            assert_eq!(cluster.available_nodes(), vec![node.clone()]);
        }

        let err = f.jobs.complete(&report("j2", &node, "late")).await.unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Cluster(ClusterError::ConsistencyViolation(_))
        ));
        let jobs = f.jobs.jobs(None).await.unwrap();
        assert_eq!(jobs[0].status, JobStatus::Aborted);
        assert_eq!(f.jobs.job_log("j2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn abort_unknown_job_is_not_found() {
        let f = fixture(&["w1"]).await;
        let err = f.jobs.abort("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn callback_naming_wrong_node_changes_nothing() {
        let f = fixture(&["w1", "w2"]).await;
        let node = f.jobs.launch("a", "j1", Bytes::new()).await.unwrap();
        assert!(f.jobs.complete(&report("j1", "elsewhere", "")).await.is_err());

        let cluster = f.scheduler.cluster().lock().await;
        assert_eq!(cluster.running_job_node("j1"), Some(&node));
        cluster.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn unsafe_job_id_rejected() {
        let f = fixture(&["w1"]).await;
        let err = f.jobs.launch("a", "../x", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidJobId(_)));
        assert!(f.scheduler.has_available_nodes().await);
    }

    #[tokio::test]
    async fn unwritable_log_still_completes_and_notifies() {
        use std::time::Duration;
        use tokio::io::AsyncReadExt;

        let f = fixture(&["w1"]).await;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let jobs = JobLifecycle::new(
            f.scheduler.clone(),
            f.backend.clone(),
            f.dir.path().to_path_buf(),
            "http://callback:8000",
            &format!("http://{}", listener.local_addr().unwrap()),
        );
        let node = jobs.launch("a", "j1", Bytes::new()).await.unwrap();

        // A directory where the log file belongs.
        std::fs::create_dir_all(f.dir.path().join(&node).join("j1.log")).unwrap();

        jobs.complete(&report("j1", &node, "out")).await.unwrap();
        assert!(f.scheduler.has_available_nodes().await);
        assert_eq!(jobs.jobs(None).await.unwrap()[0].status, JobStatus::Completed);

        let (mut socket, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let mut received = String::new();
        let mut buf = vec![0u8; 4096];
        while !received.contains(r#"{"job_id":"j1"}"#) {
            let n = socket.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed before the notice arrived");
            received.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
    }
}
