//! Provisioner — pods, nodes and server lifecycle against the backend.
//!
//! Structural changes to a pod are serialized by a per-pod async guard
//! held across the backend calls. The registry lock is taken only for the
//! bookkeeping before and after each call. When a backend step succeeds but
//! the registry step after it fails, the container is torn down again.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use minicloud_backend::{ExecutionBackend, NodeSpec};
use minicloud_core::{MinicloudConfig, TierLimits};
use minicloud_state::*;

use crate::error::{SchedulerError, SchedulerResult, is_safe_ident};
use crate::logs::LogStore;
use crate::scheduler::SharedCluster;

/// Grace period given to a server container on stop.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Length of a node id, taken from the front of the container id.
const NODE_ID_LEN: usize = 12;

const JOB_NODE_COMMAND: [&str; 3] = ["tail", "-f", "/dev/null"];

/// How node containers are built.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub job_image: String,
    pub server_image: String,
    pub server_command: Vec<String>,
    /// Port the service listens on inside a server container.
    pub server_port: u16,
    pub work_dir: PathBuf,
}

impl NodeSettings {
    pub fn from_config(config: &MinicloudConfig) -> Self {
        Self {
            job_image: config.cluster.job_image.clone(),
            server_image: config.cluster.server_image.clone(),
            server_command: config.cluster.server_command.clone().unwrap_or_default(),
            server_port: config.cluster.server_port,
            work_dir: PathBuf::from(&config.cluster.work_dir),
        }
    }
}

/// Proof that the holder has exclusive structural access to one pod.
pub struct PodGuard {
    pod_id: PodId,
    _guard: OwnedMutexGuard<()>,
}

impl PodGuard {
    pub fn pod_id(&self) -> &str {
        &self.pod_id
    }
}

/// Live resource figures of one server node.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStats {
    pub node_id: NodeId,
    pub node_name: String,
    pub status: String,
    pub port: u16,
    pub cpu_percent: f64,
    pub mem_bytes: u64,
    pub network_in: u64,
    pub network_out: u64,
}

pub struct Provisioner {
    cluster: SharedCluster,
    backend: Arc<dyn ExecutionBackend>,
    settings: NodeSettings,
    logs: LogStore,
    pod_locks: Mutex<HashMap<PodId, Arc<Mutex<()>>>>,
    init_lock: Mutex<()>,
}

impl Provisioner {
    pub fn new(
        cluster: SharedCluster,
        backend: Arc<dyn ExecutionBackend>,
        settings: NodeSettings,
    ) -> Self {
        let logs = LogStore::new(settings.work_dir.clone());
        Self {
            cluster,
            backend,
            settings,
            logs,
            pod_locks: Mutex::new(HashMap::new()),
            init_lock: Mutex::new(()),
        }
    }

    pub fn cluster(&self) -> &SharedCluster {
        &self.cluster
    }

    pub fn backend(&self) -> &Arc<dyn ExecutionBackend> {
        &self.backend
    }

    // ── Initialization ─────────────────────────────────────────────

    /// Wipe leftovers of a previous run and initialize the registry.
    ///
    /// Returns `false` (and does nothing) when already initialized.
    pub async fn initialize(&self, limits: TierLimits) -> SchedulerResult<bool> {
        let _init = self.init_lock.lock().await;
        if self.cluster.lock().await.is_initialized() {
            debug!("initialize: already initialized");
            return Ok(false);
        }

        self.backend.pull_image(&self.settings.job_image).await?;
        let purged = self.backend.purge_managed().await?;
        self.logs.clear().await?;

        let fresh = self.cluster.lock().await.initialize(limits)?;
        info!(purged, work_dir = %self.settings.work_dir.display(), "cluster ready");
        Ok(fresh)
    }

    // ── Pod guards ─────────────────────────────────────────────────

    /// Guard mutexes exist only for registered pods. Lock order is the
    /// guard map, then the registry.
    async fn pod_lock(&self, pod_id: &str) -> SchedulerResult<Arc<Mutex<()>>> {
        let mut locks = self.pod_locks.lock().await;
        self.cluster.lock().await.pod(pod_id)?;
        Ok(locks.entry(pod_id.to_string()).or_default().clone())
    }

    /// Wait for exclusive structural access to a pod.
    pub async fn lock_pod(&self, pod_id: &str) -> SchedulerResult<PodGuard> {
        let lock = self.pod_lock(pod_id).await?;
        Ok(PodGuard {
            pod_id: pod_id.to_string(),
            _guard: lock.lock_owned().await,
        })
    }

    /// Like [`Provisioner::lock_pod`], but gives up if the pod is busy or
    /// gone.
    pub async fn try_lock_pod(&self, pod_id: &str) -> Option<PodGuard> {
        let lock = self.pod_lock(pod_id).await.ok()?;
        let guard = lock.try_lock_owned().ok()?;
        Some(PodGuard {
            pod_id: pod_id.to_string(),
            _guard: guard,
        })
    }

    // ── Pods ───────────────────────────────────────────────────────

    pub async fn register_pod(&self, name: &str) -> SchedulerResult<PodId> {
        let pod_id = self.cluster.lock().await.register_pod(name)?;
        info!(%pod_id, pod_name = %name, "pod registered");
        Ok(pod_id)
    }

    pub async fn remove_pod(&self, pod_id: &str) -> SchedulerResult<()> {
        let guard = self.lock_pod(pod_id).await?;
        self.cluster.lock().await.remove_pod(guard.pod_id())?;
        self.pod_locks.lock().await.remove(pod_id);
        info!(%pod_id, "pod removed");
        Ok(())
    }

    pub async fn pods(&self) -> SchedulerResult<Vec<PodSummary>> {
        Ok(self.cluster.lock().await.pod_summaries()?)
    }

    pub async fn nodes(&self, pod_id: Option<&str>) -> SchedulerResult<Vec<NodeSummary>> {
        Ok(self.cluster.lock().await.node_summaries(pod_id)?)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Register a node in a pod, or in the default pod when `pod_id` is
    /// `None`. JobNodes start immediately and join the available queue;
    /// ServerNodes stay `New` until launched.
    pub async fn register_node(
        &self,
        node_name: &str,
        node_type: NodeType,
        pod_id: Option<&str>,
    ) -> SchedulerResult<NodeSummary> {
        if !is_safe_ident(node_name) {
            return Err(SchedulerError::InvalidNodeName(node_name.to_string()));
        }
        let pod_id = match pod_id {
            Some(id) => id.to_string(),
            None => self.cluster.lock().await.default_pod_id()?,
        };

        let guard = self.lock_pod(&pod_id).await?;
        let node_id = match node_type {
            NodeType::Job => self.add_job_node(&guard, node_name).await?,
            NodeType::Server => self.add_server_node(&guard, node_name, false).await?.0,
        };

        let cluster = self.cluster.lock().await;
        Ok(NodeSummary::new(cluster.node(&node_id)?, cluster.pod(&pod_id)?))
    }

    async fn add_job_node(&self, guard: &PodGuard, node_name: &str) -> SchedulerResult<NodeId> {
        let pod_id = guard.pod_id();
        let spec = {
            let cluster = self.cluster.lock().await;
            cluster.ensure_node_admissible(pod_id, node_name, NodeType::Job)?;
            let limits = cluster.limits()?;
            NodeSpec::new(&self.settings.job_image, &container_name(pod_id, node_name))
                .command(JOB_NODE_COMMAND)
                .limits(limits.cpu_limit, limits.mem_limit)
        };

        let node_id = short_id(&self.backend.create_node(&spec).await?);
        if let Err(e) = self.backend.start_node(&node_id).await {
            self.discard_container(&node_id).await;
            return Err(e.into());
        }

        let inserted = self
            .cluster
            .lock()
            .await
            .add_node(Node::job(&node_id, node_name, pod_id));
        if let Err(e) = inserted {
            self.discard_container(&node_id).await;
            return Err(e.into());
        }

        info!(%pod_id, %node_id, %node_name, "job node registered");
        Ok(node_id)
    }

    /// Create a server node and start it right away. Used by the elasticity
    /// machinery; the new node is `Online` on return.
    pub async fn add_server(&self, guard: &PodGuard, node_name: &str) -> SchedulerResult<(NodeId, u16)> {
        self.add_server_node(guard, node_name, true).await
    }

    async fn add_server_node(
        &self,
        guard: &PodGuard,
        node_name: &str,
        start: bool,
    ) -> SchedulerResult<(NodeId, u16)> {
        let pod_id = guard.pod_id();
        let (spec, port) = {
            let mut cluster = self.cluster.lock().await;
            cluster.ensure_node_admissible(pod_id, node_name, NodeType::Server)?;
            let mem_limit = cluster.limits()?.mem_limit;
            let servers = cluster.pod(pod_id)?.server_count();
            let cap = cluster.cpu_cap_for(servers + 1)?;
            let port = cluster.allocate_port()?;
            let spec = NodeSpec::new(&self.settings.server_image, &container_name(pod_id, node_name))
                .command(self.settings.server_command.iter().cloned())
                .publish(self.settings.server_port, port)
                .limits(cap, mem_limit);
            (spec, port)
        };

        let node_id = short_id(&self.backend.create_node(&spec).await?);
        if start {
            if let Err(e) = self.backend.start_node(&node_id).await {
                self.discard_container(&node_id).await;
                return Err(e.into());
            }
        }

        let inserted = {
            let mut cluster = self.cluster.lock().await;
            cluster
                .add_node(Node::server(&node_id, node_name, pod_id, port))
                .and_then(|()| {
                    if start {
                        cluster.node_mut(&node_id)?.as_server_node_mut()?.status =
                            ServerNodeStatus::Online;
                    }
                    cluster.recompute_cpu_cap(pod_id)
                })
        };
        if let Err(e) = inserted {
            self.discard_container(&node_id).await;
            return Err(e.into());
        }

        info!(%pod_id, %node_id, %node_name, port, online = start, "server node registered");
        Ok((node_id, port))
    }

    /// Tear a node down in the backend, then drop it from the registry.
    pub async fn remove_node(&self, node_id: &str) -> SchedulerResult<()> {
        let pod_id = self.cluster.lock().await.node(node_id)?.pod_id.clone();
        let guard = self.lock_pod(&pod_id).await?;
        self.remove_node_guarded(&guard, node_id).await
    }

    /// [`Provisioner::remove_node`] for callers already holding the pod guard.
    pub async fn remove_node_guarded(&self, guard: &PodGuard, node_id: &str) -> SchedulerResult<()> {
        let node_type = {
            let mut cluster = self.cluster.lock().await;
            let node = cluster.node(node_id)?;
            if node.pod_id != guard.pod_id() {
                return Err(ClusterError::ConsistencyViolation(format!(
                    "node {node_id} moved out of pod {} while guarded",
                    guard.pod_id()
                ))
                .into());
            }
            let node_type = node.node_type();
            if node_type == NodeType::Job {
                cluster.withdraw_job_node(node_id)?;
            }
            node_type
        };

        if node_type == NodeType::Server {
            if let Err(e) = self.backend.stop_node(node_id, STOP_TIMEOUT).await {
                debug!(%node_id, error = %e, "stop before removal failed, forcing removal");
            }
        }
        if let Err(e) = self.backend.remove_node(node_id, true).await {
            if node_type == NodeType::Job {
                self.cluster.lock().await.restore_job_node(node_id)?;
            }
            return Err(e.into());
        }

        let mut cluster = self.cluster.lock().await;
        cluster.remove_node(node_id)?;
        if node_type == NodeType::Server {
            cluster.recompute_cpu_cap(guard.pod_id())?;
        }
        info!(pod_id = %guard.pod_id(), %node_id, "node removed");
        Ok(())
    }

    /// Tear down every JobNode of a pod, or none when one of them is busy.
    ///
    /// A node whose teardown fails, and every node not yet reached, goes
    /// back to the available queue.
    pub async fn evict_job_nodes(&self, guard: &PodGuard) -> SchedulerResult<Vec<NodeId>> {
        let pod_id = guard.pod_id();
        let withdrawn = self.cluster.lock().await.withdraw_pod_job_nodes(pod_id)?;

        for (i, node_id) in withdrawn.iter().enumerate() {
            if let Err(e) = self.backend.remove_node(node_id, true).await {
                let mut cluster = self.cluster.lock().await;
                for pending in &withdrawn[i..] {
                    cluster.restore_job_node(pending)?;
                }
                warn!(%pod_id, %node_id, error = %e, "job node eviction failed, remaining nodes restored");
                return Err(e.into());
            }
            self.cluster.lock().await.remove_node(node_id)?;
            info!(%pod_id, %node_id, "job node evicted");
        }
        Ok(withdrawn)
    }

    async fn discard_container(&self, node_id: &str) {
        if let Err(e) = self.backend.remove_node(node_id, true).await {
            error!(
                %node_id,
                error = %e,
                "rollback failed: container exists in the backend but not in the registry"
            );
        } else {
            warn!(%node_id, "container rolled back");
        }
    }

    // ── Server operations ──────────────────────────────────────────

    /// Start every server node of a pod that is not yet online.
    pub async fn launch_servers(&self, pod_id: &str) -> SchedulerResult<Vec<(NodeId, u16)>> {
        let guard = self.lock_pod(pod_id).await?;
        let targets = self
            .servers_where(guard.pod_id(), |s| s != ServerNodeStatus::Online)
            .await?;

        let mut launched = Vec::new();
        for (node_id, port) in targets {
            self.backend.start_node(&node_id).await?;
            self.set_server_status(&node_id, ServerNodeStatus::Online).await?;
            launched.push((node_id, port));
        }

        let cap = self.cluster.lock().await.recompute_cpu_cap(guard.pod_id())?;
        info!(%pod_id, launched = launched.len(), cpu_cap = cap, "servers launched");
        Ok(launched)
    }

    /// Stop every online server node of a pod.
    pub async fn pause_servers(&self, pod_id: &str) -> SchedulerResult<Vec<NodeId>> {
        let guard = self.lock_pod(pod_id).await?;
        let targets = self
            .servers_where(guard.pod_id(), |s| s == ServerNodeStatus::Online)
            .await?;

        let mut paused = Vec::new();
        for (node_id, _) in targets {
            self.backend.stop_node(&node_id, STOP_TIMEOUT).await?;
            self.set_server_status(&node_id, ServerNodeStatus::Paused).await?;
            paused.push(node_id);
        }
        info!(%pod_id, paused = paused.len(), "servers paused");
        Ok(paused)
    }

    /// Restart every paused server node of a pod.
    pub async fn resume_servers(&self, pod_id: &str) -> SchedulerResult<Vec<NodeId>> {
        let guard = self.lock_pod(pod_id).await?;
        let targets = self
            .servers_where(guard.pod_id(), |s| s == ServerNodeStatus::Paused)
            .await?;

        let mut resumed = Vec::new();
        for (node_id, _) in targets {
            self.backend.start_node(&node_id).await?;
            self.set_server_status(&node_id, ServerNodeStatus::Online).await?;
            resumed.push(node_id);
        }
        info!(%pod_id, resumed = resumed.len(), "servers resumed");
        Ok(resumed)
    }

    /// Live stats for one server node of a pod, or for all of them.
    pub async fn server_stats(
        &self,
        pod_id: &str,
        node_id: Option<&str>,
    ) -> SchedulerResult<Vec<ServerStats>> {
        let (cap, targets) = {
            let cluster = self.cluster.lock().await;
            let pod = cluster.pod(pod_id)?;
            let targets: Vec<(NodeId, String, String, u16)> = match node_id {
                Some(id) => {
                    let node = pod
                        .node(id)
                        .ok_or_else(|| ClusterError::NodeNotFound(id.to_string()))?;
                    let server = node.as_server_node().ok_or_else(|| ClusterError::WrongNodeKind {
                        node_id: id.to_string(),
                        expected: NodeType::Server,
                    })?;
                    vec![(
                        node.node_id.clone(),
                        node.node_name.clone(),
                        node.status_label().to_string(),
                        server.port,
                    )]
                }
                None => pod
                    .server_nodes()
                    .filter_map(|n| {
                        n.as_server_node().map(|s| {
                            (
                                n.node_id.clone(),
                                n.node_name.clone(),
                                n.status_label().to_string(),
                                s.port,
                            )
                        })
                    })
                    .collect(),
            };
            (pod.cpu_percent_cap, targets)
        };

        let mut out = Vec::with_capacity(targets.len());
        for (node_id, node_name, status, port) in targets {
            let stats = self.backend.stats(&node_id).await?;
            out.push(ServerStats {
                node_id,
                node_name,
                status,
                port,
                cpu_percent: stats.cpu_percent(cap),
                mem_bytes: stats.mem_usage,
                network_in: stats.network_in,
                network_out: stats.network_out,
            });
        }
        Ok(out)
    }

    async fn servers_where(
        &self,
        pod_id: &str,
        pred: impl Fn(ServerNodeStatus) -> bool,
    ) -> SchedulerResult<Vec<(NodeId, u16)>> {
        let cluster = self.cluster.lock().await;
        Ok(cluster
            .pod(pod_id)?
            .server_nodes()
            .filter_map(|n| n.as_server_node().map(|s| (n, s)))
            .filter(|(_, s)| pred(s.status))
            .map(|(n, s)| (n.node_id.clone(), s.port))
            .collect())
    }

    async fn set_server_status(&self, node_id: &str, status: ServerNodeStatus) -> SchedulerResult<()> {
        self.cluster
            .lock()
            .await
            .node_mut(node_id)?
            .as_server_node_mut()?
            .status = status;
        Ok(())
    }
}

fn container_name(pod_id: &str, node_name: &str) -> String {
    format!("{pod_id}_{node_name}")
}

fn short_id(container_id: &str) -> NodeId {
    container_id.chars().take(NODE_ID_LEN).collect()
}
