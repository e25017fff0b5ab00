//! Cluster — the single authoritative in-memory registry.
//!
//! Owns pods (and through them nodes and job records), the cluster-wide
//! node index, the FIFO queue of idle JobNodes, the running-jobs index and
//! the server port counter. Every method is synchronous; callers hold the
//! registry lock only for the duration of one call or one composed
//! bookkeeping step, never across backend I/O.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, info};

use minicloud_core::TierLimits;

use crate::error::{ClusterError, ClusterResult};
use crate::ids::random_id;
use crate::types::*;

/// Name of the pod created by [`Cluster::initialize`].
pub const DEFAULT_POD: &str = "default";

const POD_ID_LEN: usize = 12;

/// Construction-time settings that do not depend on the tier.
#[derive(Debug, Clone)]
pub struct ClusterSettings {
    /// First port handed out by [`Cluster::allocate_port`].
    pub port_base: u16,
    /// Thresholds given to newly registered pods.
    pub lower_threshold: f64,
    pub upper_threshold: f64,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            port_base: 10000,
            lower_threshold: 20.0,
            upper_threshold: 80.0,
        }
    }
}

pub struct Cluster {
    settings: ClusterSettings,
    /// `Some` once initialized.
    limits: Option<TierLimits>,
    pods: HashMap<PodId, Pod>,
    /// Cluster-wide index: node id → owning pod id.
    node_index: HashMap<NodeId, PodId>,
    /// Idle JobNodes, oldest-released first.
    available: VecDeque<NodeId>,
    /// Running jobs: job id → hosting node id.
    running: HashMap<JobId, NodeId>,
    next_port: u32,
    /// Pod and node ids that have been removed; never handed out again.
    retired: HashSet<String>,
}

impl Cluster {
    pub fn new(settings: ClusterSettings) -> Self {
        let next_port = settings.port_base as u32;
        Self {
            settings,
            limits: None,
            pods: HashMap::new(),
            node_index: HashMap::new(),
            available: VecDeque::new(),
            running: HashMap::new(),
            next_port,
            retired: HashSet::new(),
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    pub fn is_initialized(&self) -> bool {
        self.limits.is_some()
    }

    /// Record the tier limits and create the default pod.
    ///
    /// Returns `false` without touching anything if already initialized.
    pub fn initialize(&mut self, limits: TierLimits) -> ClusterResult<bool> {
        if self.limits.is_some() {
            debug!("cluster already initialized");
            return Ok(false);
        }
        info!(
            tier = %limits.name,
            cpu_limit = limits.cpu_limit,
            mem_limit = limits.mem_limit,
            node_limit = limits.node_limit,
            "cluster initialized"
        );
        self.limits = Some(limits);
        self.register_pod(DEFAULT_POD)?;
        Ok(true)
    }

    pub fn limits(&self) -> ClusterResult<&TierLimits> {
        self.limits.as_ref().ok_or(ClusterError::NotInitialized)
    }

    fn ensure_initialized(&self) -> ClusterResult<()> {
        self.limits().map(|_| ())
    }

    // ── Pods ───────────────────────────────────────────────────────

    pub fn register_pod(&mut self, name: &str) -> ClusterResult<PodId> {
        let limits = self.limits()?;
        if self.pods.values().any(|p| p.pod_name == name) {
            return Err(ClusterError::DuplicateName(format!("pod {name}")));
        }
        let cpu_cap = limits.cpu_limit;

        let pod_id = loop {
            let candidate = random_id(POD_ID_LEN)?;
            if !self.pods.contains_key(&candidate) && !self.retired.contains(&candidate) {
                break candidate;
            }
        };
        let pod = Pod::new(
            &pod_id,
            name,
            cpu_cap,
            self.settings.lower_threshold,
            self.settings.upper_threshold,
        );
        self.pods.insert(pod_id.clone(), pod);
        debug!(%pod_id, pod_name = %name, "pod registered");
        Ok(pod_id)
    }

    /// Delete an empty pod irreversibly.
    pub fn remove_pod(&mut self, pod_id: &str) -> ClusterResult<Pod> {
        self.ensure_initialized()?;
        let pod = self
            .pods
            .get(pod_id)
            .ok_or_else(|| ClusterError::PodNotFound(pod_id.to_string()))?;
        if !pod.is_empty() {
            return Err(ClusterError::NotEmpty(pod_id.to_string()));
        }
        let pod = self
            .pods
            .remove(pod_id)
            .ok_or_else(|| ClusterError::PodNotFound(pod_id.to_string()))?;
        self.retired.insert(pod_id.to_string());
        debug!(%pod_id, "pod removed");
        Ok(pod)
    }

    pub fn pod(&self, pod_id: &str) -> ClusterResult<&Pod> {
        self.ensure_initialized()?;
        self.pods
            .get(pod_id)
            .ok_or_else(|| ClusterError::PodNotFound(pod_id.to_string()))
    }

    pub fn pod_mut(&mut self, pod_id: &str) -> ClusterResult<&mut Pod> {
        self.ensure_initialized()?;
        self.pods
            .get_mut(pod_id)
            .ok_or_else(|| ClusterError::PodNotFound(pod_id.to_string()))
    }

    pub fn pod_by_name(&self, name: &str) -> ClusterResult<&Pod> {
        self.ensure_initialized()?;
        self.pods
            .values()
            .find(|p| p.pod_name == name)
            .ok_or_else(|| ClusterError::PodNotFound(name.to_string()))
    }

    pub fn default_pod_id(&self) -> ClusterResult<PodId> {
        self.pod_by_name(DEFAULT_POD).map(|p| p.pod_id.clone())
    }

    pub fn pods(&self) -> impl Iterator<Item = &Pod> {
        self.pods.values()
    }

    pub fn pod_ids(&self) -> Vec<PodId> {
        self.pods.keys().cloned().collect()
    }

    pub fn pod_summaries(&self) -> ClusterResult<Vec<PodSummary>> {
        let tier = self.limits()?.name.clone();
        let mut out: Vec<PodSummary> = self.pods.values().map(|p| p.summary(&tier)).collect();
        out.sort_by(|a, b| a.pod_name.cmp(&b.pod_name));
        Ok(out)
    }

    /// Per-node CPU share for a pod with `servers` server nodes.
    pub fn cpu_cap_for(&self, servers: usize) -> ClusterResult<f64> {
        let limits = self.limits()?;
        Ok(limits
            .cpu_limit
            .min(limits.cpu_available / servers.max(1) as f64))
    }

    /// Recompute and store a pod's per-node CPU share from its server count.
    pub fn recompute_cpu_cap(&mut self, pod_id: &str) -> ClusterResult<f64> {
        let servers = self.pod(pod_id)?.server_count();
        let cap = self.cpu_cap_for(servers)?;
        self.pod_mut(pod_id)?.cpu_percent_cap = cap;
        Ok(cap)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Check that a node with this name and type may join the pod.
    pub fn ensure_node_admissible(
        &self,
        pod_id: &str,
        node_name: &str,
        node_type: NodeType,
    ) -> ClusterResult<()> {
        let pod = self.pod(pod_id)?;
        if pod.is_elastic && node_type == NodeType::Job {
            return Err(ClusterError::ElasticPod(pod_id.to_string()));
        }
        if pod.node_by_name(node_name).is_some() {
            return Err(ClusterError::DuplicateName(format!(
                "node {node_name} in pod {pod_id}"
            )));
        }
        Ok(())
    }

    /// Insert a node into its pod and the cluster index. Idle JobNodes
    /// join the tail of the available queue.
    pub fn add_node(&mut self, node: Node) -> ClusterResult<()> {
        self.ensure_node_admissible(&node.pod_id, &node.node_name, node.node_type())?;
        if self.node_index.contains_key(&node.node_id) || self.retired.contains(&node.node_id) {
            return Err(ClusterError::ConsistencyViolation(format!(
                "node id {} is already in use or was used before",
                node.node_id
            )));
        }

        let idle_job_node = matches!(
            node.as_job_node(),
            Some(j) if j.status == JobNodeStatus::Idle
        );
        let node_id = node.node_id.clone();
        let pod_id = node.pod_id.clone();

        self.pod_mut(&pod_id)?.insert_node(node);
        self.node_index.insert(node_id.clone(), pod_id.clone());
        if idle_job_node {
            self.available.push_back(node_id.clone());
        }
        debug!(%node_id, %pod_id, "node added");
        Ok(())
    }

    /// Remove a node from the registry. Backend teardown must already have
    /// succeeded.
    pub fn remove_node(&mut self, node_id: &str) -> ClusterResult<Node> {
        let node = self.node(node_id)?;
        if node.is_busy() {
            return Err(ClusterError::NodeBusy(node_id.to_string()));
        }
        let pod_id = node.pod_id.clone();

        self.available.retain(|id| id != node_id);
        let node = self
            .pods
            .get_mut(&pod_id)
            .and_then(|p| p.take_node(node_id))
            .ok_or_else(|| missing_from_pod(node_id, &pod_id))?;
        self.node_index.remove(node_id);
        self.retired.insert(node_id.to_string());
        debug!(%node_id, %pod_id, "node removed");
        Ok(node)
    }

    pub fn node(&self, node_id: &str) -> ClusterResult<&Node> {
        self.ensure_initialized()?;
        let pod_id = self
            .node_index
            .get(node_id)
            .ok_or_else(|| ClusterError::NodeNotFound(node_id.to_string()))?;
        self.pods
            .get(pod_id)
            .and_then(|p| p.node(node_id))
            .ok_or_else(|| missing_from_pod(node_id, pod_id))
    }

    pub fn node_mut(&mut self, node_id: &str) -> ClusterResult<&mut Node> {
        self.ensure_initialized()?;
        let pod_id = self
            .node_index
            .get(node_id)
            .cloned()
            .ok_or_else(|| ClusterError::NodeNotFound(node_id.to_string()))?;
        self.pods
            .get_mut(&pod_id)
            .and_then(|p| p.node_mut(node_id))
            .ok_or_else(|| missing_from_pod(node_id, &pod_id))
    }

    pub fn node_summaries(&self, pod_id: Option<&str>) -> ClusterResult<Vec<NodeSummary>> {
        let pods: Vec<&Pod> = match pod_id {
            Some(id) => vec![self.pod(id)?],
            None => {
                self.ensure_initialized()?;
                self.pods.values().collect()
            }
        };
        Ok(pods
            .into_iter()
            .flat_map(|pod| pod.nodes().map(move |n| NodeSummary::new(n, pod)))
            .collect())
    }

    /// Allocate a never-before-issued host port.
    pub fn allocate_port(&mut self) -> ClusterResult<u16> {
        let port = u16::try_from(self.next_port).map_err(|_| ClusterError::PortsExhausted)?;
        self.next_port += 1;
        Ok(port)
    }

    // ── Available queue ────────────────────────────────────────────

    /// Dequeue the head of the available queue.
    ///
    /// The node is still `Idle` on return; callers bind a job to it before
    /// releasing the registry lock.
    pub fn pop_available_job_node(&mut self) -> ClusterResult<NodeId> {
        self.ensure_initialized()?;
        let node_id = self
            .available
            .pop_front()
            .ok_or(ClusterError::NoAvailableNodes)?;
        match self.node(&node_id)?.as_job_node() {
            Some(j) if j.status == JobNodeStatus::Idle => Ok(node_id),
            _ => Err(ClusterError::ConsistencyViolation(format!(
                "node {node_id} was queued as available but is not an idle job node"
            ))),
        }
    }

    /// Mark a JobNode idle and append it to the tail of the available queue.
    pub fn release_job_node(&mut self, node_id: &str) -> ClusterResult<()> {
        if self.available.iter().any(|id| id == node_id) {
            return Err(ClusterError::ConsistencyViolation(format!(
                "node {node_id} is already queued as available"
            )));
        }
        self.node_mut(node_id)?.as_job_node_mut()?.set_idle();
        self.available.push_back(node_id.to_string());
        Ok(())
    }

    /// Take an idle JobNode out of the available queue ahead of teardown.
    pub fn withdraw_job_node(&mut self, node_id: &str) -> ClusterResult<()> {
        let node = self.node(node_id)?;
        if node.is_busy() {
            return Err(ClusterError::NodeBusy(node_id.to_string()));
        }
        self.available.retain(|id| id != node_id);
        Ok(())
    }

    /// Withdraw every JobNode of a pod at once. Nothing is withdrawn unless
    /// all of them are idle.
    pub fn withdraw_pod_job_nodes(&mut self, pod_id: &str) -> ClusterResult<Vec<NodeId>> {
        let pod = self.pod(pod_id)?;
        if let Some(busy) = pod.job_nodes().find(|n| n.is_busy()) {
            return Err(ClusterError::NodeBusy(busy.node_id.clone()));
        }
        let ids: Vec<NodeId> = pod.job_nodes().map(|n| n.node_id.clone()).collect();
        self.available.retain(|id| !ids.contains(id));
        Ok(ids)
    }

    /// Undo [`Cluster::withdraw_job_node`] after a failed teardown.
    pub fn restore_job_node(&mut self, node_id: &str) -> ClusterResult<()> {
        let idle = matches!(
            self.node(node_id)?.as_job_node(),
            Some(j) if j.status == JobNodeStatus::Idle
        );
        if idle && !self.available.iter().any(|id| id == node_id) {
            self.available.push_back(node_id.to_string());
        }
        Ok(())
    }

    pub fn has_available_nodes(&self) -> bool {
        self.available
            .front()
            .and_then(|id| self.node(id).ok())
            .and_then(|n| n.as_job_node())
            .is_some_and(|j| j.status == JobNodeStatus::Idle)
    }

    /// Snapshot of the available queue, head first.
    pub fn available_nodes(&self) -> Vec<NodeId> {
        self.available.iter().cloned().collect()
    }

    pub fn job_node_count(&self) -> usize {
        self.pods.values().map(|p| p.job_nodes().count()).sum()
    }

    // ── Jobs ───────────────────────────────────────────────────────

    /// Create a running job on a JobNode and index it. Job ids are unique
    /// across the running index and every live node's history.
    pub fn bind_job(&mut self, node_id: &str, job_id: &str, job_name: &str) -> ClusterResult<()> {
        if self.find_job(job_id).is_some() {
            return Err(ClusterError::DuplicateJobId(job_id.to_string()));
        }
        let mut job = Job::new(job_id, job_name, node_id);
        job.start()?;
        self.node_mut(node_id)?.as_job_node_mut()?.assign(job)?;
        self.running.insert(job_id.to_string(), node_id.to_string());
        Ok(())
    }

    /// Remove a job from the running index, returning its node id.
    pub fn take_running_job(&mut self, job_id: &str) -> ClusterResult<NodeId> {
        self.ensure_initialized()?;
        self.running
            .remove(job_id)
            .ok_or_else(|| ClusterError::JobNotFound(job_id.to_string()))
    }

    pub fn running_job_node(&self, job_id: &str) -> Option<&NodeId> {
        self.running.get(job_id)
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// The record of a job known to be hosted by `node_id`.
    pub fn hosted_job_mut(&mut self, node_id: &str, job_id: &str) -> ClusterResult<&mut Job> {
        self.node_mut(node_id)?
            .as_job_node_mut()?
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| {
                ClusterError::ConsistencyViolation(format!(
                    "job {job_id} is not recorded on node {node_id}"
                ))
            })
    }

    /// Look up any job, running or historical, still held by a live node.
    pub fn find_job(&self, job_id: &str) -> Option<&Job> {
        if let Some(node_id) = self.running.get(job_id) {
            return self
                .node(node_id)
                .ok()
                .and_then(|n| n.as_job_node())
                .and_then(|j| j.jobs.get(job_id));
        }
        self.pods
            .values()
            .flat_map(|p| p.job_nodes())
            .filter_map(|n| n.as_job_node())
            .find_map(|j| j.jobs.get(job_id))
    }

    /// List jobs, optionally only those hosted by one node.
    pub fn jobs(&self, node_id: Option<&str>) -> ClusterResult<Vec<Job>> {
        self.ensure_initialized()?;
        let mut out: Vec<Job> = self
            .pods
            .values()
            .flat_map(|p| p.job_nodes())
            .filter(|n| node_id.is_none_or(|id| n.node_id == id))
            .filter_map(|n| n.as_job_node())
            .flat_map(|j| j.jobs.values().cloned())
            .collect();
        out.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        Ok(out)
    }

    // ── Invariants ─────────────────────────────────────────────────

    /// Verify the queue, index and binding invariants. Intended for tests
    /// and debug assertions at quiescent points.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for id in &self.available {
            if !seen.insert(id) {
                return Err(format!("node {id} queued more than once"));
            }
            match self.node(id).ok().and_then(|n| n.as_job_node()) {
                Some(j) if j.status == JobNodeStatus::Idle => {}
                _ => return Err(format!("queued node {id} is not an idle job node")),
            }
        }
        if self.available.len() > self.job_node_count() {
            return Err("available queue longer than the job node population".to_string());
        }

        for pod in self.pods.values() {
            for node in pod.nodes() {
                if self.node_index.get(&node.node_id) != Some(&pod.pod_id) {
                    return Err(format!("node {} missing from the cluster index", node.node_id));
                }
                let Some(j) = node.as_job_node() else {
                    continue;
                };
                if pod.is_elastic {
                    return Err(format!("elastic pod {} holds job node {}", pod.pod_id, node.node_id));
                }
                match (j.status, &j.current_job) {
                    (JobNodeStatus::Idle, None) => {
                        if !seen.contains(&node.node_id) {
                            return Err(format!("idle node {} is not queued", node.node_id));
                        }
                    }
                    (JobNodeStatus::Running, Some(job_id)) => {
                        if self.running.get(job_id) != Some(&node.node_id) {
                            return Err(format!("job {job_id} on {} is not indexed as running", node.node_id));
                        }
                    }
                    _ => return Err(format!("node {} status disagrees with its bound job", node.node_id)),
                }
            }
        }

        for (job_id, node_id) in &self.running {
            let bound = self
                .node(node_id)
                .ok()
                .and_then(|n| n.as_job_node())
                .and_then(|j| j.current_job.as_ref());
            if bound != Some(job_id) {
                return Err(format!("running job {job_id} is not bound to node {node_id}"));
            }
        }
        Ok(())
    }
}

fn missing_from_pod(node_id: &str, pod_id: &str) -> ClusterError {
    ClusterError::ConsistencyViolation(format!(
        "node {node_id} is indexed under pod {pod_id} but missing from it"
    ))
}
