//! Domain types for the minicloud registry.
//!
//! A [`Pod`] owns its [`Node`]s; a JobNode owns the [`Job`] records it has
//! ever hosted. Nodes are a sum type over a shared identity record so the
//! two capabilities never leak into each other.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{ClusterError, ClusterResult};

/// Opaque random identifier of a pod.
pub type PodId = String;

/// Identifier of a node, derived from its container id.
pub type NodeId = String;

/// Caller-supplied identifier of a job.
pub type JobId = String;

// ── Job ──────────────────────────────────────────────────────────

/// Lifecycle status of a job. The last three are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Registered,
    Running,
    Completed,
    Aborted,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Aborted | JobStatus::Failed)
    }
}

/// One submitted unit of work, bound to a single JobNode for its lifetime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub job_id: JobId,
    pub job_name: String,
    pub node_id: NodeId,
    pub status: JobStatus,
    /// Exit code reported by the completion callback.
    pub exit_code: Option<i32>,
}

impl Job {
    pub fn new(job_id: &str, job_name: &str, node_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            job_name: job_name.to_string(),
            node_id: node_id.to_string(),
            status: JobStatus::Registered,
            exit_code: None,
        }
    }

    pub fn start(&mut self) -> ClusterResult<()> {
        self.transition(JobStatus::Running)
    }

    pub fn complete(&mut self, exit_code: i32) -> ClusterResult<()> {
        self.transition(JobStatus::Completed)?;
        self.exit_code = Some(exit_code);
        Ok(())
    }

    pub fn abort(&mut self) -> ClusterResult<()> {
        self.transition(JobStatus::Aborted)
    }

    pub fn fail(&mut self) -> ClusterResult<()> {
        self.transition(JobStatus::Failed)
    }

    fn transition(&mut self, to: JobStatus) -> ClusterResult<()> {
        let allowed = match (self.status, to) {
            (JobStatus::Registered, JobStatus::Running) => true,
            (JobStatus::Registered, JobStatus::Failed) => true,
            (JobStatus::Running, s) => s.is_terminal(),
            _ => false,
        };
        if !allowed {
            return Err(ClusterError::ConsistencyViolation(format!(
                "job {} cannot move from {:?} to {:?}",
                self.job_id, self.status, to
            )));
        }
        self.status = to;
        Ok(())
    }
}

// ── Node ─────────────────────────────────────────────────────────

/// Which variant of node a caller asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Job,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobNodeStatus {
    Idle,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerNodeStatus {
    New,
    Online,
    Paused,
}

/// A unit of compute backed by one container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub node_id: NodeId,
    pub node_name: String,
    pub pod_id: PodId,
    #[serde(flatten)]
    pub kind: NodeKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "node_type", rename_all = "snake_case")]
pub enum NodeKind {
    Job(JobNode),
    Server(ServerNode),
}

/// Runs one-shot jobs, at most one at a time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobNode {
    pub status: JobNodeStatus,
    /// The job currently bound to this node. `Some` iff `status == Running`.
    pub current_job: Option<JobId>,
    /// Every job this node has hosted, keyed by job id.
    #[serde(skip)]
    pub jobs: HashMap<JobId, Job>,
}

/// Runs a long-lived service on a fixed host port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerNode {
    pub status: ServerNodeStatus,
    pub port: u16,
    pub gauges: ResourceGauges,
}

/// Last sampled resource usage of a server node.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceGauges {
    /// CPU usage normalized against the pod's per-node cap (0–100).
    pub cpu_percent: f64,
    pub mem_bytes: u64,
    pub network_in: u64,
    pub network_out: u64,
}

impl Node {
    pub fn job(node_id: &str, node_name: &str, pod_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            node_name: node_name.to_string(),
            pod_id: pod_id.to_string(),
            kind: NodeKind::Job(JobNode {
                status: JobNodeStatus::Idle,
                current_job: None,
                jobs: HashMap::new(),
            }),
        }
    }

    pub fn server(node_id: &str, node_name: &str, pod_id: &str, port: u16) -> Self {
        Self {
            node_id: node_id.to_string(),
            node_name: node_name.to_string(),
            pod_id: pod_id.to_string(),
            kind: NodeKind::Server(ServerNode {
                status: ServerNodeStatus::New,
                port,
                gauges: ResourceGauges::default(),
            }),
        }
    }

    pub fn node_type(&self) -> NodeType {
        match self.kind {
            NodeKind::Job(_) => NodeType::Job,
            NodeKind::Server(_) => NodeType::Server,
        }
    }

    pub fn as_job_node(&self) -> Option<&JobNode> {
        match &self.kind {
            NodeKind::Job(j) => Some(j),
            NodeKind::Server(_) => None,
        }
    }

    pub fn as_job_node_mut(&mut self) -> ClusterResult<&mut JobNode> {
        match &mut self.kind {
            NodeKind::Job(j) => Ok(j),
            NodeKind::Server(_) => Err(ClusterError::WrongNodeKind {
                node_id: self.node_id.clone(),
                expected: NodeType::Job,
            }),
        }
    }

    pub fn as_server_node(&self) -> Option<&ServerNode> {
        match &self.kind {
            NodeKind::Server(s) => Some(s),
            NodeKind::Job(_) => None,
        }
    }

    pub fn as_server_node_mut(&mut self) -> ClusterResult<&mut ServerNode> {
        match &mut self.kind {
            NodeKind::Server(s) => Ok(s),
            NodeKind::Job(_) => Err(ClusterError::WrongNodeKind {
                node_id: self.node_id.clone(),
                expected: NodeType::Server,
            }),
        }
    }

    /// A JobNode that is not idle cannot be torn down.
    pub fn is_busy(&self) -> bool {
        matches!(&self.kind, NodeKind::Job(j) if j.status != JobNodeStatus::Idle)
    }

    /// Human-readable status string for listings.
    pub fn status_label(&self) -> &'static str {
        match &self.kind {
            NodeKind::Job(j) => match j.status {
                JobNodeStatus::Idle => "idle",
                JobNodeStatus::Running => "running",
            },
            NodeKind::Server(s) => match s.status {
                ServerNodeStatus::New => "new",
                ServerNodeStatus::Online => "online",
                ServerNodeStatus::Paused => "paused",
            },
        }
    }
}

impl JobNode {
    /// Bind a freshly started job to this node.
    pub(crate) fn assign(&mut self, job: Job) -> ClusterResult<()> {
        if self.status != JobNodeStatus::Idle || self.current_job.is_some() {
            return Err(ClusterError::NodeBusy(job.node_id.clone()));
        }
        if self.jobs.contains_key(&job.job_id) {
            return Err(ClusterError::DuplicateJobId(job.job_id.clone()));
        }
        self.current_job = Some(job.job_id.clone());
        self.status = JobNodeStatus::Running;
        self.jobs.insert(job.job_id.clone(), job);
        Ok(())
    }

    pub(crate) fn set_idle(&mut self) {
        self.current_job = None;
        self.status = JobNodeStatus::Idle;
    }
}

// ── Pod ──────────────────────────────────────────────────────────

/// A named grouping of nodes with its own scaling policy.
#[derive(Debug, Clone)]
pub struct Pod {
    pub pod_id: PodId,
    pub pod_name: String,
    nodes: HashMap<NodeId, Node>,
    /// Node ids in insertion order, oldest first.
    order: Vec<NodeId>,
    pub is_elastic: bool,
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub lower_threshold: f64,
    pub upper_threshold: f64,
    /// CPUs granted to each server node of this pod.
    pub cpu_percent_cap: f64,
    /// Mean CPU percent of the last sampling pass.
    pub usage: Option<f64>,
}

impl Pod {
    pub fn new(pod_id: &str, pod_name: &str, cpu_cap: f64, lower: f64, upper: f64) -> Self {
        Self {
            pod_id: pod_id.to_string(),
            pod_name: pod_name.to_string(),
            nodes: HashMap::new(),
            order: Vec::new(),
            is_elastic: false,
            min_nodes: 1,
            max_nodes: 1,
            lower_threshold: lower,
            upper_threshold: upper,
            cpu_percent_cap: cpu_cap,
            usage: None,
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    pub fn node_mut(&mut self, node_id: &str) -> Option<&mut Node> {
        self.nodes.get_mut(node_id)
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Node> {
        self.nodes.values().find(|n| n.node_name == name)
    }

    /// All nodes, oldest first.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn server_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes().filter(|n| n.node_type() == NodeType::Server)
    }

    pub fn job_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes().filter(|n| n.node_type() == NodeType::Job)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn server_count(&self) -> usize {
        self.server_nodes().count()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The most recently added server node.
    pub fn newest_server(&self) -> Option<&Node> {
        self.order
            .iter()
            .rev()
            .filter_map(|id| self.nodes.get(id))
            .find(|n| n.node_type() == NodeType::Server)
    }

    pub fn set_lower_threshold(&mut self, value: f64) -> ClusterResult<()> {
        if !(0.0..=100.0).contains(&value) || value >= self.upper_threshold {
            return Err(ClusterError::InvalidThreshold(format!(
                "lower threshold {value} must lie in [0, {})",
                self.upper_threshold
            )));
        }
        self.lower_threshold = value;
        Ok(())
    }

    pub fn set_upper_threshold(&mut self, value: f64) -> ClusterResult<()> {
        if !(0.0..=100.0).contains(&value) || value <= self.lower_threshold {
            return Err(ClusterError::InvalidThreshold(format!(
                "upper threshold {value} must lie in ({}, 100]",
                self.lower_threshold
            )));
        }
        self.upper_threshold = value;
        Ok(())
    }

    pub(crate) fn insert_node(&mut self, node: Node) {
        self.order.push(node.node_id.clone());
        self.nodes.insert(node.node_id.clone(), node);
    }

    pub(crate) fn take_node(&mut self, node_id: &str) -> Option<Node> {
        let node = self.nodes.remove(node_id)?;
        self.order.retain(|id| id != node_id);
        Some(node)
    }

    pub fn summary(&self, tier: &str) -> PodSummary {
        PodSummary {
            pod_id: self.pod_id.clone(),
            pod_name: self.pod_name.clone(),
            pod_type: tier.to_string(),
            is_elastic: self.is_elastic,
            min_nodes: self.min_nodes,
            max_nodes: self.max_nodes,
            lower_threshold: self.lower_threshold,
            upper_threshold: self.upper_threshold,
            cpu_percent_cap: self.cpu_percent_cap,
            usage: self.usage,
            total_nodes: self.nodes.len(),
        }
    }
}

/// Listing view of a pod.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PodSummary {
    pub pod_id: PodId,
    pub pod_name: String,
    pub pod_type: String,
    pub is_elastic: bool,
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub lower_threshold: f64,
    pub upper_threshold: f64,
    pub cpu_percent_cap: f64,
    pub usage: Option<f64>,
    pub total_nodes: usize,
}

/// Listing view of a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSummary {
    pub node_id: NodeId,
    pub node_name: String,
    pub node_type: NodeType,
    pub status: String,
    pub pod_id: PodId,
    pub pod_name: String,
    pub port: Option<u16>,
}

impl NodeSummary {
    pub fn new(node: &Node, pod: &Pod) -> Self {
        Self {
            node_id: node.node_id.clone(),
            node_name: node.node_name.clone(),
            node_type: node.node_type(),
            status: node.status_label().to_string(),
            pod_id: pod.pod_id.clone(),
            pod_name: pod.pod_name.clone(),
            port: node.as_server_node().map(|s| s.port),
        }
    }
}
