//! minicloud-backend — the container runtime seam.
//!
//! The registry and scheduler never talk to a container runtime directly;
//! every create/start/stop/remove/exec/upload/stats call goes through
//! [`ExecutionBackend`]. [`docker::DockerBackend`] drives a local Docker
//! daemon via bollard; [`memory::MemoryBackend`] is a scriptable fake used
//! by the test suites of the crates above this one.

pub mod docker;
pub mod error;
pub mod memory;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use docker::DockerBackend;
pub use error::{BackendError, BackendResult};
pub use memory::MemoryBackend;

/// Label attached to every container this system creates. Used by the
/// initialization wipe to find leftovers from a previous run.
pub const MANAGED_LABEL: &str = "minicloud.managed";

/// Everything needed to create one node container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeSpec {
    pub image: String,
    /// Container name, `<pod_id>_<node_name>`.
    pub name: String,
    pub command: Vec<String>,
    /// `(container_port, host_port)` to publish.
    pub publish_port: Option<(u16, u16)>,
    /// CPU quota in whole CPUs.
    pub cpus: f64,
    pub mem_bytes: u64,
    pub labels: HashMap<String, String>,
}

impl NodeSpec {
    pub fn new(image: &str, name: &str) -> Self {
        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        Self {
            image: image.to_string(),
            name: name.to_string(),
            labels,
            ..Default::default()
        }
    }

    pub fn command<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = argv.into_iter().map(Into::into).collect();
        self
    }

    pub fn publish(mut self, container_port: u16, host_port: u16) -> Self {
        self.publish_port = Some((container_port, host_port));
        self
    }

    pub fn limits(mut self, cpus: f64, mem_bytes: u64) -> Self {
        self.cpus = cpus;
        self.mem_bytes = mem_bytes;
        self
    }
}

/// One resource-usage sample of a node container.
///
/// CPU counters are cumulative; `pre_*` fields are the previous sample the
/// runtime reported alongside, so a single read yields a delta.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStats {
    pub cpu_usage: u64,
    pub pre_cpu_usage: u64,
    pub system_cpu_usage: u64,
    pub pre_system_cpu_usage: u64,
    pub online_cpus: u64,
    pub mem_usage: u64,
    pub network_in: u64,
    pub network_out: u64,
}

impl NodeStats {
    /// CPUs actually consumed between the two samples.
    pub fn cpus_used(&self) -> f64 {
        let cpu_delta = self.cpu_usage.saturating_sub(self.pre_cpu_usage) as f64;
        let system_delta = self
            .system_cpu_usage
            .saturating_sub(self.pre_system_cpu_usage) as f64;
        if system_delta <= 0.0 {
            return 0.0;
        }
        cpu_delta / system_delta * self.online_cpus.max(1) as f64
    }

    /// CPU usage as a 0–100 percentage of `cap` CPUs.
    pub fn cpu_percent(&self, cap: f64) -> f64 {
        if cap <= 0.0 {
            return 0.0;
        }
        (self.cpus_used() / cap * 100.0).clamp(0.0, 100.0)
    }
}

/// Operations the core needs from a container runtime.
///
/// Ids passed back in are whatever [`ExecutionBackend::create_node`]
/// returned, or any unique prefix of it.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Create (but do not start) a container. Returns the full container id.
    async fn create_node(&self, spec: &NodeSpec) -> BackendResult<String>;

    async fn start_node(&self, id: &str) -> BackendResult<()>;

    async fn stop_node(&self, id: &str, timeout: Duration) -> BackendResult<()>;

    async fn remove_node(&self, id: &str, force: bool) -> BackendResult<()>;

    /// Run a command inside the container without waiting for it.
    async fn exec_detached(&self, id: &str, command: &[String]) -> BackendResult<()>;

    /// Extract a tar archive at the container's filesystem root.
    async fn push_bundle(&self, id: &str, archive: Bytes) -> BackendResult<()>;

    async fn stats(&self, id: &str) -> BackendResult<NodeStats>;

    /// Force-remove every container carrying [`MANAGED_LABEL`]. Returns how
    /// many were removed.
    async fn purge_managed(&self) -> BackendResult<usize>;

    async fn pull_image(&self, image: &str) -> BackendResult<()>;
}
