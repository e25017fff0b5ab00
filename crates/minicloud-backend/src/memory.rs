//! In-memory [`ExecutionBackend`] for tests.
//!
//! Containers are plain records. Any operation can be made to fail with
//! [`MemoryBackend::fail`], and the CPU figure a container reports can be
//! set per node with [`MemoryBackend::set_cpu`].

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{BackendError, BackendResult};
use crate::{ExecutionBackend, MANAGED_LABEL, NodeSpec, NodeStats};

/// Ticks of system CPU time elapsed between two fake samples.
const SYSTEM_DELTA: u64 = 1_000_000_000;

/// Backend operations that can be scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Create,
    Start,
    Stop,
    Remove,
    Exec,
    Push,
    Stats,
    Purge,
    Pull,
}

impl Op {
    fn name(self) -> &'static str {
        match self {
            Op::Create => "create",
            Op::Start => "start",
            Op::Stop => "stop",
            Op::Remove => "remove",
            Op::Exec => "exec",
            Op::Push => "push",
            Op::Stats => "stats",
            Op::Purge => "purge",
            Op::Pull => "pull",
        }
    }
}

/// Snapshot of one fake container.
#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub spec: NodeSpec,
    pub running: bool,
    /// Commands run with `exec_detached`, oldest first.
    pub execs: Vec<Vec<String>>,
    /// Archives pushed with `push_bundle`, oldest first.
    pub bundles: Vec<Bytes>,
    /// CPUs consumed, as reported by `stats`.
    pub cpus_used: f64,
}

#[derive(Default)]
struct Inner {
    containers: Vec<FakeContainer>,
    failing: HashSet<Op>,
    pulled: Vec<String>,
    next_id: u64,
    /// CPU figures set before the container existed, keyed by name.
    pending_cpu: HashMap<String, f64>,
}

impl Inner {
    fn check(&self, op: Op) -> BackendResult<()> {
        if self.failing.contains(&op) {
            return Err(BackendError::Rejected {
                op: op.name(),
                reason: "scripted failure".to_string(),
            });
        }
        Ok(())
    }

    fn find(&mut self, id: &str) -> BackendResult<&mut FakeContainer> {
        self.containers
            .iter_mut()
            .find(|c| !id.is_empty() && c.id.starts_with(id))
            .ok_or_else(|| BackendError::NotFound(id.to_string()))
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every subsequent call of `op` fail until [`MemoryBackend::heal`].
    pub fn fail(&self, op: Op) {
        self.lock().failing.insert(op);
    }

    pub fn heal(&self, op: Op) {
        self.lock().failing.remove(&op);
    }

    /// Set the CPUs a container reports as consumed. `id` may be a container
    /// id prefix or a container name.
    pub fn set_cpu(&self, id: &str, cpus_used: f64) {
        let mut inner = self.lock();
        match inner
            .containers
            .iter_mut()
            .find(|c| c.spec.name == id || (!id.is_empty() && c.id.starts_with(id)))
        {
            Some(c) => c.cpus_used = cpus_used,
            None => {
                inner.pending_cpu.insert(id.to_string(), cpus_used);
            }
        }
    }

    /// Set the CPU figure of every container at once.
    pub fn set_cpu_all(&self, cpus_used: f64) {
        for c in self.lock().containers.iter_mut() {
            c.cpus_used = cpus_used;
        }
    }

    pub fn containers(&self) -> Vec<FakeContainer> {
        self.lock().containers.clone()
    }

    pub fn container(&self, id: &str) -> Option<FakeContainer> {
        self.lock().find(id).ok().map(|c| c.clone())
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.container(id).is_some_and(|c| c.running)
    }

    pub fn pulled_images(&self) -> Vec<String> {
        self.lock().pulled.clone()
    }

    /// Seed a container as if left behind by an earlier process.
    pub fn insert_leftover(&self, name: &str) -> String {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = fake_id(inner.next_id);
        inner.containers.push(FakeContainer {
            id: id.clone(),
            spec: NodeSpec::new("leftover", name),
            running: true,
            execs: Vec::new(),
            bundles: Vec::new(),
            cpus_used: 0.0,
        });
        id
    }
}

fn fake_id(n: u64) -> String {
    format!("{n:012x}{:052x}", n.wrapping_mul(0x9e37_79b9_7f4a_7c15))
}

#[async_trait]
impl ExecutionBackend for MemoryBackend {
    async fn create_node(&self, spec: &NodeSpec) -> BackendResult<String> {
        let mut inner = self.lock();
        inner.check(Op::Create)?;
        if inner.containers.iter().any(|c| c.spec.name == spec.name) {
            return Err(BackendError::Rejected {
                op: Op::Create.name(),
                reason: format!("container name {} already in use", spec.name),
            });
        }
        inner.next_id += 1;
        let id = fake_id(inner.next_id);
        let cpus_used = inner.pending_cpu.remove(&spec.name).unwrap_or(0.0);
        inner.containers.push(FakeContainer {
            id: id.clone(),
            spec: spec.clone(),
            running: false,
            execs: Vec::new(),
            bundles: Vec::new(),
            cpus_used,
        });
        Ok(id)
    }

    async fn start_node(&self, id: &str) -> BackendResult<()> {
        let mut inner = self.lock();
        inner.check(Op::Start)?;
        inner.find(id)?.running = true;
        Ok(())
    }

    async fn stop_node(&self, id: &str, _timeout: Duration) -> BackendResult<()> {
        let mut inner = self.lock();
        inner.check(Op::Stop)?;
        inner.find(id)?.running = false;
        Ok(())
    }

    async fn remove_node(&self, id: &str, force: bool) -> BackendResult<()> {
        let mut inner = self.lock();
        inner.check(Op::Remove)?;
        let container = inner.find(id)?;
        if container.running && !force {
            return Err(BackendError::Rejected {
                op: Op::Remove.name(),
                reason: format!("container {id} is running"),
            });
        }
        let full_id = container.id.clone();
        inner.containers.retain(|c| c.id != full_id);
        Ok(())
    }

    async fn exec_detached(&self, id: &str, command: &[String]) -> BackendResult<()> {
        let mut inner = self.lock();
        inner.check(Op::Exec)?;
        let container = inner.find(id)?;
        if !container.running {
            return Err(BackendError::Rejected {
                op: Op::Exec.name(),
                reason: format!("container {id} is not running"),
            });
        }
        container.execs.push(command.to_vec());
        Ok(())
    }

    async fn push_bundle(&self, id: &str, archive: Bytes) -> BackendResult<()> {
        let mut inner = self.lock();
        inner.check(Op::Push)?;
        inner.find(id)?.bundles.push(archive);
        Ok(())
    }

    async fn stats(&self, id: &str) -> BackendResult<NodeStats> {
        let mut inner = self.lock();
        inner.check(Op::Stats)?;
        let container = inner.find(id)?;
        let cpu_delta = if container.running {
            (container.cpus_used * SYSTEM_DELTA as f64) as u64
        } else {
            0
        };
        Ok(NodeStats {
            cpu_usage: cpu_delta,
            pre_cpu_usage: 0,
            system_cpu_usage: SYSTEM_DELTA,
            pre_system_cpu_usage: 0,
            online_cpus: 1,
            mem_usage: if container.running { 64 * 1024 * 1024 } else { 0 },
            network_in: 0,
            network_out: 0,
        })
    }

    async fn purge_managed(&self) -> BackendResult<usize> {
        let mut inner = self.lock();
        inner.check(Op::Purge)?;
        let before = inner.containers.len();
        inner
            .containers
            .retain(|c| !c.spec.labels.contains_key(MANAGED_LABEL));
        Ok(before - inner.containers.len())
    }

    async fn pull_image(&self, image: &str) -> BackendResult<()> {
        let mut inner = self.lock();
        inner.check(Op::Pull)?;
        inner.pulled.push(image.to_string());
        Ok(())
    }
}
