//! Elasticity controller — CPU-driven server scaling per pod.
//!
//! Every tick samples the ONLINE server nodes of each pod, refreshing their
//! gauges and the pod's average CPU figure (normalized against the pod's
//! per-node cap). Elastic pods then take at most one step: add a server,
//! drop the newest server, or nothing. A pod whose structural guard is held
//! elsewhere is skipped for the tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use minicloud_scheduler::{ClusterManager, PodGuard, SchedulerResult};
use minicloud_state::ids::auto_node_name;
use minicloud_state::*;

/// What one tick decided for one pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Add one server node.
    ScaleUp,
    /// Remove this server node, the pod's most recently added one.
    ScaleDown(NodeId),
    NoChange,
}

/// Decide a pod's next step from its average CPU percent.
pub fn evaluate(pod: &Pod, average: f64) -> ScaleDecision {
    if average > pod.upper_threshold && (pod.node_count() as u32) < pod.max_nodes {
        return ScaleDecision::ScaleUp;
    }
    if average < pod.lower_threshold
        && (pod.server_count() as u32) > pod.min_nodes
        && let Some(newest) = pod.newest_server()
    {
        return ScaleDecision::ScaleDown(newest.node_id.clone());
    }
    ScaleDecision::NoChange
}

pub struct ElasticityController {
    manager: Arc<ClusterManager>,
}

impl ElasticityController {
    pub fn new(manager: Arc<ClusterManager>) -> Self {
        Self { manager }
    }

    /// Run one pass over every pod. Only elastic pods yield a decision.
    ///
    /// Failures are logged per pod and never abort the pass.
    pub async fn tick(&self) -> Vec<(PodId, ScaleDecision)> {
        let pods = self.manager.cluster().lock().await.pod_ids();
        let mut decisions = Vec::new();

        for pod_id in pods {
            match self.tick_pod(&pod_id).await {
                Ok(Some(decision)) => decisions.push((pod_id, decision)),
                Ok(None) => {}
                Err(e) => warn!(%pod_id, error = %e, "elasticity step abandoned"),
            }
        }
        decisions
    }

    async fn tick_pod(&self, pod_id: &str) -> SchedulerResult<Option<ScaleDecision>> {
        let provisioner = &self.manager.provisioner;
        let Some(guard) = provisioner.try_lock_pod(pod_id).await else {
            debug!(%pod_id, "pod busy, skipping tick");
            return Ok(None);
        };

        let Some(average) = self.sample(&guard).await? else {
            debug!(%pod_id, "no online servers, skipping tick");
            return Ok(None);
        };

        let decision = {
            let mut cluster = self.manager.cluster().lock().await;
            let pod = cluster.pod_mut(pod_id)?;
            pod.usage = Some(average);
            if !pod.is_elastic {
                return Ok(None);
            }
            evaluate(pod, average)
        };

        match &decision {
            ScaleDecision::ScaleUp => {
                let name = auto_node_name()?;
                let (node_id, port) = provisioner.add_server(&guard, &name).await?;
                info!(%pod_id, %node_id, port, average, "scaled up");
            }
            ScaleDecision::ScaleDown(node_id) => {
                provisioner.remove_node_guarded(&guard, node_id).await?;
                info!(%pod_id, %node_id, average, "scaled down");
            }
            ScaleDecision::NoChange => {
                debug!(%pod_id, average, "load within thresholds");
            }
        }
        Ok(Some(decision))
    }

    /// Refresh the gauges of a pod's online servers and return their mean
    /// CPU percent. A server whose stats cannot be read is left out; `None`
    /// when no server answered.
    async fn sample(&self, guard: &PodGuard) -> SchedulerResult<Option<f64>> {
        let pod_id = guard.pod_id();
        let (cap, online) = {
            let cluster = self.manager.cluster().lock().await;
            let pod = cluster.pod(pod_id)?;
            let online: Vec<NodeId> = pod
                .server_nodes()
                .filter(|n| {
                    n.as_server_node()
                        .is_some_and(|s| s.status == ServerNodeStatus::Online)
                })
                .map(|n| n.node_id.clone())
                .collect();
            (pod.cpu_percent_cap, online)
        };

        let backend = self.manager.provisioner.backend();
        let mut total = 0.0;
        let mut answered = 0usize;
        for node_id in &online {
            let stats = match backend.stats(node_id).await {
                Ok(stats) => stats,
                Err(e) => {
                    warn!(%pod_id, %node_id, error = %e, "server stats unavailable, left out of the average");
                    continue;
                }
            };
            let cpu_percent = stats.cpu_percent(cap);
            total += cpu_percent;
            answered += 1;

            let mut cluster = self.manager.cluster().lock().await;
            cluster.node_mut(node_id)?.as_server_node_mut()?.gauges = ResourceGauges {
                cpu_percent,
                mem_bytes: stats.mem_usage,
                network_in: stats.network_in,
                network_out: stats.network_out,
            };
        }
        Ok((answered > 0).then(|| total / answered as f64))
    }

    /// Run [`ElasticityController::tick`] every `interval` until `shutdown`
    /// changes.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = interval.as_millis() as u64, "elasticity controller started");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    info!("elasticity controller shutting down");
                    break;
                }
            }
        }
    }

    // ── Policy ─────────────────────────────────────────────────────

    /// Make a pod elastic within `[min_nodes, max_nodes]`.
    ///
    /// Job nodes are evicted first; then server nodes are added or removed
    /// until the count lies within the bounds.
    pub async fn enable(
        &self,
        pod_id: &str,
        min_nodes: u32,
        max_nodes: u32,
    ) -> SchedulerResult<PodSummary> {
        let provisioner = &self.manager.provisioner;
        let guard = provisioner.lock_pod(pod_id).await?;

        {
            let cluster = self.manager.cluster().lock().await;
            let node_limit = cluster.limits()?.node_limit;
            cluster.pod(pod_id)?;
            if min_nodes < 1 || min_nodes > max_nodes || max_nodes > node_limit {
                return Err(ClusterError::InvalidRange(format!(
                    "need 1 <= min ({min_nodes}) <= max ({max_nodes}) <= node limit ({node_limit})"
                ))
                .into());
            }
        }

        // Evict job nodes, all or none.
        let evicted = provisioner.evict_job_nodes(&guard).await?;
        if !evicted.is_empty() {
            info!(%pod_id, evicted = evicted.len(), "job nodes evicted from elastic pod");
        }

        {
            let mut cluster = self.manager.cluster().lock().await;
            let pod = cluster.pod_mut(pod_id)?;
            pod.is_elastic = true;
            pod.min_nodes = min_nodes;
            pod.max_nodes = max_nodes;
        }

        // Resize into bounds.
        loop {
            let (servers, newest) = {
                let cluster = self.manager.cluster().lock().await;
                let pod = cluster.pod(pod_id)?;
                (
                    pod.server_count() as u32,
                    pod.newest_server().map(|n| n.node_id.clone()),
                )
            };
            match newest {
                _ if servers < min_nodes => {
                    provisioner.add_server(&guard, &auto_node_name()?).await?;
                }
                Some(node_id) if servers > max_nodes => {
                    provisioner.remove_node_guarded(&guard, &node_id).await?;
                }
                _ => break,
            }
        }

        let cluster = self.manager.cluster().lock().await;
        let summary = cluster.pod(pod_id)?.summary(&cluster.limits()?.name);
        info!(%pod_id, min_nodes, max_nodes, nodes = summary.total_nodes, "elasticity enabled");
        Ok(summary)
    }

    /// Stop scaling a pod. Its current nodes stay as they are.
    pub async fn disable(&self, pod_id: &str) -> SchedulerResult<()> {
        self.manager.cluster().lock().await.pod_mut(pod_id)?.is_elastic = false;
        info!(%pod_id, "elasticity disabled");
        Ok(())
    }

    pub async fn set_lower_threshold(&self, pod_id: &str, value: f64) -> SchedulerResult<()> {
        self.manager
            .cluster()
            .lock()
            .await
            .pod_mut(pod_id)?
            .set_lower_threshold(value)?;
        Ok(())
    }

    pub async fn set_upper_threshold(&self, pod_id: &str, value: f64) -> SchedulerResult<()> {
        self.manager
            .cluster()
            .lock()
            .await
            .pod_mut(pod_id)?
            .set_upper_threshold(value)?;
        Ok(())
    }
}
