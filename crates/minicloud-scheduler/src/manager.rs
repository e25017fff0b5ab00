//! ClusterManager — one handle over the registry and everything that
//! mutates it.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use minicloud_backend::ExecutionBackend;
use minicloud_core::{MinicloudConfig, TierLimits};
use minicloud_state::{Cluster, ClusterSettings};

use crate::error::SchedulerResult;
use crate::lifecycle::JobLifecycle;
use crate::provision::{NodeSettings, Provisioner};
use crate::scheduler::{Scheduler, SharedCluster};

/// Built once at process start and shared by the HTTP handlers and the
/// elasticity loop.
pub struct ClusterManager {
    pub scheduler: Scheduler,
    pub provisioner: Provisioner,
    pub jobs: JobLifecycle,
    tier: TierLimits,
}

impl ClusterManager {
    pub fn from_config(
        config: &MinicloudConfig,
        backend: Arc<dyn ExecutionBackend>,
    ) -> anyhow::Result<Self> {
        let tier = config.tier_limits()?;
        let settings = ClusterSettings {
            port_base: config.cluster.port_base,
            lower_threshold: config.elasticity.lower_threshold,
            upper_threshold: config.elasticity.upper_threshold,
        };
        let cluster: SharedCluster = Arc::new(Mutex::new(Cluster::new(settings)));

        let scheduler = Scheduler::new(cluster.clone());
        let provisioner = Provisioner::new(
            cluster,
            backend.clone(),
            NodeSettings::from_config(config),
        );
        let jobs = JobLifecycle::new(
            scheduler.clone(),
            backend,
            PathBuf::from(&config.cluster.work_dir),
            &config.address.callback,
            &config.address.manager,
        );

        Ok(Self {
            scheduler,
            provisioner,
            jobs,
            tier,
        })
    }

    pub fn cluster(&self) -> &SharedCluster {
        self.scheduler.cluster()
    }

    pub fn tier(&self) -> &TierLimits {
        &self.tier
    }

    /// Initialize the cluster with the configured tier.
    pub async fn initialize(&self) -> SchedulerResult<bool> {
        self.provisioner.initialize(self.tier.clone()).await
    }
}
