//! Docker implementation of [`ExecutionBackend`] via bollard.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StatsOptions, StopContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use tracing::{debug, info, warn};

use crate::error::{BackendError, BackendResult};
use crate::{ExecutionBackend, MANAGED_LABEL, NodeSpec, NodeStats};

/// Talks to the local Docker daemon.
#[derive(Clone)]
pub struct DockerBackend {
    docker: Docker,
}

impl DockerBackend {
    /// Connect using the platform defaults (unix socket or named pipe, or
    /// `DOCKER_HOST` when set).
    pub fn connect() -> BackendResult<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl ExecutionBackend for DockerBackend {
    async fn create_node(&self, spec: &NodeSpec) -> BackendResult<String> {
        let mut host_config = HostConfig {
            nano_cpus: Some((spec.cpus * 1e9) as i64),
            ..Default::default()
        };
        if spec.mem_bytes > 0 {
            host_config.memory = Some(spec.mem_bytes as i64);
        }

        let mut exposed_ports = None;
        if let Some((container_port, host_port)) = spec.publish_port {
            let key = format!("{container_port}/tcp");
            let mut bindings = HashMap::new();
            bindings.insert(
                key.clone(),
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(host_port.to_string()),
                }]),
            );
            host_config.port_bindings = Some(bindings);

            let mut exposed = HashMap::new();
            exposed.insert(key, HashMap::new());
            exposed_ports = Some(exposed);
        }

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: (!spec.command.is_empty()).then(|| spec.command.clone()),
            labels: Some(spec.labels.clone()),
            exposed_ports,
            host_config: Some(host_config),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let created = self.docker.create_container(Some(options), config).await?;
        for warning in &created.warnings {
            warn!(container = %spec.name, %warning, "docker create warning");
        }
        debug!(container = %spec.name, id = %created.id, "container created");
        Ok(created.id)
    }

    async fn start_node(&self, id: &str) -> BackendResult<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        debug!(%id, "container started");
        Ok(())
    }

    async fn stop_node(&self, id: &str, timeout: Duration) -> BackendResult<()> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };
        self.docker.stop_container(id, Some(options)).await?;
        debug!(%id, "container stopped");
        Ok(())
    }

    async fn remove_node(&self, id: &str, force: bool) -> BackendResult<()> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await?;
        debug!(%id, "container removed");
        Ok(())
    }

    async fn exec_detached(&self, id: &str, command: &[String]) -> BackendResult<()> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(command.to_vec()),
                    attach_stdout: Some(false),
                    attach_stderr: Some(false),
                    ..Default::default()
                },
            )
            .await?;
        self.docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }),
            )
            .await?;
        debug!(%id, exec_id = %exec.id, "detached exec started");
        Ok(())
    }

    async fn push_bundle(&self, id: &str, archive: Bytes) -> BackendResult<()> {
        let options = UploadToContainerOptions {
            path: "/".to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(id, Some(options), archive)
            .await?;
        Ok(())
    }

    async fn stats(&self, id: &str) -> BackendResult<NodeStats> {
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };
        let sample = Box::pin(self.docker.stats(id, Some(options)))
            .next()
            .await
            .ok_or_else(|| BackendError::NoStats(id.to_string()))??;

        let (network_in, network_out) = sample
            .networks
            .as_ref()
            .map(|nets| {
                nets.values()
                    .fold((0, 0), |(rx, tx), n| (rx + n.rx_bytes, tx + n.tx_bytes))
            })
            .unwrap_or((0, 0));

        Ok(NodeStats {
            cpu_usage: sample.cpu_stats.cpu_usage.total_usage,
            pre_cpu_usage: sample.precpu_stats.cpu_usage.total_usage,
            system_cpu_usage: sample.cpu_stats.system_cpu_usage.unwrap_or(0),
            pre_system_cpu_usage: sample.precpu_stats.system_cpu_usage.unwrap_or(0),
            online_cpus: sample.cpu_stats.online_cpus.unwrap_or(1),
            mem_usage: sample.memory_stats.usage.unwrap_or(0),
            network_in,
            network_out,
        })
    }

    async fn purge_managed(&self) -> BackendResult<usize> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![MANAGED_LABEL.to_string()]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        let mut removed = 0;
        for id in containers.into_iter().filter_map(|c| c.id) {
            self.remove_node(&id, true).await?;
            removed += 1;
        }
        if removed > 0 {
            info!(removed, "purged containers left by a previous run");
        }
        Ok(removed)
    }

    async fn pull_image(&self, image: &str) -> BackendResult<()> {
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        self.docker
            .create_image(Some(options), None, None)
            .try_collect::<Vec<_>>()
            .await?;
        info!(%image, "image pulled");
        Ok(())
    }
}
