//! Docker implementation of [`ComputeBackend`]

// Bollard 0.19 deprecates the container::Config / image::CreateImageOptions API
#![allow(deprecated)]

use crate::converter::{image_reference, spec_to_container_config, task_to_spec};
use crate::error::{ContainerError, Result, is_not_found};
use crate::waiter::{ReadinessPolicy, wait_until_ready};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use futures_util::StreamExt;
use nimbus_backend::{
    ComputeBackend, ContainerSpec, ContainerStats, ExecOutput, TaskOptions,
    Result as BackendResult,
};
use nimbus_core::model::TransportProtocol;
use tracing::{debug, info, warn};

/// Compute backend driving the local Docker daemon
#[derive(Clone)]
pub struct DockerCompute {
    docker: Docker,
    readiness: ReadinessPolicy,
}

impl DockerCompute {
    /// Connect with the local defaults (`DOCKER_HOST` or the unix socket) and ping
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ContainerError::DockerConnectionFailed(e.to_string()))?;
        docker
            .ping()
            .await
            .map_err(|e| ContainerError::DockerConnectionFailed(e.to_string()))?;
        Ok(Self::from_docker(docker))
    }

    pub fn from_docker(docker: Docker) -> Self {
        Self {
            docker,
            readiness: ReadinessPolicy::default(),
        }
    }

    pub fn with_readiness(mut self, readiness: ReadinessPolicy) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }

    /// Pull the image unless it is already present
    pub async fn ensure_image(&self, image: &str) -> Result<()> {
        let reference = image_reference(image);
        match self.docker.inspect_image(&reference).await {
            Ok(_) => return Ok(()),
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e.into()),
        }

        let (from_image, tag) = match reference.rsplit_once(':') {
            Some((name, tag)) if !tag.contains('/') => (name, tag),
            _ => (reference.as_str(), "latest"),
        };
        info!(image = %reference, "pulling image");

        let options = bollard::image::CreateImageOptions {
            from_image,
            tag,
            ..Default::default()
        };
        let mut stream =
            self.docker
                .create_image(Some(options), None, None::<bollard::auth::DockerCredentials>);
        while let Some(progress) = stream.next().await {
            if let Err(e) = progress {
                warn!(image = %reference, error = %e, "image pull failed");
                return Err(ContainerError::ImageNotFound { image: reference.clone() });
            }
        }
        Ok(())
    }

    /// Docker network to join, if `network_id` names one
    async fn network_mode(&self, network_id: Option<&str>) -> Result<Option<String>> {
        let Some(network) = network_id else {
            return Ok(None);
        };
        match self
            .docker
            .inspect_network(
                network,
                None::<bollard::query_parameters::InspectNetworkOptions>,
            )
            .await
        {
            Ok(_) => Ok(Some(network.to_string())),
            Err(e) if is_not_found(&e) => {
                debug!(network = %network, "not a docker network, recording as label only");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String> {
        self.ensure_image(&spec.image).await?;
        let network_mode = self.network_mode(spec.network_id.as_deref()).await?;
        let (config, options) = spec_to_container_config(spec, network_mode);

        let created = self.docker.create_container(Some(options), config).await?;
        let id = created.id;

        if let Err(e) = self
            .docker
            .start_container(&id, None::<bollard::query_parameters::StartContainerOptions>)
            .await
        {
            self.remove_quietly(&id).await;
            return Err(e.into());
        }
        Ok(id)
    }

    async fn remove_quietly(&self, id: &str) {
        if let Err(e) = self.remove(id).await {
            warn!(container = %id, error = %e, "cleanup of container failed");
        }
    }

    async fn remove(&self, id: &str) -> Result<()> {
        match self
            .docker
            .remove_container(
                id,
                Some(bollard::query_parameters::RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Err(ContainerError::ContainerNotFound {
                container: id.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn not_found(id: &str) -> impl FnOnce(bollard::errors::Error) -> ContainerError + '_ {
        move |e| {
            if is_not_found(&e) {
                ContainerError::ContainerNotFound {
                    container: id.to_string(),
                }
            } else {
                e.into()
            }
        }
    }
}

/// CPU percentage the way `docker stats` computes it
fn cpu_percent(stats: &bollard::models::ContainerStatsResponse) -> f64 {
    let total = |s: &Option<bollard::models::ContainerCpuStats>| {
        s.as_ref()
            .and_then(|c| c.cpu_usage.as_ref())
            .and_then(|u| u.total_usage)
            .unwrap_or(0)
    };
    let system = |s: &Option<bollard::models::ContainerCpuStats>| {
        s.as_ref().and_then(|c| c.system_cpu_usage).unwrap_or(0)
    };

    let cpu_delta = total(&stats.cpu_stats).saturating_sub(total(&stats.precpu_stats)) as f64;
    let system_delta =
        system(&stats.cpu_stats).saturating_sub(system(&stats.precpu_stats)) as f64;
    let cpus = stats
        .cpu_stats
        .as_ref()
        .and_then(|c| c.online_cpus)
        .unwrap_or(1) as f64;

    if system_delta > 0.0 && cpu_delta > 0.0 {
        cpu_delta / system_delta * cpus * 100.0
    } else {
        0.0
    }
}

#[async_trait]
impl ComputeBackend for DockerCompute {
    async fn create_container(&self, spec: &ContainerSpec) -> BackendResult<String> {
        let id = self.create_and_start(spec).await?;
        if let Err(e) = wait_until_ready(&self.docker, &id, &self.readiness).await {
            self.remove_quietly(&id).await;
            return Err(e.into());
        }
        info!(container = %id, name = %spec.name, image = %spec.image, "container started");
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> BackendResult<()> {
        match self
            .docker
            .start_container(
                container_id,
                None::<bollard::query_parameters::StartContainerOptions>,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(Self::not_found(container_id)(e).into()),
        }
    }

    async fn stop_container(&self, container_id: &str) -> BackendResult<()> {
        match self
            .docker
            .stop_container(
                container_id,
                None::<bollard::query_parameters::StopContainerOptions>,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(Self::not_found(container_id)(e).into()),
        }
    }

    async fn remove_container(&self, container_id: &str) -> BackendResult<()> {
        self.remove(container_id).await?;
        debug!(container = %container_id, "container removed");
        Ok(())
    }

    async fn get_container_port(
        &self,
        container_id: &str,
        container_port: u16,
        protocol: TransportProtocol,
    ) -> BackendResult<Option<u16>> {
        let inspect = self
            .docker
            .inspect_container(
                container_id,
                None::<bollard::query_parameters::InspectContainerOptions>,
            )
            .await
            .map_err(Self::not_found(container_id))?;

        let key = format!("{}/{}", container_port, protocol);
        let port = inspect
            .network_settings
            .and_then(|n| n.ports)
            .and_then(|mut ports| ports.remove(&key))
            .flatten()
            .and_then(|bindings| {
                bindings
                    .into_iter()
                    .find_map(|b| b.host_port.and_then(|p| p.parse::<u16>().ok()))
            });
        Ok(port)
    }

    async fn get_container_stats(&self, container_id: &str) -> BackendResult<ContainerStats> {
        let mut stream = self.docker.stats(
            container_id,
            Some(bollard::query_parameters::StatsOptions {
                stream: false,
                one_shot: false,
            }),
        );
        let stats = match stream.next().await {
            Some(Ok(stats)) => stats,
            Some(Err(e)) => return Err(Self::not_found(container_id)(e).into()),
            None => {
                return Err(ContainerError::ContainerNotFound {
                    container: container_id.to_string(),
                }
                .into());
            }
        };

        let memory = stats.memory_stats.as_ref();
        let (rx, tx) = stats
            .networks
            .as_ref()
            .map(|nets| {
                nets.values().fold((0, 0), |(rx, tx), n| {
                    (rx + n.rx_bytes.unwrap_or(0), tx + n.tx_bytes.unwrap_or(0))
                })
            })
            .unwrap_or((0, 0));

        Ok(ContainerStats {
            cpu_percent: cpu_percent(&stats),
            memory_usage_bytes: memory.and_then(|m| m.usage).unwrap_or(0),
            memory_limit_bytes: memory.and_then(|m| m.limit).unwrap_or(0),
            network_rx_bytes: rx,
            network_tx_bytes: tx,
        })
    }

    async fn get_logs(&self, container_id: &str, tail: Option<usize>) -> BackendResult<String> {
        let options = bollard::query_parameters::LogsOptions {
            stdout: true,
            stderr: true,
            tail: tail.map_or_else(|| "all".to_string(), |n| n.to_string()),
            ..Default::default()
        };
        let mut logs = self.docker.logs(container_id, Some(options));
        let mut out = String::new();
        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(log) => out.push_str(&log.to_string()),
                Err(e) => return Err(Self::not_found(container_id)(e).into()),
            }
        }
        Ok(out)
    }

    async fn run_task(&self, options: &TaskOptions) -> BackendResult<String> {
        let spec = task_to_spec(options);
        let id = self.create_and_start(&spec).await?;
        info!(container = %id, task = %options.name, "task started");
        Ok(id)
    }

    async fn wait_container(&self, container_id: &str) -> BackendResult<i64> {
        let mut stream = self.docker.wait_container(
            container_id,
            None::<bollard::query_parameters::WaitContainerOptions>,
        );
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports non-zero exits as an error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(Self::not_found(container_id)(e).into()),
            None => Err(ContainerError::DockerApiError(format!(
                "wait for {} ended without a status",
                container_id
            ))
            .into()),
        }
    }

    async fn exec(&self, container_id: &str, cmd: &[String]) -> BackendResult<ExecOutput> {
        let exec_config = CreateExecOptions {
            cmd: Some(cmd.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let message = self
            .docker
            .create_exec(container_id, exec_config)
            .await
            .map_err(Self::not_found(container_id))?;

        let mut output = ExecOutput::default();
        if let StartExecResults::Attached { output: mut stream, .. } = self
            .docker
            .start_exec(&message.id, Some(StartExecOptions::default()))
            .await
            .map_err(ContainerError::from)?
        {
            while let Some(msg) = stream.next().await {
                match msg.map_err(ContainerError::from)? {
                    LogOutput::StdOut { message } | LogOutput::Console { message } => {
                        output.stdout.push_str(&String::from_utf8_lossy(&message))
                    }
                    LogOutput::StdErr { message } => {
                        output.stderr.push_str(&String::from_utf8_lossy(&message))
                    }
                    LogOutput::StdIn { .. } => {}
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&message.id)
            .await
            .map_err(ContainerError::from)?;
        output.exit_code = inspect.exit_code.unwrap_or(0);
        Ok(output)
    }

    async fn create_network(&self, name: &str) -> BackendResult<String> {
        let network_config = bollard::models::NetworkCreateRequest {
            name: name.to_string(),
            driver: Some("bridge".to_string()),
            ..Default::default()
        };
        match self.docker.create_network(network_config).await {
            Ok(_) => info!(network = %name, "network created"),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => debug!(network = %name, "network already exists"),
            Err(e) => return Err(ContainerError::from(e).into()),
        }
        // the name doubles as the handle for later calls
        Ok(name.to_string())
    }

    async fn remove_network(&self, network_id: &str) -> BackendResult<()> {
        match self.docker.remove_network(network_id).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Err(ContainerError::NetworkNotFound {
                network: network_id.to_string(),
            }
            .into()),
            Err(e) => Err(ContainerError::from(e).into()),
        }
    }

    async fn ping(&self) -> BackendResult<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| ContainerError::DockerConnectionFailed(e.to_string()))?;
        Ok(())
    }
}
