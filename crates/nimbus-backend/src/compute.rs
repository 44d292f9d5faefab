//! Container runtime capability

use crate::error::Result;
use async_trait::async_trait;
use nimbus_core::model::{PortMapping, TransportProtocol};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Everything needed to create and start one long-running container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub ports: Vec<PortMapping>,
    /// Network the container joins, if any
    pub network_id: Option<String>,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<Mount>,
    /// Empty means the image default
    pub cmd: Vec<String>,
    pub memory_bytes: Option<i64>,
    pub cpus: Option<f64>,
    pub labels: HashMap<String, String>,
    /// `host:ip` entries added to /etc/hosts
    pub extra_hosts: Vec<String>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn port(mut self, mapping: PortMapping) -> Self {
        self.ports.push(mapping);
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Bind mount of a host path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

/// A run-to-completion container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOptions {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<(String, String)>,
    pub memory_bytes: Option<i64>,
    pub network_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Container runtime used for instances, tasks and managed services
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Create and start a container, returning its id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, container_id: &str) -> Result<()>;

    async fn stop_container(&self, container_id: &str) -> Result<()>;

    /// Remove a container, stopping it first if needed
    async fn remove_container(&self, container_id: &str) -> Result<()>;

    /// Host port published for `container_port`, if any
    async fn get_container_port(
        &self,
        container_id: &str,
        container_port: u16,
        protocol: TransportProtocol,
    ) -> Result<Option<u16>>;

    async fn get_container_stats(&self, container_id: &str) -> Result<ContainerStats>;

    /// Combined stdout and stderr; `tail` limits the number of lines
    async fn get_logs(&self, container_id: &str, tail: Option<usize>) -> Result<String>;

    /// Start a task container without waiting for it
    async fn run_task(&self, options: &TaskOptions) -> Result<String>;

    /// Block until the container exits, returning its exit code
    async fn wait_container(&self, container_id: &str) -> Result<i64>;

    async fn exec(&self, container_id: &str, cmd: &[String]) -> Result<ExecOutput>;

    async fn create_network(&self, name: &str) -> Result<String>;

    async fn remove_network(&self, network_id: &str) -> Result<()>;

    async fn ping(&self) -> Result<()>;
}
