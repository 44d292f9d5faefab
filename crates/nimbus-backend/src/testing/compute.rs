use super::faults::{CallLog, Faults};
use crate::compute::{ComputeBackend, ContainerSpec, ContainerStats, ExecOutput, TaskOptions};
use crate::error::{BackendError, Result};
use async_trait::async_trait;
use nimbus_core::model::TransportProtocol;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
struct FakeContainer {
    spec: ContainerSpec,
    running: bool,
    is_task: bool,
    /// (container port, protocol) -> host port
    published: HashMap<(u16, TransportProtocol), u16>,
}

#[derive(Debug)]
struct State {
    containers: HashMap<String, FakeContainer>,
    networks: HashSet<String>,
    next_id: u32,
    next_host_port: u16,
    task_exit_code: i64,
    task_output: String,
    task_delay: Duration,
    exec_output: ExecOutput,
}

/// Container runtime held entirely in memory
#[derive(Debug)]
pub struct FakeCompute {
    state: Mutex<State>,
    pub calls: CallLog,
    pub faults: Faults,
}

impl Default for FakeCompute {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                containers: HashMap::new(),
                networks: HashSet::new(),
                next_id: 0,
                next_host_port: 32768,
                task_exit_code: 0,
                task_output: String::new(),
                task_delay: Duration::ZERO,
                exec_output: ExecOutput::default(),
            }),
            calls: CallLog::default(),
            faults: Faults::default(),
        }
    }
}

impl FakeCompute {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Exit code and output of every task started from now on
    pub fn set_task_result(&self, exit_code: i64, output: &str) {
        let mut state = self.lock();
        state.task_exit_code = exit_code;
        state.task_output = output.to_string();
    }

    /// How long `wait_container` blocks for tasks
    pub fn set_task_delay(&self, delay: Duration) {
        self.lock().task_delay = delay;
    }

    pub fn set_exec_output(&self, output: ExecOutput) {
        self.lock().exec_output = output;
    }

    pub fn container_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.lock().containers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn container_count(&self) -> usize {
        self.lock().containers.len()
    }

    pub fn spec(&self, container_id: &str) -> Option<ContainerSpec> {
        self.lock()
            .containers
            .get(container_id)
            .map(|c| c.spec.clone())
    }

    pub fn is_running(&self, container_id: &str) -> bool {
        self.lock()
            .containers
            .get(container_id)
            .is_some_and(|c| c.running)
    }

    pub fn networks(&self) -> Vec<String> {
        self.lock().networks.iter().cloned().collect()
    }

    fn insert(&self, spec: ContainerSpec, is_task: bool) -> String {
        let mut state = self.lock();
        state.next_id += 1;
        let id = format!("fake-{:04}", state.next_id);

        let mut published = HashMap::new();
        for port in &spec.ports {
            let host = if port.host == 0 {
                state.next_host_port += 1;
                state.next_host_port
            } else {
                port.host
            };
            published.insert((port.container, port.protocol), host);
        }

        state.containers.insert(
            id.clone(),
            FakeContainer {
                spec,
                running: true,
                is_task,
                published,
            },
        );
        id
    }

    fn with_container<T>(
        &self,
        container_id: &str,
        f: impl FnOnce(&mut FakeContainer) -> T,
    ) -> Result<T> {
        self.lock()
            .containers
            .get_mut(container_id)
            .map(f)
            .ok_or_else(|| BackendError::NotFound(format!("container {}", container_id)))
    }
}

#[async_trait]
impl ComputeBackend for FakeCompute {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.calls.record("create_container", &[&spec.name, &spec.image]);
        self.faults.check("create_container", &spec.name)?;
        Ok(self.insert(spec.clone(), false))
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        self.calls.record("start_container", &[container_id]);
        self.faults.check("start_container", container_id)?;
        self.with_container(container_id, |c| c.running = true)
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        self.calls.record("stop_container", &[container_id]);
        self.faults.check("stop_container", container_id)?;
        self.with_container(container_id, |c| c.running = false)
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        self.calls.record("remove_container", &[container_id]);
        self.faults.check("remove_container", container_id)?;
        self.lock()
            .containers
            .remove(container_id)
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound(format!("container {}", container_id)))
    }

    async fn get_container_port(
        &self,
        container_id: &str,
        container_port: u16,
        protocol: TransportProtocol,
    ) -> Result<Option<u16>> {
        self.faults.check("get_container_port", container_id)?;
        self.with_container(container_id, |c| {
            c.published.get(&(container_port, protocol)).copied()
        })
    }

    async fn get_container_stats(&self, container_id: &str) -> Result<ContainerStats> {
        self.faults.check("get_container_stats", container_id)?;
        self.with_container(container_id, |c| ContainerStats {
            cpu_percent: if c.running { 1.5 } else { 0.0 },
            memory_usage_bytes: 16 * 1024 * 1024,
            memory_limit_bytes: c.spec.memory_bytes.unwrap_or_default().max(0) as u64,
            ..Default::default()
        })
    }

    async fn get_logs(&self, container_id: &str, tail: Option<usize>) -> Result<String> {
        self.faults.check("get_logs", container_id)?;
        let is_task = self.with_container(container_id, |c| c.is_task)?;
        if !is_task {
            return Ok(String::new());
        }
        let output = self.lock().task_output.clone();
        Ok(match tail {
            Some(n) => {
                let lines: Vec<_> = output.lines().collect();
                lines[lines.len().saturating_sub(n)..].join("\n")
            }
            None => output,
        })
    }

    async fn run_task(&self, options: &TaskOptions) -> Result<String> {
        self.calls.record("run_task", &[&options.name, &options.image]);
        self.faults.check("run_task", &options.name)?;
        let spec = ContainerSpec {
            name: options.name.clone(),
            image: options.image.clone(),
            cmd: options.cmd.clone(),
            env: options.env.clone(),
            memory_bytes: options.memory_bytes,
            network_id: options.network_id.clone(),
            ..Default::default()
        };
        Ok(self.insert(spec, true))
    }

    async fn wait_container(&self, container_id: &str) -> Result<i64> {
        self.faults.check("wait_container", container_id)?;
        let delay = self.lock().task_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.with_container(container_id, |c| c.running = false)?;
        Ok(self.lock().task_exit_code)
    }

    async fn exec(&self, container_id: &str, cmd: &[String]) -> Result<ExecOutput> {
        let joined = cmd.join(" ");
        self.calls.record("exec", &[container_id, &joined]);
        self.faults.check("exec", container_id)?;
        self.with_container(container_id, |_| ())?;
        Ok(self.lock().exec_output.clone())
    }

    async fn create_network(&self, name: &str) -> Result<String> {
        self.calls.record("create_network", &[name]);
        self.faults.check("create_network", name)?;
        let mut state = self.lock();
        state.next_id += 1;
        let id = format!("net-{:04}", state.next_id);
        state.networks.insert(id.clone());
        Ok(id)
    }

    async fn remove_network(&self, network_id: &str) -> Result<()> {
        self.calls.record("remove_network", &[network_id]);
        self.faults.check("remove_network", network_id)?;
        self.lock().networks.remove(network_id);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.faults.check("ping", "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_core::model::PortMapping;

    #[tokio::test]
    async fn test_dynamic_host_ports() {
        let compute = FakeCompute::new();
        let spec = ContainerSpec::new("web", "nginx").port(PortMapping::tcp(0, 80));
        let id = compute.create_container(&spec).await.unwrap();
        let port = compute
            .get_container_port(&id, 80, TransportProtocol::Tcp)
            .await
            .unwrap();
        assert_eq!(port, Some(32769));
        assert_eq!(
            compute
                .get_container_port(&id, 443, TransportProtocol::Tcp)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_remove_failure_keeps_container() {
        let compute = FakeCompute::new();
        let id = compute
            .create_container(&ContainerSpec::new("a", "alpine"))
            .await
            .unwrap();
        compute.faults.fail("remove_container");
        assert!(compute.remove_container(&id).await.is_err());
        assert_eq!(compute.container_count(), 1);
        assert_eq!(compute.calls.count("remove_container"), 1);
    }
}
