//! Open vSwitch network driver
//!
//! Bridges are OVS bridges, instance links are kernel veth pairs, and flow
//! rules go through `ovs-ofctl`. Every operation shells out via a
//! [`CommandRunner`].

use crate::command::{CommandRunner, SystemRunner};
use crate::error::{HostError, Result};
use async_trait::async_trait;
use nimbus_backend::{NetworkBackend, Result as BackendResult};
use nimbus_core::FlowRule;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info};

/// Locations of the host tools
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OvsTools {
    pub vsctl: String,
    pub ofctl: String,
    pub ip: String,
}

impl Default for OvsTools {
    fn default() -> Self {
        Self {
            vsctl: "ovs-vsctl".to_string(),
            ofctl: "ovs-ofctl".to_string(),
            ip: "ip".to_string(),
        }
    }
}

pub struct OvsNetwork {
    runner: Arc<dyn CommandRunner>,
    tools: OvsTools,
}

impl OvsNetwork {
    pub fn new() -> Self {
        Self::with_runner(Arc::new(SystemRunner))
    }

    pub fn with_runner(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            tools: OvsTools::default(),
        }
    }

    pub fn with_tools(mut self, tools: OvsTools) -> Self {
        self.tools = tools;
        self
    }

    /// Fail early when the host lacks the OVS or iproute2 tools
    pub async fn check_tools(&self) -> Result<()> {
        for tool in [&self.tools.vsctl, &self.tools.ofctl, &self.tools.ip] {
            if !self.runner.has_tool(tool).await {
                return Err(HostError::ToolNotFound(tool.clone()));
            }
        }
        Ok(())
    }

    async fn vsctl(&self, args: &[&str]) -> Result<String> {
        self.run(&self.tools.vsctl, args).await
    }

    async fn ofctl(&self, args: &[&str]) -> Result<String> {
        self.run(&self.tools.ofctl, args).await
    }

    async fn ip(&self, args: &[&str]) -> Result<String> {
        self.run(&self.tools.ip, args).await
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.runner.run(program, &args).await
    }
}

impl Default for OvsNetwork {
    fn default() -> Self {
        Self::new()
    }
}

fn is_missing_device(err: &HostError) -> bool {
    matches!(err, HostError::CommandFailed { stderr, .. }
        if stderr.contains("Cannot find device") || stderr.contains("does not exist"))
}

#[async_trait]
impl NetworkBackend for OvsNetwork {
    async fn create_bridge(&self, name: &str) -> BackendResult<String> {
        self.vsctl(&["--may-exist", "add-br", name]).await?;
        self.ip(&["link", "set", name, "up"]).await?;
        info!(bridge = %name, "bridge created");
        Ok(name.to_string())
    }

    async fn delete_bridge(&self, bridge: &str) -> BackendResult<()> {
        self.vsctl(&["--if-exists", "del-br", bridge]).await?;
        info!(bridge = %bridge, "bridge deleted");
        Ok(())
    }

    async fn create_veth_pair(&self, host_end: &str, peer_end: &str) -> BackendResult<()> {
        self.ip(&["link", "add", host_end, "type", "veth", "peer", "name", peer_end])
            .await?;
        self.ip(&["link", "set", host_end, "up"]).await?;
        self.ip(&["link", "set", peer_end, "up"]).await?;
        debug!(host = %host_end, peer = %peer_end, "veth pair created");
        Ok(())
    }

    async fn delete_veth_pair(&self, host_end: &str) -> BackendResult<()> {
        match self.ip(&["link", "del", host_end]).await {
            Ok(_) => Ok(()),
            Err(e) if is_missing_device(&e) => {
                debug!(host = %host_end, "veth already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn attach_veth_to_bridge(&self, bridge: &str, veth: &str) -> BackendResult<()> {
        self.vsctl(&["--may-exist", "add-port", bridge, veth])
            .await?;
        Ok(())
    }

    async fn set_veth_ip(&self, veth: &str, ip: Ipv4Addr, prefix_len: u8) -> BackendResult<()> {
        let address = format!("{}/{}", ip, prefix_len);
        self.ip(&["addr", "replace", &address, "dev", veth])
            .await?;
        Ok(())
    }

    async fn add_flow_rule(&self, bridge: &str, rule: &FlowRule) -> BackendResult<()> {
        let flow = rule.to_string();
        self.ofctl(&["add-flow", bridge, &flow]).await?;
        debug!(bridge = %bridge, flow = %flow, "flow added");
        Ok(())
    }

    async fn delete_flow_rule(&self, bridge: &str, match_: &str) -> BackendResult<()> {
        self.ofctl(&["del-flows", bridge, match_]).await?;
        debug!(bridge = %bridge, flow_match = %match_, "flows deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedRunner {
        calls: Mutex<Vec<String>>,
        fail_with: Mutex<Option<String>>,
        missing: Vec<&'static str>,
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, program: &str, args: &[String]) -> Result<String> {
            let line = crate::command::render(program, args);
            self.calls.lock().unwrap().push(line.clone());
            if let Some(stderr) = self.fail_with.lock().unwrap().clone() {
                return Err(HostError::CommandFailed {
                    command: line,
                    stderr,
                });
            }
            Ok(String::new())
        }

        async fn has_tool(&self, program: &str) -> bool {
            !self.missing.contains(&program)
        }
    }

    fn driver() -> (OvsNetwork, Arc<ScriptedRunner>) {
        let runner = Arc::new(ScriptedRunner::default());
        (OvsNetwork::with_runner(runner.clone()), runner)
    }

    #[tokio::test]
    async fn test_bridge_commands() {
        let (net, runner) = driver();
        assert_eq!(net.create_bridge("nbr-1a2b3c4d").await.unwrap(), "nbr-1a2b3c4d");
        net.delete_bridge("nbr-1a2b3c4d").await.unwrap();

        assert_eq!(
            *runner.calls.lock().unwrap(),
            vec![
                "ovs-vsctl --may-exist add-br nbr-1a2b3c4d",
                "ip link set nbr-1a2b3c4d up",
                "ovs-vsctl --if-exists del-br nbr-1a2b3c4d",
            ]
        );
    }

    #[tokio::test]
    async fn test_veth_wiring_commands() {
        let (net, runner) = driver();
        net.create_veth_pair("vh01234567", "vp01234567").await.unwrap();
        net.attach_veth_to_bridge("nbr-1", "vh01234567").await.unwrap();
        net.set_veth_ip("vp01234567", Ipv4Addr::new(10, 0, 1, 2), 24)
            .await
            .unwrap();

        let calls = runner.calls.lock().unwrap();
        assert_eq!(
            calls[0],
            "ip link add vh01234567 type veth peer name vp01234567"
        );
        assert_eq!(calls[3], "ovs-vsctl --may-exist add-port nbr-1 vh01234567");
        assert_eq!(calls[4], "ip addr replace 10.0.1.2/24 dev vp01234567");
    }

    #[tokio::test]
    async fn test_flow_commands_use_rule_text() {
        let (net, runner) = driver();
        let rule = FlowRule::normal(100, "tcp,nw_src=10.0.0.0/8,tp_dst=22");
        net.add_flow_rule("nbr-1", &rule).await.unwrap();
        net.delete_flow_rule("nbr-1", &rule.match_).await.unwrap();

        assert_eq!(
            *runner.calls.lock().unwrap(),
            vec![
                "ovs-ofctl add-flow nbr-1 priority=100,tcp,nw_src=10.0.0.0/8,tp_dst=22,actions=NORMAL",
                "ovs-ofctl del-flows nbr-1 tcp,nw_src=10.0.0.0/8,tp_dst=22",
            ]
        );
    }

    #[tokio::test]
    async fn test_delete_missing_veth_is_ok() {
        let (net, runner) = driver();
        *runner.fail_with.lock().unwrap() =
            Some("Cannot find device \"vh01234567\"".to_string());
        assert!(net.delete_veth_pair("vh01234567").await.is_ok());

        *runner.fail_with.lock().unwrap() = Some("Operation not permitted".to_string());
        let err = net.delete_veth_pair("vh01234567").await.unwrap_err();
        assert!(matches!(err, nimbus_backend::BackendError::CommandFailed(_)));
    }

    #[tokio::test]
    async fn test_check_tools() {
        let (net, _) = driver();
        assert!(net.check_tools().await.is_ok());

        let runner = Arc::new(ScriptedRunner {
            missing: vec!["ovs-ofctl"],
            ..Default::default()
        });
        let err = OvsNetwork::with_runner(runner).check_tools().await.unwrap_err();
        assert!(matches!(err, HostError::ToolNotFound(t) if t == "ovs-ofctl"));
    }
}
