use super::faults::{CallLog, Faults};
use crate::error::{BackendError, Result};
use crate::network::NetworkBackend;
use async_trait::async_trait;
use nimbus_core::FlowRule;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeVeth {
    pub peer: String,
    pub bridge: Option<String>,
    pub address: Option<(Ipv4Addr, u8)>,
}

#[derive(Debug, Default)]
struct State {
    /// bridge -> installed flows
    bridges: HashMap<String, Vec<FlowRule>>,
    /// host end -> pair
    veths: HashMap<String, FakeVeth>,
}

/// Virtual switch held in memory; bridge handles equal the requested names
#[derive(Debug, Default)]
pub struct FakeNetwork {
    state: Mutex<State>,
    pub calls: CallLog,
    pub faults: Faults,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn has_bridge(&self, bridge: &str) -> bool {
        self.lock().bridges.contains_key(bridge)
    }

    pub fn bridge_count(&self) -> usize {
        self.lock().bridges.len()
    }

    pub fn flows(&self, bridge: &str) -> Vec<FlowRule> {
        self.lock().bridges.get(bridge).cloned().unwrap_or_default()
    }

    pub fn veth(&self, host_end: &str) -> Option<FakeVeth> {
        self.lock().veths.get(host_end).cloned()
    }

    pub fn veth_count(&self) -> usize {
        self.lock().veths.len()
    }

    fn missing_bridge(bridge: &str) -> BackendError {
        BackendError::NotFound(format!("bridge {}", bridge))
    }
}

#[async_trait]
impl NetworkBackend for FakeNetwork {
    async fn create_bridge(&self, name: &str) -> Result<String> {
        self.calls.record("create_bridge", &[name]);
        self.faults.check("create_bridge", name)?;
        let mut state = self.lock();
        if state.bridges.contains_key(name) {
            return Err(BackendError::AlreadyExists(format!("bridge {}", name)));
        }
        state.bridges.insert(name.to_string(), Vec::new());
        Ok(name.to_string())
    }

    async fn delete_bridge(&self, bridge: &str) -> Result<()> {
        self.calls.record("delete_bridge", &[bridge]);
        self.faults.check("delete_bridge", bridge)?;
        let mut state = self.lock();
        state
            .bridges
            .remove(bridge)
            .ok_or_else(|| Self::missing_bridge(bridge))?;
        for veth in state.veths.values_mut() {
            if veth.bridge.as_deref() == Some(bridge) {
                veth.bridge = None;
            }
        }
        Ok(())
    }

    async fn create_veth_pair(&self, host_end: &str, peer_end: &str) -> Result<()> {
        self.calls.record("create_veth_pair", &[host_end, peer_end]);
        self.faults.check("create_veth_pair", host_end)?;
        self.lock().veths.insert(
            host_end.to_string(),
            FakeVeth {
                peer: peer_end.to_string(),
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn delete_veth_pair(&self, host_end: &str) -> Result<()> {
        self.calls.record("delete_veth_pair", &[host_end]);
        self.faults.check("delete_veth_pair", host_end)?;
        self.lock()
            .veths
            .remove(host_end)
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound(format!("veth {}", host_end)))
    }

    async fn attach_veth_to_bridge(&self, bridge: &str, veth: &str) -> Result<()> {
        self.calls.record("attach_veth_to_bridge", &[bridge, veth]);
        self.faults.check("attach_veth_to_bridge", bridge)?;
        let mut state = self.lock();
        if !state.bridges.contains_key(bridge) {
            return Err(Self::missing_bridge(bridge));
        }
        let pair = state
            .veths
            .get_mut(veth)
            .ok_or_else(|| BackendError::NotFound(format!("veth {}", veth)))?;
        pair.bridge = Some(bridge.to_string());
        Ok(())
    }

    async fn set_veth_ip(&self, veth: &str, ip: Ipv4Addr, prefix_len: u8) -> Result<()> {
        let addr = format!("{}/{}", ip, prefix_len);
        self.calls.record("set_veth_ip", &[veth, &addr]);
        self.faults.check("set_veth_ip", veth)?;
        let mut state = self.lock();
        let pair = state
            .veths
            .values_mut()
            .find(|p| p.peer == veth)
            .ok_or_else(|| BackendError::NotFound(format!("veth {}", veth)))?;
        pair.address = Some((ip, prefix_len));
        Ok(())
    }

    async fn add_flow_rule(&self, bridge: &str, rule: &FlowRule) -> Result<()> {
        self.calls.record("add_flow_rule", &[bridge, &rule.match_]);
        self.faults.check("add_flow_rule", bridge)?;
        self.lock()
            .bridges
            .get_mut(bridge)
            .ok_or_else(|| Self::missing_bridge(bridge))?
            .push(rule.clone());
        Ok(())
    }

    async fn delete_flow_rule(&self, bridge: &str, match_: &str) -> Result<()> {
        self.calls.record("delete_flow_rule", &[bridge, match_]);
        self.faults.check("delete_flow_rule", bridge)?;
        self.lock()
            .bridges
            .get_mut(bridge)
            .ok_or_else(|| Self::missing_bridge(bridge))?
            .retain(|f| f.match_ != match_);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_flows_follow_add_and_delete() {
        let net = FakeNetwork::new();
        let br = net.create_bridge("nbr-1").await.unwrap();
        net.add_flow_rule(&br, &FlowRule::normal(100, "tcp,tp_dst=22"))
            .await
            .unwrap();
        net.add_flow_rule(&br, &FlowRule::normal(1000, "arp"))
            .await
            .unwrap();
        net.delete_flow_rule(&br, "tcp,tp_dst=22").await.unwrap();

        let flows = net.flows(&br);
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].match_, "arp");
    }

    #[tokio::test]
    async fn test_veth_lifecycle() {
        let net = FakeNetwork::new();
        net.create_bridge("nbr-1").await.unwrap();
        net.create_veth_pair("vh1", "vp1").await.unwrap();
        net.attach_veth_to_bridge("nbr-1", "vh1").await.unwrap();
        net.set_veth_ip("vp1", Ipv4Addr::new(10, 0, 1, 2), 24)
            .await
            .unwrap();

        let veth = net.veth("vh1").unwrap();
        assert_eq!(veth.bridge.as_deref(), Some("nbr-1"));
        assert_eq!(veth.address, Some((Ipv4Addr::new(10, 0, 1, 2), 24)));

        net.delete_veth_pair("vh1").await.unwrap();
        assert_eq!(net.veth_count(), 0);
    }
}
