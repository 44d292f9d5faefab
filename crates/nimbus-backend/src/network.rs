//! Virtual switch capability

use crate::error::Result;
use async_trait::async_trait;
use nimbus_core::FlowRule;
use std::net::Ipv4Addr;

/// L2 bridges, veth pairs and flow tables
#[async_trait]
pub trait NetworkBackend: Send + Sync {
    /// Create a bridge and return its handle
    async fn create_bridge(&self, name: &str) -> Result<String>;

    async fn delete_bridge(&self, bridge: &str) -> Result<()>;

    async fn create_veth_pair(&self, host_end: &str, peer_end: &str) -> Result<()>;

    /// Deleting one end removes the pair
    async fn delete_veth_pair(&self, host_end: &str) -> Result<()>;

    async fn attach_veth_to_bridge(&self, bridge: &str, veth: &str) -> Result<()>;

    async fn set_veth_ip(&self, veth: &str, ip: Ipv4Addr, prefix_len: u8) -> Result<()>;

    async fn add_flow_rule(&self, bridge: &str, rule: &FlowRule) -> Result<()>;

    /// Remove every flow whose match equals `match_`
    async fn delete_flow_rule(&self, bridge: &str, match_: &str) -> Result<()>;
}
