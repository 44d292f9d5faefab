//! Load balancer data plane capability

use crate::error::Result;
use async_trait::async_trait;
use nimbus_core::model::LoadBalancer;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A reachable backend of a load balancer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyTarget {
    pub instance_id: Uuid,
    pub host: String,
    pub port: u16,
    pub weight: u32,
}

#[async_trait]
pub trait ProxyAdapter: Send + Sync {
    /// Bring up the proxy for `lb` and return its public URL
    async fn deploy_proxy(&self, lb: &LoadBalancer, targets: &[ProxyTarget]) -> Result<String>;

    async fn update_proxy_config(&self, lb: &LoadBalancer, targets: &[ProxyTarget]) -> Result<()>;

    async fn remove_proxy(&self, lb_id: Uuid) -> Result<()>;
}
