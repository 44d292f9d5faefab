use super::faults::{CallLog, Faults};
use crate::error::Result;
use crate::proxy::{ProxyAdapter, ProxyTarget};
use async_trait::async_trait;
use nimbus_core::model::LoadBalancer;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// Proxy adapter that only remembers what it was asked to serve
#[derive(Debug, Default)]
pub struct FakeProxy {
    deployed: Mutex<HashMap<Uuid, Vec<ProxyTarget>>>,
    pub calls: CallLog,
    pub faults: Faults,
}

impl FakeProxy {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Vec<ProxyTarget>>> {
        self.deployed.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_deployed(&self, lb_id: Uuid) -> bool {
        self.lock().contains_key(&lb_id)
    }

    pub fn targets(&self, lb_id: Uuid) -> Vec<ProxyTarget> {
        self.lock().get(&lb_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl ProxyAdapter for FakeProxy {
    async fn deploy_proxy(&self, lb: &LoadBalancer, targets: &[ProxyTarget]) -> Result<String> {
        let id = lb.id.to_string();
        self.calls.record("deploy_proxy", &[&id]);
        self.faults.check("deploy_proxy", &id)?;
        self.lock().insert(lb.id, targets.to_vec());
        Ok(format!("http://localhost:{}", lb.port))
    }

    async fn update_proxy_config(&self, lb: &LoadBalancer, targets: &[ProxyTarget]) -> Result<()> {
        let id = lb.id.to_string();
        self.calls.record("update_proxy_config", &[&id]);
        self.faults.check("update_proxy_config", &id)?;
        self.lock().insert(lb.id, targets.to_vec());
        Ok(())
    }

    async fn remove_proxy(&self, lb_id: Uuid) -> Result<()> {
        let id = lb_id.to_string();
        self.calls.record("remove_proxy", &[&id]);
        self.faults.check("remove_proxy", &id)?;
        self.lock().remove(&lb_id);
        Ok(())
    }
}
