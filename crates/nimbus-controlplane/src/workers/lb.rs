//! LB reconciler
//!
//! One tick runs four passes in order, each over a fresh listing:
//!
//! 1. CREATING: deploy the proxy, then persist ACTIVE and its URL
//! 2. DELETED: remove the proxy, then the record
//! 3. ACTIVE: push the current target set to the proxy
//! 4. health: probe every target of every ACTIVE LB, persisting changes only
//!
//! Failures are logged and retried on the next tick.

use crate::store::Store;
use async_trait::async_trait;
use chrono::Utc;
use nimbus_backend::{ComputeBackend, ProxyAdapter, ProxyTarget};
use nimbus_core::{ErrorKind, Result};
use nimbus_core::model::{LbStatus, LbTarget, LoadBalancer, TargetHealth, TransportProtocol};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Decides whether a target endpoint is healthy
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, host: &str, port: u16) -> bool;
}

/// Healthy means a TCP handshake completed within `timeout`
pub struct TcpProbe {
    pub timeout: Duration,
}

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn probe(&self, host: &str, port: u16) -> bool {
        matches!(
            tokio::time::timeout(self.timeout, TcpStream::connect((host, port))).await,
            Ok(Ok(_))
        )
    }
}

#[derive(Debug, Clone)]
pub struct LbWorkerSettings {
    pub interval: Duration,
    /// Address the proxy uses to reach published instance ports
    pub target_host: String,
}

impl Default for LbWorkerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            target_host: "127.0.0.1".to_string(),
        }
    }
}

pub struct LbWorker {
    store: Arc<dyn Store>,
    compute: Arc<dyn ComputeBackend>,
    proxy: Arc<dyn ProxyAdapter>,
    probe: Arc<dyn HealthProbe>,
    settings: LbWorkerSettings,
}

impl LbWorker {
    pub fn new(
        store: Arc<dyn Store>,
        compute: Arc<dyn ComputeBackend>,
        proxy: Arc<dyn ProxyAdapter>,
        probe: Arc<dyn HealthProbe>,
        settings: LbWorkerSettings,
    ) -> Self {
        Self {
            store,
            compute,
            proxy,
            probe,
            settings,
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let period = self.settings.interval;
        super::run_periodic("lb", period, shutdown, || {
            let worker = self.clone();
            async move {
                if let Err(e) = worker.tick().await {
                    warn!(error = %e, "lb reconciliation failed");
                }
            }
        })
        .await;
    }

    /// One full reconciliation. Only listing failures are returned.
    pub async fn tick(&self) -> Result<()> {
        for lb in self.with_status(LbStatus::Creating).await? {
            self.deploy(lb).await;
        }
        for lb in self.with_status(LbStatus::Deleted).await? {
            self.remove(lb).await;
        }
        for lb in self.with_status(LbStatus::Active).await? {
            self.sync(&lb).await;
        }
        for lb in self.with_status(LbStatus::Active).await? {
            self.check_health(lb).await;
        }
        Ok(())
    }

    async fn with_status(&self, status: LbStatus) -> Result<Vec<LoadBalancer>> {
        Ok(self
            .store
            .list_all_load_balancers()
            .await?
            .into_iter()
            .filter(|lb| lb.status == status)
            .collect())
    }

    async fn deploy(&self, lb: LoadBalancer) {
        let targets = self.resolve_targets(&lb).await;
        let url = match self.proxy.deploy_proxy(&lb, &targets).await {
            Ok(url) => url,
            Err(e) => {
                warn!(lb_id = %lb.id, error = %e, "proxy deployment failed");
                return;
            }
        };
        let activated = self
            .store
            .transition_load_balancer(
                lb.tenant_id,
                lb.id,
                &[LbStatus::Creating],
                LbStatus::Active,
                Some(&url),
            )
            .await;
        match activated {
            Ok(lb) => info!(lb_id = %lb.id, url = ?lb.url, "load balancer active"),
            // Deleted while the proxy was starting
            Err(e) if e.kind() == ErrorKind::Conflict || e.is_not_found() => {
                info!(lb_id = %lb.id, reason = %e, "load balancer no longer creating, withdrawing proxy");
                if let Err(e) = self.proxy.remove_proxy(lb.id).await {
                    warn!(lb_id = %lb.id, error = %e, "proxy removal failed");
                }
            }
            Err(e) => warn!(lb_id = %lb.id, error = %e, "failed to persist active load balancer"),
        }
    }

    async fn remove(&self, lb: LoadBalancer) {
        if let Err(e) = self.proxy.remove_proxy(lb.id).await {
            warn!(lb_id = %lb.id, error = %e, "proxy removal failed");
            return;
        }
        match self.store.delete_load_balancer(lb.tenant_id, lb.id).await {
            Ok(()) => info!(lb_id = %lb.id, "load balancer removed"),
            Err(e) => warn!(lb_id = %lb.id, error = %e, "failed to delete load balancer record"),
        }
    }

    async fn sync(&self, lb: &LoadBalancer) {
        let targets = self.resolve_targets(lb).await;
        if let Err(e) = self.proxy.update_proxy_config(lb, &targets).await {
            warn!(lb_id = %lb.id, error = %e, "proxy update failed");
        }
    }

    async fn check_health(&self, lb: LoadBalancer) {
        let mut observed = HashMap::new();
        for target in &lb.targets {
            let health = match self.endpoint(lb.tenant_id, target).await {
                Some(endpoint) if self.probe.probe(&endpoint.host, endpoint.port).await => {
                    TargetHealth::Healthy
                }
                _ => TargetHealth::Unhealthy,
            };
            if health != target.health {
                observed.insert(target.instance_id, health);
            }
        }
        if observed.is_empty() {
            return;
        }

        // Re-read so target edits made during probing are kept
        let mut fresh = match self.store.get_load_balancer(lb.tenant_id, lb.id).await {
            Ok(fresh) if fresh.status == LbStatus::Active => fresh,
            Ok(_) => return,
            Err(e) => {
                warn!(lb_id = %lb.id, error = %e, "failed to reload load balancer");
                return;
            }
        };
        let now = Utc::now();
        for target in &mut fresh.targets {
            if let Some(health) = observed.get(&target.instance_id) {
                debug!(lb_id = %lb.id, instance_id = %target.instance_id, from = %target.health, to = %health, "target health changed");
                target.health = *health;
                target.updated_at = now;
            }
        }
        match self
            .store
            .set_load_balancer_targets(lb.tenant_id, lb.id, &fresh.targets)
            .await
        {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::Conflict => {
                debug!(lb_id = %lb.id, "load balancer deleted during health check")
            }
            Err(e) => warn!(lb_id = %lb.id, error = %e, "failed to persist target health"),
        }
    }

    /// Targets whose instance runs and publishes the target port
    async fn resolve_targets(&self, lb: &LoadBalancer) -> Vec<ProxyTarget> {
        let mut targets = Vec::with_capacity(lb.targets.len());
        for target in &lb.targets {
            match self.endpoint(lb.tenant_id, target).await {
                Some(endpoint) => targets.push(endpoint),
                None => debug!(lb_id = %lb.id, instance_id = %target.instance_id, "target not reachable, skipped"),
            }
        }
        targets
    }

    async fn endpoint(&self, tenant_id: Uuid, target: &LbTarget) -> Option<ProxyTarget> {
        let instance = match self.store.get_instance(tenant_id, target.instance_id).await {
            Ok(instance) => instance,
            Err(e) => {
                debug!(instance_id = %target.instance_id, error = %e, "target instance unavailable");
                return None;
            }
        };
        let container_id = instance.container_id.as_deref().filter(|_| instance.is_running())?;
        let port = match self
            .compute
            .get_container_port(container_id, target.port, TransportProtocol::Tcp)
            .await
        {
            Ok(port) => port?,
            Err(e) => {
                debug!(instance_id = %instance.id, error = %e, "host port lookup failed");
                return None;
            }
        };
        Some(ProxyTarget {
            instance_id: instance.id,
            host: self.settings.target_host.clone(),
            port,
            weight: target.weight,
        })
    }
}
