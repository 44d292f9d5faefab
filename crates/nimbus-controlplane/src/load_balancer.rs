//! Load balancer desired state
//!
//! The service only records what the tenant wants. Deploying, reconfiguring
//! and removing proxies is the LB worker's job.

use crate::activity;
use crate::lookup::{self, parse_id};
use crate::store::Store;
use chrono::Utc;
use nimbus_backend::Notifier;
use nimbus_core::model::{Algorithm, LbStatus, LbTarget, LoadBalancer};
use nimbus_core::{CloudError, ErrorKind, RequestContext, Result};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Input of [`LoadBalancerService::create`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateLoadBalancer {
    pub name: String,
    /// VPC id or name
    pub vpc: String,
    pub port: u16,
    pub algorithm: Option<String>,
    pub idempotency_key: Option<String>,
}

pub struct LoadBalancerService {
    store: Arc<dyn Store>,
    notifier: Notifier,
}

impl LoadBalancerService {
    pub fn new(store: Arc<dyn Store>, notifier: Notifier) -> Self {
        Self { store, notifier }
    }

    /// Create an LB in CREATING. With an idempotency key, a repeated call
    /// returns the LB created by the first one.
    pub async fn create(&self, ctx: &RequestContext, req: &CreateLoadBalancer) -> Result<LoadBalancer> {
        ctx.ensure_active()?;
        let key = req.idempotency_key.as_deref().filter(|k| !k.is_empty());
        if let Some(key) = key
            && let Some(existing) = self.store.find_load_balancer_by_key(ctx.tenant_id, key).await?
        {
            info!(lb_id = %existing.id, idempotency_key = %key, "returning existing load balancer");
            return Ok(existing);
        }

        let name = req.name.trim();
        if name.is_empty() {
            return Err(CloudError::invalid("load balancer name is required"));
        }
        if req.port == 0 {
            return Err(CloudError::invalid("load balancer port must be non-zero"));
        }
        let algorithm: Algorithm = req.algorithm.as_deref().unwrap_or_default().parse()?;
        let vpc = lookup::vpc(self.store.as_ref(), ctx.tenant_id, &req.vpc).await?;

        let now = Utc::now();
        let lb = LoadBalancer {
            id: Uuid::new_v4(),
            tenant_id: ctx.tenant_id,
            user_id: ctx.user_id,
            name: name.to_string(),
            vpc_id: vpc.id,
            port: req.port,
            algorithm,
            status: LbStatus::Creating,
            url: None,
            targets: Vec::new(),
            idempotency_key: key.map(str::to_string),
            created_at: now,
            updated_at: now,
        };
        match self.store.insert_load_balancer(&lb).await {
            Ok(()) => {}
            // Lost a race against a create carrying the same key
            Err(e) if e.kind() == ErrorKind::Conflict && key.is_some() => {
                if let Some(key) = key
                    && let Some(existing) =
                        self.store.find_load_balancer_by_key(ctx.tenant_id, key).await?
                {
                    return Ok(existing);
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        }

        info!(lb_id = %lb.id, name = %lb.name, vpc_id = %vpc.id, port = lb.port, "load balancer created");
        self.notifier
            .emit(
                activity(ctx, "LB_CREATE", "load_balancer", lb.id)
                    .with_meta("port", lb.port.into())
                    .with_meta("algorithm", lb.algorithm.to_string().into()),
            )
            .await;
        Ok(lb)
    }

    pub async fn get(&self, ctx: &RequestContext, id: &str) -> Result<LoadBalancer> {
        self.store
            .get_load_balancer(ctx.tenant_id, parse_id("lb_id", id)?)
            .await
    }

    pub async fn list(&self, ctx: &RequestContext) -> Result<Vec<LoadBalancer>> {
        self.store.list_load_balancers(ctx.tenant_id).await
    }

    /// Register an instance of the LB's VPC. Re-adding an instance replaces
    /// its port and weight.
    pub async fn add_target(
        &self,
        ctx: &RequestContext,
        lb_id: &str,
        instance_id: &str,
        port: u16,
        weight: u32,
    ) -> Result<LoadBalancer> {
        ctx.ensure_active()?;
        if port == 0 {
            return Err(CloudError::invalid("target port must be non-zero"));
        }
        if weight == 0 {
            return Err(CloudError::invalid("target weight must be at least 1"));
        }
        let mut lb = self.live(ctx, lb_id).await?;
        let instance = self
            .store
            .get_instance(ctx.tenant_id, parse_id("instance_id", instance_id)?)
            .await?;
        if instance.vpc_id != Some(lb.vpc_id) {
            return Err(CloudError::CrossVpc(format!(
                "instance '{}' is not in the VPC of load balancer '{}'",
                instance.name, lb.name
            )));
        }

        lb.targets.retain(|t| t.instance_id != instance.id);
        lb.targets.push(LbTarget::new(instance.id, port, weight));
        let lb = self
            .store
            .set_load_balancer_targets(ctx.tenant_id, lb.id, &lb.targets)
            .await?;

        info!(lb_id = %lb.id, instance_id = %instance.id, port, weight, "target added");
        self.notifier
            .emit(
                activity(ctx, "LB_ADD_TARGET", "load_balancer", lb.id)
                    .with_meta("instance_id", instance.id.to_string().into()),
            )
            .await;
        Ok(lb)
    }

    pub async fn remove_target(
        &self,
        ctx: &RequestContext,
        lb_id: &str,
        instance_id: &str,
    ) -> Result<LoadBalancer> {
        ctx.ensure_active()?;
        let mut lb = self.live(ctx, lb_id).await?;
        let instance_id = parse_id("instance_id", instance_id)?;
        let before = lb.targets.len();
        lb.targets.retain(|t| t.instance_id != instance_id);
        if lb.targets.len() == before {
            return Err(CloudError::not_found("target", instance_id));
        }
        let lb = self
            .store
            .set_load_balancer_targets(ctx.tenant_id, lb.id, &lb.targets)
            .await?;

        info!(lb_id = %lb.id, instance_id = %instance_id, "target removed");
        self.notifier
            .emit(
                activity(ctx, "LB_REMOVE_TARGET", "load_balancer", lb.id)
                    .with_meta("instance_id", instance_id.to_string().into()),
            )
            .await;
        Ok(lb)
    }

    /// Mark DELETED; the worker removes the proxy and then the record
    pub async fn delete(&self, ctx: &RequestContext, lb_id: &str) -> Result<()> {
        ctx.ensure_active()?;
        let lb = self.live(ctx, lb_id).await?;
        self.store
            .transition_load_balancer(
                ctx.tenant_id,
                lb.id,
                &[LbStatus::Creating, LbStatus::Active],
                LbStatus::Deleted,
                None,
            )
            .await?;

        info!(lb_id = %lb.id, "load balancer marked for deletion");
        self.notifier
            .emit(activity(ctx, "LB_DELETE", "load_balancer", lb.id))
            .await;
        Ok(())
    }

    /// An LB that has not been deleted
    async fn live(&self, ctx: &RequestContext, lb_id: &str) -> Result<LoadBalancer> {
        let lb = self.get(ctx, lb_id).await?;
        if matches!(lb.status, LbStatus::Deleted | LbStatus::Deleting) {
            return Err(CloudError::conflict(format!(
                "load balancer '{}' is {}",
                lb.name, lb.status
            )));
        }
        Ok(lb)
    }
}
