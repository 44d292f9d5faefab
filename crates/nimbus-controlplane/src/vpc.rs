//! VPC service
//!
//! A VPC is one bridge on the virtual switch plus a record. The bridge is
//! created first and torn down again if the record cannot be written; on
//! delete the bridge goes first, so a crash leaves a stale record rather than
//! an orphaned bridge.

use crate::lookup;
use crate::quota::QuotaService;
use crate::rollback::Rollback;
use crate::store::Store;
use crate::{activity, short_id};
use nimbus_backend::{BackendResultExt, NetworkBackend, Notifier};
use nimbus_core::model::{LbStatus, PeeringStatus, QuotaResource, Vpc};
use nimbus_core::{CloudError, Ipv4Cidr, RequestContext, Result};
use std::sync::Arc;
use tracing::{info, warn};

const VPC_CHARGE: [(QuotaResource, u64); 1] = [(QuotaResource::Vpcs, 1)];

pub struct VpcService {
    store: Arc<dyn Store>,
    network: Arc<dyn NetworkBackend>,
    quota: Arc<QuotaService>,
    notifier: Notifier,
}

impl VpcService {
    pub fn new(
        store: Arc<dyn Store>,
        network: Arc<dyn NetworkBackend>,
        quota: Arc<QuotaService>,
        notifier: Notifier,
    ) -> Self {
        Self {
            store,
            network,
            quota,
            notifier,
        }
    }

    pub async fn create(&self, ctx: &RequestContext, name: &str, cidr: &str) -> Result<Vpc> {
        ctx.ensure_active()?;
        let name = name.trim();
        if name.is_empty() {
            return Err(CloudError::invalid("VPC name is required"));
        }
        let cidr_block: Ipv4Cidr = cidr.parse()?;
        if self.store.find_vpc_by_name(ctx.tenant_id, name).await?.is_some() {
            return Err(CloudError::conflict(format!("VPC '{}' already exists", name)));
        }

        let mut rollback = Rollback::new();
        self.quota.reserve(ctx, &VPC_CHARGE).await?;
        let quota = self.quota.clone();
        let cleanup_ctx = ctx.detached();
        rollback.push("release vpc quota", move || async move {
            quota.release(&cleanup_ctx, &VPC_CHARGE).await;
            Ok(())
        });

        let bridge_name = format!("nbr-{}", short_id());
        let bridge = rollback
            .guard(self.network.create_bridge(&bridge_name).await.step("create bridge"))
            .await?;
        let network = self.network.clone();
        let handle = bridge.clone();
        rollback.push("delete bridge", move || async move {
            network.delete_bridge(&handle).await.step("delete bridge")
        });

        let vpc = Vpc::new(ctx.tenant_id, ctx.user_id, name, cidr_block, bridge);
        rollback.guard(self.store.insert_vpc(&vpc).await).await?;
        rollback.disarm();

        info!(vpc_id = %vpc.id, name = %vpc.name, cidr = %vpc.cidr_block, bridge = %vpc.network_id, "VPC created");
        self.notifier
            .emit(
                activity(ctx, "VPC_CREATE", "vpc", vpc.id)
                    .with_meta("cidr_block", vpc.cidr_block.to_string().into()),
            )
            .await;
        Ok(vpc)
    }

    pub async fn get(&self, ctx: &RequestContext, key: &str) -> Result<Vpc> {
        lookup::vpc(self.store.as_ref(), ctx.tenant_id, key).await
    }

    pub async fn list(&self, ctx: &RequestContext) -> Result<Vec<Vpc>> {
        self.store.list_vpcs(ctx.tenant_id).await
    }

    /// Refuses while subnets, instances, live peerings or load balancers
    /// reference the VPC. Unattached security groups and settled peerings go
    /// with it.
    pub async fn delete(&self, ctx: &RequestContext, key: &str) -> Result<()> {
        ctx.ensure_active()?;
        let vpc = self.get(ctx, key).await?;

        let subnets = self.store.list_subnets(ctx.tenant_id, Some(vpc.id)).await?;
        if !subnets.is_empty() {
            return Err(CloudError::conflict(format!(
                "VPC '{}' still has {} subnet(s)",
                vpc.name,
                subnets.len()
            )));
        }
        let instances = self.store.list_instances_in_vpc(vpc.id).await?;
        if !instances.is_empty() {
            return Err(CloudError::conflict(format!(
                "VPC '{}' still has {} instance(s)",
                vpc.name,
                instances.len()
            )));
        }
        let peerings = self.store.list_peerings_for_vpc(vpc.id).await?;
        if let Some(live) = peerings
            .iter()
            .find(|p| matches!(p.status, PeeringStatus::Active | PeeringStatus::Pending))
        {
            return Err(CloudError::conflict(format!(
                "VPC '{}' has a {} peering ({})",
                vpc.name, live.status, live.id
            )));
        }
        let balancers = self.store.list_load_balancers(ctx.tenant_id).await?;
        if balancers
            .iter()
            .any(|lb| lb.vpc_id == vpc.id && lb.status != LbStatus::Deleted)
        {
            return Err(CloudError::conflict(format!(
                "VPC '{}' still has load balancers",
                vpc.name
            )));
        }

        self.network
            .delete_bridge(&vpc.network_id)
            .await
            .step("delete bridge")?;

        for group in self
            .store
            .list_security_groups(ctx.tenant_id, Some(vpc.id))
            .await?
        {
            if let Err(e) = self.store.delete_security_group(ctx.tenant_id, group.id).await {
                warn!(group_id = %group.id, error = %e, "failed to remove security group of deleted VPC");
            }
        }
        for peering in peerings {
            if let Err(e) = self.store.delete_peering(ctx.tenant_id, peering.id).await {
                warn!(peering_id = %peering.id, error = %e, "failed to remove settled peering");
            }
        }
        self.store.delete_vpc(ctx.tenant_id, vpc.id).await?;
        self.quota.release(ctx, &VPC_CHARGE).await;

        info!(vpc_id = %vpc.id, name = %vpc.name, "VPC deleted");
        self.notifier
            .emit(activity(ctx, "VPC_DELETE", "vpc", vpc.id))
            .await;
        Ok(())
    }
}
