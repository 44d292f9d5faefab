//! Subnet service

use crate::activity;
use crate::lookup::parse_id;
use crate::store::Store;
use crate::vpc::VpcService;
use chrono::Utc;
use nimbus_backend::Notifier;
use nimbus_core::model::{Subnet, SubnetStatus, VpcStatus};
use nimbus_core::{CloudError, Ipv4Cidr, RequestContext, Result};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub const DEFAULT_AVAILABILITY_ZONE: &str = "zone-a";

pub struct SubnetService {
    store: Arc<dyn Store>,
    vpcs: Arc<VpcService>,
    notifier: Notifier,
}

impl SubnetService {
    pub fn new(store: Arc<dyn Store>, vpcs: Arc<VpcService>, notifier: Notifier) -> Self {
        Self {
            store,
            vpcs,
            notifier,
        }
    }

    /// The CIDR must lie inside the VPC's and stay clear of sibling subnets.
    /// The gateway is the first host address.
    pub async fn create(
        &self,
        ctx: &RequestContext,
        vpc: &str,
        name: &str,
        cidr: &str,
        availability_zone: Option<&str>,
    ) -> Result<Subnet> {
        ctx.ensure_active()?;
        let vpc = self.vpcs.get(ctx, vpc).await?;
        if vpc.status != VpcStatus::Active {
            return Err(CloudError::conflict(format!(
                "VPC '{}' is {}, not ACTIVE",
                vpc.name, vpc.status
            )));
        }

        let cidr_block: Ipv4Cidr = cidr.parse()?;
        if !vpc.cidr_block.strictly_contains(&cidr_block) {
            return Err(CloudError::invalid(format!(
                "subnet {} is not strictly inside VPC {}",
                cidr_block, vpc.cidr_block
            )));
        }
        let gateway_ip = cidr_block.gateway().ok_or_else(|| {
            CloudError::invalid(format!("subnet {} has no room for a gateway", cidr_block))
        })?;

        let now = Utc::now();
        let subnet = Subnet {
            id: Uuid::new_v4(),
            tenant_id: ctx.tenant_id,
            user_id: ctx.user_id,
            vpc_id: vpc.id,
            name: if name.trim().is_empty() {
                cidr_block.to_string()
            } else {
                name.trim().to_string()
            },
            cidr_block,
            gateway_ip,
            availability_zone: availability_zone
                .filter(|az| !az.is_empty())
                .unwrap_or(DEFAULT_AVAILABILITY_ZONE)
                .to_string(),
            status: SubnetStatus::Available,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_subnet(&subnet).await?;

        info!(subnet_id = %subnet.id, vpc_id = %vpc.id, cidr = %cidr_block, gateway = %gateway_ip, "subnet created");
        self.notifier
            .emit(
                activity(ctx, "SUBNET_CREATE", "subnet", subnet.id)
                    .with_meta("vpc_id", vpc.id.to_string().into()),
            )
            .await;
        Ok(subnet)
    }

    pub async fn get(&self, ctx: &RequestContext, id: &str) -> Result<Subnet> {
        let id = parse_id("subnet_id", id)?;
        self.store.get_subnet(ctx.tenant_id, id).await
    }

    /// Subnets of the tenant, optionally only those of one VPC
    pub async fn list(&self, ctx: &RequestContext, vpc: Option<&str>) -> Result<Vec<Subnet>> {
        let vpc_id = match vpc {
            Some(key) => Some(self.vpcs.get(ctx, key).await?.id),
            None => None,
        };
        self.store.list_subnets(ctx.tenant_id, vpc_id).await
    }

    pub async fn delete(&self, ctx: &RequestContext, id: &str) -> Result<()> {
        ctx.ensure_active()?;
        let subnet = self.get(ctx, id).await?;
        let in_use = self
            .store
            .list_instances(ctx.tenant_id)
            .await?
            .into_iter()
            .filter(|i| i.subnet_id == Some(subnet.id))
            .count();
        if in_use > 0 {
            return Err(CloudError::conflict(format!(
                "subnet {} still has {} instance(s)",
                subnet.cidr_block, in_use
            )));
        }

        self.store.delete_subnet(ctx.tenant_id, subnet.id).await?;
        info!(subnet_id = %subnet.id, "subnet deleted");
        self.notifier
            .emit(activity(ctx, "SUBNET_DELETE", "subnet", subnet.id))
            .await;
        Ok(())
    }
}
