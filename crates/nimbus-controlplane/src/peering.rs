//! VPC peering
//!
//! An ACTIVE peering is a pair of reciprocal flows: the requester's bridge
//! forwards traffic for the accepter's CIDR and vice versa. Accepting installs
//! the requester side first; if the accepter side then fails, the first flow
//! is withdrawn before the peering is marked FAILED.

use crate::activity;
use crate::lookup::parse_id;
use crate::store::Store;
use crate::vpc::VpcService;
use chrono::Utc;
use nimbus_backend::{BackendResultExt, NetworkBackend, Notifier};
use nimbus_core::flow::{peering_match, peering_rule};
use nimbus_core::model::{PeeringStatus, Vpc, VpcPeering};
use nimbus_core::{CloudError, RequestContext, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct PeeringService {
    store: Arc<dyn Store>,
    network: Arc<dyn NetworkBackend>,
    vpcs: Arc<VpcService>,
    notifier: Notifier,
}

impl PeeringService {
    pub fn new(
        store: Arc<dyn Store>,
        network: Arc<dyn NetworkBackend>,
        vpcs: Arc<VpcService>,
        notifier: Notifier,
    ) -> Self {
        Self {
            store,
            network,
            vpcs,
            notifier,
        }
    }

    pub async fn create(&self, ctx: &RequestContext, requester: &str, accepter: &str) -> Result<VpcPeering> {
        ctx.ensure_active()?;
        let requester = self.vpcs.get(ctx, requester).await?;
        let accepter = self.vpcs.get(ctx, accepter).await?;

        if requester.id == accepter.id {
            return Err(CloudError::invalid("a VPC cannot peer with itself"));
        }
        if requester.tenant_id != accepter.tenant_id {
            return Err(CloudError::Forbidden(
                "both VPCs must belong to the same tenant".to_string(),
            ));
        }
        if requester.cidr_block.overlaps(&accepter.cidr_block) {
            return Err(CloudError::invalid(format!(
                "VPC CIDRs overlap: {} and {}",
                requester.cidr_block, accepter.cidr_block
            )));
        }

        let peering = VpcPeering::new(ctx.tenant_id, ctx.user_id, requester.id, accepter.id);
        self.store.insert_peering(&peering).await?;

        info!(peering_id = %peering.id, requester = %requester.id, accepter = %accepter.id, "peering requested");
        self.notifier
            .emit(activity(ctx, "VPC_PEERING_CREATE", "vpc_peering", peering.id))
            .await;
        Ok(peering)
    }

    pub async fn get(&self, ctx: &RequestContext, id: &str) -> Result<VpcPeering> {
        let id = parse_id("peering_id", id)?;
        self.store.get_peering(ctx.tenant_id, id).await
    }

    pub async fn list(&self, ctx: &RequestContext) -> Result<Vec<VpcPeering>> {
        self.store.list_peerings(ctx.tenant_id).await
    }

    /// PENDING → ACTIVE once both bridges carry the reciprocal flows.
    /// Any failure leaves the peering FAILED and no flow installed.
    pub async fn accept(&self, ctx: &RequestContext, id: &str) -> Result<VpcPeering> {
        ctx.ensure_active()?;
        let mut peering = self.pending(ctx, id).await?;
        let (requester, accepter) = self.endpoints(&peering).await?;

        if let Err(e) = self.program(&requester, &accepter).await {
            self.fail(&mut peering, &e).await;
            return Err(e);
        }

        peering.status = PeeringStatus::Active;
        peering.status_reason = None;
        peering.updated_at = Utc::now();
        self.store.update_peering(&peering).await?;

        info!(peering_id = %peering.id, "peering active");
        self.notifier
            .emit(activity(ctx, "VPC_PEERING_ACCEPT", "vpc_peering", peering.id))
            .await;
        Ok(peering)
    }

    pub async fn reject(&self, ctx: &RequestContext, id: &str) -> Result<VpcPeering> {
        ctx.ensure_active()?;
        let mut peering = self.pending(ctx, id).await?;
        peering.status = PeeringStatus::Rejected;
        peering.updated_at = Utc::now();
        self.store.update_peering(&peering).await?;

        info!(peering_id = %peering.id, "peering rejected");
        self.notifier
            .emit(activity(ctx, "VPC_PEERING_REJECT", "vpc_peering", peering.id))
            .await;
        Ok(peering)
    }

    /// Withdraws both flows of an ACTIVE peering, then removes the record.
    /// Flow withdrawal failures are logged and do not stop the delete.
    pub async fn delete(&self, ctx: &RequestContext, id: &str) -> Result<()> {
        ctx.ensure_active()?;
        let peering = self.get(ctx, id).await?;

        if peering.status == PeeringStatus::Active {
            let (requester, accepter) = self.endpoints(&peering).await?;
            for (local, remote) in [(&requester, &accepter), (&accepter, &requester)] {
                let flow_match = peering_match(&remote.cidr_block);
                if let Err(e) = self.network.delete_flow_rule(&local.network_id, &flow_match).await {
                    warn!(peering_id = %peering.id, bridge = %local.network_id, error = %e, "failed to withdraw peering flow");
                }
            }
        }
        self.store.delete_peering(ctx.tenant_id, peering.id).await?;

        info!(peering_id = %peering.id, "peering deleted");
        self.notifier
            .emit(activity(ctx, "VPC_PEERING_DELETE", "vpc_peering", peering.id))
            .await;
        Ok(())
    }

    async fn pending(&self, ctx: &RequestContext, id: &str) -> Result<VpcPeering> {
        let peering = self.get(ctx, id).await?;
        if peering.status != PeeringStatus::Pending {
            return Err(CloudError::conflict(format!(
                "peering {} is {}, not PENDING",
                peering.id, peering.status
            )));
        }
        Ok(peering)
    }

    async fn endpoints(&self, peering: &VpcPeering) -> Result<(Vpc, Vpc)> {
        let requester = self
            .store
            .get_vpc(peering.tenant_id, peering.requester_vpc_id)
            .await?;
        let accepter = self
            .store
            .get_vpc(peering.tenant_id, peering.accepter_vpc_id)
            .await?;
        Ok((requester, accepter))
    }

    async fn program(&self, requester: &Vpc, accepter: &Vpc) -> Result<()> {
        self.network
            .add_flow_rule(&requester.network_id, &peering_rule(&accepter.cidr_block))
            .await
            .step("install peering flow on requester bridge")?;

        if let Err(e) = self
            .network
            .add_flow_rule(&accepter.network_id, &peering_rule(&requester.cidr_block))
            .await
            .step("install peering flow on accepter bridge")
        {
            let flow_match = peering_match(&accepter.cidr_block);
            if let Err(undo) = self
                .network
                .delete_flow_rule(&requester.network_id, &flow_match)
                .await
            {
                error!(bridge = %requester.network_id, flow_match = %flow_match, error = %undo, "failed to withdraw requester peering flow");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn fail(&self, peering: &mut VpcPeering, cause: &CloudError) {
        peering.status = PeeringStatus::Failed;
        peering.status_reason = Some(cause.to_string());
        peering.updated_at = Utc::now();
        if let Err(e) = self.store.update_peering(peering).await {
            error!(peering_id = %peering.id, error = %e, "failed to mark peering FAILED");
        }
    }
}
