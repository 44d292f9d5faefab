//! Tenant quota enforcement
//!
//! Usage is charged before a resource is created and returned when it is
//! deleted or its creation is rolled back. The check and the charge happen in
//! one repository call, so two concurrent launches cannot both squeeze under
//! the limit.

use crate::store::Store;
use nimbus_core::model::{QuotaCounters, QuotaResource, TenantQuota};
use nimbus_core::{RequestContext, Result};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct QuotaService {
    store: Arc<dyn Store>,
    defaults: QuotaCounters,
}

impl QuotaService {
    pub fn new(store: Arc<dyn Store>, defaults: QuotaCounters) -> Self {
        Self { store, defaults }
    }

    pub fn defaults(&self) -> QuotaCounters {
        self.defaults
    }

    /// Limits and usage of the caller's tenant
    pub async fn get(&self, ctx: &RequestContext) -> Result<TenantQuota> {
        Ok(self
            .store
            .get_quota(ctx.tenant_id)
            .await?
            .unwrap_or_else(|| TenantQuota::new(ctx.tenant_id, self.defaults)))
    }

    pub async fn set_limits(&self, ctx: &RequestContext, limits: QuotaCounters) -> Result<()> {
        self.store.set_quota_limits(ctx.tenant_id, limits).await
    }

    /// `QuotaExceeded` when `used + requested > limit`; nothing is charged
    pub async fn check(
        &self,
        ctx: &RequestContext,
        resource: QuotaResource,
        requested: u64,
    ) -> Result<()> {
        self.get(ctx).await?.check(resource, requested)
    }

    /// Charge every request or none of them
    pub async fn reserve(
        &self,
        ctx: &RequestContext,
        requests: &[(QuotaResource, u64)],
    ) -> Result<()> {
        let quota = self
            .store
            .reserve_quota(ctx.tenant_id, &self.defaults, requests)
            .await?;
        debug!(tenant_id = %ctx.tenant_id, used = ?quota.used, "quota reserved");
        Ok(())
    }

    /// Return usage; failures are logged, never surfaced
    pub async fn release(&self, ctx: &RequestContext, requests: &[(QuotaResource, u64)]) {
        if let Err(e) = self.store.release_quota(ctx.tenant_id, requests).await {
            warn!(tenant_id = %ctx.tenant_id, error = %e, "failed to release quota");
        }
    }
}
