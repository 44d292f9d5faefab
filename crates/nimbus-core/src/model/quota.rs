use crate::error::{CloudError, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Counted resource kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaResource {
    Instances,
    Vpcs,
    StorageGb,
    MemoryGb,
    Vcpus,
}

impl std::fmt::Display for QuotaResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaResource::Instances => write!(f, "instances"),
            QuotaResource::Vpcs => write!(f, "vpcs"),
            QuotaResource::StorageGb => write!(f, "storage_gb"),
            QuotaResource::MemoryGb => write!(f, "memory_gb"),
            QuotaResource::Vcpus => write!(f, "vcpus"),
        }
    }
}

/// One value per counted resource; used for both limits and usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct QuotaCounters {
    pub instances: u64,
    pub vpcs: u64,
    pub storage_gb: u64,
    pub memory_gb: u64,
    pub vcpus: u64,
}

impl QuotaCounters {
    pub fn get(&self, resource: QuotaResource) -> u64 {
        match resource {
            QuotaResource::Instances => self.instances,
            QuotaResource::Vpcs => self.vpcs,
            QuotaResource::StorageGb => self.storage_gb,
            QuotaResource::MemoryGb => self.memory_gb,
            QuotaResource::Vcpus => self.vcpus,
        }
    }

    fn slot(&mut self, resource: QuotaResource) -> &mut u64 {
        match resource {
            QuotaResource::Instances => &mut self.instances,
            QuotaResource::Vpcs => &mut self.vpcs,
            QuotaResource::StorageGb => &mut self.storage_gb,
            QuotaResource::MemoryGb => &mut self.memory_gb,
            QuotaResource::Vcpus => &mut self.vcpus,
        }
    }

    pub fn default_limits() -> Self {
        Self {
            instances: 10,
            vpcs: 5,
            storage_gb: 500,
            memory_gb: 64,
            vcpus: 32,
        }
    }
}

/// Limits and current usage of one tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantQuota {
    pub tenant_id: Uuid,
    pub limits: QuotaCounters,
    pub used: QuotaCounters,
}

impl TenantQuota {
    pub fn new(tenant_id: Uuid, limits: QuotaCounters) -> Self {
        Self {
            tenant_id,
            limits,
            used: QuotaCounters::default(),
        }
    }

    /// Fails with `QuotaExceeded` when `used + requested > limit`
    pub fn check(&self, resource: QuotaResource, requested: u64) -> Result<()> {
        let used = self.used.get(resource);
        let limit = self.limits.get(resource);
        if used.saturating_add(requested) > limit {
            return Err(CloudError::QuotaExceeded(format!(
                "{}: used {} + requested {} exceeds limit {}",
                resource, used, requested, limit
            )));
        }
        Ok(())
    }

    /// Checks every request first, then charges them all
    pub fn reserve(&mut self, requests: &[(QuotaResource, u64)]) -> Result<()> {
        for (resource, amount) in requests {
            self.check(*resource, *amount)?;
        }
        for (resource, amount) in requests {
            *self.used.slot(*resource) += amount;
        }
        Ok(())
    }

    pub fn release(&mut self, requests: &[(QuotaResource, u64)]) {
        for (resource, amount) in requests {
            let slot = self.used.slot(*resource);
            *slot = slot.saturating_sub(*amount);
        }
    }
}
