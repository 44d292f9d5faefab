//! Private DNS capability

use crate::error::Result;
use async_trait::async_trait;
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Registers instance A records in the tenant's private zone
#[async_trait]
pub trait DnsRegistrar: Send + Sync {
    async fn register_instance(&self, tenant_id: Uuid, name: &str, ip: Ipv4Addr) -> Result<()>;

    async fn deregister_instance(&self, tenant_id: Uuid, name: &str) -> Result<()>;
}

/// Registrar used when no DNS provider is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDns;

#[async_trait]
impl DnsRegistrar for NoDns {
    async fn register_instance(&self, _tenant_id: Uuid, _name: &str, _ip: Ipv4Addr) -> Result<()> {
        Ok(())
    }

    async fn deregister_instance(&self, _tenant_id: Uuid, _name: &str) -> Result<()> {
        Ok(())
    }
}
