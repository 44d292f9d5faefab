use super::faults::{CallLog, Faults};
use crate::dns::DnsRegistrar;
use crate::error::Result;
use crate::sinks::{AuditService, EventService};
use async_trait::async_trait;
use nimbus_core::model::ActivityRecord;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use uuid::Uuid;

/// Audit and event sink that keeps every record
#[derive(Debug, Default)]
pub struct RecordingSink {
    records: Mutex<Vec<ActivityRecord>>,
    pub faults: Faults,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ActivityRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn records(&self) -> Vec<ActivityRecord> {
        self.lock().clone()
    }

    pub fn actions(&self) -> Vec<String> {
        self.lock().iter().map(|r| r.action.clone()).collect()
    }
}

#[async_trait]
impl AuditService for RecordingSink {
    async fn log(&self, record: &ActivityRecord) -> Result<()> {
        self.faults.check("log", &record.action)?;
        self.lock().push(record.clone());
        Ok(())
    }
}

#[async_trait]
impl EventService for RecordingSink {
    async fn record_event(&self, record: &ActivityRecord) -> Result<()> {
        self.faults.check("record_event", &record.action)?;
        self.lock().push(record.clone());
        Ok(())
    }
}

/// Private DNS kept in a map
#[derive(Debug, Default)]
pub struct FakeDns {
    records: Mutex<HashMap<(Uuid, String), Ipv4Addr>>,
    pub calls: CallLog,
    pub faults: Faults,
}

impl FakeDns {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(Uuid, String), Ipv4Addr>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn lookup(&self, tenant_id: Uuid, name: &str) -> Option<Ipv4Addr> {
        self.lock().get(&(tenant_id, name.to_string())).copied()
    }
}

#[async_trait]
impl DnsRegistrar for FakeDns {
    async fn register_instance(&self, tenant_id: Uuid, name: &str, ip: Ipv4Addr) -> Result<()> {
        self.calls.record("register_instance", &[name]);
        self.faults.check("register_instance", name)?;
        self.lock().insert((tenant_id, name.to_string()), ip);
        Ok(())
    }

    async fn deregister_instance(&self, tenant_id: Uuid, name: &str) -> Result<()> {
        self.calls.record("deregister_instance", &[name]);
        self.faults.check("deregister_instance", name)?;
        self.lock().remove(&(tenant_id, name.to_string()));
        Ok(())
    }
}
