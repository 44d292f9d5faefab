//! Audit and event sinks
//!
//! Both are fire-and-forget from the caller's point of view: services hand
//! records to a [`Notifier`], which logs failures and never returns them.

use crate::error::Result;
use async_trait::async_trait;
use nimbus_core::model::ActivityRecord;
use std::sync::Arc;
use tracing::{info, warn};

#[async_trait]
pub trait AuditService: Send + Sync {
    async fn log(&self, record: &ActivityRecord) -> Result<()>;
}

#[async_trait]
pub trait EventService: Send + Sync {
    async fn record_event(&self, record: &ActivityRecord) -> Result<()>;
}

/// Audit sink that writes to the `nimbus::audit` tracing target
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAudit;

#[async_trait]
impl AuditService for TracingAudit {
    async fn log(&self, record: &ActivityRecord) -> Result<()> {
        let metadata = serde_json::to_string(&record.metadata)?;
        info!(
            target: "nimbus::audit",
            action = %record.action,
            resource_type = %record.resource_type,
            resource_id = %record.resource_id,
            user_id = %record.user_id,
            tenant_id = %record.tenant_id,
            metadata = %metadata,
            "audit"
        );
        Ok(())
    }
}

/// Event sink that writes to the `nimbus::event` tracing target
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEvents;

#[async_trait]
impl EventService for TracingEvents {
    async fn record_event(&self, record: &ActivityRecord) -> Result<()> {
        let metadata = serde_json::to_string(&record.metadata)?;
        info!(
            target: "nimbus::event",
            action = %record.action,
            resource_type = %record.resource_type,
            resource_id = %record.resource_id,
            tenant_id = %record.tenant_id,
            metadata = %metadata,
            "event"
        );
        Ok(())
    }
}

/// Fans one record out to the audit log and the event stream
#[derive(Clone)]
pub struct Notifier {
    audit: Arc<dyn AuditService>,
    events: Arc<dyn EventService>,
}

impl Notifier {
    pub fn new(audit: Arc<dyn AuditService>, events: Arc<dyn EventService>) -> Self {
        Self { audit, events }
    }

    /// Notifier backed by the tracing sinks
    pub fn tracing() -> Self {
        Self::new(Arc::new(TracingAudit), Arc::new(TracingEvents))
    }

    pub async fn emit(&self, record: ActivityRecord) {
        if let Err(e) = self.audit.log(&record).await {
            warn!(action = %record.action, error = %e, "audit log failed");
        }
        if let Err(e) = self.events.record_event(&record).await {
            warn!(action = %record.action, error = %e, "event recording failed");
        }
    }
}
