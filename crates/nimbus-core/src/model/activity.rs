use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Payload shared by the audit log and the event stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub action: String,
    pub resource_id: String,
    pub resource_type: String,
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub metadata: HashMap<String, serde_json::Value>,
    pub recorded_at: DateTime<Utc>,
}

impl ActivityRecord {
    pub fn new(
        action: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl ToString,
        user_id: Uuid,
        tenant_id: Uuid,
    ) -> Self {
        Self {
            action: action.into(),
            resource_id: resource_id.to_string(),
            resource_type: resource_type.into(),
            user_id,
            tenant_id,
            metadata: HashMap::new(),
            recorded_at: Utc::now(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}
