use super::status_display;
use crate::net::Ipv4Cidr;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A tenant-owned L2 isolation boundary backed by one bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vpc {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub cidr_block: Ipv4Cidr,
    /// Opaque bridge handle returned by the network backend
    pub network_id: String,
    pub status: VpcStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VpcStatus {
    Creating,
    Active,
    Deleting,
    Failed,
}

status_display!(VpcStatus {
    Creating => "CREATING",
    Active => "ACTIVE",
    Deleting => "DELETING",
    Failed => "FAILED",
});

impl Vpc {
    pub fn new(
        tenant_id: Uuid,
        user_id: Uuid,
        name: impl Into<String>,
        cidr_block: Ipv4Cidr,
        network_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            user_id,
            name: name.into(),
            cidr_block,
            network_id: network_id.into(),
            status: VpcStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }
}
