use super::status_display;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VpcPeering {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub requester_vpc_id: Uuid,
    pub accepter_vpc_id: Uuid,
    pub status: PeeringStatus,
    pub status_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeeringStatus {
    Pending,
    Active,
    Rejected,
    Failed,
}

status_display!(PeeringStatus {
    Pending => "PENDING",
    Active => "ACTIVE",
    Rejected => "REJECTED",
    Failed => "FAILED",
});

impl PeeringStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PeeringStatus::Rejected | PeeringStatus::Failed)
    }
}

impl VpcPeering {
    pub fn new(tenant_id: Uuid, user_id: Uuid, requester_vpc_id: Uuid, accepter_vpc_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            user_id,
            requester_vpc_id,
            accepter_vpc_id,
            status: PeeringStatus::Pending,
            status_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Order-independent key of the VPC pair
    pub fn pair_key(&self) -> (Uuid, Uuid) {
        pair_key(self.requester_vpc_id, self.accepter_vpc_id)
    }

    pub fn involves(&self, vpc_id: Uuid) -> bool {
        self.requester_vpc_id == vpc_id || self.accepter_vpc_id == vpc_id
    }
}

pub fn pair_key(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a <= b { (a, b) } else { (b, a) }
}
