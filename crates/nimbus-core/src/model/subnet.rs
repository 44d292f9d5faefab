use super::status_display;
use crate::net::Ipv4Cidr;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use uuid::Uuid;

/// A CIDR slice of a VPC with a derived gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub vpc_id: Uuid,
    pub name: String,
    pub cidr_block: Ipv4Cidr,
    pub gateway_ip: Ipv4Addr,
    pub availability_zone: String,
    pub status: SubnetStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubnetStatus {
    Pending,
    Available,
}

status_display!(SubnetStatus {
    Pending => "PENDING",
    Available => "AVAILABLE",
});
