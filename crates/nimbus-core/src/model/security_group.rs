use super::status_display;
use crate::error::{CloudError, Result};
use crate::net::Ipv4Cidr;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Priority of the two ARP rules every group is seeded with
pub const IMPLICIT_ARP_PRIORITY: u16 = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub vpc_id: Uuid,
    pub name: String,
    pub description: String,
    pub rules: Vec<SecurityRule>,
    /// Instances this group is attached to
    pub instance_ids: Vec<Uuid>,
    pub status: SecurityGroupStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityGroupStatus {
    Active,
    Deleting,
}

status_display!(SecurityGroupStatus {
    Active => "ACTIVE",
    Deleting => "DELETING",
});

impl SecurityGroup {
    /// New group carrying the implicit ingress and egress ARP rules
    pub fn new(
        tenant_id: Uuid,
        user_id: Uuid,
        vpc_id: Uuid,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            user_id,
            vpc_id,
            name: name.into(),
            description: description.into(),
            rules: vec![
                SecurityRule::arp(Direction::Ingress),
                SecurityRule::arp(Direction::Egress),
            ],
            instance_ids: Vec::new(),
            status: SecurityGroupStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_attached(&self) -> bool {
        !self.instance_ids.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Arp,
}

status_display!(Protocol {
    Tcp => "tcp",
    Udp => "udp",
    Icmp => "icmp",
    Arp => "arp",
});

impl std::str::FromStr for Protocol {
    type Err = CloudError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "icmp" => Ok(Protocol::Icmp),
            "arp" => Ok(Protocol::Arp),
            other => Err(CloudError::invalid(format!("unknown protocol '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ingress,
    Egress,
}

status_display!(Direction {
    Ingress => "ingress",
    Egress => "egress",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityRule {
    pub id: Uuid,
    pub protocol: Protocol,
    pub direction: Direction,
    /// `None` matches any address
    pub cidr: Option<Ipv4Cidr>,
    pub port_min: u16,
    pub port_max: u16,
    pub priority: u16,
    pub created_at: DateTime<Utc>,
}

impl SecurityRule {
    pub fn new(
        protocol: Protocol,
        direction: Direction,
        cidr: Option<Ipv4Cidr>,
        port_min: u16,
        port_max: u16,
        priority: u16,
    ) -> Result<Self> {
        let rule = Self {
            id: Uuid::new_v4(),
            protocol,
            direction,
            cidr,
            port_min,
            port_max,
            priority,
            created_at: Utc::now(),
        };
        rule.validate()?;
        Ok(rule)
    }

    pub fn arp(direction: Direction) -> Self {
        Self {
            id: Uuid::new_v4(),
            protocol: Protocol::Arp,
            direction,
            cidr: None,
            port_min: 0,
            port_max: 0,
            priority: IMPLICIT_ARP_PRIORITY,
            created_at: Utc::now(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.port_min > self.port_max {
            return Err(CloudError::invalid(format!(
                "port_min {} is greater than port_max {}",
                self.port_min, self.port_max
            )));
        }
        if matches!(self.protocol, Protocol::Tcp | Protocol::Udp) && self.port_min == 0 {
            return Err(CloudError::invalid(format!(
                "{} rules require a port range",
                self.protocol
            )));
        }
        Ok(())
    }

    pub fn is_implicit_arp(&self) -> bool {
        self.protocol == Protocol::Arp && self.priority == IMPLICIT_ARP_PRIORITY
    }
}
