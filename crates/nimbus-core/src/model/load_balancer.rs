use super::status_display;
use crate::error::{CloudError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub vpc_id: Uuid,
    pub port: u16,
    pub algorithm: Algorithm,
    pub status: LbStatus,
    /// Set by the worker once the proxy is deployed
    pub url: Option<String>,
    pub targets: Vec<LbTarget>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LbStatus {
    Creating,
    Active,
    Deleting,
    Deleted,
}

status_display!(LbStatus {
    Creating => "CREATING",
    Active => "ACTIVE",
    Deleting => "DELETING",
    Deleted => "DELETED",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    #[default]
    RoundRobin,
    LeastConn,
    IpHash,
}

status_display!(Algorithm {
    RoundRobin => "round-robin",
    LeastConn => "least-conn",
    IpHash => "ip-hash",
});

impl std::str::FromStr for Algorithm {
    type Err = CloudError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "round-robin" | "roundrobin" => Ok(Algorithm::RoundRobin),
            "least-conn" | "leastconn" => Ok(Algorithm::LeastConn),
            "ip-hash" | "iphash" => Ok(Algorithm::IpHash),
            other => Err(CloudError::invalid(format!(
                "unknown balancing algorithm '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TargetHealth {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

status_display!(TargetHealth {
    Unknown => "unknown",
    Healthy => "healthy",
    Unhealthy => "unhealthy",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LbTarget {
    pub instance_id: Uuid,
    pub port: u16,
    pub weight: u32,
    pub health: TargetHealth,
    pub updated_at: DateTime<Utc>,
}

impl LbTarget {
    pub fn new(instance_id: Uuid, port: u16, weight: u32) -> Self {
        Self {
            instance_id,
            port,
            weight,
            health: TargetHealth::Unknown,
            updated_at: Utc::now(),
        }
    }
}

impl LoadBalancer {
    pub fn target(&self, instance_id: Uuid) -> Option<&LbTarget> {
        self.targets.iter().find(|t| t.instance_id == instance_id)
    }
}
