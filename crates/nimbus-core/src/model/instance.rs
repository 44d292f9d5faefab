use super::status_display;
use crate::error::{CloudError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::str::FromStr;
use uuid::Uuid;

/// A compute instance backed by one container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub image: String,
    pub instance_type: String,
    pub vpc_id: Option<Uuid>,
    pub subnet_id: Option<Uuid>,
    pub private_ip: Option<Ipv4Addr>,
    pub ports: Vec<PortMapping>,
    /// Set iff status is RUNNING or STOPPED
    pub container_id: Option<String>,
    /// Host side of the veth pair attached to the VPC bridge
    pub veth_host: Option<String>,
    pub security_group_ids: Vec<Uuid>,
    pub status: InstanceStatus,
    pub status_reason: Option<String>,
    /// Optimistic concurrency counter, bumped on every persisted update
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Pending,
    Starting,
    Running,
    Stopped,
    Error,
    Deleted,
}

status_display!(InstanceStatus {
    Pending => "PENDING",
    Starting => "STARTING",
    Running => "RUNNING",
    Stopped => "STOPPED",
    Error => "ERROR",
    Deleted => "DELETED",
});

impl Instance {
    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }
}

/// Transport protocol of a published port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    #[default]
    Tcp,
    Udp,
}

impl std::fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportProtocol::Tcp => write!(f, "tcp"),
            TransportProtocol::Udp => write!(f, "udp"),
        }
    }
}

/// Port publication, `host:container[/proto]` in text form.
///
/// `host == 0` lets the runtime pick a free host port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
    #[serde(default)]
    pub protocol: TransportProtocol,
}

impl PortMapping {
    pub fn tcp(host: u16, container: u16) -> Self {
        Self {
            host,
            container,
            protocol: TransportProtocol::Tcp,
        }
    }
}

impl FromStr for PortMapping {
    type Err = CloudError;

    fn from_str(s: &str) -> Result<Self> {
        let (ports, protocol) = match s.split_once('/') {
            Some((p, "tcp")) => (p, TransportProtocol::Tcp),
            Some((p, "udp")) => (p, TransportProtocol::Udp),
            Some((_, other)) => {
                return Err(CloudError::invalid(format!(
                    "unsupported port protocol '{}'",
                    other
                )));
            }
            None => (s, TransportProtocol::Tcp),
        };

        let parse = |v: &str| {
            v.trim()
                .parse::<u16>()
                .map_err(|_| CloudError::invalid(format!("invalid port '{}'", v)))
        };

        let (host, container) = match ports.split_once(':') {
            Some((h, c)) => (parse(h)?, parse(c)?),
            None => {
                let p = parse(ports)?;
                (p, p)
            }
        };
        if container == 0 {
            return Err(CloudError::invalid("container port must be non-zero"));
        }

        Ok(Self {
            host,
            container,
            protocol,
        })
    }
}

/// Sizing of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InstanceType {
    pub name: &'static str,
    pub vcpus: u64,
    pub memory_gb: u64,
}

pub const INSTANCE_TYPES: &[InstanceType] = &[
    InstanceType {
        name: "nano",
        vcpus: 1,
        memory_gb: 1,
    },
    InstanceType {
        name: "small",
        vcpus: 2,
        memory_gb: 2,
    },
    InstanceType {
        name: "medium",
        vcpus: 2,
        memory_gb: 4,
    },
    InstanceType {
        name: "large",
        vcpus: 4,
        memory_gb: 8,
    },
];

pub const DEFAULT_INSTANCE_TYPE: &str = "small";

impl InstanceType {
    pub fn lookup(name: &str) -> Result<InstanceType> {
        INSTANCE_TYPES
            .iter()
            .find(|t| t.name == name)
            .copied()
            .ok_or_else(|| {
                let known: Vec<_> = INSTANCE_TYPES.iter().map(|t| t.name).collect();
                CloudError::invalid(format!(
                    "unknown instance type '{}' (known: {})",
                    name,
                    known.join(", ")
                ))
            })
    }

    pub fn memory_bytes(&self) -> i64 {
        (self.memory_gb as i64) * 1024 * 1024 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_mapping() {
        assert_eq!("8080:80".parse::<PortMapping>().unwrap(), PortMapping::tcp(8080, 80));
        assert_eq!("443".parse::<PortMapping>().unwrap(), PortMapping::tcp(443, 443));

        let udp: PortMapping = "5353:53/udp".parse().unwrap();
        assert_eq!(udp.protocol, TransportProtocol::Udp);
        assert_eq!(udp.container, 53);
    }

    #[test]
    fn test_parse_port_mapping_errors() {
        assert!("http".parse::<PortMapping>().is_err());
        assert!("80:0".parse::<PortMapping>().is_err());
        assert!("80/sctp".parse::<PortMapping>().is_err());
        assert!("70000:80".parse::<PortMapping>().is_err());
    }

    #[test]
    fn test_instance_type_lookup() {
        let t = InstanceType::lookup("medium").unwrap();
        assert_eq!(t.vcpus, 2);
        assert_eq!(t.memory_gb, 4);
        assert_eq!(InstanceType::lookup(DEFAULT_INSTANCE_TYPE).unwrap().name, "small");

        let err = InstanceType::lookup("xxl").unwrap_err();
        assert!(err.to_string().contains("unknown instance type 'xxl'"));
    }
}
