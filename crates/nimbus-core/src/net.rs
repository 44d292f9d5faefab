//! IPv4 prefix arithmetic
//!
//! Subnet containment, overlap detection, gateway derivation and deterministic
//! host allocation all work on [`Ipv4Cidr`].

use crate::error::{CloudError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// An IPv4 network prefix such as `10.0.1.0/24`.
///
/// Host bits must be zero; `10.0.1.7/24` is rejected rather than silently
/// truncated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Cidr {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Cidr {
    pub fn new(network: Ipv4Addr, prefix_len: u8) -> Result<Self> {
        if prefix_len > 32 {
            return Err(CloudError::invalid(format!(
                "prefix length {} exceeds 32",
                prefix_len
            )));
        }
        let cidr = Self {
            network,
            prefix_len,
        };
        if u32::from(network) & !cidr.mask() != 0 {
            return Err(CloudError::invalid(format!(
                "{}/{} has host bits set",
                network, prefix_len
            )));
        }
        Ok(cidr)
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    fn mask(&self) -> u32 {
        if self.prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix_len)
        }
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !self.mask())
    }

    /// `0.0.0.0/0`
    pub fn is_any(&self) -> bool {
        self.prefix_len == 0
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & self.mask() == u32::from(self.network)
    }

    /// True when `other` is a smaller block inside `self`; an equal block does not count
    pub fn strictly_contains(&self, other: &Ipv4Cidr) -> bool {
        other.prefix_len > self.prefix_len && self.contains(other.network)
    }

    /// Prefixes are aligned, so they overlap iff one network address lies in the other.
    pub fn overlaps(&self, other: &Ipv4Cidr) -> bool {
        self.contains(other.network) || other.contains(self.network)
    }

    /// First usable host: the network address incremented by one.
    ///
    /// `None` for /31 and /32, which have no room for a gateway plus hosts.
    pub fn gateway(&self) -> Option<Ipv4Addr> {
        if self.prefix_len >= 31 {
            return None;
        }
        Some(Ipv4Addr::from(u32::from(self.network) + 1))
    }

    /// Usable host addresses (network and broadcast excluded), ascending
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let (first, last) = if self.prefix_len >= 31 {
            (1u32, 0u32)
        } else {
            (
                u32::from(self.network) + 1,
                u32::from(self.broadcast()) - 1,
            )
        };
        (first..=last).map(Ipv4Addr::from)
    }

    /// Lowest host that is neither the gateway nor already taken
    pub fn allocate_host(&self, in_use: &HashSet<Ipv4Addr>) -> Option<Ipv4Addr> {
        let gateway = self.gateway();
        self.hosts()
            .find(|ip| Some(*ip) != gateway && !in_use.contains(ip))
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = CloudError;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| CloudError::invalid(format!("'{}' is not a CIDR block", s)))?;
        let network = addr
            .parse::<Ipv4Addr>()
            .map_err(|_| CloudError::invalid(format!("'{}' is not an IPv4 address", addr)))?;
        let prefix_len = prefix
            .parse::<u8>()
            .map_err(|_| CloudError::invalid(format!("'{}' is not a prefix length", prefix)))?;
        Ipv4Cidr::new(network, prefix_len)
    }
}

impl TryFrom<String> for Ipv4Cidr {
    type Error = CloudError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Ipv4Cidr> for String {
    fn from(cidr: Ipv4Cidr) -> Self {
        cidr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cidr(s: &str) -> Ipv4Cidr {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        let c = cidr("10.0.0.0/16");
        assert_eq!(c.network(), Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(c.prefix_len(), 16);
        assert_eq!(c.to_string(), "10.0.0.0/16");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("10.0.0.0".parse::<Ipv4Cidr>().is_err());
        assert!("10.0.0/16".parse::<Ipv4Cidr>().is_err());
        assert!("10.0.0.0/33".parse::<Ipv4Cidr>().is_err());
        assert!("10.0.1.7/24".parse::<Ipv4Cidr>().is_err());
        assert!("banana/8".parse::<Ipv4Cidr>().is_err());
    }

    #[test]
    fn test_gateway_is_network_plus_one() {
        assert_eq!(
            cidr("10.0.1.0/24").gateway(),
            Some(Ipv4Addr::new(10, 0, 1, 1))
        );
        assert_eq!(cidr("192.168.0.0/30").gateway(), Some(Ipv4Addr::new(192, 168, 0, 1)));
        assert_eq!(cidr("192.168.0.0/31").gateway(), None);
    }

    #[test]
    fn test_containment() {
        let vpc = cidr("10.0.0.0/16");
        assert!(vpc.strictly_contains(&cidr("10.0.1.0/24")));
        assert!(vpc.strictly_contains(&cidr("10.0.0.0/17")));
        assert!(!vpc.strictly_contains(&cidr("10.0.0.0/16")));
        assert!(!vpc.strictly_contains(&cidr("10.1.0.0/24")));
        assert!(!vpc.strictly_contains(&cidr("10.0.0.0/8")));
    }

    #[test]
    fn test_overlap() {
        assert!(cidr("10.0.0.0/16").overlaps(&cidr("10.0.5.0/24")));
        assert!(cidr("10.0.5.0/24").overlaps(&cidr("10.0.0.0/16")));
        assert!(!cidr("10.10.0.0/16").overlaps(&cidr("10.20.0.0/16")));
        assert!(cidr("0.0.0.0/0").overlaps(&cidr("172.16.0.0/12")));
    }

    #[test]
    fn test_allocate_lowest_free_host() {
        let subnet = cidr("10.0.1.0/24");
        let mut used = HashSet::new();
        assert_eq!(subnet.allocate_host(&used), Some(Ipv4Addr::new(10, 0, 1, 2)));

        used.insert(Ipv4Addr::new(10, 0, 1, 2));
        assert_eq!(subnet.allocate_host(&used), Some(Ipv4Addr::new(10, 0, 1, 3)));

        used.remove(&Ipv4Addr::new(10, 0, 1, 2));
        used.insert(Ipv4Addr::new(10, 0, 1, 3));
        assert_eq!(subnet.allocate_host(&used), Some(Ipv4Addr::new(10, 0, 1, 2)));
    }

    #[test]
    fn test_allocate_exhausted() {
        // /30: .1 is the gateway, .2 the only host
        let subnet = cidr("10.0.0.0/30");
        let used: HashSet<_> = [Ipv4Addr::new(10, 0, 0, 2)].into_iter().collect();
        assert_eq!(subnet.allocate_host(&used), None);
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&cidr("10.20.0.0/16")).unwrap();
        assert_eq!(json, "\"10.20.0.0/16\"");
        let back: Ipv4Cidr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cidr("10.20.0.0/16"));
        assert!(serde_json::from_str::<Ipv4Cidr>("\"nope\"").is_err());
    }
}
