//! Flow-rule compilation
//!
//! Security rules and peerings are lowered into OpenFlow-style entries
//! (`{priority, match, actions}`) that the network backend installs on a
//! VPC bridge. Everything here is pure so the exact wire text can be tested.

use crate::model::{Direction, Protocol, SecurityRule};
use crate::net::Ipv4Cidr;
use serde::{Deserialize, Serialize};

/// Priority of the reciprocal peering flows
pub const PEERING_PRIORITY: u16 = 500;

/// Action used for every allow rule
pub const ACTION_NORMAL: &str = "NORMAL";

/// A flow entry as handed to `NetworkBackend::add_flow_rule`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowRule {
    pub priority: u16,
    #[serde(rename = "match")]
    pub match_: String,
    pub actions: String,
}

impl FlowRule {
    pub fn normal(priority: u16, match_: impl Into<String>) -> Self {
        Self {
            priority,
            match_: match_.into(),
            actions: ACTION_NORMAL.to_string(),
        }
    }
}

impl std::fmt::Display for FlowRule {
    /// `ovs-ofctl add-flow` syntax
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "priority={},{},actions={}",
            self.priority, self.match_, self.actions
        )
    }
}

/// Match expression of a security rule.
///
/// Port ranges collapse to `tp_dst=<port_min>`; only the lower bound of a
/// range is enforced.
pub fn rule_match(rule: &SecurityRule) -> String {
    let mut tokens = vec![rule.protocol.to_string()];

    if let Some(cidr) = rule.cidr.filter(|c| !c.is_any()) {
        match rule.direction {
            Direction::Ingress => tokens.push(format!("nw_src={}", cidr)),
            Direction::Egress => tokens.push(format!("nw_dst={}", cidr)),
        }
    }

    if matches!(rule.protocol, Protocol::Tcp | Protocol::Udp) {
        tokens.push(format!("tp_dst={}", rule.port_min));
    }

    tokens.join(",")
}

pub fn compile_rule(rule: &SecurityRule) -> FlowRule {
    FlowRule::normal(rule.priority, rule_match(rule))
}

/// Match that lets traffic for `remote` leave through the local bridge
pub fn peering_match(remote: &Ipv4Cidr) -> String {
    format!("ip,nw_dst={}", remote)
}

pub fn peering_rule(remote: &Ipv4Cidr) -> FlowRule {
    FlowRule::normal(PEERING_PRIORITY, peering_match(remote))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SecurityRule;

    fn rule(
        protocol: Protocol,
        direction: Direction,
        cidr: Option<&str>,
        ports: (u16, u16),
        priority: u16,
    ) -> SecurityRule {
        SecurityRule::new(
            protocol,
            direction,
            cidr.map(|c| c.parse().unwrap()),
            ports.0,
            ports.1,
            priority,
        )
        .unwrap()
    }

    #[test]
    fn test_tcp_ingress_with_cidr() {
        let r = rule(Protocol::Tcp, Direction::Ingress, Some("10.0.0.0/8"), (22, 22), 100);
        let flow = compile_rule(&r);
        assert_eq!(flow.priority, 100);
        assert_eq!(flow.match_, "tcp,nw_src=10.0.0.0/8,tp_dst=22");
        assert_eq!(flow.actions, "NORMAL");
    }

    #[test]
    fn test_udp_egress_with_cidr() {
        let r = rule(Protocol::Udp, Direction::Egress, Some("192.168.1.0/24"), (53, 53), 200);
        assert_eq!(rule_match(&r), "udp,nw_dst=192.168.1.0/24,tp_dst=53");
    }

    #[test]
    fn test_any_cidr_is_omitted() {
        let none = rule(Protocol::Tcp, Direction::Ingress, None, (80, 80), 10);
        let any = rule(Protocol::Tcp, Direction::Ingress, Some("0.0.0.0/0"), (80, 80), 10);
        assert_eq!(rule_match(&none), "tcp,tp_dst=80");
        assert_eq!(rule_match(&any), "tcp,tp_dst=80");
    }

    #[test]
    fn test_port_range_uses_lower_bound() {
        let r = rule(Protocol::Tcp, Direction::Ingress, None, (8000, 8099), 10);
        assert_eq!(rule_match(&r), "tcp,tp_dst=8000");
    }

    #[test]
    fn test_icmp_and_arp_have_no_port() {
        let icmp = rule(Protocol::Icmp, Direction::Ingress, Some("10.1.0.0/16"), (0, 0), 5);
        assert_eq!(rule_match(&icmp), "icmp,nw_src=10.1.0.0/16");

        let arp = SecurityRule::arp(Direction::Egress);
        let flow = compile_rule(&arp);
        assert_eq!(flow.match_, "arp");
        assert_eq!(flow.priority, 1000);
    }

    #[test]
    fn test_all_protocol_direction_pairs() {
        let cases = [
            (Protocol::Tcp, Direction::Ingress, "tcp,nw_src=10.9.0.0/16,tp_dst=443"),
            (Protocol::Tcp, Direction::Egress, "tcp,nw_dst=10.9.0.0/16,tp_dst=443"),
            (Protocol::Udp, Direction::Ingress, "udp,nw_src=10.9.0.0/16,tp_dst=443"),
            (Protocol::Udp, Direction::Egress, "udp,nw_dst=10.9.0.0/16,tp_dst=443"),
            (Protocol::Icmp, Direction::Ingress, "icmp,nw_src=10.9.0.0/16"),
            (Protocol::Icmp, Direction::Egress, "icmp,nw_dst=10.9.0.0/16"),
            (Protocol::Arp, Direction::Ingress, "arp,nw_src=10.9.0.0/16"),
            (Protocol::Arp, Direction::Egress, "arp,nw_dst=10.9.0.0/16"),
        ];
        for (protocol, direction, expected) in cases {
            let r = rule(protocol, direction, Some("10.9.0.0/16"), (443, 443), 1);
            assert_eq!(rule_match(&r), expected, "{protocol}/{direction}");
        }
    }

    #[test]
    fn test_peering_rule() {
        let flow = peering_rule(&"10.20.0.0/16".parse().unwrap());
        assert_eq!(flow.priority, 500);
        assert_eq!(flow.match_, "ip,nw_dst=10.20.0.0/16");
        assert_eq!(flow.actions, "NORMAL");
        assert_eq!(
            flow.to_string(),
            "priority=500,ip,nw_dst=10.20.0.0/16,actions=NORMAL"
        );
    }

    #[test]
    fn test_wire_shape() {
        let flow = peering_rule(&"10.0.0.0/16".parse().unwrap());
        let value = serde_json::to_value(&flow).unwrap();
        assert_eq!(value["priority"], 500);
        assert_eq!(value["match"], "ip,nw_dst=10.0.0.0/16");
        assert_eq!(value["actions"], "NORMAL");
    }
}
