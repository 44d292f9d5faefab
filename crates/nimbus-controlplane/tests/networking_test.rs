mod common;
use common::TestPlatform;
use nimbus_controlplane::RuleSpec;
use nimbus_core::ErrorKind;
use nimbus_core::model::{PeeringStatus, QuotaCounters};
use std::net::Ipv4Addr;

#[tokio::test]
async fn test_subnet_gateway_and_address_allocation() {
    let p = TestPlatform::new();

    // 1. VPC and subnet
    let (vpc, subnet) = p
        .network_with_subnet("prod", "10.0.0.0/16", "10.0.1.0/24")
        .await;
    assert!(p.network.has_bridge(&vpc.network_id));
    assert_eq!(subnet.gateway_ip, Ipv4Addr::new(10, 0, 1, 1));
    assert_eq!(subnet.availability_zone, "zone-a");
    assert_eq!(subnet.name, "10.0.1.0/24");

    // 2. Two instances take the lowest free hosts after the gateway
    let web = p.launch_in("web", &subnet).await;
    let db = p.launch_in("db", &subnet).await;
    assert_eq!(web.private_ip, Some(Ipv4Addr::new(10, 0, 1, 2)));
    assert_eq!(db.private_ip, Some(Ipv4Addr::new(10, 0, 1, 3)));

    // 3. A freed address is handed out again
    p.cp.instances.terminate(&p.ctx, "web").await.unwrap();
    let cache = p.launch_in("cache", &subnet).await;
    assert_eq!(cache.private_ip, Some(Ipv4Addr::new(10, 0, 1, 2)));

    assert_eq!(
        p.actions().iter().filter(|a| *a == "SUBNET_CREATE").count(),
        1
    );
}

#[tokio::test]
async fn test_subnet_must_fit_vpc_and_not_overlap() {
    let p = TestPlatform::new();
    let vpc = p.cp.vpcs.create(&p.ctx, "prod", "10.0.0.0/16").await.unwrap();
    let vpc_id = vpc.id.to_string();

    let err = p
        .cp
        .subnets
        .create(&p.ctx, &vpc_id, "outside", "10.1.0.0/24", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    // The whole VPC block is not a subnet of it
    let err = p
        .cp
        .subnets
        .create(&p.ctx, &vpc_id, "all", "10.0.0.0/16", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    p.cp.subnets
        .create(&p.ctx, &vpc_id, "a", "10.0.0.0/20", Some("zone-b"))
        .await
        .unwrap();
    let err = p
        .cp
        .subnets
        .create(&p.ctx, &vpc_id, "b", "10.0.8.0/24", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let subnets = p.cp.subnets.list(&p.ctx, Some("prod")).await.unwrap();
    assert_eq!(subnets.len(), 1);
    assert_eq!(subnets[0].availability_zone, "zone-b");
}

#[tokio::test]
async fn test_vpc_delete_refused_while_referenced() {
    let p = TestPlatform::new();
    let (vpc, subnet) = p
        .network_with_subnet("prod", "10.0.0.0/16", "10.0.1.0/24")
        .await;
    let other = p.cp.vpcs.create(&p.ctx, "other", "10.9.0.0/16").await.unwrap();

    // 1. Subnet still present
    let err = p.cp.vpcs.delete(&p.ctx, "prod").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    // 2. Pending peering still present
    p.cp.subnets.delete(&p.ctx, &subnet.id.to_string()).await.unwrap();
    let peering = p
        .cp
        .peerings
        .create(&p.ctx, "prod", "other")
        .await
        .unwrap();
    let err = p.cp.vpcs.delete(&p.ctx, "prod").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(p.network.has_bridge(&vpc.network_id));

    // 3. A rejected peering does not block and goes with the VPC
    p.cp.peerings
        .reject(&p.ctx, &peering.id.to_string())
        .await
        .unwrap();
    p.cp.vpcs.delete(&p.ctx, "prod").await.unwrap();
    assert!(!p.network.has_bridge(&vpc.network_id));
    assert!(p.network.has_bridge(&other.network_id));
    assert!(p.cp.peerings.list(&p.ctx).await.unwrap().is_empty());

    let quota = p.cp.quota.get(&p.ctx).await.unwrap();
    assert_eq!(quota.used.vpcs, 1);
}

#[tokio::test]
async fn test_vpc_quota_and_duplicate_names() {
    let p = TestPlatform::new();
    p.cp.quota
        .set_limits(
            &p.ctx,
            QuotaCounters {
                vpcs: 1,
                ..QuotaCounters::default_limits()
            },
        )
        .await
        .unwrap();

    p.cp.vpcs.create(&p.ctx, "one", "10.0.0.0/16").await.unwrap();
    let err = p.cp.vpcs.create(&p.ctx, "one", "10.1.0.0/16").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let err = p.cp.vpcs.create(&p.ctx, "two", "10.1.0.0/16").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
    assert_eq!(p.network.bridge_count(), 1);

    // Another tenant neither sees the VPC nor shares the limit
    let stranger = p.stranger();
    let err = p.cp.vpcs.get(&stranger, "one").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    p.cp.vpcs.create(&stranger, "one", "10.0.0.0/16").await.unwrap();
}

#[tokio::test]
async fn test_vpc_create_releases_quota_when_bridge_fails() {
    let p = TestPlatform::new();
    p.network.faults.fail("create_bridge");

    let err = p.cp.vpcs.create(&p.ctx, "prod", "10.0.0.0/16").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert_eq!(p.cp.quota.get(&p.ctx).await.unwrap().used.vpcs, 0);
    assert!(p.cp.vpcs.list(&p.ctx).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_security_group_flows_follow_rules() {
    let p = TestPlatform::new();
    let vpc = p.cp.vpcs.create(&p.ctx, "prod", "10.0.0.0/16").await.unwrap();
    let bridge = vpc.network_id.clone();

    // 1. New group installs its ARP flows
    let web = p
        .cp
        .security_groups
        .create_group(&p.ctx, vpc.id, "web", "web tier")
        .await
        .unwrap();
    assert!(p.network.flows(&bridge).iter().any(|f| f.match_ == "arp"));

    // 2. Rules compile to flows on the VPC bridge
    let ssh = p
        .cp
        .security_groups
        .add_rule(&p.ctx, "web", &RuleSpec::tcp_ingress(22, Some("10.0.0.0/8"), 100))
        .await
        .unwrap();
    let http = p
        .cp
        .security_groups
        .add_rule(&p.ctx, "web", &RuleSpec::tcp_ingress(80, None, 200))
        .await
        .unwrap();
    let flows = p.network.flows(&bridge);
    let ssh_flow = flows
        .iter()
        .find(|f| f.match_ == "tcp,nw_src=10.0.0.0/8,tp_dst=22")
        .unwrap();
    assert_eq!(ssh_flow.priority, 100);
    assert_eq!(ssh_flow.actions, "NORMAL");
    assert!(flows.iter().any(|f| f.match_ == "tcp,tp_dst=80"));

    // 3. A match still needed by another group stays installed
    p.cp.security_groups
        .create_group(&p.ctx, vpc.id, "admin", "")
        .await
        .unwrap();
    p.cp.security_groups
        .add_rule(&p.ctx, "admin", &RuleSpec::tcp_ingress(80, None, 300))
        .await
        .unwrap();
    p.cp.security_groups
        .remove_rule(&p.ctx, "web", http.id)
        .await
        .unwrap();
    assert!(
        p.network
            .flows(&bridge)
            .iter()
            .any(|f| f.match_ == "tcp,tp_dst=80")
    );

    // 4. A match nobody needs is withdrawn
    p.cp.security_groups
        .remove_rule(&p.ctx, "web", ssh.id)
        .await
        .unwrap();
    assert!(
        !p.network
            .flows(&bridge)
            .iter()
            .any(|f| f.match_.contains("tp_dst=22"))
    );

    // 5. The implicit ARP rules stay
    let arp = web.rules[0].id;
    let err = p
        .cp
        .security_groups
        .remove_rule(&p.ctx, "web", arp)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[tokio::test]
async fn test_security_group_rule_reverted_when_flow_fails() {
    let p = TestPlatform::new();
    let vpc = p.cp.vpcs.create(&p.ctx, "prod", "10.0.0.0/16").await.unwrap();
    p.cp.security_groups
        .create_group(&p.ctx, vpc.id, "web", "")
        .await
        .unwrap();

    p.network.faults.fail("add_flow_rule");
    let err = p
        .cp
        .security_groups
        .add_rule(&p.ctx, "web", &RuleSpec::tcp_ingress(443, None, 100))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);

    let group = p.cp.security_groups.get(&p.ctx, "web").await.unwrap();
    assert_eq!(group.rules.len(), 2);
}

#[tokio::test]
async fn test_security_group_attach_and_delete() {
    let p = TestPlatform::new();
    let (vpc, subnet) = p
        .network_with_subnet("prod", "10.0.0.0/16", "10.0.1.0/24")
        .await;
    let (_, elsewhere) = p
        .network_with_subnet("lab", "10.5.0.0/16", "10.5.1.0/24")
        .await;
    p.cp.security_groups
        .create_group(&p.ctx, vpc.id, "web", "")
        .await
        .unwrap();
    p.launch_in("web-1", &subnet).await;
    p.launch_in("lab-1", &elsewhere).await;

    // 1. Groups only attach within their VPC
    let err = p
        .cp
        .security_groups
        .attach_to_instance(&p.ctx, "web", "lab-1")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CrossVpc);

    // 2. Attached groups cannot be deleted
    p.cp.security_groups
        .attach_to_instance(&p.ctx, "web", "web-1")
        .await
        .unwrap();
    let instance = p.cp.instances.get(&p.ctx, "web-1").await.unwrap();
    assert_eq!(instance.security_group_ids.len(), 1);
    let err = p
        .cp
        .security_groups
        .delete_group(&p.ctx, "web")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    // 3. Detached, it goes
    p.cp.security_groups
        .detach_from_instance(&p.ctx, "web", "web-1")
        .await
        .unwrap();
    p.cp.security_groups.delete_group(&p.ctx, "web").await.unwrap();
    assert!(p.cp.security_groups.list(&p.ctx, Some(vpc.id)).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_peering_installs_reciprocal_flows() {
    let p = TestPlatform::new();
    let a = p.cp.vpcs.create(&p.ctx, "a", "10.10.0.0/16").await.unwrap();
    let b = p.cp.vpcs.create(&p.ctx, "b", "10.20.0.0/16").await.unwrap();

    let peering = p.cp.peerings.create(&p.ctx, "a", "b").await.unwrap();
    assert_eq!(peering.status, PeeringStatus::Pending);
    assert!(p.network.flows(&a.network_id).is_empty());

    let peering = p
        .cp
        .peerings
        .accept(&p.ctx, &peering.id.to_string())
        .await
        .unwrap();
    assert_eq!(peering.status, PeeringStatus::Active);

    let on_a = p.network.flows(&a.network_id);
    let on_b = p.network.flows(&b.network_id);
    assert_eq!(on_a.len(), 1);
    assert_eq!(on_a[0].match_, "ip,nw_dst=10.20.0.0/16");
    assert_eq!(on_a[0].priority, 500);
    assert_eq!(on_b[0].match_, "ip,nw_dst=10.10.0.0/16");

    // A second request for the same pair is refused while active
    let err = p.cp.peerings.create(&p.ctx, "b", "a").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    p.cp.peerings
        .delete(&p.ctx, &peering.id.to_string())
        .await
        .unwrap();
    assert!(p.network.flows(&a.network_id).is_empty());
    assert!(p.network.flows(&b.network_id).is_empty());
    assert!(p.actions().contains(&"VPC_PEERING_DELETE".to_string()));
}

#[tokio::test]
async fn test_peering_accept_failure_withdraws_first_flow() {
    let p = TestPlatform::new();
    let a = p.cp.vpcs.create(&p.ctx, "a", "10.10.0.0/16").await.unwrap();
    let b = p.cp.vpcs.create(&p.ctx, "b", "10.20.0.0/16").await.unwrap();
    let peering = p.cp.peerings.create(&p.ctx, "a", "b").await.unwrap();

    p.network.faults.fail_on("add_flow_rule", &b.network_id);
    let err = p
        .cp
        .peerings
        .accept(&p.ctx, &peering.id.to_string())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);

    let stored = p
        .cp
        .peerings
        .get(&p.ctx, &peering.id.to_string())
        .await
        .unwrap();
    assert_eq!(stored.status, PeeringStatus::Failed);
    assert!(stored.status_reason.is_some());

    assert!(p.network.calls.of("delete_flow_rule").contains(&vec![
        a.network_id.clone(),
        "ip,nw_dst=10.20.0.0/16".to_string(),
    ]));
    assert!(p.network.flows(&a.network_id).is_empty());
    assert!(p.network.flows(&b.network_id).is_empty());
}

#[tokio::test]
async fn test_peering_rejects_self_and_overlap() {
    let p = TestPlatform::new();
    p.cp.vpcs.create(&p.ctx, "a", "10.0.0.0/16").await.unwrap();
    p.cp.vpcs.create(&p.ctx, "b", "10.0.128.0/17").await.unwrap();

    let err = p.cp.peerings.create(&p.ctx, "a", "a").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let err = p.cp.peerings.create(&p.ctx, "a", "b").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert!(p.cp.peerings.list(&p.ctx).await.unwrap().is_empty());
}
