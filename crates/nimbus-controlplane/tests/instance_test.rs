mod common;
use common::TestPlatform;
use nimbus_controlplane::instance::{LABEL_INSTANCE_ID, LaunchParams, VolumeMount};
use nimbus_controlplane::store::VolumeStore;
use nimbus_core::ErrorKind;
use nimbus_core::model::{InstanceStatus, PortMapping, QuotaCounters, VolumeStatus};
use nimbus_core::RequestContext;
use std::net::Ipv4Addr;

fn with_volume(name: &str, subnet: &str, volume: &str) -> LaunchParams {
    LaunchParams {
        subnet: Some(subnet.to_string()),
        volumes: vec![VolumeMount {
            volume: volume.to_string(),
            mount_path: None,
        }],
        ..LaunchParams::new(name, "postgres:16")
    }
}

#[tokio::test]
async fn test_launch_wires_container_network_and_dns() {
    let p = TestPlatform::new();
    let (vpc, subnet) = p
        .network_with_subnet("prod", "10.0.0.0/16", "10.0.1.0/24")
        .await;

    let params = LaunchParams {
        subnet: Some(subnet.id.to_string()),
        instance_type: Some("small".to_string()),
        ports: vec![PortMapping::tcp(0, 80)],
        env: vec![("MODE".to_string(), "prod".to_string())],
        ..LaunchParams::new("web", "nginx:alpine")
    };
    let web = p.cp.instances.launch(&p.ctx, &params).await.unwrap();

    // 1. Record
    assert_eq!(web.status, InstanceStatus::Running);
    assert_eq!(web.vpc_id, Some(vpc.id));
    assert_eq!(web.instance_type, "small");
    let container_id = web.container_id.clone().unwrap();

    // 2. Container
    let spec = p.compute.spec(&container_id).unwrap();
    assert_eq!(spec.image, "nginx:alpine");
    assert!(spec.name.starts_with("web-"));
    assert_eq!(spec.labels.get(LABEL_INSTANCE_ID), Some(&web.id.to_string()));
    assert_eq!(spec.network_id.as_deref(), Some(vpc.network_id.as_str()));
    assert_eq!(spec.cpus, Some(2.0));
    assert_eq!(spec.env, vec![("MODE".to_string(), "prod".to_string())]);

    // 3. Veth pair on the VPC bridge, addressed in the subnet
    let host_end = web.veth_host.clone().unwrap();
    let veth = p.network.veth(&host_end).unwrap();
    assert_eq!(veth.bridge.as_deref(), Some(vpc.network_id.as_str()));
    assert_eq!(veth.address, Some((Ipv4Addr::new(10, 0, 1, 2), 24)));

    // 4. Private DNS
    assert_eq!(
        p.dns.lookup(p.ctx.tenant_id, "web"),
        Some(Ipv4Addr::new(10, 0, 1, 2))
    );
    assert!(p.actions().contains(&"INSTANCE_LAUNCH".to_string()));

    let quota = p.cp.quota.get(&p.ctx).await.unwrap();
    assert_eq!(quota.used.instances, 1);
    assert_eq!(quota.used.vcpus, 2);
}

#[tokio::test]
async fn test_launch_without_vpc_skips_networking() {
    let p = TestPlatform::new();
    let solo = p
        .cp
        .instances
        .launch(&p.ctx, &LaunchParams::new("solo", "alpine"))
        .await
        .unwrap();

    assert_eq!(solo.status, InstanceStatus::Running);
    assert!(solo.private_ip.is_none());
    assert!(solo.veth_host.is_none());
    assert_eq!(p.network.veth_count(), 0);
    assert_eq!(p.dns.calls.count("register_instance"), 0);
}

#[tokio::test]
async fn test_launch_validation() {
    let p = TestPlatform::new();
    let (_, subnet) = p
        .network_with_subnet("prod", "10.0.0.0/16", "10.0.1.0/24")
        .await;
    p.cp.vpcs.create(&p.ctx, "other", "10.1.0.0/16").await.unwrap();

    let err = p
        .cp
        .instances
        .launch(&p.ctx, &LaunchParams::new("", "alpine"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let params = LaunchParams {
        instance_type: Some("colossal".to_string()),
        ..LaunchParams::new("big", "alpine")
    };
    let err = p.cp.instances.launch(&p.ctx, &params).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let params = LaunchParams {
        vpc: Some("other".to_string()),
        subnet: Some(subnet.id.to_string()),
        ..LaunchParams::new("mixed", "alpine")
    };
    let err = p.cp.instances.launch(&p.ctx, &params).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CrossVpc);

    p.launch_in("web", &subnet).await;
    let err = p
        .cp
        .instances
        .launch(&p.ctx, &LaunchParams::new("web", "alpine"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    assert_eq!(p.compute.container_count(), 1);
    assert_eq!(p.cp.quota.get(&p.ctx).await.unwrap().used.instances, 1);
}

#[tokio::test]
async fn test_launch_over_quota_creates_nothing() {
    let p = TestPlatform::new();
    p.cp.quota
        .set_limits(
            &p.ctx,
            QuotaCounters {
                instances: 1,
                ..QuotaCounters::default_limits()
            },
        )
        .await
        .unwrap();

    p.cp.instances
        .launch(&p.ctx, &LaunchParams::new("one", "alpine"))
        .await
        .unwrap();
    let err = p
        .cp
        .instances
        .launch(&p.ctx, &LaunchParams::new("two", "alpine"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
    assert_eq!(p.compute.container_count(), 1);
    assert_eq!(p.cp.instances.list(&p.ctx).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_launch_failure_unwinds_every_stage() {
    let p = TestPlatform::new();
    let (_, subnet) = p
        .network_with_subnet("prod", "10.0.0.0/16", "10.0.1.0/24")
        .await;
    let volume = p.cp.volumes.create(&p.ctx, "data", 20).await.unwrap();

    // The veth cannot be addressed: container and bind must be undone
    p.network.faults.fail("set_veth_ip");
    let err = p
        .cp
        .instances
        .launch(&p.ctx, &with_volume("db", &subnet.id.to_string(), "data"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);

    assert!(p.cp.instances.list(&p.ctx).await.unwrap().is_empty());
    assert_eq!(p.compute.container_count(), 0);
    assert_eq!(p.compute.calls.count("remove_container"), 1);
    assert_eq!(p.network.veth_count(), 0);
    assert!(p.storage.attached_to(&volume.backend_path).is_none());

    let volume = p.cp.volumes.get(&p.ctx, "data").await.unwrap();
    assert_eq!(volume.status, VolumeStatus::Available);

    let quota = p.cp.quota.get(&p.ctx).await.unwrap();
    assert_eq!(quota.used.instances, 0);
    assert_eq!(quota.used.vcpus, 0);
    assert_eq!(quota.used.storage_gb, 20);

    // The address is free again
    p.network.faults.clear();
    let db = p
        .cp
        .instances
        .launch(&p.ctx, &with_volume("db", &subnet.id.to_string(), "data"))
        .await
        .unwrap();
    assert_eq!(db.private_ip, Some(Ipv4Addr::new(10, 0, 1, 2)));
}

#[tokio::test]
async fn test_container_failure_leaves_no_record() {
    let p = TestPlatform::new();
    p.compute.faults.fail("create_container");

    let err = p
        .cp
        .instances
        .launch(&p.ctx, &LaunchParams::new("web", "nginx"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert!(p.cp.instances.get(&p.ctx, "web").await.unwrap_err().is_not_found());
    assert_eq!(p.cp.quota.get(&p.ctx).await.unwrap().used.instances, 0);
    assert!(!p.actions().contains(&"INSTANCE_LAUNCH".to_string()));
}

#[tokio::test]
async fn test_terminate_releases_volumes() {
    let p = TestPlatform::new();
    let (_, subnet) = p
        .network_with_subnet("prod", "10.0.0.0/16", "10.0.1.0/24")
        .await;
    p.cp.volumes.create(&p.ctx, "data", 10).await.unwrap();

    // 1. Launch binds the volume
    let db = p
        .cp
        .instances
        .launch(&p.ctx, &with_volume("db", &subnet.id.to_string(), "data"))
        .await
        .unwrap();
    let volume = p.cp.volumes.get(&p.ctx, "data").await.unwrap();
    assert_eq!(volume.status, VolumeStatus::InUse);
    assert_eq!(volume.instance_id, Some(db.id));
    assert_eq!(volume.mount_path, "/mnt/data");
    let spec = p.compute.spec(db.container_id.as_deref().unwrap()).unwrap();
    assert_eq!(spec.mounts[0].target, "/mnt/data");

    // 2. In use: cannot be deleted or bound twice
    let err = p.cp.volumes.delete(&p.ctx, "data").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let err = p
        .cp
        .instances
        .launch(&p.ctx, &with_volume("db-2", &subnet.id.to_string(), "data"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    // 3. Terminate returns it
    p.cp.instances.terminate(&p.ctx, "db").await.unwrap();
    let volume = p.cp.volumes.get(&p.ctx, "data").await.unwrap();
    assert_eq!(volume.status, VolumeStatus::Available);
    assert!(volume.instance_id.is_none());
    assert_eq!(volume.mount_path, "");
    assert!(p.storage.attached_to(&volume.backend_path).is_none());
    assert!(p.dns.lookup(p.ctx.tenant_id, "db").is_none());
    assert_eq!(p.network.veth_count(), 0);

    p.cp.volumes.delete(&p.ctx, "data").await.unwrap();
    assert_eq!(p.storage.volume_count(), 0);
}

#[tokio::test]
async fn test_terminate_stops_when_container_removal_fails() {
    let p = TestPlatform::new();
    let (_, subnet) = p
        .network_with_subnet("prod", "10.0.0.0/16", "10.0.1.0/24")
        .await;
    p.cp.volumes.create(&p.ctx, "data", 10).await.unwrap();
    p.cp.instances
        .launch(&p.ctx, &with_volume("db", &subnet.id.to_string(), "data"))
        .await
        .unwrap();

    p.compute.faults.fail("remove_container");
    let err = p.cp.instances.terminate(&p.ctx, "db").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);

    let db = p.cp.instances.get(&p.ctx, "db").await.unwrap();
    assert_eq!(db.status, InstanceStatus::Running);
    assert_eq!(p.network.veth_count(), 1);
    let volume = p.cp.volumes.get(&p.ctx, "data").await.unwrap();
    assert_eq!(volume.status, VolumeStatus::InUse);
    assert_eq!(volume.instance_id, Some(db.id));
    assert_eq!(p.cp.quota.get(&p.ctx).await.unwrap().used.instances, 1);
}

#[tokio::test]
async fn test_terminate_after_container_removal_keeps_no_stale_handle() {
    let p = TestPlatform::new();
    let (_, subnet) = p
        .network_with_subnet("prod", "10.0.0.0/16", "10.0.1.0/24")
        .await;
    p.cp.volumes.create(&p.ctx, "data", 10).await.unwrap();
    let db = p
        .cp
        .instances
        .launch(&p.ctx, &with_volume("db", &subnet.id.to_string(), "data"))
        .await
        .unwrap();

    // Volume moved out from under the instance: its release is refused
    let mut volume = p.cp.volumes.get(&p.ctx, "data").await.unwrap();
    volume.status = VolumeStatus::Error;
    p.store.update_volume(&volume).await.unwrap();

    let err = p.cp.instances.terminate(&p.ctx, "db").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(p.compute.calls.count("remove_container"), 1);
    let stuck = p.cp.instances.get(&p.ctx, "db").await.unwrap();
    assert_eq!(stuck.status, InstanceStatus::Error);
    assert!(stuck.container_id.is_none());
    assert!(stuck.veth_host.is_none());
    assert!(stuck.status_reason.is_some());

    // Once the volume is back, a second terminate finishes without the backend
    volume.status = VolumeStatus::InUse;
    p.store.update_volume(&volume).await.unwrap();
    p.cp.instances.terminate(&p.ctx, "db").await.unwrap();
    assert_eq!(p.compute.calls.count("remove_container"), 1);
    let err = p
        .cp
        .instances
        .get(&p.ctx, &db.id.to_string())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let volume = p.cp.volumes.get(&p.ctx, "data").await.unwrap();
    assert_eq!(volume.status, VolumeStatus::Available);
    assert_eq!(p.cp.quota.get(&p.ctx).await.unwrap().used.instances, 0);
}

#[tokio::test]
async fn test_stop_start_logs_and_stats() {
    let p = TestPlatform::new();
    p.cp.instances
        .launch(&p.ctx, &LaunchParams::new("web", "nginx"))
        .await
        .unwrap();

    let err = p.cp.instances.start(&p.ctx, "web").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let stopped = p.cp.instances.stop(&p.ctx, "web").await.unwrap();
    assert_eq!(stopped.status, InstanceStatus::Stopped);
    let container_id = stopped.container_id.clone().unwrap();
    assert!(!p.compute.is_running(&container_id));

    let err = p.cp.instances.stop(&p.ctx, "web").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InstanceNotRunning);
    let err = p.cp.instances.stats(&p.ctx, "web").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InstanceNotRunning);
    assert!(p.cp.instances.logs(&p.ctx, "web", Some(10)).await.is_ok());

    let started = p.cp.instances.start(&p.ctx, "web").await.unwrap();
    assert_eq!(started.status, InstanceStatus::Running);
    assert!(started.version > stopped.version);
    let stats = p.cp.instances.stats(&p.ctx, "web").await.unwrap();
    assert!(stats.cpu_percent > 0.0);

    let actions = p.actions();
    assert!(actions.contains(&"INSTANCE_STOP".to_string()));
    assert!(actions.contains(&"INSTANCE_START".to_string()));
}

#[tokio::test]
async fn test_cancelled_request_changes_nothing() {
    let p = TestPlatform::new();
    let (ctx, handle) = RequestContext::cancellable(p.ctx.user_id, p.ctx.tenant_id);
    handle.cancel();

    let err = p
        .cp
        .instances
        .launch(&ctx, &LaunchParams::new("web", "nginx"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(p.compute.container_count(), 0);
    assert!(p.cp.instances.list(&p.ctx).await.unwrap().is_empty());
}
