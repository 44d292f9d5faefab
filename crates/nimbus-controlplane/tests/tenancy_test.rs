mod common;
use common::TestPlatform;
use nimbus_controlplane::instance::LaunchParams;
use nimbus_core::ErrorKind;

#[tokio::test]
async fn test_secret_values_only_on_get() {
    let p = TestPlatform::new();

    // 1. Create answers without the value
    let created = p
        .cp
        .secrets
        .create(&p.ctx, "db-password", "hunter2", Some("prod db".to_string()))
        .await
        .unwrap();
    assert!(created.value.is_none());
    assert_eq!(created.description.as_deref(), Some("prod db"));

    // 2. Stored sealed
    let stored = p
        .cp
        .secrets
        .list(&p.ctx)
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert!(stored.iter().all(|s| s.value.is_none()));
    assert!(stored[0].last_accessed_at.is_none());

    // 3. Get reveals and stamps the access time
    let revealed = p.cp.secrets.get(&p.ctx, "db-password").await.unwrap();
    assert_eq!(revealed.value.as_deref(), Some("hunter2"));
    assert!(revealed.last_accessed_at.is_some());
    let listed = p.cp.secrets.list(&p.ctx).await.unwrap();
    assert!(listed[0].value.is_none());
    assert!(listed[0].last_accessed_at.is_some());

    // 4. By id as well as by name
    let by_id = p
        .cp
        .secrets
        .get(&p.ctx, &created.id.to_string())
        .await
        .unwrap();
    assert_eq!(by_id.value.as_deref(), Some("hunter2"));

    let err = p
        .cp
        .secrets
        .create(&p.ctx, "db-password", "other", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    p.cp.secrets.delete(&p.ctx, "db-password").await.unwrap();
    let err = p.cp.secrets.get(&p.ctx, "db-password").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let actions = p.actions();
    assert!(actions.contains(&"SECRET_CREATE".to_string()));
    assert!(actions.contains(&"SECRET_DELETE".to_string()));
}

#[tokio::test]
async fn test_tenants_are_isolated() {
    let p = TestPlatform::new();
    let stranger = p.stranger();
    let (vpc, subnet) = p
        .network_with_subnet("prod", "10.0.0.0/16", "10.0.1.0/24")
        .await;
    let web = p.launch_in("web", &subnet).await;
    let volume = p.cp.volumes.create(&p.ctx, "data", 5).await.unwrap();
    p.cp.secrets.create(&p.ctx, "token", "abc", None).await.unwrap();

    // Nothing is visible across tenants, by id or by name
    assert!(p.cp.vpcs.list(&stranger).await.unwrap().is_empty());
    assert!(p.cp.instances.list(&stranger).await.unwrap().is_empty());
    assert!(p.cp.volumes.list(&stranger).await.unwrap().is_empty());
    assert!(p.cp.secrets.list(&stranger).await.unwrap().is_empty());
    for err in [
        p.cp.vpcs.get(&stranger, &vpc.id.to_string()).await.unwrap_err(),
        p.cp.instances.get(&stranger, &web.id.to_string()).await.unwrap_err(),
        p.cp.instances.terminate(&stranger, "web").await.unwrap_err(),
        p.cp.volumes.delete(&stranger, &volume.id.to_string()).await.unwrap_err(),
        p.cp.secrets.get(&stranger, "token").await.unwrap_err(),
    ] {
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    // Names only need to be unique within a tenant
    p.cp.vpcs.create(&stranger, "prod", "10.0.0.0/16").await.unwrap();
    let their_subnet = p
        .cp
        .subnets
        .create(&stranger, "prod", "", "10.0.1.0/24", None)
        .await
        .unwrap();
    let params = LaunchParams {
        subnet: Some(their_subnet.id.to_string()),
        ..LaunchParams::new("web", "nginx:alpine")
    };
    let theirs = p.cp.instances.launch(&stranger, &params).await.unwrap();
    assert_eq!(theirs.private_ip, web.private_ip);

    // The other tenant's subnet cannot be borrowed
    let params = LaunchParams {
        subnet: Some(their_subnet.id.to_string()),
        ..LaunchParams::new("intruder", "nginx:alpine")
    };
    let err = p.cp.instances.launch(&p.ctx, &params).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    // Quotas are counted per tenant
    let ours = p.cp.quota.get(&p.ctx).await.unwrap();
    let theirs = p.cp.quota.get(&stranger).await.unwrap();
    assert_eq!(ours.used.instances, 1);
    assert_eq!(ours.used.storage_gb, 5);
    assert_eq!(theirs.used.instances, 1);
    assert_eq!(theirs.used.storage_gb, 0);
}

#[tokio::test]
async fn test_activity_is_attributed_to_the_caller() {
    let p = TestPlatform::new();
    let colleague = p.colleague();
    p.cp.vpcs.create(&p.ctx, "prod", "10.0.0.0/16").await.unwrap();
    p.cp.volumes.create(&colleague, "data", 1).await.unwrap();

    let records = p.audit.records();
    let vpc = records.iter().find(|r| r.action == "VPC_CREATE").unwrap();
    assert_eq!(vpc.user_id, p.ctx.user_id);
    assert_eq!(vpc.tenant_id, p.ctx.tenant_id);
    assert_eq!(vpc.resource_type, "vpc");
    let volume = records.iter().find(|r| r.action == "VOLUME_CREATE").unwrap();
    assert_eq!(volume.user_id, colleague.user_id);
    assert_eq!(volume.tenant_id, p.ctx.tenant_id);
}

#[tokio::test]
async fn test_sink_failure_does_not_fail_the_operation() {
    let p = TestPlatform::new();
    p.audit.faults.fail("log");
    p.events.faults.fail("record_event");

    p.cp.secrets.create(&p.ctx, "token", "abc", None).await.unwrap();
    assert!(p.audit.records().is_empty());
    assert!(p.events.records().is_empty());
    assert_eq!(
        p.cp.secrets.get(&p.ctx, "token").await.unwrap().value.as_deref(),
        Some("abc")
    );
}

#[tokio::test]
async fn test_each_action_reaches_audit_and_events_once() {
    let p = TestPlatform::new();
    p.network_with_subnet("prod", "10.0.0.0/16", "10.0.1.0/24")
        .await;

    for actions in [p.audit.actions(), p.events.actions()] {
        assert_eq!(actions, ["VPC_CREATE", "SUBNET_CREATE"]);
    }
}
