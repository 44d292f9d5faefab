//! Instance lifecycle
//!
//! Launch is a staged protocol. Each stage that touches a backend pushes its
//! undo onto a [`Rollback`], so a failure at stage k unwinds k-1..0 and the
//! instance either ends RUNNING or does not exist:
//!
//! 1. validate type, image, ports and the VPC, subnet, group and volume refs
//! 2. charge quota
//! 3. reserve the lowest free address by persisting a PENDING record
//! 4. prepare volume binds
//! 5. create the container
//! 6. wire the veth pair into the VPC bridge
//! 7. bind security groups and mark volumes IN_USE
//! 8. persist RUNNING
//!
//! Terminate runs the other way round and removes the container first: if the
//! runtime refuses, nothing else is touched.

use crate::lookup::{self, parse_id};
use crate::quota::QuotaService;
use crate::rollback::Rollback;
use crate::security_group::SecurityGroupService;
use crate::store::Store;
use crate::{activity, short};
use chrono::Utc;
use nimbus_backend::{
    BackendResultExt, ComputeBackend, ContainerSpec, ContainerStats, DnsRegistrar, Mount,
    NetworkBackend, Notifier, StorageBackend,
};
use nimbus_core::model::{
    DEFAULT_INSTANCE_TYPE, Instance, InstanceStatus, InstanceType, PortMapping, QuotaResource,
    SecurityGroup, Subnet, Volume, VolumeStatus, Vpc,
};
use nimbus_core::{CloudError, ErrorKind, RequestContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Attempts at reserving an address when a concurrent launch takes it first
const IP_RESERVE_ATTEMPTS: usize = 3;

pub const LABEL_INSTANCE_ID: &str = "nimbus.instance-id";
pub const LABEL_TENANT_ID: &str = "nimbus.tenant-id";

/// A volume to bind at launch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Volume id or name
    pub volume: String,
    #[serde(default)]
    pub mount_path: Option<String>,
}

/// Input of [`InstanceService::launch`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchParams {
    pub name: String,
    pub image: String,
    pub instance_type: Option<String>,
    /// VPC id or name
    pub vpc: Option<String>,
    /// Subnet id; implies its VPC
    pub subnet: Option<String>,
    pub ports: Vec<PortMapping>,
    pub volumes: Vec<VolumeMount>,
    /// Security group ids or names
    pub security_groups: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cmd: Vec<String>,
}

impl LaunchParams {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }
}

fn instance_charge(ty: &InstanceType) -> [(QuotaResource, u64); 3] {
    [
        (QuotaResource::Instances, 1),
        (QuotaResource::Vcpus, ty.vcpus),
        (QuotaResource::MemoryGb, ty.memory_gb),
    ]
}

/// References resolved during validation
struct Placement {
    vpc: Option<Vpc>,
    subnet: Option<Subnet>,
    groups: Vec<SecurityGroup>,
    volumes: Vec<(Volume, String)>,
}

pub struct InstanceService {
    store: Arc<dyn Store>,
    compute: Arc<dyn ComputeBackend>,
    network: Arc<dyn NetworkBackend>,
    storage: Arc<dyn StorageBackend>,
    dns: Arc<dyn DnsRegistrar>,
    quota: Arc<QuotaService>,
    groups: Arc<SecurityGroupService>,
    notifier: Notifier,
}

impl InstanceService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        compute: Arc<dyn ComputeBackend>,
        network: Arc<dyn NetworkBackend>,
        storage: Arc<dyn StorageBackend>,
        dns: Arc<dyn DnsRegistrar>,
        quota: Arc<QuotaService>,
        groups: Arc<SecurityGroupService>,
        notifier: Notifier,
    ) -> Self {
        Self {
            store,
            compute,
            network,
            storage,
            dns,
            quota,
            groups,
            notifier,
        }
    }

    pub async fn launch(&self, ctx: &RequestContext, params: &LaunchParams) -> Result<Instance> {
        ctx.ensure_active()?;
        let name = params.name.trim();
        if name.is_empty() {
            return Err(CloudError::invalid("instance name is required"));
        }
        if params.image.trim().is_empty() {
            return Err(CloudError::invalid("image is required"));
        }
        let instance_type = InstanceType::lookup(
            params
                .instance_type
                .as_deref()
                .filter(|t| !t.is_empty())
                .unwrap_or(DEFAULT_INSTANCE_TYPE),
        )?;
        if let Some(port) = params.ports.iter().find(|p| p.container == 0) {
            return Err(CloudError::invalid(format!(
                "container port of mapping {}:{} must be non-zero",
                port.host, port.container
            )));
        }
        if self.store.find_instance_by_name(ctx.tenant_id, name).await?.is_some() {
            return Err(CloudError::conflict(format!("instance '{}' already exists", name)));
        }
        let placement = self.resolve_placement(ctx, params).await?;

        // Quota
        let charge = instance_charge(&instance_type);
        self.quota.reserve(ctx, &charge).await?;
        let mut rollback = Rollback::new();
        {
            let quota = self.quota.clone();
            let cleanup_ctx = ctx.detached();
            rollback.push("release instance quota", move || async move {
                quota.release(&cleanup_ctx, &charge).await;
                Ok(())
            });
        }

        // Address reservation
        let now = Utc::now();
        let draft = Instance {
            id: Uuid::new_v4(),
            tenant_id: ctx.tenant_id,
            user_id: ctx.user_id,
            name: name.to_string(),
            image: params.image.trim().to_string(),
            instance_type: instance_type.name.to_string(),
            vpc_id: placement.vpc.as_ref().map(|v| v.id),
            subnet_id: placement.subnet.as_ref().map(|s| s.id),
            private_ip: None,
            ports: params.ports.clone(),
            container_id: None,
            veth_host: None,
            security_group_ids: Vec::new(),
            status: InstanceStatus::Pending,
            status_reason: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        let reserved = self.reserve(draft, placement.subnet.as_ref()).await;
        let mut instance = rollback.guard(reserved).await?;
        {
            let store = self.store.clone();
            let (tenant_id, id) = (instance.tenant_id, instance.id);
            rollback.push("delete instance record", move || async move {
                store.delete_instance(tenant_id, id).await
            });
        }
        rollback.guard(ctx.ensure_active()).await?;

        // Volume binds
        let instance_ref = instance.id.to_string();
        let mut mounts = Vec::with_capacity(placement.volumes.len());
        for (volume, target) in &placement.volumes {
            let bound = self
                .storage
                .attach_volume(&volume.backend_path, &instance_ref)
                .await
                .step("attach backend volume");
            let source = rollback.guard(bound).await?;
            let storage = self.storage.clone();
            let (path, who) = (volume.backend_path.clone(), instance_ref.clone());
            rollback.push("detach backend volume", move || async move {
                storage.detach_volume(&path, &who).await.step("detach backend volume")
            });
            mounts.push(Mount {
                source,
                target: target.clone(),
                read_only: false,
            });
        }

        // Container
        instance.status = InstanceStatus::Starting;
        let staged = self.store.update_instance(&instance).await;
        instance = rollback.guard(staged).await?;
        rollback.guard(ctx.ensure_active()).await?;

        let spec = self.container_spec(&instance, &instance_type, &placement, mounts, params);
        let created = self
            .compute
            .create_container(&spec)
            .await
            .step("create container");
        let container_id = rollback.guard(created).await?;
        {
            let compute = self.compute.clone();
            let id = container_id.clone();
            rollback.push("remove container", move || async move {
                compute.remove_container(&id).await.step("remove container")
            });
        }

        // Networking
        if let (Some(vpc), Some(subnet), Some(ip)) =
            (&placement.vpc, &placement.subnet, instance.private_ip)
        {
            let host_end = format!("vh{}", short(&instance.id));
            let peer_end = format!("vp{}", short(&instance.id));
            let paired = self
                .network
                .create_veth_pair(&host_end, &peer_end)
                .await
                .step("create veth pair");
            rollback.guard(paired).await?;
            {
                let network = self.network.clone();
                let host_end = host_end.clone();
                rollback.push("delete veth pair", move || async move {
                    network.delete_veth_pair(&host_end).await.step("delete veth pair")
                });
            }
            let attached = self
                .network
                .attach_veth_to_bridge(&vpc.network_id, &host_end)
                .await
                .step("attach veth to bridge");
            rollback.guard(attached).await?;
            let addressed = self
                .network
                .set_veth_ip(&peer_end, ip, subnet.cidr_block.prefix_len())
                .await
                .step("set veth address");
            rollback.guard(addressed).await?;
            instance.veth_host = Some(host_end);
        }

        // Security groups
        for group in &placement.groups {
            let bound = self.groups.bind(ctx, group, &instance).await;
            rollback.guard(bound).await?;
            let groups = self.groups.clone();
            let cleanup_ctx = ctx.detached();
            let (group_id, instance_id) = (group.id, instance.id);
            rollback.push("unbind security group", move || async move {
                groups.unbind(&cleanup_ctx, group_id, instance_id).await;
                Ok(())
            });
            instance.security_group_ids.push(group.id);
        }

        // Volumes
        for (volume, target) in &placement.volumes {
            let mut volume = volume.clone();
            volume.attach_to(instance.id, target.clone());
            let marked = self
                .store
                .transition_volume(&volume, VolumeStatus::Available)
                .await;
            rollback.guard(marked).await?;
            let store = self.store.clone();
            rollback.push("release volume", move || async move {
                let mut released = volume.clone();
                released.release();
                store.transition_volume(&released, VolumeStatus::InUse).await
            });
        }

        instance.status = InstanceStatus::Running;
        instance.container_id = Some(container_id);
        let running = self.store.update_instance(&instance).await;
        let instance = rollback.guard(running).await?;
        rollback.disarm();

        info!(
            instance_id = %instance.id,
            name = %instance.name,
            private_ip = ?instance.private_ip,
            container_id = ?instance.container_id,
            "instance launched"
        );
        self.notifier
            .emit(
                activity(ctx, "INSTANCE_LAUNCH", "instance", instance.id)
                    .with_meta("image", instance.image.clone().into())
                    .with_meta("instance_type", instance.instance_type.clone().into()),
            )
            .await;
        if let Some(ip) = instance.private_ip
            && let Err(e) = self
                .dns
                .register_instance(ctx.tenant_id, &instance.name, ip)
                .await
        {
            warn!(instance_id = %instance.id, error = %e, "private DNS registration failed");
        }
        Ok(instance)
    }

    pub async fn get(&self, ctx: &RequestContext, key: &str) -> Result<Instance> {
        lookup::instance(self.store.as_ref(), ctx.tenant_id, key).await
    }

    pub async fn list(&self, ctx: &RequestContext) -> Result<Vec<Instance>> {
        self.store.list_instances(ctx.tenant_id).await
    }

    /// Removes the container first. If that fails nothing else changes and
    /// the instance keeps its volumes, address and record.
    pub async fn terminate(&self, ctx: &RequestContext, key: &str) -> Result<()> {
        ctx.ensure_active()?;
        let instance = self.get(ctx, key).await?;
        let ctx = &ctx.detached();

        if let Some(container_id) = &instance.container_id {
            self.compute
                .remove_container(container_id)
                .await
                .step("remove container")?;
        }

        if let Some(host_end) = &instance.veth_host
            && let Err(e) = self.network.delete_veth_pair(host_end).await
        {
            warn!(instance_id = %instance.id, veth = %host_end, error = %e, "failed to delete veth pair");
        }
        for group_id in &instance.security_group_ids {
            self.groups.unbind(ctx, *group_id, instance.id).await;
        }
        let released = match self.release_volumes(ctx, &instance).await {
            Ok(()) => self.store.delete_instance(ctx.tenant_id, instance.id).await,
            Err(e) => Err(e),
        };
        if let Err(e) = released {
            self.mark_container_gone(ctx, instance.id, &e).await;
            return Err(e);
        }

        if let Ok(ty) = InstanceType::lookup(&instance.instance_type) {
            self.quota.release(ctx, &instance_charge(&ty)).await;
        }
        if instance.private_ip.is_some()
            && let Err(e) = self
                .dns
                .deregister_instance(ctx.tenant_id, &instance.name)
                .await
        {
            warn!(instance_id = %instance.id, error = %e, "private DNS deregistration failed");
        }

        info!(instance_id = %instance.id, name = %instance.name, "instance terminated");
        self.notifier
            .emit(activity(ctx, "INSTANCE_TERMINATE", "instance", instance.id))
            .await;
        Ok(())
    }

    /// RUNNING → STOPPED
    pub async fn stop(&self, ctx: &RequestContext, key: &str) -> Result<Instance> {
        ctx.ensure_active()?;
        let mut instance = self.get(ctx, key).await?;
        let container_id = running_container(&instance)?.to_string();
        self.compute
            .stop_container(&container_id)
            .await
            .step("stop container")?;

        instance.status = InstanceStatus::Stopped;
        let instance = self.store.update_instance(&instance).await?;
        info!(instance_id = %instance.id, "instance stopped");
        self.notifier
            .emit(activity(ctx, "INSTANCE_STOP", "instance", instance.id))
            .await;
        Ok(instance)
    }

    /// STOPPED → RUNNING
    pub async fn start(&self, ctx: &RequestContext, key: &str) -> Result<Instance> {
        ctx.ensure_active()?;
        let mut instance = self.get(ctx, key).await?;
        let container_id = match (&instance.status, &instance.container_id) {
            (InstanceStatus::Stopped, Some(id)) => id.clone(),
            _ => {
                return Err(CloudError::conflict(format!(
                    "instance '{}' is {}, not STOPPED",
                    instance.name, instance.status
                )));
            }
        };
        self.compute
            .start_container(&container_id)
            .await
            .step("start container")?;

        instance.status = InstanceStatus::Running;
        let instance = self.store.update_instance(&instance).await?;
        info!(instance_id = %instance.id, "instance started");
        self.notifier
            .emit(activity(ctx, "INSTANCE_START", "instance", instance.id))
            .await;
        Ok(instance)
    }

    /// Container output; available while the container exists
    pub async fn logs(&self, ctx: &RequestContext, key: &str, tail: Option<usize>) -> Result<String> {
        ctx.ensure_active()?;
        let instance = self.get(ctx, key).await?;
        let container_id = instance.container_id.as_deref().ok_or_else(|| {
            CloudError::InstanceNotRunning(format!(
                "instance '{}' is {}",
                instance.name, instance.status
            ))
        })?;
        self.compute
            .get_logs(container_id, tail)
            .await
            .step("read container logs")
    }

    pub async fn stats(&self, ctx: &RequestContext, key: &str) -> Result<ContainerStats> {
        ctx.ensure_active()?;
        let instance = self.get(ctx, key).await?;
        let container_id = running_container(&instance)?;
        self.compute
            .get_container_stats(container_id)
            .await
            .step("read container stats")
    }

    async fn resolve_placement(&self, ctx: &RequestContext, params: &LaunchParams) -> Result<Placement> {
        let subnet = match params.subnet.as_deref().filter(|s| !s.is_empty()) {
            Some(id) => Some(
                self.store
                    .get_subnet(ctx.tenant_id, parse_id("subnet_id", id)?)
                    .await?,
            ),
            None => None,
        };

        let vpc = match (params.vpc.as_deref().filter(|v| !v.is_empty()), &subnet) {
            (Some(key), _) => {
                Some(lookup::vpc(self.store.as_ref(), ctx.tenant_id, key).await?)
            }
            (None, Some(subnet)) => Some(self.store.get_vpc(ctx.tenant_id, subnet.vpc_id).await?),
            (None, None) => None,
        };
        if let (Some(vpc), Some(subnet)) = (&vpc, &subnet)
            && subnet.vpc_id != vpc.id
        {
            return Err(CloudError::CrossVpc(format!(
                "subnet {} does not belong to VPC '{}'",
                subnet.id, vpc.name
            )));
        }

        let mut groups = Vec::with_capacity(params.security_groups.len());
        for key in &params.security_groups {
            let group = self.groups.get(ctx, key).await?;
            match &vpc {
                Some(vpc) if vpc.id == group.vpc_id => groups.push(group),
                Some(vpc) => {
                    return Err(CloudError::CrossVpc(format!(
                        "security group '{}' is not in VPC '{}'",
                        group.name, vpc.name
                    )));
                }
                None => {
                    return Err(CloudError::invalid(
                        "security groups require the instance to be placed in a VPC",
                    ));
                }
            }
        }

        let mut volumes = Vec::with_capacity(params.volumes.len());
        let mut seen = HashSet::new();
        for mount in &params.volumes {
            let volume =
                lookup::volume(self.store.as_ref(), ctx.tenant_id, &mount.volume).await?;
            if !seen.insert(volume.id) {
                return Err(CloudError::invalid(format!(
                    "volume '{}' is listed twice",
                    volume.name
                )));
            }
            if !volume.is_available() {
                return Err(CloudError::conflict(format!(
                    "volume '{}' is {}, not AVAILABLE",
                    volume.name, volume.status
                )));
            }
            let target = mount
                .mount_path
                .clone()
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| volume.default_mount_path());
            volumes.push((volume, target));
        }

        Ok(Placement {
            vpc,
            subnet,
            groups,
            volumes,
        })
    }

    /// Persist `draft` as PENDING, holding the lowest free address of `subnet`
    async fn reserve(&self, mut draft: Instance, subnet: Option<&Subnet>) -> Result<Instance> {
        let Some(subnet) = subnet else {
            self.store.insert_instance(&draft).await?;
            return Ok(draft);
        };

        for attempt in 1..=IP_RESERVE_ATTEMPTS {
            let in_use: HashSet<_> = self.store.used_ips(subnet.id).await?.into_iter().collect();
            let ip = subnet.cidr_block.allocate_host(&in_use).ok_or_else(|| {
                CloudError::conflict(format!("subnet {} has no free addresses", subnet.cidr_block))
            })?;
            draft.private_ip = Some(ip);
            match self.store.insert_instance(&draft).await {
                Ok(()) => {
                    debug!(instance_id = %draft.id, ip = %ip, "address reserved");
                    return Ok(draft);
                }
                Err(e) if e.kind() == ErrorKind::Conflict && attempt < IP_RESERVE_ATTEMPTS => {
                    debug!(ip = %ip, attempt, error = %e, "address taken, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(CloudError::conflict(format!(
            "could not reserve an address in {}",
            subnet.cidr_block
        )))
    }

    fn container_spec(
        &self,
        instance: &Instance,
        ty: &InstanceType,
        placement: &Placement,
        mounts: Vec<Mount>,
        params: &LaunchParams,
    ) -> ContainerSpec {
        let mut spec = ContainerSpec::new(
            format!("{}-{}", instance.name, short(&instance.id)),
            instance.image.clone(),
        )
        .label(LABEL_INSTANCE_ID, instance.id.to_string())
        .label(LABEL_TENANT_ID, instance.tenant_id.to_string());
        spec.ports = instance.ports.clone();
        spec.network_id = placement.vpc.as_ref().map(|v| v.network_id.clone());
        spec.env = params.env.clone();
        spec.mounts = mounts;
        spec.cmd = params.cmd.clone();
        spec.memory_bytes = Some(ty.memory_bytes());
        spec.cpus = Some(ty.vcpus as f64);
        spec
    }

    /// Return every volume bound to `instance` to AVAILABLE
    /// The container was removed but the record could not be: keep the
    /// record as ERROR without backend handles, so a later terminate only
    /// finishes the bookkeeping
    async fn mark_container_gone(&self, ctx: &RequestContext, id: Uuid, cause: &CloudError) {
        let marked = async {
            let mut instance = self.store.get_instance(ctx.tenant_id, id).await?;
            instance.status = InstanceStatus::Error;
            instance.status_reason = Some(format!("terminate incomplete: {}", cause));
            instance.container_id = None;
            instance.veth_host = None;
            self.store.update_instance(&instance).await
        }
        .await;
        if let Err(e) = marked {
            error!(instance_id = %id, error = %e, "failed to record incomplete terminate");
        }
    }

    async fn release_volumes(&self, ctx: &RequestContext, instance: &Instance) -> Result<()> {
        let instance_ref = instance.id.to_string();
        for mut volume in self
            .store
            .list_volumes_for_instance(ctx.tenant_id, instance.id)
            .await?
        {
            if let Err(e) = self
                .storage
                .detach_volume(&volume.backend_path, &instance_ref)
                .await
            {
                warn!(volume_id = %volume.id, error = %e, "backend detach failed; releasing anyway");
            }
            volume.release();
            if let Err(e) = self
                .store
                .transition_volume(&volume, VolumeStatus::InUse)
                .await
            {
                error!(volume_id = %volume.id, error = %e, "failed to release volume");
                return Err(e);
            }
            debug!(volume_id = %volume.id, "volume released");
        }
        Ok(())
    }
}

fn running_container(instance: &Instance) -> Result<&str> {
    match (&instance.status, &instance.container_id) {
        (InstanceStatus::Running, Some(id)) => Ok(id),
        _ => Err(CloudError::InstanceNotRunning(format!(
            "instance '{}' is {}",
            instance.name, instance.status
        ))),
    }
}
