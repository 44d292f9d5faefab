//! Stack orchestrator
//!
//! A stack is created in CREATE_IN_PROGRESS and handed to a background
//! driver. The driver creates resources pass by pass, recording each one as
//! it lands. On the first failure it destroys what it recorded, newest first.
//!
//! ```text
//! CREATE_IN_PROGRESS ─┬─► CREATE_COMPLETE
//!                     ├─► CREATE_FAILED          (template does not parse)
//!                     └─► ROLLBACK_IN_PROGRESS ─┬─► ROLLBACK_COMPLETE
//!                                               └─► ROLLBACK_FAILED
//! ```

use crate::activity;
use crate::instance::{InstanceService, LaunchParams};
use crate::jobs::JobRunner;
use crate::lookup::Key;
use crate::store::Store;
use crate::subnet::SubnetService;
use crate::volume::VolumeService;
use crate::vpc::VpcService;
use chrono::Utc;
use nimbus_backend::Notifier;
use nimbus_core::model::{SnapshotStatus, Stack, StackResource, StackResourceStatus, StackStatus};
use nimbus_core::template::{DEFAULT_VPC_CIDR, TemplateResource, instance_ports, volume_size};
use nimbus_core::{
    CloudError, RequestContext, ResourceType, Result, Template, ValidationReport,
    validate_template,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SNAPSHOT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const SNAPSHOT_WAIT: Duration = Duration::from_secs(15 * 60);

/// Resource services the driver calls into
#[derive(Clone)]
struct Provisioner {
    store: Arc<dyn Store>,
    vpcs: Arc<VpcService>,
    subnets: Arc<SubnetService>,
    volumes: Arc<VolumeService>,
    instances: Arc<InstanceService>,
}

pub struct StackService {
    provisioner: Provisioner,
    jobs: Arc<JobRunner>,
    notifier: Notifier,
}

impl StackService {
    pub fn new(
        store: Arc<dyn Store>,
        vpcs: Arc<VpcService>,
        subnets: Arc<SubnetService>,
        volumes: Arc<VolumeService>,
        instances: Arc<InstanceService>,
        jobs: Arc<JobRunner>,
        notifier: Notifier,
    ) -> Self {
        Self {
            provisioner: Provisioner {
                store,
                vpcs,
                subnets,
                volumes,
                instances,
            },
            jobs,
            notifier,
        }
    }

    fn store(&self) -> &Arc<dyn Store> {
        &self.provisioner.store
    }

    /// Persist the stack and start creating its resources in the background
    pub async fn create(
        &self,
        ctx: &RequestContext,
        name: &str,
        template: &str,
        parameters: HashMap<String, String>,
    ) -> Result<Stack> {
        ctx.ensure_active()?;
        let name = name.trim();
        if name.is_empty() {
            return Err(CloudError::invalid("stack name is required"));
        }
        let stack = Stack::new(ctx.tenant_id, ctx.user_id, name, template, parameters);
        self.store().insert_stack(&stack).await?;

        let driver = self.provisioner.clone();
        let background = ctx.detached();
        let job = stack.clone();
        self.jobs.spawn("stack-create", ctx.identity(), async move {
            driver.create_all(&background, job).await
        });

        info!(stack_id = %stack.id, name = %stack.name, "stack creation started");
        self.notifier
            .emit(activity(ctx, "STACK_CREATE", "stack", stack.id))
            .await;
        Ok(stack)
    }

    pub async fn get(&self, ctx: &RequestContext, key: &str) -> Result<Stack> {
        match Key::parse(key)? {
            Key::Id(id) => self.store().get_stack(ctx.tenant_id, id).await,
            Key::Name(name) => self
                .store()
                .find_stack_by_name(ctx.tenant_id, name)
                .await?
                .ok_or_else(|| CloudError::not_found("stack", name)),
        }
    }

    pub async fn list(&self, ctx: &RequestContext) -> Result<Vec<Stack>> {
        self.store().list_stacks(ctx.tenant_id).await
    }

    /// Tear the stack down in the background. Only the user who created the
    /// stack may delete it.
    pub async fn delete(&self, ctx: &RequestContext, key: &str) -> Result<()> {
        ctx.ensure_active()?;
        let mut stack = self.get(ctx, key).await?;
        if stack.user_id != ctx.user_id {
            return Err(CloudError::Forbidden(format!(
                "stack '{}' belongs to another user",
                stack.name
            )));
        }
        if !stack.status.is_settled() {
            return Err(CloudError::conflict(format!(
                "stack '{}' is {}",
                stack.name, stack.status
            )));
        }

        stack.status = StackStatus::DeleteInProgress;
        stack.status_reason = None;
        self.provisioner.save(&mut stack).await?;

        let driver = self.provisioner.clone();
        let background = ctx.detached();
        let stack_id = stack.id;
        self.jobs.spawn("stack-delete", ctx.identity(), async move {
            driver.delete_all(&background, stack).await
        });

        info!(stack_id = %stack_id, "stack deletion started");
        self.notifier
            .emit(activity(ctx, "STACK_DELETE", "stack", stack_id))
            .await;
        Ok(())
    }

    /// Side-effect free template check
    pub fn validate(&self, template: &str) -> ValidationReport {
        validate_template(template)
    }
}

impl Provisioner {
    async fn save(&self, stack: &mut Stack) -> Result<()> {
        stack.updated_at = Utc::now();
        self.store.update_stack(stack).await
    }

    async fn create_all(&self, ctx: &RequestContext, mut stack: Stack) -> Result<()> {
        let template = match Template::parse(&stack.template) {
            Ok(template) => template,
            Err(e) => {
                warn!(stack_id = %stack.id, error = %e, "template rejected");
                stack.status = StackStatus::CreateFailed;
                stack.status_reason = Some(e.to_string());
                return self.save(&mut stack).await;
            }
        };

        let mut resolved: HashMap<String, Uuid> = HashMap::new();
        for (ty, res) in template.plan() {
            match self.create_one(ctx, ty, res, &resolved).await {
                Ok(physical_id) => {
                    debug!(stack_id = %stack.id, logical_id = %res.logical_id, physical_id = %physical_id, "resource created");
                    resolved.insert(res.logical_id.clone(), physical_id);
                    stack.resources.push(StackResource {
                        logical_id: res.logical_id.clone(),
                        physical_id,
                        resource_type: ty,
                        status: StackResourceStatus::CreateComplete,
                        status_reason: None,
                        created_at: Utc::now(),
                    });
                    self.save(&mut stack).await?;
                }
                Err(e) => {
                    warn!(stack_id = %stack.id, logical_id = %res.logical_id, error = %e, "resource failed, rolling back");
                    stack.status = StackStatus::RollbackInProgress;
                    stack.status_reason = Some(format!("{}: {}", res.logical_id, e));
                    self.save(&mut stack).await?;

                    let failed = self.destroy_all(ctx, &mut stack).await;
                    stack.status = if failed.is_empty() {
                        StackStatus::RollbackComplete
                    } else {
                        StackStatus::RollbackFailed
                    };
                    self.save(&mut stack).await?;
                    info!(stack_id = %stack.id, status = %stack.status, "stack rolled back");
                    return Ok(());
                }
            }
        }

        stack.status = StackStatus::CreateComplete;
        self.save(&mut stack).await?;
        info!(stack_id = %stack.id, resources = stack.resources.len(), "stack created");
        Ok(())
    }

    async fn delete_all(&self, ctx: &RequestContext, mut stack: Stack) -> Result<()> {
        let failed = self.destroy_all(ctx, &mut stack).await;
        if failed.is_empty() {
            self.store.delete_stack(stack.tenant_id, stack.id).await?;
            info!(stack_id = %stack.id, "stack deleted");
            return Ok(());
        }
        stack.status = StackStatus::DeleteFailed;
        stack.status_reason = Some(format!("could not delete {}", failed.join(", ")));
        self.save(&mut stack).await
    }

    /// Destroy every created resource, newest first. Returns the logical ids
    /// that could not be destroyed.
    async fn destroy_all(&self, ctx: &RequestContext, stack: &mut Stack) -> Vec<String> {
        let mut failed = Vec::new();
        for resource in stack.resources.iter_mut().rev() {
            if resource.status == StackResourceStatus::DeleteComplete {
                continue;
            }
            match self
                .destroy_one(ctx, resource.resource_type, resource.physical_id)
                .await
            {
                Ok(()) => {
                    resource.status = StackResourceStatus::DeleteComplete;
                    resource.status_reason = None;
                }
                Err(e) => {
                    warn!(logical_id = %resource.logical_id, error = %e, "failed to destroy stack resource");
                    resource.status = StackResourceStatus::DeleteFailed;
                    resource.status_reason = Some(e.to_string());
                    failed.push(resource.logical_id.clone());
                }
            }
        }
        failed
    }

    async fn create_one(
        &self,
        ctx: &RequestContext,
        ty: ResourceType,
        res: &TemplateResource,
        resolved: &HashMap<String, Uuid>,
    ) -> Result<Uuid> {
        let name = res.name()?;
        match ty {
            ResourceType::Vpc => {
                let cidr = res
                    .literal("CIDRBlock")?
                    .unwrap_or_else(|| DEFAULT_VPC_CIDR.to_string());
                Ok(self.vpcs.create(ctx, &name, &cidr).await?.id)
            }
            ResourceType::Subnet => {
                let vpc = required(res, "VpcID", resolved)?;
                let cidr = required(res, "CIDRBlock", resolved)?;
                let zone = res.literal("AvailabilityZone")?;
                let subnet = self
                    .subnets
                    .create(ctx, &vpc, &name, &cidr, zone.as_deref())
                    .await?;
                Ok(subnet.id)
            }
            ResourceType::Volume => {
                let size = volume_size(res)?;
                Ok(self.volumes.create(ctx, &name, size).await?.id)
            }
            ResourceType::Instance => {
                let params = LaunchParams {
                    image: required(res, "Image", resolved)?,
                    instance_type: res.literal("InstanceType")?,
                    vpc: res.resolve("VpcID", resolved)?,
                    subnet: res.resolve("SubnetID", resolved)?,
                    ports: instance_ports(res)?,
                    ..LaunchParams::new(name, "")
                };
                Ok(self.instances.launch(ctx, &params).await?.id)
            }
            ResourceType::Snapshot => {
                let volume = required(res, "VolumeID", resolved)?;
                let snapshot = self.volumes.create_snapshot(ctx, &volume, &name).await?;
                self.await_snapshot(ctx, snapshot.id).await?;
                Ok(snapshot.id)
            }
        }
    }

    async fn destroy_one(&self, ctx: &RequestContext, ty: ResourceType, id: Uuid) -> Result<()> {
        let id = id.to_string();
        let result = match ty {
            ResourceType::Vpc => self.vpcs.delete(ctx, &id).await,
            ResourceType::Subnet => self.subnets.delete(ctx, &id).await,
            ResourceType::Volume => self.volumes.delete(ctx, &id).await,
            ResourceType::Instance => self.instances.terminate(ctx, &id).await,
            ResourceType::Snapshot => self.volumes.delete_snapshot(ctx, &id).await,
        };
        match result {
            Err(e) if e.is_not_found() => {
                debug!(resource_type = %ty, physical_id = %id, "already gone");
                Ok(())
            }
            other => other,
        }
    }

    /// Block until the snapshot copy settles. A failed copy is cleaned up and
    /// reported as an error.
    async fn await_snapshot(&self, ctx: &RequestContext, id: Uuid) -> Result<()> {
        let deadline = Instant::now() + SNAPSHOT_WAIT;
        loop {
            let snapshot = self.store.get_snapshot(ctx.tenant_id, id).await?;
            match snapshot.status {
                SnapshotStatus::Available => return Ok(()),
                SnapshotStatus::Error => {
                    let reason = snapshot
                        .status_reason
                        .unwrap_or_else(|| "snapshot copy failed".to_string());
                    if let Err(e) = self.volumes.delete_snapshot(ctx, &id.to_string()).await {
                        warn!(snapshot_id = %id, error = %e, "failed to remove failed snapshot");
                    }
                    return Err(CloudError::internal(reason));
                }
                SnapshotStatus::Creating if Instant::now() >= deadline => {
                    return Err(CloudError::internal(format!(
                        "snapshot {} did not finish within {}s",
                        id,
                        SNAPSHOT_WAIT.as_secs()
                    )));
                }
                SnapshotStatus::Creating => tokio::time::sleep(SNAPSHOT_POLL_INTERVAL).await,
            }
        }
    }
}

fn required(res: &TemplateResource, key: &str, resolved: &HashMap<String, Uuid>) -> Result<String> {
    res.resolve(key, resolved)?
        .filter(|v| !v.is_empty())
        .ok_or_else(|| CloudError::invalid(format!("{}.{} is required", res.logical_id, key)))
}
