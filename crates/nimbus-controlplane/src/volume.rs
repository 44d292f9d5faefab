//! Volumes and snapshots
//!
//! Snapshots are copied in the background: `create_snapshot` returns a
//! CREATING record at once and a job moves it to AVAILABLE or ERROR.

use crate::activity;
use crate::jobs::JobRunner;
use crate::lookup::{self, Key};
use crate::quota::QuotaService;
use crate::rollback::Rollback;
use crate::store::Store;
use chrono::Utc;
use nimbus_backend::{BackendResultExt, Notifier, StorageBackend};
use nimbus_core::model::{QuotaResource, Snapshot, SnapshotStatus, Volume, VolumeStatus};
use nimbus_core::{CloudError, RequestContext, Result};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

fn storage_charge(size_gb: u32) -> [(QuotaResource, u64); 1] {
    [(QuotaResource::StorageGb, u64::from(size_gb))]
}

pub struct VolumeService {
    store: Arc<dyn Store>,
    storage: Arc<dyn StorageBackend>,
    quota: Arc<QuotaService>,
    jobs: Arc<JobRunner>,
    notifier: Notifier,
}

impl VolumeService {
    pub fn new(
        store: Arc<dyn Store>,
        storage: Arc<dyn StorageBackend>,
        quota: Arc<QuotaService>,
        jobs: Arc<JobRunner>,
        notifier: Notifier,
    ) -> Self {
        Self {
            store,
            storage,
            quota,
            jobs,
            notifier,
        }
    }

    pub async fn create(&self, ctx: &RequestContext, name: &str, size_gb: u32) -> Result<Volume> {
        ctx.ensure_active()?;
        let name = valid_name("volume", name)?;
        if size_gb < 1 {
            return Err(CloudError::invalid("volume size must be at least 1 GB"));
        }
        if self.store.find_volume_by_name(ctx.tenant_id, name).await?.is_some() {
            return Err(CloudError::conflict(format!("volume '{}' already exists", name)));
        }

        let mut rollback = self.charge(ctx, size_gb).await?;
        let path = rollback
            .guard(
                self.storage
                    .create_volume(name, size_gb)
                    .await
                    .step("create backend volume"),
            )
            .await?;
        self.push_delete_volume(&mut rollback, &path);

        let volume = Volume::new(ctx.tenant_id, ctx.user_id, name, size_gb, path);
        rollback.guard(self.store.insert_volume(&volume).await).await?;
        rollback.disarm();

        info!(volume_id = %volume.id, name = %volume.name, size_gb, "volume created");
        self.notifier
            .emit(
                activity(ctx, "VOLUME_CREATE", "volume", volume.id)
                    .with_meta("size_gb", size_gb.into()),
            )
            .await;
        Ok(volume)
    }

    pub async fn get(&self, ctx: &RequestContext, key: &str) -> Result<Volume> {
        lookup::volume(self.store.as_ref(), ctx.tenant_id, key).await
    }

    pub async fn list(&self, ctx: &RequestContext) -> Result<Vec<Volume>> {
        self.store.list_volumes(ctx.tenant_id).await
    }

    /// AVAILABLE → IN_USE for an existing instance
    pub async fn attach(
        &self,
        ctx: &RequestContext,
        volume: &str,
        instance: &str,
        mount_path: Option<&str>,
    ) -> Result<Volume> {
        ctx.ensure_active()?;
        let mut volume = self.get(ctx, volume).await?;
        if !volume.is_available() {
            return Err(CloudError::conflict(format!(
                "volume '{}' is {}, not AVAILABLE",
                volume.name, volume.status
            )));
        }
        let instance =
            lookup::instance(self.store.as_ref(), ctx.tenant_id, instance).await?;

        let instance_ref = instance.id.to_string();
        self.storage
            .attach_volume(&volume.backend_path, &instance_ref)
            .await
            .step("attach backend volume")?;

        let mount_path = mount_path
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| volume.default_mount_path());
        volume.attach_to(instance.id, mount_path);
        if let Err(e) = self
            .store
            .transition_volume(&volume, VolumeStatus::Available)
            .await
        {
            if let Err(undo) = self
                .storage
                .detach_volume(&volume.backend_path, &instance_ref)
                .await
            {
                warn!(volume_id = %volume.id, error = %undo, "failed to undo backend attach");
            }
            return Err(e);
        }

        info!(volume_id = %volume.id, instance_id = %instance.id, mount = %volume.mount_path, "volume attached");
        self.notifier
            .emit(
                activity(ctx, "VOLUME_ATTACH", "volume", volume.id)
                    .with_meta("instance_id", instance.id.to_string().into()),
            )
            .await;
        Ok(volume)
    }

    /// IN_USE → AVAILABLE
    pub async fn detach(&self, ctx: &RequestContext, volume: &str) -> Result<Volume> {
        ctx.ensure_active()?;
        let mut volume = self.get(ctx, volume).await?;
        let Some(instance_id) = volume.instance_id else {
            return Err(CloudError::conflict(format!(
                "volume '{}' is not attached",
                volume.name
            )));
        };

        self.storage
            .detach_volume(&volume.backend_path, &instance_id.to_string())
            .await
            .step("detach backend volume")?;
        volume.release();
        self.store
            .transition_volume(&volume, VolumeStatus::InUse)
            .await?;

        info!(volume_id = %volume.id, instance_id = %instance_id, "volume detached");
        self.notifier
            .emit(activity(ctx, "VOLUME_DETACH", "volume", volume.id))
            .await;
        Ok(volume)
    }

    /// Refused while IN_USE
    pub async fn delete(&self, ctx: &RequestContext, key: &str) -> Result<()> {
        ctx.ensure_active()?;
        let volume = self.get(ctx, key).await?;
        if volume.status == VolumeStatus::InUse {
            return Err(CloudError::conflict(format!(
                "volume '{}' is in use by instance {}",
                volume.name,
                volume
                    .instance_id
                    .map(|id| id.to_string())
                    .unwrap_or_default()
            )));
        }

        self.storage
            .delete_volume(&volume.backend_path)
            .await
            .step("delete backend volume")?;
        self.store.delete_volume(ctx.tenant_id, volume.id).await?;
        self.quota.release(ctx, &storage_charge(volume.size_gb)).await;

        info!(volume_id = %volume.id, "volume deleted");
        self.notifier
            .emit(activity(ctx, "VOLUME_DELETE", "volume", volume.id))
            .await;
        Ok(())
    }

    /// Record a CREATING snapshot and copy the volume in the background
    pub async fn create_snapshot(&self, ctx: &RequestContext, volume: &str, name: &str) -> Result<Snapshot> {
        ctx.ensure_active()?;
        let name = valid_name("snapshot", name)?;
        let volume = self.get(ctx, volume).await?;
        if volume.status == VolumeStatus::Error {
            return Err(CloudError::conflict(format!(
                "volume '{}' is in ERROR",
                volume.name
            )));
        }

        let now = Utc::now();
        let snapshot = Snapshot {
            id: Uuid::new_v4(),
            tenant_id: ctx.tenant_id,
            user_id: ctx.user_id,
            volume_id: volume.id,
            name: name.to_string(),
            size_gb: volume.size_gb,
            backend_path: None,
            status: SnapshotStatus::Creating,
            status_reason: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_snapshot(&snapshot).await?;

        let store = self.store.clone();
        let storage = self.storage.clone();
        let job = snapshot.clone();
        let source = volume.backend_path.clone();
        self.jobs.spawn("snapshot", ctx.identity(), async move {
            copy_snapshot(store, storage, job, source).await
        });

        info!(snapshot_id = %snapshot.id, volume_id = %volume.id, "snapshot started");
        self.notifier
            .emit(
                activity(ctx, "SNAPSHOT_CREATE", "snapshot", snapshot.id)
                    .with_meta("volume_id", volume.id.to_string().into()),
            )
            .await;
        Ok(snapshot)
    }

    pub async fn get_snapshot(&self, ctx: &RequestContext, key: &str) -> Result<Snapshot> {
        match Key::parse(key)? {
            Key::Id(id) => self.store.get_snapshot(ctx.tenant_id, id).await,
            Key::Name(name) => self
                .store
                .list_snapshots(ctx.tenant_id, None)
                .await?
                .into_iter()
                .find(|s| s.name == name)
                .ok_or_else(|| CloudError::not_found("snapshot", name)),
        }
    }

    pub async fn list_snapshots(&self, ctx: &RequestContext, volume: Option<&str>) -> Result<Vec<Snapshot>> {
        let volume_id = match volume {
            Some(key) => Some(self.get(ctx, key).await?.id),
            None => None,
        };
        self.store.list_snapshots(ctx.tenant_id, volume_id).await
    }

    /// Refused while the copy is still running
    pub async fn delete_snapshot(&self, ctx: &RequestContext, key: &str) -> Result<()> {
        ctx.ensure_active()?;
        let snapshot = self.get_snapshot(ctx, key).await?;
        if snapshot.status == SnapshotStatus::Creating {
            return Err(CloudError::conflict(format!(
                "snapshot '{}' is still being created",
                snapshot.name
            )));
        }
        if let Some(path) = &snapshot.backend_path {
            self.storage
                .delete_snapshot(path)
                .await
                .step("delete backend snapshot")?;
        }
        self.store.delete_snapshot(ctx.tenant_id, snapshot.id).await?;

        info!(snapshot_id = %snapshot.id, "snapshot deleted");
        self.notifier
            .emit(activity(ctx, "SNAPSHOT_DELETE", "snapshot", snapshot.id))
            .await;
        Ok(())
    }

    /// New volume named `new_name` holding the snapshot's data.
    /// The new backend volume is deleted again if the restore fails.
    pub async fn restore_snapshot(&self, ctx: &RequestContext, snapshot: &str, new_name: &str) -> Result<Volume> {
        ctx.ensure_active()?;
        let new_name = valid_name("volume", new_name)?;
        let snapshot = self.get_snapshot(ctx, snapshot).await?;
        let snapshot_path = match (&snapshot.status, &snapshot.backend_path) {
            (SnapshotStatus::Available, Some(path)) => path.clone(),
            _ => {
                return Err(CloudError::conflict(format!(
                    "snapshot '{}' is {}, not AVAILABLE",
                    snapshot.name, snapshot.status
                )));
            }
        };
        if self.store.find_volume_by_name(ctx.tenant_id, new_name).await?.is_some() {
            return Err(CloudError::conflict(format!("volume '{}' already exists", new_name)));
        }

        let mut rollback = self.charge(ctx, snapshot.size_gb).await?;
        let path = rollback
            .guard(
                self.storage
                    .create_volume(new_name, snapshot.size_gb)
                    .await
                    .step("create backend volume"),
            )
            .await?;
        self.push_delete_volume(&mut rollback, &path);

        rollback
            .guard(
                self.storage
                    .restore_snapshot(&path, &snapshot_path)
                    .await
                    .step("restore snapshot"),
            )
            .await?;

        let volume = Volume::new(ctx.tenant_id, ctx.user_id, new_name, snapshot.size_gb, path);
        rollback.guard(self.store.insert_volume(&volume).await).await?;
        rollback.disarm();

        info!(volume_id = %volume.id, snapshot_id = %snapshot.id, "snapshot restored");
        self.notifier
            .emit(
                activity(ctx, "SNAPSHOT_RESTORE", "volume", volume.id)
                    .with_meta("snapshot_id", snapshot.id.to_string().into()),
            )
            .await;
        Ok(volume)
    }

    async fn charge(&self, ctx: &RequestContext, size_gb: u32) -> Result<Rollback> {
        self.quota.reserve(ctx, &storage_charge(size_gb)).await?;
        let mut rollback = Rollback::new();
        let quota = self.quota.clone();
        let cleanup_ctx = ctx.detached();
        rollback.push("release storage quota", move || async move {
            quota.release(&cleanup_ctx, &storage_charge(size_gb)).await;
            Ok(())
        });
        Ok(rollback)
    }

    fn push_delete_volume(&self, rollback: &mut Rollback, path: &str) {
        let storage = self.storage.clone();
        let path = path.to_string();
        rollback.push("delete backend volume", move || async move {
            storage.delete_volume(&path).await.step("delete backend volume")
        });
    }
}

async fn copy_snapshot(
    store: Arc<dyn Store>,
    storage: Arc<dyn StorageBackend>,
    mut snapshot: Snapshot,
    source: String,
) -> Result<()> {
    match storage.create_snapshot(&source, &snapshot.name).await {
        Ok(path) => {
            snapshot.backend_path = Some(path);
            snapshot.status = SnapshotStatus::Available;
            info!(snapshot_id = %snapshot.id, "snapshot available");
        }
        Err(e) => {
            error!(snapshot_id = %snapshot.id, error = %e, "snapshot copy failed");
            snapshot.status = SnapshotStatus::Error;
            snapshot.status_reason = Some(e.to_string());
        }
    }
    snapshot.updated_at = Utc::now();
    store.update_snapshot(&snapshot).await
}

fn valid_name<'a>(kind: &str, name: &'a str) -> Result<&'a str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(CloudError::invalid(format!("{} name is required", kind)));
    }
    Ok(name)
}
