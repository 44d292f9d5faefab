//! Managed Kubernetes clusters
//!
//! The service records intent and enqueues a [`ClusterJob`]. The cluster
//! worker does the provisioning and teardown; see `workers::cluster`.

pub mod keys;

use crate::activity;
use crate::lookup::Key;
use crate::secret::SecretService;
use crate::store::Store;
use chrono::Utc;
use nimbus_backend::{Notifier, TaskQueue};
use nimbus_core::model::{
    CLUSTER_DELETE_QUEUE, CLUSTER_PROVISION_QUEUE, Cluster, ClusterJob, ClusterStatus,
};
use nimbus_core::{CloudError, RequestContext, Result};
use std::sync::Arc;
use tracing::{error, info};

pub const DEFAULT_KUBERNETES_VERSION: &str = "1.29.4";
pub const MAX_WORKERS: u32 = 10;
/// Port the API server listens on inside the control-plane container
pub const API_SERVER_PORT: u16 = 6443;

/// Node image for a Kubernetes version
pub fn node_image(version: &str) -> String {
    format!("rancher/k3s:v{}-k3s1", version)
}

/// Admin kubeconfig for a cluster whose API server is published on `api_port`
pub fn render_kubeconfig(cluster_name: &str, api_port: u16, token: &str) -> String {
    format!(
        r#"apiVersion: v1
kind: Config
clusters:
- name: {name}
  cluster:
    server: https://127.0.0.1:{port}
    insecure-skip-tls-verify: true
contexts:
- name: {name}
  context:
    cluster: {name}
    user: {name}-admin
current-context: {name}
users:
- name: {name}-admin
  user:
    token: {token}
"#,
        name = cluster_name,
        port = api_port,
        token = token
    )
}

fn valid_cluster_name(name: &str) -> Result<&str> {
    let name = name.trim();
    let ok = !name.is_empty()
        && name.len() <= 40
        && name.starts_with(|c: char| c.is_ascii_lowercase())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.ends_with('-');
    if !ok {
        return Err(CloudError::invalid(format!(
            "cluster name '{}' must be 1-40 lowercase letters, digits or '-', starting with a letter",
            name
        )));
    }
    Ok(name)
}

pub struct ClusterService {
    store: Arc<dyn Store>,
    queue: Arc<dyn TaskQueue>,
    secrets: Arc<SecretService>,
    notifier: Notifier,
}

impl ClusterService {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn TaskQueue>,
        secrets: Arc<SecretService>,
        notifier: Notifier,
    ) -> Self {
        Self {
            store,
            queue,
            secrets,
            notifier,
        }
    }

    /// Record a PENDING cluster and queue it for provisioning
    pub async fn create(
        &self,
        ctx: &RequestContext,
        name: &str,
        version: Option<&str>,
        worker_count: u32,
    ) -> Result<Cluster> {
        ctx.ensure_active()?;
        let name = valid_cluster_name(name)?;
        if worker_count > MAX_WORKERS {
            return Err(CloudError::invalid(format!(
                "a cluster can have at most {} workers",
                MAX_WORKERS
            )));
        }
        let version = version
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_KUBERNETES_VERSION);
        if !version.split('.').all(|part| part.parse::<u32>().is_ok()) {
            return Err(CloudError::invalid(format!(
                "'{}' is not a Kubernetes version",
                version
            )));
        }

        let mut cluster = Cluster::new(ctx.tenant_id, ctx.user_id, name, version, worker_count);
        self.store.insert_cluster(&cluster).await?;
        if let Err(e) = self.enqueue(ctx, CLUSTER_PROVISION_QUEUE, &cluster).await {
            error!(cluster_id = %cluster.id, error = %e, "failed to queue cluster provisioning");
            cluster.status = ClusterStatus::Failed;
            cluster.status_reason = Some(format!("could not queue provisioning: {}", e));
            cluster.updated_at = Utc::now();
            self.store.update_cluster(&cluster).await?;
        }

        info!(cluster_id = %cluster.id, name = %cluster.name, version = %cluster.version, workers = worker_count, "cluster requested");
        self.notifier
            .emit(
                activity(ctx, "CLUSTER_CREATE", "cluster", cluster.id)
                    .with_meta("version", cluster.version.clone().into())
                    .with_meta("worker_count", worker_count.into()),
            )
            .await;
        Ok(cluster)
    }

    pub async fn get(&self, ctx: &RequestContext, key: &str) -> Result<Cluster> {
        match Key::parse(key)? {
            Key::Id(id) => self.store.get_cluster(ctx.tenant_id, id).await,
            Key::Name(name) => self
                .store
                .list_clusters(ctx.tenant_id)
                .await?
                .into_iter()
                .find(|c| c.name == name)
                .ok_or_else(|| CloudError::not_found("cluster", name)),
        }
    }

    pub async fn list(&self, ctx: &RequestContext) -> Result<Vec<Cluster>> {
        self.store.list_clusters(ctx.tenant_id).await
    }

    /// Mark DELETING and queue the teardown
    pub async fn delete(&self, ctx: &RequestContext, key: &str) -> Result<()> {
        ctx.ensure_active()?;
        let mut cluster = self.get(ctx, key).await?;
        if matches!(
            cluster.status,
            ClusterStatus::Provisioning | ClusterStatus::Deleting
        ) {
            return Err(CloudError::conflict(format!(
                "cluster '{}' is {}",
                cluster.name, cluster.status
            )));
        }
        cluster.status = ClusterStatus::Deleting;
        cluster.status_reason = None;
        cluster.updated_at = Utc::now();
        self.store.update_cluster(&cluster).await?;
        self.enqueue(ctx, CLUSTER_DELETE_QUEUE, &cluster).await?;

        info!(cluster_id = %cluster.id, "cluster deletion queued");
        self.notifier
            .emit(activity(ctx, "CLUSTER_DELETE", "cluster", cluster.id))
            .await;
        Ok(())
    }

    /// Decrypted admin kubeconfig; owner only
    pub async fn kubeconfig(&self, ctx: &RequestContext, key: &str) -> Result<String> {
        let cluster = self.owned(ctx, key).await?;
        let sealed = cluster.kubeconfig.as_deref().ok_or_else(|| {
            CloudError::conflict(format!(
                "cluster '{}' is {} and has no kubeconfig",
                cluster.name, cluster.status
            ))
        })?;
        self.secrets.decrypt(cluster.user_id, sealed)
    }

    /// Decrypted node SSH key; owner only
    pub async fn ssh_private_key(&self, ctx: &RequestContext, key: &str) -> Result<String> {
        let cluster = self.owned(ctx, key).await?;
        let sealed = cluster.ssh_private_key.as_deref().ok_or_else(|| {
            CloudError::conflict(format!(
                "cluster '{}' is {} and has no SSH key",
                cluster.name, cluster.status
            ))
        })?;
        self.secrets.decrypt(cluster.user_id, sealed)
    }

    async fn owned(&self, ctx: &RequestContext, key: &str) -> Result<Cluster> {
        ctx.ensure_active()?;
        let cluster = self.get(ctx, key).await?;
        if cluster.user_id != ctx.user_id {
            return Err(CloudError::Forbidden(format!(
                "cluster '{}' belongs to another user",
                cluster.name
            )));
        }
        Ok(cluster)
    }

    async fn enqueue(&self, ctx: &RequestContext, queue: &str, cluster: &Cluster) -> Result<()> {
        let job = ClusterJob {
            cluster_id: cluster.id,
            identity: ctx.identity(),
        };
        let payload = serde_json::to_value(&job)
            .map_err(|e| CloudError::internal_from("encode cluster job", e))?;
        self.queue
            .enqueue(queue, payload)
            .await
            .map_err(|e| CloudError::internal_from("enqueue cluster job", e))
    }
}
