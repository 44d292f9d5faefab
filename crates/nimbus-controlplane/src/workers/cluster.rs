//! Cluster worker
//!
//! Drains the provision queue, then the delete queue. Provisioning builds, in
//! order, a container network, the control-plane node, the worker nodes and
//! the sealed credentials. Any failure unwinds what was built and leaves the
//! cluster FAILED with a reason.

use crate::cluster::{API_SERVER_PORT, keys, node_image, render_kubeconfig};
use crate::instance::LABEL_TENANT_ID;
use crate::rollback::Rollback;
use crate::secret::SecretService;
use crate::short;
use crate::store::Store;
use chrono::Utc;
use nimbus_backend::{BackendError, BackendResultExt, ComputeBackend, ContainerSpec, TaskQueue};
use nimbus_core::model::{
    CLUSTER_DELETE_QUEUE, CLUSTER_PROVISION_QUEUE, Cluster, ClusterJob, ClusterStatus,
    PortMapping, TransportProtocol,
};
use nimbus_core::{CloudError, Result};
use rand::RngCore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const LABEL_CLUSTER_ID: &str = "nimbus.cluster-id";

pub struct ClusterWorker {
    store: Arc<dyn Store>,
    compute: Arc<dyn ComputeBackend>,
    queue: Arc<dyn TaskQueue>,
    secrets: Arc<SecretService>,
    interval: Duration,
}

impl ClusterWorker {
    pub fn new(
        store: Arc<dyn Store>,
        compute: Arc<dyn ComputeBackend>,
        queue: Arc<dyn TaskQueue>,
        secrets: Arc<SecretService>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            compute,
            queue,
            secrets,
            interval,
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let period = self.interval;
        super::run_periodic("cluster", period, shutdown, || {
            let worker = self.clone();
            async move {
                let handled = worker.tick().await;
                if handled > 0 {
                    debug!(handled, "cluster jobs processed");
                }
            }
        })
        .await;
    }

    /// Drain both queues. Returns the number of jobs handled.
    pub async fn tick(&self) -> usize {
        let mut handled = 0;
        while let Some(job) = self.next_job(CLUSTER_PROVISION_QUEUE).await {
            self.provision(job).await;
            handled += 1;
        }
        while let Some(job) = self.next_job(CLUSTER_DELETE_QUEUE).await {
            self.teardown(job).await;
            handled += 1;
        }
        handled
    }

    async fn next_job(&self, queue: &str) -> Option<ClusterJob> {
        loop {
            let payload = match self.queue.dequeue(queue).await {
                Ok(payload) => payload?,
                Err(e) => {
                    warn!(queue, error = %e, "dequeue failed");
                    return None;
                }
            };
            match serde_json::from_value(payload) {
                Ok(job) => return Some(job),
                Err(e) => warn!(queue, error = %e, "dropping malformed cluster job"),
            }
        }
    }

    async fn provision(&self, job: ClusterJob) {
        let mut cluster = match self.store.get_cluster(job.identity.tenant_id, job.cluster_id).await {
            Ok(cluster) => cluster,
            Err(e) => {
                warn!(cluster_id = %job.cluster_id, error = %e, "cluster gone before provisioning");
                return;
            }
        };
        if cluster.status != ClusterStatus::Pending {
            debug!(cluster_id = %cluster.id, status = %cluster.status, "skipping provision");
            return;
        }

        cluster.status = ClusterStatus::Provisioning;
        if let Err(e) = self.save(&mut cluster).await {
            warn!(cluster_id = %cluster.id, error = %e, "failed to mark cluster provisioning");
            return;
        }

        match self.build(&mut cluster).await {
            Ok(()) => info!(
                cluster_id = %cluster.id,
                api_port = ?cluster.api_port,
                workers = cluster.worker_ids.len(),
                "cluster running"
            ),
            Err(e) => {
                error!(cluster_id = %cluster.id, error = %e, "cluster provisioning failed");
                cluster.status = ClusterStatus::Failed;
                cluster.status_reason = Some(e.to_string());
                cluster.network_id = None;
                cluster.control_plane_id = None;
                cluster.worker_ids.clear();
                cluster.api_port = None;
                if let Err(e) = self.save(&mut cluster).await {
                    error!(cluster_id = %cluster.id, error = %e, "failed to record cluster failure");
                }
            }
        }
    }

    async fn build(&self, cluster: &mut Cluster) -> Result<()> {
        let tag = short(&cluster.id);
        let mut rollback = Rollback::new();

        let network = self
            .compute
            .create_network(&format!("k8s-{}-{}", cluster.name, tag))
            .await
            .step("create cluster network");
        let network_id = rollback.guard(network).await?;
        self.push_remove_network(&mut rollback, &network_id);

        let token = random_token();
        let key_pair = keys::generate(&format!("nimbus@{}", cluster.name));
        let control_plane_name = format!("k8s-{}-{}-cp", cluster.name, tag);

        let control_plane = self
            .node_spec(cluster, &control_plane_name, &network_id, &key_pair.public_key)
            .port(PortMapping::tcp(0, API_SERVER_PORT))
            .env("K3S_TOKEN", token.as_str());
        let control_plane = ContainerSpec {
            cmd: vec![
                "server".to_string(),
                "--tls-san".to_string(),
                "127.0.0.1".to_string(),
            ],
            ..control_plane
        };
        let created = self
            .compute
            .create_container(&control_plane)
            .await
            .step("create control plane");
        let control_plane_id = rollback.guard(created).await?;
        self.push_remove_container(&mut rollback, &control_plane_id);

        let published = self
            .compute
            .get_container_port(&control_plane_id, API_SERVER_PORT, TransportProtocol::Tcp)
            .await
            .step("resolve API server port")
            .and_then(|port| {
                port.ok_or_else(|| CloudError::internal("API server port was not published"))
            });
        let api_port = rollback.guard(published).await?;

        let mut worker_ids = Vec::with_capacity(cluster.worker_count as usize);
        for index in 0..cluster.worker_count {
            let name = format!("k8s-{}-{}-w{}", cluster.name, tag, index);
            let spec = ContainerSpec {
                cmd: vec!["agent".to_string()],
                ..self.node_spec(cluster, &name, &network_id, &key_pair.public_key)
                    .env("K3S_URL", format!("https://{}:{}", control_plane_name, API_SERVER_PORT))
                    .env("K3S_TOKEN", token.as_str())
            };
            let created = self
                .compute
                .create_container(&spec)
                .await
                .step("create worker node");
            let worker_id = rollback.guard(created).await?;
            self.push_remove_container(&mut rollback, &worker_id);
            worker_ids.push(worker_id);
        }

        let kubeconfig = render_kubeconfig(&cluster.name, api_port, &token);
        let sealed = self
            .secrets
            .encrypt(cluster.user_id, &kubeconfig)
            .and_then(|kubeconfig| {
                let key = self.secrets.encrypt(cluster.user_id, &key_pair.private_key)?;
                Ok((kubeconfig, key))
            });
        let (kubeconfig, ssh_private_key) = rollback.guard(sealed).await?;

        cluster.status = ClusterStatus::Running;
        cluster.status_reason = None;
        cluster.network_id = Some(network_id);
        cluster.control_plane_id = Some(control_plane_id);
        cluster.worker_ids = worker_ids;
        cluster.api_port = Some(api_port);
        cluster.kubeconfig = Some(kubeconfig);
        cluster.ssh_private_key = Some(ssh_private_key);
        let saved = self.save(cluster).await;
        rollback.guard(saved).await?;
        rollback.disarm();
        Ok(())
    }

    async fn teardown(&self, job: ClusterJob) {
        let mut cluster = match self.store.get_cluster(job.identity.tenant_id, job.cluster_id).await {
            Ok(cluster) => cluster,
            Err(e) => {
                debug!(cluster_id = %job.cluster_id, error = %e, "cluster already gone");
                return;
            }
        };
        if cluster.status != ClusterStatus::Deleting {
            debug!(cluster_id = %cluster.id, status = %cluster.status, "skipping teardown");
            return;
        }

        let mut failures = Vec::new();
        let containers = cluster.worker_ids.iter().chain(cluster.control_plane_id.iter());
        for container_id in containers {
            match self.compute.remove_container(container_id).await {
                Ok(()) | Err(BackendError::NotFound(_)) => {}
                Err(e) => failures.push(format!("container {}: {}", container_id, e)),
            }
        }
        if failures.is_empty()
            && let Some(network_id) = &cluster.network_id
        {
            match self.compute.remove_network(network_id).await {
                Ok(()) | Err(BackendError::NotFound(_)) => {}
                Err(e) => failures.push(format!("network {}: {}", network_id, e)),
            }
        }

        if failures.is_empty() {
            match self.store.delete_cluster(cluster.tenant_id, cluster.id).await {
                Ok(()) => info!(cluster_id = %cluster.id, "cluster deleted"),
                Err(e) => error!(cluster_id = %cluster.id, error = %e, "failed to delete cluster record"),
            }
            return;
        }

        warn!(cluster_id = %cluster.id, failures = ?failures, "cluster teardown incomplete");
        cluster.status = ClusterStatus::Failed;
        cluster.status_reason = Some(format!("teardown failed: {}", failures.join("; ")));
        if let Err(e) = self.save(&mut cluster).await {
            error!(cluster_id = %cluster.id, error = %e, "failed to record teardown failure");
        }
    }

    fn node_spec(&self, cluster: &Cluster, name: &str, network_id: &str, public_key: &str) -> ContainerSpec {
        let mut spec = ContainerSpec::new(name, node_image(&cluster.version))
            .env("SSH_AUTHORIZED_KEY", public_key)
            .label(LABEL_CLUSTER_ID, cluster.id.to_string())
            .label(LABEL_TENANT_ID, cluster.tenant_id.to_string());
        spec.network_id = Some(network_id.to_string());
        spec
    }

    fn push_remove_container(&self, rollback: &mut Rollback, container_id: &str) {
        let compute = self.compute.clone();
        let id = container_id.to_string();
        rollback.push("remove cluster node", move || async move {
            compute.remove_container(&id).await.step("remove cluster node")
        });
    }

    fn push_remove_network(&self, rollback: &mut Rollback, network_id: &str) {
        let compute = self.compute.clone();
        let id = network_id.to_string();
        rollback.push("remove cluster network", move || async move {
            compute.remove_network(&id).await.step("remove cluster network")
        });
    }

    async fn save(&self, cluster: &mut Cluster) -> Result<()> {
        cluster.updated_at = Utc::now();
        self.store.update_cluster(cluster).await
    }
}

fn random_token() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
