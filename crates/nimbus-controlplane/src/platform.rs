//! Service wiring
//!
//! [`ControlPlane`] builds every service over one set of backends, sharing the
//! store, quota accounting, job runner and notifier between them.

use crate::cluster::ClusterService;
use crate::function::FunctionService;
use crate::instance::InstanceService;
use crate::jobs::JobRunner;
use crate::load_balancer::LoadBalancerService;
use crate::managed::ManagedServiceLauncher;
use crate::peering::PeeringService;
use crate::quota::QuotaService;
use crate::secret::{SecretCipher, SecretService};
use crate::security_group::SecurityGroupService;
use crate::stack::StackService;
use crate::store::Store;
use crate::subnet::SubnetService;
use crate::volume::VolumeService;
use crate::vpc::VpcService;
use crate::workers::{ClusterWorker, LbWorker, LbWorkerSettings, TcpProbe};
use nimbus_backend::{
    ComputeBackend, DnsRegistrar, NetworkBackend, Notifier, ProxyAdapter, StorageBackend,
    TaskQueue,
};
use nimbus_core::model::QuotaCounters;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Drivers and sinks the control plane runs on
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn Store>,
    pub compute: Arc<dyn ComputeBackend>,
    pub network: Arc<dyn NetworkBackend>,
    pub storage: Arc<dyn StorageBackend>,
    pub proxy: Arc<dyn ProxyAdapter>,
    pub dns: Arc<dyn DnsRegistrar>,
    pub queue: Arc<dyn TaskQueue>,
    pub notifier: Notifier,
}

#[derive(Clone)]
pub struct PlatformSettings {
    pub quota_defaults: QuotaCounters,
    pub cipher: SecretCipher,
    pub lb: LbWorkerSettings,
    pub health_timeout: Duration,
    pub cluster_interval: Duration,
}

impl Default for PlatformSettings {
    fn default() -> Self {
        Self {
            quota_defaults: QuotaCounters::default_limits(),
            cipher: SecretCipher::ephemeral(),
            lb: LbWorkerSettings::default(),
            health_timeout: Duration::from_secs(2),
            cluster_interval: Duration::from_secs(5),
        }
    }
}

pub struct ControlPlane {
    pub quota: Arc<QuotaService>,
    pub vpcs: Arc<VpcService>,
    pub subnets: Arc<SubnetService>,
    pub security_groups: Arc<SecurityGroupService>,
    pub peerings: Arc<PeeringService>,
    pub instances: Arc<InstanceService>,
    pub volumes: Arc<VolumeService>,
    pub stacks: Arc<StackService>,
    pub load_balancers: Arc<LoadBalancerService>,
    pub secrets: Arc<SecretService>,
    pub clusters: Arc<ClusterService>,
    pub functions: Arc<FunctionService>,
    pub managed: Arc<ManagedServiceLauncher>,
    pub lb_worker: Arc<LbWorker>,
    pub cluster_worker: Arc<ClusterWorker>,
    pub jobs: Arc<JobRunner>,
}

impl ControlPlane {
    pub fn new(backends: Backends, settings: PlatformSettings) -> Self {
        let Backends {
            store,
            compute,
            network,
            storage,
            proxy,
            dns,
            queue,
            notifier,
        } = backends;
        let jobs = Arc::new(JobRunner::new());

        let quota = Arc::new(QuotaService::new(store.clone(), settings.quota_defaults));
        let vpcs = Arc::new(VpcService::new(
            store.clone(),
            network.clone(),
            quota.clone(),
            notifier.clone(),
        ));
        let subnets = Arc::new(SubnetService::new(store.clone(), vpcs.clone(), notifier.clone()));
        let security_groups = Arc::new(SecurityGroupService::new(
            store.clone(),
            network.clone(),
            notifier.clone(),
        ));
        let peerings = Arc::new(PeeringService::new(
            store.clone(),
            network.clone(),
            vpcs.clone(),
            notifier.clone(),
        ));
        let volumes = Arc::new(VolumeService::new(
            store.clone(),
            storage.clone(),
            quota.clone(),
            jobs.clone(),
            notifier.clone(),
        ));
        let instances = Arc::new(InstanceService::new(
            store.clone(),
            compute.clone(),
            network,
            storage,
            dns,
            quota.clone(),
            security_groups.clone(),
            notifier.clone(),
        ));
        let stacks = Arc::new(StackService::new(
            store.clone(),
            vpcs.clone(),
            subnets.clone(),
            volumes.clone(),
            instances.clone(),
            jobs.clone(),
            notifier.clone(),
        ));
        let load_balancers = Arc::new(LoadBalancerService::new(store.clone(), notifier.clone()));
        let secrets = Arc::new(SecretService::new(
            store.clone(),
            settings.cipher,
            notifier.clone(),
        ));
        let clusters = Arc::new(ClusterService::new(
            store.clone(),
            queue.clone(),
            secrets.clone(),
            notifier.clone(),
        ));
        let functions = Arc::new(FunctionService::new(
            store.clone(),
            compute.clone(),
            notifier.clone(),
        ));
        let managed = Arc::new(ManagedServiceLauncher::new(compute.clone(), notifier));

        let lb_worker = Arc::new(LbWorker::new(
            store.clone(),
            compute.clone(),
            proxy,
            Arc::new(TcpProbe {
                timeout: settings.health_timeout,
            }),
            settings.lb,
        ));
        let cluster_worker = Arc::new(ClusterWorker::new(
            store,
            compute,
            queue,
            secrets.clone(),
            settings.cluster_interval,
        ));

        Self {
            quota,
            vpcs,
            subnets,
            security_groups,
            peerings,
            instances,
            volumes,
            stacks,
            load_balancers,
            secrets,
            clusters,
            functions,
            managed,
            lb_worker,
            cluster_worker,
            jobs,
        }
    }

    /// Start both reconcilers; they stop when `shutdown` flips to `true`
    pub fn spawn_workers(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.lb_worker.clone().run(shutdown.clone())),
            tokio::spawn(self.cluster_worker.clone().run(shutdown)),
        ]
    }

    /// Wait for background jobs such as snapshot copies and stack drivers
    pub async fn drain(&self) {
        self.jobs.wait_idle().await;
    }
}
