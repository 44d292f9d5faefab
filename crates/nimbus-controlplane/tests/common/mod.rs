use nimbus_backend::testing::{
    FakeCompute, FakeDns, FakeNetwork, FakeProxy, FakeStorage, RecordingSink,
};
use nimbus_backend::{MemoryTaskQueue, Notifier};
use nimbus_controlplane::instance::LaunchParams;
use nimbus_controlplane::{Backends, ControlPlane, MemoryStore, PlatformSettings};
use nimbus_core::RequestContext;
use nimbus_core::model::{Instance, Subnet, Vpc};
use std::sync::Arc;
use uuid::Uuid;

/// A control plane over in-memory fakes, with handles on every fake
pub struct TestPlatform {
    pub cp: ControlPlane,
    pub store: Arc<MemoryStore>,
    pub compute: Arc<FakeCompute>,
    pub network: Arc<FakeNetwork>,
    pub storage: Arc<FakeStorage>,
    pub proxy: Arc<FakeProxy>,
    pub dns: Arc<FakeDns>,
    pub queue: Arc<MemoryTaskQueue>,
    pub audit: Arc<RecordingSink>,
    pub events: Arc<RecordingSink>,
    pub ctx: RequestContext,
}

impl TestPlatform {
    pub fn new() -> Self {
        Self::with_settings(PlatformSettings::default())
    }

    pub fn with_settings(settings: PlatformSettings) -> Self {
        let store = Arc::new(MemoryStore::new());
        let compute = Arc::new(FakeCompute::new());
        let network = Arc::new(FakeNetwork::new());
        let storage = Arc::new(FakeStorage::new());
        let proxy = Arc::new(FakeProxy::new());
        let dns = Arc::new(FakeDns::new());
        let queue = Arc::new(MemoryTaskQueue::new());
        let audit = Arc::new(RecordingSink::new());
        let events = Arc::new(RecordingSink::new());

        let cp = ControlPlane::new(
            Backends {
                store: store.clone(),
                compute: compute.clone(),
                network: network.clone(),
                storage: storage.clone(),
                proxy: proxy.clone(),
                dns: dns.clone(),
                queue: queue.clone(),
                notifier: Notifier::new(audit.clone(), events.clone()),
            },
            settings,
        );

        Self {
            cp,
            store,
            compute,
            network,
            storage,
            proxy,
            dns,
            queue,
            audit,
            events,
            ctx: RequestContext::new(Uuid::new_v4(), Uuid::new_v4()),
        }
    }

    /// Another user of the same tenant
    #[allow(dead_code)]
    pub fn colleague(&self) -> RequestContext {
        RequestContext::new(Uuid::new_v4(), self.ctx.tenant_id)
    }

    /// A user of another tenant
    #[allow(dead_code)]
    pub fn stranger(&self) -> RequestContext {
        RequestContext::new(Uuid::new_v4(), Uuid::new_v4())
    }

    /// VPC `name` with one subnet
    #[allow(dead_code)]
    pub async fn network_with_subnet(&self, name: &str, vpc_cidr: &str, subnet_cidr: &str) -> (Vpc, Subnet) {
        let vpc = self.cp.vpcs.create(&self.ctx, name, vpc_cidr).await.unwrap();
        let subnet = self
            .cp
            .subnets
            .create(&self.ctx, &vpc.id.to_string(), "", subnet_cidr, None)
            .await
            .unwrap();
        (vpc, subnet)
    }

    #[allow(dead_code)]
    pub async fn launch_in(&self, name: &str, subnet: &Subnet) -> Instance {
        let params = LaunchParams {
            subnet: Some(subnet.id.to_string()),
            ..LaunchParams::new(name, "nginx:alpine")
        };
        self.cp.instances.launch(&self.ctx, &params).await.unwrap()
    }

    /// Audited actions, in order
    #[allow(dead_code)]
    pub fn actions(&self) -> Vec<String> {
        self.audit.actions()
    }
}
