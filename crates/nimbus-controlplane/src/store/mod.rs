//! Repository contracts
//!
//! One trait per aggregate, combined in [`Store`]. Every read takes the
//! caller's tenant: a record owned by another tenant is reported as
//! `NotFound`, never as `Forbidden`, so ids do not leak across tenants.
//! Uniqueness constraints live here rather than in the services.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use nimbus_core::Result;
use nimbus_core::model::{
    Cluster, Function, FunctionInvocation, Instance, LbStatus, LbTarget, LoadBalancer,
    QuotaCounters, QuotaResource,
    SecurityGroup, Secret, Snapshot, Stack, Subnet, TenantQuota, Volume, VolumeStatus, Vpc,
    VpcPeering,
};
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Combined repository
pub trait Store:
    VpcStore
    + SubnetStore
    + InstanceStore
    + VolumeStore
    + SnapshotStore
    + SecurityGroupStore
    + PeeringStore
    + StackStore
    + LoadBalancerStore
    + QuotaStore
    + SecretStore
    + ClusterStore
    + FunctionStore
    + Send
    + Sync
{
}

impl<T> Store for T where
    T: VpcStore
        + SubnetStore
        + InstanceStore
        + VolumeStore
        + SnapshotStore
        + SecurityGroupStore
        + PeeringStore
        + StackStore
        + LoadBalancerStore
        + QuotaStore
        + SecretStore
        + ClusterStore
        + FunctionStore
        + Send
        + Sync
{
}

#[async_trait]
pub trait VpcStore: Send + Sync {
    /// `Conflict` if the tenant already has a VPC with this name
    async fn insert_vpc(&self, vpc: &Vpc) -> Result<()>;

    async fn get_vpc(&self, tenant_id: Uuid, id: Uuid) -> Result<Vpc>;

    async fn find_vpc_by_name(&self, tenant_id: Uuid, name: &str) -> Result<Option<Vpc>>;

    async fn list_vpcs(&self, tenant_id: Uuid) -> Result<Vec<Vpc>>;

    async fn update_vpc(&self, vpc: &Vpc) -> Result<()>;

    async fn delete_vpc(&self, tenant_id: Uuid, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait SubnetStore: Send + Sync {
    /// `Conflict` if the CIDR overlaps another subnet of the same VPC
    async fn insert_subnet(&self, subnet: &Subnet) -> Result<()>;

    async fn get_subnet(&self, tenant_id: Uuid, id: Uuid) -> Result<Subnet>;

    async fn list_subnets(&self, tenant_id: Uuid, vpc_id: Option<Uuid>) -> Result<Vec<Subnet>>;

    async fn delete_subnet(&self, tenant_id: Uuid, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// `Conflict` on a duplicate name in the tenant, or when `private_ip` is
    /// already held by another instance of the same subnet
    async fn insert_instance(&self, instance: &Instance) -> Result<()>;

    async fn get_instance(&self, tenant_id: Uuid, id: Uuid) -> Result<Instance>;

    async fn find_instance_by_name(&self, tenant_id: Uuid, name: &str) -> Result<Option<Instance>>;

    async fn list_instances(&self, tenant_id: Uuid) -> Result<Vec<Instance>>;

    async fn list_instances_in_vpc(&self, vpc_id: Uuid) -> Result<Vec<Instance>>;

    /// Addresses held in a subnet, including PENDING reservations
    async fn used_ips(&self, subnet_id: Uuid) -> Result<Vec<Ipv4Addr>>;

    /// Persist `instance` if the stored version still equals `instance.version`.
    ///
    /// Returns the stored record with the version bumped; `Conflict` when
    /// another writer got there first.
    async fn update_instance(&self, instance: &Instance) -> Result<Instance>;

    async fn delete_instance(&self, tenant_id: Uuid, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait VolumeStore: Send + Sync {
    async fn insert_volume(&self, volume: &Volume) -> Result<()>;

    async fn get_volume(&self, tenant_id: Uuid, id: Uuid) -> Result<Volume>;

    async fn find_volume_by_name(&self, tenant_id: Uuid, name: &str) -> Result<Option<Volume>>;

    async fn list_volumes(&self, tenant_id: Uuid) -> Result<Vec<Volume>>;

    async fn list_volumes_for_instance(&self, tenant_id: Uuid, instance_id: Uuid) -> Result<Vec<Volume>>;

    async fn update_volume(&self, volume: &Volume) -> Result<()>;

    /// Compare-and-set on status; `Conflict` if the stored status differs from `expected`
    async fn transition_volume(&self, volume: &Volume, expected: VolumeStatus) -> Result<()>;

    async fn delete_volume(&self, tenant_id: Uuid, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    async fn get_snapshot(&self, tenant_id: Uuid, id: Uuid) -> Result<Snapshot>;

    async fn list_snapshots(&self, tenant_id: Uuid, volume_id: Option<Uuid>) -> Result<Vec<Snapshot>>;

    async fn update_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    async fn delete_snapshot(&self, tenant_id: Uuid, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait SecurityGroupStore: Send + Sync {
    /// `Conflict` on a duplicate name within the VPC
    async fn insert_security_group(&self, group: &SecurityGroup) -> Result<()>;

    async fn get_security_group(&self, tenant_id: Uuid, id: Uuid) -> Result<SecurityGroup>;

    async fn list_security_groups(&self, tenant_id: Uuid, vpc_id: Option<Uuid>) -> Result<Vec<SecurityGroup>>;

    async fn update_security_group(&self, group: &SecurityGroup) -> Result<()>;

    async fn delete_security_group(&self, tenant_id: Uuid, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait PeeringStore: Send + Sync {
    /// `Conflict` if a non-terminal peering exists for the same unordered pair
    async fn insert_peering(&self, peering: &VpcPeering) -> Result<()>;

    async fn get_peering(&self, tenant_id: Uuid, id: Uuid) -> Result<VpcPeering>;

    async fn list_peerings(&self, tenant_id: Uuid) -> Result<Vec<VpcPeering>>;

    async fn list_peerings_for_vpc(&self, vpc_id: Uuid) -> Result<Vec<VpcPeering>>;

    async fn update_peering(&self, peering: &VpcPeering) -> Result<()>;

    async fn delete_peering(&self, tenant_id: Uuid, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait StackStore: Send + Sync {
    /// `Conflict` if the tenant already has a stack with this name
    async fn insert_stack(&self, stack: &Stack) -> Result<()>;

    async fn get_stack(&self, tenant_id: Uuid, id: Uuid) -> Result<Stack>;

    async fn find_stack_by_name(&self, tenant_id: Uuid, name: &str) -> Result<Option<Stack>>;

    async fn list_stacks(&self, tenant_id: Uuid) -> Result<Vec<Stack>>;

    async fn update_stack(&self, stack: &Stack) -> Result<()>;

    async fn delete_stack(&self, tenant_id: Uuid, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait LoadBalancerStore: Send + Sync {
    /// `Conflict` if the tenant already has an LB carrying the same idempotency key
    async fn insert_load_balancer(&self, lb: &LoadBalancer) -> Result<()>;

    async fn get_load_balancer(&self, tenant_id: Uuid, id: Uuid) -> Result<LoadBalancer>;

    async fn find_load_balancer_by_key(&self, tenant_id: Uuid, key: &str) -> Result<Option<LoadBalancer>>;

    async fn list_load_balancers(&self, tenant_id: Uuid) -> Result<Vec<LoadBalancer>>;

    /// Every LB of every tenant, for the reconciler
    async fn list_all_load_balancers(&self) -> Result<Vec<LoadBalancer>>;

    /// Compare-and-set on status: an LB whose stored status is one of `from`
    /// moves to `to`, taking `url` when one is given. Targets stay as stored.
    /// `Conflict` if the stored status is not in `from`.
    async fn transition_load_balancer(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        from: &[LbStatus],
        to: LbStatus,
        url: Option<&str>,
    ) -> Result<LoadBalancer>;

    /// Replace the targets of an LB that is CREATING or ACTIVE, keeping its
    /// stored status; `Conflict` once it is being deleted
    async fn set_load_balancer_targets(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        targets: &[LbTarget],
    ) -> Result<LoadBalancer>;

    async fn delete_load_balancer(&self, tenant_id: Uuid, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn get_quota(&self, tenant_id: Uuid) -> Result<Option<TenantQuota>>;

    async fn set_quota_limits(&self, tenant_id: Uuid, limits: QuotaCounters) -> Result<()>;

    /// Atomically add every request to the tenant's usage, creating the
    /// quota row with `defaults` as limits when absent.
    /// `QuotaExceeded` leaves usage untouched.
    async fn reserve_quota(
        &self,
        tenant_id: Uuid,
        defaults: &QuotaCounters,
        requests: &[(QuotaResource, u64)],
    ) -> Result<TenantQuota>;

    async fn release_quota(&self, tenant_id: Uuid, requests: &[(QuotaResource, u64)]) -> Result<()>;
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// `Conflict` if the tenant already has a secret with this name
    async fn insert_secret(&self, secret: &Secret) -> Result<()>;

    async fn get_secret(&self, tenant_id: Uuid, id: Uuid) -> Result<Secret>;

    async fn find_secret_by_name(&self, tenant_id: Uuid, name: &str) -> Result<Option<Secret>>;

    async fn list_secrets(&self, tenant_id: Uuid) -> Result<Vec<Secret>>;

    async fn update_secret(&self, secret: &Secret) -> Result<()>;

    async fn delete_secret(&self, tenant_id: Uuid, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// `Conflict` if the tenant already has a cluster with this name
    async fn insert_cluster(&self, cluster: &Cluster) -> Result<()>;

    async fn get_cluster(&self, tenant_id: Uuid, id: Uuid) -> Result<Cluster>;

    async fn list_clusters(&self, tenant_id: Uuid) -> Result<Vec<Cluster>>;

    async fn update_cluster(&self, cluster: &Cluster) -> Result<()>;

    async fn delete_cluster(&self, tenant_id: Uuid, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait FunctionStore: Send + Sync {
    /// `Conflict` if the tenant already has a function with this name
    async fn insert_function(&self, function: &Function) -> Result<()>;

    async fn get_function(&self, tenant_id: Uuid, id: Uuid) -> Result<Function>;

    async fn find_function_by_name(&self, tenant_id: Uuid, name: &str) -> Result<Option<Function>>;

    async fn list_functions(&self, tenant_id: Uuid) -> Result<Vec<Function>>;

    /// Removes the function and its invocation history
    async fn delete_function(&self, tenant_id: Uuid, id: Uuid) -> Result<()>;

    async fn insert_invocation(&self, invocation: &FunctionInvocation) -> Result<()>;

    /// Newest first
    async fn list_invocations(&self, tenant_id: Uuid, function_id: Uuid) -> Result<Vec<FunctionInvocation>>;
}
