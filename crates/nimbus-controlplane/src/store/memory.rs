//! In-memory repository

use super::*;
use nimbus_core::CloudError;
use nimbus_core::model::pair_key;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// A record addressed by id and owned by one tenant
trait Owned: Clone + Send + Sync {
    const KIND: &'static str;

    fn id(&self) -> Uuid;

    fn tenant_id(&self) -> Uuid;
}

macro_rules! owned {
    ($($ty:ty => $kind:literal),+ $(,)?) => {
        $(impl Owned for $ty {
            const KIND: &'static str = $kind;

            fn id(&self) -> Uuid {
                self.id
            }

            fn tenant_id(&self) -> Uuid {
                self.tenant_id
            }
        })+
    };
}

owned! {
    Vpc => "vpc",
    Subnet => "subnet",
    Instance => "instance",
    Volume => "volume",
    Snapshot => "snapshot",
    SecurityGroup => "security group",
    VpcPeering => "peering",
    Stack => "stack",
    LoadBalancer => "load balancer",
    Secret => "secret",
    Cluster => "cluster",
    Function => "function",
}

/// One aggregate's rows
struct Table<T> {
    rows: RwLock<HashMap<Uuid, T>>,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Owned> Table<T> {
    async fn get(&self, tenant_id: Uuid, id: Uuid) -> Result<T> {
        self.rows
            .read()
            .await
            .get(&id)
            .filter(|r| r.tenant_id() == tenant_id)
            .cloned()
            .ok_or_else(|| CloudError::not_found(T::KIND, id))
    }

    async fn find(&self, pred: impl Fn(&T) -> bool) -> Option<T> {
        self.rows.read().await.values().find(|r| pred(r)).cloned()
    }

    /// Matching rows, oldest first
    async fn filter(&self, pred: impl Fn(&T) -> bool) -> Vec<T>
    where
        T: HasCreatedAt,
    {
        let mut rows: Vec<T> = self
            .rows
            .read()
            .await
            .values()
            .filter(|r| pred(r))
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.created_at());
        rows
    }

    /// Insert unless `clash` matches an existing row
    async fn insert_unique(
        &self,
        row: &T,
        clash: impl Fn(&T) -> bool,
        conflict: impl FnOnce() -> String,
    ) -> Result<()> {
        let mut rows = self.rows.write().await;
        if rows.values().any(|r| clash(r)) {
            return Err(CloudError::Conflict(conflict()));
        }
        rows.insert(row.id(), row.clone());
        Ok(())
    }

    async fn replace(&self, row: &T) -> Result<()> {
        let mut rows = self.rows.write().await;
        match rows.get_mut(&row.id()) {
            Some(existing) if existing.tenant_id() == row.tenant_id() => {
                *existing = row.clone();
                Ok(())
            }
            _ => Err(CloudError::not_found(T::KIND, row.id())),
        }
    }

    /// Apply `change` to the stored row under the write lock. `check` sees
    /// the stored row first and can refuse the change.
    async fn modify(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        check: impl FnOnce(&T) -> Result<()>,
        change: impl FnOnce(&mut T),
    ) -> Result<T> {
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(&id)
            .filter(|r| r.tenant_id() == tenant_id)
            .ok_or_else(|| CloudError::not_found(T::KIND, id))?;
        check(row)?;
        change(row);
        Ok(row.clone())
    }

    async fn remove(&self, tenant_id: Uuid, id: Uuid) -> Result<()> {
        let mut rows = self.rows.write().await;
        match rows.get(&id) {
            Some(r) if r.tenant_id() == tenant_id => {
                rows.remove(&id);
                Ok(())
            }
            _ => Err(CloudError::not_found(T::KIND, id)),
        }
    }
}

trait HasCreatedAt {
    fn created_at(&self) -> chrono::DateTime<chrono::Utc>;
}

macro_rules! created_at {
    ($($ty:ty),+ $(,)?) => {
        $(impl HasCreatedAt for $ty {
            fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
                self.created_at
            }
        })+
    };
}

created_at!(
    Vpc,
    Subnet,
    Instance,
    Volume,
    Snapshot,
    SecurityGroup,
    VpcPeering,
    Stack,
    LoadBalancer,
    Secret,
    Cluster,
    Function,
);

/// Repository held in process memory, for tests and single-node runs
#[derive(Default)]
pub struct MemoryStore {
    vpcs: Table<Vpc>,
    subnets: Table<Subnet>,
    instances: Table<Instance>,
    volumes: Table<Volume>,
    snapshots: Table<Snapshot>,
    security_groups: Table<SecurityGroup>,
    peerings: Table<VpcPeering>,
    stacks: Table<Stack>,
    load_balancers: Table<LoadBalancer>,
    secrets: Table<Secret>,
    clusters: Table<Cluster>,
    functions: Table<Function>,
    invocations: RwLock<Vec<FunctionInvocation>>,
    quotas: RwLock<HashMap<Uuid, TenantQuota>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VpcStore for MemoryStore {
    async fn insert_vpc(&self, vpc: &Vpc) -> Result<()> {
        self.vpcs
            .insert_unique(
                vpc,
                |v| v.tenant_id == vpc.tenant_id && v.name == vpc.name,
                || format!("VPC '{}' already exists", vpc.name),
            )
            .await
    }

    async fn get_vpc(&self, tenant_id: Uuid, id: Uuid) -> Result<Vpc> {
        self.vpcs.get(tenant_id, id).await
    }

    async fn find_vpc_by_name(&self, tenant_id: Uuid, name: &str) -> Result<Option<Vpc>> {
        Ok(self
            .vpcs
            .find(|v| v.tenant_id == tenant_id && v.name == name)
            .await)
    }

    async fn list_vpcs(&self, tenant_id: Uuid) -> Result<Vec<Vpc>> {
        Ok(self.vpcs.filter(|v| v.tenant_id == tenant_id).await)
    }

    async fn update_vpc(&self, vpc: &Vpc) -> Result<()> {
        self.vpcs.replace(vpc).await
    }

    async fn delete_vpc(&self, tenant_id: Uuid, id: Uuid) -> Result<()> {
        self.vpcs.remove(tenant_id, id).await
    }
}

#[async_trait]
impl SubnetStore for MemoryStore {
    async fn insert_subnet(&self, subnet: &Subnet) -> Result<()> {
        self.subnets
            .insert_unique(
                subnet,
                |s| s.vpc_id == subnet.vpc_id && s.cidr_block.overlaps(&subnet.cidr_block),
                || {
                    format!(
                        "subnet {} overlaps an existing subnet of the VPC",
                        subnet.cidr_block
                    )
                },
            )
            .await
    }

    async fn get_subnet(&self, tenant_id: Uuid, id: Uuid) -> Result<Subnet> {
        self.subnets.get(tenant_id, id).await
    }

    async fn list_subnets(&self, tenant_id: Uuid, vpc_id: Option<Uuid>) -> Result<Vec<Subnet>> {
        Ok(self
            .subnets
            .filter(|s| s.tenant_id == tenant_id && vpc_id.is_none_or(|v| s.vpc_id == v))
            .await)
    }

    async fn delete_subnet(&self, tenant_id: Uuid, id: Uuid) -> Result<()> {
        self.subnets.remove(tenant_id, id).await
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn insert_instance(&self, instance: &Instance) -> Result<()> {
        let mut rows = self.instances.rows.write().await;
        if rows
            .values()
            .any(|i| i.tenant_id == instance.tenant_id && i.name == instance.name)
        {
            return Err(CloudError::Conflict(format!(
                "instance '{}' already exists",
                instance.name
            )));
        }
        if let (Some(subnet_id), Some(ip)) = (instance.subnet_id, instance.private_ip)
            && rows
                .values()
                .any(|i| i.subnet_id == Some(subnet_id) && i.private_ip == Some(ip))
        {
            return Err(CloudError::Conflict(format!(
                "address {} is already in use",
                ip
            )));
        }
        rows.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get_instance(&self, tenant_id: Uuid, id: Uuid) -> Result<Instance> {
        self.instances.get(tenant_id, id).await
    }

    async fn find_instance_by_name(&self, tenant_id: Uuid, name: &str) -> Result<Option<Instance>> {
        Ok(self
            .instances
            .find(|i| i.tenant_id == tenant_id && i.name == name)
            .await)
    }

    async fn list_instances(&self, tenant_id: Uuid) -> Result<Vec<Instance>> {
        Ok(self.instances.filter(|i| i.tenant_id == tenant_id).await)
    }

    async fn list_instances_in_vpc(&self, vpc_id: Uuid) -> Result<Vec<Instance>> {
        Ok(self.instances.filter(|i| i.vpc_id == Some(vpc_id)).await)
    }

    async fn used_ips(&self, subnet_id: Uuid) -> Result<Vec<Ipv4Addr>> {
        Ok(self
            .instances
            .rows
            .read()
            .await
            .values()
            .filter(|i| i.subnet_id == Some(subnet_id))
            .filter_map(|i| i.private_ip)
            .collect())
    }

    async fn update_instance(&self, instance: &Instance) -> Result<Instance> {
        let mut rows = self.instances.rows.write().await;
        let stored = rows
            .get_mut(&instance.id)
            .filter(|i| i.tenant_id == instance.tenant_id)
            .ok_or_else(|| CloudError::not_found("instance", instance.id))?;
        if stored.version != instance.version {
            return Err(CloudError::Conflict(format!(
                "instance {} was modified concurrently (version {} != {})",
                instance.id, stored.version, instance.version
            )));
        }
        let mut next = instance.clone();
        next.version += 1;
        next.updated_at = chrono::Utc::now();
        *stored = next.clone();
        Ok(next)
    }

    async fn delete_instance(&self, tenant_id: Uuid, id: Uuid) -> Result<()> {
        self.instances.remove(tenant_id, id).await
    }
}

#[async_trait]
impl VolumeStore for MemoryStore {
    async fn insert_volume(&self, volume: &Volume) -> Result<()> {
        self.volumes
            .insert_unique(
                volume,
                |v| v.tenant_id == volume.tenant_id && v.name == volume.name,
                || format!("volume '{}' already exists", volume.name),
            )
            .await
    }

    async fn get_volume(&self, tenant_id: Uuid, id: Uuid) -> Result<Volume> {
        self.volumes.get(tenant_id, id).await
    }

    async fn find_volume_by_name(&self, tenant_id: Uuid, name: &str) -> Result<Option<Volume>> {
        Ok(self
            .volumes
            .find(|v| v.tenant_id == tenant_id && v.name == name)
            .await)
    }

    async fn list_volumes(&self, tenant_id: Uuid) -> Result<Vec<Volume>> {
        Ok(self.volumes.filter(|v| v.tenant_id == tenant_id).await)
    }

    async fn list_volumes_for_instance(&self, tenant_id: Uuid, instance_id: Uuid) -> Result<Vec<Volume>> {
        Ok(self
            .volumes
            .filter(|v| v.tenant_id == tenant_id && v.instance_id == Some(instance_id))
            .await)
    }

    async fn update_volume(&self, volume: &Volume) -> Result<()> {
        self.volumes.replace(volume).await
    }

    async fn transition_volume(&self, volume: &Volume, expected: VolumeStatus) -> Result<()> {
        let mut rows = self.volumes.rows.write().await;
        let stored = rows
            .get_mut(&volume.id)
            .filter(|v| v.tenant_id == volume.tenant_id)
            .ok_or_else(|| CloudError::not_found("volume", volume.id))?;
        if stored.status != expected {
            return Err(CloudError::Conflict(format!(
                "volume '{}' is {}, expected {}",
                stored.name, stored.status, expected
            )));
        }
        *stored = volume.clone();
        Ok(())
    }

    async fn delete_volume(&self, tenant_id: Uuid, id: Uuid) -> Result<()> {
        self.volumes.remove(tenant_id, id).await
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.snapshots
            .insert_unique(
                snapshot,
                |s| s.tenant_id == snapshot.tenant_id && s.name == snapshot.name,
                || format!("snapshot '{}' already exists", snapshot.name),
            )
            .await
    }

    async fn get_snapshot(&self, tenant_id: Uuid, id: Uuid) -> Result<Snapshot> {
        self.snapshots.get(tenant_id, id).await
    }

    async fn list_snapshots(&self, tenant_id: Uuid, volume_id: Option<Uuid>) -> Result<Vec<Snapshot>> {
        Ok(self
            .snapshots
            .filter(|s| s.tenant_id == tenant_id && volume_id.is_none_or(|v| s.volume_id == v))
            .await)
    }

    async fn update_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.snapshots.replace(snapshot).await
    }

    async fn delete_snapshot(&self, tenant_id: Uuid, id: Uuid) -> Result<()> {
        self.snapshots.remove(tenant_id, id).await
    }
}

#[async_trait]
impl SecurityGroupStore for MemoryStore {
    async fn insert_security_group(&self, group: &SecurityGroup) -> Result<()> {
        self.security_groups
            .insert_unique(
                group,
                |g| g.vpc_id == group.vpc_id && g.name == group.name,
                || format!("security group '{}' already exists in the VPC", group.name),
            )
            .await
    }

    async fn get_security_group(&self, tenant_id: Uuid, id: Uuid) -> Result<SecurityGroup> {
        self.security_groups.get(tenant_id, id).await
    }

    async fn list_security_groups(&self, tenant_id: Uuid, vpc_id: Option<Uuid>) -> Result<Vec<SecurityGroup>> {
        Ok(self
            .security_groups
            .filter(|g| g.tenant_id == tenant_id && vpc_id.is_none_or(|v| g.vpc_id == v))
            .await)
    }

    async fn update_security_group(&self, group: &SecurityGroup) -> Result<()> {
        self.security_groups.replace(group).await
    }

    async fn delete_security_group(&self, tenant_id: Uuid, id: Uuid) -> Result<()> {
        self.security_groups.remove(tenant_id, id).await
    }
}

#[async_trait]
impl PeeringStore for MemoryStore {
    async fn insert_peering(&self, peering: &VpcPeering) -> Result<()> {
        let key = peering.pair_key();
        self.peerings
            .insert_unique(
                peering,
                |p| !p.status.is_terminal() && p.pair_key() == key,
                || "a peering between these VPCs already exists".to_string(),
            )
            .await
    }

    async fn get_peering(&self, tenant_id: Uuid, id: Uuid) -> Result<VpcPeering> {
        self.peerings.get(tenant_id, id).await
    }

    async fn list_peerings(&self, tenant_id: Uuid) -> Result<Vec<VpcPeering>> {
        Ok(self.peerings.filter(|p| p.tenant_id == tenant_id).await)
    }

    async fn list_peerings_for_vpc(&self, vpc_id: Uuid) -> Result<Vec<VpcPeering>> {
        Ok(self.peerings.filter(|p| p.involves(vpc_id)).await)
    }

    async fn update_peering(&self, peering: &VpcPeering) -> Result<()> {
        let mut rows = self.peerings.rows.write().await;
        if !peering.status.is_terminal() {
            let key = pair_key(peering.requester_vpc_id, peering.accepter_vpc_id);
            let clash = rows.values().any(|p| {
                p.id != peering.id && !p.status.is_terminal() && p.pair_key() == key
            });
            if clash {
                return Err(CloudError::conflict(
                    "a peering between these VPCs already exists",
                ));
            }
        }
        match rows.get_mut(&peering.id) {
            Some(existing) if existing.tenant_id == peering.tenant_id => {
                *existing = peering.clone();
                Ok(())
            }
            _ => Err(CloudError::not_found("peering", peering.id)),
        }
    }

    async fn delete_peering(&self, tenant_id: Uuid, id: Uuid) -> Result<()> {
        self.peerings.remove(tenant_id, id).await
    }
}

#[async_trait]
impl StackStore for MemoryStore {
    async fn insert_stack(&self, stack: &Stack) -> Result<()> {
        self.stacks
            .insert_unique(
                stack,
                |s| s.tenant_id == stack.tenant_id && s.name == stack.name,
                || format!("stack '{}' already exists", stack.name),
            )
            .await
    }

    async fn get_stack(&self, tenant_id: Uuid, id: Uuid) -> Result<Stack> {
        self.stacks.get(tenant_id, id).await
    }

    async fn find_stack_by_name(&self, tenant_id: Uuid, name: &str) -> Result<Option<Stack>> {
        Ok(self
            .stacks
            .find(|s| s.tenant_id == tenant_id && s.name == name)
            .await)
    }

    async fn list_stacks(&self, tenant_id: Uuid) -> Result<Vec<Stack>> {
        Ok(self.stacks.filter(|s| s.tenant_id == tenant_id).await)
    }

    async fn update_stack(&self, stack: &Stack) -> Result<()> {
        self.stacks.replace(stack).await
    }

    async fn delete_stack(&self, tenant_id: Uuid, id: Uuid) -> Result<()> {
        self.stacks.remove(tenant_id, id).await
    }
}

#[async_trait]
impl LoadBalancerStore for MemoryStore {
    async fn insert_load_balancer(&self, lb: &LoadBalancer) -> Result<()> {
        self.load_balancers
            .insert_unique(
                lb,
                |l| {
                    l.tenant_id == lb.tenant_id
                        && lb.idempotency_key.is_some()
                        && l.idempotency_key == lb.idempotency_key
                },
                || "a load balancer with this idempotency key already exists".to_string(),
            )
            .await
    }

    async fn get_load_balancer(&self, tenant_id: Uuid, id: Uuid) -> Result<LoadBalancer> {
        self.load_balancers.get(tenant_id, id).await
    }

    async fn find_load_balancer_by_key(&self, tenant_id: Uuid, key: &str) -> Result<Option<LoadBalancer>> {
        Ok(self
            .load_balancers
            .find(|l| l.tenant_id == tenant_id && l.idempotency_key.as_deref() == Some(key))
            .await)
    }

    async fn list_load_balancers(&self, tenant_id: Uuid) -> Result<Vec<LoadBalancer>> {
        Ok(self.load_balancers.filter(|l| l.tenant_id == tenant_id).await)
    }

    async fn list_all_load_balancers(&self) -> Result<Vec<LoadBalancer>> {
        Ok(self.load_balancers.filter(|_| true).await)
    }

    async fn transition_load_balancer(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        from: &[LbStatus],
        to: LbStatus,
        url: Option<&str>,
    ) -> Result<LoadBalancer> {
        self.load_balancers
            .modify(
                tenant_id,
                id,
                |lb| {
                    if from.contains(&lb.status) {
                        Ok(())
                    } else {
                        Err(CloudError::Conflict(format!(
                            "load balancer '{}' is {}, cannot become {}",
                            lb.name, lb.status, to
                        )))
                    }
                },
                |lb| {
                    lb.status = to;
                    if let Some(url) = url {
                        lb.url = Some(url.to_string());
                    }
                    lb.updated_at = chrono::Utc::now();
                },
            )
            .await
    }

    async fn set_load_balancer_targets(
        &self,
        tenant_id: Uuid,
        id: Uuid,
        targets: &[LbTarget],
    ) -> Result<LoadBalancer> {
        self.load_balancers
            .modify(
                tenant_id,
                id,
                |lb| match lb.status {
                    LbStatus::Creating | LbStatus::Active => Ok(()),
                    status => Err(CloudError::Conflict(format!(
                        "load balancer '{}' is {}",
                        lb.name, status
                    ))),
                },
                |lb| {
                    lb.targets = targets.to_vec();
                    lb.updated_at = chrono::Utc::now();
                },
            )
            .await
    }

    async fn delete_load_balancer(&self, tenant_id: Uuid, id: Uuid) -> Result<()> {
        self.load_balancers.remove(tenant_id, id).await
    }
}

#[async_trait]
impl QuotaStore for MemoryStore {
    async fn get_quota(&self, tenant_id: Uuid) -> Result<Option<TenantQuota>> {
        Ok(self.quotas.read().await.get(&tenant_id).cloned())
    }

    async fn set_quota_limits(&self, tenant_id: Uuid, limits: QuotaCounters) -> Result<()> {
        self.quotas
            .write()
            .await
            .entry(tenant_id)
            .and_modify(|q| q.limits = limits)
            .or_insert_with(|| TenantQuota::new(tenant_id, limits));
        Ok(())
    }

    async fn reserve_quota(
        &self,
        tenant_id: Uuid,
        defaults: &QuotaCounters,
        requests: &[(QuotaResource, u64)],
    ) -> Result<TenantQuota> {
        let mut quotas = self.quotas.write().await;
        let quota = quotas
            .entry(tenant_id)
            .or_insert_with(|| TenantQuota::new(tenant_id, *defaults));
        quota.reserve(requests)?;
        Ok(quota.clone())
    }

    async fn release_quota(&self, tenant_id: Uuid, requests: &[(QuotaResource, u64)]) -> Result<()> {
        if let Some(quota) = self.quotas.write().await.get_mut(&tenant_id) {
            quota.release(requests);
        }
        Ok(())
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    async fn insert_secret(&self, secret: &Secret) -> Result<()> {
        self.secrets
            .insert_unique(
                secret,
                |s| s.tenant_id == secret.tenant_id && s.name == secret.name,
                || format!("secret '{}' already exists", secret.name),
            )
            .await
    }

    async fn get_secret(&self, tenant_id: Uuid, id: Uuid) -> Result<Secret> {
        self.secrets.get(tenant_id, id).await
    }

    async fn find_secret_by_name(&self, tenant_id: Uuid, name: &str) -> Result<Option<Secret>> {
        Ok(self
            .secrets
            .find(|s| s.tenant_id == tenant_id && s.name == name)
            .await)
    }

    async fn list_secrets(&self, tenant_id: Uuid) -> Result<Vec<Secret>> {
        Ok(self.secrets.filter(|s| s.tenant_id == tenant_id).await)
    }

    async fn update_secret(&self, secret: &Secret) -> Result<()> {
        self.secrets.replace(secret).await
    }

    async fn delete_secret(&self, tenant_id: Uuid, id: Uuid) -> Result<()> {
        self.secrets.remove(tenant_id, id).await
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn insert_cluster(&self, cluster: &Cluster) -> Result<()> {
        self.clusters
            .insert_unique(
                cluster,
                |c| c.tenant_id == cluster.tenant_id && c.name == cluster.name,
                || format!("cluster '{}' already exists", cluster.name),
            )
            .await
    }

    async fn get_cluster(&self, tenant_id: Uuid, id: Uuid) -> Result<Cluster> {
        self.clusters.get(tenant_id, id).await
    }

    async fn list_clusters(&self, tenant_id: Uuid) -> Result<Vec<Cluster>> {
        Ok(self.clusters.filter(|c| c.tenant_id == tenant_id).await)
    }

    async fn update_cluster(&self, cluster: &Cluster) -> Result<()> {
        self.clusters.replace(cluster).await
    }

    async fn delete_cluster(&self, tenant_id: Uuid, id: Uuid) -> Result<()> {
        self.clusters.remove(tenant_id, id).await
    }
}

#[async_trait]
impl FunctionStore for MemoryStore {
    async fn insert_function(&self, function: &Function) -> Result<()> {
        self.functions
            .insert_unique(
                function,
                |f| f.tenant_id == function.tenant_id && f.name == function.name,
                || format!("function '{}' already exists", function.name),
            )
            .await
    }

    async fn get_function(&self, tenant_id: Uuid, id: Uuid) -> Result<Function> {
        self.functions.get(tenant_id, id).await
    }

    async fn find_function_by_name(&self, tenant_id: Uuid, name: &str) -> Result<Option<Function>> {
        Ok(self
            .functions
            .find(|f| f.tenant_id == tenant_id && f.name == name)
            .await)
    }

    async fn list_functions(&self, tenant_id: Uuid) -> Result<Vec<Function>> {
        Ok(self.functions.filter(|f| f.tenant_id == tenant_id).await)
    }

    async fn delete_function(&self, tenant_id: Uuid, id: Uuid) -> Result<()> {
        self.functions.remove(tenant_id, id).await?;
        self.invocations
            .write()
            .await
            .retain(|i| i.function_id != id);
        Ok(())
    }

    async fn insert_invocation(&self, invocation: &FunctionInvocation) -> Result<()> {
        self.invocations.write().await.push(invocation.clone());
        Ok(())
    }

    async fn list_invocations(&self, tenant_id: Uuid, function_id: Uuid) -> Result<Vec<FunctionInvocation>> {
        let mut found: Vec<_> = self
            .invocations
            .read()
            .await
            .iter()
            .filter(|i| i.tenant_id == tenant_id && i.function_id == function_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(found)
    }
}
