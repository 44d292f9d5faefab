//! Security group engine
//!
//! Rules are compiled to flow entries (`nimbus_core::flow`) and installed on
//! the bridge of the group's VPC. Adding a rule installs its flow; removing
//! one withdraws it unless another rule on the same bridge compiles to the
//! same match. Attaching a group re-installs every rule, which repairs any
//! drift left by a failed withdrawal.

use crate::activity;
use crate::lookup::{self, Key};
use crate::store::Store;
use chrono::Utc;
use nimbus_backend::{BackendResultExt, NetworkBackend, Notifier};
use nimbus_core::flow::{compile_rule, rule_match};
use nimbus_core::model::{Direction, Instance, Protocol, SecurityGroup, SecurityRule, Vpc};
use nimbus_core::{CloudError, Ipv4Cidr, RequestContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Input of [`SecurityGroupService::add_rule`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub protocol: Protocol,
    pub direction: Direction,
    /// Empty or `None` matches any address
    #[serde(default)]
    pub cidr: Option<String>,
    #[serde(default)]
    pub port_min: u16,
    #[serde(default)]
    pub port_max: u16,
    pub priority: u16,
}

impl RuleSpec {
    pub fn tcp_ingress(port: u16, cidr: Option<&str>, priority: u16) -> Self {
        Self {
            protocol: Protocol::Tcp,
            direction: Direction::Ingress,
            cidr: cidr.map(str::to_string),
            port_min: port,
            port_max: port,
            priority,
        }
    }

    fn build(&self) -> Result<SecurityRule> {
        let cidr = match self.cidr.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(text) => Some(text.parse::<Ipv4Cidr>()?),
        };
        SecurityRule::new(
            self.protocol,
            self.direction,
            cidr,
            self.port_min,
            self.port_max,
            self.priority,
        )
    }
}

pub struct SecurityGroupService {
    store: Arc<dyn Store>,
    network: Arc<dyn NetworkBackend>,
    notifier: Notifier,
}

impl SecurityGroupService {
    pub fn new(store: Arc<dyn Store>, network: Arc<dyn NetworkBackend>, notifier: Notifier) -> Self {
        Self {
            store,
            network,
            notifier,
        }
    }

    /// New group seeded with the implicit ARP rules, their flows installed
    pub async fn create_group(
        &self,
        ctx: &RequestContext,
        vpc_id: Uuid,
        name: &str,
        description: &str,
    ) -> Result<SecurityGroup> {
        ctx.ensure_active()?;
        let name = name.trim();
        if name.is_empty() {
            return Err(CloudError::invalid("security group name is required"));
        }
        let vpc = self.store.get_vpc(ctx.tenant_id, vpc_id).await?;
        let group = SecurityGroup::new(ctx.tenant_id, ctx.user_id, vpc.id, name, description);
        self.store.insert_security_group(&group).await?;

        if let Err(e) = self.sync_group_flows(&vpc, &group).await {
            if let Err(cleanup) = self.store.delete_security_group(ctx.tenant_id, group.id).await {
                warn!(group_id = %group.id, error = %cleanup, "failed to remove half-created security group");
            }
            return Err(e);
        }

        info!(group_id = %group.id, vpc_id = %vpc.id, name = %group.name, "security group created");
        self.notifier
            .emit(activity(ctx, "SECURITY_GROUP_CREATE", "security_group", group.id))
            .await;
        Ok(group)
    }

    pub async fn get(&self, ctx: &RequestContext, key: &str) -> Result<SecurityGroup> {
        match Key::parse(key)? {
            Key::Id(id) => self.store.get_security_group(ctx.tenant_id, id).await,
            Key::Name(name) => {
                let mut matches: Vec<_> = self
                    .store
                    .list_security_groups(ctx.tenant_id, None)
                    .await?
                    .into_iter()
                    .filter(|g| g.name == name)
                    .collect();
                match matches.len() {
                    0 => Err(CloudError::not_found("security group", name)),
                    1 => Ok(matches.remove(0)),
                    n => Err(CloudError::invalid(format!(
                        "security group name '{}' is ambiguous ({} VPCs); use its id",
                        name, n
                    ))),
                }
            }
        }
    }

    pub async fn list(&self, ctx: &RequestContext, vpc_id: Option<Uuid>) -> Result<Vec<SecurityGroup>> {
        self.store.list_security_groups(ctx.tenant_id, vpc_id).await
    }

    /// Persist the rule, then install its flow. If the flow cannot be
    /// installed the rule is taken back out of the group.
    pub async fn add_rule(
        &self,
        ctx: &RequestContext,
        group: &str,
        spec: &RuleSpec,
    ) -> Result<SecurityRule> {
        ctx.ensure_active()?;
        let rule = spec.build()?;
        let mut group = self.get(ctx, group).await?;
        let vpc = self.store.get_vpc(ctx.tenant_id, group.vpc_id).await?;

        group.rules.push(rule.clone());
        group.updated_at = Utc::now();
        self.store.update_security_group(&group).await?;

        let flow = compile_rule(&rule);
        if let Err(e) = self
            .network
            .add_flow_rule(&vpc.network_id, &flow)
            .await
            .step("install security group flow")
        {
            group.rules.retain(|r| r.id != rule.id);
            if let Err(revert) = self.store.update_security_group(&group).await {
                warn!(group_id = %group.id, rule_id = %rule.id, error = %revert, "failed to revert rule");
            }
            return Err(e);
        }

        info!(group_id = %group.id, rule_id = %rule.id, flow = %flow, "security rule added");
        self.notifier
            .emit(
                activity(ctx, "SECURITY_RULE_ADD", "security_group", group.id)
                    .with_meta("rule_id", rule.id.to_string().into())
                    .with_meta("match", flow.match_.into()),
            )
            .await;
        Ok(rule)
    }

    /// Withdraw the rule's flow, then drop the rule. A failed withdrawal is
    /// logged and the rule is removed anyway.
    pub async fn remove_rule(&self, ctx: &RequestContext, group: &str, rule_id: Uuid) -> Result<()> {
        ctx.ensure_active()?;
        let mut group = self.get(ctx, group).await?;
        let rule = group
            .rules
            .iter()
            .find(|r| r.id == rule_id)
            .cloned()
            .ok_or_else(|| CloudError::not_found("security rule", rule_id))?;
        if rule.is_implicit_arp() {
            return Err(CloudError::invalid("the implicit ARP rules cannot be removed"));
        }
        let vpc = self.store.get_vpc(ctx.tenant_id, group.vpc_id).await?;

        group.rules.retain(|r| r.id != rule_id);
        let flow_match = rule_match(&rule);
        let still_needed = group.rules.iter().any(|r| rule_match(r) == flow_match)
            || self
                .matches_on_bridge(&vpc, group.id)
                .await?
                .contains(&flow_match);
        if !still_needed
            && let Err(e) = self.network.delete_flow_rule(&vpc.network_id, &flow_match).await
        {
            warn!(group_id = %group.id, rule_id = %rule_id, flow_match = %flow_match, error = %e, "failed to withdraw flow; removing rule anyway");
        }

        group.updated_at = Utc::now();
        self.store.update_security_group(&group).await?;

        info!(group_id = %group.id, rule_id = %rule_id, "security rule removed");
        self.notifier
            .emit(
                activity(ctx, "SECURITY_RULE_REMOVE", "security_group", group.id)
                    .with_meta("rule_id", rule_id.to_string().into()),
            )
            .await;
        Ok(())
    }

    /// Attach a group to an instance of the same VPC and install its flows
    pub async fn attach_to_instance(&self, ctx: &RequestContext, group: &str, instance: &str) -> Result<()> {
        ctx.ensure_active()?;
        let group = self.get(ctx, group).await?;
        let mut instance =
            lookup::instance(self.store.as_ref(), ctx.tenant_id, instance).await?;
        if instance.security_group_ids.contains(&group.id) {
            return Ok(());
        }
        self.bind(ctx, &group, &instance).await?;

        instance.security_group_ids.push(group.id);
        if let Err(e) = self.store.update_instance(&instance).await {
            self.unbind(ctx, group.id, instance.id).await;
            return Err(e);
        }
        self.notifier
            .emit(
                activity(ctx, "SECURITY_GROUP_ATTACH", "security_group", group.id)
                    .with_meta("instance_id", instance.id.to_string().into()),
            )
            .await;
        Ok(())
    }

    pub async fn detach_from_instance(&self, ctx: &RequestContext, group: &str, instance: &str) -> Result<()> {
        ctx.ensure_active()?;
        let group = self.get(ctx, group).await?;
        let mut instance =
            lookup::instance(self.store.as_ref(), ctx.tenant_id, instance).await?;
        if !instance.security_group_ids.contains(&group.id) {
            return Err(CloudError::invalid(format!(
                "security group '{}' is not attached to instance '{}'",
                group.name, instance.name
            )));
        }

        instance.security_group_ids.retain(|g| *g != group.id);
        self.store.update_instance(&instance).await?;
        self.unbind(ctx, group.id, instance.id).await;

        self.notifier
            .emit(
                activity(ctx, "SECURITY_GROUP_DETACH", "security_group", group.id)
                    .with_meta("instance_id", instance.id.to_string().into()),
            )
            .await;
        Ok(())
    }

    /// Refused while the group is attached to any instance
    pub async fn delete_group(&self, ctx: &RequestContext, key: &str) -> Result<()> {
        ctx.ensure_active()?;
        let group = self.get(ctx, key).await?;
        if group.is_attached() {
            return Err(CloudError::conflict(format!(
                "security group '{}' is attached to {} instance(s)",
                group.name,
                group.instance_ids.len()
            )));
        }
        let vpc = self.store.get_vpc(ctx.tenant_id, group.vpc_id).await?;
        self.remove_group_flows(&vpc, &group).await?;
        self.store.delete_security_group(ctx.tenant_id, group.id).await?;

        info!(group_id = %group.id, "security group deleted");
        self.notifier
            .emit(activity(ctx, "SECURITY_GROUP_DELETE", "security_group", group.id))
            .await;
        Ok(())
    }

    /// Record `instance` as a member of `group` and install the group's
    /// flows. The instance record itself is left to the caller.
    pub(crate) async fn bind(
        &self,
        ctx: &RequestContext,
        group: &SecurityGroup,
        instance: &Instance,
    ) -> Result<SecurityGroup> {
        let Some(vpc_id) = instance.vpc_id else {
            return Err(CloudError::invalid(format!(
                "instance '{}' is not in a VPC",
                instance.name
            )));
        };
        if vpc_id != group.vpc_id {
            return Err(CloudError::CrossVpc(format!(
                "security group '{}' belongs to VPC {}, instance '{}' to VPC {}",
                group.name, group.vpc_id, instance.name, vpc_id
            )));
        }
        let vpc = self.store.get_vpc(ctx.tenant_id, vpc_id).await?;
        self.sync_group_flows(&vpc, group).await?;

        let mut group = self.store.get_security_group(ctx.tenant_id, group.id).await?;
        if !group.instance_ids.contains(&instance.id) {
            group.instance_ids.push(instance.id);
            group.updated_at = Utc::now();
            self.store.update_security_group(&group).await?;
        }
        debug!(group_id = %group.id, instance_id = %instance.id, "security group bound");
        Ok(group)
    }

    /// Drop `instance_id` from the group's members. When the last member
    /// leaves, the group's flows are withdrawn. Failures are logged.
    pub(crate) async fn unbind(&self, ctx: &RequestContext, group_id: Uuid, instance_id: Uuid) {
        let result = async {
            let mut group = self.store.get_security_group(ctx.tenant_id, group_id).await?;
            group.instance_ids.retain(|i| *i != instance_id);
            group.updated_at = Utc::now();
            self.store.update_security_group(&group).await?;
            if !group.is_attached() {
                let vpc = self.store.get_vpc(ctx.tenant_id, group.vpc_id).await?;
                self.remove_group_flows(&vpc, &group).await?;
            }
            Ok::<_, CloudError>(())
        }
        .await;
        if let Err(e) = result {
            warn!(group_id = %group_id, instance_id = %instance_id, error = %e, "failed to unbind security group");
        }
    }

    /// Install every rule of `group` on the VPC bridge
    pub async fn sync_group_flows(&self, vpc: &Vpc, group: &SecurityGroup) -> Result<()> {
        for rule in &group.rules {
            self.network
                .add_flow_rule(&vpc.network_id, &compile_rule(rule))
                .await
                .step("install security group flow")?;
        }
        debug!(group_id = %group.id, bridge = %vpc.network_id, rules = group.rules.len(), "group flows synced");
        Ok(())
    }

    /// Withdraw the flows of `group` that no other group of the VPC still needs
    pub async fn remove_group_flows(&self, vpc: &Vpc, group: &SecurityGroup) -> Result<()> {
        let keep = self.matches_on_bridge(vpc, group.id).await?;
        let mine: HashSet<String> = group.rules.iter().map(rule_match).collect();
        for flow_match in mine.difference(&keep) {
            if let Err(e) = self.network.delete_flow_rule(&vpc.network_id, flow_match).await {
                warn!(group_id = %group.id, flow_match = %flow_match, error = %e, "failed to withdraw flow");
            }
        }
        Ok(())
    }

    /// Matches required by every group of `vpc` other than `except`
    async fn matches_on_bridge(&self, vpc: &Vpc, except: Uuid) -> Result<HashSet<String>> {
        Ok(self
            .store
            .list_security_groups(vpc.tenant_id, Some(vpc.id))
            .await?
            .iter()
            .filter(|g| g.id != except)
            .flat_map(|g| g.rules.iter().map(rule_match))
            .collect())
    }
}
