//! nimbus control plane
//!
//! Resource services over the repository and backend capability traits:
//!
//! - networking: [`vpc`], [`subnet`], [`security_group`], [`peering`]
//! - compute and storage: [`instance`], [`volume`]
//! - orchestration: [`stack`], [`load_balancer`], [`cluster`], [`function`], [`managed`]
//! - tenancy: [`quota`], [`secret`]
//!
//! Every operation takes a [`RequestContext`] carrying the caller's user and
//! tenant. Multi-step operations either reach their target state or undo what
//! they did; detached work runs on the [`jobs::JobRunner`] and the
//! [`workers`].

pub mod cluster;
pub mod function;
pub mod instance;
pub mod jobs;
pub mod load_balancer;
pub mod lookup;
pub mod managed;
pub mod peering;
pub mod platform;
pub mod quota;
pub mod rollback;
pub mod secret;
pub mod security_group;
pub mod stack;
pub mod store;
pub mod subnet;
pub mod volume;
pub mod vpc;
pub mod workers;

// Re-exports
pub use cluster::ClusterService;
pub use function::{FunctionService, RegisterFunction};
pub use instance::{InstanceService, LaunchParams, VolumeMount};
pub use load_balancer::{CreateLoadBalancer, LoadBalancerService};
pub use managed::{Engine, ManagedEndpoint, ManagedServiceLauncher};
pub use peering::PeeringService;
pub use platform::{Backends, ControlPlane, PlatformSettings};
pub use quota::QuotaService;
pub use secret::{SecretCipher, SecretService};
pub use security_group::{RuleSpec, SecurityGroupService};
pub use stack::StackService;
pub use store::{MemoryStore, Store};
pub use subnet::SubnetService;
pub use volume::VolumeService;
pub use vpc::VpcService;

use nimbus_core::RequestContext;
use nimbus_core::model::ActivityRecord;
use uuid::Uuid;

/// Activity record attributed to the caller
pub(crate) fn activity(
    ctx: &RequestContext,
    action: &str,
    resource_type: &str,
    resource_id: impl ToString,
) -> ActivityRecord {
    ActivityRecord::new(action, resource_type, resource_id, ctx.user_id, ctx.tenant_id)
}

/// First 8 hex digits of `id`, for backend object names
pub(crate) fn short(id: &Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

/// Fresh random 8-hex tag
pub(crate) fn short_id() -> String {
    short(&Uuid::new_v4())
}
