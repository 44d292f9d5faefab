//! Docker integration for nimbus
//!
//! - [`DockerCompute`]: the [`nimbus_backend::ComputeBackend`] used in production
//! - [`NginxProxy`]: load balancer data plane, one nginx container per LB
//! - [`converter`]: pure translation of launch specs into bollard parameters

pub mod converter;
pub mod docker;
pub mod error;
pub mod proxy;
pub mod waiter;

pub use docker::DockerCompute;
pub use error::{ContainerError, Result};
pub use proxy::NginxProxy;
pub use waiter::{Readiness, ReadinessPolicy};
