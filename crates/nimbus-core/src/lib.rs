//! nimbus core
//!
//! Shared vocabulary of the nimbus control plane: the domain model, the error
//! type every service returns, the request context, IPv4 prefix math, flow
//! compilation for security groups and peerings, and stack templates.
//!
//! Nothing here performs I/O.

pub mod context;
pub mod error;
pub mod flow;
pub mod model;
pub mod net;
pub mod template;

// Re-exports
pub use context::{CancelHandle, Identity, RequestContext};
pub use error::{CloudError, ErrorKind, Result};
pub use flow::{FlowRule, compile_rule, peering_rule};
pub use net::Ipv4Cidr;
pub use template::{ResourceType, Template, ValidationReport, validate_template};
