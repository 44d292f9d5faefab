//! nimbus backends
//!
//! The control plane never talks to Docker, Open vSwitch or a disk directly.
//! It consumes the capability traits defined here, each shared as
//! `Arc<dyn Trait>`:
//!
//! ```text
//! ┌────────────────────────────────────────────────────┐
//! │                nimbus-controlplane                 │
//! └──────┬─────────────┬─────────────┬─────────────┬───┘
//!        │ Compute     │ Network     │ Storage     │ Proxy
//! ┌──────▼─────┐ ┌─────▼──────┐ ┌────▼───────┐ ┌───▼────────┐
//! │   docker   │ │    ovs     │ │    file    │ │   nginx    │
//! └────────────┘ └────────────┘ └────────────┘ └────────────┘
//! ```

pub mod compute;
pub mod dns;
pub mod error;
pub mod network;
pub mod proxy;
pub mod queue;
pub mod sinks;
pub mod storage;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-exports
pub use compute::{ComputeBackend, ContainerSpec, ContainerStats, ExecOutput, Mount, TaskOptions};
pub use dns::{DnsRegistrar, NoDns};
pub use error::{BackendError, BackendResultExt, Result};
pub use network::NetworkBackend;
pub use proxy::{ProxyAdapter, ProxyTarget};
pub use queue::{MemoryTaskQueue, TaskQueue};
pub use sinks::{AuditService, EventService, Notifier, TracingAudit, TracingEvents};
pub use storage::StorageBackend;
