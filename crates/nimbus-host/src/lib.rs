//! Host-level drivers
//!
//! - [`OvsNetwork`]: bridges, veth pairs and flows via `ovs-vsctl`, `ovs-ofctl` and `ip`
//! - [`FileStorage`]: volumes and snapshots as directories under a root

pub mod command;
pub mod error;
pub mod ovs;
pub mod storage;

pub use command::{CommandRunner, SystemRunner};
pub use error::{HostError, Result};
pub use ovs::{OvsNetwork, OvsTools};
pub use storage::{FileStorage, VolumeMeta};
