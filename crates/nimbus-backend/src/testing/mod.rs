//! In-memory fakes of every backend capability
//!
//! Each fake records the calls it receives and can be told to fail a given
//! operation, optionally only for one target (a bridge, a container name…).
//! Enabled with the `test-utils` feature.

mod compute;
mod faults;
mod network;
mod proxy;
mod sinks;
mod storage;

pub use compute::FakeCompute;
pub use faults::{Call, CallLog, Faults};
pub use network::{FakeNetwork, FakeVeth};
pub use proxy::FakeProxy;
pub use sinks::{FakeDns, RecordingSink};
pub use storage::FakeStorage;
