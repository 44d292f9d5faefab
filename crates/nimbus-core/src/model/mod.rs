//! Domain model
//!
//! One module per aggregate. Records are plain data: services own the
//! transitions, the repository owns persistence and uniqueness.

mod activity;
mod cluster;
mod function;
mod instance;
mod load_balancer;
mod peering;
mod quota;
mod secret;
mod security_group;
mod stack;
mod subnet;
mod volume;
mod vpc;

// Re-exports
pub use activity::*;
pub use cluster::*;
pub use function::*;
pub use instance::*;
pub use load_balancer::*;
pub use peering::*;
pub use quota::*;
pub use secret::*;
pub use security_group::*;
pub use stack::*;
pub use subnet::*;
pub use volume::*;
pub use vpc::*;

/// Implements `Display` for a unit-only status enum using its wire spelling
macro_rules! status_display {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $($ty::$variant => write!(f, $text),)+
                }
            }
        }
    };
}
pub(crate) use status_display;
