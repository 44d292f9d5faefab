//! Private DNS for nimbus
//!
//! [`DnsClient`] registers instance A records through an HTTP DNS API and
//! implements [`nimbus_backend::DnsRegistrar`].

pub mod client;
pub mod error;

pub use client::{DnsClient, DnsConfig, DnsRecord};
pub use error::{DnsError, Result};
