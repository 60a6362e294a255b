//! Adapters for the network side of a machine: perimeter firewall access
//! and DNS records.
//!
//! Both are capability traits ([`Firewall`], [`DnsController`]) with one
//! controller implementation each and in-memory doubles behind the
//! `test-helpers` feature.

pub mod dns;
pub mod firewall;

#[cfg(any(test, feature = "test-helpers"))]
pub mod mock;

pub use dns::{DnsController, DnsError, DnsRecord, RecordType, RecordValue, Zone};
pub use firewall::{AccessGrant, AccessRequest, BindingNames, CloseReport, Firewall, FirewallError, RemovalOutcome};

pub(crate) fn build_client(verify_tls: bool, timeout: std::time::Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(!verify_tls)
        .user_agent(concat!("lab-network/", env!("CARGO_PKG_VERSION")))
        .build()
}
