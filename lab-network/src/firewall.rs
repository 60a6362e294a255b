//! Perimeter firewall access for a machine.
//!
//! Access is a (host object, inbound rule, outbound rule) triple whose names
//! are derived from `(owner, vm name)`, so removal needs no stored state.

mod sophos;

pub use sophos::{FirewallPolicy, SophosConfig, SophosFirewall};

use async_trait::async_trait;
use lab_core::{ConfigError, ErrorClass};
use serde::Serialize;
use std::net::IpAddr;
use thiserror::Error;
use tracing::warn;

pub const NAME_PREFIX: &str = "OICT-AUTO";

#[derive(Error, Debug)]
pub enum FirewallError {
    #[error("Firewall authentication failed: {0}")]
    Auth(String),

    #[error("Firewall unreachable: {0}")]
    Unavailable(String),

    #[error("Firewall rejected {object}: {message} (code {code})")]
    Rejected {
        object: String,
        code: u16,
        message: String,
    },

    #[error("Firewall object already exists: {0}")]
    AlreadyExists(String),

    #[error("No firewall object could be removed for {0}")]
    CloseFailed(String),

    #[error("Firewall policy error: {0}")]
    Policy(String),

    #[error("Firewall configuration error: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, FirewallError>;

impl FirewallError {
    pub fn class(&self) -> ErrorClass {
        match self {
            FirewallError::Auth(_) => ErrorClass::Auth,
            FirewallError::Unavailable(_)
            | FirewallError::Rejected { .. }
            | FirewallError::CloseFailed(_) => ErrorClass::ExternalUnavailable,
            FirewallError::AlreadyExists(_) => ErrorClass::StateConflict,
            FirewallError::Policy(_) | FirewallError::Config(_) => ErrorClass::Internal,
        }
    }
}

/// Object names for one binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BindingNames {
    pub host: String,
    pub inbound: String,
    pub outbound: String,
}

impl BindingNames {
    pub fn new(owner: &str, vm_name: &str) -> Self {
        Self {
            host: format!("{NAME_PREFIX}-HOST-{owner}-{vm_name}"),
            inbound: format!("{NAME_PREFIX}-Inbound-{owner}-{vm_name}"),
            outbound: format!("{NAME_PREFIX}-Outbound-{owner}-{vm_name}"),
        }
    }
}

/// Name of the n-th (1-based) trusted personal address of an owner.
pub fn trusted_host_name(owner: &str, n: usize) -> String {
    format!("{NAME_PREFIX} {owner} Prive {n}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRequest {
    pub address: IpAddr,
    pub owner: String,
    pub vm_name: String,
    /// Personal addresses to add to the trusted host group.
    pub home_ips: Vec<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessGrant {
    pub names: BindingNames,
    /// Trusted addresses that could not be registered, with the reason.
    /// These never fail the grant.
    pub trusted_failures: Vec<(IpAddr, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovalOutcome {
    Removed,
    /// The controller had no such object.
    Absent,
    Failed(String),
}

/// Result of the three removal calls behind `close_access`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReport {
    pub names: BindingNames,
    pub inbound: RemovalOutcome,
    pub outbound: RemovalOutcome,
    pub host: RemovalOutcome,
}

impl CloseReport {
    fn outcomes(&self) -> [(&str, &RemovalOutcome); 3] {
        [
            (self.names.inbound.as_str(), &self.inbound),
            (self.names.outbound.as_str(), &self.outbound),
            (self.names.host.as_str(), &self.host),
        ]
    }

    /// Fold the three outcomes into one verdict: failure only when nothing
    /// was removed and at least one call failed outright.
    pub fn into_result(self) -> Result<CloseReport> {
        let removed = self
            .outcomes()
            .iter()
            .any(|(_, outcome)| **outcome == RemovalOutcome::Removed);

        let failures: Vec<String> = self
            .outcomes()
            .iter()
            .filter_map(|(name, outcome)| match outcome {
                RemovalOutcome::Failed(reason) => Some(format!("{}: {}", name, reason)),
                _ => None,
            })
            .collect();

        if failures.is_empty() {
            return Ok(self);
        }
        if removed {
            warn!(
                host = %self.names.host,
                "Firewall binding partially removed: {}",
                failures.join("; ")
            );
            return Ok(self);
        }

        Err(FirewallError::CloseFailed(failures.join("; ")))
    }
}

/// Capability interface for the perimeter firewall.
#[async_trait]
pub trait Firewall: Send + Sync {
    /// Create host, inbound and outbound rule, add both rules to the managed
    /// group, then register the trusted personal addresses.
    ///
    /// On error some of the triple may exist; callers repair it with
    /// [`close_access`](Self::close_access).
    async fn open_access(&self, request: &AccessRequest) -> Result<AccessGrant>;

    /// Remove both rules, then the host. Safe to call repeatedly.
    async fn close_access(&self, owner: &str, vm_name: &str) -> Result<CloseReport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(inbound: RemovalOutcome, outbound: RemovalOutcome, host: RemovalOutcome) -> CloseReport {
        CloseReport {
            names: BindingNames::new("u1", "web1"),
            inbound,
            outbound,
            host,
        }
    }

    #[test]
    fn test_binding_names_embed_owner_and_vm() {
        let names = BindingNames::new("u1", "web1");
        assert_eq!(names.host, "OICT-AUTO-HOST-u1-web1");
        assert_eq!(names.inbound, "OICT-AUTO-Inbound-u1-web1");
        assert_eq!(names.outbound, "OICT-AUTO-Outbound-u1-web1");
        assert_eq!(trusted_host_name("u1", 2), "OICT-AUTO u1 Prive 2");
    }

    #[test]
    fn test_all_absent_is_success() {
        use RemovalOutcome::Absent;
        assert!(report(Absent, Absent, Absent).into_result().is_ok());
    }

    #[test]
    fn test_partial_removal_is_success() {
        use RemovalOutcome::*;
        let result = report(Removed, Failed("timeout".into()), Absent).into_result();
        assert!(result.is_ok());
    }

    #[test]
    fn test_failure_without_any_removal_is_error() {
        use RemovalOutcome::*;
        let err = report(Failed("timeout".into()), Absent, Absent)
            .into_result()
            .unwrap_err();
        assert!(err.to_string().contains("OICT-AUTO-Inbound-u1-web1"));
        assert_eq!(err.class(), ErrorClass::ExternalUnavailable);
    }
}
