use lab_core::{ConfigError, ErrorClass};
use thiserror::Error;

use crate::CreationStage;

/// Failures reported by a hypervisor backend, most specific first.
#[derive(Error, Debug)]
pub enum HypervisorError {
    #[error("Authentication with {backend} failed: {message}")]
    Auth {
        backend: &'static str,
        message: String,
    },

    #[error("Failed to allocate a VM id: {0}")]
    IdAllocation(String),

    #[error("Failed to read template {template}: {message}")]
    TemplateFetch { template: String, message: String },

    #[error("Failed to clone template into VM {vmid}: {message}")]
    Clone { vmid: String, message: String },

    #[error("Failed to configure VM {vmid}: {message}")]
    Configure { vmid: String, message: String },

    #[error("Failed to resize disk of VM {vmid}: {message}")]
    Resize { vmid: String, message: String },

    #[error("Failed to power off VM {vmid}: {message}")]
    PowerOff { vmid: String, message: String },

    #[error("Failed to delete VM {vmid}: {message}")]
    Delete { vmid: String, message: String },

    #[error("VM not found: {0}")]
    NotFound(String),

    #[error("VM already exists: {0}")]
    AlreadyExists(String),

    #[error("Hypervisor unreachable: {0}")]
    Unavailable(String),

    #[error("Unexpected hypervisor response: {0}")]
    Protocol(String),

    #[error("Hypervisor configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Unknown hypervisor '{0}'")]
    Unknown(String),

    #[error("No template configured for OS '{0}'")]
    UnknownTemplate(String),
}

pub type Result<T> = std::result::Result<T, HypervisorError>;

impl HypervisorError {
    pub fn class(&self) -> ErrorClass {
        match self {
            HypervisorError::Auth { .. } => ErrorClass::Auth,
            HypervisorError::IdAllocation(_)
            | HypervisorError::TemplateFetch { .. }
            | HypervisorError::Clone { .. }
            | HypervisorError::Configure { .. }
            | HypervisorError::Resize { .. }
            | HypervisorError::PowerOff { .. }
            | HypervisorError::Delete { .. }
            | HypervisorError::Unavailable(_)
            | HypervisorError::Protocol(_) => ErrorClass::ExternalUnavailable,
            HypervisorError::NotFound(_) => ErrorClass::NotFound,
            HypervisorError::AlreadyExists(_) => ErrorClass::StateConflict,
            HypervisorError::Config(_) => ErrorClass::Internal,
            HypervisorError::Unknown(_) | HypervisorError::UnknownTemplate(_) => {
                ErrorClass::Validation
            }
        }
    }

    /// The VM id of a machine that exists on the hypervisor even though
    /// creation failed (clone succeeded, a later step did not).
    pub fn partial_vmid(&self) -> Option<&str> {
        match self {
            HypervisorError::Configure { vmid, .. } | HypervisorError::Resize { vmid, .. } => {
                Some(vmid)
            }
            _ => None,
        }
    }

    /// Stage the creation had reached when this error stopped it.
    pub fn stage(&self) -> Option<CreationStage> {
        match self {
            HypervisorError::Clone { .. } => Some(CreationStage::IdAllocated),
            HypervisorError::Configure { .. } => Some(CreationStage::Cloned),
            HypervisorError::Resize { .. } => Some(CreationStage::ResourceConfigured),
            _ => None,
        }
    }
}
