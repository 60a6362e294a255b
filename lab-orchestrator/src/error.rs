use lab_core::{ErrorClass, ValidationError};
use lab_network::{DnsError, FirewallError};
use lab_provider::HypervisorError;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Failures of the address pool.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("No free IP address left in the pool")]
    Exhausted,

    #[error("IP address {address} is {state}, expected it claimed by this request")]
    InvalidState { address: String, state: String },

    #[error("No IP address assigned to machine {0}")]
    NotFound(String),

    #[error("Invalid IP address: {0}")]
    InvalidAddress(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl PoolError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PoolError::Exhausted | PoolError::InvalidState { .. } => ErrorClass::StateConflict,
            PoolError::NotFound(_) => ErrorClass::NotFound,
            PoolError::InvalidAddress(_) => ErrorClass::Validation,
            PoolError::Database(_) => ErrorClass::Internal,
        }
    }
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Domain {0} is already in use by another machine")]
    DomainInUse(String),

    #[error("Record already exists: {0}")]
    DuplicateRecord(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    #[error(transparent)]
    Firewall(#[from] FirewallError),

    #[error(transparent)]
    Dns(#[from] DnsError),

    #[error("{step} did not finish within {}s", .after.as_secs())]
    Timeout { step: &'static str, after: Duration },
}

impl OrchestratorError {
    pub fn class(&self) -> ErrorClass {
        match self {
            OrchestratorError::Database(_)
            | OrchestratorError::Migration(_)
            | OrchestratorError::Io(_) => ErrorClass::Internal,
            OrchestratorError::Validation(_)
            | OrchestratorError::QuotaExceeded(_)
            | OrchestratorError::DomainInUse(_) => ErrorClass::Validation,
            OrchestratorError::NotFound(_) => ErrorClass::NotFound,
            OrchestratorError::DuplicateRecord(_)
            | OrchestratorError::Conflict(_)
            | OrchestratorError::InvalidState(_) => ErrorClass::StateConflict,
            OrchestratorError::Pool(e) => e.class(),
            OrchestratorError::Hypervisor(e) => e.class(),
            OrchestratorError::Firewall(e) => e.class(),
            OrchestratorError::Dns(e) => e.class(),
            OrchestratorError::Timeout { .. } => ErrorClass::ExternalUnavailable,
        }
    }
}

/// True when `error` is a SQLite uniqueness violation.
pub(crate) fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.is_unique_violation())
}
