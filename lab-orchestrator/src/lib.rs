//! Machine provisioning business logic.
//!
//! This crate owns the SQLite ledger (machines, IP pool, DNS records,
//! operations) and the workflows that keep it consistent with the
//! hypervisor, firewall and DNS controllers. It is consumed by the
//! `lab-api` HTTP service and its expiry janitor.

pub mod db;
pub mod error;
pub mod machine;
pub mod names;
pub mod operation;
pub mod pool;
pub mod provisioning;
pub mod saga;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use error::{OrchestratorError, PoolError, Result};
pub use machine::{Caller, Machine, MachineLedger, MachineState};
pub use names::{NameRecord, NameService, RecordRequest};
pub use operation::{Operation, OperationFilters, OperationLog, OperationStatus, OperationType};
pub use pool::{AddressPool, AddressState, Claim, IpAllocation, SeedReport};
pub use provisioning::{CreateMachineRequest, Provisioner, ProvisionerSettings};
pub use saga::{CompletedStep, ProvisioningAttempt};
