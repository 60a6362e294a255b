//! Bookkeeping for one create attempt.
//!
//! Each forward step that leaves something behind in an external system or
//! the ledger is recorded as it completes. When a later step fails the
//! recorded steps are undone newest first. The attempt lives only as long
//! as the call that owns it.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use crate::error::OrchestratorError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletedStep {
    LedgerReserved,
    MachineCreated { vmid: String },
    AddressClaimed { address: String },
    /// Recorded before `open_access` returns, so a half-built firewall
    /// binding is torn down too.
    AccessOpened { owner: String, vm_name: String },
    RecordPublished { record_id: String },
}

impl CompletedStep {
    /// Name of the compensating action, for logs.
    pub fn compensation(&self) -> &'static str {
        match self {
            CompletedStep::LedgerReserved => "delete ledger row",
            CompletedStep::MachineCreated { .. } => "destroy VM",
            CompletedStep::AddressClaimed { .. } => "release IP",
            CompletedStep::AccessOpened { .. } => "close firewall access",
            CompletedStep::RecordPublished { .. } => "delete DNS record",
        }
    }
}

impl fmt::Display for CompletedStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletedStep::LedgerReserved => f.write_str("ledger-reserved"),
            CompletedStep::MachineCreated { vmid } => write!(f, "machine-created({})", vmid),
            CompletedStep::AddressClaimed { address } => write!(f, "address-claimed({})", address),
            CompletedStep::AccessOpened { owner, vm_name } => {
                write!(f, "access-opened({}/{})", owner, vm_name)
            }
            CompletedStep::RecordPublished { record_id } => {
                write!(f, "record-published({})", record_id)
            }
        }
    }
}

#[derive(Debug)]
pub struct ProvisioningAttempt {
    machine_id: String,
    steps: Vec<CompletedStep>,
}

impl ProvisioningAttempt {
    pub fn new(machine_id: impl Into<String>) -> Self {
        Self {
            machine_id: machine_id.into(),
            steps: Vec::new(),
        }
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn record(&mut self, step: CompletedStep) {
        self.steps.push(step);
    }

    pub fn steps(&self) -> &[CompletedStep] {
        &self.steps
    }

    /// Completed steps in the order they must be undone.
    pub fn into_compensation_order(self) -> impl Iterator<Item = CompletedStep> {
        self.steps.into_iter().rev()
    }
}

/// Run one external call under the per-step deadline.
pub(crate) async fn bounded<T, E, F>(
    step: &'static str,
    limit: Duration,
    call: F,
) -> Result<T, OrchestratorError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<OrchestratorError>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(OrchestratorError::Timeout { step, after: limit }),
    }
}
