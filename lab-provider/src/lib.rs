//! Hypervisor backends behind one capability trait.
//!
//! A backend knows how to list, inspect, create and destroy virtual machines
//! on one kind of control plane. The orchestrator never talks to a control
//! plane directly; it picks a backend from the [`HypervisorRegistry`] by the
//! name stored in the ledger and drives it through [`Hypervisor`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use utoipa::ToSchema;

pub mod error;
mod http;
pub mod proxmox;
pub mod registry;
pub mod resources;
pub mod vcenter;

#[cfg(any(test, feature = "test-helpers"))]
pub mod mock;

pub use error::{HypervisorError, Result};
pub use registry::HypervisorRegistry;
pub use resources::{plan_overrides, ResourceLimits, ResourceOverrides, Resources};

/// Power state as reported by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    Running,
    Stopped,
    Suspended,
    Unknown,
}

impl PowerState {
    /// Map the many spellings backends use (`running`, `POWERED_ON`, ...).
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "running" | "powered_on" => PowerState::Running,
            "stopped" | "powered_off" => PowerState::Stopped,
            "paused" | "suspended" => PowerState::Suspended,
            _ => PowerState::Unknown,
        }
    }
}

/// Live view of one VM, read straight from the hypervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct VmSnapshot {
    pub vmid: String,
    pub name: String,
    pub node: Option<String>,
    pub power_state: PowerState,
    /// Fraction of allotted CPU in use, `0.0..=1.0` where reported.
    pub cpu_usage: Option<f64>,
    pub cpu_count: Option<u32>,
    pub memory_used_bytes: Option<u64>,
    pub memory_max_bytes: Option<u64>,
    pub uptime_secs: Option<u64>,
}

/// Ledger-side facts about a machine, handed to [`Hypervisor::list_for_owner`].
#[derive(Debug, Clone, PartialEq)]
pub struct OwnedMachine {
    pub machine_id: String,
    /// `None` while the creation saga has not reached the hypervisor yet.
    pub vmid: Option<String>,
    pub name: String,
    pub description: String,
    pub os: String,
    pub subdomain: Option<String>,
    pub ip_address: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Ledger metadata joined with the live snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct MachineView {
    pub machine_id: String,
    pub vmid: String,
    pub name: String,
    pub power_state: PowerState,
    pub cpu_usage: Option<f64>,
    pub cpu_count: Option<u32>,
    pub memory_used_bytes: Option<u64>,
    pub memory_max_bytes: Option<u64>,
    pub uptime_secs: Option<u64>,
    pub description: String,
    pub os: String,
    pub subdomain: Option<String>,
    pub ip_address: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl MachineView {
    pub fn join(machine: &OwnedMachine, live: VmSnapshot) -> Self {
        Self {
            machine_id: machine.machine_id.clone(),
            vmid: live.vmid,
            name: machine.name.clone(),
            power_state: live.power_state,
            cpu_usage: live.cpu_usage,
            cpu_count: live.cpu_count,
            memory_used_bytes: live.memory_used_bytes,
            memory_max_bytes: live.memory_max_bytes,
            uptime_secs: live.uptime_secs,
            description: machine.description.clone(),
            os: machine.os.clone(),
            subdomain: machine.subdomain.clone(),
            ip_address: machine.ip_address.clone(),
            expires_at: machine.expires_at,
        }
    }
}

/// Everything a backend needs to materialize one machine.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateSpec {
    pub name: String,
    pub resources: Resources,
    /// Stable subject identifier of the owner.
    pub owner: String,
    pub owner_display_name: String,
    pub description: String,
    pub os: String,
    pub subdomain: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionedVm {
    pub vmid: String,
    /// Resources the machine ended up with: the clamped request, raised to the
    /// template floor where the template was already larger.
    pub resources: Resources,
}

/// Where a creation stood when it stopped. Used in logs and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationStage {
    IdAllocated,
    Cloned,
    ResourceConfigured,
    DiskResized,
    Ready,
}

impl std::fmt::Display for CreationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CreationStage::IdAllocated => "id-allocated",
            CreationStage::Cloned => "cloned",
            CreationStage::ResourceConfigured => "resource-configured",
            CreationStage::DiskResized => "disk-resized",
            CreationStage::Ready => "ready",
        };
        f.write_str(s)
    }
}

/// Capability interface implemented once per control plane.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Registry key, also stored in the ledger (`proxmox`, `vcenter`, ...).
    fn name(&self) -> &'static str;

    fn limits(&self) -> ResourceLimits;

    /// Every VM the backend can see. Partial results are fine when some nodes
    /// fail; an error means nothing answered.
    async fn list_all(&self) -> Result<Vec<VmSnapshot>>;

    async fn status(&self, vmid: &str) -> Result<VmSnapshot>;

    /// Join ledger rows with live state. Machines without a hypervisor id, or
    /// that the hypervisor cannot report on, are skipped and logged. Only an
    /// authentication failure aborts the listing, since then nothing would
    /// ever be returned.
    async fn list_for_owner(&self, machines: &[OwnedMachine], owner: &str) -> Result<Vec<MachineView>> {
        let mut views = Vec::with_capacity(machines.len());

        for machine in machines {
            let Some(vmid) = machine.vmid.as_deref() else {
                continue;
            };

            match self.status(vmid).await {
                Ok(live) => views.push(MachineView::join(machine, live)),
                Err(e @ HypervisorError::Auth { .. }) => return Err(e),
                Err(e) => {
                    warn!(
                        backend = self.name(),
                        owner,
                        vmid,
                        machine_id = %machine.machine_id,
                        "Skipping machine missing from hypervisor: {}",
                        e
                    );
                }
            }
        }

        Ok(views)
    }

    /// Materialize a machine. Requested resources are clamped to
    /// [`limits`](Self::limits) and only ever grow the template.
    async fn create(&self, spec: &CreateSpec) -> Result<ProvisionedVm>;

    /// Push the assigned address into the guest network configuration.
    /// Backends that leave addressing to DHCP reservations keep the no-op.
    async fn bind_address(&self, _vmid: &str, _address: &str) -> Result<()> {
        Ok(())
    }

    /// Power off (forcefully) and delete. A VM the backend no longer knows is
    /// reported as [`HypervisorError::NotFound`].
    async fn destroy(&self, vmid: &str, owner: &str) -> Result<()>;
}
