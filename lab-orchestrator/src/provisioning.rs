//! The provisioning and teardown workflows.
//!
//! Creation runs these steps in order, recording each completed one in a
//! [`ProvisioningAttempt`]:
//!
//! 1. validate the request (quota, unique name, resource floors, expiry)
//! 2. reserve a `pending` ledger row
//! 3. create the VM on the selected hypervisor
//! 4. claim an IP address and assign it to the machine
//! 5. bind the address on the hypervisor and in the ledger
//! 6. open firewall access
//! 7. publish the default `A` record when a subdomain and zone are known
//! 8. mark the row `active`
//!
//! On the first failure every recorded step is compensated newest first,
//! best-effort, and the caller gets the original error. Teardown runs the
//! mirror image with the ledger as the authority on whether to proceed.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lab_core::validation::{normalize_subdomain, parse_ip, validate_machine_name, validate_subdomain};
use lab_core::ValidationError;
use lab_network::dns::PublishedRecord;
use lab_network::{AccessRequest, DnsController, Firewall, Zone};
use lab_provider::{
    CreateSpec, Hypervisor, HypervisorError, HypervisorRegistry, MachineView, Resources, VmSnapshot,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{OrchestratorError, PoolError, Result};
use crate::machine::{Caller, Machine, MachineLedger, MachineState, NewMachine};
use crate::names::{NameRecord, NameService, RecordRequest};
use crate::operation::{OperationLog, OperationType};
use crate::pool::AddressPool;
use crate::saga::{bounded, CompletedStep, ProvisioningAttempt};

#[derive(Debug, Clone)]
pub struct ProvisionerSettings {
    pub max_machines_per_owner: u32,
    /// Requests below any of these figures are rejected.
    pub min_resources: Resources,
    /// Deadline for each external call.
    pub request_timeout: Duration,
    /// Managed suffix appended to every user subdomain.
    pub domain_suffix: Option<String>,
    /// Zone for the record published when a machine is created with a
    /// subdomain. No record is published when unset.
    pub default_zone: Option<String>,
    /// Lifetime of a machine whose request names no expiry.
    pub default_lifetime: ChronoDuration,
    /// A `pending` row untouched for this long belongs to a create that
    /// never finished and may be torn down.
    pub pending_grace: ChronoDuration,
}

impl Default for ProvisionerSettings {
    fn default() -> Self {
        Self {
            max_machines_per_owner: 2,
            min_resources: Resources::new(1, 1, 1),
            request_timeout: Duration::from_secs(120),
            domain_suffix: None,
            default_zone: None,
            default_lifetime: ChronoDuration::weeks(24),
            pending_grace: ChronoDuration::minutes(15),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CreateMachineRequest {
    pub name: String,
    pub memory_mb: u64,
    pub cpu_cores: u32,
    pub disk_gb: u64,
    #[serde(default)]
    pub description: String,
    pub os: String,
    pub subdomain: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Hypervisor backend; the default one when omitted.
    pub backend: Option<String>,
    /// Personal addresses to add to the trusted host group.
    #[serde(default)]
    pub home_ips: Vec<String>,
}

/// A request that passed validation.
struct Plan {
    name: String,
    resources: Resources,
    subdomain: Option<String>,
    expires_at: DateTime<Utc>,
    home_ips: Vec<IpAddr>,
}

#[derive(Clone)]
pub struct Provisioner {
    ledger: MachineLedger,
    addresses: AddressPool,
    names: NameService,
    operations: OperationLog,
    hypervisors: HypervisorRegistry,
    firewall: Arc<dyn Firewall>,
    settings: ProvisionerSettings,
}

impl Provisioner {
    pub fn new(
        pool: SqlitePool,
        hypervisors: HypervisorRegistry,
        firewall: Arc<dyn Firewall>,
        dns: Arc<dyn DnsController>,
        settings: ProvisionerSettings,
    ) -> Self {
        Self {
            ledger: MachineLedger::new(pool.clone()),
            addresses: AddressPool::new(pool.clone()),
            names: NameService::new(
                pool.clone(),
                dns,
                settings.domain_suffix.clone(),
                settings.request_timeout,
            ),
            operations: OperationLog::new(pool),
            hypervisors,
            firewall,
            settings,
        }
    }

    pub fn ledger(&self) -> &MachineLedger {
        &self.ledger
    }

    pub fn addresses(&self) -> &AddressPool {
        &self.addresses
    }

    pub fn names(&self) -> &NameService {
        &self.names
    }

    pub fn operations(&self) -> &OperationLog {
        &self.operations
    }

    pub fn hypervisors(&self) -> &HypervisorRegistry {
        &self.hypervisors
    }

    pub fn settings(&self) -> &ProvisionerSettings {
        &self.settings
    }

    /// A machine the caller may see. Machines of other owners are reported
    /// as missing.
    pub async fn get_machine(&self, caller: &Caller, id: &str) -> Result<Machine> {
        let machine = self.ledger.get(id).await?;
        if !caller.can_access(&machine) {
            return Err(OrchestratorError::NotFound(format!("machine {}", id)));
        }
        Ok(machine)
    }

    /// Ledger rows: the caller's own, or every row for an admin.
    pub async fn list_ledger(&self, caller: &Caller) -> Result<Vec<Machine>> {
        if caller.is_admin {
            self.ledger.list_all().await
        } else {
            self.ledger.list_for_owner(&caller.subject).await
        }
    }

    /// The caller's machines joined with live hypervisor state. Machines the
    /// hypervisor cannot report on are left out.
    pub async fn list_machines(&self, caller: &Caller) -> Result<Vec<MachineView>> {
        let mut by_backend: BTreeMap<String, Vec<_>> = BTreeMap::new();
        for machine in self.ledger.list_for_owner(&caller.subject).await? {
            by_backend
                .entry(machine.backend.clone())
                .or_default()
                .push(machine.owned());
        }

        let mut views = Vec::new();
        for (backend, machines) in by_backend {
            let hypervisor = match self.hypervisors.get(&backend) {
                Ok(hypervisor) => hypervisor,
                Err(e) => {
                    warn!(backend = %backend, owner = %caller.subject, "Skipping machines of a disabled backend: {}", e);
                    continue;
                }
            };

            let found = bounded(
                "hypervisor list",
                self.settings.request_timeout,
                hypervisor.list_for_owner(&machines, &caller.subject),
            )
            .await?;
            views.extend(found);
        }

        Ok(views)
    }

    /// Every VM one backend can see (admin view).
    pub async fn list_all_vms(&self, backend: Option<&str>) -> Result<Vec<VmSnapshot>> {
        let hypervisor = self.hypervisors.resolve(backend)?;
        bounded("hypervisor list", self.settings.request_timeout, hypervisor.list_all()).await
    }

    /// Machines due for teardown: expired ones, then `pending` rows left
    /// behind by a create that never finished.
    pub async fn expired_machines(&self, now: DateTime<Utc>) -> Result<Vec<Machine>> {
        let mut due = self.ledger.expired(now).await?;
        due.extend(self.ledger.abandoned(now - self.settings.pending_grace).await?);
        Ok(due)
    }

    #[instrument(skip(self, caller, request), fields(owner = %caller.subject, name = %request.name))]
    pub async fn create_machine(&self, caller: &Caller, request: CreateMachineRequest) -> Result<Machine> {
        let hypervisor = self.hypervisors.resolve(request.backend.as_deref())?;
        let plan = self.validate(caller, &request, hypervisor.as_ref()).await?;

        let machine_id = Uuid::new_v4().to_string();
        let operation = self
            .start_operation(&machine_id, &caller.subject, OperationType::Create)
            .await;

        let mut attempt = ProvisioningAttempt::new(&machine_id);
        let result = self
            .run_create(&mut attempt, caller, &request, &plan, hypervisor.as_ref())
            .await;

        match result {
            Ok(machine) => {
                self.finish_operation(operation, None).await;
                info!(machine_id = %machine.id, vmid = ?machine.vmid, "Machine provisioned");
                Ok(machine)
            }
            Err(e) => {
                error!(
                    machine_id = %machine_id,
                    steps = attempt.steps().len(),
                    "Provisioning failed, compensating: {}",
                    e
                );
                self.compensate(attempt, hypervisor.as_ref(), &caller.subject).await;
                self.finish_operation(operation, Some(&e)).await;
                Err(e)
            }
        }
    }

    async fn validate(
        &self,
        caller: &Caller,
        request: &CreateMachineRequest,
        hypervisor: &dyn Hypervisor,
    ) -> Result<Plan> {
        let name = request.name.trim().to_string();
        validate_machine_name(&name)?;

        if request.os.trim().is_empty() {
            return Err(ValidationError::new("Operating system is required").into());
        }

        let floor = self.settings.min_resources;
        if request.memory_mb < floor.memory_mb
            || request.cpu_cores < floor.cpu_cores
            || request.disk_gb < floor.disk_gb
        {
            return Err(ValidationError::new(format!(
                "Resources must be at least {} MB memory, {} cores and {} GB disk",
                floor.memory_mb, floor.cpu_cores, floor.disk_gb
            ))
            .into());
        }

        let expires_at = request
            .expires_at
            .unwrap_or_else(|| Utc::now() + self.settings.default_lifetime);
        if expires_at <= Utc::now() {
            return Err(ValidationError::new("Expiry date must be in the future").into());
        }

        let subdomain = match request.subdomain.as_deref().map(normalize_subdomain) {
            Some(subdomain) if !subdomain.is_empty() => {
                validate_subdomain(&subdomain)?;
                Some(subdomain)
            }
            _ => None,
        };

        let home_ips = request
            .home_ips
            .iter()
            .map(|raw| parse_ip(raw))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let owned = self.ledger.count_for_owner(&caller.subject).await?;
        if owned >= self.settings.max_machines_per_owner {
            return Err(OrchestratorError::QuotaExceeded(format!(
                "you already have {} machines",
                owned
            )));
        }

        if self.ledger.name_taken(&caller.subject, &name).await? {
            return Err(ValidationError::new(format!("A machine named '{}' already exists", name)).into());
        }

        let requested = Resources::new(request.memory_mb, request.cpu_cores, request.disk_gb);
        let resources = hypervisor.limits().clamp(requested);
        if resources != requested {
            info!(?requested, ?resources, "Requested resources clamped to backend limits");
        }

        Ok(Plan {
            name,
            resources,
            subdomain,
            expires_at,
            home_ips,
        })
    }

    async fn run_create(
        &self,
        attempt: &mut ProvisioningAttempt,
        caller: &Caller,
        request: &CreateMachineRequest,
        plan: &Plan,
        hypervisor: &dyn Hypervisor,
    ) -> Result<Machine> {
        let timeout = self.settings.request_timeout;
        let machine_id = attempt.machine_id().to_string();

        let new_machine = NewMachine {
            id: machine_id.clone(),
            owner: caller.subject.clone(),
            owner_display_name: caller.display_name.clone(),
            name: plan.name.clone(),
            description: request.description.clone(),
            os: request.os.clone(),
            backend: hypervisor.name().to_string(),
            resources: plan.resources,
            subdomain: plan.subdomain.clone(),
            expires_at: plan.expires_at,
        };
        self.ledger
            .reserve(&new_machine, self.settings.max_machines_per_owner)
            .await?;
        attempt.record(CompletedStep::LedgerReserved);

        let spec = CreateSpec {
            name: plan.name.clone(),
            resources: plan.resources,
            owner: caller.subject.clone(),
            owner_display_name: caller.display_name.clone(),
            description: request.description.clone(),
            os: request.os.clone(),
            subdomain: plan.subdomain.clone(),
        };
        let vm = match bounded("hypervisor create", timeout, hypervisor.create(&spec)).await {
            Ok(vm) => vm,
            Err(e) => {
                if let OrchestratorError::Hypervisor(inner) = &e {
                    if let Some(vmid) = inner.partial_vmid() {
                        warn!(vmid, stage = ?inner.stage(), "Creation left a partial VM behind");
                        attempt.record(CompletedStep::MachineCreated {
                            vmid: vmid.to_string(),
                        });
                    }
                }
                return Err(e);
            }
        };
        attempt.record(CompletedStep::MachineCreated {
            vmid: vm.vmid.clone(),
        });
        self.ledger.set_vmid(&machine_id, &vm.vmid).await?;

        let claim = self.addresses.claim().await?;
        attempt.record(CompletedStep::AddressClaimed {
            address: claim.address.clone(),
        });
        self.addresses.assign(&claim, &machine_id).await?;
        bounded(
            "hypervisor bind address",
            timeout,
            hypervisor.bind_address(&vm.vmid, &claim.address),
        )
        .await?;
        self.ledger.set_address(&machine_id, &claim.address).await?;

        let address = parse_ip(&claim.address)?;
        attempt.record(CompletedStep::AccessOpened {
            owner: caller.subject.clone(),
            vm_name: plan.name.clone(),
        });
        let grant = bounded(
            "firewall open access",
            timeout,
            self.firewall.open_access(&AccessRequest {
                address,
                owner: caller.subject.clone(),
                vm_name: plan.name.clone(),
                home_ips: plan.home_ips.clone(),
            }),
        )
        .await?;
        for (ip, reason) in &grant.trusted_failures {
            warn!(machine_id = %machine_id, %ip, "Trusted address not registered: {}", reason);
        }

        if let (Some(subdomain), Some(zone)) = (&plan.subdomain, &self.settings.default_zone) {
            let record_type = if address.is_ipv4() { "A" } else { "AAAA" };
            let record = self
                .names
                .create_record(
                    &machine_id,
                    &RecordRequest {
                        zone: zone.clone(),
                        subdomain: subdomain.clone(),
                        record_type: record_type.to_string(),
                        value: claim.address.clone(),
                        ttl: None,
                    },
                )
                .await?;
            attempt.record(CompletedStep::RecordPublished {
                record_id: record.id,
            });
        }

        self.ledger.set_state(&machine_id, MachineState::Active).await?;
        self.ledger.get(&machine_id).await
    }

    /// Undo completed steps newest first. Failures are logged and do not
    /// stop the remaining compensations.
    async fn compensate(&self, attempt: ProvisioningAttempt, hypervisor: &dyn Hypervisor, owner: &str) {
        let timeout = self.settings.request_timeout;
        let machine_id = attempt.machine_id().to_string();

        for step in attempt.into_compensation_order() {
            let outcome = match &step {
                CompletedStep::RecordPublished { record_id } => {
                    match self.names.delete_record_by_id(record_id).await {
                        Err(OrchestratorError::NotFound(_)) => Ok(()),
                        other => other,
                    }
                }
                CompletedStep::AccessOpened { owner, vm_name } => bounded(
                    "firewall close access",
                    timeout,
                    self.firewall.close_access(owner, vm_name),
                )
                .await
                .map(|_| ()),
                CompletedStep::AddressClaimed { address } => {
                    self.addresses.release(address).await.map_err(Into::into)
                }
                CompletedStep::MachineCreated { vmid } => self.destroy_vm(hypervisor, vmid, owner).await,
                CompletedStep::LedgerReserved => self.ledger.delete(&machine_id).await.map(|_| ()),
            };

            match outcome {
                Ok(()) => info!(machine_id = %machine_id, step = %step, "Compensated: {}", step.compensation()),
                Err(e) => error!(
                    machine_id = %machine_id,
                    step = %step,
                    "Compensation '{}' failed, manual cleanup needed: {}",
                    step.compensation(),
                    e
                ),
            }
        }
    }

    /// Destroy a VM, treating one the hypervisor no longer knows as gone.
    async fn destroy_vm(&self, hypervisor: &dyn Hypervisor, vmid: &str, owner: &str) -> Result<()> {
        match bounded(
            "hypervisor destroy",
            self.settings.request_timeout,
            hypervisor.destroy(vmid, owner),
        )
        .await
        {
            Err(OrchestratorError::Hypervisor(HypervisorError::NotFound(_))) => {
                info!(vmid, "VM already absent from the hypervisor");
                Ok(())
            }
            other => other,
        }
    }

    /// Tear a machine down: DNS records (best-effort), firewall access, ledger
    /// row, IP address, then the VM itself.
    #[instrument(skip(self, caller), fields(caller = %caller.subject))]
    pub async fn delete_machine(&self, caller: &Caller, id: &str) -> Result<()> {
        let machine = self.get_machine(caller, id).await?;
        if machine.state == MachineState::Pending
            && machine.updated_at > Utc::now() - self.settings.pending_grace
        {
            return Err(OrchestratorError::InvalidState(format!(
                "machine {} is still being created",
                id
            )));
        }
        let hypervisor = self.hypervisors.get(&machine.backend)?;

        let operation = self
            .start_operation(&machine.id, &machine.owner, OperationType::Delete)
            .await;
        let result = self.run_delete(&machine, hypervisor.as_ref()).await;

        match &result {
            Ok(()) => info!(machine_id = %machine.id, "Machine deleted"),
            Err(e) => error!(machine_id = %machine.id, "Machine deletion failed: {}", e),
        }
        self.finish_operation(operation, result.as_ref().err()).await;
        result
    }

    async fn run_delete(&self, machine: &Machine, hypervisor: &dyn Hypervisor) -> Result<()> {
        self.ledger.set_state(&machine.id, MachineState::Deleting).await?;

        let failures = self.names.delete_all_for_machine(&machine.id).await?;
        if !failures.is_empty() {
            warn!(
                machine_id = %machine.id,
                failed = failures.len(),
                "Some DNS records could not be removed from the controller"
            );
        }

        bounded(
            "firewall close access",
            self.settings.request_timeout,
            self.firewall.close_access(&machine.owner, &machine.name),
        )
        .await?;

        self.ledger.delete(&machine.id).await?;

        if let Some(address) = self.assigned_address(machine).await? {
            self.addresses.release(&address).await?;
        }

        if let Some(vmid) = &machine.vmid {
            self.destroy_vm(hypervisor, vmid, &machine.owner).await?;
        }

        Ok(())
    }

    /// The machine's address, from the ledger row or, when a create stopped
    /// before recording it there, from the pool.
    async fn assigned_address(&self, machine: &Machine) -> Result<Option<String>> {
        if let Some(address) = &machine.ip_address {
            return Ok(Some(address.clone()));
        }
        match self.addresses.lookup(&machine.id).await {
            Ok(allocation) => Ok(Some(allocation.address)),
            Err(PoolError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn create_record(
        &self,
        caller: &Caller,
        machine_id: &str,
        request: &RecordRequest,
    ) -> Result<NameRecord> {
        self.get_machine(caller, machine_id).await?;
        self.names.create_record(machine_id, request).await
    }

    pub async fn list_records(&self, caller: &Caller, machine_id: &str) -> Result<Vec<NameRecord>> {
        self.get_machine(caller, machine_id).await?;
        self.names.list_records(machine_id).await
    }

    /// A record the caller may touch, through the machine that owns it.
    async fn owned_record(&self, caller: &Caller, record_id: &str) -> Result<NameRecord> {
        let record = self.names.get_record(record_id).await?;
        self.get_machine(caller, &record.machine_id)
            .await
            .map_err(|_| OrchestratorError::NotFound(format!("record {}", record_id)))?;
        Ok(record)
    }

    pub async fn update_record(
        &self,
        caller: &Caller,
        record_id: &str,
        request: &RecordRequest,
    ) -> Result<NameRecord> {
        self.owned_record(caller, record_id).await?;
        self.names.update_record(record_id, request).await
    }

    pub async fn delete_record(&self, caller: &Caller, record_id: &str) -> Result<()> {
        let record = self.owned_record(caller, record_id).await?;
        self.names
            .delete_record(&record.zone, &record.subdomain, record.record_type, &record.value)
            .await
    }

    pub async fn live_records(&self, caller: &Caller, record_id: &str) -> Result<Vec<PublishedRecord>> {
        let record = self.owned_record(caller, record_id).await?;
        self.names.live_records(&record).await
    }

    pub async fn list_zones(&self) -> Result<Vec<Zone>> {
        self.names.list_zones().await
    }

    async fn start_operation(&self, machine_id: &str, owner: &str, operation_type: OperationType) -> Option<String> {
        match self.operations.start(machine_id, owner, operation_type).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(machine_id, "Failed to record operation start: {}", e);
                None
            }
        }
    }

    async fn finish_operation(&self, operation: Option<String>, error: Option<&OrchestratorError>) {
        let Some(id) = operation else {
            return;
        };
        let message = error.map(ToString::to_string);
        if let Err(e) = self.operations.finish(&id, message.as_deref()).await {
            warn!(operation_id = %id, "Failed to record operation result: {}", e);
        }
    }
}
