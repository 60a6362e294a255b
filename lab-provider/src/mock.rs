//! In-memory hypervisor for tests.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::{HypervisorError, Result};
use crate::resources::{plan_overrides, ResourceOverrides};
use crate::{
    CreateSpec, Hypervisor, PowerState, ProvisionedVm, ResourceLimits, Resources, VmSnapshot,
};

#[derive(Default)]
struct MockState {
    next_id: u32,
    vms: BTreeMap<String, (CreateSpec, Resources)>,
    created: Vec<CreateSpec>,
    overrides: Vec<ResourceOverrides>,
    destroyed: Vec<String>,
    bound: Vec<(String, String)>,
    fail_create: Option<HypervisorError>,
    fail_bind: Option<HypervisorError>,
    fail_destroy: Option<HypervisorError>,
}

pub struct MockHypervisor {
    name: &'static str,
    limits: ResourceLimits,
    template: Resources,
    state: Mutex<MockState>,
}

impl Default for MockHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self::named("mock")
    }

    pub fn named(name: &'static str) -> Self {
        Self {
            name,
            limits: ResourceLimits::default(),
            template: Resources::new(1024, 2, 20),
            state: Mutex::new(MockState {
                next_id: 100,
                ..Default::default()
            }),
        }
    }

    pub fn with_template(mut self, template: Resources) -> Self {
        self.template = template;
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The next `create` fails with `error`.
    pub fn fail_next_create(&self, error: HypervisorError) {
        self.state().fail_create = Some(error);
    }

    pub fn fail_next_bind(&self, error: HypervisorError) {
        self.state().fail_bind = Some(error);
    }

    pub fn fail_next_destroy(&self, error: HypervisorError) {
        self.state().fail_destroy = Some(error);
    }

    /// Drop a VM behind the ledger's back.
    pub fn remove_out_of_band(&self, vmid: &str) {
        self.state().vms.remove(vmid);
    }

    pub fn exists(&self, vmid: &str) -> bool {
        self.state().vms.contains_key(vmid)
    }

    pub fn vm_count(&self) -> usize {
        self.state().vms.len()
    }

    pub fn created(&self) -> Vec<CreateSpec> {
        self.state().created.clone()
    }

    pub fn overrides(&self) -> Vec<ResourceOverrides> {
        self.state().overrides.clone()
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.state().destroyed.clone()
    }

    pub fn bound_addresses(&self) -> Vec<(String, String)> {
        self.state().bound.clone()
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    fn name(&self) -> &'static str {
        self.name
    }

    fn limits(&self) -> ResourceLimits {
        self.limits
    }

    async fn list_all(&self) -> Result<Vec<VmSnapshot>> {
        let state = self.state();
        Ok(state
            .vms
            .iter()
            .map(|(vmid, (spec, resources))| snapshot(vmid, spec, resources))
            .collect())
    }

    async fn status(&self, vmid: &str) -> Result<VmSnapshot> {
        let state = self.state();
        state
            .vms
            .get(vmid)
            .map(|(spec, resources)| snapshot(vmid, spec, resources))
            .ok_or_else(|| HypervisorError::NotFound(vmid.to_string()))
    }

    async fn create(&self, spec: &CreateSpec) -> Result<ProvisionedVm> {
        let mut state = self.state();
        state.created.push(spec.clone());

        if let Some(error) = state.fail_create.take() {
            if let Some(vmid) = error.partial_vmid() {
                state.vms.insert(vmid.to_string(), (spec.clone(), self.template));
            }
            return Err(error);
        }

        let overrides = plan_overrides(self.template, self.limits.clamp(spec.resources));
        let resources = overrides.effective(self.template);
        state.overrides.push(overrides);

        let vmid = state.next_id.to_string();
        state.next_id += 1;
        state.vms.insert(vmid.clone(), (spec.clone(), resources));

        Ok(ProvisionedVm { vmid, resources })
    }

    async fn bind_address(&self, vmid: &str, address: &str) -> Result<()> {
        let mut state = self.state();
        if let Some(error) = state.fail_bind.take() {
            return Err(error);
        }
        state.bound.push((vmid.to_string(), address.to_string()));
        Ok(())
    }

    async fn destroy(&self, vmid: &str, _owner: &str) -> Result<()> {
        let mut state = self.state();
        state.destroyed.push(vmid.to_string());

        if let Some(error) = state.fail_destroy.take() {
            return Err(error);
        }

        match state.vms.remove(vmid) {
            Some(_) => Ok(()),
            None => Err(HypervisorError::NotFound(vmid.to_string())),
        }
    }
}

fn snapshot(vmid: &str, spec: &CreateSpec, resources: &Resources) -> VmSnapshot {
    VmSnapshot {
        vmid: vmid.to_string(),
        name: spec.name.clone(),
        node: Some("mock-node".to_string()),
        power_state: PowerState::Running,
        cpu_usage: Some(0.0),
        cpu_count: Some(resources.cpu_cores),
        memory_used_bytes: Some(0),
        memory_max_bytes: Some(resources.memory_mb * 1024 * 1024),
        uptime_secs: Some(0),
    }
}
