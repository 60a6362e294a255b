//! In-memory firewall and DNS controller for tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};

use crate::dns::{self, DnsController, DnsError, DnsRecord, PublishedRecord, Zone};
use crate::firewall::{
    self, trusted_host_name, AccessGrant, AccessRequest, BindingNames, CloseReport, Firewall,
    FirewallError, RemovalOutcome,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Which call of `open_access` should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFailure {
    Host,
    /// Host and outbound rule are created, inbound fails.
    InboundRule,
    Group,
}

#[derive(Default)]
struct FirewallState {
    /// Object name to address (hosts) or host name (rules).
    objects: BTreeMap<String, String>,
    trusted: BTreeSet<String>,
    opened: Vec<(String, String)>,
    closed: Vec<(String, String)>,
    fail_open: Option<OpenFailure>,
    fail_close: bool,
}

#[derive(Default)]
pub struct MockFirewall {
    state: Mutex<FirewallState>,
}

impl MockFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_open(&self, failure: OpenFailure) {
        lock(&self.state).fail_open = Some(failure);
    }

    pub fn fail_next_close(&self) {
        lock(&self.state).fail_close = true;
    }

    /// True when all three objects of the binding exist.
    pub fn has_binding(&self, owner: &str, vm_name: &str) -> bool {
        let names = BindingNames::new(owner, vm_name);
        let state = lock(&self.state);
        [&names.host, &names.inbound, &names.outbound]
            .iter()
            .all(|name| state.objects.contains_key(*name))
    }

    /// True when any object of the binding exists.
    pub fn has_any_object(&self, owner: &str, vm_name: &str) -> bool {
        let names = BindingNames::new(owner, vm_name);
        let state = lock(&self.state);
        [&names.host, &names.inbound, &names.outbound]
            .iter()
            .any(|name| state.objects.contains_key(*name))
    }

    pub fn object_count(&self) -> usize {
        lock(&self.state).objects.len()
    }

    pub fn trusted_hosts(&self) -> Vec<String> {
        lock(&self.state).trusted.iter().cloned().collect()
    }

    pub fn close_calls(&self) -> Vec<(String, String)> {
        lock(&self.state).closed.clone()
    }

    pub fn open_calls(&self) -> Vec<(String, String)> {
        lock(&self.state).opened.clone()
    }
}

fn rejected(object: &str) -> FirewallError {
    FirewallError::Rejected {
        object: object.to_string(),
        code: 500,
        message: "Operation could not be performed on Entity.".to_string(),
    }
}

#[async_trait]
impl Firewall for MockFirewall {
    async fn open_access(&self, request: &AccessRequest) -> firewall::Result<AccessGrant> {
        let names = BindingNames::new(&request.owner, &request.vm_name);
        let mut state = lock(&self.state);
        state
            .opened
            .push((request.owner.clone(), request.vm_name.clone()));
        let failure = state.fail_open.take();

        if failure == Some(OpenFailure::Host) {
            return Err(rejected(&names.host));
        }
        if state.objects.contains_key(&names.host) {
            return Err(FirewallError::AlreadyExists(names.host));
        }
        state
            .objects
            .insert(names.host.clone(), request.address.to_string());

        state
            .objects
            .insert(names.outbound.clone(), names.host.clone());
        if failure == Some(OpenFailure::InboundRule) {
            return Err(rejected(&names.inbound));
        }
        state.objects.insert(names.inbound.clone(), names.host.clone());

        if failure == Some(OpenFailure::Group) {
            return Err(rejected("Autonet"));
        }

        for (index, address) in request.home_ips.iter().enumerate() {
            state
                .trusted
                .insert(format!("{}={}", trusted_host_name(&request.owner, index + 1), address));
        }

        Ok(AccessGrant {
            names,
            trusted_failures: Vec::<(IpAddr, String)>::new(),
        })
    }

    async fn close_access(&self, owner: &str, vm_name: &str) -> firewall::Result<CloseReport> {
        let names = BindingNames::new(owner, vm_name);
        let mut state = lock(&self.state);
        state.closed.push((owner.to_string(), vm_name.to_string()));

        if std::mem::take(&mut state.fail_close) {
            let failed = || RemovalOutcome::Failed("controller timeout".to_string());
            return CloseReport {
                names,
                inbound: failed(),
                outbound: failed(),
                host: failed(),
            }
            .into_result();
        }

        let mut remove = |name: &str| match state.objects.remove(name) {
            Some(_) => RemovalOutcome::Removed,
            None => RemovalOutcome::Absent,
        };
        let inbound = remove(&names.inbound);
        let outbound = remove(&names.outbound);
        let host = remove(&names.host);

        CloseReport {
            names,
            inbound,
            outbound,
            host,
        }
        .into_result()
    }
}

#[derive(Default)]
struct DnsState {
    records: Vec<DnsRecord>,
    zones: Vec<Zone>,
    add_calls: usize,
    delete_calls: usize,
    fail_add: bool,
    fail_delete: bool,
}

#[derive(Default)]
pub struct MockDnsController {
    state: Mutex<DnsState>,
}

impl MockDnsController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_zones(names: &[&str]) -> Self {
        let controller = Self::default();
        lock(&controller.state).zones = names
            .iter()
            .map(|name| Zone {
                name: name.to_string(),
                kind: "Primary".to_string(),
                disabled: false,
            })
            .collect();
        controller
    }

    pub fn fail_next_add(&self) {
        lock(&self.state).fail_add = true;
    }

    pub fn fail_next_delete(&self) {
        lock(&self.state).fail_delete = true;
    }

    pub fn records(&self) -> Vec<DnsRecord> {
        lock(&self.state).records.clone()
    }

    pub fn add_calls(&self) -> usize {
        lock(&self.state).add_calls
    }

    pub fn delete_calls(&self) -> usize {
        lock(&self.state).delete_calls
    }

    /// Number of controller calls of any kind.
    pub fn total_calls(&self) -> usize {
        let state = lock(&self.state);
        state.add_calls + state.delete_calls
    }
}

#[async_trait]
impl DnsController for MockDnsController {
    async fn list_zones(&self) -> dns::Result<Vec<Zone>> {
        Ok(lock(&self.state).zones.clone())
    }

    async fn get_records(&self, zone: &str, domain: &str) -> dns::Result<Vec<PublishedRecord>> {
        Ok(lock(&self.state)
            .records
            .iter()
            .filter(|r| r.zone == zone && r.domain == domain)
            .map(|r| PublishedRecord {
                name: r.domain.clone(),
                record_type: r.value.record_type().to_string(),
                ttl: r.ttl,
                data: r.value.to_string(),
            })
            .collect())
    }

    async fn add_record(&self, record: &DnsRecord) -> dns::Result<()> {
        let mut state = lock(&self.state);
        state.add_calls += 1;

        if std::mem::take(&mut state.fail_add) {
            return Err(DnsError::Unavailable("controller timeout".to_string()));
        }
        if state.records.contains(record) {
            return Err(DnsError::Rejected("record already exists".to_string()));
        }
        state.records.push(record.clone());
        Ok(())
    }

    async fn delete_record(&self, record: &DnsRecord) -> dns::Result<()> {
        let mut state = lock(&self.state);
        state.delete_calls += 1;

        if std::mem::take(&mut state.fail_delete) {
            return Err(DnsError::Unavailable("controller timeout".to_string()));
        }
        state
            .records
            .retain(|r| !(r.zone == record.zone && r.domain == record.domain && r.value == record.value));
        Ok(())
    }
}
