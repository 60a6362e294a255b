//! Shared fixtures for lab-orchestrator integration tests.

#![allow(dead_code)]

use chrono::{Duration, Utc};
use lab_network::mock::{MockDnsController, MockFirewall};
use lab_orchestrator::test_utils::create_test_db;
use lab_orchestrator::{AddressState, Caller, CreateMachineRequest, Provisioner, ProvisionerSettings};
use lab_provider::mock::MockHypervisor;
use lab_provider::HypervisorRegistry;
use sqlx::SqlitePool;
use std::sync::Arc;

pub const ZONE: &str = "lab.example";
pub const SUFFIX: &str = "students";

pub struct Harness {
    pub pool: SqlitePool,
    pub provisioner: Provisioner,
    pub hypervisor: Arc<MockHypervisor>,
    pub firewall: Arc<MockFirewall>,
    pub dns: Arc<MockDnsController>,
}

/// Provisioner over mocks, two free addresses, managed suffix set, no
/// automatic record.
pub async fn harness() -> Harness {
    harness_with(settings(), &["10.0.0.10", "10.0.0.11"]).await
}

pub fn settings() -> ProvisionerSettings {
    ProvisionerSettings {
        domain_suffix: Some(SUFFIX.to_string()),
        ..Default::default()
    }
}

pub async fn harness_with(settings: ProvisionerSettings, addresses: &[&str]) -> Harness {
    let pool = create_test_db().await;
    let hypervisor = Arc::new(MockHypervisor::new());
    let firewall = Arc::new(MockFirewall::new());
    let dns = Arc::new(MockDnsController::with_zones(&[ZONE]));

    let provisioner = Provisioner::new(
        pool.clone(),
        HypervisorRegistry::new().with(hypervisor.clone()),
        firewall.clone(),
        dns.clone(),
        settings,
    );

    let addresses: Vec<String> = addresses.iter().map(|a| a.to_string()).collect();
    provisioner
        .addresses()
        .seed(&addresses)
        .await
        .expect("Failed to seed the address pool");

    Harness {
        pool,
        provisioner,
        hypervisor,
        firewall,
        dns,
    }
}

pub fn user(subject: &str) -> Caller {
    Caller::user(subject, format!("User {}", subject))
}

pub fn machine_request(name: &str) -> CreateMachineRequest {
    CreateMachineRequest {
        name: name.to_string(),
        memory_mb: 1024,
        cpu_cores: 2,
        disk_gb: 20,
        description: "coursework".to_string(),
        os: "Ubuntu".to_string(),
        subdomain: None,
        expires_at: Some(Utc::now() + Duration::days(30)),
        backend: None,
        home_ips: Vec::new(),
    }
}

pub async fn count(pool: &SqlitePool, table: &str) -> i64 {
    let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(pool)
        .await
        .expect("Failed to count rows");
    count
}

pub async fn address_state(harness: &Harness, address: &str) -> AddressState {
    harness
        .provisioner
        .addresses()
        .get(address)
        .await
        .expect("Failed to read the address pool")
        .expect("Address should be in the pool")
        .state
}
