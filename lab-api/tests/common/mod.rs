//! Shared fixtures for lab-api tests: an app over in-memory SQLite and
//! mock controllers, plus a small request helper.

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{Request, Response},
    Router,
};
use lab_api::{create_app, AppState};
use lab_network::mock::{MockDnsController, MockFirewall};
use lab_orchestrator::test_utils::create_test_db;
use lab_orchestrator::{Provisioner, ProvisionerSettings};
use lab_provider::mock::MockHypervisor;
use lab_provider::HypervisorRegistry;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower::ServiceExt;

pub const ZONE: &str = "lab.example";

pub struct TestApp {
    pub app: Router,
    pub pool: SqlitePool,
    pub provisioner: Provisioner,
    pub hypervisor: Arc<MockHypervisor>,
    pub firewall: Arc<MockFirewall>,
    pub dns: Arc<MockDnsController>,
}

/// Caller identity sent in the proxy headers.
#[derive(Clone, Copy)]
pub enum As<'a> {
    Anonymous,
    User(&'a str),
    Admin(&'a str),
}

pub async fn test_app() -> TestApp {
    test_app_with(&["10.0.0.10", "10.0.0.11", "10.0.0.12"]).await
}

pub async fn test_app_with(addresses: &[&str]) -> TestApp {
    let pool = create_test_db().await;
    let hypervisor = Arc::new(MockHypervisor::new());
    let firewall = Arc::new(MockFirewall::new());
    let dns = Arc::new(MockDnsController::with_zones(&[ZONE]));

    let provisioner = Provisioner::new(
        pool.clone(),
        HypervisorRegistry::new().with(hypervisor.clone()),
        firewall.clone(),
        dns.clone(),
        ProvisionerSettings {
            domain_suffix: Some("students".to_string()),
            ..ProvisionerSettings::default()
        },
    );

    let addresses: Vec<String> = addresses.iter().map(|a| a.to_string()).collect();
    provisioner
        .addresses()
        .seed(&addresses)
        .await
        .expect("Failed to seed the address pool");

    TestApp {
        app: create_app(AppState::new(provisioner.clone())),
        pool,
        provisioner,
        hypervisor,
        firewall,
        dns,
    }
}

pub fn machine_body(name: &str) -> Value {
    json!({
        "name": name,
        "memory_mb": 2048,
        "cpu_cores": 2,
        "disk_gb": 30,
        "description": "coursework",
        "os": "Ubuntu",
        "subdomain": null,
        "expires_at": null,
        "backend": null
    })
}

impl TestApp {
    pub async fn send(&self, method: &str, uri: &str, who: As<'_>, body: Option<Value>) -> Response<Body> {
        let mut builder = Request::builder().method(method).uri(uri);

        match who {
            As::Anonymous => {}
            As::User(subject) => {
                builder = builder.header("x-lab-subject", subject);
            }
            As::Admin(subject) => {
                builder = builder
                    .header("x-lab-subject", subject)
                    .header("x-lab-admin", "true");
            }
        }

        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        self.app
            .clone()
            .oneshot(builder.body(body).expect("Failed to build request"))
            .await
            .expect("Router is infallible")
    }

    pub async fn get(&self, uri: &str, who: As<'_>) -> Response<Body> {
        self.send("GET", uri, who, None).await
    }

    pub async fn post(&self, uri: &str, who: As<'_>, body: Value) -> Response<Body> {
        self.send("POST", uri, who, Some(body)).await
    }

    pub async fn put(&self, uri: &str, who: As<'_>, body: Value) -> Response<Body> {
        self.send("PUT", uri, who, Some(body)).await
    }

    pub async fn delete(&self, uri: &str, who: As<'_>) -> Response<Body> {
        self.send("DELETE", uri, who, None).await
    }

    /// Create a machine through the API and return its JSON.
    pub async fn create_machine(&self, owner: &str, name: &str) -> Value {
        let response = self
            .post("/api/v1/machines", As::User(owner), machine_body(name))
            .await;
        assert_eq!(response.status(), 201, "machine creation failed");
        json_body(response).await
    }
}

pub async fn json_body(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read response body");

    serde_json::from_slice(&bytes).expect("Failed to deserialize JSON")
}
