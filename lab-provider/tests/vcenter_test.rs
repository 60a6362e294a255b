mod common;

use axum::http::{Method, StatusCode};
use common::{ok, spawn, FakeServer};
use lab_core::ErrorClass;
use lab_provider::vcenter::{parse_templates, VcenterConfig, VcenterProvider};
use lab_provider::{CreateSpec, Hypervisor, HypervisorError, ResourceLimits, Resources};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const GIB: u64 = 1024 * 1024 * 1024;

async fn fake_vcenter(existing_name: Option<&'static str>) -> FakeServer {
    let deleted = Arc::new(AtomicBool::new(false));

    spawn(move |method, path, body| match (method.as_str(), path) {
        ("POST", "/api/session") => ok(json!("session-1")),
        ("GET", "/api/session") => ok(json!({ "user": "svc" })),
        ("GET", "/api/vcenter/datastore") => ok(json!([{ "datastore": "datastore-11", "name": "vsan" }])),
        ("GET", "/api/vcenter/vm-template/library-items/item-ubuntu") => ok(json!({
            "cpu": { "count": 2 },
            "memory": { "size_MiB": 1024 },
            "disks": { "2000": { "capacity": 20 * GIB } }
        })),
        ("POST", "/api/vcenter/vm-template/library-items/item-ubuntu") => {
            let request: Value = serde_json::from_str(body).unwrap_or_default();
            if existing_name.is_some_and(|n| request["name"] == n) {
                (
                    StatusCode::BAD_REQUEST,
                    json!({ "error_type": "ALREADY_EXISTS", "messages": [] }).to_string(),
                )
            } else {
                ok(json!("vm-42"))
            }
        }
        ("GET", "/api/vcenter/vm/vm-42") => {
            if deleted.load(Ordering::SeqCst) {
                (StatusCode::NOT_FOUND, json!({ "error_type": "NOT_FOUND" }).to_string())
            } else {
                ok(json!({
                    "name": "OICT-AUTO-u1-web1",
                    "power_state": "POWERED_ON",
                    "cpu": { "count": 2 },
                    "memory": { "size_MiB": 1024 }
                }))
            }
        }
        ("POST", "/api/vcenter/vm/vm-42/power") => (StatusCode::NO_CONTENT, String::new()),
        ("DELETE", "/api/vcenter/vm/vm-42") => {
            deleted.store(true, Ordering::SeqCst);
            (StatusCode::NO_CONTENT, String::new())
        }
        ("GET", "/api/vcenter/vm") => ok(json!([
            { "vm": "vm-42", "name": "OICT-AUTO-u1-web1", "power_state": "POWERED_ON", "cpu_count": 2, "memory_size_MiB": 1024 },
            { "vm": "vm-43", "name": "OICT-AUTO-u2-db", "power_state": "POWERED_OFF", "cpu_count": 1, "memory_size_MiB": 512 }
        ])),
        _ => (StatusCode::NOT_FOUND, "{}".into()),
    })
    .await
}

fn config(server: &FakeServer) -> VcenterConfig {
    VcenterConfig {
        url: server.base_url.clone(),
        username: "svc".into(),
        password: "secret".into(),
        cluster_id: "domain-c8".into(),
        folder_id: "group-v4".into(),
        datastore_name: "vsan".into(),
        templates: parse_templates("ubuntu=item-ubuntu").unwrap(),
        limits: ResourceLimits::default(),
        verify_tls: true,
        request_timeout: Duration::from_secs(5),
        name_prefix: "OICT-AUTO".into(),
        disk_key: "2000".into(),
    }
}

fn spec(memory_mb: u64, os: &str) -> CreateSpec {
    CreateSpec {
        name: "web1".into(),
        resources: Resources::new(memory_mb, 1, 10),
        owner: "u1".into(),
        owner_display_name: "User One".into(),
        description: "coursework".into(),
        os: os.into(),
        subdomain: None,
    }
}

fn deploy_body(server: &FakeServer) -> Value {
    let calls = server.calls_to(Method::POST, "/api/vcenter/vm-template/library-items/item-ubuntu");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].query, "action=deploy");
    serde_json::from_str(&calls[0].body).unwrap()
}

#[tokio::test]
async fn test_deploy_uses_owner_prefixed_name_and_floor() {
    let server = fake_vcenter(None).await;
    let provider = VcenterProvider::new(config(&server)).unwrap();

    let vm = provider.create(&spec(512, "Ubuntu")).await.unwrap();

    assert_eq!(vm.vmid, "vm-42");
    assert_eq!(vm.resources, Resources::new(1024, 2, 20));

    let body = deploy_body(&server);
    assert_eq!(body["name"], "OICT-AUTO-u1-web1");
    assert_eq!(body["placement"]["cluster"], "domain-c8");
    assert_eq!(body["disk_storage"]["datastore"], "datastore-11");
    assert_eq!(body["hardware_customization"], json!({}));
}

#[tokio::test]
async fn test_memory_override_above_template() {
    let server = fake_vcenter(None).await;
    let provider = VcenterProvider::new(config(&server)).unwrap();

    provider.create(&spec(4096, "ubuntu")).await.unwrap();

    let body = deploy_body(&server);
    assert_eq!(body["hardware_customization"]["memory_update"]["memory"], 4096);
    assert!(body["hardware_customization"].get("cpu_update").is_none());
}

#[tokio::test]
async fn test_existing_name_is_state_conflict() {
    let server = fake_vcenter(Some("OICT-AUTO-u1-web1")).await;
    let provider = VcenterProvider::new(config(&server)).unwrap();

    let err = provider.create(&spec(1024, "ubuntu")).await.unwrap_err();

    assert!(matches!(err, HypervisorError::AlreadyExists(_)));
    assert_eq!(err.class(), ErrorClass::StateConflict);
}

#[tokio::test]
async fn test_unknown_os_is_rejected_before_any_call() {
    let server = fake_vcenter(None).await;
    let provider = VcenterProvider::new(config(&server)).unwrap();

    let err = provider.create(&spec(1024, "Windows")).await.unwrap_err();

    assert_eq!(err.class(), ErrorClass::Validation);
    assert!(server.recorded().is_empty());
}

#[tokio::test]
async fn test_datastore_lookup_is_cached() {
    let server = fake_vcenter(None).await;
    let provider = VcenterProvider::new(config(&server)).unwrap();

    provider.create(&spec(1024, "ubuntu")).await.unwrap();
    provider.create(&spec(1024, "ubuntu")).await.unwrap();

    assert_eq!(server.calls_to(Method::GET, "/api/vcenter/datastore").len(), 1);
    assert_eq!(server.calls_to(Method::POST, "/api/session").len(), 1);
}

#[tokio::test]
async fn test_destroy_powers_off_then_deletes() {
    let server = fake_vcenter(None).await;
    let provider = VcenterProvider::new(config(&server)).unwrap();

    provider.destroy("vm-42", "u1").await.unwrap();

    let power = server.calls_to(Method::POST, "/api/vcenter/vm/vm-42/power");
    assert_eq!(power.len(), 1);
    assert_eq!(power[0].query, "action=stop");
    assert_eq!(server.calls_to(Method::DELETE, "/api/vcenter/vm/vm-42").len(), 1);

    let err = provider.destroy("vm-42", "u1").await.unwrap_err();
    assert!(matches!(err, HypervisorError::NotFound(_)));
}

#[tokio::test]
async fn test_list_all_maps_power_states() {
    let server = fake_vcenter(None).await;
    let provider = VcenterProvider::new(config(&server)).unwrap();

    let vms = provider.list_all().await.unwrap();

    assert_eq!(vms.len(), 2);
    assert_eq!(vms[1].power_state, lab_provider::PowerState::Stopped);
    assert_eq!(vms[0].memory_max_bytes, Some(1024 * 1024 * 1024));
}
