//! HTTP surface: status mapping, ownership and admin gating.

mod common;

use axum::http::StatusCode;
use common::*;
use lab_network::mock::OpenFailure;
use serde_json::json;

#[tokio::test]
async fn test_health() {
    let app = test_app().await;

    let response = app.get("/health", As::Anonymous).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["service"], "lab-api");

    app.create_machine("alice", "web1").await;
    let response = app.get("/health/ready", As::Anonymous).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ready");
    assert_eq!(body["hypervisors"], json!(["mock"]));
    assert_eq!(body["ledger"]["machines"], 1);
    assert_eq!(body["ledger"]["addresses"]["free"], 2);
    assert_eq!(body["ledger"]["addresses"]["assigned"], 1);
}

#[tokio::test]
async fn test_readiness_fails_without_ledger() {
    let app = test_app().await;
    app.pool.close().await;

    let response = app.get("/health/ready", As::Anonymous).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(response).await;
    assert_eq!(body["status"], "not_ready");

    let response = app.get("/health", As::Anonymous).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_openapi_document_lists_routes() {
    let app = test_app().await;

    let response = app.get("/api-docs/openapi.json", As::Anonymous).await;
    assert_eq!(response.status(), StatusCode::OK);

    let doc = json_body(response).await;
    assert!(doc["paths"]["/api/v1/machines"].is_object());
    assert!(doc["paths"]["/api/v1/machines/{id}/records"].is_object());
    assert!(doc["components"]["schemas"]["Machine"].is_object());
}

#[tokio::test]
async fn test_requests_without_subject_are_rejected() {
    let app = test_app().await;

    let response = app
        .post("/api/v1/machines", As::Anonymous, machine_body("web1"))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(app.hypervisor.vm_count(), 0);
}

#[tokio::test]
async fn test_create_get_list_delete() {
    let app = test_app().await;

    let machine = app.create_machine("alice", "web1").await;
    assert_eq!(machine["owner"], "alice");
    assert_eq!(machine["owner_display_name"], "alice");
    assert_eq!(machine["state"], "active");
    assert_eq!(machine["ip_address"], "10.0.0.10");
    let id = machine["id"].as_str().unwrap().to_string();

    let response = app.get(&format!("/api/v1/machines/{}", id), As::User("alice")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let views = json_body(app.get("/api/v1/machines", As::User("alice")).await).await;
    assert_eq!(views.as_array().unwrap().len(), 1);
    assert_eq!(views[0]["machine_id"], id.as_str());
    assert_eq!(views[0]["power_state"], "running");

    let response = app.delete(&format!("/api/v1/machines/{}", id), As::User("alice")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let ledger = json_body(app.get("/api/v1/machines/ledger", As::User("alice")).await).await;
    assert!(ledger.as_array().unwrap().is_empty());
    assert_eq!(app.hypervisor.vm_count(), 0);
}

#[tokio::test]
async fn test_machines_of_others_are_not_found() {
    let app = test_app().await;
    let machine = app.create_machine("alice", "web1").await;
    let uri = format!("/api/v1/machines/{}", machine["id"].as_str().unwrap());

    let response = app.get(&uri, As::User("mallory")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert_eq!(body["class"], "not_found");

    let response = app.delete(&uri, As::User("mallory")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(app.hypervisor.vm_count(), 1);

    let response = app.get(&uri, As::Admin("root")).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_validation_maps_to_bad_request() {
    let app = test_app().await;

    let response = app
        .post("/api/v1/machines", As::User("alice"), machine_body("not a name"))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["class"], "validation");
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_third_machine_exceeds_quota() {
    let app = test_app().await;
    app.create_machine("alice", "web1").await;
    app.create_machine("alice", "web2").await;

    let response = app
        .post("/api/v1/machines", As::User("alice"), machine_body("web3"))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_exhausted_pool_is_conflict() {
    let app = test_app_with(&[]).await;

    let response = app
        .post("/api/v1/machines", As::User("alice"), machine_body("web1"))
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = json_body(response).await;
    assert_eq!(body["class"], "state_conflict");
    assert_eq!(app.hypervisor.vm_count(), 0);
}

#[tokio::test]
async fn test_firewall_outage_is_unavailable_and_rolled_back() {
    let app = test_app().await;
    app.firewall.fail_next_open(OpenFailure::Group);

    let response = app
        .post("/api/v1/machines", As::User("alice"), machine_body("web1"))
        .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let ledger = json_body(app.get("/api/v1/machines/ledger", As::User("alice")).await).await;
    assert!(ledger.as_array().unwrap().is_empty());
    assert_eq!(app.hypervisor.vm_count(), 0);
    assert_eq!(app.firewall.object_count(), 0);
}

#[tokio::test]
async fn test_record_lifecycle() {
    let app = test_app().await;
    let machine = app.create_machine("alice", "web1").await;
    let records_uri = format!("/api/v1/machines/{}/records", machine["id"].as_str().unwrap());
    let www = json!({ "zone": ZONE, "subdomain": "www", "type": "A", "value": "10.0.0.10", "ttl": null });

    let response = app.post(&records_uri, As::User("alice"), www.clone()).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let record = json_body(response).await;
    assert_eq!(record["subdomain"], "www.students");
    assert_eq!(record["record_type"], "A");
    let record_uri = format!("/api/v1/records/{}", record["id"].as_str().unwrap());

    let response = app.post(&records_uri, As::User("alice"), www).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let live = json_body(app.get(&format!("{}/live", record_uri), As::User("alice")).await).await;
    assert_eq!(live[0]["data"], "10.0.0.10");

    let response = app
        .put(
            &record_uri,
            As::User("alice"),
            json!({ "zone": ZONE, "subdomain": "www", "type": "TXT", "value": "hello", "ttl": 300 }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let updated = json_body(response).await;
    assert_eq!(updated["ttl"], 300);

    let listed = json_body(app.get(&records_uri, As::User("alice")).await).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let updated_uri = format!("/api/v1/records/{}", updated["id"].as_str().unwrap());
    let response = app.delete(&updated_uri, As::User("mallory")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let response = app.delete(&updated_uri, As::User("alice")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(app.dns.records().is_empty());
}

#[tokio::test]
async fn test_malformed_record_is_rejected() {
    let app = test_app().await;
    let machine = app.create_machine("alice", "web1").await;
    let records_uri = format!("/api/v1/machines/{}/records", machine["id"].as_str().unwrap());

    let response = app
        .post(
            &records_uri,
            As::User("alice"),
            json!({ "zone": ZONE, "subdomain": "mail", "type": "MX", "value": "10", "ttl": null }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(app.dns.total_calls(), 0);
}

#[tokio::test]
async fn test_zones() {
    let app = test_app().await;

    let zones = json_body(app.get("/api/v1/zones", As::User("alice")).await).await;
    assert_eq!(zones[0]["name"], ZONE);
}

#[tokio::test]
async fn test_admin_routes_require_admin() {
    let app = test_app().await;

    for uri in ["/api/v1/admin/addresses", "/api/v1/admin/vms"] {
        let response = app.get(uri, As::User("alice")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN, "{}", uri);
    }

    let response = app
        .post(
            "/api/v1/admin/addresses",
            As::User("alice"),
            json!({ "addresses": ["10.0.0.20"] }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_admin_seeds_and_lists_addresses() {
    let app = test_app().await;

    let response = app
        .post(
            "/api/v1/admin/addresses",
            As::Admin("root"),
            json!({ "addresses": ["10.0.0.20", "10.0.0.10"] }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let report = json_body(response).await;
    assert_eq!(report["added"], json!(["10.0.0.20"]));
    assert_eq!(report["duplicates"], json!(["10.0.0.10"]));

    let response = app
        .post(
            "/api/v1/admin/addresses",
            As::Admin("root"),
            json!({ "addresses": ["10.0.0.300"] }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .post("/api/v1/admin/addresses", As::Admin("root"), json!({ "addresses": [] }))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let addresses = json_body(app.get("/api/v1/admin/addresses", As::Admin("root")).await).await;
    assert_eq!(addresses.as_array().unwrap().len(), 4);

    let vms = json_body(app.get("/api/v1/admin/vms", As::Admin("root")).await).await;
    assert!(vms.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_operations_are_scoped_to_owner() {
    let app = test_app().await;
    let machine = app.create_machine("alice", "web1").await;
    app.create_machine("bob", "web1").await;

    let ops = json_body(app.get("/api/v1/operations", As::User("alice")).await).await;
    let ops = ops.as_array().unwrap().clone();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0]["machine_id"], machine["id"]);
    assert_eq!(ops[0]["operation_type"], "create");
    assert_eq!(ops[0]["status"], "success");

    let op_uri = format!("/api/v1/operations/{}", ops[0]["id"].as_str().unwrap());
    let response = app.get(&op_uri, As::User("bob")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let response = app.get(&op_uri, As::User("alice")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let all = json_body(app.get("/api/v1/operations?type=create", As::Admin("root")).await).await;
    assert_eq!(all.as_array().unwrap().len(), 2);
}
