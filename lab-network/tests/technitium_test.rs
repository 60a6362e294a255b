mod common;

use axum::http::StatusCode;
use common::{query, serve, Controller};
use lab_core::ErrorClass;
use lab_network::dns::{TechnitiumConfig, TechnitiumController};
use lab_network::{DnsController, DnsError, DnsRecord, RecordType, RecordValue};
use serde_json::json;
use std::time::Duration;

fn param<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
    params.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

async fn fake_technitium() -> Controller {
    serve(|uri, _| {
        let params = query(&uri.to_string());
        if param(&params, "token") != Some("t0ken") {
            return (
                StatusCode::OK,
                json!({ "status": "invalid-token", "errorMessage": "Invalid token" }).to_string(),
            );
        }

        let body = match uri.path() {
            "/api/zones/list" => json!({ "status": "ok", "response": { "zones": [
                { "name": "lab.example", "type": "Primary", "internal": false, "disabled": false },
                { "name": "0.in-addr.arpa", "type": "Primary", "internal": true, "disabled": false }
            ]}}),
            "/api/zones/records/add" => json!({ "status": "ok", "response": {} }),
            "/api/zones/records/delete" => {
                if param(&params, "domain") == Some("gone.students.lab.example") {
                    json!({ "status": "error", "errorMessage": "Cannot delete record: record not found." })
                } else {
                    json!({ "status": "ok", "response": {} })
                }
            }
            "/api/zones/records/get" => json!({ "status": "ok", "response": { "records": [
                { "name": "web1.students.lab.example", "type": "A", "ttl": 3600, "rData": { "ipAddress": "10.0.0.5" } }
            ]}}),
            _ => return (StatusCode::NOT_FOUND, String::new()),
        };
        (StatusCode::OK, body.to_string())
    })
    .await
}

fn controller(server: &Controller, token: &str) -> TechnitiumController {
    TechnitiumController::new(TechnitiumConfig {
        host: server.base_url.clone(),
        token: token.into(),
        verify_tls: true,
        request_timeout: Duration::from_secs(5),
    })
    .unwrap()
}

fn mx_record(domain: &str) -> DnsRecord {
    DnsRecord {
        zone: "lab.example".into(),
        domain: domain.into(),
        ttl: 3600,
        value: RecordValue::parse(RecordType::Mx, "10 mail.lab.example").unwrap(),
    }
}

#[tokio::test]
async fn test_list_zones_hides_internal_zones() {
    let server = fake_technitium().await;
    let zones = controller(&server, "t0ken").list_zones().await.unwrap();

    assert_eq!(zones.len(), 1);
    assert_eq!(zones[0].name, "lab.example");
}

#[tokio::test]
async fn test_add_record_sends_typed_fields() {
    let server = fake_technitium().await;
    controller(&server, "t0ken")
        .add_record(&mx_record("web1.students.lab.example"))
        .await
        .unwrap();

    let (target, _) = server.requests().pop().unwrap();
    let params = query(&target);
    assert!(target.starts_with("/api/zones/records/add"));
    assert_eq!(param(&params, "type"), Some("MX"));
    assert_eq!(param(&params, "preference"), Some("10"));
    assert_eq!(param(&params, "exchange"), Some("mail.lab.example"));
    assert_eq!(param(&params, "overwrite"), Some("false"));
    assert_eq!(param(&params, "ttl"), Some("3600"));
}

#[tokio::test]
async fn test_delete_of_missing_record_succeeds() {
    let server = fake_technitium().await;
    let dns = controller(&server, "t0ken");

    dns.delete_record(&mx_record("gone.students.lab.example")).await.unwrap();
    dns.delete_record(&mx_record("web1.students.lab.example")).await.unwrap();
    dns.delete_record(&mx_record("web1.students.lab.example")).await.unwrap();
}

#[tokio::test]
async fn test_invalid_token_is_auth_error() {
    let server = fake_technitium().await;
    let err = controller(&server, "wrong").list_zones().await.unwrap_err();

    assert!(matches!(err, DnsError::Auth(_)));
    assert_eq!(err.class(), ErrorClass::Auth);
}

#[tokio::test]
async fn test_get_records() {
    let server = fake_technitium().await;
    let records = controller(&server, "t0ken")
        .get_records("lab.example", "web1.students.lab.example")
        .await
        .unwrap();

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].record_type, "A");
    assert!(records[0].data.contains("10.0.0.5"));
}
