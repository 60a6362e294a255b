//! Shared HTTP plumbing for the REST backends.

use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;

use crate::error::{HypervisorError, Result};

pub(crate) fn build_client(verify_tls: bool, timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(!verify_tls)
        .user_agent(concat!("lab-provider/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| HypervisorError::Protocol(format!("Failed to build HTTP client: {}", e)))
}

/// A control-plane call that did not produce a usable body.
#[derive(Debug)]
pub(crate) enum CallFailure {
    /// 401/403, or a login that returned no session.
    Unauthorized(String),
    /// Any other non-success status, with the body text.
    Status(StatusCode, String),
    /// Connect, timeout or body read failure.
    Transport(String),
    /// Body was not what the backend documents.
    Decode(String),
    /// The backend accepted the call but reported that the work failed.
    Failed(String),
}

impl CallFailure {
    pub(crate) fn message(&self) -> String {
        match self {
            CallFailure::Unauthorized(m)
            | CallFailure::Transport(m)
            | CallFailure::Decode(m)
            | CallFailure::Failed(m) => m.clone(),
            CallFailure::Status(status, body) => format!("HTTP {}: {}", status, body.trim()),
        }
    }

    /// True when the backend says the object does not exist.
    pub(crate) fn is_absent(&self) -> bool {
        match self {
            CallFailure::Status(status, body) => {
                *status == StatusCode::NOT_FOUND || body.to_ascii_lowercase().contains("does not exist")
            }
            _ => false,
        }
    }

    /// Turn into the step-specific error, keeping auth and transport
    /// failures distinguishable.
    pub(crate) fn into_error(
        self,
        backend: &'static str,
        step: impl FnOnce(String) -> HypervisorError,
    ) -> HypervisorError {
        match self {
            CallFailure::Unauthorized(message) => HypervisorError::Auth { backend, message },
            other => step(other.message()),
        }
    }
}

impl From<reqwest::Error> for CallFailure {
    fn from(e: reqwest::Error) -> Self {
        CallFailure::Transport(e.to_string())
    }
}

/// Read the body, classifying the status first.
pub(crate) async fn read_json(response: Response) -> std::result::Result<Value, CallFailure> {
    let status = response.status();
    let body = response.text().await?;

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(CallFailure::Unauthorized(format!("HTTP {}: {}", status, body.trim())));
    }
    if !status.is_success() {
        return Err(CallFailure::Status(status, body));
    }
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }

    serde_json::from_str(&body).map_err(|e| CallFailure::Decode(format!("Invalid JSON: {}", e)))
}

/// Numbers arrive as JSON numbers or as strings depending on the endpoint.
pub(crate) fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Strip trailing slashes so paths can be appended with `format!`.
pub(crate) fn base_url(raw: &str) -> Result<String> {
    let parsed = url::Url::parse(raw).map_err(|e| {
        HypervisorError::Config(lab_core::ConfigError::Invalid {
            name: "server url".to_string(),
            value: format!("{} ({})", raw, e),
        })
    })?;
    Ok(parsed.as_str().trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_as_u64_accepts_strings_and_numbers() {
        assert_eq!(as_u64(&json!(2048)), Some(2048));
        assert_eq!(as_u64(&json!("4")), Some(4));
        assert_eq!(as_u64(&json!(2.0)), Some(2));
        assert_eq!(as_u64(&json!(null)), None);
        assert_eq!(as_u64(&json!("many")), None);
    }

    #[test]
    fn test_absent_detection() {
        assert!(CallFailure::Status(StatusCode::NOT_FOUND, String::new()).is_absent());
        assert!(CallFailure::Status(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Configuration file 'nodes/pve/qemu-server/105.conf' does not exist".into()
        )
        .is_absent());
        assert!(!CallFailure::Transport("timeout".into()).is_absent());
    }

    #[test]
    fn test_base_url() {
        assert_eq!(base_url("https://pve.lab:8006/").unwrap(), "https://pve.lab:8006");
        assert!(base_url("not a url").is_err());
    }
}
