use crate::state::AppState;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use lab_orchestrator::{AddressState, OrchestratorError};
use serde_json::{json, Value};
use tracing::warn;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/ready", get(readiness_check))
}

#[utoipa::path(get, path = "/health", tag = "health", responses((status = 200, description = "Service is up")))]
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "lab-api",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Ready once the ledger answers, with machine and address pool figures.
/// Controllers are not contacted.
#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "health",
    responses(
        (status = 200, description = "Ledger reachable"),
        (status = 503, description = "Ledger unreachable")
    )
)]
pub async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let hypervisors = state.provisioner.hypervisors().names();

    match ledger_summary(&state).await {
        Ok(ledger) => (
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "service": "lab-api",
                "ledger": ledger,
                "hypervisors": hypervisors,
            })),
        ),
        Err(e) => {
            warn!("Readiness check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "not_ready",
                    "service": "lab-api",
                    "error": e.to_string(),
                    "hypervisors": hypervisors,
                })),
            )
        }
    }
}

async fn ledger_summary(state: &AppState) -> Result<Value, OrchestratorError> {
    let machines = state.provisioner.ledger().list_all().await?;
    let addresses = state.provisioner.addresses().list().await?;
    let in_state = |wanted: AddressState| addresses.iter().filter(|a| a.state == wanted).count();

    Ok(json!({
        "machines": machines.len(),
        "addresses": {
            "free": in_state(AddressState::Free),
            "claimed": in_state(AddressState::Claimed),
            "assigned": in_state(AddressState::Assigned),
        },
    }))
}
