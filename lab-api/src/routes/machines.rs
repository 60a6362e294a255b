use crate::{auth::require_admin, error::ApiResult, state::AppState};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Extension, Json, Router,
};
use lab_orchestrator::{Caller, CreateMachineRequest, Machine};
use lab_provider::{MachineView, VmSnapshot};
use serde::Deserialize;
use serde_json::{json, Value};
use utoipa::IntoParams;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/machines", get(list_machines).post(create_machine))
        .route("/api/v1/machines/ledger", get(list_ledger))
        .route("/api/v1/machines/{id}", get(get_machine).delete(delete_machine))
        .route("/api/v1/admin/vms", get(list_all_vms))
}

/// Create a machine for the caller and wire up its network identity.
#[utoipa::path(
    post,
    path = "/api/v1/machines",
    tag = "machines",
    request_body = CreateMachineRequest,
    responses(
        (status = 201, description = "Machine created", body = Machine),
        (status = 400, description = "Invalid request or quota exceeded"),
        (status = 409, description = "No free address"),
        (status = 503, description = "A controller is unreachable")
    )
)]
pub async fn create_machine(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<CreateMachineRequest>,
) -> ApiResult<(StatusCode, Json<Machine>)> {
    let machine = state.provisioner.create_machine(&caller, req).await?;

    Ok((StatusCode::CREATED, Json(machine)))
}

/// The caller's machines with live hypervisor state.
#[utoipa::path(
    get,
    path = "/api/v1/machines",
    tag = "machines",
    responses((status = 200, body = [MachineView]))
)]
pub async fn list_machines(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> ApiResult<Json<Vec<MachineView>>> {
    let machines = state.provisioner.list_machines(&caller).await?;

    Ok(Json(machines))
}

/// Ledger rows, including machines still being created or torn down.
#[utoipa::path(
    get,
    path = "/api/v1/machines/ledger",
    tag = "machines",
    responses((status = 200, body = [Machine]))
)]
pub async fn list_ledger(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> ApiResult<Json<Vec<Machine>>> {
    let machines = state.provisioner.list_ledger(&caller).await?;

    Ok(Json(machines))
}

#[utoipa::path(
    get,
    path = "/api/v1/machines/{id}",
    tag = "machines",
    params(("id" = String, Path, description = "Machine id")),
    responses((status = 200, body = Machine), (status = 404, description = "No such machine"))
)]
pub async fn get_machine(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> ApiResult<Json<Machine>> {
    let machine = state.provisioner.get_machine(&caller, &id).await?;

    Ok(Json(machine))
}

#[utoipa::path(
    delete,
    path = "/api/v1/machines/{id}",
    tag = "machines",
    params(("id" = String, Path, description = "Machine id")),
    responses(
        (status = 200, description = "Machine deleted"),
        (status = 404, description = "No such machine"),
        (status = 503, description = "A controller is unreachable; retry")
    )
)]
pub async fn delete_machine(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.provisioner.delete_machine(&caller, &id).await?;

    Ok(Json(json!({ "message": "Machine deleted", "id": id })))
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct BackendQuery {
    /// Backend name; the default backend when omitted.
    pub backend: Option<String>,
}

/// Every VM a backend can see, managed or not. Admins only.
#[utoipa::path(
    get,
    path = "/api/v1/admin/vms",
    tag = "admin",
    params(BackendQuery),
    responses((status = 200, body = [VmSnapshot]), (status = 403, description = "Not an administrator"))
)]
pub async fn list_all_vms(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<BackendQuery>,
) -> ApiResult<Json<Vec<VmSnapshot>>> {
    require_admin(&caller)?;
    let vms = state.provisioner.list_all_vms(query.backend.as_deref()).await?;

    Ok(Json(vms))
}
