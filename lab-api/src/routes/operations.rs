use crate::{error::ApiResult, state::AppState};
use axum::{
    extract::{Path, Query, State},
    routing::get,
    Extension, Json, Router,
};
use lab_orchestrator::{Caller, Operation, OperationFilters, OperationStatus, OperationType, OrchestratorError};
use serde::Deserialize;
use utoipa::IntoParams;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/operations", get(list_operations))
        .route("/api/v1/operations/{id}", get(get_operation))
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct OperationsQuery {
    pub machine_id: Option<String>,
    #[serde(rename = "type")]
    pub operation_type: Option<OperationType>,
    pub status: Option<OperationStatus>,
    /// Admins only; other callers always see their own operations.
    pub owner: Option<String>,
}

#[utoipa::path(
    get,
    path = "/api/v1/operations",
    tag = "operations",
    params(OperationsQuery),
    responses((status = 200, body = [Operation]))
)]
pub async fn list_operations(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<OperationsQuery>,
) -> ApiResult<Json<Vec<Operation>>> {
    let owner = if caller.is_admin {
        query.owner
    } else {
        Some(caller.subject.clone())
    };

    let operations = state
        .provisioner
        .operations()
        .list(OperationFilters {
            machine_id: query.machine_id,
            owner,
            operation_type: query.operation_type,
            status: query.status,
        })
        .await?;

    Ok(Json(operations))
}

#[utoipa::path(
    get,
    path = "/api/v1/operations/{id}",
    tag = "operations",
    params(("id" = String, Path, description = "Operation id")),
    responses((status = 200, body = Operation), (status = 404, description = "No such operation"))
)]
pub async fn get_operation(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> ApiResult<Json<Operation>> {
    let operation = state
        .provisioner
        .operations()
        .get(&id)
        .await?
        .filter(|op| caller.is_admin || op.owner == caller.subject)
        .ok_or_else(|| OrchestratorError::NotFound(format!("operation {}", id)))?;

    Ok(Json(operation))
}
