use crate::{
    auth::require_admin,
    error::{ApiError, ApiResult},
    state::AppState,
};
use axum::{extract::State, routing::get, Extension, Json, Router};
use lab_orchestrator::{Caller, IpAllocation, SeedReport};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub fn routes() -> Router<AppState> {
    Router::new().route("/api/v1/admin/addresses", get(list_addresses).post(seed_addresses))
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SeedRequest {
    pub addresses: Vec<String>,
}

#[utoipa::path(
    get,
    path = "/api/v1/admin/addresses",
    tag = "admin",
    responses((status = 200, body = [IpAllocation]), (status = 403, description = "Not an administrator"))
)]
pub async fn list_addresses(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> ApiResult<Json<Vec<IpAllocation>>> {
    require_admin(&caller)?;
    let addresses = state.provisioner.addresses().list().await?;

    Ok(Json(addresses))
}

/// Add free addresses to the pool. Known addresses are reported, not
/// changed; one malformed address rejects the whole batch.
#[utoipa::path(
    post,
    path = "/api/v1/admin/addresses",
    tag = "admin",
    request_body = SeedRequest,
    responses((status = 200, body = SeedReport), (status = 403, description = "Not an administrator"))
)]
pub async fn seed_addresses(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<SeedRequest>,
) -> ApiResult<Json<SeedReport>> {
    require_admin(&caller)?;
    if req.addresses.is_empty() {
        return Err(ApiError::BadRequest("no addresses given".to_string()));
    }

    let report = state
        .provisioner
        .addresses()
        .seed(&req.addresses)
        .await?;

    Ok(Json(report))
}
