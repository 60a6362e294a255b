use crate::{error::ApiResult, state::AppState};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Extension, Json, Router,
};
use lab_network::dns::PublishedRecord;
use lab_network::Zone;
use lab_orchestrator::{Caller, NameRecord, RecordRequest};
use serde_json::{json, Value};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/v1/machines/{id}/records",
            get(list_records).post(create_record),
        )
        .route(
            "/api/v1/records/{id}",
            axum::routing::put(update_record).delete(delete_record),
        )
        .route("/api/v1/records/{id}/live", get(live_records))
        .route("/api/v1/zones", get(list_zones))
}

#[utoipa::path(
    get,
    path = "/api/v1/machines/{id}/records",
    tag = "records",
    params(("id" = String, Path, description = "Machine id")),
    responses((status = 200, body = [NameRecord]))
)]
pub async fn list_records(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(machine_id): Path<String>,
) -> ApiResult<Json<Vec<NameRecord>>> {
    let records = state.provisioner.list_records(&caller, &machine_id).await?;

    Ok(Json(records))
}

/// Publish a record for a machine under the managed suffix.
#[utoipa::path(
    post,
    path = "/api/v1/machines/{id}/records",
    tag = "records",
    params(("id" = String, Path, description = "Machine id")),
    request_body = RecordRequest,
    responses(
        (status = 201, body = NameRecord),
        (status = 400, description = "Bad value, domain in use, duplicate or quota exceeded")
    )
)]
pub async fn create_record(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(machine_id): Path<String>,
    Json(req): Json<RecordRequest>,
) -> ApiResult<(StatusCode, Json<NameRecord>)> {
    let record = state
        .provisioner
        .create_record(&caller, &machine_id, &req)
        .await?;

    Ok((StatusCode::CREATED, Json(record)))
}

#[utoipa::path(
    put,
    path = "/api/v1/records/{id}",
    tag = "records",
    params(("id" = String, Path, description = "Record id")),
    request_body = RecordRequest,
    responses((status = 200, body = NameRecord))
)]
pub async fn update_record(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    Json(req): Json<RecordRequest>,
) -> ApiResult<Json<NameRecord>> {
    let record = state.provisioner.update_record(&caller, &id, &req).await?;

    Ok(Json(record))
}

#[utoipa::path(
    delete,
    path = "/api/v1/records/{id}",
    tag = "records",
    params(("id" = String, Path, description = "Record id")),
    responses((status = 200, description = "Record deleted"))
)]
pub async fn delete_record(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.provisioner.delete_record(&caller, &id).await?;

    Ok(Json(json!({ "message": "Record deleted", "id": id })))
}

/// What the DNS controller serves right now for a stored record.
#[utoipa::path(
    get,
    path = "/api/v1/records/{id}/live",
    tag = "records",
    params(("id" = String, Path, description = "Record id")),
    responses((status = 200, body = [PublishedRecord]))
)]
pub async fn live_records(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<PublishedRecord>>> {
    let records = state.provisioner.live_records(&caller, &id).await?;

    Ok(Json(records))
}

#[utoipa::path(
    get,
    path = "/api/v1/zones",
    tag = "records",
    responses((status = 200, body = [Zone]))
)]
pub async fn list_zones(State(state): State<AppState>) -> ApiResult<Json<Vec<Zone>>> {
    let zones = state.provisioner.list_zones().await?;

    Ok(Json(zones))
}
