pub mod addresses;
pub mod health;
pub mod machines;
pub mod operations;
pub mod records;

use crate::{api_docs::ApiDoc, auth::auth_middleware, state::AppState};
use axum::{middleware, routing::get, Json, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;

pub fn create_app(state: AppState) -> Router {
    // Browser front-ends are served from another origin.
    let cors = CorsLayer::permissive();

    Router::new()
        .merge(health::routes())
        .route("/api-docs/openapi.json", get(openapi_spec))
        .merge(
            machines::routes()
                .merge(records::routes())
                .merge(addresses::routes())
                .merge(operations::routes())
                .layer(middleware::from_fn(auth_middleware)),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
