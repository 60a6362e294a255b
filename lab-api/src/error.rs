use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use lab_core::ErrorClass;
use lab_orchestrator::{OrchestratorError, PoolError};
use serde_json::json;
use thiserror::Error;
use tracing::error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Error, Debug)]
pub enum ApiError {
    /// A failure from the provisioning layer, reported by its class.
    #[error("{message}")]
    Classified { class: ErrorClass, message: String },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Classified { class, .. } => status_for(*class),
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
        }
    }
}

pub fn status_for(class: ErrorClass) -> StatusCode {
    match class {
        ErrorClass::Validation => StatusCode::BAD_REQUEST,
        ErrorClass::Auth => StatusCode::BAD_GATEWAY,
        ErrorClass::ExternalUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorClass::StateConflict => StatusCode::CONFLICT,
        ErrorClass::NotFound => StatusCode::NOT_FOUND,
        ErrorClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (class, message) = match self {
            ApiError::Classified { class, message } => (class.as_str(), message),
            ApiError::BadRequest(message) => (ErrorClass::Validation.as_str(), message),
            ApiError::Forbidden(message) => ("forbidden", message),
        };

        (status, Json(json!({ "error": message, "class": class }))).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let class = err.class();
        if class == ErrorClass::Internal {
            error!("Internal error: {}", err);
        }

        ApiError::Classified {
            class,
            message: err.to_string(),
        }
    }
}

impl From<PoolError> for ApiError {
    fn from(err: PoolError) -> Self {
        OrchestratorError::from(err).into()
    }
}
