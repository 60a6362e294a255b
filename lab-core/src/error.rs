use serde::Serialize;
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// Coarse failure taxonomy shared by every adapter and the orchestrator.
///
/// Adapters report the most specific error they can; the class decides how
/// callers react (retry is never automatic, see `lab-orchestrator`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Bad input, quota exceeded, domain in use. Returned immediately.
    Validation,
    /// Credential or session failure against an external controller.
    Auth,
    /// Network failure or timeout talking to a controller.
    ExternalUnavailable,
    /// The target already exists or is held by someone else.
    StateConflict,
    NotFound,
    Internal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Validation => "validation",
            ErrorClass::Auth => "auth",
            ErrorClass::ExternalUnavailable => "external_unavailable",
            ErrorClass::StateConflict => "state_conflict",
            ErrorClass::NotFound => "not_found",
            ErrorClass::Internal => "internal",
        }
    }
}

impl Display for ErrorClass {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input rejected before any side effect took place.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type ValidationResult<T> = std::result::Result<T, ValidationError>;
