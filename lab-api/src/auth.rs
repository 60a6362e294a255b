use crate::error::ApiError;
use axum::{extract::Request, http::StatusCode, middleware::Next, response::Response};
use lab_orchestrator::Caller;

/// Extract the caller from headers set by the authenticating proxy.
///
/// The proxy in front of the service verifies the token and forwards the
/// stable subject id (`x-lab-subject`), the display name (`x-lab-name`)
/// and whether the caller holds the admin role (`x-lab-admin: true`).
/// `x-forwarded-user` is accepted as the subject for oauth2-proxy setups.
pub async fn auth_middleware(mut req: Request, next: Next) -> Result<Response, StatusCode> {
    let (subject, display_name, is_admin) = {
        let header = |name: &str| {
            req.headers()
                .get(name)
                .and_then(|h| h.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let subject = header("x-lab-subject")
            .or_else(|| header("x-forwarded-user"))
            .ok_or(StatusCode::UNAUTHORIZED)?;
        let display_name = header("x-lab-name").unwrap_or_else(|| subject.clone());
        let is_admin = header("x-lab-admin").is_some_and(|v| v.eq_ignore_ascii_case("true"));
        (subject, display_name, is_admin)
    };

    let caller = if is_admin {
        Caller::admin(subject, display_name)
    } else {
        Caller::user(subject, display_name)
    };
    req.extensions_mut().insert(caller);

    Ok(next.run(req).await)
}

pub fn require_admin(caller: &Caller) -> Result<(), ApiError> {
    if caller.is_admin {
        Ok(())
    } else {
        Err(ApiError::Forbidden(format!(
            "{} is not an administrator",
            caller.subject
        )))
    }
}
