// Trusted identity check for per-session routes.

use axum::{extract::Request, http::HeaderName, middleware::Next, response::Response};
use super::error::ApiError;

/// The session name addressed by `/launch/<name>`, `/status/<name>` or
/// `/session/<name>/...`.
pub fn session_name_from_path(path: &str) -> Option<&str> {
    let mut segments = path.trim_start_matches('/').split('/');
    match segments.next()? {
        "launch" | "status" | "session" => segments.next().filter(|s| !s.is_empty()),
        _ => None,
    }
}

/// Require the pre-authenticated user header to name the addressed session.
///
/// An upstream authentication proxy sets `header` to the user name. When no
/// header is configured every request passes; routes that address no session
/// (such as `/health`) always pass.
pub async fn check_trusted_user(
    header: Option<HeaderName>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(header) = header else {
        return Ok(next.run(req).await);
    };
    let Some(name) = session_name_from_path(req.uri().path()) else {
        return Ok(next.run(req).await);
    };

    let user = req.headers().get(&header).and_then(|v| v.to_str().ok());
    if user == Some(name) {
        return Ok(next.run(req).await);
    }

    tracing::warn!(session = %name, user = ?user, "rejecting request for another user's session");
    Err(ApiError::Forbidden)
}
