use axum::{
    extract::{ws::WebSocketUpgrade, FromRequestParts, Path, Request, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use super::{bridge, error::ApiError, AppState};
use crate::context::Context;
use crate::daemon::NOTEBOOK_NAME;
use crate::session::validate_session_name;

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
}

pub(super) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Serialize)]
pub(super) struct StatusResponse {
    name: String,
    running: bool,
    context: Option<Context>,
}

pub(super) async fn session_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let context = state.manager.status(&name)?;
    let running = context.is_some();
    Ok(Json(StatusResponse {
        name,
        running,
        context,
    }))
}

/// `scheme://host` of the request as the browser sees it.
pub(super) fn host_url(headers: &HeaderMap) -> String {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("{scheme}://{host}")
}

/// Start (or reuse) the user's backend and send the browser to its notebook.
pub(super) async fn launch(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Redirect, ApiError> {
    validate_session_name(&name)?;
    let context = state.launch.context_for(&name, &host_url(&headers));
    let (context, created) = state
        .manager
        .ensure(&name, context)
        .await
        .map_err(ApiError::start_failed)?;
    tracing::info!(session = %name, port = ?context.http_port(), created, "notebook launched");
    Ok(Redirect::to(&format!("/session/{name}/notebooks/{NOTEBOOK_NAME}")))
}

/// The `{name}` segment of the `/session/...` routes; any `{*rest}` is ignored.
#[derive(Debug, Deserialize)]
pub(super) struct SessionPath {
    name: String,
}

pub(super) async fn shutdown_session(
    State(state): State<AppState>,
    Path(SessionPath { name }): Path<SessionPath>,
) -> Result<Redirect, ApiError> {
    state.manager.stop(&name).await.map_err(ApiError::stop_failed)?;
    Ok(Redirect::to("/"))
}

/// Everything under `/session/<name>`: proxied to the backend, or bridged when
/// the request is a websocket upgrade.
pub(super) async fn session_proxy(
    State(state): State<AppState>,
    Path(SessionPath { name }): Path<SessionPath>,
    req: Request,
) -> Result<Response, ApiError> {
    let context = state
        .manager
        .status(&name)?
        .ok_or_else(|| ApiError::SessionNotRunning(name.clone()))?;
    let port = context
        .http_port()
        .ok_or_else(|| ApiError::SessionNotRunning(name.clone()))?;

    if bridge::is_upgrade_request(req.headers()) {
        let (mut parts, _body) = req.into_parts();
        let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
            Ok(ws) => ws,
            Err(rejection) => return Ok(rejection.into_response()),
        };
        let upstream = bridge::upstream_request(&parts.uri, &parts.headers, port)
            .map_err(|e| ApiError::InternalError(e.to_string()))?;
        tracing::debug!(session = %name, port, uri = %parts.uri, "bridging websocket");
        let shutdown = state.shutdown.clone();
        return Ok(ws.on_upgrade(move |socket| bridge::run(socket, upstream, shutdown)));
    }

    Ok(state.proxy.forward(req, port).await)
}
