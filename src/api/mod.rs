pub mod bridge;
pub mod error;
mod handlers;
pub mod identity;
pub mod proxy;

use axum::{
    http::HeaderName,
    routing::{any, get, post},
    Router,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::{route_to_alt_domain, ContextSettings, Settings};
use crate::context::{keys, Context};
use crate::session::NotebookSessionManager;

use handlers::*;

/// What every launch puts into a session's context.
#[derive(Debug, Clone, Default)]
pub struct LaunchConfig {
    pub alternative_domain: Option<String>,
    pub context: ContextSettings,
}

impl LaunchConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            alternative_domain: settings.server.alternative_domain.clone(),
            context: settings.context.clone(),
        }
    }

    /// The desired context for `name`, requested from `host_url`.
    ///
    /// The configuration hash covers the configured values only, so the same
    /// user arriving through another host name keeps the running backend.
    pub fn context_for(&self, name: &str, host_url: &str) -> Context {
        let mut ctx = Context::new();
        if let Some(greeting) = &self.context.greeting {
            ctx.add_greeting(greeting);
        }
        if let Some(startup) = &self.context.startup {
            ctx.add_script(startup);
        }
        if !self.context.extra_template_paths.is_empty() {
            ctx.insert(
                keys::EXTRA_TEMPLATE_PATHS,
                self.context.extra_template_paths.clone(),
            );
        }
        ctx.ensure_hash();

        ctx.insert(keys::ALLOW_ORIGIN, host_url);
        ctx.insert(keys::NOTEBOOK_PATH, format!("/session/{name}/"));
        let public_url = route_to_alt_domain(host_url, host_url, self.alternative_domain.as_deref());
        ctx.insert(keys::WEBSOCKET_URL, to_websocket_scheme(&public_url));
        ctx
    }
}

fn to_websocket_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<NotebookSessionManager>,
    pub proxy: proxy::ReverseProxy,
    pub launch: Arc<LaunchConfig>,
    /// Cancelled on server shutdown; closes open websocket bridges.
    pub shutdown: CancellationToken,
}

/// Configuration for the HTTP/WS router.
///
/// Use `RouterConfig::default()` in tests for a setup without identity checks.
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    pub trusted_user_header: Option<HeaderName>,
}

pub fn router(state: AppState, config: RouterConfig) -> Router {
    let trusted_user_header = config.trusted_user_header;
    Router::new()
        .route("/health", get(health))
        .route("/launch/{name}", get(launch))
        .route("/status/{name}", get(session_status))
        .route("/session/{name}", any(session_proxy))
        .route("/session/{name}/", any(session_proxy))
        .route(
            "/session/{name}/shutdown",
            post(shutdown_session).fallback(session_proxy),
        )
        .route("/session/{name}/{*rest}", any(session_proxy))
        .layer(axum::middleware::from_fn(move |req, next| {
            let header = trusted_user_header.clone();
            identity::check_trusted_user(header, req, next)
        }))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
