//! nbgate - per-user notebook gateway
//!
//! Launches one detached notebook backend per user on demand and proxies HTTP
//! and WebSocket traffic to it.
//!
//! ## Modes
//!
//! **Server mode** (`nbgate serve`): runs the HTTP front door.
//!
//! **Daemon mode** (`nbgate daemon <action> ...`): the backend entry point the
//! front door invokes to start, stop and inspect session backends.
//!
//! **Session commands** (`ensure`, `stop`, `status`): drive a session's backend
//! from the command line using the same configuration as the server.

use axum::http::HeaderName;
use clap::{Parser as ClapParser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use nbgate::{
    api,
    config::{self, ConfigError, Settings},
    daemon::{self, DaemonArgs, DaemonError},
    session::{ManagerConfig, NotebookSessionManager, SessionError},
};

/// nbgate - per-user notebook gateway
#[derive(ClapParser, Debug)]
#[command(name = "nbgate", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the TOML configuration file
    #[arg(long, global = true, env = "NBGATE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP front door
    Serve {
        /// Address to bind (overrides the config file)
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
    /// Backend daemon entry point
    Daemon(DaemonArgs),
    /// Start or reuse the backend of a session and print its context
    Ensure {
        /// Session (user) name
        name: String,
    },
    /// Stop the backend of a session
    Stop {
        /// Session (user) name
        name: String,
    },
    /// Print the context of a running session backend
    Status {
        /// Session (user) name
        name: String,
    },
}

#[derive(Error, Debug)]
pub enum NbgateError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("daemon error: {0}")]
    Daemon(#[from] DaemonError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), NbgateError> {
    let cli = Cli::parse();

    // Daemon actions print JSON on stdout; detached daemons have stderr
    // redirected to the session log.
    if matches!(cli.command, Commands::Daemon(_)) {
        init_tracing_stderr();
    } else {
        init_tracing();
    }

    match cli.command {
        Commands::Daemon(args) => {
            let code = daemon::run(args).await?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Commands::Serve { bind } => {
            let settings = load_settings(cli.config)?;
            run_server(settings, bind).await
        }
        Commands::Ensure { name } => {
            let settings = load_settings(cli.config)?;
            run_ensure(settings, name).await
        }
        Commands::Stop { name } => {
            let manager = build_manager(&load_settings(cli.config)?)?;
            manager.stop(&name).await?;
            println!("{}", serde_json::json!({ "name": name, "stopped": true }));
            Ok(())
        }
        Commands::Status { name } => {
            let manager = build_manager(&load_settings(cli.config)?)?;
            let context = manager.status(&name)?;
            println!("{}", serde_json::to_string(&context)?);
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "nbgate=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Initialize tracing with stderr output.
fn init_tracing_stderr() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "nbgate=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_settings(path: Option<PathBuf>) -> Result<Settings, NbgateError> {
    let path = path.unwrap_or_else(config::default_config_path);
    tracing::debug!(path = %path.display(), "loading config");
    Ok(Settings::load(&path)?)
}

fn build_manager(settings: &Settings) -> Result<NotebookSessionManager, NbgateError> {
    let manager_config = ManagerConfig::from_settings(settings)?;
    std::fs::create_dir_all(&manager_config.notebook_folder)?;
    Ok(NotebookSessionManager::new(manager_config))
}

// ── Server mode ────────────────────────────────────────────────────

async fn run_server(settings: Settings, bind: Option<SocketAddr>) -> Result<(), NbgateError> {
    tracing::info!("nbgate server starting");

    let trusted_user_header = settings
        .server
        .trusted_user_header
        .as_deref()
        .map(|name| {
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                ConfigError::Invalid(format!("trusted_user_header {name:?}: {e}"))
            })
        })
        .transpose()?;
    if let Some(header) = &trusted_user_header {
        tracing::info!(%header, "requiring trusted identity header");
    }

    let shutdown = CancellationToken::new();
    let state = api::AppState {
        manager: Arc::new(build_manager(&settings)?),
        proxy: api::proxy::ReverseProxy::new(),
        launch: Arc::new(api::LaunchConfig::from_settings(&settings)),
        shutdown: shutdown.clone(),
    };
    let app = api::router(state, api::RouterConfig { trusted_user_header });

    let bind = bind.unwrap_or_else(|| settings.bind());
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %bind, "HTTP/WS server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_shutdown_signal().await;
            // Close websocket bridges so graceful shutdown can finish.
            shutdown.cancel();
        })
        .await?;

    tracing::info!("nbgate server stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("received Ctrl+C"),
        _ = sigterm.recv() => tracing::info!("received SIGTERM"),
    }
}

// ── Session commands ───────────────────────────────────────────────

async fn run_ensure(settings: Settings, name: String) -> Result<(), NbgateError> {
    let manager = build_manager(&settings)?;
    let launch = api::LaunchConfig::from_settings(&settings);
    let host_url = format!("http://{}", settings.bind());
    let (context, created) = manager.ensure(&name, launch.context_for(&name, &host_url)).await?;
    println!(
        "{}",
        serde_json::json!({ "name": name, "created": created, "context": context })
    );
    Ok(())
}
