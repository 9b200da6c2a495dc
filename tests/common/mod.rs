#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use nbgate::api::{self, proxy::ReverseProxy, AppState, LaunchConfig, RouterConfig};
use nbgate::context::{self, keys, Context};
use nbgate::session::{session_arg, ManagerConfig, NotebookSessionManager};

/// The built `nbgate` binary, used as the backend executable.
pub fn nbgate_exe() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_nbgate"))
}

/// Manager whose backends run `sleep 60` as their kernel.
pub fn create_test_manager(folder: &Path, min_port: u16, port_range: u16) -> NotebookSessionManager {
    NotebookSessionManager::new(ManagerConfig {
        notebook_folder: folder.to_path_buf(),
        min_port,
        port_range,
        kill_timeout: 120,
        stop_timeout: Duration::from_secs(5),
        settle_delay: Duration::from_millis(100),
        spawn_timeout: Duration::from_secs(10),
        backend_executable: nbgate_exe(),
        kernel_command: vec!["sleep".to_string(), "60".to_string()],
    })
}

/// Create a test AppState around `manager`.
pub fn create_test_state(manager: NotebookSessionManager) -> AppState {
    AppState {
        manager: Arc::new(manager),
        proxy: ReverseProxy::new(),
        launch: Arc::new(LaunchConfig::default()),
        shutdown: CancellationToken::new(),
    }
}

/// Pretend a backend for `name` runs on `port`: the context names this test
/// process as the daemon, which is alive for as long as the test runs.
pub fn fake_running_session(manager: &NotebookSessionManager, name: &str, port: u16) {
    let mut ctx = Context::new();
    ctx.insert(keys::HTTP_PORT, port);
    ctx.insert(keys::PID, std::process::id());
    context::set_context(&manager.pid_file(name).unwrap(), &ctx).unwrap();
}

/// Starts an HTTP server and returns its address.
pub async fn start_server(app: axum::Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}

/// Starts the gateway router for `state` and returns its address.
pub async fn start_gateway(state: AppState) -> SocketAddr {
    start_server(api::router(state, RouterConfig::default())).await
}

/// A port nothing listens on (bound, then released).
pub fn dead_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Stops the session's backend when dropped, even if the test panicked.
pub struct SessionGuard {
    pid_file: PathBuf,
    name: String,
}

impl SessionGuard {
    pub fn new(manager: &NotebookSessionManager, name: &str) -> Self {
        Self {
            pid_file: manager.pid_file(name).unwrap(),
            name: name.to_string(),
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let _ = std::process::Command::new(nbgate_exe())
            .arg("daemon")
            .arg("stop")
            .arg(&self.pid_file)
            .arg("--stop-timeout=2")
            .arg(session_arg(&self.name))
            .output();
    }
}

/// Poll `check` every 50 ms until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}
