use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::{ConfigError, Settings};
use crate::context::{self, keys, Context};

/// Name of the pid file inside a session's work folder.
pub const PID_FILE_NAME: &str = "notebook.pid";

const MAX_NAME_LEN: usize = 64;

const PID_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("invalid session name: {0:?}")]
    InvalidName(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no free port in range {min}..{max}")]
    NoFreePort { min: u16, max: u32 },

    #[error("backend command `{action}` failed with exit code {code:?}: {stderr}")]
    BackendCommand {
        action: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("failed to run backend {executable}: {source}")]
    Spawn {
        executable: String,
        #[source]
        source: std::io::Error,
    },
}

/// Session names become directory names, so only a conservative character set
/// is accepted and names made only of dots are refused.
pub fn validate_session_name(name: &str) -> Result<(), SessionError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !name.chars().all(|c| c == '.');
    if valid {
        Ok(())
    } else {
        Err(SessionError::InvalidName(name.to_string()))
    }
}

/// The argument naming session `name` on backend command lines. The daemon
/// derives its process tag from it.
pub fn session_arg(name: &str) -> String {
    format!("--session={name}")
}

/// Everything the manager needs, resolved from [`Settings`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub notebook_folder: PathBuf,
    pub min_port: u16,
    pub port_range: u16,
    pub kill_timeout: u64,
    pub stop_timeout: Duration,
    pub settle_delay: Duration,
    pub spawn_timeout: Duration,
    pub backend_executable: PathBuf,
    pub kernel_command: Vec<String>,
}

impl ManagerConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        settings.validate()?;
        let backend_executable = match &settings.backend_executable {
            Some(path) => path.clone(),
            None => std::env::current_exe().map_err(|e| {
                ConfigError::Invalid(format!("cannot determine backend executable: {e}"))
            })?,
        };
        Ok(Self {
            notebook_folder: settings.notebook_folder()?.to_path_buf(),
            min_port: settings.min_port()?,
            port_range: settings.port_range()?,
            kill_timeout: settings.kill_timeout()?,
            stop_timeout: settings.stop_timeout(),
            settle_delay: settings.settle_delay(),
            spawn_timeout: settings.spawn_timeout(),
            backend_executable,
            kernel_command: settings.kernel_command.clone(),
        })
    }
}

/// Starts, reuses and stops one detached backend per session name.
///
/// The manager holds no per-session state in memory: everything it knows
/// comes from the context file and the process table, so several front door
/// processes can share a notebook folder. Within one process, `ensure` and
/// `stop` for the same name run one at a time.
#[derive(Debug, Clone)]
pub struct NotebookSessionManager {
    config: ManagerConfig,
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl NotebookSessionManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn session_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// `<notebook_folder>/<name>`, created on first access.
    pub fn work_folder(&self, name: &str) -> Result<PathBuf, SessionError> {
        validate_session_name(name)?;
        let folder = self.config.notebook_folder.join(name);
        std::fs::create_dir_all(&folder)?;
        Ok(folder)
    }

    pub fn pid_file(&self, name: &str) -> Result<PathBuf, SessionError> {
        Ok(self.work_folder(name)?.join(PID_FILE_NAME))
    }

    /// Pick a random port in the configured range that can be bound right now.
    ///
    /// Nothing reserves the port afterwards; two concurrent launches may pick
    /// the same one.
    pub fn pick_port(&self) -> Result<u16, SessionError> {
        use rand::seq::SliceRandom;

        let min = self.config.min_port;
        let max = u32::from(min) + u32::from(self.config.port_range);
        let mut candidates: Vec<u16> = (u32::from(min)..max)
            .filter_map(|p| u16::try_from(p).ok())
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates
            .into_iter()
            .find(|port| std::net::TcpListener::bind(("127.0.0.1", *port)).is_ok())
            .ok_or(SessionError::NoFreePort { min, max })
    }

    /// The context of a running session, or `None` for an absent one.
    ///
    /// Running means the backend has published a live `pid` and its
    /// `http_port`. A context still holding only the parent's pre-spawn state
    /// (a starting or failed backend) counts as absent.
    pub fn status(&self, name: &str) -> Result<Option<Context>, SessionError> {
        let pid_file = self.pid_file(name)?;
        Ok(context::get_context(&pid_file, false)
            .filter(|ctx| ctx.pid().is_some() && ctx.http_port().is_some()))
    }

    pub fn is_running(&self, name: &str) -> Result<bool, SessionError> {
        Ok(self.status(name)?.is_some())
    }

    /// Make sure a backend with the configuration `desired` runs for `name`.
    ///
    /// Returns the backend's context and whether a new backend was started.
    /// A running backend whose `context_hash` differs from the desired one is
    /// stopped and replaced.
    pub async fn ensure(
        &self,
        name: &str,
        mut desired: Context,
    ) -> Result<(Context, bool), SessionError> {
        validate_session_name(name)?;
        desired.ensure_hash();
        let lock = self.session_lock(name);
        let _guard = lock.lock().await;

        if let Some(current) = self.status(name)? {
            if current.same_configuration(&desired) {
                tracing::debug!(session = %name, "reusing running backend");
                return Ok((current, false));
            }
            tracing::info!(session = %name, "backend configuration changed, restarting");
            self.stop_backend(name).await?;
            tokio::time::sleep(self.config.settle_delay).await;
        }

        let port = self.pick_port()?;
        desired.insert(keys::HTTP_PORT, port);
        let websocket_url = match desired.get_str(keys::WEBSOCKET_URL) {
            Some(template) => template.replace("{port}", &port.to_string()),
            None => format!("ws://localhost:{port}"),
        };
        desired.insert(keys::WEBSOCKET_URL, websocket_url);

        let pid_file = self.pid_file(name)?;
        context::set_context(&pid_file, &desired)?;

        tracing::info!(session = %name, port, "starting backend");
        self.run_backend_command(name, "restart", Some(port)).await?;
        tokio::time::sleep(self.config.settle_delay).await;

        let context = self.wait_for_pid(&pid_file, desired).await;
        Ok((context, true))
    }

    /// Stop the backend of `name` (SIGTERM, then SIGKILL after the stop timeout).
    pub async fn stop(&self, name: &str) -> Result<(), SessionError> {
        validate_session_name(name)?;
        let lock = self.session_lock(name);
        let _guard = lock.lock().await;
        self.stop_backend(name).await
    }

    async fn stop_backend(&self, name: &str) -> Result<(), SessionError> {
        tracing::info!(session = %name, "stopping backend");
        self.run_backend_command(name, "stop", None).await?;
        Ok(())
    }

    /// Poll the context until the backend has published a live pid.
    ///
    /// Gives up after the spawn timeout and returns the last context seen,
    /// which then has no `pid`.
    async fn wait_for_pid(&self, pid_file: &Path, fallback: Context) -> Context {
        let deadline = tokio::time::Instant::now() + self.config.spawn_timeout;
        let mut last = fallback;
        loop {
            if let Some(ctx) = context::get_context(pid_file, false) {
                if ctx.pid().is_some() {
                    return ctx;
                }
                last = ctx;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    pid_file = %pid_file.display(),
                    timeout = ?self.config.spawn_timeout,
                    "backend did not publish its pid in time"
                );
                return last;
            }
            tokio::time::sleep(PID_POLL_INTERVAL).await;
        }
    }

    /// Arguments for `<backend_executable> daemon <action> ...`.
    pub fn backend_args(
        &self,
        name: &str,
        action: &str,
        port: Option<u16>,
    ) -> Result<Vec<String>, SessionError> {
        let work_folder = self.work_folder(name)?;
        let pid_file = work_folder.join(PID_FILE_NAME);
        let mut args = vec![
            "daemon".to_string(),
            action.to_string(),
            pid_file.display().to_string(),
            work_folder.display().to_string(),
            port.unwrap_or(0).to_string(),
            self.config.kill_timeout.to_string(),
            format!("--stop-timeout={}", self.config.stop_timeout.as_secs()),
            session_arg(name),
        ];
        if matches!(action, "start" | "restart" | "fg") && !self.config.kernel_command.is_empty() {
            args.push("--".to_string());
            args.extend(self.config.kernel_command.iter().cloned());
        }
        Ok(args)
    }

    async fn run_backend_command(
        &self,
        name: &str,
        action: &str,
        port: Option<u16>,
    ) -> Result<String, SessionError> {
        let args = self.backend_args(name, action, port)?;
        let executable = &self.config.backend_executable;
        tracing::debug!(executable = %executable.display(), ?args, "running backend command");

        let output = tokio::process::Command::new(executable)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| SessionError::Spawn {
                executable: executable.display().to_string(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            tracing::error!(
                session = %name,
                action,
                code = ?output.status.code(),
                %stdout,
                %stderr,
                "backend command failed"
            );
            return Err(SessionError::BackendCommand {
                action: action.to_string(),
                code: output.status.code(),
                stdout,
                stderr,
            });
        }
        Ok(stdout)
    }
}
