//! Backend entry point: `nbgate daemon <action> <pid_file> ...`.
//!
//! `start` and `restart` launch a detached copy of this binary running the
//! `fg` action, identified by its `--tag=` argument. The `fg` process owns the
//! session work folder: it publishes its pid and port through the context
//! file, prepares the notebook files, runs the kernel command and enforces the
//! dead-man's switch.

use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};

use crate::context::{self, keys, Context};
use crate::supervisor::{self, ProcessSupervisor, SupervisorError};

/// Exit code used when the dead-man's switch fires.
pub const DEADMAN_EXIT_CODE: i32 = 66;

pub const NOTEBOOK_NAME: &str = "default.ipynb";
pub const STDOUT_LOG: &str = "notebook.stdout.log";
pub const STDERR_LOG: &str = "notebook.stderr.log";

const DEFAULT_BASE_URL: &str = "/notebook";

const WELCOME_TEXT: &str = "Welcome to *nbgate*! This notebook runs in your own private session.";

/// Tag value of the `fg` daemon serving session `name`.
pub fn session_tag(name: &str) -> String {
    format!("nbgate-session-{name}")
}

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing argument: {0}")]
    MissingArgument(&'static str),

    #[error("detached daemon needs a context file and could not read one from {0}")]
    MissingContext(PathBuf),

    #[error("context in {0} was left by a terminated daemon")]
    TerminatedContext(PathBuf),

    #[error("no kernel command given")]
    NoKernelCommand,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonAction {
    /// Spawn the detached daemon unless it already runs
    Start,
    /// Spawn the detached daemon, killing a running one first
    Restart,
    /// Stop the running daemon
    Stop,
    /// Print the daemon's context, or null
    Status,
    /// Run the daemon in the foreground
    Fg,
}

#[derive(clap::Args, Debug, Clone)]
pub struct DaemonArgs {
    #[arg(value_enum)]
    pub action: DaemonAction,

    /// Pid file; the context file lives next to it
    pub pid_file: PathBuf,

    /// Session work folder (defaults to the pid file's folder)
    pub work_folder: Option<PathBuf>,

    /// Port the kernel listens on
    pub port: Option<u16>,

    /// Dead-man's switch in seconds
    pub kill_timeout: Option<u64>,

    /// Process tag; defaults to one derived from `--session`, else from the pid file
    #[arg(long)]
    pub tag: Option<String>,

    /// Session name the daemon serves. Launchers pass this instead of `--tag`
    /// so that only the spawned `fg` process carries the tag.
    #[arg(long)]
    pub session: Option<String>,

    /// Running detached from a launcher (a context file is then mandatory)
    #[arg(long)]
    pub detached: bool,

    /// Seconds between SIGTERM and SIGKILL when stopping
    #[arg(long, default_value_t = 10)]
    pub stop_timeout: u64,

    /// Kernel command and its arguments
    #[arg(last = true)]
    pub kernel_command: Vec<String>,
}

/// Immutable daemon settings resolved from the command line.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub pid_file: PathBuf,
    pub work_folder: PathBuf,
    pub port: Option<u16>,
    pub kill_timeout: Option<Duration>,
    pub stop_timeout: Duration,
    /// Tag in its command line form, `--tag=<value>`.
    pub tag: String,
    pub detached: bool,
    pub kernel_command: Vec<String>,
}

impl DaemonConfig {
    pub fn from_args(args: &DaemonArgs) -> Self {
        let work_folder = args.work_folder.clone().unwrap_or_else(|| {
            args.pid_file
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        });
        let tag = match (&args.tag, &args.session) {
            (Some(tag), _) => format!("--tag={tag}"),
            (None, Some(session)) => format!("--tag={}", session_tag(session)),
            (None, None) => format!("--tag=nbgate-daemon-{}", args.pid_file.display()),
        };
        Self {
            pid_file: args.pid_file.clone(),
            work_folder,
            port: args.port.filter(|p| *p != 0),
            kill_timeout: args
                .kill_timeout
                .filter(|t| *t != 0)
                .map(Duration::from_secs),
            stop_timeout: Duration::from_secs(args.stop_timeout),
            tag,
            detached: args.detached,
            kernel_command: args.kernel_command.clone(),
        }
    }

    fn port(&self) -> Result<u16, DaemonError> {
        self.port.ok_or(DaemonError::MissingArgument("port"))
    }

    fn kill_timeout(&self) -> Result<Duration, DaemonError> {
        self.kill_timeout
            .ok_or(DaemonError::MissingArgument("kill_timeout"))
    }

    /// Arguments of the detached `fg` process started by `start`/`restart`.
    pub fn foreground_args(&self) -> Result<Vec<String>, DaemonError> {
        let mut args = vec![
            "daemon".to_string(),
            "fg".to_string(),
            self.pid_file.display().to_string(),
            self.work_folder.display().to_string(),
            self.port()?.to_string(),
            self.kill_timeout()?.as_secs().to_string(),
            format!("--stop-timeout={}", self.stop_timeout.as_secs()),
            "--detached".to_string(),
            self.tag.clone(),
        ];
        if !self.kernel_command.is_empty() {
            args.push("--".to_string());
            args.extend(self.kernel_command.iter().cloned());
        }
        Ok(args)
    }

    fn supervisor(&self) -> Result<ProcessSupervisor, DaemonError> {
        let exe = std::fs::canonicalize(std::env::current_exe()?)?;
        Ok(ProcessSupervisor::new(exe, self.tag.clone(), self.foreground_args().unwrap_or_default())?
            .with_output(
                self.work_folder.join(STDOUT_LOG),
                self.work_folder.join(STDERR_LOG),
            ))
    }
}

/// Run one daemon action and return the process exit code.
pub async fn run(args: DaemonArgs) -> Result<i32, DaemonError> {
    let config = DaemonConfig::from_args(&args);
    match args.action {
        DaemonAction::Start | DaemonAction::Restart => {
            // Validate before spawning anything.
            config.foreground_args()?;
            if config.kernel_command.is_empty() {
                return Err(DaemonError::NoKernelCommand);
            }
            std::fs::create_dir_all(&config.work_folder)?;
            let supervisor = config.supervisor()?;
            let force = args.action == DaemonAction::Restart;
            let (proc, created) = supervisor.get_or_spawn(force).await?;
            println!("{}", json!({ "pid": proc.pid, "created": created }));
            Ok(0)
        }
        DaemonAction::Stop => {
            let stopped = config.supervisor()?.stop(config.stop_timeout).await?;
            println!("{}", json!({ "stopped": stopped }));
            Ok(0)
        }
        DaemonAction::Status => {
            let status = context::get_context(&config.pid_file, false);
            println!("{}", serde_json::to_string(&status)?);
            Ok(0)
        }
        DaemonAction::Fg => run_foreground(&config).await,
    }
}

/// Why the foreground daemon is shutting down.
enum Shutdown {
    KernelExited(std::io::Result<ExitStatus>),
    DeadMan,
    Signal(&'static str),
}

async fn run_foreground(config: &DaemonConfig) -> Result<i32, DaemonError> {
    let port = config.port()?;
    let kill_timeout = config.kill_timeout()?;
    if config.kernel_command.is_empty() {
        return Err(DaemonError::NoKernelCommand);
    }

    std::fs::create_dir_all(&config.work_folder)?;
    let work_folder = std::fs::canonicalize(&config.work_folder)?;
    std::env::set_current_dir(&work_folder)?;
    tracing::info!(detached = config.detached, folder = %work_folder.display(), "starting notebook daemon");

    let mut ctx = match context::get_context(&config.pid_file, true) {
        Some(ctx) => ctx,
        None if config.detached => return Err(DaemonError::MissingContext(work_folder)),
        None => Context::new(),
    };
    if ctx.contains_key(keys::TERMINATED) {
        return Err(DaemonError::TerminatedContext(work_folder));
    }

    let pid = std::process::id();
    ctx.insert(keys::HTTP_PORT, port);
    ctx.insert(keys::PID, pid);
    ctx.insert(keys::KILL_TIMEOUT, kill_timeout.as_secs());
    context::set_context(&config.pid_file, &ctx)?;
    std::fs::write(&config.pid_file, format!("{pid}\n"))?;

    let notebook = work_folder.join(NOTEBOOK_NAME);
    create_named_notebook(&notebook, &ctx)?;
    let ipython_dir = work_folder.join(".ipython");
    if let Some(startup) = ctx.get_str(keys::STARTUP) {
        let path = write_startup_script(&ipython_dir, startup)?;
        tracing::info!(path = %path.display(), "dropped startup script");
    }

    let argv = expand_placeholders(&config.kernel_command, &ctx, port, &work_folder, &notebook);
    let program = if argv[0].contains('/') {
        PathBuf::from(&argv[0])
    } else {
        supervisor::resolve_executable(&argv[0])?
    };
    tracing::info!(port, ?argv, "launching kernel");

    // Multi-call binaries dispatch on argv[0].
    let mut command = tokio::process::Command::new(&program);
    command
        .arg0(&argv[0])
        .args(&argv[1..])
        .current_dir(&work_folder)
        .env("IPYTHONDIR", &ipython_dir)
        .stdin(Stdio::null())
        .kill_on_drop(true);
    die_with_daemon(&mut command);
    let mut kernel = command.spawn()?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let reason = tokio::select! {
        status = kernel.wait() => Shutdown::KernelExited(status),
        _ = tokio::time::sleep(kill_timeout) => Shutdown::DeadMan,
        _ = sigterm.recv() => Shutdown::Signal("SIGTERM"),
        _ = sigint.recv() => Shutdown::Signal("SIGINT"),
    };

    let code = match reason {
        Shutdown::KernelExited(status) => {
            let status = status?;
            tracing::info!(%status, "kernel exited");
            status.code().unwrap_or(1)
        }
        Shutdown::DeadMan => {
            tracing::warn!(?kill_timeout, "dead-man's switch fired, shutting down");
            stop_kernel(&mut kernel, config.stop_timeout).await;
            DEADMAN_EXIT_CODE
        }
        Shutdown::Signal(name) => {
            tracing::info!(signal = name, "received signal, shutting down");
            stop_kernel(&mut kernel, config.stop_timeout).await;
            0
        }
    };

    let _ = std::fs::remove_file(&config.pid_file);
    context::clear_context(&config.pid_file);
    Ok(code)
}

/// Make the kernel receive SIGTERM when the daemon dies, even by SIGKILL.
///
/// The death signal follows the thread that forks; `run_foreground` runs on
/// the runtime's main thread, which lives as long as the daemon.
#[cfg(target_os = "linux")]
fn die_with_daemon(command: &mut tokio::process::Command) {
    let daemon_pid = std::process::id() as libc::pid_t;
    // SAFETY: only async-signal-safe libc calls between fork and exec.
    unsafe {
        command.pre_exec(move || {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            // The daemon died before the signal was armed.
            if libc::getppid() != daemon_pid {
                libc::raise(libc::SIGTERM);
            }
            Ok(())
        });
    }
}

#[cfg(not(target_os = "linux"))]
fn die_with_daemon(_command: &mut tokio::process::Command) {}

/// SIGTERM the kernel, escalating to SIGKILL after `timeout`.
async fn stop_kernel(kernel: &mut tokio::process::Child, timeout: Duration) {
    if let Some(pid) = kernel.id() {
        let handle = supervisor::ProcessHandle {
            pid,
            cmdline: Vec::new(),
        };
        if let Err(e) = handle.terminate() {
            tracing::warn!(error = %e, "failed to terminate kernel");
        }
    }
    match tokio::time::timeout(timeout, kernel.wait()).await {
        Ok(Ok(status)) => tracing::debug!(%status, "kernel stopped"),
        Ok(Err(e)) => tracing::warn!(error = %e, "failed waiting for kernel"),
        Err(_) => {
            tracing::warn!("kernel ignored SIGTERM, killing");
            if let Err(e) = kernel.kill().await {
                tracing::warn!(error = %e, "failed to kill kernel");
            }
        }
    }
}

/// Substitute `{port}` style placeholders in the kernel command.
pub fn expand_placeholders(
    command: &[String],
    ctx: &Context,
    port: u16,
    work_folder: &Path,
    notebook: &Path,
) -> Vec<String> {
    let base_url = ctx
        .get_str(keys::NOTEBOOK_PATH)
        .unwrap_or(DEFAULT_BASE_URL)
        .to_string();
    let allow_origin = ctx
        .get_str(keys::ALLOW_ORIGIN)
        .map(str::to_string)
        .unwrap_or_else(|| format!("http://localhost:{port}/"));
    let websocket_url = ctx
        .get_str(keys::WEBSOCKET_URL)
        .map(str::to_string)
        .unwrap_or_else(|| format!("ws://localhost:{port}"));
    let extra_template_paths = ctx
        .get(keys::EXTRA_TEMPLATE_PATHS)
        .cloned()
        .unwrap_or_else(|| json!([]))
        .to_string();

    let replacements = [
        ("{port}", port.to_string()),
        ("{base_url}", base_url),
        ("{allow_origin}", allow_origin),
        ("{websocket_url}", websocket_url),
        ("{work_folder}", work_folder.display().to_string()),
        ("{notebook}", notebook.display().to_string()),
        ("{extra_template_paths}", extra_template_paths),
    ];

    command
        .iter()
        .map(|arg| {
            replacements
                .iter()
                .fold(arg.clone(), |acc, (from, to)| acc.replace(from, to))
        })
        .collect()
}

/// Write `default.ipynb` unless it already exists.
///
/// The notebook has a welcome cell, the context greeting (if any) and an
/// empty code cell, in nbformat 4.
pub fn create_named_notebook(path: &Path, ctx: &Context) -> Result<(), DaemonError> {
    if path.exists() {
        return Ok(());
    }
    let mut cells = vec![markdown_cell(WELCOME_TEXT)];
    if let Some(greeting) = ctx.get_str(keys::GREETING).filter(|g| !g.trim().is_empty()) {
        cells.push(markdown_cell(greeting));
    }
    cells.push(json!({
        "cell_type": "code",
        "execution_count": null,
        "metadata": {},
        "outputs": [],
        "source": "",
    }));
    let notebook = json!({
        "cells": cells,
        "metadata": {},
        "nbformat": 4,
        "nbformat_minor": 0,
    });
    std::fs::write(path, serde_json::to_string_pretty(&notebook)?)?;
    Ok(())
}

fn markdown_cell(text: &str) -> serde_json::Value {
    json!({ "cell_type": "markdown", "metadata": {}, "source": text })
}

/// Drop the startup script where the kernel's default profile picks it up.
pub fn write_startup_script(ipython_dir: &Path, script: &str) -> std::io::Result<PathBuf> {
    let folder = ipython_dir.join("profile_default").join("startup");
    std::fs::create_dir_all(&folder)?;
    let path = folder.join("startup.py");
    std::fs::write(&path, script)?;
    Ok(path)
}
