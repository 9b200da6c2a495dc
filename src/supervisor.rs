//! Tag-based supervision of a single detached OS process.
//!
//! A supervised process is identified by a tag argument that appears verbatim
//! in its argument vector, not by a pid file, so losing the pid file does not
//! orphan the process. The tag is only as unique as the caller makes it: two
//! processes carrying the same tag are indistinguishable and `find` returns
//! whichever the process table lists first.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use thiserror::Error;

use crate::context::pid_is_alive;

/// Tags shorter than this are rejected outright.
pub const MIN_TAG_LEN: usize = 7;

/// Delay between spawning a process and looking for it by tag.
const SPAWN_SETTLE: Duration = Duration::from_millis(200);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Upper bound on waiting for a SIGKILLed process to disappear.
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("could not find command {0}")]
    NotFound(String),

    #[error("tag {0:?} is too short, use at least 7 characters")]
    TagTooShort(String),

    #[error("spawned {executable} but could not find it again by tag {tag}")]
    SpawnedProcessNotFound { executable: String, tag: String },

    #[error("failed to spawn {executable}: {source}")]
    Spawn {
        executable: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("process scan task failed: {0}")]
    Scan(#[from] tokio::task::JoinError),
}

/// A process found in the OS process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: u32,
    pub cmdline: Vec<String>,
}

impl ProcessHandle {
    pub fn is_running(&self) -> bool {
        pid_is_alive(self.pid)
    }

    /// Ask the process to exit (SIGTERM).
    pub fn terminate(&self) -> Result<(), SupervisorError> {
        self.signal(libc::SIGTERM)
    }

    /// Kill the process outright (SIGKILL).
    ///
    /// A process leading its own process group (everything started by
    /// [`spawn_detached`]) is killed together with its group, so children it
    /// had no chance to clean up go with it.
    pub fn kill(&self) -> Result<(), SupervisorError> {
        if self.leads_process_group() {
            self.signal_target(-(self.pid as i32), libc::SIGKILL)
        } else {
            self.signal(libc::SIGKILL)
        }
    }

    fn leads_process_group(&self) -> bool {
        if self.pid == 0 || self.pid > i32::MAX as u32 {
            return false;
        }
        let pgid = unsafe { libc::getpgid(self.pid as i32) };
        // Never our own group.
        pgid == self.pid as i32 && pgid != unsafe { libc::getpgrp() }
    }

    fn signal(&self, signal: libc::c_int) -> Result<(), SupervisorError> {
        if self.pid == 0 || self.pid > i32::MAX as u32 {
            tracing::warn!(pid = self.pid, "PID is 0 or exceeds i32::MAX, cannot send signal");
            return Ok(());
        }
        self.signal_target(self.pid as i32, signal)
    }

    fn signal_target(&self, target: i32, signal: libc::c_int) -> Result<(), SupervisorError> {
        let rc = unsafe { libc::kill(target, signal) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            // Already gone is fine.
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(SupervisorError::Signal {
                    pid: self.pid,
                    source: err,
                });
            }
        }
        Ok(())
    }

    /// Poll until the process has exited or `timeout` elapses.
    pub async fn wait_exit(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.is_running() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Resolve `name` through `PATH` and follow symlinks to a canonical path.
pub fn resolve_executable(name: &str) -> Result<PathBuf, SupervisorError> {
    let found = which::which(name).map_err(|_| SupervisorError::NotFound(name.to_string()))?;
    std::fs::canonicalize(&found).map_err(|_| SupervisorError::NotFound(name.to_string()))
}

/// Scan the process table for a process whose arguments contain `tag`.
///
/// The calling process is never returned, so a CLI invocation that carries the
/// tag on its own command line does not find itself. Processes whose command
/// line cannot be read are skipped.
pub fn find_by_tag(tag: &str) -> Option<ProcessHandle> {
    let own_pid = std::process::id();
    list_processes()
        .into_iter()
        .filter(|p| p.pid != own_pid)
        .find(|p| p.cmdline.iter().any(|arg| arg == tag))
}

#[cfg(target_os = "linux")]
fn list_processes() -> Vec<ProcessHandle> {
    let entries = match std::fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(error = %e, "cannot list /proc");
            return Vec::new();
        }
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .filter_map(|pid| {
            let cmdline = read_cmdline(pid)?;
            Some(ProcessHandle { pid, cmdline })
        })
        .collect()
}

#[cfg(target_os = "linux")]
fn read_cmdline(pid: u32) -> Option<Vec<String>> {
    let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    let args: Vec<String> = raw
        .split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect();
    // Kernel threads and zombies have an empty command line.
    if args.is_empty() {
        None
    } else {
        Some(args)
    }
}

// Without procfs there is no dependency-free way to read another process's
// argument vector, so nothing is ever found.
#[cfg(not(target_os = "linux"))]
fn list_processes() -> Vec<ProcessHandle> {
    Vec::new()
}

/// Launch `executable args...` detached from the caller.
///
/// The child gets its own process group and no terminal on stdin, so it
/// survives the launcher exiting or being interrupted. Its exit status is
/// collected by a background thread so a long-lived launcher does not
/// accumulate zombies.
pub fn spawn_detached(
    executable: &Path,
    args: &[String],
    stdout: Option<&Path>,
    stderr: Option<&Path>,
) -> Result<u32, SupervisorError> {
    let spawn_err = |source: io::Error| SupervisorError::Spawn {
        executable: executable.display().to_string(),
        source,
    };

    let mut cmd = Command::new(executable);
    cmd.args(args).stdin(Stdio::null());
    cmd.stdout(match stdout {
        Some(path) => Stdio::from(File::create(path).map_err(spawn_err)?),
        None => Stdio::null(),
    });
    cmd.stderr(match stderr {
        Some(path) => Stdio::from(File::create(path).map_err(spawn_err)?),
        None => Stdio::null(),
    });

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut child = cmd.spawn().map_err(spawn_err)?;
    let pid = child.id();
    std::thread::spawn(move || {
        let _ = child.wait();
    });
    tracing::debug!(pid, executable = %executable.display(), "spawned detached process");
    Ok(pid)
}

/// Supervises the one process identified by `tag`.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    executable: PathBuf,
    tag: String,
    args: Vec<String>,
    stdout: Option<PathBuf>,
    stderr: Option<PathBuf>,
}

impl ProcessSupervisor {
    /// `args` are passed after the executable; the tag is appended unless the
    /// caller already placed it somewhere in `args`.
    pub fn new(
        executable: PathBuf,
        tag: impl Into<String>,
        args: Vec<String>,
    ) -> Result<Self, SupervisorError> {
        let tag = tag.into();
        if tag.chars().count() < MIN_TAG_LEN {
            return Err(SupervisorError::TagTooShort(tag));
        }
        Ok(Self {
            executable,
            tag,
            args,
            stdout: None,
            stderr: None,
        })
    }

    /// Like [`ProcessSupervisor::new`], resolving `command` through `PATH`.
    pub fn for_command(
        command: &str,
        tag: impl Into<String>,
        args: Vec<String>,
    ) -> Result<Self, SupervisorError> {
        Self::new(resolve_executable(command)?, tag, args)
    }

    /// Redirect the spawned process's stdout and stderr to files.
    pub fn with_output(mut self, stdout: PathBuf, stderr: PathBuf) -> Self {
        self.stdout = Some(stdout);
        self.stderr = Some(stderr);
        self
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Arguments the process is spawned with (excluding the executable).
    pub fn command_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        if !args.iter().any(|a| a == &self.tag) {
            args.push(self.tag.clone());
        }
        args
    }

    pub async fn find(&self) -> Result<Option<ProcessHandle>, SupervisorError> {
        let tag = self.tag.clone();
        Ok(tokio::task::spawn_blocking(move || find_by_tag(&tag)).await?)
    }

    pub fn spawn_detached(&self) -> Result<u32, SupervisorError> {
        spawn_detached(
            &self.executable,
            &self.command_args(),
            self.stdout.as_deref(),
            self.stderr.as_deref(),
        )
    }

    /// Return the tagged process, spawning it if needed.
    ///
    /// With `force_respawn` an existing process is killed first. The boolean
    /// is `true` when a new process was started. A freshly spawned process that
    /// cannot be found again means the tag is not unique or the process died
    /// immediately; that is reported as
    /// [`SupervisorError::SpawnedProcessNotFound`] and never retried.
    pub async fn get_or_spawn(
        &self,
        force_respawn: bool,
    ) -> Result<(ProcessHandle, bool), SupervisorError> {
        if let Some(existing) = self.find().await? {
            if !force_respawn {
                return Ok((existing, false));
            }
            tracing::info!(pid = existing.pid, tag = %self.tag, "killing existing process before respawn");
            existing.kill()?;
            if !existing.wait_exit(KILL_GRACE).await {
                tracing::warn!(pid = existing.pid, "process still present after SIGKILL");
            }
        }

        let spawned_pid = self.spawn_detached()?;
        tokio::time::sleep(SPAWN_SETTLE).await;

        match self.find().await? {
            Some(proc) => {
                tracing::info!(pid = proc.pid, spawned_pid, tag = %self.tag, "process spawned");
                Ok((proc, true))
            }
            None => Err(SupervisorError::SpawnedProcessNotFound {
                executable: self.executable.display().to_string(),
                tag: self.tag.clone(),
            }),
        }
    }

    /// Stop the tagged process: SIGTERM, wait up to `timeout`, then SIGKILL.
    ///
    /// Returns `false` if no tagged process was running.
    pub async fn stop(&self, timeout: Duration) -> Result<bool, SupervisorError> {
        let Some(proc) = self.find().await? else {
            tracing::debug!(tag = %self.tag, "no process to stop");
            return Ok(false);
        };

        tracing::info!(pid = proc.pid, tag = %self.tag, "stopping process");
        proc.terminate()?;
        if proc.wait_exit(timeout).await {
            return Ok(true);
        }

        tracing::warn!(pid = proc.pid, ?timeout, "process ignored SIGTERM, sending SIGKILL");
        proc.kill()?;
        if !proc.wait_exit(KILL_GRACE).await {
            tracing::warn!(pid = proc.pid, "process still present after SIGKILL");
        }
        Ok(true)
    }
}
