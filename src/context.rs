//! Out-of-band context channel between the front door and a backend daemon.
//!
//! The parent writes `context.json` next to the session's pid file before it
//! spawns the daemon, the daemon overwrites it once it is running (adding its
//! own `pid` and confirmed `http_port`), and nobody deletes it afterwards so
//! the last known state can be inspected after a crash.
//!
//! The file is a flat JSON object. Unknown keys are carried through untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};

/// Name of the context file, always a sibling of the pid file.
pub const CONTEXT_FILE_NAME: &str = "context.json";

/// Well-known context keys.
pub mod keys {
    pub const CONTEXT_HASH: &str = "context_hash";
    pub const HTTP_PORT: &str = "http_port";
    pub const PID: &str = "pid";
    pub const WEBSOCKET_URL: &str = "websocket_url";
    pub const ALLOW_ORIGIN: &str = "allow_origin";
    pub const NOTEBOOK_PATH: &str = "notebook_path";
    pub const EXTRA_TEMPLATE_PATHS: &str = "extra_template_paths";
    pub const STARTUP: &str = "startup";
    pub const GREETING: &str = "greeting";
    pub const KILL_TIMEOUT: &str = "kill_timeout";
    pub const TERMINATED: &str = "terminated";
}

/// Configuration and state exchanged between parent and backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context(Map<String, Value>);

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn context_hash(&self) -> Option<&Value> {
        self.0.get(keys::CONTEXT_HASH)
    }

    pub fn http_port(&self) -> Option<u16> {
        self.0
            .get(keys::HTTP_PORT)
            .and_then(value_as_u64)
            .and_then(|p| u16::try_from(p).ok())
    }

    pub fn pid(&self) -> Option<u32> {
        self.0
            .get(keys::PID)
            .and_then(value_as_u64)
            .and_then(|p| u32::try_from(p).ok())
    }

    /// Two contexts describe the same configuration iff their `context_hash`
    /// values are equal. A context without a hash never matches.
    pub fn same_configuration(&self, other: &Context) -> bool {
        match (self.context_hash(), other.context_hash()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// SHA-256 over the canonical JSON encoding (keys are sorted).
    pub fn compute_hash(&self) -> String {
        let encoded = serde_json::to_vec(&self.0).unwrap_or_default();
        let digest = Sha256::digest(&encoded);
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Record a fingerprint of the current configuration unless the caller
    /// already supplied one.
    pub fn ensure_hash(&mut self) {
        if !self.contains_key(keys::CONTEXT_HASH) {
            let hash = self.compute_hash();
            self.insert(keys::CONTEXT_HASH, hash);
        }
    }

    /// Append a line (or several newline separated lines) to the startup script.
    pub fn add_script(&mut self, line: &str) {
        let mut startup = self.get_str(keys::STARTUP).unwrap_or_default().to_string();
        if !startup.ends_with('\n') {
            startup.push('\n');
        }
        startup.push_str(line);
        startup.push('\n');
        self.insert(keys::STARTUP, startup);
    }

    /// Append a markdown paragraph to the greeting shown in the notebook.
    pub fn add_greeting(&mut self, line: &str) {
        let mut greeting = self.get_str(keys::GREETING).unwrap_or_default().to_string();
        // Markdown hard paragraph break.
        if !greeting.ends_with("\n\n") {
            greeting.push_str("\n\n");
        }
        greeting.push_str(line);
        greeting.push_str("\n\n");
        self.insert(keys::GREETING, greeting);
    }
}

impl From<Map<String, Value>> for Context {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Numbers may arrive as JSON integers or as strings written by older tools.
fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Path of the context file belonging to `pid_file`.
pub fn context_file_for(pid_file: &Path) -> PathBuf {
    match pid_file.parent() {
        Some(dir) => dir.join(CONTEXT_FILE_NAME),
        None => PathBuf::from(CONTEXT_FILE_NAME),
    }
}

/// Write `context` next to `pid_file`.
///
/// Single writer per session is assumed. The data is written to a temporary
/// sibling first and renamed over the old file so a reader never observes a
/// half-written document from this side.
pub fn set_context(pid_file: &Path, context: &Context) -> io::Result<()> {
    let path = context_file_for(pid_file);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let data = serde_json::to_vec_pretty(context).map_err(io::Error::other)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, &path)?;
    tracing::debug!(path = %path.display(), "context written");
    Ok(())
}

/// Read the context belonging to `pid_file`.
///
/// Returns `None` when the file is missing, unreadable or malformed, or when
/// `daemon_side` is false and the recorded `pid` is no longer running. The
/// daemon reads with `daemon_side = true` because at that point the file still
/// carries the parent's pre-spawn state (or a dead predecessor's pid).
pub fn get_context(pid_file: &Path, daemon_side: bool) -> Option<Context> {
    let path = context_file_for(pid_file);
    let data = match std::fs::read(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "failed to read context file");
            return None;
        }
    };

    let context: Context = match serde_json::from_slice(&data) {
        Ok(context) => context,
        Err(e) => {
            tracing::error!(
                path = %path.display(),
                error = %e,
                data = %String::from_utf8_lossy(&data),
                "damaged context json data"
            );
            return None;
        }
    };

    if !daemon_side {
        if let Some(pid) = context.pid() {
            if !pid_is_alive(pid) {
                // The daemon exited uncleanly; its pid points nowhere.
                tracing::debug!(path = %path.display(), pid, "context pid is not running");
                return None;
            }
        }
    }

    Some(context)
}

/// Called when a daemon exits. The file is intentionally kept on disk.
pub fn clear_context(pid_file: &Path) {
    tracing::debug!(
        path = %context_file_for(pid_file).display(),
        "leaving context file in place"
    );
}

/// Whether `pid` refers to a running process.
///
/// `EPERM` means the process exists but belongs to someone else, which still
/// counts as running. Zombies count as exited.
pub fn pid_is_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    #[cfg(unix)]
    {
        let rc = unsafe { libc::kill(pid as i32, 0) };
        if rc != 0 && io::Error::last_os_error().raw_os_error() != Some(libc::EPERM) {
            return false;
        }
        !is_zombie(pid)
    }
    #[cfg(not(unix))]
    {
        false
    }
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    // /proc/<pid>/stat: pid (comm) state ...
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .map(|state| state == "Z")
        .unwrap_or(false)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}
