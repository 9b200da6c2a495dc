use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level gateway settings, loaded from TOML.
///
/// The four port/folder/timeout keys have no sensible default and must be
/// present; everything else falls back to the values in the accessors below.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Root folder holding one work folder per session.
    pub notebook_folder: Option<PathBuf>,
    /// First port of the backend port range.
    pub min_port: Option<u16>,
    /// Number of ports in the range starting at `min_port`.
    pub port_range: Option<u16>,
    /// Dead-man's switch in seconds. A backend never outlives this.
    pub kill_timeout: Option<u64>,
    /// Seconds between SIGTERM and SIGKILL when stopping a backend.
    pub stop_timeout: Option<u64>,
    pub settle_delay_ms: Option<u64>,
    /// Seconds to wait for a freshly spawned backend to publish its pid.
    pub spawn_timeout: Option<u64>,
    /// Command the backend daemon runs, with `{port}` style placeholders.
    #[serde(default)]
    pub kernel_command: Vec<String>,
    /// Executable implementing the `daemon` subcommand. Defaults to the
    /// running binary.
    pub backend_executable: Option<PathBuf>,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub context: ContextSettings,
}

/// Front door section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerSettings {
    pub bind: Option<SocketAddr>,
    /// Host URL replacing the request host in the derived websocket URL.
    pub alternative_domain: Option<String>,
    /// Header carrying the pre-authenticated user name.
    pub trusted_user_header: Option<String>,
}

/// Values copied into every launch context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextSettings {
    pub greeting: Option<String>,
    pub startup: Option<String>,
    #[serde(default)]
    pub extra_template_paths: Vec<String>,
}

pub const DEFAULT_BIND: &str = "127.0.0.1:8080";

impl Settings {
    /// Load settings from a TOML file path.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let settings = Self::from_toml(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Check that every required setting is present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.notebook_folder()?;
        self.min_port()?;
        let range = self.port_range()?;
        self.kill_timeout()?;
        if range == 0 {
            return Err(ConfigError::Invalid("port_range must be at least 1".into()));
        }
        if u32::from(self.min_port()?) + u32::from(range) > u32::from(u16::MAX) + 1 {
            return Err(ConfigError::Invalid(
                "min_port + port_range exceeds the TCP port space".into(),
            ));
        }
        Ok(())
    }

    pub fn notebook_folder(&self) -> Result<&Path, ConfigError> {
        self.notebook_folder
            .as_deref()
            .ok_or(ConfigError::MissingSetting("notebook_folder"))
    }

    pub fn min_port(&self) -> Result<u16, ConfigError> {
        self.min_port.ok_or(ConfigError::MissingSetting("min_port"))
    }

    pub fn port_range(&self) -> Result<u16, ConfigError> {
        self.port_range.ok_or(ConfigError::MissingSetting("port_range"))
    }

    pub fn kill_timeout(&self) -> Result<u64, ConfigError> {
        self.kill_timeout
            .ok_or(ConfigError::MissingSetting("kill_timeout"))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout.unwrap_or(10))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms.unwrap_or(500))
    }

    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_secs(self.spawn_timeout.unwrap_or(10))
    }

    pub fn bind(&self) -> SocketAddr {
        self.server
            .bind
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8080)))
    }
}

/// Default config file location: `<config dir>/nbgate/config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nbgate")
        .join("config.toml")
}

/// Replace `host_url` at the start of `url` with `alternative_domain`.
///
/// Used when websocket traffic must reach the gateway under a different
/// domain than the page was served from. URLs not starting with `host_url`
/// are returned unchanged.
pub fn route_to_alt_domain(url: &str, host_url: &str, alternative_domain: Option<&str>) -> String {
    match alternative_domain {
        Some(alt) => match url.strip_prefix(host_url) {
            Some(rest) => format!("{}{}", alt.trim_end_matches('/'), rest),
            None => url.to_string(),
        },
        None => url.to_string(),
    }
}

/// Errors that can occur when loading settings.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    MissingSetting(&'static str),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::MissingSetting(key) => write!(f, "Missing required setting: {}", key),
            Self::Invalid(detail) => write!(f, "Invalid config: {}", detail),
        }
    }
}

impl std::error::Error for ConfigError {}
