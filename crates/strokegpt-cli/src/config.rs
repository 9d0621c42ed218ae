//! Configuration vault – reads/writes `~/.strokegpt/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use strokegpt_runtime::{BridgeConfig, DEFAULT_SERVER_URI, MotionLimits};
use strokegpt_types::StrokeError;

/// Server round trips a connect performs besides the discovery window.
const CONNECT_ROUND_TRIPS: u64 = 4;

/// Persisted user configuration stored in `~/.strokegpt/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// WebSocket address of the device server (Intiface or compatible).
    #[serde(default = "default_server_uri")]
    pub server_uri: String,

    /// Name announced in the protocol handshake.
    #[serde(default = "default_client_name")]
    pub client_name: String,

    /// How long scanning runs before the first compatible device is bound.
    #[serde(default = "default_discovery_window_ms")]
    pub discovery_window_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    #[serde(default = "default_disconnect_timeout_ms")]
    pub disconnect_timeout_ms: u64,

    /// Upper bound on a single device command.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    #[serde(default = "default_idle_interval_ms")]
    pub idle_interval_ms: u64,

    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,

    /// Bounds applied to manual moves and pattern playback.
    #[serde(default)]
    pub limits: MotionLimits,
}

fn default_server_uri() -> String {
    DEFAULT_SERVER_URI.to_string()
}
fn default_client_name() -> String {
    "StrokeGPT".to_string()
}
fn default_discovery_window_ms() -> u64 {
    5_000
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_stop_timeout_ms() -> u64 {
    3_000
}
fn default_disconnect_timeout_ms() -> u64 {
    5_000
}
fn default_command_timeout_ms() -> u64 {
    1_000
}
fn default_idle_interval_ms() -> u64 {
    100
}
fn default_error_backoff_ms() -> u64 {
    1_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_uri: default_server_uri(),
            client_name: default_client_name(),
            discovery_window_ms: default_discovery_window_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            disconnect_timeout_ms: default_disconnect_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            idle_interval_ms: default_idle_interval_ms(),
            error_backoff_ms: default_error_backoff_ms(),
            limits: MotionLimits::default(),
        }
    }
}

impl Config {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// The plain timing configuration handed to the bridge.
    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            discovery_window: Duration::from_millis(self.discovery_window_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            stop_timeout: Duration::from_millis(self.stop_timeout_ms),
            disconnect_timeout: Duration::from_millis(self.disconnect_timeout_ms),
            command_timeout: self.command_timeout(),
            idle_interval: Duration::from_millis(self.idle_interval_ms),
            error_backoff: Duration::from_millis(self.error_backoff_ms),
        }
    }

    /// Reject settings the bridge cannot work with.
    ///
    /// The connect timeout covers the whole discovery window, so it must be
    /// the longer of the two.
    pub fn validate(&self) -> Result<(), StrokeError> {
        if !(self.server_uri.starts_with("ws://") || self.server_uri.starts_with("wss://")) {
            return Err(StrokeError::Config(format!(
                "server_uri must be a ws:// or wss:// address, got {:?}",
                self.server_uri
            )));
        }
        if self.client_name.trim().is_empty() {
            return Err(StrokeError::Config("client_name must not be empty".into()));
        }
        // Connecting spends the discovery window plus up to four round trips:
        // handshake, device list, start scanning and stop scanning.
        let connect_floor = self
            .discovery_window_ms
            .saturating_add(self.command_timeout_ms.saturating_mul(CONNECT_ROUND_TRIPS));
        if self.connect_timeout_ms <= connect_floor {
            return Err(StrokeError::Config(format!(
                "connect_timeout_ms ({}) must exceed discovery_window_ms ({}) plus {} command timeouts ({} ms each)",
                self.connect_timeout_ms,
                self.discovery_window_ms,
                CONNECT_ROUND_TRIPS,
                self.command_timeout_ms
            )));
        }
        let timers = [
            ("stop_timeout_ms", self.stop_timeout_ms),
            ("disconnect_timeout_ms", self.disconnect_timeout_ms),
            ("command_timeout_ms", self.command_timeout_ms),
            ("idle_interval_ms", self.idle_interval_ms),
        ];
        if let Some((name, _)) = timers.iter().find(|(_, ms)| *ms == 0) {
            return Err(StrokeError::Config(format!("{name} must be greater than zero")));
        }
        Ok(())
    }
}

/// Return the path to `~/.strokegpt/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".strokegpt").join("config.toml")
}

/// Load the config from disk. Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, StrokeError> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, StrokeError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        StrokeError::Config(format!("failed to read config at {}: {e}", path.display()))
    })?;
    let mut cfg: Config = toml::from_str(&raw)
        .map_err(|e| StrokeError::Config(format!("failed to parse config: {e}")))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `STROKEGPT_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `STROKEGPT_SERVER_URI` | `server_uri` |
/// | `STROKEGPT_CLIENT_NAME` | `client_name` |
/// | `STROKEGPT_DISCOVERY_WINDOW_MS` | `discovery_window_ms` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("STROKEGPT_SERVER_URI") {
        cfg.server_uri = v;
    }
    if let Ok(v) = std::env::var("STROKEGPT_CLIENT_NAME") {
        cfg.client_name = v;
    }
    if let Ok(v) = std::env::var("STROKEGPT_DISCOVERY_WINDOW_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.discovery_window_ms = ms;
    }
}

/// Save the config to disk, creating `~/.strokegpt/` if necessary.
pub fn save(cfg: &Config) -> Result<(), StrokeError> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), StrokeError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            StrokeError::Config(format!("failed to create config directory: {e}"))
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(|e| {
                StrokeError::Config(format!("failed to set config directory permissions: {e}"))
            })?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| StrokeError::Config(format!("failed to serialize config: {e}")))?;
    let write_err =
        |e: std::io::Error| StrokeError::Config(format!("failed to write config at {}: {e}", path.display()));
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(write_err)?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(write_err)?;
    Ok(())
}
