//! Configuration – reads/writes `~/.tinkerbus/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use tinkerbus_middleware::bus::DEFAULT_CAPACITY;
use tinkerbus_types::{StackAddress, TinkerError};

/// Persisted bridge configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Host running the brick daemon.
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Per-topic bus buffer; slow subscribers lag past this.
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,

    /// Run against the built-in simulated stack instead of a daemon.
    #[serde(default)]
    pub simulate: bool,
}

fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    StackAddress::DEFAULT_PORT
}
fn default_bus_capacity() -> usize {
    DEFAULT_CAPACITY
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            bus_capacity: default_bus_capacity(),
            simulate: false,
        }
    }
}

/// Return the path to `~/.tinkerbus/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".tinkerbus").join("config.toml")
}

/// Load the effective configuration: the file at `path` (default
/// location when `None`), defaults when it is missing, then environment
/// overrides.
pub fn load(path: Option<&Path>) -> Result<Config, TinkerError> {
    let path = path.map_or_else(config_path, Path::to_path_buf);
    let mut cfg = load_from(&path)?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Load the file at `path`. Returns `None` if it does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, TinkerError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        TinkerError::Config(format!("failed to read config at {}: {e}", path.display()))
    })?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| TinkerError::Config(format!("failed to parse config: {e}")))?;
    Ok(Some(cfg))
}

/// Apply `TINKERBUS_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `TINKERBUS_HOST` | `host` |
/// | `TINKERBUS_PORT` | `port` |
///
/// Unparseable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("TINKERBUS_HOST") {
        cfg.host = v;
    }
    if let Ok(v) = std::env::var("TINKERBUS_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.port = port;
    }
}

/// Save `cfg` to `path`, creating the parent directory if necessary.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), TinkerError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            TinkerError::Config(format!("failed to create config directory: {e}"))
        })?;
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| TinkerError::Config(format!("failed to serialize config: {e}")))?;
    fs::write(path, raw).map_err(|e| {
        TinkerError::Config(format!("failed to write config at {}: {e}", path.display()))
    })
}
