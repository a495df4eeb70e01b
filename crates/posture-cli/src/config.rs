//! Configuration Vault – reads/writes `~/.posture/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use posture_runtime::{ChainPolicy, DEFAULT_GROUPS, DispatcherConfig};

/// Persisted user configuration stored in `~/.posture/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Posture library loaded at startup when `--postures` is not given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postures_path: Option<PathBuf>,

    /// Posture chained to all groups after every batch.  Empty disables
    /// chaining.
    #[serde(default)]
    pub settle_posture: String,

    /// Chain the settle posture even when a goal of the batch failed.
    #[serde(default = "default_chain_on_failure")]
    pub chain_on_failure: bool,

    /// Bound on a group client's first connection attempt.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Poll interval of `/wait`.
    #[serde(default = "default_wait_poll_ms")]
    pub wait_poll_ms: u64,

    /// Groups addressed by the `all` target, in dispatch order.
    #[serde(default = "default_groups")]
    pub groups: Vec<String>,

    /// Speed-up applied by the simulated transport (2.0 runs motions twice
    /// as fast).
    #[serde(default = "default_sim_speedup")]
    pub sim_speedup: f64,
}

fn default_chain_on_failure() -> bool {
    true
}
fn default_connect_timeout_secs() -> u64 {
    4
}
fn default_wait_poll_ms() -> u64 {
    500
}
fn default_groups() -> Vec<String> {
    DEFAULT_GROUPS.iter().map(|g| g.to_string()).collect()
}
fn default_sim_speedup() -> f64 {
    1.0
}

impl Default for Config {
    fn default() -> Self {
        Self {
            postures_path: None,
            settle_posture: String::new(),
            chain_on_failure: default_chain_on_failure(),
            connect_timeout_secs: default_connect_timeout_secs(),
            wait_poll_ms: default_wait_poll_ms(),
            groups: default_groups(),
            sim_speedup: default_sim_speedup(),
        }
    }
}

impl Config {
    pub fn chain_policy(&self) -> ChainPolicy {
        ChainPolicy::settle(self.settle_posture.clone()).with_chain_on_failure(self.chain_on_failure)
    }

    pub fn wait_poll(&self) -> Duration {
        Duration::from_millis(self.wait_poll_ms)
    }

    /// Dispatcher settings derived from this config.
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            groups: self.groups.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            chain: self.chain_policy(),
            ..DispatcherConfig::default()
        }
    }
}

/// Return the path to `~/.posture/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".posture").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &PathBuf) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `POSTURE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `POSTURE_LIBRARY` | `postures_path` |
/// | `POSTURE_SETTLE` | `settle_posture` |
/// | `POSTURE_CHAIN_ON_FAILURE` | `chain_on_failure` |
/// | `POSTURE_CONNECT_TIMEOUT_SECS` | `connect_timeout_secs` |
/// | `POSTURE_WAIT_POLL_MS` | `wait_poll_ms` |
/// | `POSTURE_GROUPS` | `groups` (comma-separated) |
/// | `POSTURE_SIM_SPEEDUP` | `sim_speedup` |
///
/// Values that fail to parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("POSTURE_LIBRARY") {
        cfg.postures_path = Some(PathBuf::from(v));
    }
    if let Ok(v) = std::env::var("POSTURE_SETTLE") {
        cfg.settle_posture = v;
    }
    if let Ok(v) = std::env::var("POSTURE_CHAIN_ON_FAILURE")
        && let Ok(flag) = v.parse::<bool>()
    {
        cfg.chain_on_failure = flag;
    }
    if let Ok(v) = std::env::var("POSTURE_CONNECT_TIMEOUT_SECS")
        && let Ok(secs) = v.parse::<u64>()
    {
        cfg.connect_timeout_secs = secs;
    }
    if let Ok(v) = std::env::var("POSTURE_WAIT_POLL_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.wait_poll_ms = ms;
    }
    if let Ok(v) = std::env::var("POSTURE_GROUPS") {
        let groups: Vec<String> = v
            .split(',')
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(str::to_string)
            .collect();
        if !groups.is_empty() {
            cfg.groups = groups;
        }
    }
    if let Ok(v) = std::env::var("POSTURE_SIM_SPEEDUP")
        && let Ok(speedup) = v.parse::<f64>()
        && speedup.is_finite()
        && speedup > 0.0
    {
        cfg.sim_speedup = speedup;
    }
}

/// Save the config to disk, creating `~/.posture/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &PathBuf) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
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
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
