/// Runtime configuration for the relay
///
/// Configuration is read from `$USER_HOME/.design-relay/config.json` when the
/// file exists. Every field is optional; command-line flags override it.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the config file location
pub const CONFIG_PATH_ENV: &str = "DESIGN_RELAY_CONFIG";

const APP_DIR: &str = "design-relay";

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Directory holding the IPC socket
    pub runtime_dir: PathBuf,

    /// File name of the IPC socket inside `runtime_dir`
    pub socket_name: String,

    /// Directory holding cached asset blobs and `index.json`
    pub asset_dir: PathBuf,

    /// Directory for the log file; `None` logs to stderr only
    pub log_dir: Option<PathBuf>,

    /// Ordered socket channel ports; the first free one is bound
    pub port_candidates: Vec<u16>,

    /// Largest text frame accepted on the socket channel
    pub max_message_bytes: usize,

    /// Largest asset accepted by the upload route
    pub max_asset_bytes: u64,

    pub tool_call_timeout_ms: u64,

    /// Delay before a sole extension connection is promoted to active
    pub auto_activate_grace_ms: u64,

    pub asset_ttl_secs: u64,

    pub asset_sweep_interval_secs: u64,

    /// Upper bound on graceful shutdown before the process is forced down
    pub shutdown_grace_ms: u64,

    /// Shut down once the last tool consumer disconnects
    pub exit_when_idle: bool,

    /// List diagnostic tools such as `relay_status`
    pub expose_debug_tools: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let runtime_base = dirs::runtime_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(std::env::temp_dir);
        let cache_base = dirs::cache_dir().unwrap_or_else(std::env::temp_dir);

        Self {
            runtime_dir: runtime_base.join(APP_DIR),
            socket_name: "relay.sock".to_string(),
            asset_dir: cache_base.join(APP_DIR).join("assets"),
            log_dir: None,
            port_candidates: vec![38451, 38452, 38453, 38454, 38455],
            max_message_bytes: 8 * 1024 * 1024,
            max_asset_bytes: 64 * 1024 * 1024,
            tool_call_timeout_ms: 30_000,
            auto_activate_grace_ms: 1_500,
            asset_ttl_secs: 7 * 24 * 60 * 60,
            asset_sweep_interval_secs: 60 * 60,
            shutdown_grace_ms: 3_000,
            exit_when_idle: true,
            expose_debug_tools: false,
        }
    }
}

impl RelayConfig {
    /// Full path of the IPC socket.
    pub fn socket_path(&self) -> PathBuf {
        self.runtime_dir.join(&self.socket_name)
    }

    pub fn tool_call_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_call_timeout_ms)
    }

    pub fn auto_activate_grace(&self) -> Duration {
        Duration::from_millis(self.auto_activate_grace_ms)
    }

    pub fn asset_ttl(&self) -> Duration {
        Duration::from_secs(self.asset_ttl_secs)
    }

    pub fn asset_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.asset_sweep_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Reject values the relay cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.port_candidates.is_empty() {
            return Err("port_candidates must contain at least one port".to_string());
        }
        if self.socket_name.is_empty() {
            return Err("socket_name must not be empty".to_string());
        }
        if self.max_message_bytes == 0 || self.max_asset_bytes == 0 {
            return Err("byte limits must be greater than zero".to_string());
        }
        if self.tool_call_timeout_ms == 0 {
            return Err("tool_call_timeout_ms must be greater than zero".to_string());
        }
        if self.asset_sweep_interval_secs == 0 {
            return Err("asset_sweep_interval_secs must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Get the path to the config file
///
/// Returns: `$USER_HOME/.design-relay/config.json`
/// Respects the `DESIGN_RELAY_CONFIG` environment variable.
pub fn get_config_path() -> Result<PathBuf, String> {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        return Ok(PathBuf::from(path));
    }

    let home_dir = dirs::home_dir().ok_or("Failed to get user home directory")?;
    Ok(home_dir.join(format!(".{}", APP_DIR)).join("config.json"))
}

/// Load configuration from an explicit path.
///
/// A missing file yields the defaults.
pub fn load_config_from(path: &Path) -> Result<RelayConfig, String> {
    if !path.exists() {
        return Ok(RelayConfig::default());
    }

    let content = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config file {}: {}", path.display(), e))?;

    if content.trim().is_empty() {
        return Ok(RelayConfig::default());
    }

    serde_json::from_str(&content)
        .map_err(|e| format!("Failed to parse config file {}: {}", path.display(), e))
}

/// Load configuration from the default location.
pub fn load_config() -> Result<RelayConfig, String> {
    load_config_from(&get_config_path()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    // Serializes tests that touch the environment
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_missing_file_yields_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = load_config_from(&temp_dir.path().join("absent.json")).unwrap();
        assert_eq!(config.socket_name, "relay.sock");
        assert_eq!(config.port_candidates.len(), 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        fs::write(
            &path,
            r#"{ "port_candidates": [4000, 4001], "tool_call_timeout_ms": 500 }"#,
        )
        .unwrap();

        let config = load_config_from(&path).unwrap();
        assert_eq!(config.port_candidates, vec![4000, 4001]);
        assert_eq!(config.tool_call_timeout(), Duration::from_millis(500));
        assert_eq!(config.auto_activate_grace_ms, 1_500);
        assert!(config.exit_when_idle);
    }

    #[test]
    fn test_invalid_json_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        let err = load_config_from(&path).unwrap_err();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_validate_rejects_empty_ports() {
        let config = RelayConfig {
            port_candidates: vec![],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_socket_path_joins_runtime_dir() {
        let config = RelayConfig {
            runtime_dir: PathBuf::from("/tmp/relay-test"),
            ..Default::default()
        };
        assert_eq!(config.socket_path(), PathBuf::from("/tmp/relay-test/relay.sock"));
    }

    #[test]
    fn test_config_path_env_override() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("custom.json");

        unsafe {
            std::env::set_var(CONFIG_PATH_ENV, path.to_str().unwrap());
        }
        let resolved = get_config_path().unwrap();
        unsafe {
            std::env::remove_var(CONFIG_PATH_ENV);
        }

        assert_eq!(resolved, path);
    }
}
