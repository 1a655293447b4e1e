use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from revive.toml.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
#[derive(Default)]
pub struct ReviveConfig {
    pub watchdog: WatchdogConfig,
    pub hang: HangConfig,
    pub storage: StorageConfig,
    pub alarmd: AlarmdConfig,
    pub actuator: ActuatorConfig,
    pub exec: ExecConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Start in the terminal Disabled state (e.g. while debugging the host).
    pub restart_disabled: bool,
    pub short_interval_ms: u64,
    pub long_interval_ms: u64,
    pub settle_window_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct HangConfig {
    pub enabled: bool,
    pub inspection_interval_ms: u64,
    pub budget_ms: u64,
    pub ignore_debugger: bool,
    pub terminate_on_exhausted: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct AlarmdConfig {
    pub poll_interval_ms: u64,
    /// Host command relaunched when a fire is due and the host is dead.
    pub command: Option<String>,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
#[derive(Default)]
pub struct ActuatorConfig {
    /// Command that raises the host's primary UI. Unset means log only.
    pub command: Option<String>,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecConfig {
    pub shell: Vec<String>,
    pub timeout_ms: u64,
}

/// Errors from loading a config file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ReviveConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        Self::from_toml(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }
}

impl WatchdogConfig {
    pub fn short_interval(&self) -> Duration {
        Duration::from_millis(self.short_interval_ms)
    }

    pub fn long_interval(&self) -> Duration {
        Duration::from_millis(self.long_interval_ms)
    }

    pub fn settle_window(&self) -> Duration {
        Duration::from_millis(self.settle_window_ms)
    }
}

impl HangConfig {
    pub fn inspection_interval(&self) -> Duration {
        Duration::from_millis(self.inspection_interval_ms)
    }

    pub fn budget(&self) -> Duration {
        Duration::from_millis(self.budget_ms)
    }
}

impl ExecConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// --- Default implementations ---

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            restart_disabled: false,
            short_interval_ms: 3100,
            long_interval_ms: 30_000,
            settle_window_ms: 1500,
        }
    }
}

impl Default for HangConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            inspection_interval_ms: 2500,
            budget_ms: 5000,
            ignore_debugger: true,
            terminate_on_exhausted: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".revive"),
        }
    }
}

impl Default for AlarmdConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            command: None,
            args: Vec::new(),
        }
    }
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            shell: vec!["su".to_string(), "-c".to_string()],
            timeout_ms: 5000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_match_watchdog_constants() {
        let config = ReviveConfig::default();
        assert_eq!(config.watchdog.short_interval(), Duration::from_millis(3100));
        assert_eq!(config.watchdog.long_interval(), Duration::from_secs(30));
        assert_eq!(config.watchdog.settle_window(), Duration::from_millis(1500));
        assert_eq!(config.hang.inspection_interval(), Duration::from_millis(2500));
        assert_eq!(config.hang.budget(), Duration::from_millis(5000));
        assert!(!config.watchdog.restart_disabled);
        assert_eq!(config.exec.shell, vec!["su", "-c"]);
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let config = ReviveConfig::from_toml(
            r#"
[watchdog]
short_interval_ms = 3000

[alarmd]
command = "/usr/bin/myapp"
args = ["--kiosk"]
"#,
        )
        .unwrap();
        assert_eq!(config.watchdog.short_interval_ms, 3000);
        assert_eq!(config.watchdog.long_interval_ms, 30_000);
        assert_eq!(config.alarmd.command.as_deref(), Some("/usr/bin/myapp"));
        assert_eq!(config.alarmd.args, vec!["--kiosk"]);
        assert_eq!(config.hang, HangConfig::default());
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = ReviveConfig::load(&dir.path().join("revive.toml")).unwrap();
        assert_eq!(config, ReviveConfig::default());
    }

    #[test]
    fn test_load_invalid_toml_is_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("revive.toml");
        std::fs::write(&path, "[watchdog\nshort_interval_ms = ").unwrap();
        let err = ReviveConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("failed to parse config"));
    }

    #[test]
    fn test_config_serializes_back_to_toml() {
        let config = ReviveConfig::default();
        let text = toml::to_string(&config).unwrap();
        assert!(text.contains("[watchdog]"));
        assert!(text.contains("short_interval_ms = 3100"));
    }
}
