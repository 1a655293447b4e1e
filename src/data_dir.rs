use crate::timer::TimerKind;
use std::path::{Path, PathBuf};

/// Manages the `.revive/` directory layout.
///
/// The alarm entries, the daemon lock and the default config all live under a
/// single data directory shared by the supervised host and `revive alarmd`.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Create a new DataDir referencing the given root path.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory (e.g. `.revive/`).
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one entry per armed timer kind.
    pub fn alarms_dir(&self) -> PathBuf {
        self.root.join("alarms")
    }

    /// Path to the entry for `kind` (e.g. `alarms/short.json`).
    pub fn alarm_file(&self, kind: TimerKind) -> PathBuf {
        self.alarms_dir().join(format!("{}.json", kind.as_str()))
    }

    /// Lock serializing access to the alarm entries.
    pub fn alarms_lock(&self) -> PathBuf {
        self.alarms_dir().join(".lock")
    }

    /// Path to the alarm daemon's singleton lock file.
    pub fn daemon_lock(&self) -> PathBuf {
        self.root.join("alarmd.lock")
    }

    /// Path to the config file (e.g. `.revive/config.toml`).
    pub fn config(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    /// Default content written to `config.toml` when initializing a new data directory.
    const DEFAULT_CONFIG: &str = "\
# revive configuration
# See documentation for all available options.

[watchdog]
restart_disabled = false
short_interval_ms = 3100
long_interval_ms = 30000
settle_window_ms = 1500

[hang]
inspection_interval_ms = 2500
budget_ms = 5000

[alarmd]
# command = \"/usr/local/bin/my-host\"
# args = []
";

    /// Initialize the directory structure.
    /// Creates root and alarms/ directories, writing a default config.toml if
    /// one doesn't already exist.
    /// Returns Ok(true) if the root was created, Ok(false) if it already existed.
    pub fn init(&self) -> std::io::Result<bool> {
        let created = !self.root.exists();
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.alarms_dir())?;

        let config_path = self.config();
        if !config_path.exists() {
            std::fs::write(&config_path, Self::DEFAULT_CONFIG)?;
        }

        Ok(created)
    }
}
