use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from tree-tester.toml.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct HarnessConfig {
    pub runner: RunnerConfig,
    pub watchdog: WatchdogConfig,
    pub run: RunConfig,
    pub discovery: DiscoveryConfig,
}

/// The toolchain test runner started once per logical test.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub command: String,
    /// `{count}` and `{test}` are substituted per invocation.
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WatchdogConfig {
    #[serde(with = "humantime_serde")]
    pub freeze_timeout: Duration,
    /// Freeze restarts in a row without a new pass before the test is abandoned.
    pub max_restarts: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RunConfig {
    pub runs: u32,
    pub save_all_logs: bool,
    pub root: PathBuf,
    pub logs: PathBuf,
    pub filter: String,
    pub show_ignored: bool,
    pub indent: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub test_file_suffix: String,
    pub entry_point: String,
    pub ignore_tag: String,
}

// --- Default implementations ---

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            command: "go".to_string(),
            args: vec![
                "test".to_string(),
                "-v".to_string(),
                "-count".to_string(),
                "{count}".to_string(),
                "-run".to_string(),
                "^{test}$".to_string(),
            ],
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            freeze_timeout: Duration::from_secs(10),
            max_restarts: 3,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            runs: 1,
            save_all_logs: false,
            root: PathBuf::from("."),
            logs: PathBuf::from("./tests-logs"),
            filter: ".".to_string(),
            show_ignored: false,
            indent: "   ".to_string(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            test_file_suffix: "_test.go".to_string(),
            entry_point: "TestMain".to_string(),
            ignore_tag: "@Tester:ignore".to_string(),
        }
    }
}

/// Errors that can occur while loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

impl HarnessConfig {
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
        Self::parse(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        let mut cfg: Self = toml::from_str(contents)?;
        cfg.normalize();
        Ok(cfg)
    }

    /// Clamp values the harness cannot work with.
    pub fn normalize(&mut self) {
        if self.run.runs == 0 {
            self.run.runs = 1;
        }
        if self.run.indent.is_empty() {
            self.run.indent = "   ".to_string();
        }
    }

    /// Resolve relative root/logs paths against `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.run.root.is_relative() {
            self.run.root = base.join(&self.run.root);
        }
        if self.run.logs.is_relative() {
            self.run.logs = base.join(&self.run.logs);
        }
    }
}
