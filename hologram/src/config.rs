//! Configuration for the sidecar client.
//!
//! Loaded from a JSON file with every field defaulted, then patched from
//! environment variables. Lookup order for the file:
//! 1. Explicit path (`--config`)
//! 2. `CLAUDEX_CONFIG` environment variable
//! 3. `~/.claudex/config.json`

use globset::Glob;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{HologramError, HologramResult};

pub const PID_FILE_NAME: &str = "hologram.pid";
pub const PORT_FILE_NAME: &str = "hologram.port";
pub const LOG_FILE_NAME: &str = "hologram.log";
pub const PRESSURE_FILE_NAME: &str = "pressure.json";

const DEFAULT_PATTERNS: &[&str] = &["*.md", "*.ts", "*.py", "**/*.md", "**/*.ts", "**/*.py"];
const DEFAULT_EXCLUDES: &[&str] = &[
    "node_modules/**",
    ".git/**",
    "dist/**",
    "build/**",
    "coverage/**",
    "**/*.test.ts",
    "**/*.spec.ts",
    "**/*.test.tsx",
    "**/*.spec.tsx",
    "**/test_*.py",
    "**/*_test.py",
    "**/tests/**",
];
const DEFAULT_MAX_FILES: usize = 200;
const DEFAULT_MAX_AGE_HOURS: u64 = 14 * 24;
/// One century; larger ages would overflow timestamp arithmetic.
const MAX_AGE_HOURS_CAP: u64 = 100 * 365 * 24;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HologramConfig {
    /// Directory holding marker files, the sidecar log and persisted scores
    pub data_dir: PathBuf,
    /// Forwarded to the sidecar so it roots its session there
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claude_dir: Option<String>,
    pub sidecar: SidecarConfig,
    pub timeouts: TimeoutConfig,
    pub project: ProjectScanConfig,
    pub store: StoreConfig,
    /// Path this config was loaded from, passed on to the sidecar
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl Default for HologramConfig {
    fn default() -> Self {
        Self {
            data_dir: claudex_home().join("db"),
            claude_dir: None,
            sidecar: SidecarConfig::default(),
            timeouts: TimeoutConfig::default(),
            project: ProjectScanConfig::default(),
            store: StoreConfig::default(),
            source_path: None,
        }
    }
}

/// How to launch the sidecar
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarConfig {
    /// Executable, or script when `interpreter` is set
    pub path: PathBuf,
    /// Optional interpreter the script is handed to (e.g. `python3`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<String>,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            path: claudex_home().join("sidecar"),
            interpreter: Some("python3".to_string()),
        }
    }
}

/// Every deadline the client observes, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub request_ms: u64,
    pub probe_ms: u64,
    pub startup_ms: u64,
    pub poll_interval_ms: u64,
    pub stop_grace_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_ms: 3000,
            probe_ms: 500,
            startup_ms: 5000,
            poll_interval_ms: 100,
            stop_grace_ms: 2000,
        }
    }
}

impl TimeoutConfig {
    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }

    pub fn probe(&self) -> Duration {
        Duration::from_millis(self.probe_ms)
    }

    pub fn startup(&self) -> Duration {
        Duration::from_millis(self.startup_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Retention of persisted scores
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Records not refreshed within this many hours are pruned on save
    pub max_age_hours: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_age_hours: DEFAULT_MAX_AGE_HOURS,
        }
    }
}

impl StoreConfig {
    pub fn max_age(&self) -> chrono::Duration {
        let hours = self.max_age_hours.min(MAX_AGE_HOURS_CAP) as i64;
        chrono::Duration::hours(hours)
    }
}

/// Which project files the sidecar should scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectScanConfig {
    pub patterns: Vec<String>,
    pub exclude: Vec<String>,
    pub max_files: usize,
}

impl Default for ProjectScanConfig {
    fn default() -> Self {
        Self {
            patterns: DEFAULT_PATTERNS.iter().map(|s| s.to_string()).collect(),
            exclude: DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect(),
            max_files: DEFAULT_MAX_FILES,
        }
    }
}

impl ProjectScanConfig {
    /// Reject patterns that do not compile as globs.
    pub fn validate(&self) -> HologramResult<()> {
        for pattern in self.patterns.iter().chain(self.exclude.iter()) {
            Glob::new(pattern).map_err(|e| {
                HologramError::Config(format!("invalid glob pattern {pattern:?}: {e}"))
            })?;
        }
        if self.max_files == 0 {
            return Err(HologramError::Config(
                "project.max_files must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl HologramConfig {
    /// Load configuration, applying environment overrides.
    ///
    /// A missing file is not an error; a malformed one is.
    pub fn load(explicit: Option<&Path>) -> HologramResult<Self> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("CLAUDEX_CONFIG").map(PathBuf::from))
            .unwrap_or_else(|| claudex_home().join("config.json"));

        let mut config = match std::fs::read_to_string(&path) {
            Ok(text) => {
                let mut config: HologramConfig = serde_json::from_str(&text).map_err(|e| {
                    HologramError::Config(format!("failed to parse {}: {e}", path.display()))
                })?;
                config.source_path = Some(path.clone());
                tracing::debug!(path = %path.display(), "Loaded hologram config");
                config
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                HologramConfig::default()
            }
            Err(e) => return Err(e.into()),
        };

        config.apply_env_overrides();
        config.project.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(dir) = std::env::var_os("CLAUDEX_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(path) = std::env::var_os("CLAUDEX_SIDECAR_PATH") {
            self.sidecar.path = PathBuf::from(path);
        }
        if let Ok(interpreter) = std::env::var("CLAUDEX_SIDECAR_INTERPRETER") {
            self.sidecar.interpreter = if interpreter.is_empty() {
                None
            } else {
                Some(interpreter)
            };
        }
    }

    /// Configuration rooted at `data_dir`, everything else defaulted.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn pid_file(&self) -> PathBuf {
        self.data_dir.join(PID_FILE_NAME)
    }

    pub fn port_file(&self) -> PathBuf {
        self.data_dir.join(PORT_FILE_NAME)
    }

    pub fn log_file(&self) -> PathBuf {
        self.data_dir.join(LOG_FILE_NAME)
    }

    pub fn pressure_file(&self) -> PathBuf {
        self.data_dir.join(PRESSURE_FILE_NAME)
    }
}

/// `~/.claudex`, falling back to a relative `.claudex` without a home.
fn claudex_home() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claudex")
}
