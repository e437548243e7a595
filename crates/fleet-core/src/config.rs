use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from `~/.fleet/config.toml`.
///
/// **Security**: this struct never stores tokens or secrets. Profiles refer
/// to credentials by environment-variable name or CLI config directory; see
/// [`CredentialProvider`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub layout: LayoutConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub workspaces: WorkspacesConfig,
    #[serde(default)]
    pub spec_lock: SpecLockSettings,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub profiles: ProfilesConfig,
}

impl Config {
    /// Load config from `~/.fleet/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Semantic checks for settings that types alone cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.general.validate()?;
        self.layout.validate()?;
        self.orchestrator.validate()?;
        self.workspaces.validate()?;
        self.spec_lock.validate()?;
        self.monitor.validate()?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        fleet_home().join("config.toml")
    }
}

/// `~/.fleet`, or `./.fleet` when no home directory is known.
pub fn fleet_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".fleet")
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `human` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl GeneralConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.log_format.trim() {
            "human" | "json" => Ok(()),
            other => Err(ConfigError::Validation(format!(
                "general.log_format '{other}' must be 'human' or 'json'"
            ))),
        }
    }
}

fn default_project_name() -> String {
    "fleet".into()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "human".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutConfig {
    /// Per-project data directory, relative to the project root.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl LayoutConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let dir = self.data_dir.trim();
        if dir.is_empty() || dir.contains("..") || PathBuf::from(dir).is_absolute() {
            return Err(ConfigError::Validation(format!(
                "layout.data_dir '{}' must be a non-empty relative path",
                self.data_dir
            )));
        }
        Ok(())
    }
}

fn default_data_dir() -> String {
    ".fleet".into()
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Worker executable, resolved through `PATH`.
    #[serde(default = "default_worker_command")]
    pub worker_command: String,
    #[serde(default)]
    pub worker_args: Vec<String>,
    /// Environment applied to every worker before caller and profile values.
    #[serde(default)]
    pub base_env: BTreeMap<String, String>,
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
    #[serde(default = "default_true")]
    pub auto_swap_on_rate_limit: bool,
    #[serde(default = "default_output_tail_bytes")]
    pub output_tail_bytes: usize,
    /// Reset window assumed when a rate-limit message carries no reset time.
    #[serde(default = "default_rate_limit_fallback_secs")]
    pub rate_limit_fallback_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_command: default_worker_command(),
            worker_args: Vec::new(),
            base_env: BTreeMap::new(),
            kill_grace_secs: default_kill_grace_secs(),
            auto_swap_on_rate_limit: true,
            output_tail_bytes: default_output_tail_bytes(),
            rate_limit_fallback_secs: default_rate_limit_fallback_secs(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_command.trim().is_empty() {
            return Err(ConfigError::Validation(
                "orchestrator.worker_command must not be empty".to_string(),
            ));
        }
        if self.output_tail_bytes < 1024 {
            return Err(ConfigError::Validation(
                "orchestrator.output_tail_bytes must be at least 1024".to_string(),
            ));
        }
        Ok(())
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn rate_limit_fallback(&self) -> Duration {
        Duration::from_secs(self.rate_limit_fallback_secs)
    }
}

fn default_worker_command() -> String {
    "claude".into()
}
fn default_kill_grace_secs() -> u64 {
    5
}
fn default_output_tail_bytes() -> usize {
    64 * 1024
}
fn default_rate_limit_fallback_secs() -> u64 {
    5 * 60 * 60
}
fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Workspaces
// ---------------------------------------------------------------------------

/// External command run inside a worktree to resolve merge conflicts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConflictResolverCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspacesConfig {
    /// Base branch for new workspaces; `main`/`master` is detected when unset.
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    #[serde(default)]
    pub conflict_resolver: Option<ConflictResolverCommand>,
}

impl Default for WorkspacesConfig {
    fn default() -> Self {
        Self {
            base_branch: None,
            branch_prefix: default_branch_prefix(),
            conflict_resolver: None,
        }
    }
}

impl WorkspacesConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let prefix = self.branch_prefix.trim();
        if prefix.is_empty() || prefix.contains(' ') || prefix.contains("..") {
            return Err(ConfigError::Validation(format!(
                "workspaces.branch_prefix '{}' is not a valid ref prefix",
                self.branch_prefix
            )));
        }
        if let Some(resolver) = &self.conflict_resolver {
            if resolver.command.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "workspaces.conflict_resolver.command must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

fn default_branch_prefix() -> String {
    "fleet/".into()
}

// ---------------------------------------------------------------------------
// Spec lock
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecLockSettings {
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

impl Default for SpecLockSettings {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: default_acquire_timeout_ms(),
            stale_after_ms: default_stale_after_ms(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }
}

impl SpecLockSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "spec_lock.retry_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.stale_after_ms == 0 {
            return Err(ConfigError::Validation(
                "spec_lock.stale_after_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_acquire_timeout_ms() -> u64 {
    30_000
}
fn default_stale_after_ms() -> u64 {
    60_000
}
fn default_retry_interval_ms() -> u64 {
    50
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_shutdown_delay_secs")]
    pub shutdown_delay_secs: u64,
    /// Treat a non-terminal task with every subtask completed as finished.
    #[serde(default = "default_true")]
    pub complete_by_progress: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            shutdown_delay_secs: default_shutdown_delay_secs(),
            complete_by_progress: true,
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_secs == 0 || self.poll_interval_secs > 3_600 {
            return Err(ConfigError::Validation(
                "monitor.poll_interval_secs must be between 1 and 3600".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_poll_interval_secs() -> u64 {
    5
}
fn default_shutdown_delay_secs() -> u64 {
    120
}

// ---------------------------------------------------------------------------
// Profiles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProfilesConfig {
    /// Profile store location; `~/.fleet/profiles.json` when unset.
    #[serde(default)]
    pub store_path: Option<PathBuf>,
}

impl ProfilesConfig {
    pub fn resolved_store_path(&self) -> PathBuf {
        self.store_path
            .clone()
            .unwrap_or_else(|| fleet_home().join("profiles.json"))
    }
}

// ---------------------------------------------------------------------------
// Credential provider
// ---------------------------------------------------------------------------

/// Reads credentials from environment variables at runtime.
///
/// Config stores env var *names*; this provider resolves them on demand.
pub struct CredentialProvider;

impl CredentialProvider {
    /// Read a credential from a named env var. Empty values count as unset.
    pub fn from_env(var_name: &str) -> Option<String> {
        std::env::var(var_name).ok().filter(|v| !v.trim().is_empty())
    }
}
