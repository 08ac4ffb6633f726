use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::AgentMapping;

/// Environment variable overriding the config file location.
pub const CONFIG_PATH_ENV: &str = "AGENT_PIPELINE_CONFIG";

const MAX_WINDOW_SECS: u64 = 365 * 24 * 60 * 60;

/// Top-level configuration loaded from `~/.agent-pipeline/config.toml`.
///
/// Never holds secrets. The GitHub token is read from the environment
/// variable named in [`IntegrationConfig::github_token_env`], see
/// [`CredentialProvider`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub integrations: IntegrationConfig,
}

impl Config {
    /// Load from the configured path, falling back to defaults when the
    /// file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path();
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
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic checks serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.polling.validate()?;
        self.retry.validate()?;
        self.pipeline.validate()?;
        Ok(())
    }

    /// The validated status-to-agents mapping.
    pub fn agent_mapping(&self) -> Result<AgentMapping, ConfigError> {
        AgentMapping::from_names(&self.pipeline.agent_mappings)
            .map_err(|e| ConfigError::Validation(format!("pipeline.agent_mappings: {e}")))
    }

    /// `$AGENT_PIPELINE_CONFIG`, else `~/.agent-pipeline/config.toml`.
    pub fn config_path() -> PathBuf {
        match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".agent-pipeline")
                .join("config.toml"),
        }
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
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

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
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

fn default_project_name() -> String {
    "agent-pipeline".into()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "human".into()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub api_enabled: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_enabled: true,
        }
    }
}

impl DaemonConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    9797
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Issues processed in parallel within one phase.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_issues: usize,
    /// Pause after a merge before reading files from the merged branch.
    #[serde(default = "default_merge_delay_ms")]
    pub merge_propagation_delay_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            max_concurrent_issues: default_max_concurrent(),
            merge_propagation_delay_ms: default_merge_delay_ms(),
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn merge_propagation_delay(&self) -> Duration {
        Duration::from_millis(self.merge_propagation_delay_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs == 0 {
            return Err(ConfigError::Validation(
                "polling.interval_secs must be greater than 0".into(),
            ));
        }
        if self.max_concurrent_issues == 0 {
            return Err(ConfigError::Validation(
                "polling.max_concurrent_issues must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_interval_secs() -> u64 {
    60
}
fn default_max_concurrent() -> usize {
    4
}
fn default_merge_delay_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            multiplier: default_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::Validation(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    3000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_backoff_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Minimum gap between two automatic re-assignments of one issue.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// An active agent with no activity for this long is considered stalled.
    #[serde(default = "default_staleness_secs")]
    pub staleness_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            staleness_secs: default_staleness_secs(),
        }
    }
}

impl RecoveryConfig {
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs.min(MAX_WINDOW_SECS) as i64)
    }

    pub fn staleness(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.staleness_secs.min(MAX_WINDOW_SECS) as i64)
    }
}

fn default_cooldown_secs() -> u64 {
    300
}
fn default_staleness_secs() -> u64 {
    600
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Reviewer requested when an issue enters the review stage.
    #[serde(default = "default_reviewer")]
    pub reviewer: String,
    /// Account that agent work is assigned to.
    #[serde(default = "default_worker")]
    pub worker: String,
    /// Files with these extensions in a merged child PR are posted as comments.
    #[serde(default = "default_artifact_extensions")]
    pub artifact_extensions: Vec<String>,
    /// Board column name to ordered agent names.
    #[serde(default = "default_agent_mappings")]
    pub agent_mappings: BTreeMap<String, Vec<String>>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            reviewer: default_reviewer(),
            worker: default_worker(),
            artifact_extensions: default_artifact_extensions(),
            agent_mappings: default_agent_mappings(),
        }
    }
}

impl PipelineConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.reviewer.trim().is_empty() {
            return Err(ConfigError::Validation(
                "pipeline.reviewer must not be empty".into(),
            ));
        }
        if self.worker.trim().is_empty() {
            return Err(ConfigError::Validation(
                "pipeline.worker must not be empty".into(),
            ));
        }
        AgentMapping::from_names(&self.agent_mappings)
            .map_err(|e| ConfigError::Validation(format!("pipeline.agent_mappings: {e}")))?;
        Ok(())
    }

    /// Whether `path` should be posted as an artifact.
    pub fn is_artifact(&self, path: &str) -> bool {
        let lower = path.to_lowercase();
        self.artifact_extensions
            .iter()
            .any(|ext| lower.ends_with(&ext.to_lowercase()))
    }
}

fn default_reviewer() -> String {
    "copilot-pull-request-reviewer".into()
}
fn default_worker() -> String {
    "copilot".into()
}
fn default_artifact_extensions() -> Vec<String> {
    vec![".md".into()]
}
fn default_agent_mappings() -> BTreeMap<String, Vec<String>> {
    AgentMapping::default().to_names()
}

/// Tracker connection settings.
///
/// Only the *name* of the token environment variable lives here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationConfig {
    #[serde(default = "default_github_env")]
    pub github_token_env: String,
    #[serde(default)]
    pub github_owner: Option<String>,
    #[serde(default)]
    pub github_repo: Option<String>,
    /// Owner (org or user) of the Projects v2 board. Defaults to `github_owner`.
    #[serde(default)]
    pub project_owner: Option<String>,
    #[serde(default)]
    pub project_number: Option<u64>,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            github_token_env: default_github_env(),
            github_owner: None,
            github_repo: None,
            project_owner: None,
            project_number: None,
        }
    }
}

fn default_github_env() -> String {
    "GITHUB_TOKEN".into()
}

// ---------------------------------------------------------------------------
// CredentialProvider
// ---------------------------------------------------------------------------

/// Reads secrets from the environment at the moment they are needed.
pub struct CredentialProvider;

impl CredentialProvider {
    /// The GitHub token from the configured env var, if set and non-empty.
    pub fn github_token(integrations: &IntegrationConfig) -> Option<String> {
        std::env::var(&integrations.github_token_env)
            .ok()
            .filter(|token| !token.trim().is_empty())
    }
}

// ---------------------------------------------------------------------------
// ConfigSource / ConfigHandle
// ---------------------------------------------------------------------------

/// Somewhere a [`Config`] can be (re)loaded from.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<Config, ConfigError>;

    fn describe(&self) -> String;
}

/// In-memory source, replaceable at runtime.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    config: Arc<RwLock<Config>>,
}

impl StaticSource {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
        }
    }

    /// Swap the served config. Picked up by the next refresh.
    pub fn replace(&self, config: Config) {
        let mut guard = self.config.write().unwrap_or_else(|e| e.into_inner());
        *guard = config;
    }
}

impl ConfigSource for StaticSource {
    fn load(&self) -> Result<Config, ConfigError> {
        let config = self
            .config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        config.validate()?;
        Ok(config)
    }

    fn describe(&self) -> String {
        "static".into()
    }
}

/// TOML file re-read on every refresh.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Source for [`Config::config_path`].
    pub fn default_location() -> Self {
        Self::new(Config::config_path())
    }
}

impl ConfigSource for FileSource {
    fn load(&self) -> Result<Config, ConfigError> {
        if self.path.exists() {
            Config::load_from(&self.path)
        } else {
            Ok(Config::default())
        }
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// A validated snapshot. `generation` increases whenever the content changes.
#[derive(Debug, Clone)]
pub struct Settings {
    pub config: Config,
    pub mapping: AgentMapping,
    pub generation: u64,
}

/// Shared, refreshable access to the current [`Settings`].
pub struct ConfigHandle {
    source: Box<dyn ConfigSource>,
    current: RwLock<Arc<Settings>>,
}

impl std::fmt::Debug for ConfigHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigHandle")
            .field("source", &self.source.describe())
            .field("generation", &self.current().generation)
            .finish()
    }
}

impl ConfigHandle {
    /// Load the initial snapshot. Fails if the source is invalid right away.
    pub fn new(source: impl ConfigSource + 'static) -> Result<Self, ConfigError> {
        let config = source.load()?;
        let mapping = config.agent_mapping()?;
        Ok(Self {
            source: Box::new(source),
            current: RwLock::new(Arc::new(Settings {
                config,
                mapping,
                generation: 1,
            })),
        })
    }

    /// Handle over a fixed config.
    pub fn from_config(config: Config) -> Result<Self, ConfigError> {
        Self::new(StaticSource::new(config))
    }

    pub fn current(&self) -> Arc<Settings> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Re-read the source. An invalid source keeps the last good snapshot.
    pub fn refresh(&self) -> Arc<Settings> {
        let loaded = self
            .source
            .load()
            .and_then(|config| config.agent_mapping().map(|mapping| (config, mapping)));

        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        match loaded {
            Ok((config, mapping)) if config != guard.config => {
                let generation = guard.generation + 1;
                info!(source = %self.source.describe(), generation, "configuration reloaded");
                *guard = Arc::new(Settings {
                    config,
                    mapping,
                    generation,
                });
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    source = %self.source.describe(),
                    error = %e,
                    generation = guard.generation,
                    "invalid configuration, keeping previous settings"
                );
            }
        }
        guard.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PipelineStatus;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.polling.interval_secs, 60);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.recovery.cooldown_secs, 300);
        assert_eq!(cfg.daemon.port, 9797);
        let mapping = cfg.agent_mapping().unwrap();
        assert_eq!(
            mapping.agents_for(PipelineStatus::Ready),
            ["plan".to_string(), "tasks".to_string()]
        );
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg = Config::from_toml(
            r#"
            [polling]
            interval_secs = 15

            [pipeline.agent_mappings]
            backlog = ["specify"]
            "in progress" = ["implement"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.polling.interval_secs, 15);
        assert_eq!(cfg.polling.max_concurrent_issues, 4);
        assert_eq!(cfg.pipeline.worker, "copilot");
        let mapping = cfg.agent_mapping().unwrap();
        assert!(mapping.agents_for(PipelineStatus::Ready).is_empty());
        assert_eq!(
            mapping.agents_for(PipelineStatus::InProgress),
            ["implement".to_string()]
        );
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = Config::from_toml("[polling]\ninterval_secs = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn multiplier_below_one_is_rejected() {
        let err = Config::from_toml("[retry]\nmultiplier = 0.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn unknown_status_key_is_rejected() {
        let err = Config::from_toml("[pipeline.agent_mappings]\nBlocked = [\"x\"]\n").unwrap_err();
        assert!(err.to_string().contains("Blocked"));
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let err = Config::from_toml("[polling\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn artifact_extension_match_ignores_case() {
        let pipeline = PipelineConfig::default();
        assert!(pipeline.is_artifact("specs/PLAN.MD"));
        assert!(!pipeline.is_artifact("src/main.rs"));
    }

    #[test]
    fn toml_round_trip() {
        let cfg = Config::default();
        let text = cfg.to_toml().unwrap();
        assert_eq!(Config::from_toml(&text).unwrap(), cfg);
    }

    #[test]
    fn static_handle_bumps_generation_on_change() {
        let source = StaticSource::new(Config::default());
        let handle = ConfigHandle::new(source.clone()).unwrap();
        assert_eq!(handle.current().generation, 1);

        assert_eq!(handle.refresh().generation, 1);

        let mut changed = Config::default();
        changed.polling.interval_secs = 5;
        source.replace(changed);
        let settings = handle.refresh();
        assert_eq!(settings.generation, 2);
        assert_eq!(settings.config.polling.interval_secs, 5);
    }

    #[test]
    fn invalid_update_keeps_last_good_snapshot() {
        let source = StaticSource::new(Config::default());
        let handle = ConfigHandle::new(source.clone()).unwrap();

        let mut broken = Config::default();
        broken.retry.max_attempts = 0;
        source.replace(broken);

        let settings = handle.refresh();
        assert_eq!(settings.generation, 1);
        assert_eq!(settings.config.retry.max_attempts, 3);
    }
}
