use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CONFIG_FILE_CANDIDATES: [&str; 2] = ["procura.toml", "config/procura.toml"];

/// Fully resolved runtime settings: defaults, then file, then `PROCURA_*` env, then overrides.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub worker: WorkerConfig,
    pub workflow: WorkflowConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub bind_address: String,
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkflowConfig {
    /// How long a purchase request waits for a decision before it expires.
    pub approval_timeout_hours: u32,
    pub max_delegation_days: u32,
    pub journal_max_retries: u32,
    pub journal_retry_base_delay_ms: u64,
    pub journal_retry_max_delay_ms: u64,
}

impl WorkflowConfig {
    pub fn approval_timeout(&self) -> Duration {
        Duration::hours(i64::from(self.approval_timeout_hours))
    }

    pub fn max_delegation_length(&self) -> Duration {
        Duration::days(i64::from(self.max_delegation_days))
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            approval_timeout_hours: 168,
            max_delegation_days: 30,
            journal_max_retries: 5,
            journal_retry_base_delay_ms: 100,
            journal_retry_max_delay_ms: 5_000,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "logging.format `{other}` is not one of compact|pretty|json"
            ))),
        }
    }
}

/// Programmatic settings applied last, after env; used by tests and embedding callers.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub health_check_port: Option<u16>,
    pub approval_timeout_hours: Option<u32>,
    pub max_delegation_days: Option<u32>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("config file `{0}` is required but does not exist")]
    MissingConfigFile(PathBuf),
    #[error("config file references unset environment variable `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("config file has an unterminated `${{...}}` reference")]
    UnterminatedInterpolation,
    #[error("environment variable `{key}` has an invalid value `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://procura.db?mode=rwc".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            worker: WorkerConfig {
                bind_address: "127.0.0.1".to_string(),
                health_check_port: 8080,
                graceful_shutdown_secs: 15,
            },
            workflow: WorkflowConfig::default(),
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let LoadOptions { config_path, require_file, overrides } = options;
        let mut config = Self::default();

        match resolve_config_path(config_path.as_deref()) {
            Some(path) => config.merge_file(read_patch(&path)?),
            None if require_file => {
                let expected =
                    config_path.unwrap_or_else(|| PathBuf::from(CONFIG_FILE_CANDIDATES[0]));
                return Err(ConfigError::MissingConfigFile(expected));
            }
            None => {}
        }

        config.merge_env()?;
        config.merge_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    fn merge_file(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            overlay(&mut self.database.url, database.url);
            overlay(&mut self.database.max_connections, database.max_connections);
            overlay(&mut self.database.timeout_secs, database.timeout_secs);
        }
        if let Some(worker) = patch.worker {
            overlay(&mut self.worker.bind_address, worker.bind_address);
            overlay(&mut self.worker.health_check_port, worker.health_check_port);
            overlay(&mut self.worker.graceful_shutdown_secs, worker.graceful_shutdown_secs);
        }
        if let Some(workflow) = patch.workflow {
            let target = &mut self.workflow;
            overlay(&mut target.approval_timeout_hours, workflow.approval_timeout_hours);
            overlay(&mut target.max_delegation_days, workflow.max_delegation_days);
            overlay(&mut target.journal_max_retries, workflow.journal_max_retries);
            overlay(&mut target.journal_retry_base_delay_ms, workflow.journal_retry_base_delay_ms);
            overlay(&mut target.journal_retry_max_delay_ms, workflow.journal_retry_max_delay_ms);
        }
        if let Some(logging) = patch.logging {
            overlay(&mut self.logging.level, logging.level);
            overlay(&mut self.logging.format, logging.format);
        }
    }

    fn merge_env(&mut self) -> Result<(), ConfigError> {
        env_value("PROCURA_DATABASE_URL", &mut self.database.url)?;
        env_value("PROCURA_DATABASE_MAX_CONNECTIONS", &mut self.database.max_connections)?;
        env_value("PROCURA_DATABASE_TIMEOUT_SECS", &mut self.database.timeout_secs)?;

        env_value("PROCURA_WORKER_BIND_ADDRESS", &mut self.worker.bind_address)?;
        env_value("PROCURA_WORKER_HEALTH_CHECK_PORT", &mut self.worker.health_check_port)?;
        env_value("PROCURA_WORKER_GRACEFUL_SHUTDOWN_SECS", &mut self.worker.graceful_shutdown_secs)?;

        let workflow = &mut self.workflow;
        env_value("PROCURA_WORKFLOW_APPROVAL_TIMEOUT_HOURS", &mut workflow.approval_timeout_hours)?;
        env_value("PROCURA_WORKFLOW_MAX_DELEGATION_DAYS", &mut workflow.max_delegation_days)?;
        env_value("PROCURA_WORKFLOW_JOURNAL_MAX_RETRIES", &mut workflow.journal_max_retries)?;
        env_value(
            "PROCURA_WORKFLOW_JOURNAL_RETRY_BASE_DELAY_MS",
            &mut workflow.journal_retry_base_delay_ms,
        )?;
        env_value(
            "PROCURA_WORKFLOW_JOURNAL_RETRY_MAX_DELAY_MS",
            &mut workflow.journal_retry_max_delay_ms,
        )?;

        // The short `PROCURA_LOG_*` spellings are accepted as fallbacks.
        if !env_value("PROCURA_LOGGING_LEVEL", &mut self.logging.level)? {
            env_value("PROCURA_LOG_LEVEL", &mut self.logging.level)?;
        }
        if let Some(raw) = read_env("PROCURA_LOGGING_FORMAT").or_else(|| read_env("PROCURA_LOG_FORMAT")) {
            self.logging.format = raw.parse()?;
        }

        Ok(())
    }

    fn merge_overrides(&mut self, overrides: ConfigOverrides) {
        overlay(&mut self.database.url, overrides.database_url);
        overlay(&mut self.logging.level, overrides.log_level);
        overlay(&mut self.worker.health_check_port, overrides.health_check_port);
        overlay(&mut self.workflow.approval_timeout_hours, overrides.approval_timeout_hours);
        overlay(&mut self.workflow.max_delegation_days, overrides.max_delegation_days);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let database = &self.database;
        let url = database.url.trim();
        require(
            url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:",
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)",
        )?;
        require(database.max_connections > 0, "database.max_connections must be greater than zero")?;
        require(
            (1..=300).contains(&database.timeout_secs),
            "database.timeout_secs must be in range 1..=300",
        )?;

        require(self.worker.health_check_port > 0, "worker.health_check_port must be greater than zero")?;
        require(
            self.worker.graceful_shutdown_secs > 0,
            "worker.graceful_shutdown_secs must be greater than zero",
        )?;

        let workflow = &self.workflow;
        require(
            workflow.approval_timeout_hours > 0,
            "workflow.approval_timeout_hours must be greater than zero",
        )?;
        require(
            (1..=366).contains(&workflow.max_delegation_days),
            "workflow.max_delegation_days must be in range 1..=366",
        )?;
        require(
            workflow.journal_retry_base_delay_ms <= workflow.journal_retry_max_delay_ms,
            "workflow.journal_retry_base_delay_ms must not exceed journal_retry_max_delay_ms",
        )?;

        require(
            matches!(
                self.logging.level.trim().to_ascii_lowercase().as_str(),
                "trace" | "debug" | "info" | "warn" | "error"
            ),
            "logging.level must be one of trace|debug|info|warn|error",
        )
    }
}

pub fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    match explicit_path {
        Some(path) => path.exists().then(|| path.to_path_buf()),
        None => CONFIG_FILE_CANDIDATES.iter().map(PathBuf::from).find(|path| path.exists()),
    }
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;
    toml::from_str(&expand_env_refs(&raw)?)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

/// Replaces every `${NAME}` in `input` with the value of the environment variable `NAME`.
fn expand_env_refs(input: &str) -> Result<String, ConfigError> {
    let mut expanded = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        expanded.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or(ConfigError::UnterminatedInterpolation)?;
        let name = &after[..end];
        let value = env::var(name)
            .map_err(|_| ConfigError::MissingEnvInterpolation { var: name.to_string() })?;
        expanded.push_str(&value);
        rest = &after[end + 1..];
    }

    expanded.push_str(rest);
    Ok(expanded)
}

fn overlay<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

fn require(condition: bool, message: &str) -> Result<(), ConfigError> {
    if condition {
        Ok(())
    } else {
        Err(ConfigError::Validation(message.to_string()))
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Parses `key` into `target` when set; returns whether it was.
fn env_value<T: FromStr>(key: &str, target: &mut T) -> Result<bool, ConfigError> {
    let Some(raw) = read_env(key) else {
        return Ok(false);
    };
    *target = raw
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnvOverride { key: key.to_string(), value: raw.clone() })?;
    Ok(true)
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    worker: Option<WorkerPatch>,
    workflow: Option<WorkflowPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct WorkerPatch {
    bind_address: Option<String>,
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct WorkflowPatch {
    approval_timeout_hours: Option<u32>,
    max_delegation_days: Option<u32>,
    journal_max_retries: Option<u32>,
    journal_retry_base_delay_ms: Option<u64>,
    journal_retry_max_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
