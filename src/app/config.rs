use crate::pipeline::{MissingResponderPolicy, PipelineMode, StreamConfig};
use crate::sender::ClientConfig;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("File error: {0}")]
    FileError(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Environment error: {0}")]
    EnvError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(author, version, about, long_about = None)]
#[serde(default)]
pub struct Config {
    /// Base URL of the tracking service
    #[arg(long, env = "RUN_FORWARDER_ENDPOINT", default_value = "http://localhost:8080")]
    pub endpoint: String,

    /// Run identifier (generated when absent)
    #[arg(long, env = "RUN_ID")]
    pub run_id: Option<String>,

    /// Directory holding transaction logs
    #[arg(long, env = "RUN_FORWARDER_LOG_DIR", default_value = "./run-logs")]
    pub log_dir: PathBuf,

    /// Explicit transaction log path (defaults to <log-dir>/run-<run-id>.log)
    #[arg(long, env = "RUN_FORWARDER_LOG_PATH")]
    pub log_path: Option<PathBuf>,

    /// Keep records in the transaction log only
    #[arg(long, env = "RUN_FORWARDER_OFFLINE")]
    pub offline: bool,

    /// Upload without writing a transaction log
    #[arg(long, env = "RUN_FORWARDER_SKIP_TRANSACTION_LOG")]
    pub skip_transaction_log: bool,

    /// Re-upload an existing transaction log
    #[arg(long, conflicts_with = "peek")]
    pub replay: Option<PathBuf>,

    /// Print the records of a transaction log as JSON lines
    #[arg(long)]
    pub peek: Option<PathBuf>,

    /// Capacity of each pipeline queue
    #[arg(long, env = "RUN_FORWARDER_BUFFER_SIZE", default_value = "1024")]
    pub buffer_size: usize,

    /// Retries after the first attempt of each upload
    #[arg(long, env = "RUN_FORWARDER_RETRY_MAX", default_value = "20")]
    pub retry_max: u32,

    /// Shortest wait between retries in milliseconds
    #[arg(long, env = "RUN_FORWARDER_RETRY_WAIT_MIN_MS", default_value = "2000")]
    pub retry_wait_min_ms: u64,

    /// Longest wait between retries in milliseconds
    #[arg(long, env = "RUN_FORWARDER_RETRY_WAIT_MAX_MS", default_value = "60000")]
    pub retry_wait_max_ms: u64,

    /// Per-attempt HTTP timeout in seconds
    #[arg(long, env = "RUN_FORWARDER_HTTP_TIMEOUT_SECS", default_value = "30")]
    pub http_timeout_secs: u64,

    /// Minimum interval between config uploads in seconds
    #[arg(long, env = "RUN_FORWARDER_CONFIG_DEBOUNCE_SECS", default_value = "30")]
    pub config_debounce_secs: u64,

    /// Heartbeat interval in seconds (0 disables it)
    #[arg(long, env = "RUN_FORWARDER_HEARTBEAT_SECS", default_value = "0")]
    pub heartbeat_secs: u64,

    /// Distinct error fingerprints remembered for de-duplication
    #[arg(long, env = "RUN_FORWARDER_ERROR_CACHE_SIZE", default_value = "100")]
    pub error_cache_size: usize,

    /// Window in seconds during which a repeated error is not reported again
    #[arg(long, env = "RUN_FORWARDER_ERROR_WINDOW_SECS", default_value = "60")]
    pub error_window_secs: u64,

    /// What to do with a result for an unknown connection
    #[arg(long, env = "RUN_FORWARDER_MISSING_RESPONDER", default_value = "drop")]
    pub missing_responder: MissingResponderPolicy,

    /// Exit code recorded when stdin ends
    #[arg(long, default_value = "0", allow_negative_numbers = true)]
    pub exit_code: i32,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    /// Emit logs as JSON
    #[arg(long, env = "RUN_FORWARDER_JSON_LOGS")]
    pub json_logs: bool,

    /// Configuration file path (optional)
    #[arg(long, env = "CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Derived fields (not CLI arguments)
    #[serde(skip)]
    #[arg(skip)]
    pub retry_wait_min: Duration,

    #[serde(skip)]
    #[arg(skip)]
    pub retry_wait_max: Duration,

    #[serde(skip)]
    #[arg(skip)]
    pub http_timeout: Duration,

    #[serde(skip)]
    #[arg(skip)]
    pub config_debounce: Duration,

    #[serde(skip)]
    #[arg(skip)]
    pub error_window: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080".to_string(),
            run_id: None,
            log_dir: PathBuf::from("./run-logs"),
            log_path: None,
            offline: false,
            skip_transaction_log: false,
            replay: None,
            peek: None,
            buffer_size: 1024,
            retry_max: 20,
            retry_wait_min_ms: 2000,
            retry_wait_max_ms: 60_000,
            http_timeout_secs: 30,
            config_debounce_secs: 30,
            heartbeat_secs: 0,
            error_cache_size: 100,
            error_window_secs: 60,
            missing_responder: MissingResponderPolicy::Drop,
            exit_code: 0,
            log_level: LogLevel::Info,
            json_logs: false,
            config_file: None,
            retry_wait_min: Duration::from_secs(2),
            retry_wait_max: Duration::from_secs(60),
            http_timeout: Duration::from_secs(30),
            config_debounce: Duration::from_secs(30),
            error_window: Duration::from_secs(60),
        }
    }
}

impl Config {
    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let mut config = Config::parse_from(args);
        if let Some(path) = config.config_file.clone() {
            config = Self::merge_file(config, &path)?;
        }
        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        load_env_string("RUN_FORWARDER_ENDPOINT", &mut config.endpoint);
        load_env_string_opt("RUN_ID", &mut config.run_id);
        load_env_path("RUN_FORWARDER_LOG_DIR", &mut config.log_dir);
        load_env_path_opt("RUN_FORWARDER_LOG_PATH", &mut config.log_path);
        load_env_var("RUN_FORWARDER_OFFLINE", &mut config.offline)?;
        load_env_var(
            "RUN_FORWARDER_SKIP_TRANSACTION_LOG",
            &mut config.skip_transaction_log,
        )?;
        load_env_var("RUN_FORWARDER_BUFFER_SIZE", &mut config.buffer_size)?;
        load_env_var("RUN_FORWARDER_RETRY_MAX", &mut config.retry_max)?;
        load_env_var("RUN_FORWARDER_RETRY_WAIT_MIN_MS", &mut config.retry_wait_min_ms)?;
        load_env_var("RUN_FORWARDER_RETRY_WAIT_MAX_MS", &mut config.retry_wait_max_ms)?;
        load_env_var("RUN_FORWARDER_HTTP_TIMEOUT_SECS", &mut config.http_timeout_secs)?;
        load_env_var(
            "RUN_FORWARDER_CONFIG_DEBOUNCE_SECS",
            &mut config.config_debounce_secs,
        )?;
        load_env_var("RUN_FORWARDER_HEARTBEAT_SECS", &mut config.heartbeat_secs)?;
        load_env_var("RUN_FORWARDER_ERROR_CACHE_SIZE", &mut config.error_cache_size)?;
        load_env_var("RUN_FORWARDER_ERROR_WINDOW_SECS", &mut config.error_window_secs)?;

        if let Ok(policy) = std::env::var("RUN_FORWARDER_MISSING_RESPONDER") {
            config.missing_responder = MissingResponderPolicy::from_str(&policy, true)
                .map_err(|e| ConfigError::EnvError(format!("Invalid RUN_FORWARDER_MISSING_RESPONDER: {e}")))?;
        }

        // LogLevel requires special handling for case-insensitive parsing
        if let Ok(log_level) = std::env::var("LOG_LEVEL") {
            config.log_level = LogLevel::from_str(&log_level, true)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {log_level}")))?;
        }

        load_env_var("RUN_FORWARDER_JSON_LOGS", &mut config.json_logs)?;
        load_env_path_opt("CONFIG_FILE", &mut config.config_file);

        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.post_process()?;
        config.validate()?;
        Ok(config)
    }

    /// Fills fields left at their defaults on the command line from `path`.
    fn merge_file(cli: Config, path: &Path) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let file: Config = toml::from_str(&content)?;
        let defaults = Config::default();

        let mut config = cli;
        if config.endpoint == defaults.endpoint {
            config.endpoint = file.endpoint;
        }
        if config.run_id.is_none() {
            config.run_id = file.run_id;
        }
        if config.log_dir == defaults.log_dir {
            config.log_dir = file.log_dir;
        }
        if config.log_path.is_none() {
            config.log_path = file.log_path;
        }
        config.offline |= file.offline;
        config.skip_transaction_log |= file.skip_transaction_log;
        if config.buffer_size == defaults.buffer_size {
            config.buffer_size = file.buffer_size;
        }
        if config.retry_max == defaults.retry_max {
            config.retry_max = file.retry_max;
        }
        if config.retry_wait_min_ms == defaults.retry_wait_min_ms {
            config.retry_wait_min_ms = file.retry_wait_min_ms;
        }
        if config.retry_wait_max_ms == defaults.retry_wait_max_ms {
            config.retry_wait_max_ms = file.retry_wait_max_ms;
        }
        if config.http_timeout_secs == defaults.http_timeout_secs {
            config.http_timeout_secs = file.http_timeout_secs;
        }
        if config.config_debounce_secs == defaults.config_debounce_secs {
            config.config_debounce_secs = file.config_debounce_secs;
        }
        if config.heartbeat_secs == defaults.heartbeat_secs {
            config.heartbeat_secs = file.heartbeat_secs;
        }
        if config.missing_responder == defaults.missing_responder {
            config.missing_responder = file.missing_responder;
        }
        Ok(config)
    }

    pub fn post_process(&mut self) -> Result<(), ConfigError> {
        self.retry_wait_min = Duration::from_millis(self.retry_wait_min_ms);
        self.retry_wait_max = Duration::from_millis(self.retry_wait_max_ms);
        self.http_timeout = Duration::from_secs(self.http_timeout_secs);
        self.config_debounce = Duration::from_secs(self.config_debounce_secs);
        self.error_window = Duration::from_secs(self.error_window_secs);

        if self.run_id.is_none() {
            self.run_id = Some(generate_run_id());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        Url::parse(&self.endpoint).map_err(|e| {
            ConfigError::InvalidUrl(format!("Invalid endpoint URL '{}': {}", self.endpoint, e))
        })?;

        if self.buffer_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "Buffer size must be greater than 0".to_string(),
            ));
        }

        if self.retry_wait_min_ms > self.retry_wait_max_ms {
            return Err(ConfigError::InvalidConfig(format!(
                "Retry wait min ({}ms) must not exceed retry wait max ({}ms)",
                self.retry_wait_min_ms, self.retry_wait_max_ms
            )));
        }

        if self.http_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "HTTP timeout must be greater than 0".to_string(),
            ));
        }

        if self.error_cache_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "Error cache size must be greater than 0".to_string(),
            ));
        }

        if self.run_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
            return Err(ConfigError::InvalidConfig(
                "Run id must not be blank".to_string(),
            ));
        }

        Ok(())
    }

    pub fn run_id(&self) -> &str {
        self.run_id.as_deref().unwrap_or_default()
    }

    /// Transaction log for this run: the explicit path, or one derived from
    /// the log directory and run id.
    pub fn resolved_log_path(&self) -> PathBuf {
        match &self.log_path {
            Some(path) => path.clone(),
            None => self.log_dir.join(format!("run-{}.log", self.run_id())),
        }
    }

    pub fn pipeline_mode(&self) -> PipelineMode {
        match &self.replay {
            Some(path) => PipelineMode::Replay(path.clone()),
            None if self.skip_transaction_log => PipelineMode::SkipTransactionLog,
            None => PipelineMode::Live,
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            mode: self.pipeline_mode(),
            log_path: self.resolved_log_path(),
            offline: self.offline,
            buffer_size: self.buffer_size,
            config_debounce: self.config_debounce,
            missing_responder: self.missing_responder,
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            endpoint: self.endpoint.clone(),
            timeout: self.http_timeout,
            retry_max: self.retry_max,
            retry_wait_min: self.retry_wait_min,
            retry_wait_max: self.retry_wait_max,
            ..ClientConfig::default()
        }
    }
}

fn generate_run_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

/// Helper function to load and parse an environment variable.
/// Returns Ok(()) if the variable doesn't exist (keeps default).
fn load_env_var<T>(name: &str, target: &mut T) -> Result<(), ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if let Ok(value) = std::env::var(name) {
        *target = value
            .parse()
            .map_err(|e| ConfigError::EnvError(format!("Invalid {name}: {e}")))?;
    }
    Ok(())
}

fn load_env_string_opt(name: &str, target: &mut Option<String>) {
    if let Ok(value) = std::env::var(name) {
        *target = Some(value);
    }
}

fn load_env_string(name: &str, target: &mut String) {
    if let Ok(value) = std::env::var(name) {
        *target = value;
    }
}

fn load_env_path(name: &str, target: &mut PathBuf) {
    if let Ok(value) = std::env::var(name) {
        *target = PathBuf::from(value);
    }
}

fn load_env_path_opt(name: &str, target: &mut Option<PathBuf>) {
    if let Ok(value) = std::env::var(name) {
        *target = Some(PathBuf::from(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let mut config = Config::default();
        config.post_process().unwrap();
        config.validate().unwrap();
        assert_eq!(config.run_id().len(), 8);
        assert_eq!(config.config_debounce, Duration::from_secs(30));
    }

    #[test]
    fn mode_follows_flags() {
        let mut config = Config::default();
        assert_eq!(config.pipeline_mode(), PipelineMode::Live);
        config.skip_transaction_log = true;
        assert_eq!(config.pipeline_mode(), PipelineMode::SkipTransactionLog);
        config.replay = Some(PathBuf::from("old.log"));
        assert_eq!(
            config.pipeline_mode(),
            PipelineMode::Replay(PathBuf::from("old.log"))
        );
    }

    #[test]
    fn log_path_derives_from_run_id() {
        let config = Config {
            run_id: Some("abc123".into()),
            log_dir: PathBuf::from("/tmp/runs"),
            ..Config::default()
        };
        assert_eq!(
            config.resolved_log_path(),
            PathBuf::from("/tmp/runs/run-abc123.log")
        );
    }

    #[test]
    fn rejects_inverted_retry_waits() {
        let config = Config {
            retry_wait_min_ms: 10_000,
            retry_wait_max_ms: 1_000,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn parses_cli_arguments() {
        let config = Config::from_args([
            "run-forwarder",
            "--endpoint",
            "http://collector:9000",
            "--run-id",
            "r1",
            "--offline",
            "--exit-code",
            "-3",
            "--missing-responder",
            "abort",
        ])
        .unwrap();
        assert_eq!(config.endpoint, "http://collector:9000");
        assert_eq!(config.run_id(), "r1");
        assert!(config.offline);
        assert_eq!(config.exit_code, -3);
        assert_eq!(config.missing_responder, MissingResponderPolicy::Abort);
    }
}
