use super::config::LogLevel;
use parking_lot::RwLock;
use std::sync::OnceLock;
use thiserror::Error;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("invalid log filter '{filter}': {source}")]
    InvalidFilter {
        filter: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },
    #[error("failed to install the global tracing subscriber: {0}")]
    AlreadyInstalled(#[from] tracing_subscriber::util::TryInitError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LogDirective {
    target: String,
    level: LogLevel,
}

/// Builds the tracing filter from a default level plus per-target
/// directives and installs a compact or JSON formatter.
pub struct LoggingSystem {
    directives: RwLock<Vec<LogDirective>>,
    json: bool,
}

impl LoggingSystem {
    pub fn new(json: bool) -> Self {
        Self {
            directives: RwLock::new(Vec::new()),
            json,
        }
    }

    pub fn add_directive(&self, target: impl Into<String>, level: LogLevel) {
        self.directives.write().push(LogDirective {
            target: target.into(),
            level,
        });
    }

    /// Quiets the HTTP stack.
    pub fn add_default_directives(&self) {
        for target in ["hyper", "hyper_util", "reqwest", "h2", "rustls"] {
            self.add_directive(target, LogLevel::Warn);
        }
    }

    pub fn build_filter_string(&self, default_level: LogLevel) -> String {
        let directives = self.directives.read();
        let mut parts = Vec::with_capacity(directives.len() + 1);
        parts.push(default_level.as_str().to_string());
        for directive in directives.iter() {
            parts.push(format!("{}={}", directive.target, directive.level.as_str()));
        }
        parts.join(",")
    }

    /// `RUST_LOG`, when set, replaces the configured filter.
    pub fn initialize_tracing(&self, default_level: LogLevel) -> Result<(), LoggingError> {
        let filter_string = std::env::var("RUST_LOG")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| self.build_filter_string(default_level));
        let env_filter =
            EnvFilter::try_new(&filter_string).map_err(|source| LoggingError::InvalidFilter {
                filter: filter_string.clone(),
                source,
            })?;

        let registry = tracing_subscriber::registry().with(env_filter);
        if self.json {
            registry
                .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
                .try_init()?;
        } else {
            registry
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_level(true)
                        .with_writer(std::io::stderr)
                        .compact(),
                )
                .try_init()?;
        }
        Ok(())
    }

    pub fn directive_count(&self) -> usize {
        self.directives.read().len()
    }
}

/// Installs logging once per process; later calls are no-ops.
pub fn setup_logging(level: LogLevel, json: bool) -> Result<(), LoggingError> {
    static INIT: OnceLock<()> = OnceLock::new();
    if INIT.get().is_some() {
        return Ok(());
    }

    let logging = LoggingSystem::new(json);
    logging.add_default_directives();
    logging.initialize_tracing(level)?;
    let _ = INIT.set(());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_starts_with_default_level() {
        let logging = LoggingSystem::new(false);
        assert_eq!(logging.build_filter_string(LogLevel::Debug), "debug");

        logging.add_default_directives();
        let filter = logging.build_filter_string(LogLevel::Info);
        assert!(filter.starts_with("info,"));
        assert!(filter.contains("reqwest=warn"));
        assert_eq!(logging.directive_count(), 5);
    }

    #[test]
    fn built_filters_parse() {
        let logging = LoggingSystem::new(true);
        logging.add_default_directives();
        logging.add_directive("run_forwarder::store", LogLevel::Trace);
        assert!(EnvFilter::try_new(logging.build_filter_string(LogLevel::Warn)).is_ok());
    }
}
