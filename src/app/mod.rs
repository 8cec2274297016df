pub mod config;
pub mod logging_system;

pub use config::{Config, ConfigError, LogLevel};
pub use logging_system::{LoggingError, LoggingSystem, setup_logging};

use crate::domain::{Record, RecordPayload, RunRecord};
use crate::observability::{DedupReporter, ErrorCapture, NoopReporter};
use crate::pipeline::{HeartbeatMonitor, PipelineMode, Stream};
use crate::sender::{HttpClient, HttpUploader, OfflineUploader, RetryClient, Uploader};
use crate::store::{self, StoreError};
use anyhow::Context;
use std::io::Write;
use std::num::NonZeroUsize;
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Main entry point for the application
pub async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Config::from_args(std::env::args_os())?;
    setup_logging(config.log_level, config.json_logs)?;

    let code = match run(config).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            1
        }
    };
    if code != 0 {
        process::exit(code);
    }
    Ok(())
}

/// Runs the mode selected by `config` and returns the process exit code.
pub async fn run(config: Config) -> anyhow::Result<i32> {
    if let Some(path) = &config.peek {
        let stdout = std::io::stdout();
        let summary = peek_log(path, &mut stdout.lock())?;
        info!(records = summary.records, corrupt = summary.corrupt, "Peek finished");
        return Ok(i32::from(summary.corrupt > 0));
    }

    info!(
        "Starting run-forwarder v{} (run_id={}, endpoint={})",
        get_version(),
        config.run_id(),
        config.endpoint
    );
    let errors = error_capture(&config)?;

    if config.offline {
        forward(&config, OfflineUploader, errors).await
    } else {
        let client = HttpClient::new(config.client_config()).context("building HTTP client")?;
        let uploader = HttpUploader::new(RetryClient::new(client), config.run_id());
        forward(&config, uploader, errors).await
    }
}

fn error_capture(config: &Config) -> anyhow::Result<ErrorCapture> {
    let capacity =
        NonZeroUsize::new(config.error_cache_size).context("error cache size must be non-zero")?;
    let reporter = DedupReporter::new(NoopReporter, capacity, config.error_window);
    Ok(ErrorCapture::new(Arc::new(reporter)).with_tag("run_id", config.run_id()))
}

async fn forward<U: Uploader>(
    config: &Config,
    uploader: U,
    errors: ErrorCapture,
) -> anyhow::Result<i32> {
    let stream = Stream::new(config.stream_config(), uploader, errors);
    stream.start().context("starting the pipeline")?;
    if config.heartbeat_secs > 0 {
        stream.attach_source(HeartbeatMonitor::new(Duration::from_secs(
            config.heartbeat_secs,
        )));
    }

    if !matches!(config.pipeline_mode(), PipelineMode::Replay(_)) {
        let run = Record::new(RecordPayload::Run(RunRecord {
            run_id: config.run_id().to_string(),
            ..RunRecord::default()
        }));
        stream.handle_record(run).await?;

        let stdin = BufReader::new(tokio::io::stdin());
        tokio::select! {
            submitted = submit_lines(&stream, stdin) => {
                let submitted = submitted?;
                info!(records = submitted, "Input finished");
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, finishing the run");
            }
        }
    }

    let exit = stream
        .finish_and_close(config.exit_code)
        .await
        .context("finishing the run")?;
    if exit.success {
        info!("Run finished");
        Ok(0)
    } else {
        error!(
            error = exit.error.as_deref().unwrap_or("unknown"),
            "Final flush failed"
        );
        Ok(1)
    }
}

/// Submits one record per JSON line. Lines that do not parse are skipped.
pub async fn submit_lines<U, R>(stream: &Stream<U>, input: R) -> anyhow::Result<u64>
where
    U: Uploader,
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut line_number = 0u64;
    let mut submitted = 0u64;
    while let Some(line) = lines.next_line().await.context("reading input")? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }
        let payload: RecordPayload = match serde_json::from_str(&line) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(line = line_number, "Skipping malformed record: {e}");
                continue;
            }
        };
        stream.handle_record(Record::new(payload)).await?;
        submitted += 1;
    }
    Ok(submitted)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeekSummary {
    pub records: u64,
    pub corrupt: u64,
}

/// Writes every record of the log at `path` to `out` as a JSON line.
pub fn peek_log<W: Write>(path: &Path, out: &mut W) -> anyhow::Result<PeekSummary> {
    let mut summary = PeekSummary::default();
    let records = store::peek(path)
        .with_context(|| format!("opening transaction log {}", path.display()))?;
    for item in records {
        match item {
            Ok(record) => {
                serde_json::to_writer(&mut *out, &record)?;
                writeln!(out)?;
                summary.records += 1;
            }
            Err(err) if err.is_recoverable() => {
                warn!(after = summary.records, "Corrupt region: {err}");
                summary.corrupt += 1;
            }
            Err(StoreError::Io(err)) => return Err(err).context("reading transaction log"),
            Err(err) => return Err(err.into()),
        }
    }
    out.flush()?;
    Ok(summary)
}
