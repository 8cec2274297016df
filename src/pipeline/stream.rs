use super::dispatcher::{Dispatcher, MissingResponderPolicy, ResponderEntry};
use super::handler::HandlerStage;
use super::mailbox::{Mailbox, MailboxError, ResultSink};
use super::monitor::EventSource;
use super::reader::ReplayReader;
use super::sender::{SenderStage, SenderStageParams};
use super::stats::StreamStats;
use super::work::ApiWorkManager;
use super::writer::WriterStage;
use crate::domain::{ExitResult, Record, ResultPayload};
use crate::observability::ErrorCapture;
use crate::reliability::RequestContext;
use crate::sender::Uploader;
use crate::store::{OpenMode, Store, StoreError};
use crate::waiting::{Debouncer, Delay, TimerDelay};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("failed to open transaction log: {0}")]
    Store(#[from] StoreError),
    #[error("stream was never started")]
    NotStarted,
    #[error("stream already started")]
    AlreadyStarted,
    #[error("stream already closed")]
    AlreadyClosed,
    #[error("exit result not delivered: {0}")]
    ExitNotDelivered(#[from] MailboxError),
    #[error("record rejected, stream is closing")]
    Rejected,
    #[error("exit record answered with an unexpected result")]
    UnexpectedResult,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineMode {
    /// Handler, Writer, Sender.
    Live,
    /// Handler, Sender. Nothing is persisted.
    SkipTransactionLog,
    /// Re-uploads an existing transaction log.
    Replay(PathBuf),
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub mode: PipelineMode,
    pub log_path: PathBuf,
    /// Keep everything in the log and forward only always-send records.
    pub offline: bool,
    pub buffer_size: usize,
    pub config_debounce: Duration,
    pub missing_responder: MissingResponderPolicy,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            mode: PipelineMode::Live,
            log_path: PathBuf::from("run.log"),
            offline: false,
            buffer_size: 1024,
            config_debounce: Duration::from_secs(30),
            missing_responder: MissingResponderPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Created,
    Started,
    Closing,
    Closed,
}

/// Owns the stages of one run and the channels between them.
///
/// ```text
/// callers ──► ApiWorkManager ──► Handler ──► Writer ──► Sender
///   loopback ──┘                    │                      │
///                                   └──► Dispatcher ◄──────┘
/// ```
pub struct Stream<U: Uploader> {
    config: StreamConfig,
    state: Mutex<StreamState>,
    uploader: Arc<U>,
    work: ApiWorkManager,
    work_rx: Mutex<Option<mpsc::Receiver<Record>>>,
    dispatcher: Arc<Dispatcher>,
    mailbox: Arc<Mailbox>,
    stats: Arc<StreamStats>,
    errors: ErrorCapture,
    run_ctx: CancellationToken,
    sender_finished: CancellationToken,
    shutdown_started: AtomicBool,
    closed: CancellationToken,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    debounce_tick: Mutex<Option<Box<dyn Delay>>>,
}

impl<U: Uploader> Stream<U> {
    pub fn new(config: StreamConfig, uploader: U, errors: ErrorCapture) -> Self {
        let (work, work_rx) = ApiWorkManager::new(config.buffer_size);
        let dispatcher = Dispatcher::new(config.missing_responder, errors.clone());
        Self {
            config,
            state: Mutex::new(StreamState::Created),
            uploader: Arc::new(uploader),
            work,
            work_rx: Mutex::new(Some(work_rx)),
            dispatcher: Arc::new(dispatcher),
            mailbox: Arc::new(Mailbox::new()),
            stats: Arc::new(StreamStats::new()),
            errors,
            run_ctx: CancellationToken::new(),
            sender_finished: CancellationToken::new(),
            shutdown_started: AtomicBool::new(false),
            closed: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            debounce_tick: Mutex::new(None),
        }
    }

    /// Replaces the timer that wakes the sender to push debounced config.
    pub fn with_debounce_delay(self, delay: impl Delay + 'static) -> Self {
        *self.debounce_tick.lock() = Some(Box::new(delay));
        self
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock()
    }

    pub fn stats(&self) -> &Arc<StreamStats> {
        &self.stats
    }

    pub fn uploader(&self) -> &Arc<U> {
        &self.uploader
    }

    /// Opens the transaction log, wires the channels and spawns one task per
    /// stage. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), StreamError> {
        let mut state = self.state.lock();
        match *state {
            StreamState::Created => {}
            StreamState::Started => return Err(StreamError::AlreadyStarted),
            StreamState::Closing | StreamState::Closed => return Err(StreamError::AlreadyClosed),
        }

        let store = match self.config.mode {
            PipelineMode::Live => Some(Store::open(&self.config.log_path, OpenMode::Write)?),
            PipelineMode::SkipTransactionLog | PipelineMode::Replay(_) => None,
        };
        let Some(work_rx) = self.work_rx.lock().take() else {
            return Err(StreamError::AlreadyStarted);
        };

        let buffer = self.config.buffer_size.max(1);
        let (handler_results_tx, handler_results_rx) = mpsc::channel(buffer);
        let (sender_results_tx, sender_results_rx) = mpsc::channel(buffer);
        let (handler_out_tx, handler_out_rx) = mpsc::channel(buffer);
        let mut tasks = self.tasks.lock();

        if let PipelineMode::Replay(path) = &self.config.mode {
            let reader = ReplayReader::new(
                path.clone(),
                self.work.clone(),
                self.errors.clone().with_tag("stage", "reader"),
            );
            let runtime = Handle::current();
            tasks.push((
                "reader",
                tokio::task::spawn_blocking(move || reader.run(runtime)),
            ));
        }

        let handler = HandlerStage::new(
            ResultSink::new(self.mailbox.clone(), handler_results_tx),
            self.stats.clone(),
        );
        tasks.push(("handler", tokio::spawn(handler.run(work_rx, handler_out_tx))));

        let sender_rx = match store {
            Some(store) => {
                let (writer_tx, writer_rx) = mpsc::channel(buffer);
                let writer = WriterStage::new(
                    store,
                    self.config.offline,
                    self.stats.clone(),
                    self.errors.clone().with_tag("stage", "writer"),
                    self.run_ctx.clone(),
                );
                tasks.push((
                    "writer",
                    tokio::task::spawn_blocking(move || writer.run(handler_out_rx, writer_tx)),
                ));
                writer_rx
            }
            None => handler_out_rx,
        };

        let debounce_tick = self
            .debounce_tick
            .lock()
            .take()
            .unwrap_or_else(|| Box::new(TimerDelay::new(self.config.config_debounce)) as Box<dyn Delay>);
        let sender = SenderStage::new(SenderStageParams {
            uploader: self.uploader.clone(),
            ctx: RequestContext::new(self.run_ctx.clone()),
            results: ResultSink::new(self.mailbox.clone(), sender_results_tx),
            work: self.work.clone(),
            stats: self.stats.clone(),
            errors: self.errors.clone().with_tag("stage", "sender"),
            config_debouncer: Debouncer::new(self.config.config_debounce, 1),
            debounce_tick,
            finished: self.sender_finished.clone(),
        });
        tasks.push(("sender", tokio::spawn(sender.run(sender_rx))));

        tasks.push((
            "dispatcher.handler",
            tokio::spawn(self.dispatcher.clone().run(handler_results_rx)),
        ));
        tasks.push((
            "dispatcher.sender",
            tokio::spawn(self.dispatcher.clone().run(sender_results_rx)),
        ));

        *state = StreamState::Started;
        info!(mode = ?self.config.mode, offline = self.config.offline, "Stream started");
        Ok(())
    }

    /// Submits one record, waiting while the pipeline is full.
    pub async fn handle_record(&self, record: Record) -> Result<(), StreamError> {
        if self.work.add_work(record).await {
            Ok(())
        } else {
            Err(StreamError::Rejected)
        }
    }

    pub fn add_responders(&self, entries: impl IntoIterator<Item = ResponderEntry>) {
        self.dispatcher.add_responders(entries);
    }

    /// Ingress for records produced inside the process.
    pub fn loopback(&self) -> ApiWorkManager {
        self.work.clone()
    }

    /// Runs `source` until the stream winds down; it is awaited on close.
    pub fn attach_source<S: EventSource>(&self, source: S) {
        let name = source.name();
        let task = tokio::spawn(source.run(self.work.clone(), self.run_ctx.child_token()));
        self.tasks.lock().push((name, task));
    }

    /// Submits the exit record, waits for the final flush to finish and
    /// closes the stream.
    pub async fn finish_and_close(&self, exit_code: i32) -> Result<ExitResult, StreamError> {
        let state = {
            let mut state = self.state.lock();
            let previous = *state;
            if previous == StreamState::Started {
                *state = StreamState::Closing;
            }
            previous
        };
        match state {
            StreamState::Started => {}
            StreamState::Created => {
                self.close().await;
                return Err(StreamError::NotStarted);
            }
            StreamState::Closing | StreamState::Closed => return Err(StreamError::AlreadyClosed),
        }

        let outcome = match self.config.mode {
            PipelineMode::Replay(_) => {
                // The replayed log carries its own exit record.
                let done = self.work.done_token();
                tokio::select! {
                    () = done.cancelled() => {}
                    () = self.sender_finished.cancelled() => {}
                }
                None
            }
            PipelineMode::Live | PipelineMode::SkipTransactionLog => {
                Some(self.submit_exit(exit_code).await)
            }
        };

        self.shutdown().await;
        match outcome {
            Some(outcome) => outcome,
            None => Ok(self.stats.exit().unwrap_or_else(|| self.replay_outcome())),
        }
    }

    async fn submit_exit(&self, exit_code: i32) -> Result<ExitResult, StreamError> {
        let mut exit = Record::exit(exit_code);
        let handle = self.mailbox.deliver(&mut exit);
        if !self.work.add_work(exit).await {
            return Err(StreamError::Rejected);
        }
        let result = handle.wait().await?;
        match result.payload {
            ResultPayload::Exit(exit) => Ok(exit),
            other => {
                debug!(?other, "Unexpected answer to exit record");
                Err(StreamError::UnexpectedResult)
            }
        }
    }

    fn replay_outcome(&self) -> ExitResult {
        let failed = self.stats.uploads_failed();
        ExitResult {
            success: failed == 0,
            error: (failed > 0).then(|| format!("{failed} uploads failed")),
        }
    }

    /// Stops accepting records and waits for every stage to drain. Safe to
    /// call any number of times, concurrently or not.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == StreamState::Started {
                *state = StreamState::Closing;
            }
        }
        self.shutdown().await;
    }

    async fn shutdown(&self) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            self.closed.cancelled().await;
            return;
        }

        self.work.set_done();
        self.work.close().await;

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for (name, task) in tasks {
            if let Err(err) = task.await {
                if err.is_panic() {
                    self.errors.fatal(format!("{name} task panicked"), Some(&err));
                } else {
                    debug!(task = name, "Task cancelled");
                }
            }
        }

        self.run_ctx.cancel();
        self.mailbox.close();
        *self.state.lock() = StreamState::Closed;
        self.closed.cancel();
        info!(
            handled = self.stats.handled(),
            written = self.stats.written(),
            uploaded = self.stats.uploaded(),
            failed = self.stats.uploads_failed(),
            "Stream closed"
        );
    }
}
