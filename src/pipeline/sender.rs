use super::mailbox::{MailboxCloser, ResultSink};
use super::stats::StreamStats;
use super::work::ApiWorkManager;
use crate::domain::{
    ConfigRecord, DeferState, ErrorInfo, ExitResult, Record, RecordPayload, RecordResult, Request,
    ResultPayload, RunUpdateResult,
};
use crate::observability::ErrorCapture;
use crate::reliability::RequestContext;
use crate::sender::{Upload, UploadError, Uploader};
use crate::waiting::{Debouncer, Delay};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

enum Next {
    Record(Record),
    DebounceTick,
    Closed,
}

enum ExitProgress {
    Waiting,
    Flushing(Record),
    Done,
}

/// Closes the mailbox and signals completion when the stage ends, even if it
/// panics.
struct StageGuard {
    _mailbox: MailboxCloser,
    finished: CancellationToken,
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        self.finished.cancel();
    }
}

/// Last stage: uploads records and runs the exit flush.
pub struct SenderStage<U: Uploader> {
    uploader: Arc<U>,
    ctx: RequestContext,
    results: ResultSink,
    work: ApiWorkManager,
    stats: Arc<StreamStats>,
    errors: ErrorCapture,
    config: BTreeMap<String, String>,
    config_debouncer: Debouncer,
    debounce_tick: Box<dyn Delay>,
    exit: ExitProgress,
    flush_failures: Vec<String>,
    finished: CancellationToken,
}

pub struct SenderStageParams<U: Uploader> {
    pub uploader: Arc<U>,
    pub ctx: RequestContext,
    pub results: ResultSink,
    pub work: ApiWorkManager,
    pub stats: Arc<StreamStats>,
    pub errors: ErrorCapture,
    pub config_debouncer: Debouncer,
    pub debounce_tick: Box<dyn Delay>,
    pub finished: CancellationToken,
}

impl<U: Uploader> SenderStage<U> {
    pub fn new(params: SenderStageParams<U>) -> Self {
        let SenderStageParams {
            uploader,
            ctx,
            results,
            work,
            stats,
            errors,
            config_debouncer,
            debounce_tick,
            finished,
        } = params;
        Self {
            uploader,
            ctx,
            results,
            work,
            stats,
            errors,
            config: BTreeMap::new(),
            config_debouncer,
            debounce_tick,
            exit: ExitProgress::Waiting,
            flush_failures: Vec::new(),
            finished,
        }
    }

    pub async fn run(mut self, mut inbound: mpsc::Receiver<Record>) {
        let _guard = StageGuard {
            _mailbox: MailboxCloser(self.results.mailbox().clone()),
            finished: self.finished.clone(),
        };

        loop {
            let pending = self.config_debouncer.is_pending();
            let next = tokio::select! {
                biased;
                record = inbound.recv() => match record {
                    Some(record) => Next::Record(record),
                    None => Next::Closed,
                },
                () = self.debounce_tick.wait(), if pending => Next::DebounceTick,
            };

            match next {
                Next::Record(record) => {
                    self.process(record).await;
                    self.debounce_config().await;
                }
                Next::DebounceTick => self.debounce_config().await,
                Next::Closed => break,
            }
        }

        if self.config_debouncer.flush() {
            self.upload_config().await;
        }
        debug!("Sender finished");
    }

    async fn process(&mut self, record: Record) {
        match &record.payload {
            RecordPayload::Run(_) => self.upsert_run(&record).await,
            RecordPayload::Config(update) => {
                merge_config(&mut self.config, update);
                self.config_debouncer.set();
            }
            RecordPayload::Exit { .. } => self.begin_exit(record),
            RecordPayload::Request(Request::Defer(state)) => {
                let state = *state;
                self.handle_defer(state).await;
            }
            RecordPayload::Request(Request::Status) => {}
            _ => {
                let result = self.uploader.upload(&self.ctx, Upload::Record(&record)).await;
                self.note_upload("record", result);
            }
        }
    }

    async fn upsert_run(&mut self, record: &Record) {
        let result = self.uploader.upload(&self.ctx, Upload::Run(record)).await;
        let error = result
            .as_ref()
            .err()
            .map(|err| ErrorInfo::communication(err.to_string()));
        self.note_upload("run", result);

        if record.control.expects_response() {
            let update = ResultPayload::RunUpdate(RunUpdateResult { error });
            self.results.respond(RecordResult::reply_to(record, update)).await;
        }
    }

    async fn debounce_config(&mut self) {
        if self.config_debouncer.debounce() {
            self.upload_config().await;
        }
    }

    async fn upload_config(&mut self) -> bool {
        let result = self
            .uploader
            .upload(&self.ctx, Upload::Config(&self.config))
            .await;
        self.note_upload("config", result)
    }

    /// Counts and reports the outcome. Failed uploads never stop the stage.
    fn note_upload(&self, kind: &str, result: Result<(), UploadError>) -> bool {
        self.stats.record_upload(result.is_ok());
        match result {
            Ok(()) => true,
            Err(err) => {
                self.errors.error(format!("{kind} upload failed"), Some(&err));
                false
            }
        }
    }

    fn begin_exit(&mut self, record: Record) {
        if !matches!(self.exit, ExitProgress::Waiting) {
            warn!(uuid = %record.uuid, "Ignoring duplicate exit record");
            return;
        }
        info!(num = record.num, "Exit received, flushing");
        self.exit = ExitProgress::Flushing(record);
        self.loopback(DeferState::Begin);
    }

    async fn handle_defer(&mut self, state: DeferState) {
        if !matches!(self.exit, ExitProgress::Flushing(_)) {
            warn!(?state, "Flush step without a pending exit, ignoring");
            return;
        }
        debug!(?state, "Flush step");

        match state {
            DeferState::Begin => self.flush_failures.clear(),
            DeferState::FlushConfig => {
                if self.config_debouncer.flush() && !self.upload_config().await {
                    self.flush_failures.push("config upload failed".to_string());
                }
            }
            DeferState::FlushUploads => {
                if let Err(err) = self.uploader.flush(&self.ctx).await {
                    self.errors.error("flushing uploads failed", Some(&err));
                    self.flush_failures.push(err.to_string());
                }
            }
            DeferState::End => {
                self.finish_exit().await;
                return;
            }
        }

        if let Some(next) = state.next() {
            self.loopback(next);
        }
    }

    async fn finish_exit(&mut self) {
        let ExitProgress::Flushing(record) = std::mem::replace(&mut self.exit, ExitProgress::Done)
        else {
            return;
        };

        let uploaded = self.uploader.upload(&self.ctx, Upload::Exit(&record)).await;
        if !self.note_upload("exit", uploaded) {
            self.flush_failures.push("exit upload failed".to_string());
        }

        let exit = ExitResult {
            success: self.flush_failures.is_empty(),
            error: (!self.flush_failures.is_empty()).then(|| self.flush_failures.join("; ")),
        };
        info!(success = exit.success, "Final flush finished");
        self.stats.set_exit(exit.clone());

        if record.control.expects_response() {
            let result = RecordResult::reply_to(&record, ResultPayload::Exit(exit));
            self.results.respond(result).await;
        }
        self.work.set_done();
    }

    /// Re-submits a flush step behind everything already queued. Spawned so
    /// the stage never waits on its own input queue.
    fn loopback(&self, state: DeferState) {
        let work = self.work.clone();
        tokio::spawn(async move {
            if !work.add_work(Record::defer(state)).await {
                debug!(?state, "Flush step dropped, pipeline is closing");
            }
        });
    }
}

fn merge_config(config: &mut BTreeMap<String, String>, update: &ConfigRecord) {
    for item in &update.update {
        config.insert(item.key.clone(), item.value_json.clone());
    }
    for key in &update.remove {
        config.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ConfigItem, HistoryRecord, RunRecord};
    use crate::pipeline::mailbox::Mailbox;
    use crate::sender::ClientError;
    use crate::waiting::FakeDelay;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingUploader {
        uploads: Mutex<Vec<String>>,
        configs: Mutex<Vec<BTreeMap<String, String>>>,
        failing: Mutex<HashSet<&'static str>>,
    }

    impl RecordingUploader {
        fn failing(kind: &'static str) -> Self {
            let uploader = Self::default();
            uploader.failing.lock().insert(kind);
            uploader
        }

        fn kinds(&self) -> Vec<String> {
            self.uploads.lock().clone()
        }
    }

    impl Uploader for RecordingUploader {
        async fn upload(&self, _ctx: &RequestContext, upload: Upload<'_>) -> Result<(), UploadError> {
            let kind = upload.kind();
            self.uploads.lock().push(kind.to_string());
            if let Upload::Config(config) = upload {
                self.configs.lock().push(config.clone());
            }
            if self.failing.lock().contains(kind) {
                return Err(UploadError::Client {
                    kind,
                    source: ClientError::HttpError {
                        status: 500,
                        message: "boom".into(),
                    },
                });
            }
            Ok(())
        }
    }

    struct Harness {
        uploader: Arc<RecordingUploader>,
        work: ApiWorkManager,
        stats: Arc<StreamStats>,
        results: mpsc::Receiver<RecordResult>,
        mailbox: Arc<Mailbox>,
        task: tokio::task::JoinHandle<()>,
    }

    fn start(uploader: RecordingUploader, debounce: Duration) -> Harness {
        let uploader = Arc::new(uploader);
        let (work, inbound) = ApiWorkManager::new(16);
        let (results_tx, results) = mpsc::channel(16);
        let mailbox = Arc::new(Mailbox::new());
        let stats = Arc::new(StreamStats::new());
        let stage = SenderStage::new(SenderStageParams {
            uploader: uploader.clone(),
            ctx: RequestContext::default(),
            results: ResultSink::new(mailbox.clone(), results_tx),
            work: work.clone(),
            stats: stats.clone(),
            errors: ErrorCapture::noop(),
            config_debouncer: Debouncer::new(debounce, 1),
            debounce_tick: Box::new(FakeDelay::new()),
            finished: CancellationToken::new(),
        });
        let task = tokio::spawn(stage.run(inbound));
        Harness {
            uploader,
            work,
            stats,
            results,
            mailbox,
            task,
        }
    }

    fn config(key: &str, value: &str) -> Record {
        Record::new(RecordPayload::Config(ConfigRecord {
            update: vec![ConfigItem {
                key: key.into(),
                value_json: value.into(),
            }],
            remove: Vec::new(),
        }))
    }

    async fn finish(h: &mut Harness, exit: Record) -> ExitResult {
        let mut exit = exit;
        let handle = h.mailbox.deliver(&mut exit);
        assert!(h.work.add_work(exit).await);
        let result = handle.wait().await.unwrap();
        h.work.close().await;
        match result.payload {
            ResultPayload::Exit(exit) => exit,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn exit_flush_runs_after_queued_records() {
        let mut h = start(RecordingUploader::default(), Duration::ZERO);
        for _ in 0..3 {
            h.work
                .add_work(Record::new(RecordPayload::History(HistoryRecord::default())))
                .await;
        }
        let exit = finish(&mut h, Record::exit(0)).await;
        (&mut h.task).await.unwrap();

        assert!(exit.success);
        assert_eq!(h.uploader.kinds(), vec!["history", "history", "history", "exit"]);
        assert_eq!(h.stats.exit(), Some(exit));
        assert!(h.work.is_done());
    }

    #[tokio::test]
    async fn failed_exit_upload_reports_failure() {
        let mut h = start(RecordingUploader::failing("exit"), Duration::ZERO);
        let exit = finish(&mut h, Record::exit(2)).await;
        assert!(!exit.success);
        assert!(exit.error.unwrap().contains("exit upload failed"));
        assert_eq!(h.stats.uploads_failed(), 1);
    }

    #[tokio::test]
    async fn failed_records_do_not_stop_the_stage() {
        let mut h = start(RecordingUploader::failing("history"), Duration::ZERO);
        h.work
            .add_work(Record::new(RecordPayload::History(HistoryRecord::default())))
            .await;
        let exit = finish(&mut h, Record::exit(0)).await;
        assert!(exit.success);
        assert_eq!(h.stats.uploads_failed(), 1);
        assert_eq!(h.stats.uploaded(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn config_is_coalesced_and_flushed_on_exit() {
        let mut h = start(RecordingUploader::default(), Duration::from_secs(30));
        h.work.add_work(config("lr", "0.1")).await;
        h.work.add_work(config("lr", "0.2")).await;
        h.work.add_work(config("epochs", "3")).await;
        let exit = finish(&mut h, Record::exit(0)).await;
        assert!(exit.success);

        let configs = h.uploader.configs.lock().clone();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].get("lr").map(String::as_str), Some("0.1"));
        assert_eq!(configs[1].get("lr").map(String::as_str), Some("0.2"));
        assert_eq!(configs[1].get("epochs").map(String::as_str), Some("3"));
    }

    #[tokio::test]
    async fn run_upsert_answers_the_caller() {
        let mut h = start(RecordingUploader::default(), Duration::ZERO);
        let run = Record::new(RecordPayload::Run(RunRecord {
            run_id: "abc".into(),
            ..RunRecord::default()
        }))
        .with_connection("conn")
        .with_req_resp();
        h.work.add_work(run).await;

        match h.results.recv().await.unwrap().payload {
            ResultPayload::RunUpdate(update) => assert!(update.error.is_none()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_exit_is_ignored() {
        let h = start(RecordingUploader::default(), Duration::ZERO);
        let mut first = Record::exit(0);
        let handle = h.mailbox.deliver(&mut first);
        assert!(h.work.add_work(first).await);
        h.work.add_work(Record::exit(1)).await;

        let result = handle.wait().await.unwrap();
        assert!(matches!(result.payload, ResultPayload::Exit(ExitResult { success: true, .. })));
        h.work.close().await;
        h.task.await.unwrap();
        assert_eq!(
            h.uploader.kinds().iter().filter(|k| k.as_str() == "exit").count(),
            1
        );
    }

    #[tokio::test]
    async fn ending_the_stage_abandons_mailbox_waiters() {
        let h = start(RecordingUploader::default(), Duration::ZERO);
        let mut exit = Record::exit(0);
        let handle = h.mailbox.deliver(&mut exit);
        h.work.set_done();
        h.work.close().await;
        h.task.await.unwrap();
        assert!(handle.wait().await.is_err());
    }
}
