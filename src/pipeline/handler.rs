use super::mailbox::ResultSink;
use super::stats::StreamStats;
use crate::domain::{
    AlertLevel, ErrorInfo, Record, RecordPayload, RecordResult, Request, Response, ResultPayload,
    RunUpdateResult,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

enum Handled {
    Forward(Record),
    Respond(RecordResult),
    Drop,
}

/// First stage: answers local requests, rejects malformed input and forwards
/// everything else in submission order.
pub struct HandlerStage {
    results: ResultSink,
    stats: Arc<StreamStats>,
}

impl HandlerStage {
    pub fn new(results: ResultSink, stats: Arc<StreamStats>) -> Self {
        Self { results, stats }
    }

    pub async fn run(self, mut inbound: mpsc::Receiver<Record>, forward: mpsc::Sender<Record>) {
        while let Some(record) = inbound.recv().await {
            self.stats.record_handled();
            match self.handle(record) {
                Handled::Forward(record) => {
                    if let Err(err) = forward.send(record).await {
                        warn!(kind = err.0.kind(), "Downstream stage stopped, handler exiting");
                        break;
                    }
                }
                Handled::Respond(result) => self.results.respond(result).await,
                Handled::Drop => {}
            }
        }
        debug!("Handler finished");
    }

    fn handle(&self, record: Record) -> Handled {
        match &record.payload {
            RecordPayload::Request(Request::Status) => {
                if !record.control.expects_response() {
                    return Handled::Drop;
                }
                let status = Response::Status(self.stats.status());
                Handled::Respond(RecordResult::reply_to(&record, ResultPayload::Response(status)))
            }
            RecordPayload::Alert(alert) => match alert.level.parse::<AlertLevel>() {
                Ok(_) => Handled::Forward(record),
                Err(message) => {
                    warn!(title = %alert.title, "Rejecting alert: {message}");
                    Handled::Respond(RecordResult::reply_to(
                        &record,
                        ResultPayload::Error(ErrorInfo::invalid_input(message)),
                    ))
                }
            },
            RecordPayload::Run(run) if run.run_id.is_empty() => {
                warn!("Rejecting run record without a run id");
                Handled::Respond(RecordResult::reply_to(
                    &record,
                    ResultPayload::RunUpdate(RunUpdateResult {
                        error: Some(ErrorInfo::invalid_input("run record has no run_id")),
                    }),
                ))
            }
            _ => Handled::Forward(record),
        }
    }
}
