use super::stats::StreamStats;
use crate::domain::Record;
use crate::observability::ErrorCapture;
use crate::store::Store;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Persists records to the transaction log before they are uploaded.
///
/// Owns a blocking file handle, so `run` must be called from
/// `spawn_blocking`.
pub struct WriterStage {
    store: Store,
    offline: bool,
    next_num: i64,
    stats: Arc<StreamStats>,
    errors: ErrorCapture,
    run_ctx: CancellationToken,
}

impl WriterStage {
    pub fn new(
        store: Store,
        offline: bool,
        stats: Arc<StreamStats>,
        errors: ErrorCapture,
        run_ctx: CancellationToken,
    ) -> Self {
        Self {
            store,
            offline,
            next_num: 1,
            stats,
            errors,
            run_ctx,
        }
    }

    pub fn run(mut self, mut inbound: mpsc::Receiver<Record>, forward: mpsc::Sender<Record>) {
        while let Some(mut record) = inbound.blocking_recv() {
            if !record.control.local {
                record.num = self.next_num;
                if let Err(err) = self.store.write(&record) {
                    self.errors.fatal(
                        format!("failed to write record {} to the transaction log", record.num),
                        Some(&err),
                    );
                    self.run_ctx.cancel();
                    break;
                }
                self.next_num += 1;
                self.stats.record_written();
                trace!(num = record.num, kind = record.kind(), "Persisted record");
            }

            if self.offline && !record.control.always_send {
                continue;
            }
            if forward.blocking_send(record).is_err() {
                debug!("Sender stage stopped, writer exiting");
                break;
            }
        }

        if let Err(err) = self.store.close() {
            self.errors.error("failed to close the transaction log", Some(&err));
        }
        debug!(path = %self.store.path().display(), written = self.next_num - 1, "Writer finished");
    }
}
