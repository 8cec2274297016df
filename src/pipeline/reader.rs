use super::work::ApiWorkManager;
use crate::observability::ErrorCapture;
use crate::store::{OpenMode, Store};
use std::path::PathBuf;
use tokio::runtime::Handle;
use tracing::info;

/// Feeds the records of an existing transaction log back into a stream.
///
/// Runs on a blocking thread and enqueues through the work manager, so it
/// waits whenever the pipeline is full.
pub struct ReplayReader {
    path: PathBuf,
    work: ApiWorkManager,
    errors: ErrorCapture,
}

impl ReplayReader {
    pub fn new(path: impl Into<PathBuf>, work: ApiWorkManager, errors: ErrorCapture) -> Self {
        Self {
            path: path.into(),
            work,
            errors,
        }
    }

    pub fn run(self, runtime: Handle) {
        let mut store = match Store::open(&self.path, OpenMode::Read) {
            Ok(store) => store,
            Err(err) => {
                self.errors.error("failed to open transaction log for replay", Some(&err));
                self.work.set_done();
                return;
            }
        };

        let mut replayed = 0u64;
        let mut saw_exit = false;
        for item in store.records() {
            let mut record = match item {
                Ok(record) => record,
                Err(err) if err.is_recoverable() => {
                    self.errors.warn("skipping corrupt region of the transaction log", Some(&err));
                    continue;
                }
                Err(err) => {
                    self.errors.error("replay stopped early", Some(&err));
                    break;
                }
            };

            // Nobody from the original run is listening anymore.
            record.control.connection_id.clear();
            record.control.mailbox_slot.clear();
            record.control.req_resp = false;

            saw_exit |= record.is_exit();
            if !runtime.block_on(self.work.add_work(record)) {
                break;
            }
            replayed += 1;
        }

        info!(path = %self.path.display(), replayed, saw_exit, "Replay finished");
        if !saw_exit {
            self.work.set_done();
        }
    }
}
