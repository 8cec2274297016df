use crate::domain::{ExitResult, StatusResponse};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the stages of one stream.
#[derive(Debug, Default)]
pub struct StreamStats {
    handled: AtomicU64,
    written: AtomicU64,
    uploaded: AtomicU64,
    uploads_failed: AtomicU64,
    exit: Mutex<Option<ExitResult>>,
}

impl StreamStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_handled(&self) {
        self.handled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_written(&self) {
        self.written.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_upload(&self, success: bool) {
        if success {
            self.uploaded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.uploads_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn set_exit(&self, exit: ExitResult) {
        *self.exit.lock() = Some(exit);
    }

    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn uploads_failed(&self) -> u64 {
        self.uploads_failed.load(Ordering::Relaxed)
    }

    /// Outcome of the exit flush, once it ran.
    pub fn exit(&self) -> Option<ExitResult> {
        self.exit.lock().clone()
    }

    pub fn status(&self) -> StatusResponse {
        StatusResponse {
            records_handled: self.handled(),
            records_written: self.written(),
            uploads_failed: self.uploads_failed(),
        }
    }
}
