//! Error capture for fatal and warning paths.
//!
//! Stages report through an [`ErrorCapture`], which logs with `tracing` and
//! forwards to an [`ErrorReporter`] sink. [`DedupReporter`] keeps one capture
//! per fingerprint per window so a failing loop cannot flood the sink.

use lru::LruCache;
use parking_lot::Mutex;
use std::error::Error;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Warning,
    Error,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedError {
    pub severity: Severity,
    pub message: String,
    /// `Display` of the error and each of its sources, outermost first.
    pub chain: Vec<String>,
    pub tags: Vec<(String, String)>,
}

impl CapturedError {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            chain: Vec::new(),
            tags: Vec::new(),
        }
    }

    pub fn with_source(mut self, err: &(dyn Error + 'static)) -> Self {
        let mut current = Some(err);
        while let Some(err) = current {
            self.chain.push(err.to_string());
            current = err.source();
        }
        self
    }

    /// Identity used for deduplication.
    pub fn fingerprint(&self) -> String {
        format!("{:?}|{}", self.severity, self.message)
    }

    pub fn chain_string(&self) -> String {
        self.chain.join(": ")
    }
}

/// External error-tracking sink.
pub trait ErrorReporter: Send + Sync {
    fn capture(&self, error: &CapturedError);
}

/// Sink used when no error tracker is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ErrorReporter for NoopReporter {
    fn capture(&self, _error: &CapturedError) {}
}

/// Keeps every capture in memory.
#[derive(Debug, Default)]
pub struct MemoryReporter {
    captured: Mutex<Vec<CapturedError>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn captured(&self) -> Vec<CapturedError> {
        self.captured.lock().clone()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.captured
            .lock()
            .iter()
            .filter(|captured| captured.severity == severity)
            .count()
    }
}

impl ErrorReporter for MemoryReporter {
    fn capture(&self, error: &CapturedError) {
        self.captured.lock().push(error.clone());
    }
}

impl<R: ErrorReporter + ?Sized> ErrorReporter for Arc<R> {
    fn capture(&self, error: &CapturedError) {
        (**self).capture(error);
    }
}

/// Forwards at most one capture per fingerprint per `window`.
pub struct DedupReporter<R> {
    inner: R,
    seen: Mutex<LruCache<String, Instant>>,
    window: Duration,
    suppressed: AtomicU64,
}

impl<R: ErrorReporter> DedupReporter<R> {
    pub fn new(inner: R, capacity: NonZeroUsize, window: Duration) -> Self {
        Self {
            inner,
            seen: Mutex::new(LruCache::new(capacity)),
            window,
            suppressed: AtomicU64::new(0),
        }
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    fn should_forward(&self, fingerprint: String) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock();
        if let Some(last) = seen.get(&fingerprint)
            && now.duration_since(*last) < self.window
        {
            return false;
        }
        seen.put(fingerprint, now);
        true
    }
}

impl<R: ErrorReporter> ErrorReporter for DedupReporter<R> {
    fn capture(&self, error: &CapturedError) {
        if self.should_forward(error.fingerprint()) {
            self.inner.capture(error);
        } else {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            debug!(message = %error.message, "Suppressed duplicate error report");
        }
    }
}

/// Handle stages use to report problems.
#[derive(Clone)]
pub struct ErrorCapture {
    reporter: Arc<dyn ErrorReporter>,
    tags: Vec<(String, String)>,
}

impl ErrorCapture {
    pub fn new(reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            reporter,
            tags: Vec::new(),
        }
    }

    pub fn noop() -> Self {
        Self::new(Arc::new(NoopReporter))
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    pub fn warn(&self, message: impl Into<String>, err: Option<&(dyn Error + 'static)>) {
        self.capture(Severity::Warning, message.into(), err);
    }

    pub fn error(&self, message: impl Into<String>, err: Option<&(dyn Error + 'static)>) {
        self.capture(Severity::Error, message.into(), err);
    }

    /// Reports an error that ends the calling component.
    pub fn fatal(&self, message: impl Into<String>, err: Option<&(dyn Error + 'static)>) {
        self.capture(Severity::Fatal, message.into(), err);
    }

    fn capture(&self, severity: Severity, message: String, err: Option<&(dyn Error + 'static)>) {
        let mut captured = CapturedError::new(severity, message);
        if let Some(err) = err {
            captured = captured.with_source(err);
        }
        captured.tags.clone_from(&self.tags);

        let cause = captured.chain_string();
        match severity {
            Severity::Warning => warn!(cause = %cause, "{}", captured.message),
            Severity::Error => error!(cause = %cause, "{}", captured.message),
            Severity::Fatal => error!(fatal = true, cause = %cause, "{}", captured.message),
        }

        self.reporter.capture(&captured);
    }
}

impl std::fmt::Debug for ErrorCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorCapture")
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[derive(Debug, thiserror::Error)]
    #[error("upload failed")]
    struct Outer(#[source] io::Error);

    fn nz(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn captures_full_source_chain() {
        let err = Outer(io::Error::other("connection reset"));
        let captured = CapturedError::new(Severity::Error, "send").with_source(&err);
        assert_eq!(captured.chain, vec!["upload failed", "connection reset"]);
        assert_eq!(captured.chain_string(), "upload failed: connection reset");
    }

    #[test]
    fn dedup_suppresses_repeats_within_window() {
        let sink = Arc::new(MemoryReporter::new());
        let dedup = DedupReporter::new(sink.clone(), nz(8), Duration::from_secs(3600));
        for _ in 0..5 {
            dedup.capture(&CapturedError::new(Severity::Error, "same"));
        }
        dedup.capture(&CapturedError::new(Severity::Error, "different"));
        dedup.capture(&CapturedError::new(Severity::Warning, "same"));

        assert_eq!(sink.captured().len(), 3);
        assert_eq!(dedup.suppressed(), 4);
    }

    #[test]
    fn zero_window_forwards_everything() {
        let sink = Arc::new(MemoryReporter::new());
        let dedup = DedupReporter::new(sink.clone(), nz(8), Duration::ZERO);
        for _ in 0..3 {
            dedup.capture(&CapturedError::new(Severity::Error, "same"));
        }
        assert_eq!(sink.captured().len(), 3);
    }

    #[test]
    fn evicted_fingerprints_are_reported_again() {
        let sink = Arc::new(MemoryReporter::new());
        let dedup = DedupReporter::new(sink.clone(), nz(1), Duration::from_secs(3600));
        dedup.capture(&CapturedError::new(Severity::Error, "a"));
        dedup.capture(&CapturedError::new(Severity::Error, "b"));
        dedup.capture(&CapturedError::new(Severity::Error, "a"));
        assert_eq!(sink.captured().len(), 3);
    }

    #[test]
    fn capture_handle_tags_and_forwards() {
        let sink = Arc::new(MemoryReporter::new());
        let capture = ErrorCapture::new(sink.clone()).with_tag("stage", "writer");
        let err = io::Error::other("disk full");
        capture.fatal("write failed", Some(&err));

        let captured = sink.captured();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].severity, Severity::Fatal);
        assert_eq!(captured[0].tags, vec![("stage".into(), "writer".into())]);
        assert_eq!(captured[0].chain, vec!["disk full"]);
        assert_eq!(sink.count(Severity::Fatal), 1);
    }
}
