use crate::domain::Record;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bounded ingress queue that separates "no more work" from "close the queue".
///
/// `set_done` stops new work; `close` then waits for every `add_work` already
/// past the gate to finish before dropping the sender, so no caller ever
/// sends on a closed channel.
#[derive(Clone)]
pub struct ApiWorkManager {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<WorkState>,
    drained: Notify,
    done: CancellationToken,
}

struct WorkState {
    in_flight: usize,
    sender: Option<mpsc::Sender<Record>>,
}

impl ApiWorkManager {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Record>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let manager = Self {
            inner: Arc::new(Inner {
                state: Mutex::new(WorkState {
                    in_flight: 0,
                    sender: Some(tx),
                }),
                drained: Notify::new(),
                done: CancellationToken::new(),
            }),
        };
        (manager, rx)
    }

    /// Enqueues `record`, waiting while the queue is full.
    ///
    /// Returns false if the record was dropped because `set_done` was called
    /// first or the consumer is gone.
    pub async fn add_work(&self, record: Record) -> bool {
        let sender = {
            let mut state = self.inner.state.lock();
            if self.inner.done.is_cancelled() {
                drop(state);
                warn!(kind = record.kind(), uuid = %record.uuid, "Dropping record submitted after close");
                return false;
            }
            let Some(sender) = state.sender.clone() else {
                drop(state);
                warn!(kind = record.kind(), "Dropping record, work queue already closed");
                return false;
            };
            state.in_flight += 1;
            sender
        };

        let accepted = tokio::select! {
            biased;
            sent = sender.send(record) => match sent {
                Ok(()) => true,
                Err(err) => {
                    debug!(kind = err.0.kind(), "Work queue consumer is gone");
                    false
                }
            },
            () = self.inner.done.cancelled() => {
                debug!("Gave up enqueueing, work manager is done");
                false
            }
        };
        drop(sender);

        let mut state = self.inner.state.lock();
        state.in_flight -= 1;
        if state.in_flight == 0 {
            self.inner.drained.notify_waiters();
        }
        accepted
    }

    /// Stops accepting work and releases producers blocked on a full queue.
    pub fn set_done(&self) {
        let _state = self.inner.state.lock();
        self.inner.done.cancel();
    }

    pub fn is_done(&self) -> bool {
        self.inner.done.is_cancelled()
    }

    /// Cancelled once `set_done` is called.
    pub fn done_token(&self) -> CancellationToken {
        self.inner.done.clone()
    }

    /// Waits for `set_done`, then for in-flight `add_work` calls, then closes
    /// the queue. Safe to call more than once.
    pub async fn close(&self) {
        self.inner.done.cancelled().await;

        loop {
            let drained = self.inner.drained.notified();
            {
                let mut state = self.inner.state.lock();
                if state.in_flight == 0 {
                    state.sender.take();
                    return;
                }
            }
            drained.await;
        }
    }
}
