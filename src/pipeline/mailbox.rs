use crate::domain::{Record, RecordResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxError {
    #[error("pipeline stopped before answering")]
    Abandoned,
    #[error("timed out waiting for a result")]
    TimedOut,
}

/// One-shot slots that let a caller block on the result of one record.
#[derive(Debug, Default)]
pub struct Mailbox {
    slots: Mutex<MailboxSlots>,
}

#[derive(Debug, Default)]
struct MailboxSlots {
    pending: HashMap<String, oneshot::Sender<RecordResult>>,
    closed: bool,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns a fresh slot to `record` and returns the handle to wait on.
    pub fn deliver(&self, record: &mut Record) -> MailboxHandle {
        let slot = uuid::Uuid::new_v4().to_string();
        record.control.mailbox_slot.clone_from(&slot);

        let (tx, rx) = oneshot::channel();
        let mut slots = self.slots.lock();
        if !slots.closed {
            slots.pending.insert(slot.clone(), tx);
        }
        MailboxHandle { slot, rx }
    }

    /// Hands `result` to the waiter of its slot. Returns false if the result
    /// has no slot or nobody is waiting on it.
    pub fn respond(&self, result: &RecordResult) -> bool {
        let slot = &result.control.mailbox_slot;
        if slot.is_empty() {
            return false;
        }
        let Some(tx) = self.slots.lock().pending.remove(slot) else {
            return false;
        };
        if tx.send(result.clone()).is_err() {
            debug!(slot = %slot, "Mailbox waiter went away");
        }
        true
    }

    /// Wakes every waiter with `MailboxError::Abandoned` and refuses new slots.
    pub fn close(&self) {
        let mut slots = self.slots.lock();
        slots.closed = true;
        slots.pending.clear();
    }
}

#[derive(Debug)]
pub struct MailboxHandle {
    slot: String,
    rx: oneshot::Receiver<RecordResult>,
}

impl MailboxHandle {
    pub fn slot(&self) -> &str {
        &self.slot
    }

    pub async fn wait(self) -> Result<RecordResult, MailboxError> {
        self.rx.await.map_err(|_| MailboxError::Abandoned)
    }

    pub async fn wait_timeout(self, timeout: Duration) -> Result<RecordResult, MailboxError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(MailboxError::Abandoned),
            Err(_) => Err(MailboxError::TimedOut),
        }
    }
}

/// Closes the mailbox when dropped, including during a panic unwind.
pub(crate) struct MailboxCloser(pub(crate) Arc<Mailbox>);

impl Drop for MailboxCloser {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Where a stage sends its answers: the mailbox first, otherwise the stage's
/// result channel towards the dispatcher.
#[derive(Clone)]
pub struct ResultSink {
    mailbox: Arc<Mailbox>,
    out: mpsc::Sender<RecordResult>,
}

impl ResultSink {
    pub fn new(mailbox: Arc<Mailbox>, out: mpsc::Sender<RecordResult>) -> Self {
        Self { mailbox, out }
    }

    pub async fn respond(&self, result: RecordResult) {
        if self.mailbox.respond(&result) {
            return;
        }
        if let Err(err) = self.out.send(result).await {
            debug!(uuid = %err.0.uuid, "Dispatcher is gone, dropping result");
        }
    }

    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExitResult, ResultPayload};

    fn exit_result(record: &Record) -> RecordResult {
        RecordResult::reply_to(
            record,
            ResultPayload::Exit(ExitResult {
                success: true,
                error: None,
            }),
        )
    }

    #[tokio::test]
    async fn delivers_result_to_waiting_slot() {
        let mailbox = Mailbox::new();
        let mut record = Record::exit(0);
        let handle = mailbox.deliver(&mut record);
        assert_eq!(record.control.mailbox_slot, handle.slot());

        assert!(mailbox.respond(&exit_result(&record)));
        let result = handle.wait().await.unwrap();
        assert_eq!(result.uuid, record.uuid);
    }

    #[tokio::test]
    async fn results_without_slot_are_not_claimed() {
        let mailbox = Mailbox::new();
        let record = Record::exit(0);
        assert!(!mailbox.respond(&exit_result(&record)));
    }

    #[tokio::test]
    async fn slot_answers_only_once() {
        let mailbox = Mailbox::new();
        let mut record = Record::exit(0);
        let _handle = mailbox.deliver(&mut record);
        assert!(mailbox.respond(&exit_result(&record)));
        assert!(!mailbox.respond(&exit_result(&record)));
    }

    #[tokio::test]
    async fn close_abandons_waiters() {
        let mailbox = Mailbox::new();
        let mut record = Record::exit(0);
        let handle = mailbox.deliver(&mut record);
        mailbox.close();
        assert_eq!(handle.wait().await, Err(MailboxError::Abandoned));

        let mut late = Record::exit(0);
        let late_handle = mailbox.deliver(&mut late);
        assert_eq!(late_handle.wait().await, Err(MailboxError::Abandoned));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_timeout_expires() {
        let mailbox = Mailbox::new();
        let mut record = Record::exit(0);
        let handle = mailbox.deliver(&mut record);
        assert_eq!(
            handle.wait_timeout(Duration::from_secs(1)).await,
            Err(MailboxError::TimedOut)
        );
    }

    #[tokio::test]
    async fn sink_falls_back_to_channel() {
        let mailbox = Arc::new(Mailbox::new());
        let (tx, mut rx) = mpsc::channel(1);
        let sink = ResultSink::new(mailbox.clone(), tx);

        let mut slotted = Record::exit(0);
        let handle = mailbox.deliver(&mut slotted);
        sink.respond(exit_result(&slotted)).await;
        assert!(handle.wait().await.is_ok());

        let plain = Record::exit(0).with_connection("conn-1");
        sink.respond(exit_result(&plain)).await;
        assert_eq!(rx.recv().await.unwrap().connection_id(), "conn-1");
    }
}
