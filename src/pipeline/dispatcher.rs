use crate::domain::RecordResult;
use crate::observability::ErrorCapture;
use clap::ValueEnum;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const MISSING_RESPONDER: &str = "no responder registered for result";

/// Receives the results for one connection.
pub trait Responder: Send + Sync {
    fn respond(&self, result: RecordResult);
}

impl<F> Responder for F
where
    F: Fn(RecordResult) + Send + Sync,
{
    fn respond(&self, result: RecordResult) {
        self(result);
    }
}

/// Forwards results into an unbounded channel owned by the connection.
#[derive(Debug, Clone)]
pub struct ChannelResponder {
    tx: mpsc::UnboundedSender<RecordResult>,
}

impl ChannelResponder {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RecordResult>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Responder for ChannelResponder {
    fn respond(&self, result: RecordResult) {
        if self.tx.send(result).is_err() {
            debug!("Responder channel closed, dropping result");
        }
    }
}

pub struct ResponderEntry {
    pub id: String,
    pub responder: Arc<dyn Responder>,
}

impl ResponderEntry {
    pub fn new(id: impl Into<String>, responder: Arc<dyn Responder>) -> Self {
        Self {
            id: id.into(),
            responder,
        }
    }
}

/// What to do with a result addressed to a connection nobody registered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingResponderPolicy {
    /// Report the error and drop the result.
    #[default]
    Drop,
    /// Report a fatal error and panic the dispatching task.
    Abort,
}

/// Routes each result to the responder registered for its connection id.
pub struct Dispatcher {
    responders: RwLock<HashMap<String, Arc<dyn Responder>>>,
    policy: MissingResponderPolicy,
    errors: ErrorCapture,
}

impl Dispatcher {
    pub fn new(policy: MissingResponderPolicy, errors: ErrorCapture) -> Self {
        Self {
            responders: RwLock::new(HashMap::new()),
            policy,
            errors,
        }
    }

    /// Registers responders. The first registration of an id wins.
    pub fn add_responders(&self, entries: impl IntoIterator<Item = ResponderEntry>) {
        let mut responders = self.responders.write();
        for entry in entries {
            match responders.entry(entry.id) {
                Entry::Occupied(existing) => {
                    warn!(connection_id = %existing.key(), "Responder already registered, ignoring");
                }
                Entry::Vacant(slot) => {
                    slot.insert(entry.responder);
                }
            }
        }
    }

    pub fn responder_count(&self) -> usize {
        self.responders.read().len()
    }

    /// Delivers `result` to its responder. Results without a connection id
    /// are fire and forget.
    pub fn handle_respond(&self, result: RecordResult) {
        let connection_id = result.connection_id();
        if connection_id.is_empty() {
            return;
        }

        let responder = self.responders.read().get(connection_id).cloned();
        match responder {
            Some(responder) => responder.respond(result),
            None => self.handle_missing(&result),
        }
    }

    fn handle_missing(&self, result: &RecordResult) {
        let connection_id = result.connection_id();
        debug!(connection_id, uuid = %result.uuid, "Result has no registered responder");
        let errors = self
            .errors
            .clone()
            .with_tag("connection_id", connection_id)
            .with_tag("uuid", result.uuid.as_str());
        match self.policy {
            MissingResponderPolicy::Drop => errors.error(MISSING_RESPONDER, None),
            MissingResponderPolicy::Abort => {
                errors.fatal(MISSING_RESPONDER, None);
                panic!("{MISSING_RESPONDER}: connection {connection_id:?}, result {}", result.uuid);
            }
        }
    }

    /// Drains a stage's result channel until every sender is gone.
    pub async fn run(self: Arc<Self>, mut results: mpsc::Receiver<RecordResult>) {
        while let Some(result) = results.recv().await {
            self.handle_respond(result);
        }
        debug!("Result channel closed");
    }
}
