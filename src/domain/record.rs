use serde::{Deserialize, Serialize};

/// Routing metadata carried alongside every record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Control {
    /// Responder that receives results for this record. Empty means fire and forget.
    pub connection_id: String,
    /// Forward to the network even when running offline.
    pub always_send: bool,
    /// The caller expects a result.
    pub req_resp: bool,
    /// One-shot mailbox slot assigned by `Mailbox::deliver`.
    pub mailbox_slot: String,
    /// Internal record that must never reach the transaction log.
    pub local: bool,
}

impl Control {
    pub fn expects_response(&self) -> bool {
        self.req_resp || !self.mailbox_slot.is_empty()
    }
}

/// One atomic, ordered unit of data flowing through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Sequence number assigned by the writer stage.
    #[serde(default)]
    pub num: i64,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub control: Control,
    pub payload: RecordPayload,
}

impl Record {
    pub fn new(payload: RecordPayload) -> Self {
        Self {
            num: 0,
            uuid: uuid::Uuid::new_v4().to_string(),
            control: Control::default(),
            payload,
        }
    }

    pub fn with_connection(mut self, connection_id: impl Into<String>) -> Self {
        self.control.connection_id = connection_id.into();
        self
    }

    pub fn with_req_resp(mut self) -> Self {
        self.control.req_resp = true;
        self
    }

    /// Terminal record that drives the final flush.
    pub fn exit(exit_code: i32) -> Self {
        let mut record = Self::new(RecordPayload::Exit { exit_code });
        record.control.always_send = true;
        record.control.req_resp = true;
        record
    }

    /// Internal flush step re-entering the pipeline through the loopback path.
    pub fn defer(state: DeferState) -> Self {
        let mut record = Self::new(RecordPayload::Request(Request::Defer(state)));
        record.control.always_send = true;
        record.control.local = true;
        record
    }

    pub fn is_exit(&self) -> bool {
        matches!(self.payload, RecordPayload::Exit { .. })
    }

    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordPayload {
    Run(RunRecord),
    History(HistoryRecord),
    Summary(SummaryRecord),
    Config(ConfigRecord),
    Stats(StatsRecord),
    Output(OutputRecord),
    Alert(AlertRecord),
    Exit { exit_code: i32 },
    Request(Request),
}

impl RecordPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            RecordPayload::Run(_) => "run",
            RecordPayload::History(_) => "history",
            RecordPayload::Summary(_) => "summary",
            RecordPayload::Config(_) => "config",
            RecordPayload::Stats(_) => "stats",
            RecordPayload::Output(_) => "output",
            RecordPayload::Alert(_) => "alert",
            RecordPayload::Exit { .. } => "exit",
            RecordPayload::Request(Request::Status) => "request.status",
            RecordPayload::Request(Request::Defer(_)) => "request.defer",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunRecord {
    pub run_id: String,
    pub project: String,
    pub display_name: String,
}

/// A key with a JSON-encoded value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub key: String,
    pub value_json: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryRecord {
    pub step: i64,
    pub items: Vec<HistoryItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryRecord {
    pub update: Vec<HistoryItem>,
    pub remove: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigItem {
    pub key: String,
    pub value_json: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigRecord {
    pub update: Vec<ConfigItem>,
    pub remove: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsRecord {
    /// RFC 3339 sample time.
    pub timestamp: String,
    pub items: Vec<HistoryItem>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    #[default]
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputRecord {
    pub stream: OutputStream,
    pub line: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertRecord {
    pub title: String,
    pub text: String,
    /// Validated against `AlertLevel` by the handler stage.
    pub level: String,
    pub wait_duration_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    /// Answered by the handler without touching the network.
    Status,
    /// One step of the exit flush.
    Defer(DeferState),
}

/// Steps of the exit flush, processed strictly in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferState {
    Begin,
    FlushConfig,
    FlushUploads,
    End,
}

impl DeferState {
    pub fn next(self) -> Option<DeferState> {
        match self {
            DeferState::Begin => Some(DeferState::FlushConfig),
            DeferState::FlushConfig => Some(DeferState::FlushUploads),
            DeferState::FlushUploads => Some(DeferState::End),
            DeferState::End => None,
        }
    }
}
