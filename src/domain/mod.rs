//! Domain layer for run-forwarder.
//!
//! Contains the canonical types shared across all modules:
//! - `Record`: one ordered event flowing through the pipeline
//! - `RecordResult`: a response correlated to a previously submitted record
//! - `AlertLevel`: validated severity of user alerts

pub mod alert_level;
pub mod record;
pub mod result;

pub use alert_level::AlertLevel;
pub use record::{
    AlertRecord, ConfigItem, ConfigRecord, Control, DeferState, HistoryItem, HistoryRecord,
    OutputRecord, OutputStream, Record, RecordPayload, Request, RunRecord, StatsRecord,
    SummaryRecord,
};
pub use result::{
    ErrorCode, ErrorInfo, ExitResult, RecordResult, Response, ResultPayload, RunUpdateResult,
    StatusResponse,
};
