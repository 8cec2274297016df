use super::record::{Control, Record};
use serde::{Deserialize, Serialize};

/// Response correlated to a previously submitted record by
/// (connection id, uuid).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordResult {
    pub uuid: String,
    pub control: Control,
    pub payload: ResultPayload,
}

impl RecordResult {
    /// Builds a result addressed to whoever submitted `record`.
    pub fn reply_to(record: &Record, payload: ResultPayload) -> Self {
        Self {
            uuid: record.uuid.clone(),
            control: record.control.clone(),
            payload,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.control.connection_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultPayload {
    Exit(ExitResult),
    RunUpdate(RunUpdateResult),
    Response(Response),
    Error(ErrorInfo),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitResult {
    /// Every upload of the final flush was delivered.
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunUpdateResult {
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Status(StatusResponse),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub records_handled: u64,
    pub records_written: u64,
    pub uploads_failed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed request content.
    InvalidInput,
    /// Delivery to the remote service failed.
    Communication,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorInfo {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InvalidInput,
            message: message.into(),
        }
    }

    pub fn communication(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Communication,
            message: message.into(),
        }
    }
}
