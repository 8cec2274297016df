use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Severity of a user alert.
///
/// Alerts arrive as free-form strings; anything outside this set is rejected
/// back to the caller instead of being forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertLevel {
    Info,
    Warn,
    Error,
}

impl AlertLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertLevel::Info => "INFO",
            AlertLevel::Warn => "WARN",
            AlertLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INFO" => Ok(AlertLevel::Info),
            "WARN" => Ok(AlertLevel::Warn),
            "ERROR" => Ok(AlertLevel::Error),
            other => Err(format!("invalid alert level {other:?}, expected INFO, WARN or ERROR")),
        }
    }
}
