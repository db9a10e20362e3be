// MIT License - Copyright (c) 2026 Peter Wright
// INIM Prime log bridge

//! Wire format of the panel's `/cgi-bin/api.cgi` endpoint.

use chrono::NaiveDateTime;
use serde::Deserialize;

use crate::error::{ApiStatus, InimError, Result};
use crate::log_event::LogEvent;

pub const API_PATH: &str = "/cgi-bin/api.cgi";

/// Format of the `dt` field in log rows.
pub const LOG_TIMESTAMP_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

pub const STATUS_SUCCESS: i64 = 0;

/// Commands used by the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Version,
    Ping,
    /// `get_log_elements`, `p1` = number of most recent rows
    GetLogElements { limit: u32 },
}

impl Command {
    /// Value of the `cmd` query parameter.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Version => "version",
            Command::Ping => "ping",
            Command::GetLogElements { .. } => "get_log_elements",
        }
    }

    /// Extra query parameters beyond `apikey` and `cmd`.
    pub fn params(&self) -> Vec<(&'static str, String)> {
        match self {
            Command::GetLogElements { limit } => vec![("p1", limit.to_string())],
            _ => Vec::new(),
        }
    }
}

/// Response envelope shared by every command.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(rename = "Status")]
    pub status: Option<i64>,
    #[serde(rename = "Data", default)]
    pub data: serde_json::Value,
}

impl Envelope {
    /// Unwrap the `Data` payload, mapping a non-zero status to an error.
    pub fn into_data(self) -> Result<serde_json::Value> {
        match self.status {
            Some(STATUS_SUCCESS) => Ok(self.data),
            Some(code) => Err(ApiStatus::from_code(code)
                .map(InimError::Api)
                .unwrap_or(InimError::UnknownStatus(code))),
            None => Err(InimError::InvalidResponse {
                details: "missing Status field".to_string(),
            }),
        }
    }
}

/// The panel reports ids as numbers on some firmwares and strings on others.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawId {
    Number(u64),
    Text(String),
}

/// One row of `get_log_elements`, as sent by the panel.
#[derive(Debug, Deserialize)]
pub struct RawLogEvent {
    id: RawId,
    dt: String,
    ty: String,
    #[serde(default)]
    lo: Option<String>,
    #[serde(default)]
    ag: Option<String>,
    #[serde(default)]
    v: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LogData {
    #[serde(default)]
    log: Vec<RawLogEvent>,
}

impl RawLogEvent {
    pub fn into_log_event(self) -> Result<LogEvent> {
        let id = match self.id {
            RawId::Number(n) => n,
            RawId::Text(s) => s.trim().parse().map_err(|_| InimError::InvalidResponse {
                details: format!("invalid log event id: {s:?}"),
            })?,
        };
        let timestamp = NaiveDateTime::parse_from_str(self.dt.trim(), LOG_TIMESTAMP_FORMAT)
            .map_err(|e| InimError::InvalidResponse {
                details: format!("invalid log event timestamp {:?}: {e}", self.dt),
            })?;
        // The panel labels are swapped: `lo` carries the agent, `ag` the location.
        Ok(LogEvent::new(id, timestamp, self.ty, self.lo, self.ag, self.v))
    }
}

/// Parse the `Data` payload of `get_log_elements`.
///
/// The panel lists rows newest-first; the result is oldest-first.
pub fn parse_log_events(data: serde_json::Value) -> Result<Vec<LogEvent>> {
    if data.is_null() {
        return Ok(Vec::new());
    }
    let data: LogData = serde_json::from_value(data).map_err(|e| InimError::InvalidResponse {
        details: format!("malformed log payload: {e}"),
    })?;
    let mut events = data
        .log
        .into_iter()
        .map(RawLogEvent::into_log_event)
        .collect::<Result<Vec<_>>>()?;
    events.reverse();
    Ok(events)
}
