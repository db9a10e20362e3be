// MIT License - Copyright (c) 2026 Peter Wright
// INIM Prime log bridge

use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// One entry of the panel's audit log.
///
/// The panel-assigned `id` is carried along for display and persistence but
/// is not stable across fetches, so two events are compared with
/// [`LogEvent::key`] instead of `==` when deciding whether they are the same
/// occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub id: u64,
    /// Panel-local time, second precision
    pub timestamp: NaiveDateTime,
    /// Event category as reported by the panel
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

/// Content key of a [`LogEvent`]: every field except `id`.
pub type LogEventKey<'a> = (
    &'a NaiveDateTime,
    &'a str,
    Option<&'a str>,
    Option<&'a str>,
    Option<&'a str>,
);

impl LogEvent {
    /// Build an event, trimming the padded text fields the panel returns.
    /// Optional fields that are blank after trimming become `None`.
    pub fn new(
        id: u64,
        timestamp: NaiveDateTime,
        kind: impl Into<String>,
        agent: Option<String>,
        location: Option<String>,
        value: Option<String>,
    ) -> Self {
        Self {
            id,
            timestamp,
            kind: kind.into().trim().to_string(),
            agent: clean(agent),
            location: clean(location),
            value: clean(value),
        }
    }

    pub fn key(&self) -> LogEventKey<'_> {
        (
            &self.timestamp,
            self.kind.as_str(),
            self.agent.as_deref(),
            self.location.as_deref(),
            self.value.as_deref(),
        )
    }

    /// Whether `self` and `other` describe the same occurrence.
    pub fn same_occurrence(&self, other: &LogEvent) -> bool {
        self.key() == other.key()
    }
}

fn clean(field: Option<String>) -> Option<String> {
    field
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [#{}] type = {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.id,
            self.kind
        )?;
        if let Some(agent) = &self.agent {
            write!(f, " by {agent}")?;
        }
        if let Some(location) = &self.location {
            write!(f, " at {location}")?;
        }
        if let Some(value) = &self.value {
            write!(f, " ({value})")?;
        }
        Ok(())
    }
}
