// MIT License - Copyright (c) 2026 Peter Wright
// INIM Prime log bridge

use std::fmt;

/// Non-zero `Status` codes returned in the API response envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiStatus {
    /// 1 - Parameter error
    Param,
    /// 2 - Invalid API key
    ApiKey,
    /// 3 - Command error
    Command,
    /// 4 - Panel execution error
    Execution,
    /// 5 - Protocol error
    Protocol,
    /// 6 - Authorization error
    Authorization,
}

impl ApiStatus {
    /// Map an envelope status code to its variant. `0` (success) and unknown
    /// codes return `None`.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Param),
            2 => Some(Self::ApiKey),
            3 => Some(Self::Command),
            4 => Some(Self::Execution),
            5 => Some(Self::Protocol),
            6 => Some(Self::Authorization),
            _ => None,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            Self::Param => 1,
            Self::ApiKey => 2,
            Self::Command => 3,
            Self::Execution => 4,
            Self::Protocol => 5,
            Self::Authorization => 6,
        }
    }

    /// Human-readable description of the status.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Param => "Parameter error",
            Self::ApiKey => "Invalid API key",
            Self::Command => "Command error",
            Self::Execution => "Panel execution error",
            Self::Protocol => "Protocol error",
            Self::Authorization => "Authorization error",
        }
    }
}

impl fmt::Display for ApiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.description())
    }
}

/// Coarse classification of a failure, as reported to whoever drives the
/// poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Network unreachable, connect error, timeout
    Transport,
    /// Bad API key or insufficient rights
    Authentication,
    /// Malformed response or command rejected by the panel
    Protocol,
    /// Checkpoint could not be read or written
    Storage,
    /// Invalid configuration or argument
    Config,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Authentication => "authentication",
            Self::Protocol => "protocol",
            Self::Storage => "storage",
            Self::Config => "config",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All errors that can occur in the INIM Prime bridge library.
#[derive(Debug, thiserror::Error)]
pub enum InimError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Request timeout: {command}")]
    Timeout { command: String },

    #[error("Unexpected HTTP status {status} for {command}")]
    HttpStatus { command: String, status: u16 },

    #[error("API error: {0}")]
    Api(ApiStatus),

    #[error("Unknown API status: {0}")]
    UnknownStatus(i64),

    #[error("Invalid response: {details}")]
    InvalidResponse { details: String },

    #[error("Log fetch limit {limit} out of range (1..={max})")]
    InvalidLimit { limit: u32, max: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported checkpoint version {found} (max: {supported})")]
    UnsupportedCheckpointVersion { found: u32, supported: u32 },

    #[error("Invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("Client not connected")]
    NotConnected,
}

impl InimError {
    /// Whether the request that produced this error may be retried as-is.
    ///
    /// Only transport failures qualify; a status returned by the panel is an
    /// answer, not a glitch.
    pub fn is_retryable(&self) -> bool {
        match self {
            InimError::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            InimError::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Map the error onto the failure taxonomy surfaced to the poll loop.
    pub fn kind(&self) -> FailureKind {
        match self {
            InimError::Http(e) if e.is_decode() => FailureKind::Protocol,
            InimError::Http(_) | InimError::Timeout { .. } | InimError::NotConnected => {
                FailureKind::Transport
            }
            InimError::Api(ApiStatus::ApiKey | ApiStatus::Authorization) => {
                FailureKind::Authentication
            }
            InimError::HttpStatus { status: 401 | 403, .. } => FailureKind::Authentication,
            InimError::Api(_)
            | InimError::UnknownStatus(_)
            | InimError::HttpStatus { .. }
            | InimError::InvalidResponse { .. } => FailureKind::Protocol,
            InimError::Io(_) | InimError::Json(_) | InimError::UnsupportedCheckpointVersion { .. } => {
                FailureKind::Storage
            }
            InimError::InvalidLimit { .. } | InimError::InvalidConfig { .. } => FailureKind::Config,
        }
    }
}

pub type Result<T> = std::result::Result<T, InimError>;
