use thiserror::Error;

use crate::protocol::ProtocolKind;

/// Failures a protocol client or the codec can report for one source.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ZapError {
    #[error("Cannot reach {target}: {reason}")]
    Connection { target: String, reason: String },

    #[error("Request to {target} exceeded {timeout_ms}ms")]
    Timeout { target: String, timeout_ms: u64 },

    #[error("Unexpected response from {target}: {reason}")]
    Protocol { target: String, reason: String },

    #[error("Cannot decode `{token}`: {reason}")]
    Decode { token: String, reason: String },
}

impl ZapError {
    pub fn connection(target: impl Into<String>, reason: impl ToString) -> Self {
        Self::Connection {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    pub fn protocol(target: impl Into<String>, reason: impl ToString) -> Self {
        Self::Protocol {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    pub fn decode(token: impl Into<String>, reason: impl ToString) -> Self {
        Self::Decode {
            token: token.into(),
            reason: reason.to_string(),
        }
    }

    /// Maps a reqwest failure onto the taxonomy the scheduler understands.
    pub fn from_http(target: &str, timeout_ms: u64, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                target: target.to_string(),
                timeout_ms,
            }
        } else if err.is_status() || err.is_decode() {
            Self::protocol(target, err)
        } else {
            Self::connection(target, err)
        }
    }
}

/// Rejected gateway configuration. Surfaces at gateway-add time only.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Host must not be empty")]
    EmptyHost,

    #[error("Scan interval {0}s is outside 1..=3600")]
    ScanIntervalOutOfRange(u64),

    #[error("At least one endpoint must be enabled")]
    NoEndpoints,

    #[error("Failure threshold must be at least 1")]
    ZeroFailureThreshold,

    #[error("Request timeout must be greater than zero")]
    ZeroRequestTimeout,

    #[error("Endpoint `{0}` is enabled but not configured")]
    MissingEndpointConfig(ProtocolKind),

    #[error("Gateway did not answer on the `{0}` endpoint")]
    Unreachable(ProtocolKind),

    #[error("Gateway `{0}` is already configured")]
    DuplicateGateway(String),

    #[error("Invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ZapError>;
