use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bridge::BridgeKind;

/// Convenience alias for fallible copilot results.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error returned by the agent backend, either as a non-2xx response or as a
/// JSON error body sent where an event stream was expected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendError {
    pub status: u16,
    /// Application-level code from the response envelope (`{"code": 401, ...}`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Raw response body for debugging (when available).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_body: Option<String>,
}

impl BackendError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            code: None,
            message: message.into(),
            request_id: None,
            raw_body: None,
        }
    }
}

// The message is shown to the user verbatim, so Display carries nothing else.
impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for BackendError {}

/// Transport-level error (timeouts, DNS/TLS/connectivity, broken body stream).
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
    #[source]
    pub source: Option<reqwest::Error>,
}

impl TransportError {
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Timeout,
            message: message.into(),
            source: None,
        }
    }

    pub fn connect(message: impl Into<String>, source: reqwest::Error) -> Self {
        Self {
            kind: TransportErrorKind::Connect,
            message: message.into(),
            source: Some(source),
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() {
            TransportErrorKind::Connect
        } else if err.is_request() || err.is_body() {
            TransportErrorKind::Request
        } else {
            TransportErrorKind::Other
        };
        Self {
            kind,
            message: err.to_string(),
            source: Some(err),
        }
    }
}

/// Broad transport error kinds for classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Request,
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Connect => "connect",
            TransportErrorKind::Request => "request",
            TransportErrorKind::Other => "transport",
        };
        write!(f, "{label}")
    }
}

/// Failure of one cross-context exchange.
///
/// Cloneable because concurrent callers of the same request kind share a
/// single in-flight result.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("{kind} timed out after {}ms", .after.as_millis())]
    Timeout { kind: BridgeKind, after: Duration },

    #[error("{kind} rejected by page: {message}")]
    RemoteRejected { kind: BridgeKind, message: String },

    #[error("{kind}: no host introspection strategy applies ({message})")]
    Unavailable { kind: BridgeKind, message: String },

    #[error("page script could not be loaded: {0}")]
    Injection(String),

    #[error("bridge channel closed")]
    ChannelClosed,

    #[error("bridge task ended before settling: {0}")]
    TaskAborted(String),
}

/// Failure raised by the host page while a strategy was running.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct HostError {
    pub message: String,
}

impl HostError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<&str> for HostError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for HostError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// Unified error type surfaced by the copilot.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Transport(#[from] TransportError),

    #[error("{0}")]
    Backend(#[from] BackendError),

    #[error("{0}")]
    Bridge(#[from] BridgeError),

    #[error("{kind} did not answer within {}ms", .after.as_millis())]
    ExportTimeout { kind: BridgeKind, after: Duration },

    #[error("host canvas could not be reached: {0}")]
    HostIntrospectionUnavailable(String),

    #[error("the agent finished without producing a workflow graph")]
    MissingGraph,
}

impl Error {
    /// True for timeouts at either the bridge or the HTTP layer.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::ExportTimeout { .. } => true,
            Error::Bridge(BridgeError::Timeout { .. }) => true,
            Error::Transport(err) => err.kind == TransportErrorKind::Timeout,
            _ => false,
        }
    }
}
