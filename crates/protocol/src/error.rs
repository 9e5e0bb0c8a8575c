//! Error types for the protocol crate.
//!
//! [`ErrorKind`] is the serializable failure taxonomy shared by every
//! component of the hub; it travels inside events so that UI consumers can
//! render a specific reason without depending on the hub's error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol error type for parsing and serialization failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A device address could not be parsed.
    #[error("invalid device address: {0:?}")]
    InvalidAddress(String),

    /// A device type name is not one of the supported families.
    #[error("unknown device type: {0:?}")]
    UnknownDeviceType(String),

    /// A check code was empty or malformed.
    #[error("malformed check code")]
    MalformedCheckCode,

    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

/// Failure classification shared by the registry, flows and polling loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// A live context already exists for the address.
    DuplicateAddress,
    /// A flow or context already targets the address.
    Busy,
    /// The context id is stale or was never issued.
    NotFound,
    /// Every port in the configured range is leased.
    PoolExhausted,
    /// The device did not answer within the connect timeout.
    ConnectTimeout,
    /// The device actively refused the connection.
    ConnectRefused,
    /// The device rejected the supplied check code.
    InvalidCheckCode,
    /// The device family needs a check code and none was supplied.
    MissingCheckCode,
    /// A status poll failed in a way that may succeed later.
    TransientPollFailure,
    /// The device reported an unrecoverable error for this session.
    FatalDeviceError,
    /// Every discovery pass failed.
    DiscoveryFailed,
    /// The hub is not running.
    NotRunning,
    /// The flow id is unknown.
    FlowNotFound,
}

impl ErrorKind {
    /// Returns true for failures a caller may reasonably retry unchanged.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Busy
                | ErrorKind::ConnectTimeout
                | ErrorKind::TransientPollFailure
                | ErrorKind::DiscoveryFailed
        )
    }
}

/// Errors reported by a [`DeviceTransport`](crate::transport::DeviceTransport).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The operation did not complete in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The device refused or dropped the connection.
    #[error("connection refused: {0}")]
    Refused(String),

    /// The check code was rejected.
    #[error("check code rejected")]
    InvalidCheckCode,

    /// A recoverable failure, e.g. a malformed or partial status reply.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The device session is unusable until reconnected.
    #[error("fatal device error: {0}")]
    Fatal(String),
}

impl TransportError {
    /// Maps a failure during connection negotiation to its error kind.
    pub fn connect_kind(&self) -> ErrorKind {
        match self {
            TransportError::Timeout(_) => ErrorKind::ConnectTimeout,
            TransportError::InvalidCheckCode => ErrorKind::InvalidCheckCode,
            TransportError::Fatal(_) => ErrorKind::FatalDeviceError,
            TransportError::Refused(_) | TransportError::Transient(_) => ErrorKind::ConnectRefused,
        }
    }

    /// Maps a failure during a status poll to its error kind.
    pub fn poll_kind(&self) -> ErrorKind {
        match self {
            TransportError::Fatal(_) => ErrorKind::FatalDeviceError,
            _ => ErrorKind::TransientPollFailure,
        }
    }
}
