//! Error types for hub operations.

use protocol::{ContextId, DeviceAddress, ErrorKind, FlowId, TransportError};
use thiserror::Error;

use crate::ports::PortError;

/// Errors returned to callers of registry, allocator, flow and hub operations.
///
/// Polling failures never surface here; they are recorded in the context and
/// announced as events.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HubError {
    /// A live context already exists for the address.
    #[error("a session for {0} already exists")]
    DuplicateAddress(DeviceAddress),

    /// A flow or a live context already targets the address.
    #[error("{0} is busy with another connection attempt or session")]
    Busy(DeviceAddress),

    /// The context id is stale.
    #[error("context not found: {0}")]
    NotFound(ContextId),

    /// The context has no transport session to poll.
    #[error("context {0} has no device session")]
    NoSession(ContextId),

    /// The context's polling loop was parked by a fatal device error.
    #[error("polling for context {0} is parked after a fatal device error")]
    Parked(ContextId),

    /// The flow id is unknown or already finished.
    #[error("flow not found: {0}")]
    FlowNotFound(FlowId),

    /// Port allocation failed.
    #[error(transparent)]
    Port(#[from] PortError),

    /// The device family needs a check code.
    #[error("{0} requires a check code")]
    MissingCheckCode(DeviceAddress),

    /// Negotiation with the device failed.
    #[error("connecting to {address} failed: {source}")]
    Connect {
        address: DeviceAddress,
        #[source]
        source: TransportError,
    },

    /// Negotiation did not finish within the connect timeout.
    #[error("connecting to {address} timed out after {timeout_ms} ms")]
    ConnectTimeout {
        address: DeviceAddress,
        timeout_ms: u64,
    },

    /// Every discovery pass failed.
    #[error("discovery failed: {0}")]
    DiscoveryFailed(String),

    /// The hub is not accepting requests.
    #[error("hub is not running")]
    NotRunning,
}

impl HubError {
    /// Classifies the error for events and callers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            HubError::DuplicateAddress(_) => ErrorKind::DuplicateAddress,
            HubError::Busy(_) => ErrorKind::Busy,
            HubError::NotFound(_) | HubError::NoSession(_) => ErrorKind::NotFound,
            HubError::Parked(_) => ErrorKind::FatalDeviceError,
            HubError::FlowNotFound(_) => ErrorKind::FlowNotFound,
            HubError::Port(PortError::PoolExhausted { .. }) => ErrorKind::PoolExhausted,
            HubError::MissingCheckCode(_) => ErrorKind::MissingCheckCode,
            HubError::Connect { source, .. } => source.connect_kind(),
            HubError::ConnectTimeout { .. } => ErrorKind::ConnectTimeout,
            HubError::DiscoveryFailed(_) => ErrorKind::DiscoveryFailed,
            HubError::NotRunning => ErrorKind::NotRunning,
        }
    }
}

/// Result type alias for hub operations.
pub type HubResult<T> = std::result::Result<T, HubError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> DeviceAddress {
        DeviceAddress::parse("10.0.0.5").unwrap()
    }

    #[test]
    fn test_kinds() {
        assert_eq!(HubError::Busy(addr()).kind(), ErrorKind::Busy);
        assert_eq!(
            HubError::Port(PortError::PoolExhausted {
                start: 8181,
                end: 8182
            })
            .kind(),
            ErrorKind::PoolExhausted
        );
        assert_eq!(
            HubError::Connect {
                address: addr(),
                source: TransportError::InvalidCheckCode,
            }
            .kind(),
            ErrorKind::InvalidCheckCode
        );
        assert_eq!(
            HubError::Connect {
                address: addr(),
                source: TransportError::Refused("rst".into()),
            }
            .kind(),
            ErrorKind::ConnectRefused
        );
    }

    #[test]
    fn test_display() {
        let err = HubError::ConnectTimeout {
            address: addr(),
            timeout_ms: 10_000,
        };
        assert_eq!(
            err.to_string(),
            "connecting to 10.0.0.5 timed out after 10000 ms"
        );
        assert_eq!(
            HubError::DuplicateAddress(addr()).to_string(),
            "a session for 10.0.0.5 already exists"
        );
    }
}
