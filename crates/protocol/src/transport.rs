//! The device transport interface.
//!
//! The hub never speaks a printer's wire protocol itself. It talks to a
//! [`DeviceTransport`] that opens sessions, polls status, closes sessions and
//! scans the network. Implementations live outside this workspace; tests use
//! scripted mocks.

use std::fmt;
use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::device::{Capabilities, CheckCode, DeviceAddress, DeviceType, DiscoveredDevice};
use crate::error::TransportError;
use crate::status::StatusSnapshot;

/// Opaque token identifying an open device session inside a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(u64);

impl SessionHandle {
    /// Wraps a transport-specific session number.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the transport-specific session number.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// A freshly negotiated device session.
#[derive(Debug, Clone)]
pub struct DeviceSession {
    /// Handle used for subsequent polls and the final disconnect.
    pub handle: SessionHandle,
    /// Capabilities reported during negotiation.
    pub capabilities: Capabilities,
    /// Printer name reported during negotiation.
    pub name: Option<String>,
}

/// Connection primitives offered by the device-protocol layer.
///
/// Futures are boxed so the trait stays object-safe and the hub can hold an
/// `Arc<dyn DeviceTransport>`.
pub trait DeviceTransport: Send + Sync {
    /// Opens a session, validating the check code when the family needs one.
    fn connect<'a>(
        &'a self,
        address: &'a DeviceAddress,
        device_type: DeviceType,
        check_code: Option<&'a CheckCode>,
    ) -> BoxFuture<'a, Result<DeviceSession, TransportError>>;

    /// Reads one status snapshot.
    fn poll(&self, handle: SessionHandle) -> BoxFuture<'_, Result<StatusSnapshot, TransportError>>;

    /// Closes a session. Closing an unknown handle is not an error.
    fn disconnect(&self, handle: SessionHandle) -> BoxFuture<'_, ()>;

    /// Runs one discovery pass lasting at most `window`.
    fn discover(
        &self,
        window: Duration,
    ) -> BoxFuture<'_, Result<Vec<DiscoveredDevice>, TransportError>>;
}
