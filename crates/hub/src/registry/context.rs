//! The printer context record.

use std::time::{Duration, SystemTime};

use protocol::{
    Capabilities, ConnectionState, ContextId, DeviceAddress, DeviceType, SessionHandle,
    StatusSnapshot,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Everything needed to register a new context.
#[derive(Debug, Clone)]
pub struct ContextSpec {
    /// Device address; must not have a live context.
    pub address: DeviceAddress,
    /// Device family.
    pub device_type: DeviceType,
    /// Capabilities known at registration time.
    pub capabilities: Capabilities,
    /// Printer name reported by the device.
    pub name: Option<String>,
    /// Transport session used for polling.
    pub session: Option<SessionHandle>,
}

impl ContextSpec {
    /// Registration data without a name or transport session.
    pub fn new(address: DeviceAddress, device_type: DeviceType, capabilities: Capabilities) -> Self {
        Self {
            address,
            device_type,
            capabilities,
            name: None,
            session: None,
        }
    }
}

/// Snapshot of one managed printer session.
///
/// The registry owns the authoritative copy; every accessor hands out a
/// clone taken under the registry lock.
#[derive(Debug, Clone, Serialize)]
pub struct PrinterContext {
    /// Unique context id.
    pub id: ContextId,
    /// Device address, unique across live contexts.
    pub address: DeviceAddress,
    /// Device family.
    pub device_type: DeviceType,
    /// Printer name reported by the device.
    pub name: Option<String>,
    /// Connection state.
    pub state: ConnectionState,
    /// Leased camera proxy port.
    pub port: Option<u16>,
    /// Capabilities reported by the device.
    pub capabilities: Capabilities,
    /// Most recent status snapshot.
    pub last_status: Option<StatusSnapshot>,
    /// Sequence number of `last_status`; 0 before the first poll.
    pub status_sequence: u64,
    /// Current poll cadence.
    #[serde(rename = "cadence_ms", serialize_with = "serialize_duration_ms")]
    pub cadence: Duration,
    /// Consecutive failed polls.
    pub consecutive_failures: u32,
    /// When the context was registered.
    pub created_at: SystemTime,
    /// When the context first reached `Connected`.
    pub connected_at: Option<SystemTime>,

    #[serde(skip)]
    pub(crate) session: Option<SessionHandle>,
    #[serde(skip)]
    pub(crate) cancel: CancellationToken,
}

impl PrinterContext {
    pub(crate) fn new(
        id: ContextId,
        spec: ContextSpec,
        port: u16,
        cadence: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            address: spec.address,
            device_type: spec.device_type,
            name: spec.name,
            state: ConnectionState::Connecting,
            port: Some(port),
            capabilities: spec.capabilities,
            last_status: None,
            status_sequence: 0,
            cadence,
            consecutive_failures: 0,
            created_at: SystemTime::now(),
            connected_at: None,
            session: spec.session,
            cancel,
        }
    }

    /// Transport session backing this context.
    pub fn session(&self) -> Option<SessionHandle> {
        self.session
    }

    /// Display label: the printer name, falling back to the address.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(self.address.as_str())
    }
}

fn serialize_duration_ms<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    serializer.serialize_u64(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> PrinterContext {
        let spec = ContextSpec::new(
            DeviceAddress::parse("10.0.0.5").unwrap(),
            DeviceType::New,
            Capabilities::none(),
        );
        PrinterContext::new(
            ContextId::new(),
            spec,
            8181,
            Duration::from_millis(1500),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_new_context_is_connecting() {
        let ctx = context();
        assert_eq!(ctx.state, ConnectionState::Connecting);
        assert_eq!(ctx.port, Some(8181));
        assert_eq!(ctx.status_sequence, 0);
        assert_eq!(ctx.label(), "10.0.0.5");
    }

    #[test]
    fn test_serialization_hides_internal_handles() {
        let json = serde_json::to_value(context()).unwrap();
        assert_eq!(json["cadence_ms"], 1500);
        assert_eq!(json["device_type"], "new");
        assert!(json.get("session").is_none());
        assert!(json.get("cancel").is_none());
    }
}
