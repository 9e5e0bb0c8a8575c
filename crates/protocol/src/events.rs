//! Events published by the hub to UI and WebUI subscribers.
//!
//! Events are internally tagged with a kebab-case `type` field so a WebUI
//! bridge can forward them as JSON without a translation layer.

use serde::{Deserialize, Serialize};

use crate::device::{DeviceAddress, DiscoveredDevice};
use crate::error::ErrorKind;
use crate::ids::{ContextId, FlowId};
use crate::state::{ConnectionState, FlowKind, FlowState, HubState};
use crate::status::StatusSnapshot;

/// An event emitted by a hub component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HubEvent {
    /// A context was registered and leased a camera port.
    ContextCreated {
        id: ContextId,
        address: DeviceAddress,
        port: u16,
    },
    /// A context was torn down.
    ContextRemoved { id: ContextId },
    /// A poll produced a new status snapshot.
    ///
    /// `sequence` starts at 1 for each context and increases by exactly one
    /// per event, so a gap means the subscriber missed an update.
    StatusChanged {
        id: ContextId,
        sequence: u64,
        snapshot: StatusSnapshot,
    },
    /// A context's connection state changed.
    ConnectionStateChanged { id: ContextId, state: ConnectionState },
    /// A connection flow changed state.
    FlowProgress {
        flow_id: FlowId,
        kind: FlowKind,
        address: Option<DeviceAddress>,
        state: FlowState,
        error: Option<ErrorKind>,
    },
    /// A discovery flow found a device.
    CandidateDiscovered {
        flow_id: FlowId,
        device: DiscoveredDevice,
    },
    /// The UI-selected context changed.
    ActiveContextChanged { id: Option<ContextId> },
    /// The hub lifecycle changed.
    HubStateChanged { state: HubState },
}

impl HubEvent {
    /// The context this event concerns, if any.
    pub fn context_id(&self) -> Option<ContextId> {
        match self {
            HubEvent::ContextCreated { id, .. }
            | HubEvent::ContextRemoved { id }
            | HubEvent::StatusChanged { id, .. }
            | HubEvent::ConnectionStateChanged { id, .. } => Some(*id),
            HubEvent::ActiveContextChanged { id } => *id,
            HubEvent::FlowProgress { .. }
            | HubEvent::CandidateDiscovered { .. }
            | HubEvent::HubStateChanged { .. } => None,
        }
    }

    /// Serializes the event to a JSON string for the WebUI bridge.
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
