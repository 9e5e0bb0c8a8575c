//! # ForgeHub Protocol Library
//!
//! Shared vocabulary for the ForgeHub printer session hub.
//!
//! ## Overview
//!
//! The protocol crate is the boundary between the coordination core and its
//! collaborators, providing:
//!
//! - **Identifiers**: `ContextId` and `FlowId`
//! - **Device Types**: addresses, printer families, check codes, capabilities
//! - **Status**: the snapshot returned by each poll
//! - **States**: connection, flow and hub lifecycle states as tagged enums
//! - **Events**: the serializable event stream consumed by UI and WebUI layers
//! - **Transport**: the `DeviceTransport` trait a wire-protocol client implements
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        UI / WebUI subscribers           │  HubEvent (JSON)
//! ├─────────────────────────────────────────┤
//! │        Hub coordination core            │  registry, flows, polling
//! ├─────────────────────────────────────────┤
//! │          DeviceTransport                │  connect / poll / discover
//! ├─────────────────────────────────────────┤
//! │     Printer wire protocol (external)    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`ids`]: context and flow identifiers
//! - [`device`]: addresses, device types, check codes, capabilities
//! - [`status`]: status snapshots
//! - [`state`]: connection, flow and hub states
//! - [`events`]: hub events
//! - [`transport`]: the device transport trait
//! - [`error`]: error types and the failure taxonomy

pub mod device;
pub mod error;
pub mod events;
pub mod ids;
pub mod state;
pub mod status;
pub mod transport;

pub use device::{Capabilities, Capability, CheckCode, DeviceAddress, DeviceType, DiscoveredDevice};
pub use error::{ErrorKind, ProtocolError, Result, TransportError};
pub use events::HubEvent;
pub use ids::{ContextId, FlowId};
pub use state::{ConnectionState, FlowKind, FlowOutcome, FlowState, HubState};
pub use status::{JobProgress, MachineState, StatusSnapshot};
pub use transport::{DeviceSession, DeviceTransport, SessionHandle};
