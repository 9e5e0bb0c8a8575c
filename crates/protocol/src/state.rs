//! Connection, flow and hub lifecycle states.

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::ids::ContextId;

/// Connection state of a printer context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum ConnectionState {
    /// Registered, waiting for the flow to confirm the session.
    Connecting,
    /// Session is live and polls succeed.
    Connected,
    /// Polls are failing; `fatal` contexts stay here until torn down.
    Error {
        /// Consecutive poll failures when the state was entered or last updated.
        failures: u32,
        /// Human-readable reason of the most recent failure.
        reason: String,
        /// The device reported an unrecoverable error.
        fatal: bool,
    },
}

impl ConnectionState {
    /// Whether a polling loop must be running in this state.
    pub fn is_pollable(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Error { .. })
    }

    /// Whether the context is in the error state.
    pub fn is_error(&self) -> bool {
        matches!(self, ConnectionState::Error { .. })
    }
}

/// What started a connection flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlowKind {
    /// Network scan for printers.
    Discovery,
    /// Operator-supplied address.
    DirectAddress,
    /// Startup reconnect to previously used printers.
    AutoConnect,
    /// Explicit replay of the whole saved-device list.
    SavedReplay,
}

/// Result of a successful flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum FlowOutcome {
    /// A context was created and connected.
    Connected {
        /// The new context.
        context_id: ContextId,
    },
    /// A discovery scan completed.
    Discovered {
        /// Number of distinct devices found.
        candidates: usize,
    },
}

/// State of a single connection flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum FlowState {
    /// Created, nothing attempted yet.
    Idle,
    /// Talking to the transport.
    Negotiating,
    /// Finished successfully.
    Succeeded(FlowOutcome),
    /// Finished with an error.
    Failed {
        /// Classified failure.
        error: ErrorKind,
        /// Details for display.
        message: String,
    },
    /// Cancelled before completion.
    Cancelled,
}

impl FlowState {
    /// Whether the flow can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowState::Succeeded(_) | FlowState::Failed { .. } | FlowState::Cancelled
        )
    }

    /// The error kind of a failed flow.
    pub fn error(&self) -> Option<ErrorKind> {
        match self {
            FlowState::Failed { error, .. } => Some(*error),
            _ => None,
        }
    }

    /// The context created by a successful connect flow.
    pub fn context_id(&self) -> Option<ContextId> {
        match self {
            FlowState::Succeeded(FlowOutcome::Connected { context_id }) => Some(*context_id),
            _ => None,
        }
    }
}

/// Lifecycle of the hub as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HubState {
    /// Not started, or fully stopped.
    Stopped,
    /// Initializing components.
    Starting,
    /// Accepting connection requests.
    Running,
    /// Tearing every session down.
    ShuttingDown,
}
