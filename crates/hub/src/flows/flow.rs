//! Flow handles returned to callers.

use std::time::SystemTime;

use protocol::{DeviceAddress, DiscoveredDevice, FlowId, FlowKind, FlowState};
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::error::HubError;

/// Snapshot of an in-progress connection flow.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowRecord {
    pub id: FlowId,
    pub kind: FlowKind,
    /// Address being connected; `None` for discovery.
    pub target: Option<DeviceAddress>,
    pub state: FlowState,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

impl FlowRecord {
    pub(crate) fn new(id: FlowId, kind: FlowKind, target: Option<DeviceAddress>) -> Self {
        let now = SystemTime::now();
        Self {
            id,
            kind,
            target,
            state: FlowState::Idle,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Caller's view of one connection flow.
///
/// The handle observes the flow's state through a watch channel; dropping
/// it does not cancel the flow.
#[derive(Debug, Clone)]
pub struct FlowHandle {
    id: FlowId,
    kind: FlowKind,
    target: Option<DeviceAddress>,
    state: watch::Receiver<FlowState>,
}

impl FlowHandle {
    pub(crate) fn new(
        id: FlowId,
        kind: FlowKind,
        target: Option<DeviceAddress>,
        state: watch::Receiver<FlowState>,
    ) -> Self {
        Self {
            id,
            kind,
            target,
            state,
        }
    }

    /// A handle for a request rejected before any flow started.
    pub(crate) fn rejected(kind: FlowKind, target: Option<DeviceAddress>, err: &HubError) -> Self {
        let (_, state) = watch::channel(FlowState::Failed {
            error: err.kind(),
            message: err.to_string(),
        });
        Self::new(FlowId::new(), kind, target, state)
    }

    pub fn id(&self) -> FlowId {
        self.id
    }

    pub fn kind(&self) -> FlowKind {
        self.kind
    }

    pub fn target(&self) -> Option<&DeviceAddress> {
        self.target.as_ref()
    }

    /// Current state.
    pub fn state(&self) -> FlowState {
        self.state.borrow().clone()
    }

    /// A receiver that is notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<FlowState> {
        self.state.clone()
    }

    /// Waits until the flow reaches a terminal state and returns it.
    pub async fn wait(&self) -> FlowState {
        let mut rx = self.state.clone();
        if let Ok(state) = rx.wait_for(FlowState::is_terminal).await {
            return (*state).clone();
        }
        // The flow task is gone; whatever it last published is final.
        let last = rx.borrow().clone();
        last
    }
}

/// Handle for a discovery flow: the flow itself plus the candidate stream.
///
/// Candidates are deduplicated by address across passes. The stream ends
/// when the scan finishes, fails or is cancelled.
#[derive(Debug)]
pub struct DiscoveryHandle {
    flow: FlowHandle,
    candidates: mpsc::UnboundedReceiver<DiscoveredDevice>,
}

impl DiscoveryHandle {
    pub(crate) fn new(
        flow: FlowHandle,
        candidates: mpsc::UnboundedReceiver<DiscoveredDevice>,
    ) -> Self {
        Self { flow, candidates }
    }

    pub fn flow(&self) -> &FlowHandle {
        &self.flow
    }

    pub fn id(&self) -> FlowId {
        self.flow.id()
    }

    /// Next distinct candidate, or `None` once the scan is over.
    pub async fn next_candidate(&mut self) -> Option<DiscoveredDevice> {
        self.candidates.recv().await
    }

    /// Drains the stream until the scan is over.
    pub async fn collect(mut self) -> Vec<DiscoveredDevice> {
        let mut found = Vec::new();
        while let Some(device) = self.candidates.recv().await {
            found.push(device);
        }
        found
    }
}
