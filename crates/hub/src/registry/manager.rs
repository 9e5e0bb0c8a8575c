//! Context registry: the single owner of every printer context.
//!
//! All mutations take the registry's write lock, and the events describing a
//! mutation are published before the lock is released. This keeps the
//! one-context-per-address rule race free and guarantees that per-context
//! events reach subscribers in mutation order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use protocol::{
    Capabilities, ConnectionState, ContextId, DeviceAddress, DeviceType, HubEvent, SessionHandle,
    StatusSnapshot,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::context::{ContextSpec, PrinterContext};
use crate::error::{HubError, HubResult};
use crate::events::EventBus;
use crate::ports::PortAllocator;

/// What the polling loop needs to drive one context.
#[derive(Debug, Clone)]
pub(crate) struct PollTarget {
    pub session: SessionHandle,
    pub cancel: CancellationToken,
    pub cadence: Duration,
}

#[derive(Default)]
struct RegistryState {
    contexts: HashMap<ContextId, PrinterContext>,
    by_address: HashMap<DeviceAddress, ContextId>,
    /// Context ids in creation order.
    order: Vec<ContextId>,
    active: Option<ContextId>,
}

impl RegistryState {
    fn context_mut(&mut self, id: ContextId) -> HubResult<&mut PrinterContext> {
        self.contexts.get_mut(&id).ok_or(HubError::NotFound(id))
    }
}

/// Registry of live printer contexts keyed by id and by device address.
pub struct ContextRegistry {
    ports: Arc<PortAllocator>,
    events: EventBus,
    initial_cadence: Duration,
    /// Parent of every per-context cancellation token.
    root_token: CancellationToken,
    state: RwLock<RegistryState>,
}

impl ContextRegistry {
    /// Creates an empty registry.
    ///
    /// `initial_cadence` is the poll cadence a context starts with;
    /// `root_token` cancels every context's polling at once on shutdown.
    pub fn new(
        ports: Arc<PortAllocator>,
        events: EventBus,
        initial_cadence: Duration,
        root_token: CancellationToken,
    ) -> Self {
        Self {
            ports,
            events,
            initial_cadence,
            root_token,
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Registers a context for `address` in the `Connecting` state.
    pub async fn create(
        &self,
        address: DeviceAddress,
        device_type: DeviceType,
        capabilities: Capabilities,
    ) -> HubResult<ContextId> {
        self.register(ContextSpec::new(address, device_type, capabilities))
            .await
    }

    /// Registers a context from a full spec.
    ///
    /// Fails with `DuplicateAddress` when the address already has a live
    /// context and with a port error when the pool is exhausted; in both
    /// cases nothing is registered.
    pub async fn register(&self, spec: ContextSpec) -> HubResult<ContextId> {
        let mut state = self.state.write().await;

        if state.by_address.contains_key(&spec.address) {
            return Err(HubError::DuplicateAddress(spec.address));
        }

        let id = ContextId::new();
        let port = self.ports.acquire(id)?;
        let address = spec.address.clone();
        let context = PrinterContext::new(
            id,
            spec,
            port,
            self.initial_cadence,
            self.root_token.child_token(),
        );

        state.contexts.insert(id, context);
        state.by_address.insert(address.clone(), id);
        state.order.push(id);

        tracing::info!(context_id = %id, address = %address, port, "Created printer context");
        self.events.publish(HubEvent::ContextCreated {
            id,
            address,
            port,
        });

        if state.active.is_none() {
            state.active = Some(id);
            self.events
                .publish(HubEvent::ActiveContextChanged { id: Some(id) });
        }

        Ok(id)
    }

    /// Marks a context as connected and stores its capabilities.
    pub async fn mark_connected(&self, id: ContextId, capabilities: Capabilities) -> HubResult<()> {
        let mut state = self.state.write().await;
        let context = state.context_mut(id)?;

        context.capabilities = capabilities;
        context.consecutive_failures = 0;
        if context.connected_at.is_none() {
            context.connected_at = Some(SystemTime::now());
        }
        self.transition(context, ConnectionState::Connected);
        Ok(())
    }

    /// Moves a context to the error state.
    pub async fn mark_error(
        &self,
        id: ContextId,
        reason: impl Into<String>,
        fatal: bool,
    ) -> HubResult<()> {
        let mut state = self.state.write().await;
        let context = state.context_mut(id)?;

        let next = ConnectionState::Error {
            failures: context.consecutive_failures,
            reason: reason.into(),
            fatal,
        };
        self.transition(context, next);
        Ok(())
    }

    /// Stores a successful poll result.
    ///
    /// Resets the failure counter, recovers an errored context, assigns the
    /// next sequence number and publishes `status-changed`. Returns the
    /// sequence number.
    pub async fn update_status(
        &self,
        id: ContextId,
        snapshot: StatusSnapshot,
        cadence: Duration,
    ) -> HubResult<u64> {
        let mut state = self.state.write().await;
        let context = state.context_mut(id)?;

        context.consecutive_failures = 0;
        context.cadence = cadence;
        if context.state.is_error() {
            tracing::info!(context_id = %id, "Printer recovered");
            self.transition(context, ConnectionState::Connected);
        }

        context.status_sequence += 1;
        context.last_status = Some(snapshot.clone());
        let sequence = context.status_sequence;

        self.events.publish(HubEvent::StatusChanged {
            id,
            sequence,
            snapshot,
        });
        Ok(sequence)
    }

    /// Records a failed poll and the backoff cadence. Returns the new
    /// consecutive failure count.
    pub async fn record_failure(&self, id: ContextId, cadence: Duration) -> HubResult<u32> {
        let mut state = self.state.write().await;
        let context = state.context_mut(id)?;

        context.consecutive_failures += 1;
        context.cadence = cadence;
        if let ConnectionState::Error { failures, .. } = &mut context.state {
            *failures = context.consecutive_failures;
        }
        Ok(context.consecutive_failures)
    }

    /// Sets the printer name reported by the device.
    pub async fn set_name(&self, id: ContextId, name: Option<String>) -> HubResult<()> {
        let mut state = self.state.write().await;
        state.context_mut(id)?.name = name;
        Ok(())
    }

    /// Removes a context, cancels its polling and releases its port.
    ///
    /// Returns the removed context, or `None` if it was already gone, so that
    /// concurrent teardowns release resources exactly once.
    pub async fn teardown(&self, id: ContextId) -> Option<PrinterContext> {
        let mut state = self.state.write().await;
        let context = state.contexts.remove(&id)?;

        state.by_address.remove(&context.address);
        state.order.retain(|other| *other != id);
        context.cancel.cancel();
        let port = self.ports.release(id);

        tracing::info!(
            context_id = %id,
            address = %context.address,
            port = ?port,
            "Removed printer context"
        );
        self.events.publish(HubEvent::ContextRemoved { id });

        if state.active == Some(id) {
            state.active = state.order.first().copied();
            self.events
                .publish(HubEvent::ActiveContextChanged { id: state.active });
        }

        Some(context)
    }

    /// Returns a snapshot of a context.
    pub async fn get(&self, id: ContextId) -> Option<PrinterContext> {
        self.state.read().await.contexts.get(&id).cloned()
    }

    /// Returns snapshots of all contexts in creation order.
    pub async fn list(&self) -> Vec<PrinterContext> {
        let state = self.state.read().await;
        state
            .order
            .iter()
            .filter_map(|id| state.contexts.get(id).cloned())
            .collect()
    }

    /// Finds the live context for an address.
    pub async fn find_by_address(&self, address: &DeviceAddress) -> Option<PrinterContext> {
        let state = self.state.read().await;
        state
            .by_address
            .get(address)
            .and_then(|id| state.contexts.get(id).cloned())
    }

    /// Whether an address has a live context.
    pub async fn contains_address(&self, address: &DeviceAddress) -> bool {
        self.state.read().await.by_address.contains_key(address)
    }

    /// Number of live contexts.
    pub async fn len(&self) -> usize {
        self.state.read().await.contexts.len()
    }

    /// Whether no context is registered.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// The context currently selected by the UI.
    pub async fn active(&self) -> Option<ContextId> {
        self.state.read().await.active
    }

    /// Selects the context shown by the UI.
    pub async fn set_active(&self, id: ContextId) -> HubResult<()> {
        let mut state = self.state.write().await;
        if !state.contexts.contains_key(&id) {
            return Err(HubError::NotFound(id));
        }
        if state.active != Some(id) {
            state.active = Some(id);
            self.events
                .publish(HubEvent::ActiveContextChanged { id: Some(id) });
        }
        Ok(())
    }

    /// Session, cancellation token and cadence for the polling loop.
    pub(crate) async fn poll_target(&self, id: ContextId) -> HubResult<PollTarget> {
        let state = self.state.read().await;
        let context = state.contexts.get(&id).ok_or(HubError::NotFound(id))?;
        let session = context.session.ok_or(HubError::NoSession(id))?;
        Ok(PollTarget {
            session,
            cancel: context.cancel.clone(),
            cadence: context.cadence,
        })
    }

    fn transition(&self, context: &mut PrinterContext, next: ConnectionState) {
        if context.state == next {
            return;
        }
        tracing::debug!(
            context_id = %context.id,
            from = ?context.state,
            to = ?next,
            "Connection state changed"
        );
        context.state = next.clone();
        self.events.publish(HubEvent::ConnectionStateChanged {
            id: context.id,
            state: next,
        });
    }
}
