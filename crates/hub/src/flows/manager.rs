//! Connection flow orchestration.
//!
//! A flow turns a connection request into a live, polled context:
//!
//! ```text
//! Idle -> Negotiating -> Succeeded | Failed | Cancelled
//! ```
//!
//! Each flow runs in its own task. Only one flow may target an address at a
//! time, and no flow may target an address that already has a live context;
//! such requests are rejected with `Busy`, never queued. The reservation for
//! an address is held until the context is registered, so the busy check and
//! the registry's duplicate check never leave a window between them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use protocol::{
    CheckCode, ContextId, DeviceAddress, DeviceSession, DeviceTransport, DeviceType,
    DiscoveredDevice, FlowId, FlowKind, FlowOutcome, FlowState, HubEvent,
};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::discovery::DiscoveryScan;
use super::flow::{DiscoveryHandle, FlowHandle, FlowRecord};
use crate::config::{ConnectConfig, DiscoveryConfig};
use crate::error::{HubError, HubResult};
use crate::events::EventBus;
use crate::polling::PollingCoordinator;
use crate::registry::{ContextRegistry, ContextSpec};
use crate::saved::{SavedDevice, SavedDeviceSource};

struct FlowEntry {
    record: FlowRecord,
    cancel: CancellationToken,
    tx: watch::Sender<FlowState>,
}

struct Inner {
    registry: Arc<ContextRegistry>,
    coordinator: Arc<PollingCoordinator>,
    transport: Arc<dyn DeviceTransport>,
    events: EventBus,
    connect: ConnectConfig,
    discovery: DiscoveryConfig,
    flows: DashMap<FlowId, FlowEntry>,
    /// Addresses with a connect flow in progress.
    reservations: Mutex<HashMap<DeviceAddress, FlowId>>,
    root_token: CancellationToken,
    tasks: TaskTracker,
}

/// A connect request waiting to run.
struct ConnectRequest {
    flow_id: FlowId,
    kind: FlowKind,
    address: DeviceAddress,
    device_type: DeviceType,
    check_code: Option<CheckCode>,
    cancel: CancellationToken,
}

/// Starts, tracks and cancels connection flows.
pub struct ConnectionFlowManager {
    inner: Arc<Inner>,
}

impl ConnectionFlowManager {
    pub fn new(
        registry: Arc<ContextRegistry>,
        coordinator: Arc<PollingCoordinator>,
        transport: Arc<dyn DeviceTransport>,
        events: EventBus,
        connect: ConnectConfig,
        discovery: DiscoveryConfig,
        root_token: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                coordinator,
                transport,
                events,
                connect,
                discovery,
                flows: DashMap::new(),
                reservations: Mutex::new(HashMap::new()),
                root_token,
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Connects to a printer by address.
    ///
    /// Fails immediately with `MissingCheckCode` when the family needs a
    /// code and none was given, and with `Busy` when a flow or a live
    /// context already targets the address.
    pub async fn start_direct_connect(
        &self,
        address: DeviceAddress,
        device_type: DeviceType,
        check_code: Option<CheckCode>,
    ) -> HubResult<FlowHandle> {
        self.start_connect(FlowKind::DirectAddress, address, device_type, check_code)
            .await
    }

    /// Connects to a device found by a discovery scan.
    pub async fn promote(
        &self,
        candidate: &DiscoveredDevice,
        check_code: Option<CheckCode>,
    ) -> HubResult<FlowHandle> {
        self.start_connect(
            FlowKind::Discovery,
            candidate.address.clone(),
            candidate.device_type,
            check_code,
        )
        .await
    }

    /// Starts one independent connect flow per saved device.
    ///
    /// A device that cannot even start (busy, missing check code) gets a
    /// handle that is already `Failed`; its siblings are unaffected.
    pub async fn start_auto_connect(&self, devices: &[SavedDevice]) -> Vec<FlowHandle> {
        self.fan_out(FlowKind::AutoConnect, devices).await
    }

    /// Replays every entry of a saved-device source.
    pub async fn start_saved_replay(&self, source: &dyn SavedDeviceSource) -> Vec<FlowHandle> {
        self.fan_out(FlowKind::SavedReplay, &source.devices()).await
    }

    /// Scans the network for printers.
    pub fn start_discovery(&self) -> DiscoveryHandle {
        let (flow_id, cancel, handle) = self.inner.open_flow(FlowKind::Discovery, None);
        let (candidates_tx, candidates_rx) = mpsc::unbounded_channel();

        info!(flow_id = %flow_id, "Starting discovery");
        let inner = Arc::clone(&self.inner);
        self.inner.tasks.spawn(async move {
            inner.run_discovery(flow_id, cancel, candidates_tx).await;
        });

        DiscoveryHandle::new(handle, candidates_rx)
    }

    /// Cancels a flow. Returns whether an in-progress flow was signalled;
    /// unknown and finished flows are left alone.
    pub fn cancel(&self, flow_id: FlowId) -> bool {
        match self.inner.flows.get(&flow_id) {
            Some(entry) => {
                debug!(flow_id = %flow_id, "Cancelling flow");
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels the connect flow targeting `address`, if any.
    pub async fn cancel_for_address(&self, address: &DeviceAddress) -> bool {
        let flow_id = self.inner.reservations.lock().await.get(address).copied();
        match flow_id {
            Some(flow_id) => self.cancel(flow_id),
            None => false,
        }
    }

    /// Cancels every in-progress flow.
    pub fn cancel_all(&self) {
        for entry in self.inner.flows.iter() {
            entry.cancel.cancel();
        }
    }

    /// Cancels every flow and waits for all flow tasks to finish.
    ///
    /// Once this returns no flow can register a context any more.
    pub async fn shutdown(&self) {
        self.cancel_all();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.tasks.reopen();
    }

    /// Snapshot of a single in-progress flow.
    pub fn flow(&self, flow_id: FlowId) -> HubResult<FlowRecord> {
        self.inner
            .flows
            .get(&flow_id)
            .map(|entry| entry.record.clone())
            .ok_or(HubError::FlowNotFound(flow_id))
    }

    /// Snapshots of every in-progress flow, oldest first.
    pub fn active_flows(&self) -> Vec<FlowRecord> {
        let mut records: Vec<FlowRecord> = self
            .inner
            .flows
            .iter()
            .map(|entry| entry.record.clone())
            .collect();
        records.sort_by_key(|record| record.created_at);
        records
    }

    async fn start_connect(
        &self,
        kind: FlowKind,
        address: DeviceAddress,
        device_type: DeviceType,
        check_code: Option<CheckCode>,
    ) -> HubResult<FlowHandle> {
        if device_type.requires_check_code() && check_code.is_none() {
            return Err(HubError::MissingCheckCode(address));
        }

        let (flow_id, cancel, handle) = {
            let mut reservations = self.inner.reservations.lock().await;
            if reservations.contains_key(&address)
                || self.inner.registry.contains_address(&address).await
            {
                return Err(HubError::Busy(address));
            }
            let opened = self.inner.open_flow(kind, Some(address.clone()));
            reservations.insert(address.clone(), opened.0);
            opened
        };

        info!(flow_id = %flow_id, address = %address, kind = ?kind, "Starting connection flow");
        let request = ConnectRequest {
            flow_id,
            kind,
            address,
            device_type,
            check_code,
            cancel,
        };
        let inner = Arc::clone(&self.inner);
        self.inner.tasks.spawn(async move {
            inner.run_connect(request).await;
        });

        Ok(handle)
    }

    async fn fan_out(&self, kind: FlowKind, devices: &[SavedDevice]) -> Vec<FlowHandle> {
        let mut handles = Vec::with_capacity(devices.len());
        for device in devices {
            let started = self
                .start_connect(
                    kind,
                    device.address.clone(),
                    device.device_type,
                    device.check_code.clone(),
                )
                .await;
            let handle = match started {
                Ok(handle) => handle,
                Err(err) => {
                    warn!(address = %device.address, error = %err, kind = ?kind, "Saved device skipped");
                    let handle = FlowHandle::rejected(kind, Some(device.address.clone()), &err);
                    self.inner.events.publish(HubEvent::FlowProgress {
                        flow_id: handle.id(),
                        kind,
                        address: Some(device.address.clone()),
                        error: Some(err.kind()),
                        state: handle.state(),
                    });
                    handle
                }
            };
            handles.push(handle);
        }
        handles
    }
}

impl Inner {
    /// Registers a flow in `Idle` and announces it.
    fn open_flow(
        &self,
        kind: FlowKind,
        target: Option<DeviceAddress>,
    ) -> (FlowId, CancellationToken, FlowHandle) {
        let flow_id = FlowId::new();
        let cancel = self.root_token.child_token();
        let (tx, rx) = watch::channel(FlowState::Idle);
        let record = FlowRecord::new(flow_id, kind, target.clone());

        self.flows.insert(
            flow_id,
            FlowEntry {
                record,
                cancel: cancel.clone(),
                tx,
            },
        );
        self.events.publish(HubEvent::FlowProgress {
            flow_id,
            kind,
            address: target.clone(),
            state: FlowState::Idle,
            error: None,
        });

        (flow_id, cancel, FlowHandle::new(flow_id, kind, target, rx))
    }

    /// Moves a flow to `state`. Terminal flows are forgotten.
    fn transition(&self, flow_id: FlowId, state: FlowState) {
        let Some(mut entry) = self.flows.get_mut(&flow_id) else {
            return;
        };
        entry.record.state = state.clone();
        entry.record.updated_at = SystemTime::now();
        entry.tx.send_replace(state.clone());
        let event = HubEvent::FlowProgress {
            flow_id,
            kind: entry.record.kind,
            address: entry.record.target.clone(),
            error: state.error(),
            state: state.clone(),
        };
        drop(entry);

        if state.is_terminal() {
            self.flows.remove(&flow_id);
        }
        self.events.publish(event);
    }

    async fn release(&self, address: &DeviceAddress, flow_id: FlowId) {
        let mut reservations = self.reservations.lock().await;
        if reservations.get(address) == Some(&flow_id) {
            reservations.remove(address);
        }
    }

    async fn run_connect(&self, request: ConnectRequest) {
        let ConnectRequest {
            flow_id,
            kind,
            address,
            device_type,
            check_code,
            cancel,
        } = request;

        self.transition(flow_id, FlowState::Negotiating);

        let timeout = self.connect.timeout();
        let negotiated = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(
                timeout,
                self.transport.connect(&address, device_type, check_code.as_ref()),
            ) => Some(result),
        };

        let result = match negotiated {
            None => None,
            Some(Err(_)) => Some(Err(HubError::ConnectTimeout {
                address: address.clone(),
                timeout_ms: self.connect.timeout_ms,
            })),
            Some(Ok(Err(source))) => Some(Err(HubError::Connect {
                address: address.clone(),
                source,
            })),
            Some(Ok(Ok(session))) => {
                self.materialize(flow_id, &address, device_type, session, &cancel)
                    .await
            }
        };

        // Whatever happened, the address is either registered now or free.
        self.release(&address, flow_id).await;

        match result {
            Some(Ok(context_id)) => {
                info!(flow_id = %flow_id, address = %address, context_id = %context_id, "Connection flow succeeded");
                self.transition(
                    flow_id,
                    FlowState::Succeeded(FlowOutcome::Connected { context_id }),
                );
            }
            Some(Err(err)) => {
                warn!(flow_id = %flow_id, address = %address, kind = ?kind, error = %err, "Connection flow failed");
                self.transition(
                    flow_id,
                    FlowState::Failed {
                        error: err.kind(),
                        message: err.to_string(),
                    },
                );
            }
            None => {
                info!(flow_id = %flow_id, address = %address, "Connection flow cancelled");
                self.transition(flow_id, FlowState::Cancelled);
            }
        }
    }

    /// Registers a negotiated session and starts polling it.
    ///
    /// Returns `None` when the flow was cancelled before registration or the
    /// context was torn down by someone else before polling started. In the
    /// second case the teardown path owns the session and closes it.
    async fn materialize(
        &self,
        flow_id: FlowId,
        address: &DeviceAddress,
        device_type: DeviceType,
        session: DeviceSession,
        cancel: &CancellationToken,
    ) -> Option<HubResult<ContextId>> {
        if cancel.is_cancelled() {
            self.transport.disconnect(session.handle).await;
            return None;
        }

        let spec = ContextSpec {
            address: address.clone(),
            device_type,
            capabilities: session.capabilities.clone(),
            name: session.name.clone(),
            session: Some(session.handle),
        };

        let id = match self.registry.register(spec).await {
            Ok(id) => id,
            Err(err) => {
                self.transport.disconnect(session.handle).await;
                return Some(Err(err));
            }
        };

        let started = match self.registry.mark_connected(id, session.capabilities).await {
            Ok(()) => self.coordinator.start(id).await,
            Err(err) => Err(err),
        };

        match started {
            Ok(()) => Some(Ok(id)),
            Err(HubError::NotFound(_)) => {
                debug!(flow_id = %flow_id, context_id = %id, "Context torn down before polling started");
                None
            }
            Err(err) => {
                if let Some(context) = self.registry.teardown(id).await {
                    if let Some(handle) = context.session() {
                        self.transport.disconnect(handle).await;
                    }
                }
                Some(Err(err))
            }
        }
    }

    async fn run_discovery(
        &self,
        flow_id: FlowId,
        cancel: CancellationToken,
        candidates: mpsc::UnboundedSender<DiscoveredDevice>,
    ) {
        self.transition(flow_id, FlowState::Negotiating);

        let scan = DiscoveryScan::new(Arc::clone(&self.transport), &self.discovery);
        let events = self.events.clone();
        let on_candidate = move |device: DiscoveredDevice| {
            debug!(flow_id = %flow_id, address = %device.address, "Discovered printer");
            events.publish(HubEvent::CandidateDiscovered {
                flow_id,
                device: device.clone(),
            });
            // The caller may have dropped the handle; events still carry it.
            let _ = candidates.send(device);
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = scan.run(on_candidate) => Some(result),
        };

        match result {
            Some(Ok(count)) => {
                info!(flow_id = %flow_id, candidates = count, "Discovery finished");
                self.transition(
                    flow_id,
                    FlowState::Succeeded(FlowOutcome::Discovered { candidates: count }),
                );
            }
            Some(Err(err)) => {
                warn!(flow_id = %flow_id, error = %err, "Discovery failed");
                self.transition(
                    flow_id,
                    FlowState::Failed {
                        error: err.kind(),
                        message: err.to_string(),
                    },
                );
            }
            None => {
                info!(flow_id = %flow_id, "Discovery cancelled");
                self.transition(flow_id, FlowState::Cancelled);
            }
        }
    }
}
