//! Hub orchestrator wiring every component together.
//!
//! [`PrinterHub`] owns the port allocator, context registry, polling
//! coordinator, flow manager and event bus. It is constructed explicitly by
//! the embedding application, which supplies the device transport, and moves
//! through `Stopped -> Starting -> Running -> ShuttingDown -> Stopped`.

use std::sync::Arc;

use anyhow::{Context, Result};
use protocol::{
    CheckCode, ContextId, DeviceAddress, DeviceTransport, DeviceType, DiscoveredDevice, FlowId,
    HubEvent, HubState,
};
use tokio::sync::{broadcast, RwLock, RwLockReadGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{HubError, HubResult};
use crate::events::EventBus;
use crate::flows::{ConnectionFlowManager, DiscoveryHandle, FlowHandle, FlowRecord};
use crate::polling::{CadencePolicy, PollingCoordinator};
use crate::ports::{PortAllocator, PortLease};
use crate::registry::{ContextRegistry, PrinterContext};
use crate::saved::{SavedDevice, SavedDeviceSource};

/// The initial connection requests supplied by the launcher.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum StartupPlan {
    /// Start with no printers.
    #[default]
    None,
    /// Reconnect the most recently used saved printer.
    ReconnectLastUsed,
    /// Connect to an explicit list of printers.
    Addresses(Vec<SavedDevice>),
    /// Connect to every saved printer.
    AllSaved,
}

/// Coordinates sessions with many printers at once.
pub struct PrinterHub {
    config: Config,
    state: RwLock<HubState>,
    events: EventBus,
    ports: Arc<PortAllocator>,
    registry: Arc<ContextRegistry>,
    coordinator: Arc<PollingCoordinator>,
    flows: ConnectionFlowManager,
    transport: Arc<dyn DeviceTransport>,
    /// Cancels every flow and polling loop when the hub is dropped.
    shutdown_token: CancellationToken,
}

impl PrinterHub {
    /// Creates a stopped hub.
    pub fn new(config: Config, transport: Arc<dyn DeviceTransport>) -> Result<Self> {
        config.validate().context("Invalid hub configuration")?;

        let events = EventBus::new();
        let shutdown_token = CancellationToken::new();
        let ports = Arc::new(PortAllocator::new(config.ports.range()));
        let registry = Arc::new(ContextRegistry::new(
            Arc::clone(&ports),
            events.clone(),
            CadencePolicy::from_config(&config.polling).initial(),
            shutdown_token.clone(),
        ));
        let coordinator = Arc::new(PollingCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&transport),
            &config.polling,
        ));
        let flows = ConnectionFlowManager::new(
            Arc::clone(&registry),
            Arc::clone(&coordinator),
            Arc::clone(&transport),
            events.clone(),
            config.connect.clone(),
            config.discovery.clone(),
            shutdown_token.clone(),
        );

        debug!(
            ports = ?config.ports.range(),
            connect_timeout_ms = config.connect.timeout_ms,
            "Hub created"
        );

        Ok(Self {
            config,
            state: RwLock::new(HubState::Stopped),
            events,
            ports,
            registry,
            coordinator,
            flows,
            transport,
            shutdown_token,
        })
    }

    /// Returns the current lifecycle state.
    pub async fn state(&self) -> HubState {
        *self.state.read().await
    }

    /// Returns a receiver for hub events.
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    /// The hub's event bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Starts accepting connection requests.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != HubState::Stopped {
                anyhow::bail!("Hub is already running");
            }
            *state = HubState::Starting;
        }
        self.emit_state(HubState::Starting);

        info!(
            ports = ?self.config.ports.range(),
            "Starting printer hub"
        );

        *self.state.write().await = HubState::Running;
        self.emit_state(HubState::Running);

        info!("Printer hub started");
        Ok(())
    }

    /// Cancels every flow, stops every polling loop and tears every context
    /// down. Stopping a stopped hub is a no-op.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write().await;
            if *state != HubState::Running {
                debug!(state = ?*state, "Stop requested while not running");
                return;
            }
            *state = HubState::ShuttingDown;
        }
        self.emit_state(HubState::ShuttingDown);
        info!("Shutting down printer hub");

        self.flows.shutdown().await;
        self.coordinator.stop_all().await;

        let contexts = self.registry.list().await;
        let count = contexts.len();
        for context in contexts {
            self.release(context.id).await;
        }

        *self.state.write().await = HubState::Stopped;
        self.emit_state(HubState::Stopped);
        info!(contexts = count, "Printer hub stopped");
    }

    /// Connects to a printer by address.
    pub async fn connect(
        &self,
        address: DeviceAddress,
        device_type: DeviceType,
        check_code: Option<CheckCode>,
    ) -> HubResult<FlowHandle> {
        let _running = self.ensure_running().await?;
        self.flows
            .start_direct_connect(address, device_type, check_code)
            .await
    }

    /// Scans the network for printers.
    pub async fn discover(&self) -> HubResult<DiscoveryHandle> {
        let _running = self.ensure_running().await?;
        Ok(self.flows.start_discovery())
    }

    /// Connects to a discovered printer.
    pub async fn promote(
        &self,
        candidate: &DiscoveredDevice,
        check_code: Option<CheckCode>,
    ) -> HubResult<FlowHandle> {
        let _running = self.ensure_running().await?;
        self.flows.promote(candidate, check_code).await
    }

    /// Connects to each of `devices` independently.
    pub async fn auto_connect(&self, devices: &[SavedDevice]) -> HubResult<Vec<FlowHandle>> {
        let _running = self.ensure_running().await?;
        Ok(self.flows.start_auto_connect(devices).await)
    }

    /// Connects to every device of a saved-device source.
    pub async fn replay_saved(&self, source: &dyn SavedDeviceSource) -> HubResult<Vec<FlowHandle>> {
        let _running = self.ensure_running().await?;
        Ok(self.flows.start_saved_replay(source).await)
    }

    /// Runs the launcher's startup plan.
    pub async fn apply_startup(
        &self,
        plan: &StartupPlan,
        source: &dyn SavedDeviceSource,
    ) -> HubResult<Vec<FlowHandle>> {
        let _running = self.ensure_running().await?;
        let handles = match plan {
            StartupPlan::None => Vec::new(),
            StartupPlan::ReconnectLastUsed => match source.last_used() {
                Some(device) => self.flows.start_auto_connect(&[device]).await,
                None => {
                    info!("No last used printer to reconnect");
                    Vec::new()
                }
            },
            StartupPlan::Addresses(devices) => self.flows.start_auto_connect(devices).await,
            StartupPlan::AllSaved => self.flows.start_saved_replay(source).await,
        };
        info!(plan = ?plan, flows = handles.len(), "Applied startup plan");
        Ok(handles)
    }

    /// Cancels an in-progress flow. Returns whether one was signalled.
    pub async fn cancel_flow(&self, flow_id: FlowId) -> HubResult<bool> {
        let _running = self.ensure_running().await?;
        Ok(self.flows.cancel(flow_id))
    }

    /// Polls a context right away.
    pub async fn notify_activity(&self, id: ContextId) -> HubResult<()> {
        let _running = self.ensure_running().await?;
        self.coordinator.notify_activity(id)
    }

    /// Selects the context shown by the UI.
    pub async fn set_active(&self, id: ContextId) -> HubResult<()> {
        let _running = self.ensure_running().await?;
        self.registry.set_active(id).await
    }

    /// Tears a context down without a flow: stops polling, cancels any flow
    /// for its address, releases its port and closes its session.
    ///
    /// Returns whether a context was removed; unknown ids are a no-op.
    pub async fn disconnect(&self, id: ContextId) -> HubResult<bool> {
        let _running = self.ensure_running().await?;
        if let Some(context) = self.registry.get(id).await {
            self.flows.cancel_for_address(&context.address).await;
        }
        self.coordinator.stop(id).await;
        Ok(self.release(id).await)
    }

    /// Snapshot of one context.
    pub async fn context(&self, id: ContextId) -> Option<PrinterContext> {
        self.registry.get(id).await
    }

    /// Snapshots of every context in creation order.
    pub async fn contexts(&self) -> Vec<PrinterContext> {
        self.registry.list().await
    }

    /// The live context for an address.
    pub async fn find_by_address(&self, address: &DeviceAddress) -> Option<PrinterContext> {
        self.registry.find_by_address(address).await
    }

    /// The context selected by the UI.
    pub async fn active_context(&self) -> Option<ContextId> {
        self.registry.active().await
    }

    /// Snapshots of in-progress flows.
    pub fn active_flows(&self) -> Vec<FlowRecord> {
        self.flows.active_flows()
    }

    /// Live camera port leases.
    pub fn port_leases(&self) -> Vec<PortLease> {
        self.ports.leases()
    }

    /// Number of running polling loops.
    pub fn polling_count(&self) -> usize {
        self.coordinator.active_count()
    }

    /// Holds the lifecycle read lock for the duration of a request, so
    /// `stop` cannot start tearing down until the request has handed its
    /// flow to the flow manager.
    async fn ensure_running(&self) -> HubResult<RwLockReadGuard<'_, HubState>> {
        let state = self.state.read().await;
        if *state == HubState::Running {
            Ok(state)
        } else {
            Err(HubError::NotRunning)
        }
    }

    /// Removes a context and closes its transport session.
    async fn release(&self, id: ContextId) -> bool {
        let Some(context) = self.registry.teardown(id).await else {
            return false;
        };
        if let Some(session) = context.session() {
            self.transport.disconnect(session).await;
        }
        info!(context_id = %id, printer = context.label(), "Disconnected printer");
        true
    }

    fn emit_state(&self, state: HubState) {
        self.events.publish(HubEvent::HubStateChanged { state });
    }
}

impl Drop for PrinterHub {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}
