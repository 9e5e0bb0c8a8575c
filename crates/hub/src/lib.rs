//! # ForgeHub Coordination Core
//!
//! This crate runs simultaneous, independent sessions with many networked
//! 3D printers from a single process.
//!
//! ## Overview
//!
//! The hub sits between a UI (or WebUI) and a printer transport. It provides:
//!
//! - **Context Registry**: one live session per printer address, each with
//!   its own state, capabilities and last status
//! - **Port Leasing**: a camera proxy port per session from a small fixed pool
//! - **Connection Flows**: direct connect, discovery, auto-connect and saved
//!   replay, with competing attempts for one address rejected as busy
//! - **Adaptive Polling**: an independent status loop per session that speeds
//!   up during jobs, backs off on failures and heals itself
//! - **Events**: a broadcast stream of typed, serializable hub events
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        PrinterHub                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌────────────────────┐        ┌─────────────────────────┐  │
//! │  │ ConnectionFlow     │──────▶ │   PollingCoordinator    │  │
//! │  │ Manager            │        │   (one task / context)  │  │
//! │  └─────────┬──────────┘        └────────────┬────────────┘  │
//! │            │                                │               │
//! │  ┌─────────▼────────────────────────────────▼────────────┐  │
//! │  │              ContextRegistry ── PortAllocator         │  │
//! │  └───────────────────────────┬───────────────────────────┘  │
//! │                              │                              │
//! │  ┌───────────────────────────▼───────────────────────────┐  │
//! │  │                       EventBus                        │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use hub::{Config, PrinterHub, SavedDeviceList, StartupPlan};
//! use protocol::DeviceTransport;
//!
//! async fn run(transport: Arc<dyn DeviceTransport>) -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let _guard = hub::logging::init_logging(&config.logging)?;
//!
//!     let hub = PrinterHub::new(config, transport)?;
//!     hub.start().await?;
//!
//!     let saved = SavedDeviceList::new();
//!     hub.apply_startup(&StartupPlan::AllSaved, &saved).await?;
//!
//!     let mut events = hub.subscribe();
//!     while let Ok(event) = events.recv().await {
//!         println!("{}", event.to_json()?);
//!     }
//!
//!     hub.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`logging`]: Tracing subscriber setup
//! - [`ports`]: Camera proxy port allocator
//! - [`registry`]: Printer contexts and the context registry
//! - [`polling`]: Adaptive per-context status polling
//! - [`flows`]: Connection flows
//! - [`saved`]: Saved-device source
//! - [`events`]: Event bus
//! - [`hub`]: Main hub coordinator

pub mod config;
pub mod error;
pub mod events;
pub mod flows;
pub mod hub;
pub mod logging;
pub mod polling;
pub mod ports;
pub mod registry;
pub mod saved;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{Config, ConfigError};
pub use error::{HubError, HubResult};
pub use events::EventBus;
pub use flows::{ConnectionFlowManager, DiscoveryHandle, FlowHandle, FlowRecord};
pub use hub::{PrinterHub, StartupPlan};
pub use polling::{CadencePolicy, PollingCoordinator};
pub use ports::{PortAllocator, PortError, PortLease};
pub use registry::{ContextRegistry, ContextSpec, PrinterContext};
pub use saved::{SavedDevice, SavedDeviceList, SavedDeviceSource};
