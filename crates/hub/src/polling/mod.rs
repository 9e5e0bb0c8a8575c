//! Adaptive per-context status polling.

pub mod cadence;
pub mod coordinator;

pub use cadence::CadencePolicy;
pub use coordinator::PollingCoordinator;
