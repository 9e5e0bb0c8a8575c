//! Context registry for managing printer sessions.
//!
//! The registry owns every [`PrinterContext`], enforces one live context per
//! device address and leases each context a camera proxy port.

pub mod context;
pub mod manager;

pub use context::{ContextSpec, PrinterContext};
pub use manager::ContextRegistry;
