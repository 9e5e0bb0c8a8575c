//! Connection flows: direct connect, discovery, auto-connect and saved
//! replay.

pub mod discovery;
pub mod flow;
pub mod manager;

pub use flow::{DiscoveryHandle, FlowHandle, FlowRecord};
pub use manager::ConnectionFlowManager;
