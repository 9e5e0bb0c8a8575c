//! Camera proxy port leasing.
//!
//! Each context leases one port from a small fixed pool; the port is freed
//! when the context is torn down.

pub mod allocator;

pub use allocator::{PortAllocator, PortError, PortLease};
