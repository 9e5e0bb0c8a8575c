//! Smallest-first port allocator over a fixed inclusive range.

use std::collections::{BTreeMap, HashMap};
use std::ops::RangeInclusive;
use std::sync::{Mutex, MutexGuard, PoisonError};

use protocol::ContextId;
use serde::Serialize;
use thiserror::Error;

/// Errors that can occur while leasing ports.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PortError {
    /// Every port in the range is leased.
    #[error("no camera ports left in {start}-{end}")]
    PoolExhausted { start: u16, end: u16 },
}

/// An exclusive port assignment held by a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortLease {
    /// The leased port.
    pub port: u16,
    /// The context holding it.
    pub context_id: ContextId,
}

#[derive(Default)]
struct LeaseTable {
    by_port: BTreeMap<u16, ContextId>,
    by_context: HashMap<ContextId, u16>,
}

/// Thread-safe allocator for camera proxy ports.
///
/// All operations go through one mutex, so two concurrent acquisitions can
/// never return the same port.
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    table: Mutex<LeaseTable>,
}

impl PortAllocator {
    /// Creates an allocator over `range`. An empty range yields an allocator
    /// that is always exhausted.
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            range,
            table: Mutex::new(LeaseTable::default()),
        }
    }

    fn table(&self) -> MutexGuard<'_, LeaseTable> {
        // The table is never left half-updated, so a poisoned lock is still usable.
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Leases the smallest free port to `context_id`.
    ///
    /// A context that already holds a lease gets the same port back.
    pub fn acquire(&self, context_id: ContextId) -> Result<u16, PortError> {
        let mut table = self.table();

        if let Some(port) = table.by_context.get(&context_id) {
            return Ok(*port);
        }

        let port = self
            .range
            .clone()
            .find(|port| !table.by_port.contains_key(port))
            .ok_or(PortError::PoolExhausted {
                start: *self.range.start(),
                end: *self.range.end(),
            })?;

        table.by_port.insert(port, context_id);
        table.by_context.insert(context_id, port);

        tracing::debug!(context_id = %context_id, port, "Leased camera port");
        Ok(port)
    }

    /// Frees the port held by `context_id`. Returns the port if one was held.
    pub fn release(&self, context_id: ContextId) -> Option<u16> {
        let mut table = self.table();
        let port = table.by_context.remove(&context_id)?;
        table.by_port.remove(&port);

        tracing::debug!(context_id = %context_id, port, "Released camera port");
        Some(port)
    }

    /// Port currently leased to `context_id`.
    pub fn lease_of(&self, context_id: ContextId) -> Option<u16> {
        self.table().by_context.get(&context_id).copied()
    }

    /// All live leases ordered by port.
    pub fn leases(&self) -> Vec<PortLease> {
        self.table()
            .by_port
            .iter()
            .map(|(port, context_id)| PortLease {
                port: *port,
                context_id: *context_id,
            })
            .collect()
    }

    /// Number of free ports.
    pub fn available(&self) -> usize {
        self.capacity() - self.table().by_port.len()
    }

    /// Total number of ports in the range.
    pub fn capacity(&self) -> usize {
        if self.range.is_empty() {
            0
        } else {
            usize::from(*self.range.end() - *self.range.start()) + 1
        }
    }

    /// The configured range.
    pub fn range(&self) -> RangeInclusive<u16> {
        self.range.clone()
    }
}
