//! Multi-pass network discovery.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use protocol::{DeviceAddress, DeviceTransport, DiscoveredDevice};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::DiscoveryConfig;
use crate::error::{HubError, HubResult};

/// Extra time a pass gets beyond its window before it counts as hung.
const PASS_GRACE: Duration = Duration::from_millis(500);

/// A bounded discovery scan.
///
/// Runs up to `passes` transport scans, each bounded by the pass timeout,
/// and starts no new pass once the overall timeout has elapsed. A failed
/// pass is logged and the next one runs; the scan fails only if no pass
/// completed.
pub(crate) struct DiscoveryScan {
    transport: Arc<dyn DeviceTransport>,
    passes: u32,
    pass_timeout: Duration,
    overall_timeout: Duration,
}

impl DiscoveryScan {
    pub(crate) fn new(transport: Arc<dyn DeviceTransport>, config: &DiscoveryConfig) -> Self {
        Self {
            transport,
            passes: config.passes.max(1),
            pass_timeout: config.pass_timeout(),
            overall_timeout: config.overall_timeout(),
        }
    }

    /// Runs the scan, handing each newly seen device to `on_candidate`.
    /// Returns the number of distinct devices found.
    pub(crate) async fn run<F>(&self, mut on_candidate: F) -> HubResult<usize>
    where
        F: FnMut(DiscoveredDevice),
    {
        let deadline = Instant::now() + self.overall_timeout;
        let mut seen: HashSet<DeviceAddress> = HashSet::new();
        let mut completed = 0u32;
        let mut last_error = None;

        for pass in 1..=self.passes {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!(pass, "Discovery deadline reached");
                break;
            }
            let window = self.pass_timeout.min(remaining);

            match tokio::time::timeout(window + PASS_GRACE, self.transport.discover(window)).await {
                Ok(Ok(devices)) => {
                    completed += 1;
                    let before = seen.len();
                    for device in devices {
                        if seen.insert(device.address.clone()) {
                            on_candidate(device);
                        }
                    }
                    debug!(pass, new = seen.len() - before, total = seen.len(), "Discovery pass finished");
                }
                Ok(Err(err)) => {
                    warn!(pass, error = %err, "Discovery pass failed");
                    last_error = Some(err.to_string());
                }
                Err(_) => {
                    warn!(pass, window_ms = window.as_millis() as u64, "Discovery pass hung");
                    last_error = Some(format!("pass {pass} did not finish"));
                }
            }
        }

        if completed == 0 {
            return Err(HubError::DiscoveryFailed(
                last_error.unwrap_or_else(|| "no discovery pass ran".to_string()),
            ));
        }
        Ok(seen.len())
    }
}
