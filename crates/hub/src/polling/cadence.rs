//! Adaptive poll cadence.

use std::time::Duration;

use protocol::StatusSnapshot;

use crate::config::PollingConfig;

/// Computes the delay before the next poll of a context.
///
/// Printers running a job are polled at the active cadence, idle printers at
/// the idle cadence. Failed polls stretch the current cadence by the backoff
/// multiplier, and once the failure threshold is reached the cadence never
/// drops below the error cadence. Nothing ever exceeds the max cadence.
#[derive(Debug, Clone, PartialEq)]
pub struct CadencePolicy {
    active: Duration,
    idle: Duration,
    error: Duration,
    max: Duration,
    multiplier: f64,
    threshold: u32,
}

impl CadencePolicy {
    pub fn from_config(config: &PollingConfig) -> Self {
        Self {
            active: config.active_interval(),
            idle: config.idle_interval(),
            error: config.error_interval(),
            max: config.max_interval(),
            multiplier: config.backoff_multiplier,
            threshold: config.failure_threshold.max(1),
        }
    }

    /// Cadence a freshly connected context starts with.
    pub fn initial(&self) -> Duration {
        self.idle
    }

    /// Cadence after a successful poll.
    pub fn on_success(&self, snapshot: &StatusSnapshot) -> Duration {
        let next = if snapshot.is_job_active() {
            self.active
        } else {
            self.idle
        };
        next.min(self.max)
    }

    /// Cadence after the `failures`-th consecutive failed poll.
    pub fn on_failure(&self, current: Duration, failures: u32) -> Duration {
        let stretched = Duration::try_from_secs_f64(current.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max);

        let next = if self.is_error(failures) {
            stretched.max(self.error)
        } else {
            stretched
        };
        next.min(self.max)
    }

    /// Whether `failures` consecutive failures put a context in the error state.
    pub fn is_error(&self, failures: u32) -> bool {
        failures >= self.threshold
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

impl Default for CadencePolicy {
    fn default() -> Self {
        Self::from_config(&PollingConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    #[test]
    fn test_success_cadence_follows_job_state() {
        let policy = CadencePolicy::default();
        assert_eq!(policy.on_success(&StatusSnapshot::idle()), secs(3.0));
        assert_eq!(
            policy.on_success(&StatusSnapshot::printing("benchy.gcode", 12.0)),
            secs(1.0)
        );
        assert_eq!(policy.initial(), secs(3.0));
    }

    #[test]
    fn test_failures_back_off_then_floor_at_error_cadence() {
        let policy = CadencePolicy::default();

        let first = policy.on_failure(secs(3.0), 1);
        assert_eq!(first, secs(4.5));
        assert!(!policy.is_error(1));

        let second = policy.on_failure(first, 2);
        assert_eq!(second, secs(6.75));

        let third = policy.on_failure(second, 3);
        assert!(policy.is_error(3));
        assert_eq!(third, secs(10.125));
    }

    #[test]
    fn test_error_cadence_is_a_floor() {
        let policy = CadencePolicy::default();
        assert_eq!(policy.on_failure(secs(1.0), 3), secs(10.0));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = CadencePolicy::default();
        assert_eq!(policy.on_failure(secs(25.0), 8), secs(30.0));
        assert_eq!(policy.on_failure(secs(30.0), 9), secs(30.0));
    }

    #[test]
    fn test_custom_config() {
        let config = PollingConfig {
            active_interval_ms: 200,
            idle_interval_ms: 500,
            error_interval_ms: 2_000,
            max_interval_ms: 4_000,
            backoff_multiplier: 2.0,
            failure_threshold: 1,
            poll_timeout_ms: 1_000,
        };
        let policy = CadencePolicy::from_config(&config);
        assert_eq!(policy.threshold(), 1);
        assert_eq!(policy.on_failure(secs(0.5), 1), secs(2.0));
        assert_eq!(policy.on_failure(secs(3.0), 2), secs(4.0));
    }
}
