//! One adaptive status loop per connected context.
//!
//! Each loop is an independent tokio task. It sleeps for the context's
//! cadence (or until woken by activity), then issues exactly one poll bounded
//! by the poll timeout. Results are written back through the registry, which
//! publishes the resulting events. Loops exit when their context is torn
//! down, when [`PollingCoordinator::stop`] is called, or when the registry no
//! longer knows the context.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use protocol::{ContextId, DeviceTransport, SessionHandle, TransportError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cadence::CadencePolicy;
use crate::config::PollingConfig;
use crate::error::{HubError, HubResult};
use crate::registry::ContextRegistry;

struct PollTask {
    cancel: CancellationToken,
    wake: Arc<Notify>,
    /// Set once a fatal device error parked the loop.
    parked: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    generation: u64,
}

impl PollTask {
    fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

type TaskTable = DashMap<ContextId, PollTask>;

/// Starts, stops and wakes per-context polling loops.
pub struct PollingCoordinator {
    registry: Arc<ContextRegistry>,
    transport: Arc<dyn DeviceTransport>,
    policy: CadencePolicy,
    poll_timeout: Duration,
    tasks: Arc<TaskTable>,
    generation: AtomicU64,
}

impl PollingCoordinator {
    pub fn new(
        registry: Arc<ContextRegistry>,
        transport: Arc<dyn DeviceTransport>,
        config: &PollingConfig,
    ) -> Self {
        Self {
            registry,
            transport,
            policy: CadencePolicy::from_config(config),
            poll_timeout: config.poll_timeout(),
            tasks: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Cadence policy used by every loop.
    pub fn policy(&self) -> &CadencePolicy {
        &self.policy
    }

    /// Starts polling a context.
    ///
    /// Idempotent while a loop for the context is running. Fails with
    /// `NotFound` for stale ids and `NoSession` for contexts without a
    /// transport session.
    pub async fn start(&self, id: ContextId) -> HubResult<()> {
        if self.is_polling(id) {
            return Ok(());
        }

        let target = self.registry.poll_target(id).await?;

        let entry = self.tasks.entry(id);
        if let Entry::Occupied(existing) = &entry {
            if existing.get().is_running() {
                return Ok(());
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let cancel = target.cancel.child_token();
        let wake = Arc::new(Notify::new());
        let parked = Arc::new(AtomicBool::new(false));

        let poll_loop = PollLoop {
            id,
            session: target.session,
            cadence: target.cadence,
            registry: Arc::clone(&self.registry),
            transport: Arc::clone(&self.transport),
            policy: self.policy.clone(),
            poll_timeout: self.poll_timeout,
            cancel: cancel.clone(),
            wake: Arc::clone(&wake),
            parked: Arc::clone(&parked),
        };
        let tasks = Arc::clone(&self.tasks);
        let handle = tokio::spawn(async move {
            poll_loop.run().await;
            tasks.remove_if(&id, |_, task| task.generation == generation);
        });

        let task = PollTask {
            cancel,
            wake,
            parked,
            handle,
            generation,
        };
        match entry {
            Entry::Occupied(mut stale) => {
                stale.insert(task);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(task);
            }
        }

        info!(context_id = %id, session = %target.session, "Started polling");
        Ok(())
    }

    /// Stops a context's loop and waits for it to exit. Returns whether a
    /// loop was running.
    pub async fn stop(&self, id: ContextId) -> bool {
        let Some((_, task)) = self.tasks.remove(&id) else {
            return false;
        };
        task.cancel.cancel();
        if let Err(err) = task.handle.await {
            warn!(context_id = %id, error = %err, "Polling task ended abnormally");
        }
        debug!(context_id = %id, "Stopped polling");
        true
    }

    /// Stops every loop.
    pub async fn stop_all(&self) {
        let ids: Vec<ContextId> = self.tasks.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.stop(id).await;
        }
    }

    /// Forces an immediate poll instead of waiting for the next tick.
    ///
    /// Activity that arrives while a poll is in flight triggers one more poll
    /// right after it. Fails with `Parked` for a loop stopped by a fatal
    /// device error.
    pub fn notify_activity(&self, id: ContextId) -> HubResult<()> {
        match self.tasks.get(&id) {
            Some(task) if task.parked.load(Ordering::Acquire) => Err(HubError::Parked(id)),
            Some(task) if task.is_running() => {
                task.wake.notify_one();
                Ok(())
            }
            _ => Err(HubError::NotFound(id)),
        }
    }

    /// Whether a loop is running for the context.
    pub fn is_polling(&self, id: ContextId) -> bool {
        self.tasks
            .get(&id)
            .map(|task| task.is_running())
            .unwrap_or(false)
    }

    /// Number of running loops.
    pub fn active_count(&self) -> usize {
        self.tasks.iter().filter(|task| task.is_running()).count()
    }
}

/// State owned by a single running loop.
struct PollLoop {
    id: ContextId,
    session: SessionHandle,
    cadence: Duration,
    registry: Arc<ContextRegistry>,
    transport: Arc<dyn DeviceTransport>,
    policy: CadencePolicy,
    poll_timeout: Duration,
    cancel: CancellationToken,
    wake: Arc<Notify>,
    parked: Arc<AtomicBool>,
}

enum PollResult {
    Snapshot(protocol::StatusSnapshot),
    Failed(String),
    Fatal(String),
}

impl PollLoop {
    async fn run(mut self) {
        let id = self.id;
        let mut failures = 0u32;
        let mut errored = false;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.wake.notified() => {
                    debug!(context_id = %id, "Polling early on activity");
                }
                _ = tokio::time::sleep(self.cadence) => {}
            }

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = self.poll_once() => result,
            };

            match result {
                PollResult::Snapshot(snapshot) => {
                    let cadence = self.policy.on_success(&snapshot);
                    match self.registry.update_status(id, snapshot, cadence).await {
                        Ok(sequence) => {
                            debug!(context_id = %id, sequence, cadence_ms = cadence.as_millis() as u64, "Polled status");
                            self.cadence = cadence;
                            failures = 0;
                            errored = false;
                        }
                        Err(_) => break,
                    }
                }
                PollResult::Failed(reason) => {
                    let cadence = self.policy.on_failure(self.cadence, failures + 1);
                    failures = match self.registry.record_failure(id, cadence).await {
                        Ok(failures) => failures,
                        Err(_) => break,
                    };
                    self.cadence = cadence;
                    warn!(context_id = %id, failures, reason = %reason, "Status poll failed");

                    if self.policy.is_error(failures) && !errored {
                        if self.registry.mark_error(id, reason, false).await.is_err() {
                            break;
                        }
                        errored = true;
                    }
                }
                PollResult::Fatal(reason) => {
                    warn!(context_id = %id, reason = %reason, "Device reported a fatal error; polling parked");
                    if self.registry.mark_error(id, reason, true).await.is_ok() {
                        self.parked.store(true, Ordering::Release);
                        self.cancel.cancelled().await;
                    }
                    break;
                }
            }
        }

        debug!(context_id = %id, "Polling loop exited");
    }

    async fn poll_once(&self) -> PollResult {
        match tokio::time::timeout(self.poll_timeout, self.transport.poll(self.session)).await {
            Ok(Ok(snapshot)) => PollResult::Snapshot(snapshot),
            Ok(Err(TransportError::Fatal(reason))) => PollResult::Fatal(reason),
            Ok(Err(err)) => PollResult::Failed(err.to_string()),
            Err(_) => PollResult::Failed(format!(
                "poll timed out after {} ms",
                self.poll_timeout.as_millis()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::ports::PortAllocator;
    use crate::registry::ContextSpec;
    use crate::test_support::{addr, MockTransport, PollStep};
    use protocol::{
        Capabilities, ConnectionState, DeviceAddress, DeviceType, HubEvent, StatusSnapshot,
    };

    struct Fixture {
        registry: Arc<ContextRegistry>,
        transport: Arc<MockTransport>,
        coordinator: PollingCoordinator,
        events: EventBus,
        shutdown: CancellationToken,
    }

    fn fixture() -> Fixture {
        let config = PollingConfig::default();
        let events = EventBus::with_capacity(1024);
        let shutdown = CancellationToken::new();
        let registry = Arc::new(ContextRegistry::new(
            Arc::new(PortAllocator::new(8181..=8190)),
            events.clone(),
            CadencePolicy::from_config(&config).initial(),
            shutdown.clone(),
        ));
        let transport = Arc::new(MockTransport::new());
        let coordinator = PollingCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&transport) as Arc<dyn DeviceTransport>,
            &config,
        );
        Fixture {
            registry,
            transport,
            coordinator,
            events,
            shutdown,
        }
    }

    impl Fixture {
        async fn connected(&self, address: &DeviceAddress) -> ContextId {
            let mut spec = ContextSpec::new(address.clone(), DeviceType::Legacy, Capabilities::none());
            spec.session = Some(self.transport.attach(address));
            let id = self.registry.register(spec).await.unwrap();
            self.registry
                .mark_connected(id, Capabilities::none())
                .await
                .unwrap();
            id
        }
    }

    /// Lets spawned loops run until they block on a timer.
    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_at_idle_cadence() {
        let fx = fixture();
        let a = addr("10.0.0.5");
        let id = fx.connected(&a).await;

        fx.coordinator.start(id).await.unwrap();
        assert!(fx.coordinator.is_polling(id));

        tokio::time::sleep(Duration::from_millis(2_900)).await;
        settle().await;
        assert_eq!(fx.transport.poll_count(&a), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        settle().await;
        assert_eq!(fx.transport.poll_count(&a), 1);

        let ctx = fx.registry.get(id).await.unwrap();
        assert_eq!(ctx.status_sequence, 1);
        assert_eq!(ctx.cadence, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_job_uses_fast_cadence() {
        let fx = fixture();
        let a = addr("10.0.0.5");
        fx.transport.on_poll(
            &a,
            (0..5).map(|i| PollStep::Reply(StatusSnapshot::printing("part.gcode", i as f32))),
        );
        let id = fx.connected(&a).await;
        fx.coordinator.start(id).await.unwrap();

        // First poll after the idle cadence, then every second.
        tokio::time::sleep(Duration::from_millis(3_100)).await;
        settle().await;
        tokio::time::sleep(Duration::from_millis(3_000)).await;
        settle().await;

        assert_eq!(fx.transport.poll_count(&a), 4);
        assert_eq!(
            fx.registry.get(id).await.unwrap().cadence,
            Duration::from_secs(1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent_and_rejects_stale_ids() {
        let fx = fixture();
        let id = fx.connected(&addr("10.0.0.5")).await;

        fx.coordinator.start(id).await.unwrap();
        fx.coordinator.start(id).await.unwrap();
        assert_eq!(fx.coordinator.active_count(), 1);

        let stale = ContextId::new();
        assert_eq!(
            fx.coordinator.start(stale).await.unwrap_err(),
            HubError::NotFound(stale)
        );
        assert_eq!(
            fx.coordinator.notify_activity(stale).unwrap_err(),
            HubError::NotFound(stale)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_failures_enter_error_then_recover() {
        let fx = fixture();
        let a = addr("10.0.0.5");
        fx.transport.on_poll(
            &a,
            [
                PollStep::Fail(TransportError::Transient("bad reply".into())),
                PollStep::Hang,
                PollStep::Fail(TransportError::Refused("reset".into())),
                PollStep::Reply(StatusSnapshot::idle()),
            ],
        );
        let id = fx.connected(&a).await;
        let mut rx = fx.events.subscribe();
        fx.coordinator.start(id).await.unwrap();

        // 3s idle, 4.5s backoff + 5s timeout, 6.75s backoff, then the error floor.
        tokio::time::sleep(Duration::from_millis(3_000 + 4_500 + 5_000 + 6_750 + 100)).await;
        settle().await;

        let ctx = fx.registry.get(id).await.unwrap();
        assert_eq!(ctx.consecutive_failures, 3);
        assert!(matches!(
            ctx.state,
            ConnectionState::Error { failures: 3, fatal: false, .. }
        ));
        assert_eq!(ctx.cadence, Duration::from_millis(10_125));
        assert!(fx.coordinator.is_polling(id));

        tokio::time::sleep(Duration::from_millis(10_200)).await;
        settle().await;

        let ctx = fx.registry.get(id).await.unwrap();
        assert_eq!(ctx.state, ConnectionState::Connected);
        assert_eq!(ctx.consecutive_failures, 0);
        assert_eq!(ctx.cadence, Duration::from_secs(3));
        assert_eq!(ctx.status_sequence, 1);

        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let HubEvent::ConnectionStateChanged { state, .. } = event {
                states.push(state);
            }
        }
        assert_eq!(states.len(), 2, "error entered once, recovered once");
        assert!(states[0].is_error());
        assert_eq!(states[1], ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_parks_loop() {
        let fx = fixture();
        let a = addr("10.0.0.5");
        fx.transport
            .on_poll(&a, [PollStep::Fail(TransportError::Fatal("nozzle fault".into()))]);
        let id = fx.connected(&a).await;
        fx.coordinator.start(id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(3_100)).await;
        settle().await;
        assert!(matches!(
            fx.registry.get(id).await.unwrap().state,
            ConnectionState::Error { fatal: true, .. }
        ));

        tokio::time::sleep(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(fx.transport.poll_count(&a), 1);
        assert!(fx.coordinator.is_polling(id));

        let err = fx.coordinator.notify_activity(id).unwrap_err();
        assert_eq!(err, HubError::Parked(id));
        assert_eq!(err.kind(), protocol::ErrorKind::FatalDeviceError);
        settle().await;
        assert_eq!(fx.transport.poll_count(&a), 1);

        fx.registry.teardown(id).await;
        settle().await;
        assert!(!fx.coordinator.is_polling(id));
        assert_eq!(fx.coordinator.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_context_does_not_disturb_others() {
        let fx = fixture();
        let bad = addr("10.0.0.5");
        let good = addr("10.0.0.6");
        fx.transport.on_poll(
            &bad,
            (0..10).map(|_| PollStep::Fail(TransportError::Transient("garbled".into()))),
        );
        let bad_id = fx.connected(&bad).await;
        let good_id = fx.connected(&good).await;
        fx.coordinator.start(bad_id).await.unwrap();
        fx.coordinator.start(good_id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30_100)).await;
        settle().await;

        assert_eq!(fx.transport.poll_count(&good), 10);
        let good_ctx = fx.registry.get(good_id).await.unwrap();
        assert_eq!(good_ctx.state, ConnectionState::Connected);
        assert_eq!(good_ctx.status_sequence, 10);
        assert!(fx.registry.get(bad_id).await.unwrap().state.is_error());
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_activity_polls_immediately() {
        let fx = fixture();
        let a = addr("10.0.0.5");
        let id = fx.connected(&a).await;
        fx.coordinator.start(id).await.unwrap();
        settle().await;

        fx.coordinator.notify_activity(id).unwrap();
        settle().await;
        assert_eq!(fx.transport.poll_count(&a), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_stops_loop_without_further_polls() {
        let fx = fixture();
        let a = addr("10.0.0.5");
        let id = fx.connected(&a).await;
        fx.coordinator.start(id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(3_100)).await;
        settle().await;
        fx.registry.teardown(id).await;
        settle().await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(fx.transport.poll_count(&a), 1);
        assert!(!fx.coordinator.is_polling(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_and_restart() {
        let fx = fixture();
        let id = fx.connected(&addr("10.0.0.5")).await;
        fx.coordinator.start(id).await.unwrap();

        assert!(fx.coordinator.stop(id).await);
        assert!(!fx.coordinator.stop(id).await);
        assert!(!fx.coordinator.is_polling(id));

        fx.coordinator.start(id).await.unwrap();
        assert!(fx.coordinator.is_polling(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_token_stops_everything() {
        let fx = fixture();
        let a = fx.connected(&addr("10.0.0.5")).await;
        let b = fx.connected(&addr("10.0.0.6")).await;
        fx.coordinator.start(a).await.unwrap();
        fx.coordinator.start(b).await.unwrap();
        assert_eq!(fx.coordinator.active_count(), 2);

        fx.shutdown.cancel();
        settle().await;
        assert_eq!(fx.coordinator.active_count(), 0);

        fx.coordinator.stop_all().await;
        assert!(!fx.coordinator.is_polling(a));
    }
}
