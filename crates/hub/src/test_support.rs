//! Scripted transport shared by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use protocol::{
    Capabilities, CheckCode, DeviceAddress, DeviceSession, DeviceTransport, DeviceType,
    DiscoveredDevice, SessionHandle, StatusSnapshot, TransportError,
};

/// How a scripted connect behaves.
#[derive(Clone)]
pub enum ConnectStep {
    Succeed(Capabilities),
    Fail(TransportError),
    /// Never completes.
    Hang,
}

/// How a scripted poll behaves.
#[derive(Clone)]
pub enum PollStep {
    Reply(StatusSnapshot),
    Fail(TransportError),
    /// Never completes.
    Hang,
}

#[derive(Default)]
struct Script {
    connects: HashMap<DeviceAddress, ConnectStep>,
    polls: HashMap<DeviceAddress, VecDeque<PollStep>>,
    discovery: VecDeque<Result<Vec<DiscoveredDevice>, TransportError>>,
    sessions: HashMap<SessionHandle, DeviceAddress>,
    poll_counts: HashMap<DeviceAddress, usize>,
    disconnected: Vec<SessionHandle>,
    connect_attempts: usize,
    discovery_windows: Vec<Duration>,
}

/// A transport whose every answer is scripted per address.
///
/// Unscripted connects succeed with no capabilities, unscripted polls reply
/// with an idle snapshot and unscripted discovery passes find nothing.
#[derive(Default)]
pub struct MockTransport {
    next_handle: AtomicU64,
    script: Mutex<Script>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connect(&self, address: &DeviceAddress, step: ConnectStep) {
        self.script
            .lock()
            .unwrap()
            .connects
            .insert(address.clone(), step);
    }

    pub fn on_poll(&self, address: &DeviceAddress, steps: impl IntoIterator<Item = PollStep>) {
        self.script
            .lock()
            .unwrap()
            .polls
            .entry(address.clone())
            .or_default()
            .extend(steps);
    }

    pub fn on_discover(&self, pass: Result<Vec<DiscoveredDevice>, TransportError>) {
        self.script.lock().unwrap().discovery.push_back(pass);
    }

    /// Opens a session without going through `connect`.
    pub fn attach(&self, address: &DeviceAddress) -> SessionHandle {
        let handle = SessionHandle::new(self.next_handle.fetch_add(1, Ordering::SeqCst) + 1);
        self.script
            .lock()
            .unwrap()
            .sessions
            .insert(handle, address.clone());
        handle
    }

    pub fn poll_count(&self, address: &DeviceAddress) -> usize {
        self.script
            .lock()
            .unwrap()
            .poll_counts
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    pub fn disconnected(&self) -> Vec<SessionHandle> {
        self.script.lock().unwrap().disconnected.clone()
    }

    pub fn connect_attempts(&self) -> usize {
        self.script.lock().unwrap().connect_attempts
    }

    pub fn discovery_windows(&self) -> Vec<Duration> {
        self.script.lock().unwrap().discovery_windows.clone()
    }
}

impl DeviceTransport for MockTransport {
    fn connect<'a>(
        &'a self,
        address: &'a DeviceAddress,
        device_type: DeviceType,
        check_code: Option<&'a CheckCode>,
    ) -> BoxFuture<'a, Result<DeviceSession, TransportError>> {
        let step = {
            let mut script = self.script.lock().unwrap();
            script.connect_attempts += 1;
            script
                .connects
                .get(address)
                .cloned()
                .unwrap_or(ConnectStep::Succeed(Capabilities::none()))
        };

        async move {
            if device_type.requires_check_code() && check_code.is_none() {
                return Err(TransportError::InvalidCheckCode);
            }
            match step {
                ConnectStep::Succeed(capabilities) => Ok(DeviceSession {
                    handle: self.attach(address),
                    capabilities,
                    name: Some(format!("printer@{address}")),
                }),
                ConnectStep::Fail(err) => Err(err),
                ConnectStep::Hang => std::future::pending().await,
            }
        }
        .boxed()
    }

    fn poll(&self, handle: SessionHandle) -> BoxFuture<'_, Result<StatusSnapshot, TransportError>> {
        let step = {
            let mut script = self.script.lock().unwrap();
            match script.sessions.get(&handle).cloned() {
                Some(address) => {
                    *script.poll_counts.entry(address.clone()).or_default() += 1;
                    script
                        .polls
                        .get_mut(&address)
                        .and_then(VecDeque::pop_front)
                        .unwrap_or(PollStep::Reply(StatusSnapshot::idle()))
                }
                None => PollStep::Fail(TransportError::Fatal("unknown session".into())),
            }
        };

        async move {
            match step {
                PollStep::Reply(snapshot) => Ok(snapshot),
                PollStep::Fail(err) => Err(err),
                PollStep::Hang => std::future::pending().await,
            }
        }
        .boxed()
    }

    fn disconnect(&self, handle: SessionHandle) -> BoxFuture<'_, ()> {
        let mut script = self.script.lock().unwrap();
        script.sessions.remove(&handle);
        script.disconnected.push(handle);
        async {}.boxed()
    }

    fn discover(
        &self,
        window: Duration,
    ) -> BoxFuture<'_, Result<Vec<DiscoveredDevice>, TransportError>> {
        let pass = {
            let mut script = self.script.lock().unwrap();
            script.discovery_windows.push(window);
            script.discovery.pop_front().unwrap_or_else(|| Ok(Vec::new()))
        };
        async move { pass }.boxed()
    }
}

pub fn addr(raw: &str) -> DeviceAddress {
    DeviceAddress::parse(raw).unwrap()
}
