use std::sync::{Arc, Mutex};
use async_trait::async_trait;

use crate::device::adapter::{AdapterHandle, AdapterState};
use crate::device::events::{InboundSender, SessionToken};
use crate::device::types::{CharacteristicRef, PeripheralDescriptor};

#[derive(Debug, Clone, Default)]
pub struct Calls {
    pub start_scan: Vec<SessionToken>,
    pub stop_scan: usize,
    pub connect: Vec<(SessionToken, PeripheralDescriptor)>,
    pub discover_services: Vec<SessionToken>,
    pub enable_notifications: Vec<(SessionToken, CharacteristicRef)>,
    pub disconnect: usize,
}

/// Records every request and never reports anything; tests inject the platform's answers.
#[derive(Clone)]
pub struct FakeAdapter {
    state: AdapterState,
    calls: Arc<Mutex<Calls>>,
    events: Arc<Mutex<Option<InboundSender>>>,
}

impl Default for FakeAdapter {
    fn default() -> Self {
        FakeAdapter { state: AdapterState::Enabled, calls: Arc::default(), events: Arc::default() }
    }
}

impl FakeAdapter {
    pub fn disabled() -> Self {
        FakeAdapter { state: AdapterState::Disabled, ..FakeAdapter::default() }
    }

    pub fn calls(&self) -> Calls {
        self.calls.lock().unwrap().clone()
    }

    /// The channel handed to the most recent request, for answering as the platform would.
    pub fn events(&self) -> InboundSender {
        self.events.lock().unwrap().clone().expect("no request has been made yet")
    }

    fn keep(&self, events: InboundSender) {
        *self.events.lock().unwrap() = Some(events);
    }
}

#[async_trait]
impl AdapterHandle for FakeAdapter {
    async fn state(&self) -> AdapterState {
        self.state
    }

    fn start_scan(&self, session: SessionToken, events: InboundSender) {
        self.keep(events);
        self.calls.lock().unwrap().start_scan.push(session);
    }

    fn stop_scan(&self) {
        self.calls.lock().unwrap().stop_scan += 1;
    }

    fn connect(&self, session: SessionToken, peripheral: &PeripheralDescriptor, events: InboundSender) {
        self.keep(events);
        self.calls.lock().unwrap().connect.push((session, peripheral.clone()));
    }

    fn discover_services(&self, session: SessionToken, events: InboundSender) {
        self.keep(events);
        self.calls.lock().unwrap().discover_services.push(session);
    }

    fn enable_notifications(&self, session: SessionToken, characteristic: CharacteristicRef, events: InboundSender) {
        self.keep(events);
        self.calls.lock().unwrap().enable_notifications.push((session, characteristic));
    }

    fn disconnect(&self) {
        self.calls.lock().unwrap().disconnect += 1;
    }
}
