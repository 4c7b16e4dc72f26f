use std::sync::Arc;
use futures::{StreamExt, SinkExt};
use futures::channel::mpsc::{channel, Sender};
use futures::channel::oneshot;
use log::{debug, info, warn};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio::time::{sleep, Duration};

use crate::device::adapter::AdapterHandle;
use crate::device::constants::{ANGLE_CHARACTERISTIC, ANGLE_SERVICE, CHANNEL_CAPACITY, DISCOVERY_GRACE, SCAN_TIMEOUT};
use crate::device::decoder::TelemetryDecoder;
use crate::device::events::{
    CharacteristicChangedEvent, DiscoveryEvent, InboundEvent, InboundSender, PlatformConnection, SessionToken,
};
use crate::device::resolver::ServiceResolver;
use crate::device::scan::ScanController;
use crate::device::sink::EventSink;
use crate::device::types::{
    CharacteristicRef, CharacteristicTarget, ConnectionState, MatchStrategy, PayloadLayout, PeripheralDescriptor,
    ServiceInfo, Trigger,
};
use crate::error::LinkError;

/// Everything the link needs to know up front; read-only once the link is running.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub name_match: MatchStrategy,
    pub target: CharacteristicTarget,
    pub layout: PayloadLayout,
    /// Delay between the platform reporting a connection and asking it for services.
    pub discovery_grace: Duration,
    pub scan_timeout: Option<Duration>,
    /// Connect as soon as the scan finds the peripheral.
    pub auto_connect: bool,
}

impl Default for LinkSettings {
    fn default() -> Self {
        LinkSettings {
            name_match: MatchStrategy::Exact,
            target: CharacteristicTarget::new(ANGLE_SERVICE, ANGLE_CHARACTERISTIC, MatchStrategy::Exact),
            layout: PayloadLayout::Int32,
            discovery_grace: Duration::from_millis(DISCOVERY_GRACE),
            scan_timeout: Some(Duration::from_millis(SCAN_TIMEOUT)),
            auto_connect: true,
        }
    }
}

/// Sole owner of the `ConnectionState`. Not shared: the link task drives it, or a test does.
pub struct ConnectionManager {
    adapter: Option<Arc<dyn AdapterHandle>>,
    settings: LinkSettings,
    state: ConnectionState,
    session: SessionToken,
    scan: ScanController,
    resolver: ServiceResolver,
    decoder: TelemetryDecoder,
    peripheral: Option<PeripheralDescriptor>,
    armed: Option<CharacteristicRef>,
    events: InboundSender,
    sink: Box<dyn EventSink>,
}

impl ConnectionManager {
    pub fn new(
        adapter: Option<Arc<dyn AdapterHandle>>,
        settings: LinkSettings,
        sink: Box<dyn EventSink>,
        events: InboundSender,
    ) -> Self {
        ConnectionManager {
            adapter,
            scan: ScanController::new(settings.name_match),
            resolver: ServiceResolver::new(settings.target.clone()),
            decoder: TelemetryDecoder::new(settings.layout),
            settings,
            state: ConnectionState::Idle,
            session: SessionToken::default(),
            peripheral: None,
            armed: None,
            events,
            sink,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session(&self) -> SessionToken {
        self.session
    }

    pub fn peripheral(&self) -> Option<&PeripheralDescriptor> {
        self.peripheral.as_ref()
    }

    pub async fn start_scan(&mut self, name_filter: &str) -> Result<(), LinkError> {
        let result = self.try_start_scan(name_filter).await;
        if let Err(err) = &result {
            self.report(err);
        }
        result
    }

    async fn try_start_scan(&mut self, name_filter: &str) -> Result<(), LinkError> {
        if self.state.next(Trigger::StartScan).is_none() {
            return Err(LinkError::InvalidStateTransition { from: self.state, operation: "StartScan" });
        }

        let session = self.session.next();
        self.scan.start(self.adapter.as_deref(), name_filter, session, self.events.clone()).await?;

        self.session = session;
        self.peripheral = None;
        self.armed = None;
        self.transition(Trigger::StartScan);

        if let Some(timeout) = self.settings.scan_timeout {
            self.schedule(timeout, InboundEvent::ScanDeadline { session });
        }

        Ok(())
    }

    /// Only valid from `Found`. Returns once the platform has been asked to connect.
    pub fn connect(&mut self, peripheral: PeripheralDescriptor) -> Result<(), LinkError> {
        let result = self.try_connect(peripheral);
        if let Err(err) = &result {
            self.report(err);
        }
        result
    }

    fn try_connect(&mut self, peripheral: PeripheralDescriptor) -> Result<(), LinkError> {
        if self.state == ConnectionState::Connecting {
            return Err(LinkError::ConnectionAlreadyInProgress);
        }

        if self.state.next(Trigger::Connect).is_none() {
            return Err(LinkError::InvalidStateTransition { from: self.state, operation: "Connect" });
        }

        let adapter = self.adapter.clone().ok_or(LinkError::AdapterUnavailable)?;

        self.scan.stop(adapter.as_ref());
        info!("Connecting to peripheral {}...", peripheral);
        adapter.connect(self.session, &peripheral, self.events.clone());

        self.peripheral = Some(peripheral);
        self.resolver.reset();
        self.transition(Trigger::Connect);
        Ok(())
    }

    /// Safe from any state. Whatever the platform still reports for the old session is dropped.
    pub fn teardown(&mut self) {
        if let Some(adapter) = self.adapter.clone() {
            self.scan.stop(adapter.as_ref());

            if self.state.holds_connection() {
                adapter.disconnect();
            }
        }

        info!("Tearing down session {}", self.session);
        self.armed = None;
        self.session = self.session.next();
        self.transition(Trigger::Teardown);
    }

    pub fn handle_event(&mut self, event: InboundEvent) {
        if event.session() != self.session {
            debug!("Discarding event of stale session {} (current {}): {:?}", event.session(), self.session, event);
            return;
        }

        match event {
            InboundEvent::Discovery(event) => self.on_discovery(event),
            InboundEvent::ScanFailed { detail, .. } => self.on_scan_failed(detail),
            InboundEvent::ScanDeadline { .. } => self.on_scan_deadline(),
            InboundEvent::ConnectionState(event) => self.on_platform_connection(event.change),
            InboundEvent::GraceElapsed { .. } => self.discover_services(),
            InboundEvent::ServicesDiscovered(event) => self.on_services_discovered(event.result),
            InboundEvent::NotificationsArmed { result, .. } => self.on_notifications_armed(result),
            InboundEvent::CharacteristicChanged(event) => self.on_characteristic_changed(event),
        }
    }

    fn on_discovery(&mut self, event: DiscoveryEvent) {
        if self.state != ConnectionState::Scanning {
            debug!("Ignoring discovery of {} while {:?}", event.peripheral, self.state);
            return;
        }

        let Some(adapter) = self.adapter.clone() else { return };

        if let Some(peripheral) = self.scan.on_discovery(adapter.as_ref(), &event) {
            self.peripheral = Some(peripheral.clone());
            self.transition(Trigger::PeripheralFound);

            if self.settings.auto_connect {
                if let Err(err) = self.connect(peripheral) {
                    debug!("Automatic connect was refused: {}", err);
                }
            }
        }
    }

    fn on_scan_failed(&mut self, detail: String) {
        if self.state != ConnectionState::Scanning {
            debug!("Ignoring scan failure while {:?}: {}", self.state, detail);
            return;
        }

        self.scan.abandon();
        self.fail(Trigger::ScanFailed, LinkError::ScanFailed { detail });
    }

    fn on_scan_deadline(&mut self) {
        if self.state != ConnectionState::Scanning {
            return;
        }

        if let Some(adapter) = self.adapter.clone() {
            self.scan.stop(adapter.as_ref());
        }

        let name_filter = self.scan.name_filter().unwrap_or_default().to_string();
        self.fail(Trigger::ScanTimedOut, LinkError::ScanTimeout { name_filter });
    }

    fn on_platform_connection(&mut self, change: PlatformConnection) {
        match (self.state, change) {
            (ConnectionState::Connecting, PlatformConnection::Connected) => {
                info!("Connected; Discovering services...");
                self.transition(Trigger::PlatformConnected);

                if self.settings.discovery_grace.is_zero() {
                    self.discover_services();
                } else {
                    self.schedule(self.settings.discovery_grace, InboundEvent::GraceElapsed { session: self.session });
                }
            },
            (ConnectionState::Connecting, PlatformConnection::ConnectFailed(detail)) => {
                self.fail(Trigger::PlatformConnectFailed, self.connect_failed(detail));
            },
            (ConnectionState::Connecting, PlatformConnection::Disconnected) => {
                let err = self.connect_failed("disconnected while connecting".to_string());
                self.fail(Trigger::PlatformConnectFailed, err);
            },
            (state, PlatformConnection::Disconnected) if state.next(Trigger::PlatformDisconnected).is_some() => {
                warn!("Connection lost");
                if let Some(adapter) = &self.adapter {
                    adapter.disconnect();
                }
                self.armed = None;
                self.session = self.session.next();
                self.transition(Trigger::PlatformDisconnected);
            },
            (state, change) => {
                debug!("Ignoring platform connection change {:?} while {:?}", change, state);
            },
        }
    }

    fn connect_failed(&self, detail: String) -> LinkError {
        LinkError::PlatformConnectFailed {
            address: self.peripheral.as_ref().map(|p| p.address.clone()).unwrap_or_default(),
            detail,
        }
    }

    fn discover_services(&mut self) {
        if self.state != ConnectionState::Connected {
            debug!("Not discovering services while {:?}", self.state);
            return;
        }

        if let Some(adapter) = &self.adapter {
            adapter.discover_services(self.session, self.events.clone());
        }
    }

    fn on_services_discovered(&mut self, result: Result<Vec<ServiceInfo>, String>) {
        if self.state != ConnectionState::Connected {
            debug!("Ignoring discovered services while {:?}", self.state);
            return;
        }

        let services = match result {
            Ok(services) => services,
            Err(detail) => {
                self.fail(Trigger::ServiceDiscoveryFailed, LinkError::ServiceDiscoveryFailed { detail });
                return;
            },
        };

        info!("Discovered {} services", services.len());
        self.transition(Trigger::ServicesDiscovered);

        let Some(adapter) = self.adapter.clone() else { return };

        match self.resolver.resolve_and_subscribe(&services, adapter.as_ref(), self.session, self.events.clone()) {
            Ok(characteristic) => self.armed = Some(characteristic),
            Err(err @ LinkError::DescriptorNotFound { .. }) => {
                // still connected; the characteristic can be read, it just never notifies
                self.report(&err);
            },
            Err(err) => self.fail(Trigger::ResolveFailed, err),
        }
    }

    fn on_notifications_armed(&mut self, result: Result<(), String>) {
        if self.state != ConnectionState::ResolvingServices {
            debug!("Ignoring subscription result while {:?}", self.state);
            return;
        }

        match result {
            Ok(()) => {
                info!("Peripheral ready");
                self.transition(Trigger::NotificationsArmed);
            },
            Err(detail) => {
                let characteristic = self.armed.map(|c| c.characteristic.to_string()).unwrap_or_default();
                self.fail(Trigger::ResolveFailed, LinkError::SubscribeFailed { characteristic, detail });
            },
        }
    }

    fn on_characteristic_changed(&mut self, event: CharacteristicChangedEvent) {
        if !matches!(self.state, ConnectionState::NotificationsEnabled | ConnectionState::Streaming) {
            debug!("Ignoring notification while {:?}", self.state);
            return;
        }

        if self.armed.map(|c| c.characteristic) != Some(event.characteristic) {
            debug!("Ignoring notification from characteristic {}", event.characteristic);
            return;
        }

        if self.state == ConnectionState::NotificationsEnabled {
            self.transition(Trigger::FirstNotification);
        }

        match self.decoder.decode_at(&event.value, event.received_at) {
            Ok(sample) => self.sink.on_sample(sample),
            // one bad payload never ends the session
            Err(err) => self.report(&LinkError::from(err)),
        }
    }

    /// Report, enter the terminal state and make the rest of this session stale.
    fn fail(&mut self, trigger: Trigger, err: LinkError) {
        self.report(&err);

        if let Some(adapter) = &self.adapter {
            if self.state.holds_connection() {
                adapter.disconnect();
            }
        }

        self.armed = None;
        self.session = self.session.next();
        self.transition(trigger);
    }

    fn report(&mut self, err: &LinkError) {
        warn!("{}", err);
        self.sink.on_error(err.kind(), &err.to_string());
    }

    fn transition(&mut self, trigger: Trigger) -> bool {
        let Some(next) = self.state.next(trigger) else {
            debug!("{:?} is not valid while {:?}", trigger, self.state);
            return false;
        };

        if next != self.state {
            debug!("{:?} --{:?}--> {:?}", self.state, trigger, next);
            self.state = next;
            self.sink.on_state_change(next);
            self.sink.on_status(&next.to_string());
        }

        true
    }

    fn schedule(&self, delay: Duration, event: InboundEvent) {
        let mut events = self.events.clone();

        spawn(async move {
            sleep(delay).await;
            if events.send(event).await.is_err() {
                debug!("Link task is gone, dropping timer event");
            }
        });
    }

    async fn execute(&mut self, command: Command) {
        match command {
            Command::StartScan { name_filter, reply } => {
                let result = self.start_scan(&name_filter).await;
                let _ = reply.send(result);
            },
            Command::Connect { peripheral, reply } => {
                let _ = reply.send(self.connect(peripheral));
            },
            Command::Teardown { reply } => {
                self.teardown();
                let _ = reply.send(());
            },
            Command::State { reply } => {
                let _ = reply.send(self.state);
            },
        }
    }
}

#[derive(Debug)]
enum Command {
    StartScan { name_filter: String, reply: oneshot::Sender<Result<(), LinkError>> },
    Connect { peripheral: PeripheralDescriptor, reply: oneshot::Sender<Result<(), LinkError>> },
    Teardown { reply: oneshot::Sender<()> },
    State { reply: oneshot::Sender<ConnectionState> },
}

/// Cloneable front end of a running link task.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    commands: Sender<Command>,
}

impl LinkHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, LinkError> {
        let (reply, response) = oneshot::channel();

        self.commands.clone().send(command(reply)).await.map_err(|_| LinkError::ChannelClosed)?;
        response.await.map_err(|_| LinkError::ChannelClosed)
    }

    pub async fn start_scan(&self, name_filter: impl Into<String>) -> Result<(), LinkError> {
        let name_filter = name_filter.into();
        self.request(|reply| Command::StartScan { name_filter, reply }).await?
    }

    pub async fn connect(&self, peripheral: PeripheralDescriptor) -> Result<(), LinkError> {
        self.request(|reply| Command::Connect { peripheral, reply }).await?
    }

    pub async fn teardown(&self) -> Result<(), LinkError> {
        self.request(|reply| Command::Teardown { reply }).await
    }

    pub async fn state(&self) -> Result<ConnectionState, LinkError> {
        self.request(|reply| Command::State { reply }).await
    }
}

/// Spawn the task owning the link. Platform callbacks and commands are serialized through it;
/// cancelling `cancel` tears the link down and ends the task.
pub fn spawn_link(
    adapter: Option<Arc<dyn AdapterHandle>>,
    settings: LinkSettings,
    sink: Box<dyn EventSink>,
    cancel: CancellationToken,
) -> (LinkHandle, JoinHandle<()>) {
    let (command_sender, mut command_receiver) = channel::<Command>(CHANNEL_CAPACITY);
    let (event_sender, mut event_receiver) = channel::<InboundEvent>(CHANNEL_CAPACITY);
    let mut manager = ConnectionManager::new(adapter, settings, sink, event_sender);

    let handle = spawn(async move {
        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    manager.teardown();
                    break 'mainloop;
                },
                command = command_receiver.next() => {
                    match command {
                        Some(command) => manager.execute(command).await,
                        None => {
                            manager.teardown();
                            break 'mainloop;
                        },
                    }
                },
                Some(event) = event_receiver.next() => {
                    manager.handle_event(event);
                },
            }
        }

        info!("Link task stopped");
    });

    (LinkHandle { commands: command_sender }, handle)
}
