use std::sync::Arc;
use futures::StreamExt;
use futures::channel::mpsc::{unbounded, UnboundedReceiver};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

use gcs_compass::device::adapter::AdapterHandle;
use gcs_compass::device::connection::{spawn_link, LinkHandle, LinkSettings};
use gcs_compass::device::constants::DEFAULT_DEVICE_NAME;
use gcs_compass::device::simulated::{SimulatedAdapter, SimulatedPeripheral};
use gcs_compass::device::sink::ChannelSink;
use gcs_compass::device::supervisor::{supervise, RescanPolicy, SupervisorExit};
use gcs_compass::device::types::{
    CharacteristicTarget, CompassDirection, ConnectionState, DeviceEvent, MatchStrategy, PayloadLayout, TelemetrySample,
};
use gcs_compass::error::{ErrorKind, LinkError};

const WAIT: Duration = Duration::from_secs(5);

fn board(layout: PayloadLayout) -> SimulatedPeripheral {
    SimulatedPeripheral {
        layout,
        advertise_interval: Duration::from_millis(5),
        connect_delay: Duration::from_millis(5),
        notify_interval: Duration::from_millis(10),
        ..SimulatedPeripheral::default()
    }
}

fn settings() -> LinkSettings {
    LinkSettings {
        discovery_grace: Duration::from_millis(10),
        scan_timeout: Some(Duration::from_secs(2)),
        ..LinkSettings::default()
    }
}

struct Link {
    adapter: Arc<SimulatedAdapter>,
    handle: LinkHandle,
    events: UnboundedReceiver<DeviceEvent>,
    supervisor_events: Option<UnboundedReceiver<DeviceEvent>>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

fn start(adapter: SimulatedAdapter, settings: LinkSettings) -> Link {
    let adapter = Arc::new(adapter);
    let (sender, events) = unbounded();
    let (supervisor_sender, supervisor_events) = unbounded();
    let sink = Box::new(ChannelSink::new(vec![sender, supervisor_sender]));
    let cancel = CancellationToken::new();
    let platform = adapter.clone() as Arc<dyn AdapterHandle>;

    let (handle, task) = spawn_link(Some(platform), settings, sink, cancel.clone());

    Link { adapter, handle, events, supervisor_events: Some(supervisor_events), cancel, task }
}

impl Link {
    /// Every event up to and including the change into `state`.
    async fn until_state(&mut self, state: ConnectionState) -> Vec<DeviceEvent> {
        let mut seen = Vec::new();

        timeout(WAIT, async {
            while let Some(event) = self.events.next().await {
                let reached = matches!(event, DeviceEvent::StateChange(s) if s == state);
                seen.push(event);
                if reached {
                    return;
                }
            }
            panic!("link stopped before reaching {:?}", state);
        }).await.unwrap_or_else(|_| panic!("timed out waiting for {:?}", state));

        seen
    }

    async fn samples(&mut self, count: usize) -> Vec<TelemetrySample> {
        let mut samples = Vec::new();

        timeout(WAIT, async {
            while samples.len() < count {
                match self.events.next().await {
                    Some(DeviceEvent::Sample(sample)) => samples.push(sample),
                    Some(_) => {},
                    None => panic!("link stopped"),
                }
            }
        }).await.expect("timed out waiting for samples");

        samples
    }

    fn supervise(&mut self, delay: Option<Duration>) -> tokio::task::JoinHandle<Result<SupervisorExit, LinkError>> {
        let policy = RescanPolicy { name_filter: DEFAULT_DEVICE_NAME.to_string(), delay };
        let events = self.supervisor_events.take().expect("supervised twice");

        tokio::spawn(supervise(self.handle.clone(), events, policy, self.cancel.clone()))
    }

    async fn stop(self) -> Arc<SimulatedAdapter> {
        self.cancel.cancel();
        timeout(WAIT, self.task).await.unwrap().unwrap();
        self.adapter
    }
}

fn states(events: &[DeviceEvent]) -> Vec<ConnectionState> {
    events.iter().filter_map(|event| match event {
        DeviceEvent::StateChange(state) => Some(*state),
        _ => None,
    }).collect()
}

fn errors(events: &[DeviceEvent]) -> Vec<ErrorKind> {
    events.iter().filter_map(|event| match event {
        DeviceEvent::Error(kind, _) => Some(*kind),
        _ => None,
    }).collect()
}

#[tokio::test]
async fn streams_the_board_heading() {
    let mut link = start(SimulatedAdapter::new(board(PayloadLayout::Int32)), settings());

    link.handle.start_scan(DEFAULT_DEVICE_NAME).await.unwrap();
    let events = link.until_state(ConnectionState::Streaming).await;

    assert_eq!(states(&events), vec![
        ConnectionState::Scanning,
        ConnectionState::Found,
        ConnectionState::Connecting,
        ConnectionState::Connected,
        ConnectionState::ResolvingServices,
        ConnectionState::NotificationsEnabled,
        ConnectionState::Streaming,
    ]);
    assert!(errors(&events).is_empty());

    // the notification that started the stream is the first sample
    let samples = link.samples(4).await;
    let angles: Vec<Option<i32>> = samples.iter().map(|sample| sample.angle_degrees).collect();
    assert_eq!(angles, vec![Some(10), Some(20), Some(30), Some(40)]);
    assert_eq!(samples[0].raw_bytes, vec![10, 0, 0, 0]);
    assert_eq!(samples[0].direction, CompassDirection::North);
    assert_eq!(samples[3].direction, CompassDirection::Northeast);

    let adapter = link.stop().await;
    assert!(!adapter.is_connected());
}

#[tokio::test]
async fn int16_and_utf8_layouts() {
    for (layout, expected, raw) in [
        (PayloadLayout::Int16, Some(10), vec![10, 0]),
        (PayloadLayout::Utf8, None, b"N".to_vec()),
    ] {
        let settings = LinkSettings { layout, ..settings() };
        let mut link = start(SimulatedAdapter::new(board(layout)), settings);

        link.handle.start_scan(DEFAULT_DEVICE_NAME).await.unwrap();
        let events = link.until_state(ConnectionState::Streaming).await;
        assert!(errors(&events).is_empty());

        let sample = link.samples(1).await.remove(0);
        assert_eq!(sample.direction, CompassDirection::North);
        assert_eq!(sample.angle_degrees, expected);
        assert_eq!(sample.raw_bytes, raw);

        link.stop().await;
    }
}

#[tokio::test]
async fn manual_connect_after_scan() {
    let adapter = SimulatedAdapter::new(SimulatedPeripheral {
        connect_delay: Duration::from_millis(200),
        ..board(PayloadLayout::Int32)
    });
    let board = adapter.peripheral().clone();
    let mut link = start(adapter, LinkSettings { auto_connect: false, ..settings() });

    link.handle.start_scan(DEFAULT_DEVICE_NAME).await.unwrap();
    link.until_state(ConnectionState::Found).await;
    assert_eq!(link.handle.state().await.unwrap(), ConnectionState::Found);

    link.handle.connect(board.clone()).await.unwrap();
    assert_eq!(link.handle.connect(board).await, Err(LinkError::ConnectionAlreadyInProgress));

    let events = link.until_state(ConnectionState::Streaming).await;
    assert_eq!(errors(&events), vec![ErrorKind::ConnectionAlreadyInProgress]);

    link.stop().await;
}

#[tokio::test]
async fn reconnects_after_the_board_drops_the_link() {
    let adapter = SimulatedAdapter::new(SimulatedPeripheral {
        disconnect_after: Some(2),
        ..board(PayloadLayout::Int32)
    });
    let mut link = start(adapter, settings());
    let supervisor = link.supervise(Some(Duration::from_millis(20)));

    let first = link.until_state(ConnectionState::Disconnected).await;
    let second = link.until_state(ConnectionState::Streaming).await;

    assert!(states(&first).contains(&ConnectionState::Streaming));
    assert_eq!(states(&second).first(), Some(&ConnectionState::Scanning));

    // the board keeps counting across connections
    let angles: Vec<i32> = first.iter().chain(second.iter()).filter_map(|event| match event {
        DeviceEvent::Sample(sample) => sample.angle_degrees,
        _ => None,
    }).collect();
    assert_eq!(angles[..2], [10, 20]);

    let next = link.samples(1).await.remove(0);
    assert!(next.angle_degrees.unwrap() > 20);

    link.cancel.cancel();
    assert_eq!(supervisor.await.unwrap(), Ok(SupervisorExit::Cancelled));
    link.stop().await;
}

#[tokio::test]
async fn bluetooth_turned_off_between_sessions_is_not_retried() {
    let adapter = SimulatedAdapter::new(SimulatedPeripheral {
        disconnect_after: Some(1),
        ..board(PayloadLayout::Int32)
    });
    let mut link = start(adapter, settings());
    let supervisor = link.supervise(Some(Duration::from_millis(20)));

    link.until_state(ConnectionState::Disconnected).await;
    link.adapter.set_powered(false);

    let exit = timeout(WAIT, supervisor).await.expect("supervisor kept retrying").unwrap();
    assert_eq!(exit, Err(LinkError::AdapterDisabled));
    assert_eq!(link.handle.state().await.unwrap(), ConnectionState::Disconnected);

    // exactly one refused scan, nothing afterwards
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut refused = 0;
    while let Ok(Some(event)) = timeout(Duration::from_millis(10), link.events.next()).await {
        assert!(!matches!(event, DeviceEvent::StateChange(ConnectionState::Scanning)));
        if matches!(event, DeviceEvent::Error(ErrorKind::AdapterDisabled, _)) {
            refused += 1;
        }
    }
    assert_eq!(refused, 1);

    link.stop().await;
}

#[tokio::test]
async fn missing_service_is_not_retried() {
    let settings = LinkSettings {
        target: CharacteristicTarget::new("0000feed", "2a57", MatchStrategy::Partial),
        ..settings()
    };
    let mut link = start(SimulatedAdapter::new(board(PayloadLayout::Int32)), settings);
    let supervisor = link.supervise(Some(Duration::from_millis(20)));

    let events = link.until_state(ConnectionState::Failed).await;
    assert_eq!(errors(&events), vec![ErrorKind::ServiceNotFound]);

    let exit = timeout(WAIT, supervisor).await.unwrap().unwrap();
    assert_eq!(exit, Ok(SupervisorExit::Stopped {
        state: ConnectionState::Failed,
        error: Some(ErrorKind::ServiceNotFound),
    }));

    let adapter = link.stop().await;
    assert!(!adapter.is_connected());
}

#[tokio::test]
async fn partial_uuid_fragments_resolve_the_first_match() {
    let settings = LinkSettings {
        target: CharacteristicTarget::new("0000180A", "2a57", MatchStrategy::Partial),
        ..settings()
    };
    let mut link = start(SimulatedAdapter::new(board(PayloadLayout::Int32)), settings);

    link.handle.start_scan(DEFAULT_DEVICE_NAME).await.unwrap();
    let events = link.until_state(ConnectionState::Streaming).await;

    assert!(errors(&events).is_empty());
    link.stop().await;
}

#[tokio::test]
async fn scan_timeout_without_rescan() {
    let settings = LinkSettings { scan_timeout: Some(Duration::from_millis(50)), ..settings() };
    let mut link = start(SimulatedAdapter::new(board(PayloadLayout::Int32)).with_bystanders(vec![]), settings);

    link.handle.start_scan("Nobody").await.unwrap();
    let events = link.until_state(ConnectionState::Idle).await;

    assert_eq!(states(&events), vec![ConnectionState::Scanning, ConnectionState::Idle]);
    assert_eq!(errors(&events), vec![ErrorKind::ScanTimeout]);
    link.stop().await;
}

#[tokio::test]
async fn powered_off_adapter() {
    let mut link = start(SimulatedAdapter::new(board(PayloadLayout::Int32)).powered_off(), settings());
    let supervisor = link.supervise(Some(Duration::from_millis(20)));

    assert_eq!(timeout(WAIT, supervisor).await.unwrap().unwrap(), Err(LinkError::AdapterDisabled));
    assert_eq!(link.handle.state().await.unwrap(), ConnectionState::Idle);

    let event = timeout(WAIT, link.events.next()).await.unwrap();
    assert!(matches!(event, Some(DeviceEvent::Error(ErrorKind::AdapterDisabled, _))));
    link.stop().await;
}
