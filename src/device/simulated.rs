use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::time::SystemTime;
use async_trait::async_trait;
use futures::SinkExt;
use log::{debug, info};
use tokio::spawn;
use tokio::time::{interval, sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::device::adapter::{AdapterHandle, AdapterState};
use crate::device::constants::*;
use crate::device::decoder::TelemetryDecoder;
use crate::device::events::{
    CharacteristicChangedEvent, ConnectionStateEvent, DiscoveryEvent, InboundEvent, InboundSender, PlatformConnection,
    ServicesDiscoveredEvent, SessionToken,
};
use crate::device::types::{CharacteristicInfo, CharacteristicRef, PayloadLayout, PeripheralDescriptor, ServiceInfo};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Behaviour of the simulated compass board.
#[derive(Debug, Clone)]
pub struct SimulatedPeripheral {
    pub descriptor: PeripheralDescriptor,
    pub layout: PayloadLayout,
    pub advertise_interval: Duration,
    pub connect_delay: Duration,
    pub notify_interval: Duration,
    pub refuse_connections: bool,
    /// Drop the link after this many notifications.
    pub disconnect_after: Option<usize>,
}

impl Default for SimulatedPeripheral {
    fn default() -> Self {
        SimulatedPeripheral {
            descriptor: PeripheralDescriptor {
                name: DEFAULT_DEVICE_NAME.to_string(),
                address: "A8:61:0A:3E:5C:01".to_string(),
            },
            layout: PayloadLayout::Int32,
            advertise_interval: Duration::from_millis(100),
            connect_delay: Duration::from_millis(50),
            notify_interval: Duration::from_millis(NOTIFY_INTERVAL),
            refuse_connections: false,
            disconnect_after: None,
        }
    }
}

/// An in-process bluetooth stack hosting one compass board and any number of unrelated
/// advertisers. The board keeps its angle across connections and advances it by
/// `ANGLE_STEP` (mod 360) before every notification.
pub struct SimulatedAdapter {
    peripheral: SimulatedPeripheral,
    bystanders: Vec<PeripheralDescriptor>,
    powered: AtomicBool,
    angle: Arc<AtomicI32>,
    notifications: Arc<AtomicUsize>,
    scan_cancel: Mutex<Option<CancellationToken>>,
    connection: Mutex<Option<(SessionToken, CancellationToken)>>,
}

impl SimulatedAdapter {
    pub fn new(peripheral: SimulatedPeripheral) -> Self {
        SimulatedAdapter {
            peripheral,
            bystanders: SimulatedAdapter::default_bystanders(),
            powered: AtomicBool::new(true),
            angle: Arc::default(),
            notifications: Arc::default(),
            scan_cancel: Mutex::default(),
            connection: Mutex::default(),
        }
    }

    /// Advertisers sharing the room with the board; they refuse connections.
    pub fn default_bystanders() -> Vec<PeripheralDescriptor> {
        vec![PeripheralDescriptor {
            name: NANO_DEVICE_NAME.to_string(),
            address: "A8:61:0A:3E:5C:02".to_string(),
        }]
    }

    pub fn bystanders(&self) -> &[PeripheralDescriptor] {
        &self.bystanders
    }

    pub fn with_bystanders(mut self, bystanders: Vec<PeripheralDescriptor>) -> Self {
        self.bystanders = bystanders;
        self
    }

    pub fn powered_off(self) -> Self {
        self.set_powered(false);
        self
    }

    /// Turns bluetooth on or off; only later `state()` queries see the change.
    pub fn set_powered(&self, on: bool) {
        self.powered.store(on, Ordering::SeqCst);
    }

    pub fn peripheral(&self) -> &PeripheralDescriptor {
        &self.peripheral.descriptor
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.connection).is_some()
    }

    /// Total notifications sent over every connection so far.
    pub fn notification_count(&self) -> usize {
        self.notifications.load(Ordering::SeqCst)
    }

    /// The board's GATT table, device information service first.
    pub fn gatt_table() -> Vec<ServiceInfo> {
        vec![
            ServiceInfo {
                uuid: DEVICE_INFORMATION_SERVICE_UUID,
                characteristics: vec![
                    CharacteristicInfo { uuid: DIGITAL_CHARACTERISTIC_UUID, descriptors: vec![CCCD_UUID] },
                    CharacteristicInfo { uuid: BATTERY_LEVEL_CHARACTERISTIC_UUID, descriptors: vec![] },
                ],
            },
            ServiceInfo {
                uuid: ANGLE_SERVICE_UUID,
                characteristics: vec![
                    CharacteristicInfo { uuid: ANGLE_CHARACTERISTIC_UUID, descriptors: vec![CCCD_UUID] },
                ],
            },
        ]
    }

    /// Cancellation token of the current connection when it belongs to `session`.
    fn connection_token(&self, session: SessionToken) -> Option<CancellationToken> {
        match &*lock(&self.connection) {
            Some((current, cancel)) if *current == session => Some(cancel.clone()),
            _ => None,
        }
    }
}

fn reply(mut events: InboundSender, event: InboundEvent) {
    spawn(async move {
        let _ = events.send(event).await;
    });
}

#[async_trait]
impl AdapterHandle for SimulatedAdapter {
    async fn state(&self) -> AdapterState {
        if self.powered.load(Ordering::SeqCst) {
            AdapterState::Enabled
        } else {
            AdapterState::Disabled
        }
    }

    fn start_scan(&self, session: SessionToken, mut events: InboundSender) {
        let cancel = CancellationToken::new();
        if let Some(previous) = lock(&self.scan_cancel).replace(cancel.clone()) {
            previous.cancel();
        }

        // bystanders first, like a crowded room
        let mut advertisers = self.bystanders.clone();
        advertisers.push(self.peripheral.descriptor.clone());
        let advertise_interval = self.peripheral.advertise_interval;

        info!("Simulated scan started ({})", session);
        spawn(async move {
            let mut ticker = interval(advertise_interval);

            // every advertiser repeats its advertisement until the scan stops
            'mainloop: loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        break 'mainloop;
                    },
                    _ = ticker.tick() => {
                        for (rssi, peripheral) in (-75..).zip(advertisers.iter()) {
                            let event = DiscoveryEvent { session, peripheral: peripheral.clone(), rssi: Some(rssi) };
                            if events.send(InboundEvent::Discovery(event)).await.is_err() {
                                break 'mainloop;
                            }
                        }
                    },
                }
            }

            debug!("Simulated scan stopped ({})", session);
        });
    }

    fn stop_scan(&self) {
        if let Some(cancel) = lock(&self.scan_cancel).take() {
            cancel.cancel();
        }
    }

    fn connect(&self, session: SessionToken, peripheral: &PeripheralDescriptor, mut events: InboundSender) {
        let accepted = peripheral.address == self.peripheral.descriptor.address && !self.peripheral.refuse_connections;
        let address = peripheral.address.clone();
        let delay = self.peripheral.connect_delay;

        let cancel = CancellationToken::new();
        if accepted {
            if let Some((_, previous)) = lock(&self.connection).replace((session, cancel.clone())) {
                previous.cancel();
            }
        }

        spawn(async move {
            sleep(delay).await;

            let change = if accepted {
                if cancel.is_cancelled() {
                    return;
                }
                PlatformConnection::Connected
            } else {
                PlatformConnection::ConnectFailed(format!("{} did not accept the connection", address))
            };

            let _ = events.send(InboundEvent::ConnectionState(ConnectionStateEvent { session, change })).await;
        });
    }

    fn discover_services(&self, session: SessionToken, events: InboundSender) {
        let result = match self.connection_token(session) {
            Some(_) => Ok(SimulatedAdapter::gatt_table()),
            None => Err("not connected".to_string()),
        };

        reply(events, InboundEvent::ServicesDiscovered(ServicesDiscoveredEvent { session, result }));
    }

    fn enable_notifications(&self, session: SessionToken, characteristic: CharacteristicRef, mut events: InboundSender) {
        let Some(cancel) = self.connection_token(session) else {
            reply(events, InboundEvent::NotificationsArmed { session, result: Err("not connected".to_string()) });
            return;
        };

        let notifiable = SimulatedAdapter::gatt_table().iter().any(|service| {
            service.uuid == characteristic.service && service.characteristics.iter().any(|c| {
                c.uuid == characteristic.characteristic && c.descriptors.contains(&characteristic.descriptor)
            })
        });

        if !notifiable {
            let result = Err(format!("{} does not support notifications", characteristic.characteristic));
            reply(events, InboundEvent::NotificationsArmed { session, result });
            return;
        }

        let encoder = TelemetryDecoder::new(self.peripheral.layout);
        let notify_interval = self.peripheral.notify_interval;
        let disconnect_after = self.peripheral.disconnect_after;
        let angle = self.angle.clone();
        let notifications = self.notifications.clone();

        spawn(async move {
            if events.send(InboundEvent::NotificationsArmed { session, result: Ok(()) }).await.is_err() {
                return;
            }

            let mut ticker = interval(notify_interval);
            let mut sent = 0;

            'mainloop: loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        break 'mainloop;
                    },
                    _ = ticker.tick() => {
                        if disconnect_after == Some(sent) {
                            info!("Simulated peripheral dropped the link");
                            let change = ConnectionStateEvent { session, change: PlatformConnection::Disconnected };
                            let _ = events.send(InboundEvent::ConnectionState(change)).await;
                            break 'mainloop;
                        }

                        let value = (angle.load(Ordering::SeqCst) + ANGLE_STEP) % 360;
                        angle.store(value, Ordering::SeqCst);

                        let changed = CharacteristicChangedEvent {
                            session,
                            characteristic: characteristic.characteristic,
                            value: encoder.encode(value),
                            received_at: SystemTime::now(),
                        };

                        if events.send(InboundEvent::CharacteristicChanged(changed)).await.is_err() {
                            break 'mainloop;
                        }

                        sent += 1;
                        notifications.fetch_add(1, Ordering::SeqCst);
                    },
                }
            }
        });
    }

    fn disconnect(&self) {
        if let Some((session, cancel)) = lock(&self.connection).take() {
            debug!("Simulated peripheral disconnected ({})", session);
            cancel.cancel();
        }
    }
}
