use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use async_trait::async_trait;
use btleplug::api::{BDAddr, Central, CentralEvent, CentralState, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::{StreamExt, SinkExt};
use log::{debug, info, warn};
use tokio::spawn;
use tokio_util::sync::CancellationToken;

use crate::device::adapter::{AdapterHandle, AdapterState};
use crate::device::events::{
    CharacteristicChangedEvent, ConnectionStateEvent, DiscoveryEvent, InboundEvent, InboundSender, PlatformConnection,
    ServicesDiscoveredEvent, SessionToken,
};
use crate::device::types::{CharacteristicInfo, CharacteristicRef, PeripheralDescriptor, ServiceInfo};
use crate::error::DeviceError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The host's first bluetooth adapter. Every request runs in its own task and answers
/// through the `InboundSender` it was given.
pub struct BtleplugAdapter {
    _manager: Manager,
    adapter: Adapter,
    /// Peripherals seen during scans, by the address reported in `PeripheralDescriptor`.
    peripherals: Arc<Mutex<HashMap<String, Peripheral>>>,
    connected: Arc<Mutex<Option<Peripheral>>>,
    scan_cancel: Mutex<Option<CancellationToken>>,
    scan_gate: Arc<ScanGate>,
    connection_cancel: Mutex<Option<CancellationToken>>,
}

/// Orders the platform start/stop calls of consecutive scans. The adapter scan is shared,
/// so a superseded scan task must not stop it after a newer scan has started it.
#[derive(Debug, Default)]
struct ScanGate {
    generation: AtomicU64,
    platform: tokio::sync::Mutex<()>,
}

impl ScanGate {
    fn begin(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Runs `call` unless a scan newer than `generation` has begun.
    async fn run_if_current<F, Fut, T>(&self, generation: u64, call: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _platform = self.platform.lock().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            return None;
        }

        Some(call().await)
    }
}

fn adapter_state(state: Result<CentralState, btleplug::Error>) -> AdapterState {
    match state {
        Ok(CentralState::PoweredOff) => AdapterState::Disabled,
        Ok(_) => AdapterState::Enabled,
        Err(err) => {
            warn!("Could not query adapter state, assuming it is off: {}", err);
            AdapterState::Disabled
        },
    }
}

impl BtleplugAdapter {
    /// `Ok(None)` when the host has no bluetooth adapter at all.
    pub async fn discover() -> Result<Option<Self>, DeviceError> {
        let manager = Manager::new().await?;
        let Some(adapter) = manager.adapters().await?.into_iter().next() else {
            warn!("No bluetooth adapter found");
            return Ok(None);
        };

        info!("Using adapter {}", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));

        Ok(Some(BtleplugAdapter {
            _manager: manager,
            adapter,
            peripherals: Arc::default(),
            connected: Arc::default(),
            scan_cancel: Mutex::default(),
            scan_gate: Arc::default(),
            connection_cancel: Mutex::default(),
        }))
    }

    fn connected_peripheral(&self) -> Option<Peripheral> {
        lock(&self.connected).clone()
    }

    fn connection_token(&self) -> CancellationToken {
        lock(&self.connection_cancel).get_or_insert_with(CancellationToken::new).child_token()
    }
}

async fn describe(peripheral: &Peripheral, session: SessionToken) -> Result<Option<DiscoveryEvent>, DeviceError> {
    let Some(properties) = peripheral.properties().await? else {
        return Ok(None);
    };

    let Some(name) = properties.local_name else {
        return Ok(None);
    };

    // macOS hides the hardware address
    let address = if properties.address == BDAddr::default() {
        peripheral.id().to_string()
    } else {
        properties.address.to_string()
    };

    Ok(Some(DiscoveryEvent {
        session,
        peripheral: PeripheralDescriptor { name, address },
        rssi: properties.rssi,
    }))
}

async fn on_central_event(
    adapter: &Adapter,
    id: &PeripheralId,
    peripherals: &Mutex<HashMap<String, Peripheral>>,
    session: SessionToken,
    events: &mut InboundSender,
) -> Result<bool, DeviceError> {
    let peripheral = adapter.peripheral(id).await?;

    let Some(discovery) = describe(&peripheral, session).await? else {
        return Ok(true);
    };

    lock(peripherals).insert(discovery.peripheral.address.clone(), peripheral);
    Ok(events.send(InboundEvent::Discovery(discovery)).await.is_ok())
}

async fn scan(
    adapter: Adapter,
    peripherals: Arc<Mutex<HashMap<String, Peripheral>>>,
    session: SessionToken,
    events: &mut InboundSender,
    gate: Arc<ScanGate>,
    generation: u64,
    cancel: CancellationToken,
) -> Result<(), DeviceError> {
    let mut central_events = adapter.events().await?;
    if let Some(started) = gate.run_if_current(generation, || adapter.start_scan(ScanFilter::default())).await {
        started?;
    }

    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            event = central_events.next() => {
                let id = match event {
                    Some(CentralEvent::DeviceDiscovered(id)) | Some(CentralEvent::DeviceUpdated(id)) => id,
                    Some(_) => continue 'mainloop,
                    None => break 'mainloop,
                };

                match on_central_event(&adapter, &id, &peripherals, session, events).await {
                    Ok(true) => {},
                    Ok(false) => break 'mainloop,
                    Err(err) => debug!("Could not query peripheral {:?}: {}", id, err),
                }
            },
        }
    }

    match gate.run_if_current(generation, || adapter.stop_scan()).await {
        Some(Err(err)) => debug!("Failed to stop scan cleanly: {}", err),
        Some(Ok(())) => {},
        None => debug!("Scan {} was superseded; leaving the platform scan running", session),
    }

    Ok(())
}

fn watch_disconnect(
    adapter: Adapter,
    id: PeripheralId,
    session: SessionToken,
    mut events: InboundSender,
    cancel: CancellationToken,
) {
    spawn(async move {
        let mut central_events = match adapter.events().await {
            Ok(v) => v,
            Err(err) => {
                warn!("Could not watch for disconnects: {}", err);
                return;
            },
        };

        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                event = central_events.next() => {
                    match event {
                        Some(CentralEvent::DeviceDisconnected(disconnected)) if disconnected == id => {
                            info!("Peripheral {:?} disconnected", id);
                            let change = ConnectionStateEvent { session, change: PlatformConnection::Disconnected };
                            let _ = events.send(InboundEvent::ConnectionState(change)).await;
                            break 'mainloop;
                        },
                        Some(_) => {},
                        None => break 'mainloop,
                    }
                },
            }
        }
    });
}

async fn discover_services(peripheral: &Peripheral) -> Result<Vec<ServiceInfo>, DeviceError> {
    peripheral.discover_services().await?;

    Ok(peripheral.services().into_iter().map(|service| ServiceInfo {
        uuid: service.uuid,
        characteristics: service.characteristics.into_iter().map(|characteristic| CharacteristicInfo {
            uuid: characteristic.uuid,
            descriptors: characteristic.descriptors.into_iter().map(|descriptor| descriptor.uuid).collect(),
        }).collect(),
    }).collect())
}

async fn notify(
    peripheral: Peripheral,
    target: CharacteristicRef,
    session: SessionToken,
    mut events: InboundSender,
    cancel: CancellationToken,
) {
    let subscribed = async {
        let characteristic = peripheral.characteristics()
            .into_iter()
            .find(|c| c.service_uuid == target.service && c.uuid == target.characteristic)
            .ok_or(DeviceError::MissingCharacteristic)?;

        // open the stream first so the first notification is not missed
        let notifications = peripheral.notifications().await?;
        peripheral.subscribe(&characteristic).await?;
        Ok::<_, DeviceError>(notifications)
    };

    let mut notifications = match subscribed.await {
        Ok(v) => v,
        Err(err) => {
            let _ = events.send(InboundEvent::NotificationsArmed { session, result: Err(err.to_string()) }).await;
            return;
        },
    };

    if events.send(InboundEvent::NotificationsArmed { session, result: Ok(()) }).await.is_err() {
        return;
    }

    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            Some(data) = notifications.next() => {
                let changed = CharacteristicChangedEvent {
                    session,
                    characteristic: data.uuid,
                    value: data.value,
                    received_at: SystemTime::now(),
                };

                if events.send(InboundEvent::CharacteristicChanged(changed)).await.is_err() {
                    break 'mainloop;
                }
            },
            else => break 'mainloop,
        }
    }

    debug!("Stopped forwarding notifications of {}", session);
}

#[async_trait]
impl AdapterHandle for BtleplugAdapter {
    async fn state(&self) -> AdapterState {
        adapter_state(self.adapter.adapter_state().await)
    }

    fn start_scan(&self, session: SessionToken, mut events: InboundSender) {
        let cancel = CancellationToken::new();
        if let Some(previous) = lock(&self.scan_cancel).replace(cancel.clone()) {
            previous.cancel();
        }

        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();
        let gate = self.scan_gate.clone();
        let generation = gate.begin();

        spawn(async move {
            if let Err(err) = scan(adapter, peripherals, session, &mut events, gate, generation, cancel).await {
                warn!("Scanning failed {:?}", err);
                let _ = events.send(InboundEvent::ScanFailed { session, detail: err.to_string() }).await;
            }
        });
    }

    fn stop_scan(&self) {
        if let Some(cancel) = lock(&self.scan_cancel).take() {
            cancel.cancel();
        }
    }

    fn connect(&self, session: SessionToken, peripheral: &PeripheralDescriptor, mut events: InboundSender) {
        let found = lock(&self.peripherals).get(&peripheral.address).cloned();
        let address = peripheral.address.clone();
        let adapter = self.adapter.clone();
        let connected = self.connected.clone();

        let cancel = CancellationToken::new();
        if let Some(previous) = lock(&self.connection_cancel).replace(cancel.clone()) {
            previous.cancel();
        }

        spawn(async move {
            let result = match found {
                None => Err(DeviceError::UnknownPeripheral { address }),
                Some(peripheral) => peripheral.connect().await.map(|_| peripheral).map_err(DeviceError::from),
            };

            let change = match result {
                Ok(peripheral) if cancel.is_cancelled() => {
                    // torn down while the platform was still connecting
                    let _ = peripheral.disconnect().await;
                    return;
                },
                Ok(peripheral) => {
                    watch_disconnect(adapter, peripheral.id(), session, events.clone(), cancel.child_token());
                    *lock(&connected) = Some(peripheral);
                    PlatformConnection::Connected
                },
                Err(err) => PlatformConnection::ConnectFailed(err.to_string()),
            };

            let _ = events.send(InboundEvent::ConnectionState(ConnectionStateEvent { session, change })).await;
        });
    }

    fn discover_services(&self, session: SessionToken, mut events: InboundSender) {
        let peripheral = self.connected_peripheral();

        spawn(async move {
            let result = match peripheral {
                None => Err(DeviceError::NotConnected),
                Some(peripheral) => discover_services(&peripheral).await,
            };

            let result = result.map_err(|err| err.to_string());
            let _ = events.send(InboundEvent::ServicesDiscovered(ServicesDiscoveredEvent { session, result })).await;
        });
    }

    fn enable_notifications(&self, session: SessionToken, characteristic: CharacteristicRef, mut events: InboundSender) {
        let Some(peripheral) = self.connected_peripheral() else {
            let result = Err(DeviceError::NotConnected.to_string());
            spawn(async move {
                let _ = events.send(InboundEvent::NotificationsArmed { session, result }).await;
            });
            return;
        };

        spawn(notify(peripheral, characteristic, session, events, self.connection_token()));
    }

    fn disconnect(&self) {
        if let Some(cancel) = lock(&self.connection_cancel).take() {
            cancel.cancel();
        }

        if let Some(peripheral) = lock(&self.connected).take() {
            spawn(async move {
                info!("Disconnecting from peripheral {:?}", peripheral.id());
                if let Err(err) = peripheral.disconnect().await {
                    warn!("Failed to disconnect cleanly: {}", err);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_adapter_state_counts_as_off() {
        assert_eq!(adapter_state(Ok(CentralState::PoweredOn)), AdapterState::Enabled);
        assert_eq!(adapter_state(Ok(CentralState::PoweredOff)), AdapterState::Disabled);

        let err = btleplug::Error::NotSupported("adapter state".to_string());
        assert_eq!(adapter_state(Err(err)), AdapterState::Disabled);
    }

    #[tokio::test]
    async fn superseded_scan_does_not_stop_the_next_one() {
        let gate = ScanGate::default();

        let first = gate.begin();
        assert_eq!(gate.run_if_current(first, || async { "start first" }).await, Some("start first"));

        let second = gate.begin();
        assert_eq!(gate.run_if_current(second, || async { "start second" }).await, Some("start second"));

        // the first task winds down after the second one started scanning
        assert_eq!(gate.run_if_current(first, || async { "stop first" }).await, None);
        assert_eq!(gate.run_if_current(second, || async { "stop second" }).await, Some("stop second"));
    }

    #[tokio::test]
    async fn scan_superseded_before_it_started_never_starts() {
        let gate = ScanGate::default();

        let first = gate.begin();
        let second = gate.begin();

        assert_eq!(gate.run_if_current(first, || async { "start first" }).await, None);
        assert_eq!(gate.run_if_current(second, || async { "start second" }).await, Some("start second"));
    }
}
