use log::{debug, info};

use crate::device::adapter::{AdapterHandle, AdapterState};
use crate::device::events::{DiscoveryEvent, InboundSender, SessionToken};
use crate::device::types::{MatchStrategy, PeripheralDescriptor};
use crate::error::LinkError;

#[derive(Debug)]
struct ScanSession {
    name_filter: String,
    session: SessionToken,
    matched: bool,
}

/// Locates one peripheral by name. Owned by the link task, so `matched` never races.
#[derive(Debug)]
pub struct ScanController {
    name_match: MatchStrategy,
    current: Option<ScanSession>,
    scanning: bool,
}

impl ScanController {
    pub fn new(name_match: MatchStrategy) -> Self {
        ScanController {
            name_match,
            current: None,
            scanning: false,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn name_filter(&self) -> Option<&str> {
        self.current.as_ref().map(|scan| scan.name_filter.as_str())
    }

    /// Fails without touching the platform when there is no adapter or bluetooth is off.
    /// Failures are not retried here.
    pub async fn start(
        &mut self,
        adapter: Option<&dyn AdapterHandle>,
        name_filter: &str,
        session: SessionToken,
        events: InboundSender,
    ) -> Result<(), LinkError> {
        let adapter = adapter.ok_or(LinkError::AdapterUnavailable)?;

        if adapter.state().await == AdapterState::Disabled {
            return Err(LinkError::AdapterDisabled);
        }

        // a previous platform scan might still be running
        self.stop(adapter);

        info!("Scanning for {:?} ({})", name_filter, session);
        self.current = Some(ScanSession {
            name_filter: name_filter.to_string(),
            session,
            matched: false,
        });
        self.scanning = true;
        adapter.start_scan(session, events);
        Ok(())
    }

    /// Returns the peripheral for the first matching event of the session; stops the scan.
    /// Every later event, including platform duplicates for the same device, yields `None`.
    pub fn on_discovery(&mut self, adapter: &dyn AdapterHandle, event: &DiscoveryEvent) -> Option<PeripheralDescriptor> {
        let scan = self.current.as_mut()?;

        if scan.session != event.session || scan.matched {
            return None;
        }

        if !self.name_match.matches(&scan.name_filter, &event.peripheral.name) {
            debug!("Ignoring peripheral {} {:?}", event.peripheral, event.rssi);
            return None;
        }

        scan.matched = true;
        info!("Found peripheral {} rssi {:?}", event.peripheral, event.rssi);
        self.stop(adapter);

        Some(event.peripheral.clone())
    }

    /// Idempotent; the platform is only asked to stop a scan that is running.
    pub fn stop(&mut self, adapter: &dyn AdapterHandle) {
        if !self.scanning {
            return;
        }

        self.scanning = false;
        debug!("Stopping scan");
        adapter.stop_scan();
    }

    /// Forget the platform scan without asking the platform to stop it, used when the
    /// platform itself reported that the scan could not start.
    pub fn abandon(&mut self) {
        self.scanning = false;
    }
}
