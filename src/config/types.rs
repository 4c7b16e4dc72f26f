use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::device::connection::LinkSettings;
use crate::device::constants::{
    ANGLE_CHARACTERISTIC, ANGLE_SERVICE, DEFAULT_DEVICE_NAME, DISCOVERY_GRACE, RESCAN_DELAY, SCAN_TIMEOUT,
};
use crate::device::supervisor::RescanPolicy;
use crate::device::types::{CharacteristicTarget, MatchStrategy, PayloadLayout};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub device_name: String,
    pub name_match: MatchStrategy,
    pub service_uuid: String,
    pub characteristic_uuid: String,
    pub uuid_match: MatchStrategy,
    pub payload_layout: PayloadLayout,
    pub discovery_grace_ms: u64,
    /// `null` scans until a match is found.
    pub scan_timeout_ms: Option<u64>,
    /// `null` disables re-scanning.
    pub rescan_interval_ms: Option<u64>,
    pub auto_connect: bool,
}

impl Config {
    pub fn target(&self) -> CharacteristicTarget {
        CharacteristicTarget::new(self.service_uuid.as_str(), self.characteristic_uuid.as_str(), self.uuid_match)
    }

    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            name_match: self.name_match,
            target: self.target(),
            layout: self.payload_layout,
            discovery_grace: Duration::from_millis(self.discovery_grace_ms),
            scan_timeout: self.scan_timeout_ms.map(Duration::from_millis),
            auto_connect: self.auto_connect,
        }
    }

    pub fn rescan_policy(&self) -> RescanPolicy {
        RescanPolicy {
            name_filter: self.device_name.clone(),
            delay: self.rescan_interval_ms.map(Duration::from_millis),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            name_match: MatchStrategy::Exact,
            service_uuid: ANGLE_SERVICE.to_string(),
            characteristic_uuid: ANGLE_CHARACTERISTIC.to_string(),
            uuid_match: MatchStrategy::Exact,
            payload_layout: PayloadLayout::Int32,
            discovery_grace_ms: DISCOVERY_GRACE,
            scan_timeout_ms: Some(SCAN_TIMEOUT),
            rescan_interval_ms: Some(RESCAN_DELAY),
            auto_connect: true,
        }
    }
}
