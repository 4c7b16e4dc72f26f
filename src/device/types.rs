use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::constants::CCCD_UUID;
use crate::error::ErrorKind;

/// A peripheral captured from a discovery event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PeripheralDescriptor {
    pub name: String,
    pub address: String,
}

impl fmt::Display for PeripheralDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Found,
    Connecting,
    Connected,
    ResolvingServices,
    NotificationsEnabled,
    Streaming,
    Disconnected,
    Failed,
}

/// Everything that can move a `ConnectionState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    StartScan,
    PeripheralFound,
    ScanTimedOut,
    ScanFailed,
    Connect,
    PlatformConnected,
    PlatformConnectFailed,
    ServicesDiscovered,
    ServiceDiscoveryFailed,
    ResolveFailed,
    NotificationsArmed,
    FirstNotification,
    PlatformDisconnected,
    Teardown,
}

impl ConnectionState {
    /// The transition table. `None` means the trigger is not valid in this state.
    pub fn next(self, trigger: Trigger) -> Option<ConnectionState> {
        use ConnectionState::*;

        match (self, trigger) {
            (_, Trigger::Teardown) => Some(Disconnected),
            (Idle | Disconnected | Failed, Trigger::StartScan) => Some(Scanning),
            (Scanning, Trigger::PeripheralFound) => Some(Found),
            (Scanning, Trigger::ScanTimedOut) => Some(Idle),
            (Scanning, Trigger::ScanFailed) => Some(Failed),
            (Found, Trigger::Connect) => Some(Connecting),
            (Connecting, Trigger::PlatformConnected) => Some(Connected),
            (Connecting, Trigger::PlatformConnectFailed) => Some(Failed),
            (Connected, Trigger::ServicesDiscovered) => Some(ResolvingServices),
            (Connected, Trigger::ServiceDiscoveryFailed) => Some(Failed),
            (ResolvingServices, Trigger::ResolveFailed) => Some(Failed),
            (ResolvingServices, Trigger::NotificationsArmed) => Some(NotificationsEnabled),
            (NotificationsEnabled, Trigger::FirstNotification) => Some(Streaming),
            (Connected | ResolvingServices | NotificationsEnabled | Streaming, Trigger::PlatformDisconnected) => Some(Disconnected),
            _ => None,
        }
    }

    /// States in which a platform connection exists or is being established.
    pub fn holds_connection(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::ResolvingServices
                | ConnectionState::NotificationsEnabled
                | ConnectionState::Streaming
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Scanning => "Scanning…",
            ConnectionState::Found => "Found",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::ResolvingServices => "Services discovered",
            ConnectionState::NotificationsEnabled => "Notifications enabled",
            ConnectionState::Streaming => "Streaming",
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Failed => "Failed",
        };

        write!(f, "{}", result)
    }
}

/// How a configured name or UUID is compared against what the peripheral reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "camelCase")]
pub enum MatchStrategy {
    /// Full string equality. UUIDs are compared in their lower-case hyphenated form.
    #[default]
    Exact,
    /// Case-insensitive substring match.
    Partial,
}

impl MatchStrategy {
    pub fn matches(&self, pattern: &str, candidate: &str) -> bool {
        match self {
            MatchStrategy::Exact => candidate == pattern,
            MatchStrategy::Partial => candidate.to_lowercase().contains(&pattern.to_lowercase()),
        }
    }

    pub fn matches_uuid(&self, pattern: &str, uuid: &Uuid) -> bool {
        let candidate = uuid.to_string();
        match self {
            MatchStrategy::Exact => candidate == pattern.trim().to_lowercase(),
            MatchStrategy::Partial => self.matches(pattern.trim(), &candidate),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicTarget {
    /// A full UUID, or a fragment of one when `strategy` is `Partial`.
    pub service: String,
    pub characteristic: String,
    pub descriptor: Uuid,
    pub strategy: MatchStrategy,
}

impl CharacteristicTarget {
    pub fn new(service: impl Into<String>, characteristic: impl Into<String>, strategy: MatchStrategy) -> Self {
        CharacteristicTarget {
            service: service.into(),
            characteristic: characteristic.into(),
            descriptor: CCCD_UUID,
            strategy,
        }
    }
}

/// Binary layout of the notification payload. Chosen by configuration, never sniffed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "camelCase")]
pub enum PayloadLayout {
    /// 4-byte little-endian signed integer, in degrees.
    #[default]
    Int32,
    /// 2-byte little-endian signed integer, in degrees.
    Int16,
    /// UTF-8 direction label such as `"NE"` or `"Northeast"`.
    Utf8,
}

impl fmt::Display for PayloadLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            PayloadLayout::Int32 => "int32",
            PayloadLayout::Int16 => "int16",
            PayloadLayout::Utf8 => "utf8",
        };

        write!(f, "{}", result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompassDirection {
    North,
    Northeast,
    East,
    Southeast,
    South,
    Southwest,
    West,
    Northwest,
}

impl CompassDirection {
    pub const ALL: [CompassDirection; 8] = [
        CompassDirection::North,
        CompassDirection::Northeast,
        CompassDirection::East,
        CompassDirection::Southeast,
        CompassDirection::South,
        CompassDirection::Southwest,
        CompassDirection::West,
        CompassDirection::Northwest,
    ];

    pub fn abbreviation(&self) -> &'static str {
        match self {
            CompassDirection::North => "N",
            CompassDirection::Northeast => "NE",
            CompassDirection::East => "E",
            CompassDirection::Southeast => "SE",
            CompassDirection::South => "S",
            CompassDirection::Southwest => "SW",
            CompassDirection::West => "W",
            CompassDirection::Northwest => "NW",
        }
    }
}

impl fmt::Display for CompassDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl FromStr for CompassDirection {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let label = s.trim().to_lowercase().replace(['-', ' ', '_'], "");

        CompassDirection::ALL
            .into_iter()
            .find(|direction| {
                label == direction.abbreviation().to_lowercase()
                    || label == direction.to_string().to_lowercase()
            })
            .ok_or(())
    }
}

/// One decoded notification. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySample {
    pub raw_bytes: Vec<u8>,
    /// `None` for the utf-8 layout, which carries only a direction label.
    pub angle_degrees: Option<i32>,
    pub direction: CompassDirection,
    pub captured_at: SystemTime,
}

/// Snapshot of a GATT service as enumerated by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub descriptors: Vec<Uuid>,
}

/// The characteristic picked by the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicRef {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub descriptor: Uuid,
}

#[derive(Debug, Clone)]
pub enum DeviceEvent {
    StateChange(ConnectionState),
    Status(String),
    Sample(TelemetrySample),
    Error(ErrorKind, String),
}
