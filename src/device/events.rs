use std::fmt;
use std::time::SystemTime;
use futures::channel::mpsc::Sender;
use uuid::Uuid;

use crate::device::types::{PeripheralDescriptor, ServiceInfo};

/// Identifies one scan/connect session. Callbacks carry the token that was current when their
/// request was issued; the link task drops any event whose token is no longer current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SessionToken(u64);

impl SessionToken {
    pub fn next(self) -> SessionToken {
        SessionToken(self.0.wrapping_add(1))
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEvent {
    pub session: SessionToken,
    pub peripheral: PeripheralDescriptor,
    pub rssi: Option<i16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformConnection {
    Connected,
    ConnectFailed(String),
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStateEvent {
    pub session: SessionToken,
    pub change: PlatformConnection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicesDiscoveredEvent {
    pub session: SessionToken,
    pub result: Result<Vec<ServiceInfo>, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicChangedEvent {
    pub session: SessionToken,
    pub characteristic: Uuid,
    pub value: Vec<u8>,
    pub received_at: SystemTime,
}

/// Everything the platform (or one of the link task's own timers) reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Discovery(DiscoveryEvent),
    ScanFailed { session: SessionToken, detail: String },
    ConnectionState(ConnectionStateEvent),
    ServicesDiscovered(ServicesDiscoveredEvent),
    NotificationsArmed { session: SessionToken, result: Result<(), String> },
    CharacteristicChanged(CharacteristicChangedEvent),
    GraceElapsed { session: SessionToken },
    ScanDeadline { session: SessionToken },
}

impl InboundEvent {
    pub fn session(&self) -> SessionToken {
        match self {
            InboundEvent::Discovery(event) => event.session,
            InboundEvent::ScanFailed { session, .. } => *session,
            InboundEvent::ConnectionState(event) => event.session,
            InboundEvent::ServicesDiscovered(event) => event.session,
            InboundEvent::NotificationsArmed { session, .. } => *session,
            InboundEvent::CharacteristicChanged(event) => event.session,
            InboundEvent::GraceElapsed { session } => *session,
            InboundEvent::ScanDeadline { session } => *session,
        }
    }
}

pub type InboundSender = Sender<InboundEvent>;
