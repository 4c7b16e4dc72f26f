use async_trait::async_trait;

use crate::device::events::{InboundSender, SessionToken};
use crate::device::types::{CharacteristicRef, PeripheralDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Enabled,
    Disabled,
}

/// Capabilities of the platform bluetooth stack.
///
/// Every request method returns immediately. Completion is reported later by sending an
/// `InboundEvent` tagged with `session` on `events`. Implementations must tolerate requests for
/// sessions that have since been abandoned; the link task discards what they report.
#[async_trait]
pub trait AdapterHandle: Send + Sync {
    async fn state(&self) -> AdapterState;

    /// Start delivering `InboundEvent::Discovery` events until `stop_scan`.
    fn start_scan(&self, session: SessionToken, events: InboundSender);

    fn stop_scan(&self);

    /// Report `PlatformConnection::Connected` or `ConnectFailed`, and later `Disconnected`
    /// if the link drops.
    fn connect(&self, session: SessionToken, peripheral: &PeripheralDescriptor, events: InboundSender);

    fn discover_services(&self, session: SessionToken, events: InboundSender);

    /// Enable local delivery for the characteristic and write the enable value to its CCCD.
    /// Reports `NotificationsArmed`, then `CharacteristicChanged` for every notification.
    fn enable_notifications(&self, session: SessionToken, characteristic: CharacteristicRef, events: InboundSender);

    /// Drop the connection (if any) and every handle that belongs to it.
    fn disconnect(&self);
}
