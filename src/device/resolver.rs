use log::{info, warn};

use crate::device::adapter::AdapterHandle;
use crate::device::events::{InboundSender, SessionToken};
use crate::device::types::{CharacteristicRef, CharacteristicTarget, ConnectionState, ServiceInfo};
use crate::error::LinkError;

/// Picks the target characteristic out of a discovered GATT table and arms its notifications.
#[derive(Debug)]
pub struct ServiceResolver {
    target: CharacteristicTarget,
    attempted: bool,
}

impl ServiceResolver {
    pub fn new(target: CharacteristicTarget) -> Self {
        ServiceResolver { target, attempted: false }
    }

    pub fn target(&self) -> &CharacteristicTarget {
        &self.target
    }

    /// Allow one more resolution; called for every new connection.
    pub fn reset(&mut self) {
        self.attempted = false;
    }

    /// The first matching service/characteristic pair in platform order wins.
    pub fn find(&self, services: &[ServiceInfo]) -> Result<CharacteristicRef, LinkError> {
        let target = &self.target;
        let mut service_matched = false;

        for service in services.iter().filter(|service| target.strategy.matches_uuid(&target.service, &service.uuid)) {
            service_matched = true;

            let found = service.characteristics
                .iter()
                .find(|characteristic| target.strategy.matches_uuid(&target.characteristic, &characteristic.uuid));

            if let Some(characteristic) = found {
                if !characteristic.descriptors.contains(&target.descriptor) {
                    return Err(LinkError::DescriptorNotFound {
                        characteristic: characteristic.uuid.to_string(),
                        descriptor: target.descriptor.to_string(),
                    });
                }

                return Ok(CharacteristicRef {
                    service: service.uuid,
                    characteristic: characteristic.uuid,
                    descriptor: target.descriptor,
                });
            }
        }

        if service_matched {
            Err(LinkError::CharacteristicNotFound {
                service: target.service.clone(),
                characteristic: target.characteristic.clone(),
            })
        } else {
            Err(LinkError::ServiceNotFound { service: target.service.clone() })
        }
    }

    /// Only one call per connection is accepted. On success the platform has been asked to
    /// enable notifications; it answers with `InboundEvent::NotificationsArmed`.
    pub fn resolve_and_subscribe(
        &mut self,
        services: &[ServiceInfo],
        adapter: &dyn AdapterHandle,
        session: SessionToken,
        events: InboundSender,
    ) -> Result<CharacteristicRef, LinkError> {
        if self.attempted {
            return Err(LinkError::InvalidStateTransition {
                from: ConnectionState::ResolvingServices,
                operation: "ResolveAndSubscribe",
            });
        }
        self.attempted = true;

        let characteristic = self.find(services).map_err(|err| {
            warn!("Resolving {:?} failed: {}", self.target, err);
            err
        })?;

        info!("Subscribing to characteristic {:?} {:?}", characteristic.service, characteristic.characteristic);
        adapter.enable_notifications(session, characteristic, events);

        Ok(characteristic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc::channel;
    use uuid::Uuid;
    use crate::device::constants::*;
    use crate::device::testing::FakeAdapter;
    use crate::device::types::{CharacteristicInfo, MatchStrategy};

    fn gatt_table() -> Vec<ServiceInfo> {
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

    #[test]
    fn exact_match() {
        let resolver = ServiceResolver::new(CharacteristicTarget::new(ANGLE_SERVICE, ANGLE_CHARACTERISTIC, MatchStrategy::Exact));

        let found = resolver.find(&gatt_table()).unwrap();
        assert_eq!(found.service, ANGLE_SERVICE_UUID);
        assert_eq!(found.characteristic, ANGLE_CHARACTERISTIC_UUID);
        assert_eq!(found.descriptor, CCCD_UUID);
    }

    #[test]
    fn exact_match_ignores_case() {
        let resolver = ServiceResolver::new(CharacteristicTarget::new(
            ANGLE_SERVICE.to_uppercase(),
            ANGLE_CHARACTERISTIC.to_uppercase(),
            MatchStrategy::Exact,
        ));

        assert!(resolver.find(&gatt_table()).is_ok());
    }

    #[test]
    fn partial_match() {
        let resolver = ServiceResolver::new(CharacteristicTarget::new("0000180A", "2a57", MatchStrategy::Partial));

        let found = resolver.find(&gatt_table()).unwrap();
        assert_eq!(found.service, DEVICE_INFORMATION_SERVICE_UUID);
        assert_eq!(found.characteristic, DIGITAL_CHARACTERISTIC_UUID);
    }

    #[test]
    fn exact_does_not_accept_fragments() {
        let resolver = ServiceResolver::new(CharacteristicTarget::new("0000180a", "2a57", MatchStrategy::Exact));

        assert_eq!(resolver.find(&gatt_table()), Err(LinkError::ServiceNotFound { service: "0000180a".to_string() }));
    }

    #[test]
    fn first_match_wins() {
        // "-" occurs in every uuid, so the first service and its first characteristic win
        let resolver = ServiceResolver::new(CharacteristicTarget::new("-", "-", MatchStrategy::Partial));

        let found = resolver.find(&gatt_table()).unwrap();
        assert_eq!(found.service, DEVICE_INFORMATION_SERVICE_UUID);
        assert_eq!(found.characteristic, DIGITAL_CHARACTERISTIC_UUID);
    }

    #[test]
    fn missing_characteristic() {
        let resolver = ServiceResolver::new(CharacteristicTarget::new(ANGLE_SERVICE, "00002a19", MatchStrategy::Partial));

        assert_eq!(
            resolver.find(&gatt_table()),
            Err(LinkError::CharacteristicNotFound {
                service: ANGLE_SERVICE.to_string(),
                characteristic: "00002a19".to_string(),
            }),
        );
    }

    #[test]
    fn missing_descriptor() {
        let resolver = ServiceResolver::new(CharacteristicTarget::new("180a", "2a19", MatchStrategy::Partial));

        assert_eq!(
            resolver.find(&gatt_table()),
            Err(LinkError::DescriptorNotFound {
                characteristic: BATTERY_LEVEL_CHARACTERISTIC_UUID.to_string(),
                descriptor: CCCD_UUID.to_string(),
            }),
        );
    }

    #[test]
    fn subscribes_once_per_connection() {
        let adapter = FakeAdapter::default();
        let (events, _rx) = channel(8);
        let session = SessionToken::default().next();
        let mut resolver = ServiceResolver::new(CharacteristicTarget::new(ANGLE_SERVICE, ANGLE_CHARACTERISTIC, MatchStrategy::Exact));

        resolver.resolve_and_subscribe(&gatt_table(), &adapter, session, events.clone()).unwrap();
        let second = resolver.resolve_and_subscribe(&gatt_table(), &adapter, session, events.clone());
        assert!(matches!(second, Err(LinkError::InvalidStateTransition { .. })));

        let calls = adapter.calls();
        assert_eq!(calls.enable_notifications.len(), 1);
        assert_eq!(calls.enable_notifications[0].1.characteristic, ANGLE_CHARACTERISTIC_UUID);

        resolver.reset();
        assert!(resolver.resolve_and_subscribe(&gatt_table(), &adapter, session, events).is_ok());
    }

    #[test]
    fn failed_resolution_does_not_subscribe() {
        let adapter = FakeAdapter::default();
        let (events, _rx) = channel(8);
        let unknown = Uuid::from_u128(0xdeadbeef).to_string();
        let mut resolver = ServiceResolver::new(CharacteristicTarget::new(unknown, ANGLE_CHARACTERISTIC, MatchStrategy::Exact));

        let result = resolver.resolve_and_subscribe(&gatt_table(), &adapter, SessionToken::default(), events);
        assert!(matches!(result, Err(LinkError::ServiceNotFound { .. })));
        assert!(adapter.calls().enable_notifications.is_empty());
    }
}
