use futures::channel::mpsc::UnboundedSender;
use log::warn;

use crate::device::types::{ConnectionState, DeviceEvent, TelemetrySample};
use crate::error::ErrorKind;

/// Consumer of everything the link reports. Called from the link task only, in order.
pub trait EventSink: Send {
    fn on_state_change(&mut self, _state: ConnectionState) {}

    fn on_status(&mut self, text: &str);

    fn on_sample(&mut self, sample: TelemetrySample);

    fn on_error(&mut self, kind: ErrorKind, detail: &str);
}

/// Fans every callback out as a `DeviceEvent` to any number of receivers.
pub struct ChannelSink {
    senders: Vec<UnboundedSender<DeviceEvent>>,
}

impl ChannelSink {
    pub fn new(senders: Vec<UnboundedSender<DeviceEvent>>) -> Self {
        ChannelSink { senders }
    }

    fn send(&mut self, event: DeviceEvent) {
        // receivers that went away are dropped for good
        self.senders.retain(|sender| {
            match sender.unbounded_send(event.clone()) {
                Ok(()) => true,
                Err(err) => {
                    warn!("Dropping closed DeviceEvent receiver: {}", err);
                    false
                },
            }
        });
    }
}

impl EventSink for ChannelSink {
    fn on_state_change(&mut self, state: ConnectionState) {
        self.send(DeviceEvent::StateChange(state));
    }

    fn on_status(&mut self, text: &str) {
        self.send(DeviceEvent::Status(text.to_string()));
    }

    fn on_sample(&mut self, sample: TelemetrySample) {
        self.send(DeviceEvent::Sample(sample));
    }

    fn on_error(&mut self, kind: ErrorKind, detail: &str) {
        self.send(DeviceEvent::Error(kind, detail.to_string()));
    }
}
