use futures::StreamExt;
use futures::channel::mpsc::UnboundedReceiver;
use log::{info, warn};
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::device::connection::LinkHandle;
use crate::device::types::{ConnectionState, DeviceEvent};
use crate::error::{ErrorKind, LinkError};

/// When to start over after the link stops streaming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RescanPolicy {
    pub name_filter: String,
    /// `None` disables re-scanning; the supervisor stops at the first terminal state.
    pub delay: Option<Duration>,
}

impl RescanPolicy {
    /// Whether the link should scan again after entering `state`, given the last reported error.
    pub fn rescan_after(&self, state: ConnectionState, last_error: Option<ErrorKind>) -> bool {
        if self.delay.is_none() {
            return false;
        }

        match state {
            ConnectionState::Disconnected => true,
            ConnectionState::Idle => last_error == Some(ErrorKind::ScanTimeout),
            ConnectionState::Failed => last_error.map_or(false, |kind| kind.is_recoverable()),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorExit {
    Cancelled,
    /// The link task went away.
    LinkClosed,
    /// The link reached a state the policy does not retry from.
    Stopped { state: ConnectionState, error: Option<ErrorKind> },
}

/// Starts the first scan and keeps the link scanning according to `policy`.
/// `events` must be a receiver of the link's `ChannelSink`.
/// A scan that can not be started for a non-recoverable reason ends the supervisor with that error.
pub async fn supervise(
    link: LinkHandle,
    mut events: UnboundedReceiver<DeviceEvent>,
    policy: RescanPolicy,
    cancel: CancellationToken,
) -> Result<SupervisorExit, LinkError> {
    link.start_scan(policy.name_filter.as_str()).await?;

    let mut last_error: Option<ErrorKind> = None;
    let mut rescan_at: Option<Instant> = None;

    'mainloop: loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                return Ok(SupervisorExit::Cancelled);
            },
            _ = sleep_until(rescan_at.unwrap_or_else(Instant::now)), if rescan_at.is_some() => {
                rescan_at = None;
                last_error = None;

                match link.start_scan(policy.name_filter.as_str()).await {
                    Ok(()) => {},
                    Err(err) if !err.kind().is_recoverable() => {
                        warn!("Not scanning again: {}", err);
                        return Err(err);
                    },
                    Err(err) => {
                        warn!("Re-scan failed: {}", err);
                        rescan_at = policy.delay.map(|delay| Instant::now() + delay);
                    },
                }
            },
            event = events.next() => {
                let state = match event {
                    None => break 'mainloop,
                    Some(DeviceEvent::Error(kind, _)) => {
                        last_error = Some(kind);
                        continue 'mainloop;
                    },
                    Some(DeviceEvent::StateChange(state)) => state,
                    Some(_) => continue 'mainloop,
                };

                if state == ConnectionState::Streaming {
                    last_error = None;
                }

                if !matches!(state, ConnectionState::Idle | ConnectionState::Disconnected | ConnectionState::Failed) {
                    continue 'mainloop;
                }

                if policy.rescan_after(state, last_error) {
                    if let Some(delay) = policy.delay {
                        info!("Scanning again in {}", humantime::format_duration(delay));
                        rescan_at = Some(Instant::now() + delay);
                    }
                } else {
                    warn!("Not scanning again after {:?} ({:?})", state, last_error);
                    return Ok(SupervisorExit::Stopped { state, error: last_error });
                }
            },
        }
    }

    Ok(SupervisorExit::LinkClosed)
}
