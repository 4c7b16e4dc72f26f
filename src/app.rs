use std::path::PathBuf;
use std::sync::Arc;
use clap::Parser;
use futures::StreamExt;
use futures::channel::mpsc::{unbounded, UnboundedReceiver};
use log::{debug, info, warn};
use tokio::signal;
use tokio::spawn;
use tokio_util::sync::CancellationToken;

use crate::config::io::ConfigIO;
use crate::config::types::Config;
use crate::device::adapter::AdapterHandle;
use crate::device::btle::BtleplugAdapter;
use crate::device::connection::spawn_link;
use crate::device::simulated::{SimulatedAdapter, SimulatedPeripheral};
use crate::device::sink::ChannelSink;
use crate::device::supervisor::{supervise, SupervisorExit};
use crate::device::types::{DeviceEvent, MatchStrategy, PayloadLayout, PeripheralDescriptor, TelemetrySample};
use crate::error::AppRunError;

#[derive(Parser, Debug, Default)]
#[command(author, version)]
#[command(about = "Streams heading telemetry from an Arduino_GCS bluetooth compass.\n\nExample: gcs-compass --simulate --json", long_about = None)]
pub struct Args {
    /// Path to the JSON config file. Defaults to <executable>.json if it exists, else the user config directory
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Save the effective configuration (file plus flags) and exit
    #[arg(long)]
    pub write_config: bool,

    /// Advertised name of the peripheral
    #[arg(long)]
    pub name: Option<String>,

    #[arg(long, value_enum)]
    pub name_match: Option<MatchStrategy>,

    /// UUID (or UUID fragment, with --uuid-match partial) of the telemetry service
    #[arg(long)]
    pub service: Option<String>,

    /// UUID (or UUID fragment, with --uuid-match partial) of the telemetry characteristic
    #[arg(long)]
    pub characteristic: Option<String>,

    #[arg(long, value_enum)]
    pub uuid_match: Option<MatchStrategy>,

    /// Binary layout of the notification payload
    #[arg(long, value_enum)]
    pub layout: Option<PayloadLayout>,

    /// Delay between connecting and discovering services, in milliseconds
    #[arg(long)]
    pub grace_ms: Option<u64>,

    /// Give up a scan after this many seconds; 0 scans forever
    #[arg(long)]
    pub scan_timeout_secs: Option<u64>,

    /// Scan again this many seconds after the link drops; 0 disables
    #[arg(long)]
    pub rescan_secs: Option<u64>,

    /// Only scan for the peripheral; do not connect to it
    #[arg(long)]
    pub no_auto_connect: bool,

    /// Talk to a simulated peripheral instead of the bluetooth adapter
    #[arg(long)]
    pub simulate: bool,

    /// Print every sample as one line of JSON
    #[arg(long)]
    pub json: bool,

    #[arg(short, long)]
    pub verbose: bool,
}

fn non_zero(value: u64) -> Option<u64> {
    if value == 0 { None } else { Some(value) }
}

impl Args {
    /// Overrides the values of `config` that were given on the command line.
    pub fn apply(&self, config: &mut Config) {
        if let Some(name) = &self.name {
            config.device_name = name.clone();
        }
        if let Some(name_match) = self.name_match {
            config.name_match = name_match;
        }
        if let Some(service) = &self.service {
            config.service_uuid = service.clone();
        }
        if let Some(characteristic) = &self.characteristic {
            config.characteristic_uuid = characteristic.clone();
        }
        if let Some(uuid_match) = self.uuid_match {
            config.uuid_match = uuid_match;
        }
        if let Some(layout) = self.layout {
            config.payload_layout = layout;
        }
        if let Some(grace_ms) = self.grace_ms {
            config.discovery_grace_ms = grace_ms;
        }
        if let Some(secs) = self.scan_timeout_secs {
            config.scan_timeout_ms = non_zero(secs).map(|secs| secs * 1000);
        }
        if let Some(secs) = self.rescan_secs {
            config.rescan_interval_ms = non_zero(secs).map(|secs| secs * 1000);
        }
        if self.no_auto_connect {
            config.auto_connect = false;
        }
    }
}

/// A board advertising the configured name, among bystanders that do not match it.
pub fn simulated_adapter(config: &Config) -> SimulatedAdapter {
    let defaults = SimulatedPeripheral::default();
    let board = SimulatedPeripheral {
        descriptor: PeripheralDescriptor { name: config.device_name.clone(), ..defaults.descriptor.clone() },
        layout: config.payload_layout,
        ..defaults
    };

    let mut bystanders = SimulatedAdapter::default_bystanders();
    bystanders.retain(|bystander| !config.name_match.matches(&config.device_name, &bystander.name));

    SimulatedAdapter::new(board).with_bystanders(bystanders)
}

pub fn format_sample(sample: &TelemetrySample) -> String {
    let angle = match sample.angle_degrees {
        Some(angle) => format!("{:>3}°", angle),
        None => "   -".to_string(),
    };

    format!("{} {:<2} {}", angle, sample.direction.abbreviation(), sample.direction)
}

async fn print_events(mut events: UnboundedReceiver<DeviceEvent>, json: bool) {
    while let Some(event) = events.next().await {
        match event {
            DeviceEvent::Sample(sample) if json => match serde_json::to_string(&sample) {
                Ok(line) => println!("{}", line),
                Err(err) => warn!("Failed to encode sample: {}", err),
            },
            DeviceEvent::Sample(sample) => println!("{}", format_sample(&sample)),
            DeviceEvent::Status(text) => info!("{}", text),
            DeviceEvent::StateChange(_) => {},
            DeviceEvent::Error(kind, detail) => debug!("{}: {}", kind, detail),
        }
    }
}

pub async fn run_application(args: Args) -> Result<(), AppRunError> {
    let config_io = ConfigIO::new_sync(args.config.clone())?;
    let mut config_locker = config_io.locker()?;
    let _lock_guard = config_locker.lock()?;

    let mut config = config_io.read().await?;
    args.apply(&mut config);

    if args.write_config {
        config_io.save(&config).await?;
        return Ok(());
    }

    let adapter = if args.simulate {
        info!("Using a simulated peripheral");
        Some(Arc::new(simulated_adapter(&config)) as Arc<dyn AdapterHandle>)
    } else {
        BtleplugAdapter::discover().await?.map(|adapter| Arc::new(adapter) as Arc<dyn AdapterHandle>)
    };

    let (console_sender, console_receiver) = unbounded();
    let (supervisor_sender, supervisor_receiver) = unbounded();
    let sink = ChannelSink::new(vec![console_sender, supervisor_sender]);

    let cancel = CancellationToken::new();
    let (link, link_task) = spawn_link(adapter, config.link_settings(), Box::new(sink), cancel.child_token());
    let console_task = spawn(print_events(console_receiver, args.json));

    let exit = tokio::select! {
        result = signal::ctrl_c() => {
            result
                .map(|()| SupervisorExit::Cancelled)
                .map_err(|source| AppRunError::Signal { source })
        },
        exit = supervise(link, supervisor_receiver, config.rescan_policy(), cancel.child_token()) => {
            exit.map_err(AppRunError::from)
        },
    };

    info!("Stopping");
    cancel.cancel();

    if let Err(err) = link_task.await {
        warn!("Link task failed: {}", err);
    }
    if let Err(err) = console_task.await {
        warn!("Console task failed: {}", err);
    }

    match exit? {
        SupervisorExit::Stopped { state, error } => Err(AppRunError::LinkStopped { state, error }),
        SupervisorExit::Cancelled | SupervisorExit::LinkClosed => Ok(()),
    }
}
