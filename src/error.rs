use std::io;
use std::str::Utf8Error;
use thiserror::Error;
use btleplug;
use serde_json;
use log::SetLoggerError;

use crate::device::types::{ConnectionState, PayloadLayout};

/// Failure categories reported to an `EventSink`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    AdapterUnavailable,
    AdapterDisabled,
    ScanTimeout,
    ScanFailed,
    ConnectionAlreadyInProgress,
    InvalidStateTransition,
    PlatformConnectFailed,
    ServiceDiscoveryFailed,
    ServiceNotFound,
    CharacteristicNotFound,
    DescriptorNotFound,
    SubscribeFailed,
    PayloadTooShort,
    PayloadDecodeError,
    ChannelClosed,
}

impl ErrorKind {
    /// Whether starting a fresh scan/connect cycle can be expected to get past this failure.
    /// Adapter problems and GATT table mismatches fail identically on every retry.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ErrorKind::ScanTimeout
            | ErrorKind::ScanFailed
            | ErrorKind::PlatformConnectFailed
            | ErrorKind::ServiceDiscoveryFailed
            | ErrorKind::SubscribeFailed
            | ErrorKind::PayloadTooShort
            | ErrorKind::PayloadDecodeError => true,
            ErrorKind::AdapterUnavailable
            | ErrorKind::AdapterDisabled
            | ErrorKind::ConnectionAlreadyInProgress
            | ErrorKind::InvalidStateTransition
            | ErrorKind::ServiceNotFound
            | ErrorKind::CharacteristicNotFound
            | ErrorKind::DescriptorNotFound
            | ErrorKind::ChannelClosed => false,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Payload of {actual} bytes does not fit the {layout} layout (expected {expected})")]
    PayloadTooShort { layout: PayloadLayout, expected: usize, actual: usize },

    #[error("Payload is not valid utf-8: {source}")]
    InvalidUtf8 { #[from] source: Utf8Error },

    #[error("Payload {label:?} is not a compass direction")]
    UnknownDirection { label: String },
}

impl DecodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DecodeError::PayloadTooShort { .. } => ErrorKind::PayloadTooShort,
            DecodeError::InvalidUtf8 { .. } | DecodeError::UnknownDirection { .. } => ErrorKind::PayloadDecodeError,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("No bluetooth adapter is available")]
    AdapterUnavailable,

    #[error("Bluetooth is turned off")]
    AdapterDisabled,

    #[error("No peripheral matching {name_filter:?} was found in time")]
    ScanTimeout { name_filter: String },

    #[error("The platform failed to start scanning: {detail}")]
    ScanFailed { detail: String },

    #[error("A connection attempt is already in progress")]
    ConnectionAlreadyInProgress,

    #[error("{operation} is not valid in state {from:?}")]
    InvalidStateTransition { from: ConnectionState, operation: &'static str },

    #[error("Connecting to {address} failed: {detail}")]
    PlatformConnectFailed { address: String, detail: String },

    #[error("Discovering services failed: {detail}")]
    ServiceDiscoveryFailed { detail: String },

    #[error("No service matching {service} was found")]
    ServiceNotFound { service: String },

    #[error("No characteristic matching {characteristic} was found in service {service}")]
    CharacteristicNotFound { service: String, characteristic: String },

    #[error("Characteristic {characteristic} has no descriptor {descriptor}")]
    DescriptorNotFound { characteristic: String, descriptor: String },

    #[error("Enabling notifications on {characteristic} failed: {detail}")]
    SubscribeFailed { characteristic: String, detail: String },

    #[error("Failed to decode notification: {source}")]
    Decode { #[from] source: DecodeError },

    #[error("The link task is no longer running")]
    ChannelClosed,
}

impl LinkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LinkError::AdapterUnavailable => ErrorKind::AdapterUnavailable,
            LinkError::AdapterDisabled => ErrorKind::AdapterDisabled,
            LinkError::ScanTimeout { .. } => ErrorKind::ScanTimeout,
            LinkError::ScanFailed { .. } => ErrorKind::ScanFailed,
            LinkError::ConnectionAlreadyInProgress => ErrorKind::ConnectionAlreadyInProgress,
            LinkError::InvalidStateTransition { .. } => ErrorKind::InvalidStateTransition,
            LinkError::PlatformConnectFailed { .. } => ErrorKind::PlatformConnectFailed,
            LinkError::ServiceDiscoveryFailed { .. } => ErrorKind::ServiceDiscoveryFailed,
            LinkError::ServiceNotFound { .. } => ErrorKind::ServiceNotFound,
            LinkError::CharacteristicNotFound { .. } => ErrorKind::CharacteristicNotFound,
            LinkError::DescriptorNotFound { .. } => ErrorKind::DescriptorNotFound,
            LinkError::SubscribeFailed { .. } => ErrorKind::SubscribeFailed,
            LinkError::Decode { source } => source.kind(),
            LinkError::ChannelClosed => ErrorKind::ChannelClosed,
        }
    }
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("Peripheral {address} was not seen during the scan")]
    UnknownPeripheral { address: String },

    #[error("There is no connected peripheral")]
    NotConnected,

    #[error("A required bluetooth characteristic is not available")]
    MissingCharacteristic,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start application (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start application (bluetooth): {source}")]
    DeviceError { #[from] source: DeviceError },

    #[error("Failed to start application (link): {source}")]
    LinkError { #[from] source: LinkError },

    #[error("Failed to open log file: {source}")]
    LogFile { source: io::Error },

    #[error("Failed to initialize logger: {source}")]
    Logger { #[from] source: SetLoggerError },

    #[error("Failed to wait for the interrupt signal: {source}")]
    Signal { source: io::Error },

    #[error("Gave up in state {state:?} after {error:?}")]
    LinkStopped { state: ConnectionState, error: Option<ErrorKind> },
}
