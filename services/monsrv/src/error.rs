//! Error handling for the monitor service
//!
//! Device and decode errors are cloneable so a failed block read can be
//! stored next to the cached data and reported on later API requests.

use thiserror::Error;
use voltage_comlink::TransportError;

use crate::registers::RegisterId;

/// Register table and decoding errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Requested id has no descriptor in the device table
    #[error("Unknown register {id} for {device}")]
    UnknownRegister { device: &'static str, id: RegisterId },

    /// Word count does not fit the decode rule
    #[error("Width mismatch for register {id}: expected {expected} words, got {actual}")]
    WidthMismatch {
        id: RegisterId,
        expected: usize,
        actual: usize,
    },
}

/// Device driver errors
#[derive(Error, Debug, Clone)]
pub enum DeviceError {
    /// One span of a multi-span read failed; nothing from the read is applied
    #[error("{device}: read of {count} registers at {address} failed: {source}")]
    PartialRead {
        device: &'static str,
        address: u16,
        count: u16,
        #[source]
        source: TransportError,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Write attempted on a read-only register
    #[error("Register {0} is not writable")]
    NotWritable(RegisterId),

    /// Driver has no data yet (e.g. heat pump logset not enumerated)
    #[error("Device not ready: {0}")]
    NotReady(String),
}

/// Monitor scheduler errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("Tick failed: {0}")]
    TickFailed(String),
}

/// Service level error type
#[derive(Error, Debug)]
pub enum MonSrvError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl MonSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        MonSrvError::ConfigError(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        MonSrvError::IoError(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        MonSrvError::InternalError(msg.into())
    }
}

impl From<std::io::Error> for MonSrvError {
    fn from(err: std::io::Error) -> Self {
        MonSrvError::IoError(err.to_string())
    }
}

impl From<csv::Error> for MonSrvError {
    fn from(err: csv::Error) -> Self {
        MonSrvError::IoError(format!("CSV: {}", err))
    }
}

impl From<DecodeError> for MonSrvError {
    fn from(err: DecodeError) -> Self {
        MonSrvError::Device(DeviceError::Decode(err))
    }
}

/// Result type alias for the monitor service
pub type Result<T> = std::result::Result<T, MonSrvError>;
