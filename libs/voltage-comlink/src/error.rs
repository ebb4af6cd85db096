//! Communication Link Error Types
//!
//! Transport-level failures of a single Modbus request.

use thiserror::Error;

/// Result type for voltage-comlink operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Transport errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    /// No (complete) reply within the request timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Reply received but its checksum does not match
    #[error("Checksum error: expected {expected:02X}, got {actual:02X}")]
    Checksum { expected: u8, actual: u8 },

    /// Reply is not a well-formed frame or does not match the request
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Link unusable (not open, reconnect failed)
    #[error("Bus busy: {0}")]
    BusBusy(String),

    /// Request aborted because the transport was closed
    #[error("Request cancelled")]
    Cancelled,

    /// Modbus exception reply from the device
    #[error("Modbus exception {code:02X} ({description}) for FC {function:02X}")]
    Exception {
        function: u8,
        code: u8,
        description: &'static str,
    },

    /// IO errors
    #[error("IO error: {0}")]
    Io(String),

    /// Invalid request or transport parameters
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

// Helper methods for creating errors
impl TransportError {
    pub fn timeout(msg: impl Into<String>) -> Self {
        TransportError::Timeout(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        TransportError::MalformedFrame(msg.into())
    }

    pub fn busy(msg: impl Into<String>) -> Self {
        TransportError::BusBusy(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        TransportError::Config(msg.into())
    }

    /// Check if this error indicates a broken connection
    pub fn needs_reconnect(&self) -> bool {
        match self {
            TransportError::Io(msg) => {
                msg.contains("Broken pipe")
                    || msg.contains("Connection reset")
                    || msg.contains("Connection refused")
                    || msg.contains("Connection aborted")
                    || msg.contains("early eof")
                    || msg.contains("Network is unreachable")
            },
            TransportError::BusBusy(_) => true,
            _ => false,
        }
    }
}
