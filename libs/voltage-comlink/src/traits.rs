//! Core Communication Traits
//!
//! `ModbusTransport` is the seam between device drivers and the byte-level
//! transports (ASCII serial, TCP, in-memory simulator).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::pdu::{ModbusRequest, ModbusResponse};

// ============================================================================
// Connection State
// ============================================================================

/// Connection state of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConnectionState {
    /// Not opened yet
    #[default]
    Closed,
    /// Opening / connecting
    Connecting,
    /// Ready for requests
    Connected,
    /// Link lost, next request reconnects
    Disconnected,
}

impl ConnectionState {
    /// Check if state represents an active connection
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Closed => write!(f, "CLOSED"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
        }
    }
}

// ============================================================================
// Transport Trait
// ============================================================================

/// Request/response primitive shared by every Modbus transport
///
/// Implementations bound each request by a timeout and fail it with
/// `TransportError::Cancelled` once the transport is closed.
#[async_trait]
pub trait ModbusTransport: Send + Sync {
    /// Transport name for logging
    fn name(&self) -> &str;

    /// Current connection state
    fn state(&self) -> ConnectionState;

    /// Send one function-coded request and wait for the matching reply
    async fn request(&self, request: &ModbusRequest) -> Result<ModbusResponse>;

    /// Read a span of holding registers
    async fn read_holding_registers(&self, unit: u8, address: u16, count: u16) -> Result<Vec<u16>> {
        self.request(&ModbusRequest::read_holding(unit, address, count))
            .await?
            .into_registers()
    }

    /// Read a span of input registers
    async fn read_input_registers(&self, unit: u8, address: u16, count: u16) -> Result<Vec<u16>> {
        self.request(&ModbusRequest::read_input(unit, address, count))
            .await?
            .into_registers()
    }

    /// Write one or more consecutive holding registers
    async fn write_registers(&self, unit: u8, address: u16, values: &[u16]) -> Result<()> {
        let request = match values {
            [value] => ModbusRequest::write_single(unit, address, *value),
            _ => ModbusRequest::write_multiple(unit, address, values.to_vec()),
        };
        self.request(&request).await.map(|_| ())
    }
}
