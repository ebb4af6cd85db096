//! Voltage Communication Link Library
//!
//! Modbus client transports for the gateway devices.
//!
//! # Architecture
//!
//! This library provides:
//! - **Core Trait**: `ModbusTransport`, the request/response primitive shared by every driver
//! - **PDU Handling**: request building and response validation for FC 03/04/06/16
//! - **ASCII Transport**: Modbus ASCII over a half-duplex serial line (LRC, CRLF framing)
//! - **TCP Transport**: Modbus/TCP with MBAP header and transaction id matching
//! - **Simulator**: in-memory register image implementing `ModbusTransport` for tests

pub mod ascii;
pub mod constants;
pub mod error;
pub mod pdu;
pub mod simulator;
pub mod tcp;
pub mod traits;

// Re-export core types
pub use ascii::{AsciiTransport, SerialParams};
pub use error::{Result, TransportError};
pub use pdu::{FunctionCode, ModbusRequest, ModbusResponse};
pub use simulator::SimulatedBus;
pub use tcp::{TcpParams, TcpTransport};
pub use traits::{ConnectionState, ModbusTransport};
