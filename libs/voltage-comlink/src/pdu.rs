//! Modbus PDU building and response validation
//!
//! Transport-independent part of a transaction: the function-coded request,
//! the PDU bytes sent for it and the checks applied to the reply PDU.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{MAX_READ_REGISTERS, MAX_WRITE_REGISTERS};
use crate::error::{Result, TransportError};

/// Supported function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FunctionCode {
    ReadHoldingRegisters,
    ReadInputRegisters,
    WriteSingleRegister,
    WriteMultipleRegisters,
}

impl FunctionCode {
    pub fn code(self) -> u8 {
        match self {
            FunctionCode::ReadHoldingRegisters => 0x03,
            FunctionCode::ReadInputRegisters => 0x04,
            FunctionCode::WriteSingleRegister => 0x06,
            FunctionCode::WriteMultipleRegisters => 0x10,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x03 => Some(FunctionCode::ReadHoldingRegisters),
            0x04 => Some(FunctionCode::ReadInputRegisters),
            0x06 => Some(FunctionCode::WriteSingleRegister),
            0x10 => Some(FunctionCode::WriteMultipleRegisters),
            _ => None,
        }
    }

    pub fn is_read(self) -> bool {
        matches!(
            self,
            FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters
        )
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FC{:02}", self.code())
    }
}

/// One register request addressed to a unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusRequest {
    pub unit: u8,
    pub function: FunctionCode,
    pub address: u16,
    pub count: u16,
    /// Register values for write requests
    pub values: Vec<u16>,
}

impl ModbusRequest {
    pub fn read_holding(unit: u8, address: u16, count: u16) -> Self {
        Self {
            unit,
            function: FunctionCode::ReadHoldingRegisters,
            address,
            count,
            values: Vec::new(),
        }
    }

    pub fn read_input(unit: u8, address: u16, count: u16) -> Self {
        Self {
            unit,
            function: FunctionCode::ReadInputRegisters,
            address,
            count,
            values: Vec::new(),
        }
    }

    pub fn write_single(unit: u8, address: u16, value: u16) -> Self {
        Self {
            unit,
            function: FunctionCode::WriteSingleRegister,
            address,
            count: 1,
            values: vec![value],
        }
    }

    pub fn write_multiple(unit: u8, address: u16, values: Vec<u16>) -> Self {
        Self {
            unit,
            function: FunctionCode::WriteMultipleRegisters,
            address,
            count: values.len() as u16,
            values,
        }
    }

    /// Check quantity limits and write payload consistency
    pub fn validate(&self) -> Result<()> {
        match self.function {
            FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
                if self.count == 0 || self.count > MAX_READ_REGISTERS {
                    return Err(TransportError::config(format!(
                        "Read quantity {} out of range 1..={}",
                        self.count, MAX_READ_REGISTERS
                    )));
                }
            },
            FunctionCode::WriteSingleRegister => {
                if self.values.len() != 1 {
                    return Err(TransportError::config(
                        "Write single register needs exactly one value",
                    ));
                }
            },
            FunctionCode::WriteMultipleRegisters => {
                if self.values.is_empty() || self.values.len() > MAX_WRITE_REGISTERS as usize {
                    return Err(TransportError::config(format!(
                        "Write quantity {} out of range 1..={}",
                        self.values.len(),
                        MAX_WRITE_REGISTERS
                    )));
                }
            },
        }
        if u32::from(self.address) + u32::from(self.count) > 0x1_0000 {
            return Err(TransportError::config(format!(
                "Register range {}+{} exceeds address space",
                self.address, self.count
            )));
        }
        Ok(())
    }

    /// Build the request PDU (function code + data)
    pub fn to_pdu(&self) -> Vec<u8> {
        let mut pdu = Vec::with_capacity(6 + self.values.len() * 2);
        pdu.push(self.function.code());
        pdu.extend_from_slice(&self.address.to_be_bytes());
        match self.function {
            FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
                pdu.extend_from_slice(&self.count.to_be_bytes());
            },
            FunctionCode::WriteSingleRegister => {
                let value = self.values.first().copied().unwrap_or(0);
                pdu.extend_from_slice(&value.to_be_bytes());
            },
            FunctionCode::WriteMultipleRegisters => {
                pdu.extend_from_slice(&self.count.to_be_bytes());
                pdu.push((self.values.len() * 2) as u8);
                for v in &self.values {
                    pdu.extend_from_slice(&v.to_be_bytes());
                }
            },
        }
        pdu
    }
}

/// Validated reply to a `ModbusRequest`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusResponse {
    /// Register words of a read, in address order
    Registers(Vec<u16>),
    /// Acknowledged write
    Written { address: u16, count: u16 },
}

impl ModbusResponse {
    /// Register words, or an error for write acknowledgements
    pub fn into_registers(self) -> Result<Vec<u16>> {
        match self {
            ModbusResponse::Registers(words) => Ok(words),
            ModbusResponse::Written { .. } => Err(TransportError::malformed(
                "Write acknowledgement where register data was expected",
            )),
        }
    }
}

/// Verify if PDU is exception response
pub fn is_exception_response(pdu: &[u8]) -> bool {
    !pdu.is_empty() && (pdu[0] & 0x80) != 0
}

/// Get exception description
pub fn exception_description(exception_code: u8) -> &'static str {
    match exception_code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Slave Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Slave Device Busy",
        0x07 => "Negative Acknowledge",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Device Failed to Respond",
        _ => "Unknown Exception",
    }
}

/// Validate a reply PDU against its request
pub fn parse_response_pdu(request: &ModbusRequest, pdu: &[u8]) -> Result<ModbusResponse> {
    let Some(&fc) = pdu.first() else {
        return Err(TransportError::malformed("Empty response PDU"));
    };

    if is_exception_response(pdu) {
        let code = pdu.get(1).copied().ok_or_else(|| {
            TransportError::malformed("Exception response without exception code")
        })?;
        debug!("Exception: FC={:02X} code={:02X}", fc & 0x7F, code);
        return Err(TransportError::Exception {
            function: fc & 0x7F,
            code,
            description: exception_description(code),
        });
    }

    if fc != request.function.code() {
        return Err(TransportError::malformed(format!(
            "Function code mismatch: expected {:02X}, got {:02X}",
            request.function.code(),
            fc
        )));
    }

    match request.function {
        FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
            let byte_count = *pdu
                .get(1)
                .ok_or_else(|| TransportError::malformed("Missing byte count"))?
                as usize;
            let expected = request.count as usize * 2;
            if byte_count != expected || pdu.len() != 2 + byte_count {
                return Err(TransportError::malformed(format!(
                    "Byte count mismatch: expected {}, declared {}, received {}",
                    expected,
                    byte_count,
                    pdu.len().saturating_sub(2)
                )));
            }
            let words = pdu[2..]
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect();
            Ok(ModbusResponse::Registers(words))
        },
        FunctionCode::WriteSingleRegister | FunctionCode::WriteMultipleRegisters => {
            if pdu.len() != 5 {
                return Err(TransportError::malformed(format!(
                    "Write echo length {} (expected 5)",
                    pdu.len()
                )));
            }
            let address = u16::from_be_bytes([pdu[1], pdu[2]]);
            let second = u16::from_be_bytes([pdu[3], pdu[4]]);
            let expected_second = match request.function {
                FunctionCode::WriteSingleRegister => request.values.first().copied().unwrap_or(0),
                _ => request.count,
            };
            if address != request.address || second != expected_second {
                return Err(TransportError::malformed(format!(
                    "Write echo mismatch: {:04X}/{:04X}",
                    address, second
                )));
            }
            Ok(ModbusResponse::Written {
                address,
                count: request.count,
            })
        },
    }
}
