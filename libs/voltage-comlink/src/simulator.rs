//! In-memory Modbus bus for testing
//!
//! A register image per unit answering `ModbusTransport` requests directly,
//! with scripted failures for exercising degraded paths.

use std::collections::{BTreeMap, HashMap};
use std::ops::RangeInclusive;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::pdu::{exception_description, FunctionCode, ModbusRequest, ModbusResponse};
use crate::traits::{ConnectionState, ModbusTransport};

/// Scripted failure for requests touching `range` on `unit`
#[derive(Debug, Clone)]
struct Fault {
    unit: u8,
    range: RangeInclusive<u16>,
    remaining: usize,
    error: TransportError,
}

/// Simple Modbus bus simulator
#[derive(Debug)]
pub struct SimulatedBus {
    name: String,
    /// Register image per unit (holding and input registers share one space)
    units: parking_lot::Mutex<HashMap<u8, BTreeMap<u16, u16>>>,
    faults: parking_lot::Mutex<Vec<Fault>>,
    requests: parking_lot::Mutex<Vec<ModbusRequest>>,
}

impl SimulatedBus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            units: parking_lot::Mutex::new(HashMap::new()),
            faults: parking_lot::Mutex::new(Vec::new()),
            requests: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Set consecutive registers starting at `address`
    pub fn set_registers(&self, unit: u8, address: u16, values: &[u16]) {
        let mut units = self.units.lock();
        let image = units.entry(unit).or_default();
        for (i, v) in values.iter().enumerate() {
            image.insert(address.wrapping_add(i as u16), *v);
        }
    }

    pub fn set_register(&self, unit: u8, address: u16, value: u16) {
        self.set_registers(unit, address, &[value]);
    }

    /// Set a 32-bit value, high word first
    pub fn set_u32(&self, unit: u8, address: u16, value: u32) {
        self.set_registers(unit, address, &[(value >> 16) as u16, value as u16]);
    }

    pub fn set_i32(&self, unit: u8, address: u16, value: i32) {
        self.set_u32(unit, address, value as u32);
    }

    /// Zero-fill `count` registers starting at `address`
    pub fn fill(&self, unit: u8, address: u16, count: u16) {
        self.set_registers(unit, address, &vec![0; count as usize]);
    }

    pub fn get_register(&self, unit: u8, address: u16) -> Option<u16> {
        self.units
            .lock()
            .get(&unit)
            .and_then(|image| image.get(&address).copied())
    }

    /// Fail the next `times` requests overlapping `range` on `unit` with `error`
    pub fn fail_next(&self, unit: u8, range: RangeInclusive<u16>, times: usize, error: TransportError) {
        self.faults.lock().push(Fault {
            unit,
            range,
            remaining: times,
            error,
        });
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<ModbusRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn clear_requests(&self) {
        self.requests.lock().clear();
    }

    fn take_fault(&self, request: &ModbusRequest) -> Option<TransportError> {
        let last = request.address.saturating_add(request.count.saturating_sub(1));
        let mut faults = self.faults.lock();
        let fault = faults.iter_mut().find(|f| {
            f.unit == request.unit
                && f.remaining > 0
                && f.range.start() <= &last
                && &request.address <= f.range.end()
        })?;
        fault.remaining -= 1;
        let error = fault.error.clone();
        faults.retain(|f| f.remaining > 0);
        Some(error)
    }
}

#[async_trait]
impl ModbusTransport for SimulatedBus {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::Connected
    }

    async fn request(&self, request: &ModbusRequest) -> Result<ModbusResponse> {
        request.validate()?;
        self.requests.lock().push(request.clone());
        debug!(
            "SIM {}: unit={} {} addr={} count={}",
            self.name, request.unit, request.function, request.address, request.count
        );

        if let Some(error) = self.take_fault(request) {
            return Err(error);
        }

        let mut units = self.units.lock();
        let Some(image) = units.get_mut(&request.unit) else {
            return Err(TransportError::timeout(format!(
                "No device at unit {}",
                request.unit
            )));
        };

        let illegal_address = || TransportError::Exception {
            function: request.function.code(),
            code: 0x02,
            description: exception_description(0x02),
        };

        match request.function {
            FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
                let mut words = Vec::with_capacity(request.count as usize);
                for offset in 0..request.count {
                    let address = request.address.wrapping_add(offset);
                    words.push(*image.get(&address).ok_or_else(illegal_address)?);
                }
                Ok(ModbusResponse::Registers(words))
            },
            FunctionCode::WriteSingleRegister | FunctionCode::WriteMultipleRegisters => {
                for (offset, value) in request.values.iter().enumerate() {
                    let address = request.address.wrapping_add(offset as u16);
                    let slot = image.get_mut(&address).ok_or_else(illegal_address)?;
                    *slot = *value;
                }
                Ok(ModbusResponse::Written {
                    address: request.address,
                    count: request.count,
                })
            },
        }
    }
}
