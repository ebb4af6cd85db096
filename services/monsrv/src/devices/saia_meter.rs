//! Saia ALE3 energy meter on the serial bus
//!
//! Used as auxiliary meter for the second PV string. `de1` is the
//! resettable partial counter of tariff 1 that the monitor turns into a
//! daily energy figure.

use std::sync::Arc;

use chrono::{DateTime, Local};
use parking_lot::RwLock;
use serde::Serialize;
use voltage_comlink::{FunctionCode, ModbusTransport};

use super::{require, RegisterBlock};
use crate::error::DeviceError;
use crate::registers::{DecodeRule::*, RegisterDescriptor as R, RegisterSet, RegisterTable};

pub mod ids {
    use crate::registers::RegisterId;

    pub const E1: RegisterId = RegisterId(28);
    pub const DE1: RegisterId = RegisterId(30);
    pub const E2: RegisterId = RegisterId(32);
    pub const DE2: RegisterId = RegisterId(34);
    pub const U1: RegisterId = RegisterId(36);
    pub const I1: RegisterId = RegisterId(37);
    pub const P1: RegisterId = RegisterId(38);
    pub const U2: RegisterId = RegisterId(41);
    pub const I2: RegisterId = RegisterId(42);
    pub const P2: RegisterId = RegisterId(43);
    pub const U3: RegisterId = RegisterId(46);
    pub const I3: RegisterId = RegisterId(47);
    pub const P3: RegisterId = RegisterId(48);
    pub const P: RegisterId = RegisterId(51);
    pub const Q: RegisterId = RegisterId(52);
}

// Energies count in 10 Wh, powers in 10 W
static SAIA_DESCRIPTORS: [R; 21] = [
    R::at(28, "e1", 2, ScaledFloat(10.0), "Wh"),
    R::at(30, "de1", 2, ScaledFloat(10.0), "Wh"),
    R::at(32, "e2", 2, ScaledFloat(10.0), "Wh"),
    R::at(34, "de2", 2, ScaledFloat(10.0), "Wh"),
    R::at(36, "u1", 1, ScaledFloat(1.0), "V"),
    R::at(37, "i1", 1, ScaledFloat(0.1), "A"),
    R::at(38, "p1", 1, ScaledFloat(10.0), "W"),
    R::at(39, "q1", 1, ScaledFloat(10.0), "var"),
    R::at(40, "cosPhi1", 1, ScaledFloat(0.01), ""),
    R::at(41, "u2", 1, ScaledFloat(1.0), "V"),
    R::at(42, "i2", 1, ScaledFloat(0.1), "A"),
    R::at(43, "p2", 1, ScaledFloat(10.0), "W"),
    R::at(44, "q2", 1, ScaledFloat(10.0), "var"),
    R::at(45, "cosPhi2", 1, ScaledFloat(0.01), ""),
    R::at(46, "u3", 1, ScaledFloat(1.0), "V"),
    R::at(47, "i3", 1, ScaledFloat(0.1), "A"),
    R::at(48, "p3", 1, ScaledFloat(10.0), "W"),
    R::at(49, "q3", 1, ScaledFloat(10.0), "var"),
    R::at(50, "cosPhi3", 1, ScaledFloat(0.01), ""),
    R::at(51, "p", 1, ScaledFloat(10.0), "W"),
    R::at(52, "q", 1, ScaledFloat(10.0), "var"),
];

pub static SAIA_TABLE: RegisterTable =
    RegisterTable::new("saia", FunctionCode::ReadHoldingRegisters, &SAIA_DESCRIPTORS);

pub const SAIA_FIRST_REGISTER: u16 = 28;
pub const SAIA_REGISTERS: u16 = 25;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaiaMeterValues {
    pub name: String,
    pub timestamp: DateTime<Local>,
    pub e1: f64,
    pub de1: f64,
    pub e2: f64,
    pub de2: f64,
    pub p: f64,
    pub q: f64,
    pub u: [f64; 3],
    pub i: [f64; 3],
    pub p_phase: [f64; 3],
}

impl SaiaMeterValues {
    fn from_set(name: &str, set: &RegisterSet) -> Result<Self, DeviceError> {
        Ok(Self {
            name: name.to_string(),
            timestamp: set.captured_at.with_timezone(&Local),
            e1: require(set, ids::E1)?,
            de1: require(set, ids::DE1)?,
            e2: require(set, ids::E2)?,
            de2: require(set, ids::DE2)?,
            p: require(set, ids::P)?,
            q: require(set, ids::Q)?,
            u: [
                require(set, ids::U1)?,
                require(set, ids::U2)?,
                require(set, ids::U3)?,
            ],
            i: [
                require(set, ids::I1)?,
                require(set, ids::I2)?,
                require(set, ids::I3)?,
            ],
            p_phase: [
                require(set, ids::P1)?,
                require(set, ids::P2)?,
                require(set, ids::P3)?,
            ],
        })
    }
}

/// Saia ALE3 driver
pub struct SaiaMeter {
    name: String,
    transport: Arc<dyn ModbusTransport>,
    block: RegisterBlock,
    latest: RwLock<Option<SaiaMeterValues>>,
}

impl SaiaMeter {
    pub fn new(name: impl Into<String>, transport: Arc<dyn ModbusTransport>, unit: u8) -> Self {
        Self {
            name: name.into(),
            transport,
            block: RegisterBlock::new(&SAIA_TABLE, unit),
            latest: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn read(&self) -> Result<SaiaMeterValues, DeviceError> {
        let set = self.block.refresh(self.transport.as_ref()).await?;
        let values = SaiaMeterValues::from_set(&self.name, &set)?;
        *self.latest.write() = Some(values.clone());
        Ok(values)
    }

    pub fn latest(&self) -> Option<SaiaMeterValues> {
        self.latest.read().clone()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use voltage_comlink::SimulatedBus;

    #[tokio::test]
    async fn test_read_saia() {
        let bus = Arc::new(SimulatedBus::new("serial"));
        bus.fill(3, SAIA_FIRST_REGISTER, SAIA_REGISTERS);
        bus.set_u32(3, 30, 123);
        bus.set_register(3, 51, 42);
        bus.set_register(3, 36, 231);

        let saia = SaiaMeter::new("pvWest", bus.clone(), 3);
        let values = saia.read().await.unwrap();
        assert_eq!(values.de1, 1230.0);
        assert_eq!(values.p, 420.0);
        assert_eq!(values.u[0], 231.0);
        assert_eq!(saia.latest(), Some(values));
        // One span for the whole block
        assert_eq!(bus.request_count(), 1);
    }
}
