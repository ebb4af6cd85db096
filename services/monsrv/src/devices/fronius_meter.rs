//! Fronius grid meter behind the serial gateway
//!
//! The gateway mirrors the meter into one contiguous input register image.
//! Each successful read becomes a [`GridMeterSample`], kept in a bounded
//! history and handed to the optional sample sink (daily CSV file).

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;
use voltage_comlink::{FunctionCode, ModbusTransport};

use super::{require, RegisterBlock};
use crate::error::DeviceError;
use crate::history::MeterSampleSink;
use crate::registers::{DecodeRule::*, RegisterDescriptor as R, RegisterSet, RegisterTable};

pub mod ids {
    use crate::registers::RegisterId;

    pub const ACTIVE_ENERGY: RegisterId = RegisterId(0);
    pub const ACTIVE_FEED_ENERGY: RegisterId = RegisterId(2);
    pub const REACTIVE_ENERGY: RegisterId = RegisterId(4);
    pub const REACTIVE_FEED_ENERGY: RegisterId = RegisterId(6);
    pub const FREQUENCY: RegisterId = RegisterId(8);
    pub const ACTIVE_POWER: RegisterId = RegisterId(9);
    pub const REACTIVE_POWER: RegisterId = RegisterId(11);
    pub const APPARENT_POWER: RegisterId = RegisterId(13);
    pub const POWER_FACTOR: RegisterId = RegisterId(15);
    pub const ACTIVE_POWER_L1: RegisterId = RegisterId(16);
    pub const ACTIVE_POWER_L2: RegisterId = RegisterId(18);
    pub const ACTIVE_POWER_L3: RegisterId = RegisterId(20);
    pub const VOLTAGE_L1: RegisterId = RegisterId(22);
    pub const VOLTAGE_L2: RegisterId = RegisterId(23);
    pub const VOLTAGE_L3: RegisterId = RegisterId(24);
    pub const CURRENT_L1: RegisterId = RegisterId(25);
    pub const CURRENT_L2: RegisterId = RegisterId(26);
    pub const CURRENT_L3: RegisterId = RegisterId(27);
}

pub const GRID_METER_REGISTERS: u16 = 28;

static GRID_METER_DESCRIPTORS: [R; 18] = [
    R::at(0, "activeEnergy", 2, UInt32, "Wh"),
    R::at(2, "activeFeedEnergy", 2, UInt32, "Wh"),
    R::at(4, "reactiveEnergy", 2, UInt32, "varh"),
    R::at(6, "reactiveFeedEnergy", 2, UInt32, "varh"),
    R::at(8, "frequency", 1, ScaledFloat(0.01), "Hz"),
    R::at(9, "activePower", 2, ScaledFloat(0.1), "W"),
    R::at(11, "reactivePower", 2, ScaledFloat(0.1), "var"),
    R::at(13, "apparentPower", 2, ScaledFloat(0.1), "VA"),
    R::at(15, "powerFactor", 1, ScaledFloat(0.001), ""),
    R::at(16, "activePowerL1", 2, ScaledFloat(0.1), "W"),
    R::at(18, "activePowerL2", 2, ScaledFloat(0.1), "W"),
    R::at(20, "activePowerL3", 2, ScaledFloat(0.1), "W"),
    R::at(22, "voltageL1", 1, ScaledFloat(0.1), "V"),
    R::at(23, "voltageL2", 1, ScaledFloat(0.1), "V"),
    R::at(24, "voltageL3", 1, ScaledFloat(0.1), "V"),
    R::at(25, "currentL1", 1, ScaledFloat(0.01), "A"),
    R::at(26, "currentL2", 1, ScaledFloat(0.01), "A"),
    R::at(27, "currentL3", 1, ScaledFloat(0.01), "A"),
];

pub static GRID_METER_TABLE: RegisterTable = RegisterTable::new(
    "gridmeter",
    FunctionCode::ReadInputRegisters,
    &GRID_METER_DESCRIPTORS,
);

/// One grid meter reading, energies in Wh and powers in W
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GridMeterSample {
    pub timestamp: DateTime<Local>,
    pub active_energy: f64,
    pub active_feed_energy: f64,
    pub reactive_energy: f64,
    pub reactive_feed_energy: f64,
    pub frequency: f64,
    /// Positive when importing from the grid
    pub active_power: f64,
    pub reactive_power: f64,
    pub apparent_power: f64,
    pub power_factor: f64,
    pub active_power_l1: f64,
    pub active_power_l2: f64,
    pub active_power_l3: f64,
    pub voltage_l1: f64,
    pub voltage_l2: f64,
    pub voltage_l3: f64,
    pub current_l1: f64,
    pub current_l2: f64,
    pub current_l3: f64,
}

impl GridMeterSample {
    pub fn from_set(set: &RegisterSet, timestamp: DateTime<Local>) -> Result<Self, DeviceError> {
        Ok(Self {
            timestamp,
            active_energy: require(set, ids::ACTIVE_ENERGY)?,
            active_feed_energy: require(set, ids::ACTIVE_FEED_ENERGY)?,
            reactive_energy: require(set, ids::REACTIVE_ENERGY)?,
            reactive_feed_energy: require(set, ids::REACTIVE_FEED_ENERGY)?,
            frequency: require(set, ids::FREQUENCY)?,
            active_power: require(set, ids::ACTIVE_POWER)?,
            reactive_power: require(set, ids::REACTIVE_POWER)?,
            apparent_power: require(set, ids::APPARENT_POWER)?,
            power_factor: require(set, ids::POWER_FACTOR)?,
            active_power_l1: require(set, ids::ACTIVE_POWER_L1)?,
            active_power_l2: require(set, ids::ACTIVE_POWER_L2)?,
            active_power_l3: require(set, ids::ACTIVE_POWER_L3)?,
            voltage_l1: require(set, ids::VOLTAGE_L1)?,
            voltage_l2: require(set, ids::VOLTAGE_L2)?,
            voltage_l3: require(set, ids::VOLTAGE_L3)?,
            current_l1: require(set, ids::CURRENT_L1)?,
            current_l2: require(set, ids::CURRENT_L2)?,
            current_l3: require(set, ids::CURRENT_L3)?,
        })
    }
}

/// Grid meter driver
pub struct FroniusMeter {
    transport: Arc<dyn ModbusTransport>,
    block: RegisterBlock,
    samples: Mutex<VecDeque<GridMeterSample>>,
    capacity: usize,
    sink: Option<Arc<dyn MeterSampleSink>>,
}

impl FroniusMeter {
    pub fn new(transport: Arc<dyn ModbusTransport>, unit: u8, capacity: usize) -> Self {
        Self {
            transport,
            block: RegisterBlock::new(&GRID_METER_TABLE, unit),
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn MeterSampleSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Read the meter, record the sample and pass it to the sink
    ///
    /// Sink failures are logged and do not fail the read.
    pub async fn read(&self) -> Result<GridMeterSample, DeviceError> {
        let set = self.block.refresh(self.transport.as_ref()).await?;
        let sample = GridMeterSample::from_set(&set, Local::now())?;

        {
            let mut samples = self.samples.lock();
            if samples.len() >= self.capacity {
                samples.pop_front();
            }
            samples.push_back(sample.clone());
        }

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.append(&sample) {
                warn!("Grid meter sample not written: {}", e);
            }
        }
        Ok(sample)
    }

    pub fn latest(&self) -> Option<GridMeterSample> {
        self.samples.lock().back().cloned()
    }

    /// Samples oldest first
    pub fn history(&self) -> Vec<GridMeterSample> {
        self.samples.lock().iter().cloned().collect()
    }

    pub fn registers(&self) -> Option<Arc<RegisterSet>> {
        self.block.latest()
    }
}
