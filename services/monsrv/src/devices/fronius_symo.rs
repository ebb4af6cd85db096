//! Fronius Symo inverter over Modbus/TCP
//!
//! Six register blocks: the Fronius-specific site register block, SunSpec
//! inverter (model 103), nameplate (common model and model 120), MPPT
//! extension (model 160), storage (model 124) and the smart meter behind
//! the inverter (model 203, own unit id).

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};
use voltage_comlink::{FunctionCode, ModbusTransport};

use super::RegisterBlock;
use crate::error::DeviceError;
use crate::registers::{DecodeRule::*, RegisterDescriptor as R, RegisterSet, RegisterTable};

/// Register ids used outside this module
pub mod ids {
    use crate::registers::RegisterId;

    pub const SITE_POWER: RegisterId = RegisterId(500);
    pub const SITE_ENERGY_DAY: RegisterId = RegisterId(502);
    pub const SITE_ENERGY_YEAR: RegisterId = RegisterId(506);
    pub const SITE_ENERGY_TOTAL: RegisterId = RegisterId(510);

    pub const AC_POWER: RegisterId = RegisterId(40084);
    pub const FREQUENCY: RegisterId = RegisterId(40086);
    pub const LIFETIME_ENERGY: RegisterId = RegisterId(40094);
    pub const DC_POWER: RegisterId = RegisterId(40101);
    pub const OPERATING_STATE: RegisterId = RegisterId(40108);

    pub const MANUFACTURER: RegisterId = RegisterId(40004);
    pub const MODEL: RegisterId = RegisterId(40020);
    pub const SERIAL_NUMBER: RegisterId = RegisterId(40052);
    pub const POWER_RATING: RegisterId = RegisterId(40133);

    pub const STRING1_POWER: RegisterId = RegisterId(22);
    pub const STRING1_TIMESTAMP: RegisterId = RegisterId(25);
    pub const STRING2_POWER: RegisterId = RegisterId(42);

    pub const CHARGE_STATE: RegisterId = RegisterId(9);
    pub const CHARGE_STATUS: RegisterId = RegisterId(12);

    pub const METER_ACTIVE_POWER: RegisterId = RegisterId(19);
    pub const METER_EXPORTED_ENERGY: RegisterId = RegisterId(39);
    pub const METER_IMPORTED_ENERGY: RegisterId = RegisterId(47);
}

pub const MPPT_BASE: u16 = 40253;
pub const STORAGE_BASE: u16 = 40343;
pub const METER_BASE: u16 = 40069;

static FRONIUS_REGISTER_DESCRIPTORS: [R; 4] = [
    R::at(500, "sitePower", 2, UInt32, "W"),
    R::at(502, "siteEnergyDay", 4, UInt64, "Wh"),
    R::at(506, "siteEnergyYear", 4, UInt64, "Wh"),
    R::at(510, "siteEnergyTotal", 4, UInt64, "Wh"),
];

static INVERTER_DESCRIPTORS: [R; 37] = [
    R::at(40072, "acCurrent", 1, ScaledFloat(0.01), "A"),
    R::at(40073, "acCurrentL1", 1, ScaledFloat(0.01), "A"),
    R::at(40074, "acCurrentL2", 1, ScaledFloat(0.01), "A"),
    R::at(40075, "acCurrentL3", 1, ScaledFloat(0.01), "A"),
    R::at(40076, "currentSf", 1, Int16, ""),
    R::at(40077, "voltageL1L2", 1, ScaledFloat(0.1), "V"),
    R::at(40078, "voltageL2L3", 1, ScaledFloat(0.1), "V"),
    R::at(40079, "voltageL3L1", 1, ScaledFloat(0.1), "V"),
    R::at(40080, "voltageL1N", 1, ScaledFloat(0.1), "V"),
    R::at(40081, "voltageL2N", 1, ScaledFloat(0.1), "V"),
    R::at(40082, "voltageL3N", 1, ScaledFloat(0.1), "V"),
    R::at(40083, "voltageSf", 1, Int16, ""),
    R::at(40084, "acPower", 1, ScaledFloat(1.0), "W"),
    R::at(40085, "powerSf", 1, Int16, ""),
    R::at(40086, "frequency", 1, ScaledFloat(0.01), "Hz"),
    R::at(40087, "frequencySf", 1, Int16, ""),
    R::at(40088, "apparentPower", 1, ScaledFloat(1.0), "VA"),
    R::at(40089, "apparentPowerSf", 1, Int16, ""),
    R::at(40090, "reactivePower", 1, ScaledFloat(1.0), "var"),
    R::at(40091, "reactivePowerSf", 1, Int16, ""),
    R::at(40092, "powerFactor", 1, ScaledFloat(1.0), "%"),
    R::at(40093, "powerFactorSf", 1, Int16, ""),
    R::at(40094, "lifetimeEnergy", 2, UInt32, "Wh"),
    R::at(40096, "energySf", 1, Int16, ""),
    R::at(40097, "dcCurrent", 1, ScaledFloat(0.01), "A"),
    R::at(40098, "dcCurrentSf", 1, Int16, ""),
    R::at(40099, "dcVoltage", 1, ScaledFloat(0.1), "V"),
    R::at(40100, "dcVoltageSf", 1, Int16, ""),
    R::at(40101, "dcPower", 1, ScaledFloat(1.0), "W"),
    R::at(40102, "dcPowerSf", 1, Int16, ""),
    R::at(40103, "cabinetTemperature", 1, ScaledFloat(0.1), "°C"),
    R::at(40104, "heatsinkTemperature", 1, ScaledFloat(0.1), "°C"),
    R::at(40105, "transformerTemperature", 1, ScaledFloat(0.1), "°C"),
    R::at(40106, "otherTemperature", 1, ScaledFloat(0.1), "°C"),
    R::at(40107, "temperatureSf", 1, Int16, ""),
    R::at(40108, "operatingState", 1, Int16, ""),
    R::at(40109, "vendorState", 1, Int16, ""),
];

static NAMEPLATE_DESCRIPTORS: [R; 9] = [
    R::at(40004, "manufacturer", 16, AsciiString, ""),
    R::at(40020, "model", 16, AsciiString, ""),
    R::at(40036, "options", 8, AsciiString, ""),
    R::at(40044, "version", 8, AsciiString, ""),
    R::at(40052, "serialNumber", 16, AsciiString, ""),
    R::at(40068, "deviceAddress", 1, Int16, ""),
    R::at(40132, "derType", 1, Int16, ""),
    R::at(40133, "powerRating", 1, ScaledFloat(1.0), "W"),
    R::at(40134, "powerRatingSf", 1, Int16, ""),
];

static EXTENSION_DESCRIPTORS: [R; 23] = [
    R::offset(MPPT_BASE, 3, "dcCurrentSf", 1, Int16, ""),
    R::offset(MPPT_BASE, 4, "dcVoltageSf", 1, Int16, ""),
    R::offset(MPPT_BASE, 5, "dcPowerSf", 1, Int16, ""),
    R::offset(MPPT_BASE, 6, "dcEnergySf", 1, Int16, ""),
    R::offset(MPPT_BASE, 9, "moduleCount", 1, Int16, ""),
    R::offset(MPPT_BASE, 11, "string1Id", 1, Int16, ""),
    R::offset(MPPT_BASE, 12, "string1Name", 8, AsciiString, ""),
    R::offset(MPPT_BASE, 20, "string1Current", 1, ScaledFloat(0.01), "A"),
    R::offset(MPPT_BASE, 21, "string1Voltage", 1, ScaledFloat(0.01), "V"),
    R::offset(MPPT_BASE, 22, "string1Power", 1, ScaledFloat(0.01), "W"),
    R::offset(MPPT_BASE, 23, "string1Energy", 2, UInt32, "Wh"),
    R::offset(MPPT_BASE, 25, "string1Timestamp", 2, UInt32, "s"),
    R::offset(MPPT_BASE, 27, "string1Temperature", 1, Int16, "°C"),
    R::offset(MPPT_BASE, 28, "string1State", 1, Int16, ""),
    R::offset(MPPT_BASE, 31, "string2Id", 1, Int16, ""),
    R::offset(MPPT_BASE, 32, "string2Name", 8, AsciiString, ""),
    R::offset(MPPT_BASE, 40, "string2Current", 1, ScaledFloat(0.01), "A"),
    R::offset(MPPT_BASE, 41, "string2Voltage", 1, ScaledFloat(0.01), "V"),
    R::offset(MPPT_BASE, 42, "string2Power", 1, ScaledFloat(0.01), "W"),
    R::offset(MPPT_BASE, 43, "string2Energy", 2, UInt32, "Wh"),
    R::offset(MPPT_BASE, 45, "string2Timestamp", 2, UInt32, "s"),
    R::offset(MPPT_BASE, 47, "string2Temperature", 1, Int16, "°C"),
    R::offset(MPPT_BASE, 48, "string2State", 1, Int16, ""),
];

static STORAGE_DESCRIPTORS: [R; 16] = [
    R::offset(STORAGE_BASE, 3, "maxChargePower", 1, ScaledFloat(1.0), "W"),
    R::offset(STORAGE_BASE, 4, "chargeGradient", 1, ScaledFloat(1.0), "%"),
    R::offset(STORAGE_BASE, 5, "dischargeGradient", 1, ScaledFloat(1.0), "%"),
    R::offset(STORAGE_BASE, 6, "controlMode", 1, Bitfield, ""),
    R::offset(STORAGE_BASE, 7, "maxChargeVa", 1, ScaledFloat(1.0), "VA"),
    R::offset(STORAGE_BASE, 8, "minReserve", 1, ScaledFloat(0.01), "%"),
    R::offset(STORAGE_BASE, 9, "chargeState", 1, ScaledFloat(0.01), "%"),
    R::offset(STORAGE_BASE, 10, "availableEnergy", 1, ScaledFloat(0.01), "Ah"),
    R::offset(STORAGE_BASE, 11, "batteryVoltage", 1, ScaledFloat(0.01), "V"),
    R::offset(STORAGE_BASE, 12, "chargeStatus", 1, Int16, ""),
    R::offset(STORAGE_BASE, 13, "dischargeRate", 1, ScaledFloat(0.01), "%"),
    R::offset(STORAGE_BASE, 14, "chargeRate", 1, ScaledFloat(0.01), "%"),
    R::offset(STORAGE_BASE, 15, "rateWindow", 1, Int16, "s"),
    R::offset(STORAGE_BASE, 16, "revertTimeout", 1, Int16, "s"),
    R::offset(STORAGE_BASE, 17, "rampTime", 1, Int16, "s"),
    R::offset(STORAGE_BASE, 18, "gridCharging", 1, Int16, ""),
];

static METER_DESCRIPTORS: [R; 23] = [
    R::offset(METER_BASE, 3, "acCurrent", 1, ScaledFloat(0.01), "A"),
    R::offset(METER_BASE, 4, "acCurrentL1", 1, ScaledFloat(0.01), "A"),
    R::offset(METER_BASE, 5, "acCurrentL2", 1, ScaledFloat(0.01), "A"),
    R::offset(METER_BASE, 6, "acCurrentL3", 1, ScaledFloat(0.01), "A"),
    R::offset(METER_BASE, 7, "currentSf", 1, Int16, ""),
    R::offset(METER_BASE, 8, "voltageLN", 1, ScaledFloat(0.1), "V"),
    R::offset(METER_BASE, 9, "voltageL1N", 1, ScaledFloat(0.1), "V"),
    R::offset(METER_BASE, 10, "voltageL2N", 1, ScaledFloat(0.1), "V"),
    R::offset(METER_BASE, 11, "voltageL3N", 1, ScaledFloat(0.1), "V"),
    R::offset(METER_BASE, 12, "voltageLL", 1, ScaledFloat(0.1), "V"),
    R::offset(METER_BASE, 13, "voltageL1L2", 1, ScaledFloat(0.1), "V"),
    R::offset(METER_BASE, 14, "voltageL2L3", 1, ScaledFloat(0.1), "V"),
    R::offset(METER_BASE, 15, "voltageL3L1", 1, ScaledFloat(0.1), "V"),
    R::offset(METER_BASE, 16, "voltageSf", 1, Int16, ""),
    R::offset(METER_BASE, 17, "frequency", 1, ScaledFloat(0.01), "Hz"),
    R::offset(METER_BASE, 18, "frequencySf", 1, Int16, ""),
    R::offset(METER_BASE, 19, "activePower", 1, ScaledFloat(1.0), "W"),
    R::offset(METER_BASE, 20, "activePowerL1", 1, ScaledFloat(1.0), "W"),
    R::offset(METER_BASE, 21, "activePowerL2", 1, ScaledFloat(1.0), "W"),
    R::offset(METER_BASE, 22, "activePowerL3", 1, ScaledFloat(1.0), "W"),
    R::offset(METER_BASE, 23, "activePowerSf", 1, Int16, ""),
    R::offset(METER_BASE, 39, "exportedEnergy", 2, UInt32, "Wh"),
    R::offset(METER_BASE, 47, "importedEnergy", 2, UInt32, "Wh"),
];

pub static FRONIUS_REGISTER_TABLE: RegisterTable = RegisterTable::new(
    "froniusRegister",
    FunctionCode::ReadHoldingRegisters,
    &FRONIUS_REGISTER_DESCRIPTORS,
);
pub static INVERTER_TABLE: RegisterTable = RegisterTable::new(
    "inverter",
    FunctionCode::ReadHoldingRegisters,
    &INVERTER_DESCRIPTORS,
);
pub static NAMEPLATE_TABLE: RegisterTable = RegisterTable::new(
    "nameplate",
    FunctionCode::ReadHoldingRegisters,
    &NAMEPLATE_DESCRIPTORS,
);
pub static EXTENSION_TABLE: RegisterTable = RegisterTable::new(
    "inverterExtension",
    FunctionCode::ReadHoldingRegisters,
    &EXTENSION_DESCRIPTORS,
);
pub static STORAGE_TABLE: RegisterTable = RegisterTable::new(
    "storage",
    FunctionCode::ReadHoldingRegisters,
    &STORAGE_DESCRIPTORS,
);
pub static METER_TABLE: RegisterTable = RegisterTable::new(
    "meter",
    FunctionCode::ReadHoldingRegisters,
    &METER_DESCRIPTORS,
);

/// Block selection for snapshots; no flag set means every block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SymoBlocks {
    pub fronius_register: bool,
    pub inverter: bool,
    pub nameplate: bool,
    pub inverter_extension: bool,
    pub storage: bool,
    pub meter: bool,
}

impl SymoBlocks {
    pub fn all() -> Self {
        Self {
            fronius_register: true,
            inverter: true,
            nameplate: true,
            inverter_extension: true,
            storage: true,
            meter: true,
        }
    }

    /// Parse query flag names; unknown names are returned as error
    pub fn from_flags<'a>(flags: impl IntoIterator<Item = &'a str>) -> Result<Self, String> {
        let mut blocks = Self::default();
        for flag in flags {
            match flag {
                "froniusRegister" => blocks.fronius_register = true,
                "inverter" => blocks.inverter = true,
                "nameplate" => blocks.nameplate = true,
                "inverterExtension" => blocks.inverter_extension = true,
                "storage" => blocks.storage = true,
                "meter" => blocks.meter = true,
                "all" => blocks = Self::all(),
                other => return Err(format!("unknown block '{}'", other)),
            }
        }
        if blocks == Self::default() {
            blocks = Self::all();
        }
        Ok(blocks)
    }
}

/// Cached blocks as served by the HTTP API
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FroniusSymoValues {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fronius_register: Option<Arc<RegisterSet>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inverter: Option<Arc<RegisterSet>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nameplate: Option<Arc<RegisterSet>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inverter_extension: Option<Arc<RegisterSet>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<Arc<RegisterSet>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meter: Option<Arc<RegisterSet>>,
}

/// Fronius Symo driver
pub struct FroniusSymo {
    transport: Arc<dyn ModbusTransport>,
    fronius_register: RegisterBlock,
    inverter: RegisterBlock,
    nameplate: RegisterBlock,
    inverter_extension: RegisterBlock,
    storage: RegisterBlock,
    meter: RegisterBlock,
}

impl FroniusSymo {
    pub fn new(transport: Arc<dyn ModbusTransport>, inverter_unit: u8, meter_unit: u8) -> Self {
        Self {
            transport,
            fronius_register: RegisterBlock::new(&FRONIUS_REGISTER_TABLE, inverter_unit),
            inverter: RegisterBlock::new(&INVERTER_TABLE, inverter_unit),
            nameplate: RegisterBlock::new(&NAMEPLATE_TABLE, inverter_unit),
            inverter_extension: RegisterBlock::new(&EXTENSION_TABLE, inverter_unit),
            storage: RegisterBlock::new(&STORAGE_TABLE, inverter_unit),
            meter: RegisterBlock::new(&METER_TABLE, meter_unit),
        }
    }

    /// Initial nameplate read; failures are retried later by the monitor
    pub async fn start(&self) {
        match self.read_nameplate().await {
            Ok(set) => info!(
                "Fronius Symo: {} {} (serial {})",
                set.text(ids::MANUFACTURER).unwrap_or("?"),
                set.text(ids::MODEL).unwrap_or("?"),
                set.text(ids::SERIAL_NUMBER).unwrap_or("?")
            ),
            Err(e) => warn!("Fronius Symo nameplate not available yet: {}", e),
        }
    }

    pub async fn read_fronius_register(&self) -> Result<Arc<RegisterSet>, DeviceError> {
        self.fronius_register.refresh(self.transport.as_ref()).await
    }

    pub async fn read_inverter(&self) -> Result<Arc<RegisterSet>, DeviceError> {
        self.inverter.refresh(self.transport.as_ref()).await
    }

    pub async fn read_nameplate(&self) -> Result<Arc<RegisterSet>, DeviceError> {
        self.nameplate.refresh(self.transport.as_ref()).await
    }

    pub async fn read_inverter_extension(&self) -> Result<Arc<RegisterSet>, DeviceError> {
        self.inverter_extension
            .refresh(self.transport.as_ref())
            .await
    }

    pub async fn read_storage(&self) -> Result<Arc<RegisterSet>, DeviceError> {
        self.storage.refresh(self.transport.as_ref()).await
    }

    pub async fn read_meter(&self) -> Result<Arc<RegisterSet>, DeviceError> {
        self.meter.refresh(self.transport.as_ref()).await
    }

    pub fn fronius_register(&self) -> Option<Arc<RegisterSet>> {
        self.fronius_register.latest()
    }

    pub fn inverter(&self) -> Option<Arc<RegisterSet>> {
        self.inverter.latest()
    }

    pub fn nameplate(&self) -> Option<Arc<RegisterSet>> {
        self.nameplate.latest()
    }

    pub fn inverter_extension(&self) -> Option<Arc<RegisterSet>> {
        self.inverter_extension.latest()
    }

    pub fn storage(&self) -> Option<Arc<RegisterSet>> {
        self.storage.latest()
    }

    pub fn meter(&self) -> Option<Arc<RegisterSet>> {
        self.meter.latest()
    }

    pub fn snapshot(&self, blocks: SymoBlocks) -> FroniusSymoValues {
        let pick = |wanted: bool, block: &RegisterBlock| wanted.then(|| block.latest()).flatten();
        FroniusSymoValues {
            fronius_register: pick(blocks.fronius_register, &self.fronius_register),
            inverter: pick(blocks.inverter, &self.inverter),
            nameplate: pick(blocks.nameplate, &self.nameplate),
            inverter_extension: pick(blocks.inverter_extension, &self.inverter_extension),
            storage: pick(blocks.storage, &self.storage),
            meter: pick(blocks.meter, &self.meter),
        }
    }
}
