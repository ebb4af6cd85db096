//! Monitor records
//!
//! One immutable [`MonitorRecord`] per successful tick. Records are shared as
//! `Arc<MonitorRecord>` between the history ring, the statistics and every
//! fan-out subscriber.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::devices::fronius_symo::ids as symo;
use crate::devices::{ControllerState, GridMeterSample, SaiaMeterValues};
use crate::registers::{RegisterId, RegisterSet, RegisterValue};

/// Active metering path, serialized as `meter` or `gridmeter`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Metering {
    /// Smart meter on the inverter's bus
    Meter(Arc<RegisterSet>),
    /// Grid meter on the serial gateway
    Gridmeter(GridMeterSample),
}

impl Metering {
    /// Grid power in W, positive when importing
    pub fn active_power(&self) -> Option<f64> {
        match self {
            Metering::Meter(set) => set.f64(symo::METER_ACTIVE_POWER),
            Metering::Gridmeter(sample) => Some(sample.active_power),
        }
    }
}

/// Values derived by the monitor
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Calculated {
    /// Wh of PV string 1 since midnight
    pub pv_south_energy_daily: f64,
    pub saia_offset: f64,
    pub fronius_site_daily_offset: f64,
    pub saia_daily_energy: Option<f64>,
    pub fronius_site_daily_energy: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeatpumpRecord {
    pub controller: ControllerState,
    pub values: BTreeMap<RegisterId, RegisterValue>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorRecord {
    pub timestamp: DateTime<Local>,
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
    #[serde(flatten)]
    pub metering: Metering,
    pub ext_meters: Vec<SaiaMeterValues>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heatpump: Option<HeatpumpRecord>,
    pub calculated: Calculated,
}

impl MonitorRecord {
    pub fn grid_power(&self) -> Option<f64> {
        self.metering.active_power()
    }

    /// Inverter AC power in W
    pub fn pv_power(&self) -> Option<f64> {
        self.inverter.as_ref().and_then(|set| set.f64(symo::AC_POWER))
    }
}
