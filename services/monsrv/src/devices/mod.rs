//! Device drivers
//!
//! Every driver talks to its device through a shared `ModbusTransport` and
//! keeps the last successful read of each register block. A failed read
//! leaves the cached block untouched.

pub mod fronius_meter;
pub mod fronius_symo;
pub mod nibe1155;
pub mod saia_meter;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::warn;
use voltage_comlink::ModbusTransport;

use crate::error::{DecodeError, DeviceError};
use crate::registers::{read_all, RegisterId, RegisterSet, RegisterTable};

pub use fronius_meter::{FroniusMeter, GridMeterSample};
pub use fronius_symo::{FroniusSymo, FroniusSymoValues, SymoBlocks};
pub use nibe1155::{
    ControllerState, HeatpumpMode, Nibe1155, Nibe1155Values, NibeQuery, OperationalMode,
};
pub use saia_meter::{SaiaMeter, SaiaMeterValues};

/// Cached register block of one device
#[derive(Debug)]
pub struct RegisterBlock {
    table: &'static RegisterTable,
    unit: u8,
    latest: RwLock<Option<Arc<RegisterSet>>>,
    last_error: RwLock<Option<(DateTime<Utc>, String)>>,
}

impl RegisterBlock {
    pub fn new(table: &'static RegisterTable, unit: u8) -> Self {
        Self {
            table,
            unit,
            latest: RwLock::new(None),
            last_error: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.table.device
    }

    pub fn table(&self) -> &'static RegisterTable {
        self.table
    }

    pub fn unit(&self) -> u8 {
        self.unit
    }

    /// Last successful read
    pub fn latest(&self) -> Option<Arc<RegisterSet>> {
        self.latest.read().clone()
    }

    pub fn last_error(&self) -> Option<(DateTime<Utc>, String)> {
        self.last_error.read().clone()
    }

    /// Read the whole block and replace the cache on success
    pub async fn refresh(
        &self,
        transport: &dyn ModbusTransport,
    ) -> Result<Arc<RegisterSet>, DeviceError> {
        match read_all(transport, self.unit, self.table).await {
            Ok(set) => {
                let set = Arc::new(set);
                *self.latest.write() = Some(set.clone());
                *self.last_error.write() = None;
                Ok(set)
            },
            Err(e) => {
                warn!("{} read failed (unit {}): {}", self.name(), self.unit, e);
                *self.last_error.write() = Some((Utc::now(), e.to_string()));
                Err(e)
            },
        }
    }
}

/// Numeric value of `id`, failing when the set lacks it
pub(crate) fn require(set: &RegisterSet, id: RegisterId) -> Result<f64, DeviceError> {
    set.f64(id).ok_or_else(|| {
        DeviceError::Decode(DecodeError::UnknownRegister {
            device: set.device,
            id,
        })
    })
}
