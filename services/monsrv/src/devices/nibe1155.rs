//! Nibe 1155 heat pump behind the serial gateway
//!
//! The gateway announces the heat pump's logset (registers the pump pushes
//! cyclically) in a small register block. Those ids are read often
//! ("simple" reads), everything else in the table only on a complete read.
//! The operational mode and degree minutes form the controller state and
//! are the only registers written.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use voltage_comlink::{FunctionCode, ModbusTransport};

use crate::error::{DecodeError, DeviceError};
use crate::registers::{
    read_all, read_registers, write_register, DecodeRule::*, RegisterDescriptor, RegisterId,
    RegisterTable, RegisterValue,
};

pub mod ids {
    use crate::registers::RegisterId;

    pub const OUTDOOR_TEMPERATURE: RegisterId = RegisterId(40004);
    pub const SUPPLY_TEMPERATURE: RegisterId = RegisterId(40008);
    pub const RETURN_TEMPERATURE: RegisterId = RegisterId(40012);
    pub const HOT_WATER_TOP: RegisterId = RegisterId(40013);
    pub const DEGREE_MINUTES: RegisterId = RegisterId(43005);
    pub const COMPRESSOR_FREQUENCY: RegisterId = RegisterId(43136);
    pub const COMPRESSOR_POWER: RegisterId = RegisterId(43141);
    pub const OPERATIONAL_MODE: RegisterId = RegisterId(47137);
}

/// Parameter ids map onto gateway addresses with a fixed offset
const fn nibe(
    id: u16,
    name: &'static str,
    width: u16,
    decode: crate::registers::DecodeRule,
    unit: &'static str,
) -> RegisterDescriptor {
    RegisterDescriptor {
        id: RegisterId(id),
        name,
        address: id - 40001,
        width,
        decode,
        unit,
        writable: false,
    }
}

static NIBE_DESCRIPTORS: [RegisterDescriptor; 23] = [
    nibe(40004, "outdoorTemperature", 1, ScaledFloat(0.1), "°C"),
    nibe(40008, "supplyTemperature", 1, ScaledFloat(0.1), "°C"),
    nibe(40012, "returnTemperature", 1, ScaledFloat(0.1), "°C"),
    nibe(40013, "hotWaterTop", 1, ScaledFloat(0.1), "°C"),
    nibe(40014, "hotWaterCharging", 1, ScaledFloat(0.1), "°C"),
    nibe(40015, "brineIn", 1, ScaledFloat(0.1), "°C"),
    nibe(40016, "brineOut", 1, ScaledFloat(0.1), "°C"),
    nibe(40017, "condenserOut", 1, ScaledFloat(0.1), "°C"),
    nibe(40018, "hotGas", 1, ScaledFloat(0.1), "°C"),
    nibe(40019, "liquidLine", 1, ScaledFloat(0.1), "°C"),
    nibe(40022, "suctionGas", 1, ScaledFloat(0.1), "°C"),
    nibe(40071, "externalSupply", 1, ScaledFloat(0.1), "°C"),
    nibe(43005, "degreeMinutes", 1, ScaledFloat(0.1), "DM").writable(),
    nibe(43084, "electricalAdditionPower", 1, ScaledFloat(0.01), "kW"),
    nibe(43136, "compressorFrequency", 1, ScaledFloat(0.1), "Hz"),
    nibe(43141, "compressorPower", 1, ScaledFloat(1.0), "W"),
    nibe(43181, "chargePumpSpeed", 1, Int16, "%"),
    nibe(43416, "compressorStarts", 2, Int32, ""),
    nibe(43420, "compressorOperatingTime", 2, Int32, "h"),
    nibe(43424, "hotWaterOperatingTime", 2, Int32, "h"),
    nibe(43437, "supplyPumpSpeed", 1, Int16, "%"),
    nibe(43439, "brinePumpSpeed", 1, Int16, "%"),
    nibe(47137, "operationalMode", 1, Int16, "").writable(),
];

pub static NIBE_TABLE: RegisterTable = RegisterTable::new(
    "nibe1155",
    FunctionCode::ReadHoldingRegisters,
    &NIBE_DESCRIPTORS,
);

/// Heat pump operational mode (register 47137)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationalMode {
    Auto,
    Manual,
    AddHeatOnly,
}

impl OperationalMode {
    pub fn raw(self) -> u16 {
        match self {
            OperationalMode::Auto => 0,
            OperationalMode::Manual => 1,
            OperationalMode::AddHeatOnly => 2,
        }
    }

    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            0 => Some(OperationalMode::Auto),
            1 => Some(OperationalMode::Manual),
            2 => Some(OperationalMode::AddHeatOnly),
            _ => None,
        }
    }
}

/// Requested controller change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeatpumpMode {
    pub mode: OperationalMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degree_minutes: Option<f64>,
}

/// Controller state as last read or written
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerState {
    pub mode: Option<OperationalMode>,
    pub degree_minutes: Option<f64>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Snapshot selection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NibeQuery {
    pub complete_values: bool,
    pub simple_values: bool,
    pub controller: bool,
    /// Restrict values to these ids
    pub ids: Option<Vec<RegisterId>>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Nibe1155Values {
    pub logset_ids: Vec<RegisterId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complete_values: Option<BTreeMap<RegisterId, RegisterValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simple_values: Option<BTreeMap<RegisterId, RegisterValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controller: Option<ControllerState>,
    pub complete_read_at: Option<DateTime<Utc>>,
    pub simple_read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct NibeCache {
    values: BTreeMap<RegisterId, RegisterValue>,
    complete_read_at: Option<DateTime<Utc>>,
    simple_read_at: Option<DateTime<Utc>>,
}

/// Nibe 1155 driver
pub struct Nibe1155 {
    transport: Arc<dyn ModbusTransport>,
    unit: u8,
    logset_address: u16,
    logset_length: u16,
    logset_ids: OnceLock<Vec<RegisterId>>,
    non_logset_ids: OnceLock<Vec<RegisterId>>,
    cache: RwLock<NibeCache>,
    controller: RwLock<ControllerState>,
    poller: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Nibe1155 {
    pub fn new(
        transport: Arc<dyn ModbusTransport>,
        unit: u8,
        logset_address: u16,
        logset_length: u16,
    ) -> Self {
        Self {
            transport,
            unit,
            logset_address,
            logset_length,
            logset_ids: OnceLock::new(),
            non_logset_ids: OnceLock::new(),
            cache: RwLock::new(NibeCache::default()),
            controller: RwLock::new(ControllerState::default()),
            poller: Mutex::new(None),
        }
    }

    /// Logset ids once enumerated
    pub fn logset_ids(&self) -> Option<&[RegisterId]> {
        self.logset_ids.get().map(Vec::as_slice)
    }

    /// Table ids outside the logset
    pub fn non_logset_ids(&self) -> Option<&[RegisterId]> {
        self.non_logset_ids.get().map(Vec::as_slice)
    }

    /// Enumerate the logset from the gateway, once
    ///
    /// Zero words end the list. Ids without a descriptor are skipped.
    pub async fn read_logset(&self) -> Result<&[RegisterId], DeviceError> {
        if let Some(ids) = self.logset_ids.get() {
            return Ok(ids.as_slice());
        }

        let words = self
            .transport
            .read_holding_registers(self.unit, self.logset_address, self.logset_length)
            .await
            .map_err(|source| DeviceError::PartialRead {
                device: NIBE_TABLE.device,
                address: self.logset_address,
                count: self.logset_length,
                source,
            })?;

        let mut ids = Vec::new();
        for word in words.into_iter().take_while(|w| *w != 0) {
            let id = RegisterId(word);
            match NIBE_TABLE.descriptor(id) {
                Ok(_) if !ids.contains(&id) => ids.push(id),
                Ok(_) => {},
                Err(e) => warn!("Logset entry skipped: {}", e),
            }
        }
        info!("Nibe1155 logset: {} registers", ids.len());

        let ids = self.logset_ids.get_or_init(|| ids);
        let _ = self.non_logset_ids.set(
            NIBE_TABLE
                .ids()
                .into_iter()
                .filter(|id| !ids.contains(id))
                .collect(),
        );
        Ok(ids.as_slice())
    }

    /// Read every register of the table, replacing the value cache
    pub async fn read_complete_values(&self) -> Result<usize, DeviceError> {
        self.read_logset().await?;
        let set = read_all(self.transport.as_ref(), self.unit, &NIBE_TABLE).await?;
        let count = set.len();

        let mut cache = self.cache.write();
        cache.values = set.values;
        cache.complete_read_at = Some(set.captured_at);
        debug!("Nibe1155 complete read: {} values", count);
        Ok(count)
    }

    /// Refresh the logset values
    ///
    /// Only ids already known from a complete read are updated.
    pub async fn read_simple_values(&self) -> Result<usize, DeviceError> {
        if self.cache.read().complete_read_at.is_none() {
            return Err(DeviceError::NotReady(
                "no complete read of nibe1155 yet".to_string(),
            ));
        }
        let ids = self.read_logset().await?.to_vec();
        if ids.is_empty() {
            return Ok(0);
        }
        let set = read_registers(self.transport.as_ref(), self.unit, &NIBE_TABLE, &ids).await?;

        let mut cache = self.cache.write();
        let mut updated = 0;
        for (id, value) in set.values {
            if let Some(slot) = cache.values.get_mut(&id) {
                *slot = value;
                updated += 1;
            }
        }
        cache.simple_read_at = Some(set.captured_at);
        Ok(updated)
    }

    /// Read operational mode and degree minutes
    pub async fn read_controller(&self) -> Result<ControllerState, DeviceError> {
        let set = read_registers(
            self.transport.as_ref(),
            self.unit,
            &NIBE_TABLE,
            &[ids::OPERATIONAL_MODE, ids::DEGREE_MINUTES],
        )
        .await?;

        let mode = set
            .f64(ids::OPERATIONAL_MODE)
            .and_then(|raw| OperationalMode::from_raw(raw as i64));
        let state = ControllerState {
            mode,
            degree_minutes: set.f64(ids::DEGREE_MINUTES),
            updated_at: Some(set.captured_at),
        };
        *self.controller.write() = state.clone();
        Ok(state)
    }

    /// Write a new operational mode, optionally with degree minutes
    pub async fn write_heatpump_mode(
        &self,
        request: &HeatpumpMode,
    ) -> Result<ControllerState, DeviceError> {
        write_register(
            self.transport.as_ref(),
            self.unit,
            &NIBE_TABLE,
            ids::OPERATIONAL_MODE,
            f64::from(request.mode.raw()),
        )
        .await?;
        if let Some(degree_minutes) = request.degree_minutes {
            write_register(
                self.transport.as_ref(),
                self.unit,
                &NIBE_TABLE,
                ids::DEGREE_MINUTES,
                degree_minutes,
            )
            .await?;
        }
        info!("Nibe1155 mode set to {:?}", request.mode);

        let mut controller = self.controller.write();
        controller.mode = Some(request.mode);
        if request.degree_minutes.is_some() {
            controller.degree_minutes = request.degree_minutes;
        }
        controller.updated_at = Some(Utc::now());
        Ok(controller.clone())
    }

    pub fn controller(&self) -> ControllerState {
        self.controller.read().clone()
    }

    /// Cached values of the logset ids
    pub fn logset_values(&self) -> BTreeMap<RegisterId, RegisterValue> {
        let Some(ids) = self.logset_ids() else {
            return BTreeMap::new();
        };
        let cache = self.cache.read();
        ids.iter()
            .filter_map(|id| cache.values.get(id).map(|v| (*id, v.clone())))
            .collect()
    }

    /// Cached data for the HTTP API
    ///
    /// Every requested id must exist in the register table.
    pub fn snapshot(&self, query: &NibeQuery) -> Result<Nibe1155Values, DecodeError> {
        if let Some(ids) = &query.ids {
            for id in ids {
                NIBE_TABLE.descriptor(*id)?;
            }
        }
        let wanted = |id: &RegisterId| query.ids.as_ref().is_none_or(|ids| ids.contains(id));

        let cache = self.cache.read();
        let logset = self.logset_ids().unwrap_or(&[]);
        let complete_values = query.complete_values.then(|| {
            cache
                .values
                .iter()
                .filter(|(id, _)| wanted(*id))
                .map(|(id, v)| (*id, v.clone()))
                .collect()
        });
        let simple_values = query.simple_values.then(|| {
            cache
                .values
                .iter()
                .filter(|(id, _)| logset.contains(*id) && wanted(*id))
                .map(|(id, v)| (*id, v.clone()))
                .collect()
        });

        Ok(Nibe1155Values {
            logset_ids: logset.to_vec(),
            complete_values,
            simple_values,
            controller: query.controller.then(|| self.controller()),
            complete_read_at: cache.complete_read_at,
            simple_read_at: cache.simple_read_at,
        })
    }

    /// Spawn the background poller
    ///
    /// Repeats the complete read every `period` until it succeeds, then
    /// refreshes the logset values every `period`.
    pub fn start_polling(self: &Arc<Self>, period: Duration) {
        let mut poller = self.poller.lock();
        if let Some((token, handle)) = poller.as_ref() {
            if !token.is_cancelled() && !handle.is_finished() {
                return;
            }
        }
        if let Some((_, handle)) = poller.take() {
            handle.abort();
        }

        let token = CancellationToken::new();
        let nibe = Arc::clone(self);
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!("Nibe1155 polling started, interval {:?}", period);

            loop {
                tokio::select! {
                    biased;
                    _ = task_token.cancelled() => break,
                    _ = interval.tick() => {},
                }

                let complete = nibe.cache.read().complete_read_at.is_some();
                let result = if complete {
                    nibe.read_simple_values().await.map(|_| ())
                } else {
                    nibe.read_complete_values().await.map(|_| ())
                };
                if let Err(e) = result {
                    warn!("Nibe1155 poll failed: {}", e);
                }
            }
            debug!("Nibe1155 polling stopped");
        });
        *poller = Some((token, handle));
    }

    /// Stop the background poller and wait for it to finish
    pub async fn stop_polling(&self) {
        let task = self.poller.lock().take();
        if let Some((token, handle)) = task {
            token.cancel();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!("Nibe1155 poller ended abnormally: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::registers::Value;
    use voltage_comlink::SimulatedBus;

    const LOGSET_ADDRESS: u16 = 8000;

    fn nibe_bus() -> Arc<SimulatedBus> {
        let bus = Arc::new(SimulatedBus::new("serial"));
        for d in NIBE_DESCRIPTORS.iter() {
            bus.fill(2, d.address, d.width);
        }
        bus.fill(2, LOGSET_ADDRESS, 8);
        // Logset: outdoor, supply, compressor power, an unknown id, terminator
        bus.set_registers(2, LOGSET_ADDRESS, &[40004, 40008, 43141, 40999, 0]);
        bus.set_register(2, 3, 52); // 40004 -> 5.2 °C
        bus
    }

    fn driver(bus: &Arc<SimulatedBus>) -> Arc<Nibe1155> {
        Arc::new(Nibe1155::new(bus.clone(), 2, LOGSET_ADDRESS, 8))
    }

    #[tokio::test]
    async fn test_logset_partitions_table() {
        let bus = nibe_bus();
        let nibe = driver(&bus);
        let logset = nibe.read_logset().await.unwrap().to_vec();
        assert_eq!(
            logset,
            vec![RegisterId(40004), RegisterId(40008), RegisterId(43141)]
        );

        let rest = nibe.non_logset_ids().unwrap();
        assert_eq!(rest.len() + logset.len(), NIBE_DESCRIPTORS.len());
        assert!(rest.iter().all(|id| !logset.contains(id)));

        // Enumerated once
        bus.clear_requests();
        nibe.read_logset().await.unwrap();
        assert_eq!(bus.request_count(), 0);
    }

    #[tokio::test]
    async fn test_simple_read_requires_complete_read() {
        let nibe = driver(&nibe_bus());
        assert!(matches!(
            nibe.read_simple_values().await,
            Err(DeviceError::NotReady(_))
        ));
    }

    #[tokio::test]
    async fn test_simple_read_updates_only_logset() {
        let bus = nibe_bus();
        let nibe = driver(&bus);
        nibe.read_complete_values().await.unwrap();

        bus.set_register(2, 3, 60); // outdoor 6.0
        bus.set_register(2, 40013 - 40001, 500); // hot water, not in logset
        assert_eq!(nibe.read_simple_values().await.unwrap(), 3);

        let values = nibe
            .snapshot(&NibeQuery {
                complete_values: true,
                ..Default::default()
            })
            .unwrap()
            .complete_values
            .unwrap();
        assert_eq!(values.len(), NIBE_DESCRIPTORS.len());
        assert_eq!(
            values[&ids::OUTDOOR_TEMPERATURE].value,
            Value::Float(6.0)
        );
        assert_eq!(values[&ids::HOT_WATER_TOP].value, Value::Float(0.0));
    }

    #[tokio::test]
    async fn test_write_mode() {
        let bus = nibe_bus();
        let nibe = driver(&bus);
        let state = nibe
            .write_heatpump_mode(&HeatpumpMode {
                mode: OperationalMode::AddHeatOnly,
                degree_minutes: Some(-120.0),
            })
            .await
            .unwrap();
        assert_eq!(state.mode, Some(OperationalMode::AddHeatOnly));
        assert_eq!(bus.get_register(2, 47137 - 40001), Some(2));
        assert_eq!(bus.get_register(2, 43005 - 40001), Some((-1200i16) as u16));

        let requests = bus.requests();
        assert_eq!(requests[0].function, FunctionCode::WriteSingleRegister);

        let read_back = nibe.read_controller().await.unwrap();
        assert_eq!(read_back.mode, Some(OperationalMode::AddHeatOnly));
        assert_eq!(read_back.degree_minutes, Some(-120.0));
    }

    #[tokio::test]
    async fn test_snapshot_rejects_unknown_id() {
        let nibe = driver(&nibe_bus());
        let err = nibe
            .snapshot(&NibeQuery {
                ids: Some(vec![RegisterId(12345)]),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, DecodeError::UnknownRegister { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_completes_then_simple_reads() {
        let bus = nibe_bus();
        let nibe = driver(&bus);
        nibe.start_polling(Duration::from_millis(100));
        // Second start while running is a no-op
        nibe.start_polling(Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(350)).await;
        nibe.stop_polling().await;

        let snapshot = nibe.snapshot(&NibeQuery::default()).unwrap();
        assert!(snapshot.complete_read_at.is_some());
        assert!(snapshot.simple_read_at.is_some());

        let after_stop = bus.request_count();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(bus.request_count(), after_stop);
    }
}
