//! Common test utilities and helpers
//!
//! Simulated buses with zero-filled register images for every device the
//! monitor polls, plus helpers to script the interesting values.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Local, TimeZone};
use monsrv::config::{Config, MonitorConfig, SaiaMeterConfig};
use monsrv::devices::fronius_meter::GRID_METER_REGISTERS;
use monsrv::devices::fronius_symo::{METER_BASE, MPPT_BASE};
use monsrv::devices::nibe1155::NIBE_TABLE;
use monsrv::devices::saia_meter::{SAIA_FIRST_REGISTER, SAIA_REGISTERS};
use monsrv::devices::{FroniusSymo, SaiaMeter};
use monsrv::monitor::{Monitor, MonitorSources};
use monsrv::statistics::Statistics;
use monsrv::AppContext;
use voltage_comlink::{ModbusTransport, SimulatedBus};

pub const INVERTER_UNIT: u8 = 1;
pub const METER_UNIT: u8 = 240;
pub const GRID_METER_UNIT: u8 = 1;
pub const NIBE_UNIT: u8 = 2;
pub const SAIA_UNIT: u8 = 3;
pub const LOGSET_ADDRESS: u16 = 8000;

/// Inverter and its smart meter behind Modbus/TCP
pub fn symo_bus() -> Arc<SimulatedBus> {
    let bus = Arc::new(SimulatedBus::new("froniusSymo"));
    bus.fill(INVERTER_UNIT, 500, 14);
    bus.fill(INVERTER_UNIT, 40000, 400);
    bus.fill(METER_UNIT, METER_BASE, 60);
    bus
}

/// Grid meter, Saia meter and heat pump on the serial line
pub fn serial_bus() -> Arc<SimulatedBus> {
    let bus = Arc::new(SimulatedBus::new("serial"));
    bus.fill(GRID_METER_UNIT, 0, GRID_METER_REGISTERS);
    bus.fill(SAIA_UNIT, SAIA_FIRST_REGISTER, SAIA_REGISTERS);
    for d in NIBE_TABLE.descriptors {
        bus.fill(NIBE_UNIT, d.address, d.width);
    }
    bus.fill(NIBE_UNIT, LOGSET_ADDRESS, 20);
    bus.set_registers(NIBE_UNIT, LOGSET_ADDRESS, &[40004, 40008, 43141, 0]);
    bus
}

/// Site energy of the day in Wh (4-word counter)
pub fn set_site_energy_day(bus: &SimulatedBus, wh: u64) {
    bus.set_registers(
        INVERTER_UNIT,
        502,
        &[
            (wh >> 48) as u16,
            (wh >> 32) as u16,
            (wh >> 16) as u16,
            wh as u16,
        ],
    );
}

/// Power of PV string 1 in W (register counts 0.01 W)
pub fn set_string1_power(bus: &SimulatedBus, watts: u16) {
    bus.set_register(INVERTER_UNIT, MPPT_BASE + 22, watts * 100);
}

/// Smart meter active power in W
pub fn set_meter_power(bus: &SimulatedBus, watts: i16) {
    bus.set_register(METER_UNIT, METER_BASE + 19, watts as u16);
}

/// Saia daily energy counter in Wh (register counts 10 Wh)
pub fn set_saia_de1(bus: &SimulatedBus, wh: u32) {
    bus.set_u32(SAIA_UNIT, 30, wh / 10);
}

pub fn at(day: u32, hour: u32, min: u32, sec: u32) -> DateTime<Local> {
    Local
        .with_ymd_and_hms(2024, 6, day, hour, min, sec)
        .single()
        .unwrap()
}

pub fn monitor_config() -> MonitorConfig {
    MonitorConfig {
        period_millis: 1000,
        fronius_period_millis: 1000,
        history_size: 60,
        stop_grace_millis: 100,
        degraded_after: 3,
        ..Default::default()
    }
}

pub struct Plant {
    pub symo_bus: Arc<SimulatedBus>,
    pub serial_bus: Arc<SimulatedBus>,
    pub symo: Arc<FroniusSymo>,
    pub saia: Arc<SaiaMeter>,
    pub monitor: Arc<Monitor>,
}

/// Monitor over the Symo (with its meter for metering) and one Saia meter
pub fn plant(config: MonitorConfig) -> Plant {
    let symo_bus = symo_bus();
    let serial_bus = serial_bus();
    let symo = Arc::new(FroniusSymo::new(
        symo_bus.clone(),
        INVERTER_UNIT,
        METER_UNIT,
    ));
    let saia = Arc::new(SaiaMeter::new("pvWest", serial_bus.clone(), SAIA_UNIT));
    let monitor = Arc::new(Monitor::new(
        config,
        MonitorSources {
            symo: Some(symo.clone()),
            grid_meter: None,
            saia: vec![saia.clone()],
            nibe: None,
        },
        Arc::new(Statistics::new()),
    ));
    Plant {
        symo_bus,
        serial_bus,
        symo,
        saia,
        monitor,
    }
}

/// Configuration with every device enabled and no CSV files
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.fronius_symo.enabled = true;
    config.grid_meter.enabled = true;
    config.grid_meter.unit = GRID_METER_UNIT;
    config.grid_meter.csv.enabled = false;
    config.saia_meters = vec![SaiaMeterConfig {
        name: "pvWest".to_string(),
        unit: SAIA_UNIT,
    }];
    config.nibe1155.enabled = true;
    config.nibe1155.unit = NIBE_UNIT;
    config.nibe1155.logset_address = LOGSET_ADDRESS;
    config.nibe1155.logset_length = 20;
    config.monitor = monitor_config();
    config.monitor.autostart = false;
    config
}

/// Context over simulated buses; `None` leaves that side unconfigured
pub fn context(
    config: Config,
    serial: Option<Arc<SimulatedBus>>,
    tcp: Option<Arc<SimulatedBus>>,
) -> Arc<AppContext> {
    Arc::new(AppContext::from_transports(
        config,
        serial.map(|b| b as Arc<dyn ModbusTransport>),
        tcp.map(|b| b as Arc<dyn ModbusTransport>),
    ))
}
