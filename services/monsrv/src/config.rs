//! monsrv configuration
//!
//! Layered with figment: built-in defaults, then the YAML file, then
//! `MONSRV_` environment variables with `__` between nesting levels
//! (`MONSRV_SERVER__PORT=9090`). Env keys are lowercased, so only
//! single-word keys can be overridden that way.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use voltage_comlink::{SerialParams, TcpParams};

use crate::error::{MonSrvError, Result};
use crate::registers::InterestingRange;

pub const DEFAULT_CONFIG_PATH: &str = "config/monsrv.yaml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
            port: default_port(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    /// Daily log files go here when set
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            dir: None,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

/// Shared serial line of the gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SerialConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub params: SerialParams,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            params: SerialParams::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FroniusSymoConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub tcp: TcpParams,
    #[serde(default = "default_inverter_unit")]
    pub inverter_unit: u8,
    #[serde(default = "default_meter_unit")]
    pub meter_unit: u8,
}

impl Default for FroniusSymoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tcp: TcpParams::default(),
            inverter_unit: default_inverter_unit(),
            meter_unit: default_meter_unit(),
        }
    }
}

fn default_inverter_unit() -> u8 {
    1
}

fn default_meter_unit() -> u8 {
    240
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CsvConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_csv_dir")]
    pub dir: PathBuf,
}

impl Default for CsvConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_csv_dir(),
        }
    }
}

fn default_csv_dir() -> PathBuf {
    PathBuf::from("/var/log/fronius")
}

/// Grid meter on the serial gateway; replaces the Symo meter when enabled
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GridMeterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_grid_meter_unit")]
    pub unit: u8,
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    #[serde(default)]
    pub csv: CsvConfig,
}

impl Default for GridMeterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            unit: default_grid_meter_unit(),
            history_size: default_history_size(),
            csv: CsvConfig::default(),
        }
    }
}

fn default_grid_meter_unit() -> u8 {
    1
}

fn default_history_size() -> usize {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SaiaMeterConfig {
    pub name: String,
    pub unit: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Nibe1155Config {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_nibe_unit")]
    pub unit: u8,
    #[serde(default = "default_logset_address")]
    pub logset_address: u16,
    #[serde(default = "default_logset_length")]
    pub logset_length: u16,
    #[serde(default = "default_nibe_poll_millis")]
    pub poll_millis: u64,
}

impl Default for Nibe1155Config {
    fn default() -> Self {
        Self {
            enabled: true,
            unit: default_nibe_unit(),
            logset_address: default_logset_address(),
            logset_length: default_logset_length(),
            poll_millis: default_nibe_poll_millis(),
        }
    }
}

fn default_nibe_unit() -> u8 {
    2
}

fn default_logset_address() -> u16 {
    8000
}

fn default_logset_length() -> u16 {
    20
}

fn default_nibe_poll_millis() -> u64 {
    2000
}

/// Wall clock position of the first tick within the minute
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TimeOffset {
    #[serde(default)]
    pub sec: u32,
    #[serde(default)]
    pub ms: u32,
}

/// Registers whose changes are logged per block
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiffRanges {
    #[serde(default = "default_fronius_register_range")]
    pub fronius_register: InterestingRange,
    #[serde(default = "default_inverter_range")]
    pub inverter: InterestingRange,
    #[serde(default = "default_extension_range")]
    pub inverter_extension: InterestingRange,
    #[serde(default = "default_storage_range")]
    pub storage: InterestingRange,
}

impl Default for DiffRanges {
    fn default() -> Self {
        Self {
            fronius_register: default_fronius_register_range(),
            inverter: default_inverter_range(),
            inverter_extension: default_extension_range(),
            storage: default_storage_range(),
        }
    }
}

fn default_fronius_register_range() -> InterestingRange {
    InterestingRange::new(500, 510, &[])
}

// Scale factors of DC voltage and power change with range switching
fn default_inverter_range() -> InterestingRange {
    InterestingRange::new(40072, 40109, &[40100, 40102])
}

// String timestamps change on every read
fn default_extension_range() -> InterestingRange {
    InterestingRange::new(11, 48, &[25])
}

fn default_storage_range() -> InterestingRange {
    InterestingRange::new(9, 12, &[10, 11])
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonitorConfig {
    #[serde(default)]
    pub disabled: bool,
    /// Keep the monitor running without subscribers
    #[serde(default = "default_true")]
    pub autostart: bool,
    #[serde(default = "default_period_millis")]
    pub period_millis: u64,
    #[serde(default = "default_period_millis")]
    pub fronius_period_millis: u64,
    #[serde(default)]
    pub time_offset: Option<TimeOffset>,
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    #[serde(default = "default_stop_grace_millis")]
    pub stop_grace_millis: u64,
    /// Consecutive failed ticks before health turns degraded
    #[serde(default = "default_degraded_after")]
    pub degraded_after: u32,
    #[serde(default)]
    pub diff_ranges: DiffRanges,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            autostart: true,
            period_millis: default_period_millis(),
            fronius_period_millis: default_period_millis(),
            time_offset: None,
            history_size: default_history_size(),
            stop_grace_millis: default_stop_grace_millis(),
            degraded_after: default_degraded_after(),
            diff_ranges: DiffRanges::default(),
        }
    }
}

fn default_period_millis() -> u64 {
    1000
}

fn default_stop_grace_millis() -> u64 {
    200
}

fn default_degraded_after() -> u32 {
    3
}

impl MonitorConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_millis)
    }

    pub fn fronius_period(&self) -> Duration {
        Duration::from_millis(self.fronius_period_millis)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_millis)
    }
}

/// Complete service configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "default_shutdown_millis")]
    pub shutdown_millis: u64,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub fronius_symo: FroniusSymoConfig,
    #[serde(default)]
    pub grid_meter: GridMeterConfig,
    #[serde(default)]
    pub saia_meters: Vec<SaiaMeterConfig>,
    #[serde(default)]
    pub nibe1155: Nibe1155Config,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

fn default_shutdown_millis() -> u64 {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            shutdown_millis: default_shutdown_millis(),
            serial: SerialConfig::default(),
            fronius_symo: FroniusSymoConfig::default(),
            grid_meter: GridMeterConfig::default(),
            saia_meters: Vec::new(),
            nibe1155: Nibe1155Config::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration
    ///
    /// An explicitly given file must exist; the default path is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) if !path.exists() => {
                return Err(MonSrvError::config(format!(
                    "Config file not found: {}",
                    path.display()
                )))
            },
            Some(path) => path.to_path_buf(),
            None => PathBuf::from(DEFAULT_CONFIG_PATH),
        };
        Self::figment(&file)
            .extract()
            .map_err(|e| MonSrvError::config(format!("Failed to load configuration: {}", e)))
    }

    pub fn figment(file: &Path) -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Yaml::file(file))
            .merge(Env::prefixed("MONSRV_").split("__"))
    }

    /// Serial devices share one line; it is needed when any of them is on
    pub fn serial_required(&self) -> bool {
        self.grid_meter.enabled || self.nibe1155.enabled || !self.saia_meters.is_empty()
    }

    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_millis(self.shutdown_millis)
    }

    /// Reject values the service cannot run with
    pub fn validate(&self) -> Result<()> {
        let monitor = &self.monitor;
        if monitor.period_millis == 0 || monitor.fronius_period_millis == 0 {
            return Err(MonSrvError::config("monitor periods must be positive"));
        }
        if monitor.history_size == 0 {
            return Err(MonSrvError::config("monitor.historySize must be positive"));
        }
        if let Some(offset) = monitor.time_offset {
            if offset.sec > 59 || offset.ms > 999 {
                return Err(MonSrvError::config(format!(
                    "monitor.timeOffset out of range: {}s {}ms",
                    offset.sec, offset.ms
                )));
            }
        }
        for (name, range) in [
            ("froniusRegister", &monitor.diff_ranges.fronius_register),
            ("inverter", &monitor.diff_ranges.inverter),
            ("inverterExtension", &monitor.diff_ranges.inverter_extension),
            ("storage", &monitor.diff_ranges.storage),
        ] {
            if range.first > range.last {
                return Err(MonSrvError::config(format!(
                    "monitor.diffRanges.{}: first {} > last {}",
                    name, range.first, range.last
                )));
            }
        }

        if self.server.enabled && self.server.port == 0 {
            return Err(MonSrvError::config("server.port must not be 0"));
        }
        if self.fronius_symo.enabled && self.fronius_symo.tcp.host.trim().is_empty() {
            return Err(MonSrvError::config("froniusSymo.tcp.host is empty"));
        }
        if !self.fronius_symo.enabled && !self.grid_meter.enabled && !monitor.disabled {
            return Err(MonSrvError::config(
                "monitor needs froniusSymo or gridMeter for metering",
            ));
        }
        if self.serial_required() {
            if !self.serial.enabled {
                return Err(MonSrvError::config(
                    "serial devices configured but serial.enabled is false",
                ));
            }
            if self.serial.params.device.trim().is_empty() {
                return Err(MonSrvError::config("serial.device is empty"));
            }
        }
        if self.nibe1155.enabled && self.nibe1155.poll_millis == 0 {
            return Err(MonSrvError::config("nibe1155.pollMillis must be positive"));
        }
        if self.grid_meter.enabled && self.grid_meter.history_size == 0 {
            return Err(MonSrvError::config("gridMeter.historySize must be positive"));
        }
        Ok(())
    }
}
