//! Application context
//!
//! Built once at startup and handed to the HTTP layer as `Arc<AppContext>`.
//! Owns the transports, the device drivers, the monitor and its feed.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info, warn};
use voltage_comlink::{AsciiTransport, ModbusTransport, TcpTransport};

use crate::config::Config;
use crate::devices::{FroniusMeter, FroniusSymo, Nibe1155, SaiaMeter};
use crate::error::{MonSrvError, Result};
use crate::fanout::{MonitorFeed, Subscription};
use crate::history::DailyCsvWriter;
use crate::monitor::{Monitor, MonitorSources};
use crate::record::MonitorRecord;
use crate::statistics::Statistics;

pub struct AppContext {
    config: Config,
    serial: Option<Arc<AsciiTransport>>,
    tcp: Option<Arc<TcpTransport>>,
    pub symo: Option<Arc<FroniusSymo>>,
    pub grid_meter: Option<Arc<FroniusMeter>>,
    pub saia: Vec<Arc<SaiaMeter>>,
    pub nibe: Option<Arc<Nibe1155>>,
    pub statistics: Arc<Statistics>,
    pub monitor: Arc<Monitor>,
    pub feed: Arc<MonitorFeed>,
    autostart: Mutex<Option<Subscription<Arc<MonitorRecord>>>>,
}

impl AppContext {
    /// Wire drivers, monitor and feed onto the given transports
    ///
    /// Serial devices are created only with a serial transport, the Fronius
    /// Symo only with a TCP transport.
    pub fn from_transports(
        config: Config,
        serial: Option<Arc<dyn ModbusTransport>>,
        tcp: Option<Arc<dyn ModbusTransport>>,
    ) -> Self {
        let symo = tcp.filter(|_| config.fronius_symo.enabled).map(|tcp| {
            Arc::new(FroniusSymo::new(
                tcp,
                config.fronius_symo.inverter_unit,
                config.fronius_symo.meter_unit,
            ))
        });

        let mut grid_meter = None;
        let mut saia = Vec::new();
        let mut nibe = None;
        if let Some(serial) = serial {
            if config.grid_meter.enabled {
                let gm = &config.grid_meter;
                let mut meter = FroniusMeter::new(serial.clone(), gm.unit, gm.history_size);
                if gm.csv.enabled {
                    info!("Grid meter CSV history in {}", gm.csv.dir.display());
                    meter = meter.with_sink(Arc::new(DailyCsvWriter::new(&gm.csv.dir)));
                }
                grid_meter = Some(Arc::new(meter));
            }
            saia = config
                .saia_meters
                .iter()
                .map(|m| Arc::new(SaiaMeter::new(m.name.clone(), serial.clone(), m.unit)))
                .collect();
            if config.nibe1155.enabled {
                let n = &config.nibe1155;
                nibe = Some(Arc::new(Nibe1155::new(
                    serial,
                    n.unit,
                    n.logset_address,
                    n.logset_length,
                )));
            }
        }

        let statistics = Arc::new(Statistics::new());
        let monitor = Arc::new(Monitor::new(
            config.monitor.clone(),
            MonitorSources {
                symo: symo.clone(),
                grid_meter: grid_meter.clone(),
                saia: saia.clone(),
                nibe: nibe.clone(),
            },
            statistics.clone(),
        ));
        let feed = Arc::new(MonitorFeed::new(monitor.clone(), monitor.record_sender()));

        Self {
            config,
            serial: None,
            tcp: None,
            symo,
            grid_meter,
            saia,
            nibe,
            statistics,
            monitor,
            feed,
            autostart: Mutex::new(None),
        }
    }

    /// Open the serial line and connect the inverter in parallel
    ///
    /// A serial line that cannot be opened is fatal. A failed TCP connect is
    /// not; requests reconnect on demand.
    pub async fn open(config: Config) -> Result<Self> {
        let serial = config
            .serial_required()
            .then(|| Arc::new(AsciiTransport::new("serial", config.serial.params.clone())));
        let tcp = config
            .fronius_symo
            .enabled
            .then(|| Arc::new(TcpTransport::new("froniusSymo", config.fronius_symo.tcp.clone())));

        let open_serial = async {
            match &serial {
                Some(line) => line.open().await,
                None => Ok(()),
            }
        };
        let start_tcp = async {
            if let Some(link) = &tcp {
                if let Err(e) = link.start().await {
                    warn!("Fronius Symo not reachable yet: {}", e);
                }
            }
        };
        let (opened, ()) = tokio::join!(open_serial, start_tcp);
        opened.map_err(|e| {
            MonSrvError::config(format!(
                "Cannot open serial line {}: {}",
                config.serial.params.device, e
            ))
        })?;

        let mut context = Self::from_transports(
            config,
            serial.clone().map(|s| s as Arc<dyn ModbusTransport>),
            tcp.clone().map(|t| t as Arc<dyn ModbusTransport>),
        );
        context.serial = serial;
        context.tcp = tcp;
        Ok(context)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start devices and, with autostart, the monitor
    pub async fn start(&self) {
        if let Some(symo) = &self.symo {
            symo.start().await;
        }
        if let Some(nibe) = &self.nibe {
            nibe.start_polling(Duration::from_millis(self.config.nibe1155.poll_millis));
        }
        if self.config.monitor.disabled {
            info!("Monitor disabled by configuration");
        } else if self.config.monitor.autostart {
            // Permanent subscriber keeps polling without HTTP clients
            *self.autostart.lock() = Some(self.feed.subscribe());
        } else {
            info!("Monitor starts with the first subscriber");
        }
    }

    /// Stop the monitor, releasing the autostart subscription
    pub async fn stop_monitor(&self) {
        let subscription = self.autostart.lock().take();
        drop(subscription);
        self.monitor.stop().await;
    }

    /// Stop the heat pump poller and close the transports
    ///
    /// Returns the number of steps that failed.
    pub async fn close_devices(&self) -> usize {
        let mut failures = 0;
        if let Some(nibe) = &self.nibe {
            nibe.stop_polling().await;
        }
        if let Some(serial) = &self.serial {
            if let Err(e) = serial.close().await {
                error!("Serial close failed: {}", e);
                failures += 1;
            }
        }
        if let Some(tcp) = &self.tcp {
            if let Err(e) = tcp.stop().await {
                error!("TCP stop failed: {}", e);
                failures += 1;
            }
        }
        failures
    }
}
