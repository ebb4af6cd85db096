//! Monitor scheduler
//!
//! Polls all configured devices on a fixed period and assembles one
//! [`MonitorRecord`] per tick. The Fronius Symo blocks are read in parallel
//! on their own (possibly longer) period; the metering path, the auxiliary
//! meters and the heat pump controller are read in parallel on every tick.
//! A failed block read keeps the previous snapshot in the record.
//!
//! Timing uses the monotonic tokio clock. The wall clock is read once at
//! start to align the first tick to the configured second and millisecond.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, TimeDelta, Timelike};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{MonitorConfig, TimeOffset};
use crate::devices::fronius_symo::ids as symo_ids;
use crate::devices::{FroniusMeter, FroniusSymo, Nibe1155, SaiaMeter};
use crate::error::{DeviceError, SchedulerError};
use crate::fanout::PollSource;
use crate::record::{Calculated, HeatpumpRecord, Metering, MonitorRecord};
use crate::registers::{InterestingRange, RegisterSet};
use crate::statistics::Statistics;

/// Records buffered per broadcast receiver before it lags
pub const RECORD_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MonitorState {
    Stopped,
    Aligning,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum Health {
    Healthy,
    #[serde(rename_all = "camelCase")]
    Degraded { consecutive_failures: u32 },
}

/// Devices polled by the monitor
#[derive(Clone, Default)]
pub struct MonitorSources {
    pub symo: Option<Arc<FroniusSymo>>,
    /// Takes precedence over the Symo meter for metering
    pub grid_meter: Option<Arc<FroniusMeter>>,
    pub saia: Vec<Arc<SaiaMeter>>,
    pub nibe: Option<Arc<Nibe1155>>,
}

/// Delay from `now` to the next instant matching `offset` modulo `period`
///
/// The target is the offset within the minute after `now`; the distance is
/// reduced modulo the period so the first tick happens within one period.
pub fn alignment_delay(now: DateTime<Local>, offset: TimeOffset, period: Duration) -> Duration {
    let period_ms = period.as_millis() as i64;
    if period_ms <= 0 {
        return Duration::ZERO;
    }
    let target = (now + TimeDelta::seconds(60))
        .with_second(offset.sec)
        .and_then(|t| t.with_nanosecond(offset.ms * 1_000_000));
    // Ambiguous local time around DST switches
    let Some(target) = target else {
        return Duration::ZERO;
    };
    let dt = (target - now).num_milliseconds();
    Duration::from_millis(dt.rem_euclid(period_ms) as u64)
}

/// Counter value since the daily baseline
///
/// A pending baseline is taken from the current raw value. An offset above
/// the raw value means the counter was reset and the offset drops to zero.
fn daily_delta(offset: &mut f64, baseline_pending: &mut bool, raw: Option<f64>) -> Option<f64> {
    let raw = raw?;
    if *baseline_pending {
        *offset = raw;
        *baseline_pending = false;
    }
    if *offset > raw {
        warn!("Counter decreased below offset ({} < {}), offset reset", raw, offset);
        *offset = 0.0;
    }
    Some(raw - *offset)
}

/// Log register changes of a fresh block read; 1 when the read succeeded
fn note_block(
    result: &Result<Arc<RegisterSet>, DeviceError>,
    previous: Option<&RegisterSet>,
    range: &InterestingRange,
) -> usize {
    let Ok(set) = result else {
        return 0;
    };
    if let Some(previous) = previous {
        for change in set.diff(previous, range) {
            debug!(
                "{} changed {}: {:?} -> {:?}",
                change.device, change.id, change.before, change.after
            );
        }
    }
    1
}

#[derive(Debug)]
struct TickState {
    last_fronius_poll: Option<DateTime<Local>>,
    last_success: Option<DateTime<Local>>,
    last_extension_at: Option<DateTime<Local>>,
    pv_south_energy_daily: f64,
    saia_offset: f64,
    site_offset: f64,
    saia_baseline_pending: bool,
    site_baseline_pending: bool,
    consecutive_failures: u32,
}

impl TickState {
    fn new() -> Self {
        Self {
            last_fronius_poll: None,
            last_success: None,
            last_extension_at: None,
            pv_south_energy_daily: 0.0,
            saia_offset: 0.0,
            site_offset: 0.0,
            saia_baseline_pending: true,
            site_baseline_pending: true,
            consecutive_failures: 0,
        }
    }

    /// Add the energy of PV string 1 since the previous extension read
    fn integrate_pv_south(&mut self, extension: &RegisterSet, now: DateTime<Local>) {
        let Some(power) = extension.f64(symo_ids::STRING1_POWER) else {
            return;
        };
        if let Some(last) = self.last_extension_at {
            let dt_ms = (now - last).num_milliseconds();
            if dt_ms > 0 {
                let de = power * dt_ms as f64 / 3_600_000.0;
                self.pv_south_energy_daily = if last.date_naive() != now.date_naive() {
                    de
                } else {
                    self.pv_south_energy_daily + de
                };
                debug!(
                    "String 1 (PV-South): P={:7.2}W, dt={}ms, dE={:7.3}Wh, E-day={:9.3}Wh",
                    power, dt_ms, de, self.pv_south_energy_daily
                );
            }
        }
        self.last_extension_at = Some(now);
    }
}

type MonitorTask = (CancellationToken, JoinHandle<()>);

/// Polling scheduler producing monitor records
pub struct Monitor {
    config: MonitorConfig,
    sources: MonitorSources,
    statistics: Arc<Statistics>,
    fronius_period: TimeDelta,
    tick_state: tokio::sync::Mutex<TickState>,
    history: Mutex<VecDeque<Arc<MonitorRecord>>>,
    records: broadcast::Sender<Arc<MonitorRecord>>,
    health: watch::Sender<Health>,
    state: watch::Sender<MonitorState>,
    task: Mutex<Option<MonitorTask>>,
}

impl Monitor {
    pub fn new(config: MonitorConfig, sources: MonitorSources, statistics: Arc<Statistics>) -> Self {
        let (records, _) = broadcast::channel(RECORD_CHANNEL_CAPACITY);
        let (health, _) = watch::channel(Health::Healthy);
        let (state, _) = watch::channel(MonitorState::Stopped);
        // Tick jitter must not skip a Fronius poll
        let fronius_period = TimeDelta::milliseconds(
            config.fronius_period_millis as i64 - config.period_millis as i64 / 2,
        );
        Self {
            history: Mutex::new(VecDeque::with_capacity(config.history_size)),
            config,
            sources,
            statistics,
            fronius_period,
            tick_state: tokio::sync::Mutex::new(TickState::new()),
            records,
            health,
            state,
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn statistics(&self) -> &Arc<Statistics> {
        &self.statistics
    }

    pub fn state(&self) -> MonitorState {
        *self.state.borrow()
    }

    pub fn health(&self) -> Health {
        *self.health.borrow()
    }

    pub fn watch_health(&self) -> watch::Receiver<Health> {
        self.health.subscribe()
    }

    /// Receiver of every record published after this call
    pub fn subscribe_records(&self) -> broadcast::Receiver<Arc<MonitorRecord>> {
        self.records.subscribe()
    }

    pub fn record_sender(&self) -> broadcast::Sender<Arc<MonitorRecord>> {
        self.records.clone()
    }

    /// Records oldest first
    pub fn history(&self) -> Vec<Arc<MonitorRecord>> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<Arc<MonitorRecord>> {
        self.history.lock().back().cloned()
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|(token, handle)| !token.is_cancelled() && !handle.is_finished())
    }

    /// Spawn the polling loop; false when disabled or already running
    pub fn start(self: &Arc<Self>) -> bool {
        if self.config.disabled {
            info!("Monitor disabled");
            return false;
        }
        let mut task = self.task.lock();
        if let Some((token, handle)) = task.as_ref() {
            if !token.is_cancelled() && !handle.is_finished() {
                return false;
            }
        }
        // A halted loop may still be winding down
        if let Some((_, handle)) = task.take() {
            handle.abort();
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(self).run(token.clone()));
        *task = Some((token, handle));
        true
    }

    /// Cancel the polling loop without waiting for it
    pub fn halt(&self) {
        if let Some((token, _)) = self.task.lock().as_ref() {
            if !token.is_cancelled() {
                info!("Monitor halted");
                token.cancel();
            }
        }
        self.state.send_replace(MonitorState::Stopped);
    }

    /// Cancel the polling loop and wait up to the grace period for it
    ///
    /// Safe to call when already stopped.
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some((token, mut handle)) = task {
            self.state.send_replace(MonitorState::Stopping);
            token.cancel();
            match tokio::time::timeout(self.config.stop_grace(), &mut handle).await {
                Ok(Err(e)) if !e.is_cancelled() => warn!("Monitor task ended abnormally: {}", e),
                Ok(_) => {},
                Err(_) => {
                    warn!(
                        "Monitor tick still running after {:?}, aborting",
                        self.config.stop_grace()
                    );
                    handle.abort();
                },
            }
            info!("Monitor stopped");
        }
        self.state.send_replace(MonitorState::Stopped);
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        if let Some(offset) = self.config.time_offset {
            let delay = alignment_delay(Local::now(), offset, self.config.fronius_period());
            self.state.send_replace(MonitorState::Aligning);
            info!(
                "Monitor aligning to {}s {}ms, first tick in {:?}",
                offset.sec, offset.ms, delay
            );
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {},
            }
        }

        self.state.send_replace(MonitorState::Running);
        info!("Monitor running, period {:?}", self.config.period());
        let mut interval = tokio::time::interval(self.config.period());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = interval.tick() => {},
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                // Failures are logged by tick_once; the loop continues
                _ = self.tick(Local::now(), Some(&token)) => {},
            }
        }
        debug!("Monitor loop finished");
    }

    /// Run one tick at wall clock time `now`
    ///
    /// The record is appended to the history, handed to the statistics and
    /// broadcast to subscribers.
    pub async fn tick_once(
        &self,
        now: DateTime<Local>,
    ) -> Result<Arc<MonitorRecord>, SchedulerError> {
        self.tick(now, None).await
    }

    /// Tick on behalf of the polling loop owning `token`
    ///
    /// Once the loop is cancelled its record is no longer published, so a
    /// halt followed by a history clear leaves the history empty.
    async fn tick(
        &self,
        now: DateTime<Local>,
        token: Option<&CancellationToken>,
    ) -> Result<Arc<MonitorRecord>, SchedulerError> {
        let mut state = self.tick_state.lock().await;
        match self.poll(&mut state, now).await {
            Ok(record) => {
                if state.consecutive_failures >= self.config.degraded_after {
                    info!(
                        "Monitor recovered after {} failed ticks",
                        state.consecutive_failures
                    );
                }
                state.consecutive_failures = 0;
                state.last_success = Some(now);
                self.health.send_if_modified(|health| {
                    let changed = *health != Health::Healthy;
                    *health = Health::Healthy;
                    changed
                });

                let record = Arc::new(record);
                {
                    let mut history = self.history.lock();
                    if token.is_some_and(CancellationToken::is_cancelled) {
                        debug!("Monitor halted during tick, record dropped");
                        return Ok(record);
                    }
                    while history.len() >= self.config.history_size.max(1) {
                        history.pop_front();
                    }
                    history.push_back(record.clone());
                }
                self.statistics.handle_record(&record);
                // No subscribers is fine
                let _ = self.records.send(record.clone());
                Ok(record)
            },
            Err(e) => {
                state.consecutive_failures += 1;
                let failures = state.consecutive_failures;
                warn!("Monitor tick failed ({} in a row): {}", failures, e);
                self.statistics.record_failure(now);
                if failures >= self.config.degraded_after {
                    self.health.send_replace(Health::Degraded {
                        consecutive_failures: failures,
                    });
                }
                Err(e)
            },
        }
    }

    async fn poll(
        &self,
        state: &mut TickState,
        now: DateTime<Local>,
    ) -> Result<MonitorRecord, SchedulerError> {
        let day_changed = state
            .last_success
            .is_some_and(|last| last.date_naive() != now.date_naive());
        if day_changed {
            info!("Day changed to {}, daily offsets restart", now.date_naive());
            state.saia_baseline_pending = true;
            state.site_baseline_pending = true;
            state.pv_south_energy_daily = 0.0;
        }

        let mut attempted = 0usize;
        let mut succeeded = 0usize;

        if let Some(symo) = &self.sources.symo {
            let due = state
                .last_fronius_poll
                .is_none_or(|last| now - last >= self.fronius_period);
            if due {
                state.last_fronius_poll = Some(now);
                let previous_register = symo.fronius_register();
                let previous_inverter = symo.inverter();
                let previous_extension = symo.inverter_extension();
                let previous_storage = symo.storage();

                let (register, inverter, extension, storage) = tokio::join!(
                    symo.read_fronius_register(),
                    symo.read_inverter(),
                    symo.read_inverter_extension(),
                    symo.read_storage(),
                );
                attempted += 4;

                let ranges = &self.config.diff_ranges;
                succeeded += note_block(
                    &register,
                    previous_register.as_deref(),
                    &ranges.fronius_register,
                );
                succeeded += note_block(&inverter, previous_inverter.as_deref(), &ranges.inverter);
                succeeded += note_block(
                    &extension,
                    previous_extension.as_deref(),
                    &ranges.inverter_extension,
                );
                succeeded += note_block(&storage, previous_storage.as_deref(), &ranges.storage);

                if let Ok(extension) = &extension {
                    state.integrate_pv_south(extension, now);
                }
                if symo.nameplate().is_none() && symo.read_nameplate().await.is_ok() {
                    info!("Fronius Symo nameplate read");
                }
            }
        }

        let metering_read = async {
            match (&self.sources.grid_meter, &self.sources.symo) {
                (Some(meter), _) => Some(meter.read().await.map(Metering::Gridmeter)),
                (None, Some(symo)) => Some(symo.read_meter().await.map(Metering::Meter)),
                (None, None) => None,
            }
        };
        let saia_read = join_all(self.sources.saia.iter().map(|saia| saia.read()));
        let controller_read = async {
            match &self.sources.nibe {
                Some(nibe) => Some(nibe.read_controller().await),
                None => None,
            }
        };
        let (metering, saia, controller) = tokio::join!(metering_read, saia_read, controller_read);

        let metering = match metering {
            Some(Ok(metering)) => {
                attempted += 1;
                succeeded += 1;
                Some(metering)
            },
            Some(Err(_)) => {
                attempted += 1;
                self.cached_metering()
            },
            None => None,
        };

        let mut ext_meters = Vec::with_capacity(saia.len());
        for (meter, result) in self.sources.saia.iter().zip(saia) {
            attempted += 1;
            match result {
                Ok(values) => {
                    succeeded += 1;
                    ext_meters.push(values);
                },
                Err(_) => ext_meters.extend(meter.latest()),
            }
        }

        if let Some(result) = &controller {
            attempted += 1;
            match result {
                Ok(_) => succeeded += 1,
                Err(e) => warn!("Heat pump controller read failed: {}", e),
            }
        }

        if attempted > 0 && succeeded == 0 {
            return Err(SchedulerError::TickFailed(format!(
                "all {} device reads failed",
                attempted
            )));
        }
        let Some(metering) = metering else {
            return Err(SchedulerError::TickFailed(
                "no metering data available".to_string(),
            ));
        };

        let symo = self.sources.symo.as_ref();
        let fronius_register = symo.and_then(|s| s.fronius_register());
        let saia_daily_energy = daily_delta(
            &mut state.saia_offset,
            &mut state.saia_baseline_pending,
            ext_meters.first().map(|m| m.de1),
        );
        let fronius_site_daily_energy = daily_delta(
            &mut state.site_offset,
            &mut state.site_baseline_pending,
            fronius_register
                .as_ref()
                .and_then(|r| r.f64(symo_ids::SITE_ENERGY_DAY)),
        );

        let heatpump = self.sources.nibe.as_ref().map(|nibe| HeatpumpRecord {
            controller: nibe.controller(),
            values: nibe.logset_values(),
        });

        Ok(MonitorRecord {
            timestamp: now,
            fronius_register,
            inverter: symo.and_then(|s| s.inverter()),
            nameplate: symo.and_then(|s| s.nameplate()),
            inverter_extension: symo.and_then(|s| s.inverter_extension()),
            storage: symo.and_then(|s| s.storage()),
            metering,
            ext_meters,
            heatpump,
            calculated: Calculated {
                pv_south_energy_daily: state.pv_south_energy_daily,
                saia_offset: state.saia_offset,
                fronius_site_daily_offset: state.site_offset,
                saia_daily_energy,
                fronius_site_daily_energy,
            },
        })
    }

    fn cached_metering(&self) -> Option<Metering> {
        match (&self.sources.grid_meter, &self.sources.symo) {
            (Some(meter), _) => meter.latest().map(Metering::Gridmeter),
            (None, Some(symo)) => symo.meter().map(Metering::Meter),
            (None, None) => None,
        }
    }
}

impl PollSource for Monitor {
    fn start_polling(self: Arc<Self>) {
        if self.start() {
            info!("Monitor started for subscribers");
        }
    }

    fn stop_polling(&self) {
        self.halt();
        self.clear_history();
    }
}
