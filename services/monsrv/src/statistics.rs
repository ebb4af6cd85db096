//! Running daily aggregates of monitor records
//!
//! Every record updates the aggregates in constant time; nothing is ever
//! recomputed from the history. The aggregate of the previous day is kept
//! after a day change.

use chrono::{DateTime, Local, NaiveDate};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::record::MonitorRecord;

/// Min, max and mean of a power series in W
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerStats {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
    pub samples: u64,
    #[serde(skip)]
    sum: f64,
}

impl PowerStats {
    fn add(&mut self, value: f64) {
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
        self.samples += 1;
        self.sum += value;
        self.avg = Some(self.sum / self.samples as f64);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStatistics {
    pub day: NaiveDate,
    pub first_record_at: DateTime<Local>,
    pub last_record_at: DateTime<Local>,
    pub records: u64,
    pub failed_ticks: u64,
    pub grid_power: PowerStats,
    pub pv_power: PowerStats,
    /// Wh imported from the grid, integrated from grid power
    pub grid_import_energy: f64,
    /// Wh fed into the grid
    pub grid_export_energy: f64,
    pub pv_south_energy: f64,
    pub saia_daily_energy: Option<f64>,
    pub fronius_site_daily_energy: Option<f64>,
}

impl DailyStatistics {
    fn new(at: DateTime<Local>) -> Self {
        Self {
            day: at.date_naive(),
            first_record_at: at,
            last_record_at: at,
            records: 0,
            failed_ticks: 0,
            grid_power: PowerStats::default(),
            pv_power: PowerStats::default(),
            grid_import_energy: 0.0,
            grid_export_energy: 0.0,
            pv_south_energy: 0.0,
            saia_daily_energy: None,
            fronius_site_daily_energy: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsSnapshot {
    pub started_at: DateTime<Local>,
    pub total_records: u64,
    pub total_failed_ticks: u64,
    pub today: Option<DailyStatistics>,
    pub yesterday: Option<DailyStatistics>,
}

#[derive(Debug)]
struct Aggregates {
    started_at: DateTime<Local>,
    total_records: u64,
    total_failed_ticks: u64,
    today: Option<DailyStatistics>,
    yesterday: Option<DailyStatistics>,
    last_grid_power: Option<(DateTime<Local>, f64)>,
}

impl Aggregates {
    /// Aggregate of the day of `at`, rolling over when the day changed
    fn day_of(&mut self, at: DateTime<Local>) -> &mut DailyStatistics {
        let day = at.date_naive();
        if self.today.as_ref().is_some_and(|t| t.day != day) {
            info!("Statistics day change to {}", day);
            self.yesterday = self.today.take();
            self.last_grid_power = None;
        }
        self.today.get_or_insert_with(|| DailyStatistics::new(at))
    }
}

/// Statistics aggregator fed by the monitor
#[derive(Debug)]
pub struct Statistics {
    inner: Mutex<Aggregates>,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Aggregates {
                started_at: Local::now(),
                total_records: 0,
                total_failed_ticks: 0,
                today: None,
                yesterday: None,
                last_grid_power: None,
            }),
        }
    }

    pub fn handle_record(&self, record: &MonitorRecord) {
        let at = record.timestamp;
        let grid_power = record.grid_power();
        let pv_power = record.pv_power();

        let mut inner = self.inner.lock();
        inner.total_records += 1;
        let previous_grid = inner.last_grid_power;
        let today = inner.day_of(at);

        today.records += 1;
        today.last_record_at = at;
        if let Some(p) = pv_power {
            today.pv_power.add(p);
        }
        if let Some(p) = grid_power {
            today.grid_power.add(p);
            // Rectangle rule with the power of the previous record
            if let Some((prev_at, prev_p)) = previous_grid {
                let dt_ms = (at - prev_at).num_milliseconds();
                if dt_ms > 0 {
                    let energy = prev_p * dt_ms as f64 / 3_600_000.0;
                    if energy >= 0.0 {
                        today.grid_import_energy += energy;
                    } else {
                        today.grid_export_energy -= energy;
                    }
                }
            }
        }
        today.pv_south_energy = record.calculated.pv_south_energy_daily;
        today.saia_daily_energy = record.calculated.saia_daily_energy;
        today.fronius_site_daily_energy = record.calculated.fronius_site_daily_energy;

        inner.last_grid_power = grid_power.map(|p| (at, p));
    }

    pub fn record_failure(&self, at: DateTime<Local>) {
        let mut inner = self.inner.lock();
        inner.total_failed_ticks += 1;
        inner.day_of(at).failed_ticks += 1;
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        let inner = self.inner.lock();
        StatisticsSnapshot {
            started_at: inner.started_at,
            total_records: inner.total_records,
            total_failed_ticks: inner.total_failed_ticks,
            today: inner.today.clone(),
            yesterday: inner.yesterday.clone(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::devices::GridMeterSample;
    use crate::record::{Calculated, Metering};
    use chrono::TimeZone;

    fn record(day: u32, hour: u32, minute: u32, power: f64) -> MonitorRecord {
        let timestamp = Local
            .with_ymd_and_hms(2024, 6, day, hour, minute, 0)
            .single()
            .unwrap();
        MonitorRecord {
            timestamp,
            fronius_register: None,
            inverter: None,
            nameplate: None,
            inverter_extension: None,
            storage: None,
            metering: Metering::Gridmeter(GridMeterSample {
                timestamp,
                active_energy: 0.0,
                active_feed_energy: 0.0,
                reactive_energy: 0.0,
                reactive_feed_energy: 0.0,
                frequency: 50.0,
                active_power: power,
                reactive_power: 0.0,
                apparent_power: power.abs(),
                power_factor: 1.0,
                active_power_l1: 0.0,
                active_power_l2: 0.0,
                active_power_l3: 0.0,
                voltage_l1: 230.0,
                voltage_l2: 230.0,
                voltage_l3: 230.0,
                current_l1: 0.0,
                current_l2: 0.0,
                current_l3: 0.0,
            }),
            ext_meters: Vec::new(),
            heatpump: None,
            calculated: Calculated {
                pv_south_energy_daily: 12.5,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_power_aggregates() {
        let stats = Statistics::new();
        stats.handle_record(&record(1, 10, 0, 1000.0));
        stats.handle_record(&record(1, 10, 30, -200.0));
        stats.handle_record(&record(1, 11, 0, 400.0));

        let today = stats.snapshot().today.unwrap();
        assert_eq!(today.records, 3);
        assert_eq!(today.grid_power.min, Some(-200.0));
        assert_eq!(today.grid_power.max, Some(1000.0));
        assert!((today.grid_power.avg.unwrap() - 400.0).abs() < 1e-9);
        // 1000 W for 30 min in, 200 W for 30 min out
        assert!((today.grid_import_energy - 500.0).abs() < 1e-9);
        assert!((today.grid_export_energy - 100.0).abs() < 1e-9);
        assert_eq!(today.pv_south_energy, 12.5);
        assert_eq!(today.pv_power.samples, 0);
    }

    #[test]
    fn test_day_change_keeps_yesterday() {
        let stats = Statistics::new();
        stats.handle_record(&record(1, 23, 59, 100.0));
        stats.record_failure(Local.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).single().unwrap());
        stats.handle_record(&record(2, 0, 1, 300.0));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_records, 2);
        assert_eq!(snapshot.total_failed_ticks, 1);
        let yesterday = snapshot.yesterday.unwrap();
        assert_eq!(yesterday.day, NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());
        assert_eq!(yesterday.records, 1);
        let today = snapshot.today.unwrap();
        assert_eq!(today.records, 1);
        assert_eq!(today.failed_ticks, 1);
        assert_eq!(today.grid_power.max, Some(300.0));
        // No integration across midnight
        assert_eq!(today.grid_import_energy, 0.0);
    }
}
