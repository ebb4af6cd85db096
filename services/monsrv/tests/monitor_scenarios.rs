//! Monitor integration tests over simulated buses

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use monsrv::config::MonitorConfig;
use monsrv::devices::fronius_symo::{ids, METER_BASE, MPPT_BASE};
use monsrv::devices::FroniusSymo;
use monsrv::fanout::MonitorFeed;
use monsrv::monitor::{Health, Monitor, MonitorSources, MonitorState};
use monsrv::record::Metering;
use monsrv::statistics::Statistics;
use voltage_comlink::{SimulatedBus, TransportError};

mod common;
use common::*;

#[tokio::test]
async fn test_history_is_bounded_and_ordered() {
    let plant = plant(monitor_config());
    let start = at(1, 12, 0, 0);

    for i in 0..70 {
        plant
            .monitor
            .tick_once(start + TimeDelta::seconds(i))
            .await
            .unwrap();
    }

    let history = plant.monitor.history();
    assert_eq!(history.len(), 60);
    assert_eq!(history[0].timestamp, start + TimeDelta::seconds(10));
    assert!(history
        .windows(2)
        .all(|pair| pair[0].timestamp < pair[1].timestamp));
    assert_eq!(
        plant.monitor.latest().unwrap().timestamp,
        start + TimeDelta::seconds(69)
    );
    assert_eq!(plant.monitor.statistics().snapshot().total_records, 70);
}

#[tokio::test]
async fn test_site_daily_energy_from_offset() {
    let plant = plant(monitor_config());
    let start = at(1, 12, 0, 0);

    let mut daily = Vec::new();
    for (i, wh) in [100_000, 100_500, 101_000].into_iter().enumerate() {
        set_site_energy_day(&plant.symo_bus, wh);
        let record = plant
            .monitor
            .tick_once(start + TimeDelta::seconds(i as i64))
            .await
            .unwrap();
        assert_eq!(record.calculated.fronius_site_daily_offset, 100_000.0);
        daily.push(record.calculated.fronius_site_daily_energy.unwrap());
    }
    assert_eq!(daily, vec![0.0, 500.0, 1000.0]);
}

#[tokio::test]
async fn test_saia_daily_energy_from_first_meter() {
    let plant = plant(monitor_config());
    let start = at(1, 12, 0, 0);

    set_saia_de1(&plant.serial_bus, 2_000);
    let first = plant.monitor.tick_once(start).await.unwrap();
    assert_eq!(first.ext_meters.len(), 1);
    assert_eq!(first.ext_meters[0].name, "pvWest");
    assert_eq!(first.calculated.saia_daily_energy, Some(0.0));

    set_saia_de1(&plant.serial_bus, 2_350);
    let second = plant
        .monitor
        .tick_once(start + TimeDelta::seconds(1))
        .await
        .unwrap();
    assert_eq!(second.calculated.saia_offset, 2_000.0);
    assert_eq!(second.calculated.saia_daily_energy, Some(350.0));
}

#[tokio::test]
async fn test_day_rollover_restarts_daily_values() {
    let plant = plant(monitor_config());

    set_site_energy_day(&plant.symo_bus, 100_000);
    plant.monitor.tick_once(at(1, 23, 59, 58)).await.unwrap();
    set_site_energy_day(&plant.symo_bus, 104_000);
    let before = plant.monitor.tick_once(at(1, 23, 59, 59)).await.unwrap();
    assert_eq!(before.calculated.fronius_site_daily_energy, Some(4_000.0));

    // The inverter has not reset its counter yet
    set_site_energy_day(&plant.symo_bus, 104_010);
    let after = plant.monitor.tick_once(at(2, 0, 0, 1)).await.unwrap();
    assert_eq!(after.calculated.fronius_site_daily_offset, 104_010.0);
    assert_eq!(after.calculated.fronius_site_daily_energy, Some(0.0));
    assert_eq!(after.calculated.pv_south_energy_daily, 0.0);

    let snapshot = plant.monitor.statistics().snapshot();
    assert_eq!(snapshot.today.unwrap().records, 1);
    assert_eq!(snapshot.yesterday.unwrap().records, 2);
}

#[tokio::test]
async fn test_counter_decrease_resets_offset() {
    let plant = plant(monitor_config());
    let start = at(1, 12, 0, 0);

    set_site_energy_day(&plant.symo_bus, 100_000);
    plant.monitor.tick_once(start).await.unwrap();

    set_site_energy_day(&plant.symo_bus, 20);
    let record = plant
        .monitor
        .tick_once(start + TimeDelta::seconds(1))
        .await
        .unwrap();
    assert_eq!(record.calculated.fronius_site_daily_offset, 0.0);
    assert_eq!(record.calculated.fronius_site_daily_energy, Some(20.0));
}

#[tokio::test]
async fn test_pv_south_energy_integration() {
    let plant = plant(monitor_config());
    let start = at(1, 12, 0, 0);
    set_string1_power(&plant.symo_bus, 120);

    // First extension read only sets the reference time
    let record = plant.monitor.tick_once(start).await.unwrap();
    assert_eq!(record.calculated.pv_south_energy_daily, 0.0);

    // 120 W for one minute is 2 Wh
    let record = plant
        .monitor
        .tick_once(start + TimeDelta::minutes(1))
        .await
        .unwrap();
    assert_eq!(record.calculated.pv_south_energy_daily, 2.0);

    let record = plant
        .monitor
        .tick_once(start + TimeDelta::minutes(2))
        .await
        .unwrap();
    assert_eq!(record.calculated.pv_south_energy_daily, 4.0);
}

#[tokio::test]
async fn test_failed_block_keeps_previous_snapshot() {
    let plant = plant(monitor_config());
    let start = at(1, 12, 0, 0);

    let first = plant.monitor.tick_once(start).await.unwrap();
    let first_extension = first.inverter_extension.clone().unwrap();

    plant.symo_bus.set_register(INVERTER_UNIT, 40084, 2500);
    plant.symo_bus.fail_next(
        INVERTER_UNIT,
        MPPT_BASE + 3..=MPPT_BASE + 48,
        1,
        TransportError::timeout("scripted"),
    );
    let second = plant
        .monitor
        .tick_once(start + TimeDelta::seconds(1))
        .await
        .unwrap();

    let second_extension = second.inverter_extension.clone().unwrap();
    assert!(Arc::ptr_eq(&first_extension, &second_extension));
    assert_eq!(
        second.inverter.as_ref().unwrap().f64(ids::AC_POWER),
        Some(2500.0)
    );
    assert_eq!(second.pv_power(), Some(2500.0));
    assert!(matches!(second.metering, Metering::Meter(_)));
}

#[tokio::test]
async fn test_fronius_blocks_follow_their_own_period() {
    let plant = plant(MonitorConfig {
        fronius_period_millis: 5000,
        ..monitor_config()
    });
    let start = at(1, 12, 0, 0);

    let first = plant.monitor.tick_once(start).await.unwrap();
    plant.symo_bus.clear_requests();

    let second = plant
        .monitor
        .tick_once(start + TimeDelta::seconds(1))
        .await
        .unwrap();
    // Only the smart meter was read on the short tick
    assert!(plant
        .symo_bus
        .requests()
        .iter()
        .all(|request| request.unit == METER_UNIT));
    assert!(Arc::ptr_eq(
        first.inverter.as_ref().unwrap(),
        second.inverter.as_ref().unwrap()
    ));

    plant.symo_bus.clear_requests();
    plant
        .monitor
        .tick_once(start + TimeDelta::seconds(5))
        .await
        .unwrap();
    assert!(plant
        .symo_bus
        .requests()
        .iter()
        .any(|request| request.unit == INVERTER_UNIT));
}

#[tokio::test]
async fn test_metering_power_reaches_statistics() {
    let plant = plant(monitor_config());
    let start = at(1, 12, 0, 0);

    set_meter_power(&plant.symo_bus, -1500);
    let record = plant.monitor.tick_once(start).await.unwrap();
    assert_eq!(record.grid_power(), Some(-1500.0));

    set_meter_power(&plant.symo_bus, 500);
    plant
        .monitor
        .tick_once(start + TimeDelta::seconds(1))
        .await
        .unwrap();

    let today = plant.monitor.statistics().snapshot().today.unwrap();
    assert_eq!(today.records, 2);
    assert_eq!(today.grid_power.min, Some(-1500.0));
    assert_eq!(today.grid_power.max, Some(500.0));
}

#[tokio::test]
async fn test_health_degrades_and_recovers() {
    // No device answers on an empty bus
    let bus = Arc::new(SimulatedBus::new("froniusSymo"));
    let symo = Arc::new(FroniusSymo::new(
        bus.clone(),
        INVERTER_UNIT,
        METER_UNIT,
    ));
    let monitor = Monitor::new(
        monitor_config(),
        MonitorSources {
            symo: Some(symo),
            ..Default::default()
        },
        Arc::new(Statistics::new()),
    );
    let mut health = monitor.watch_health();
    let start = at(1, 12, 0, 0);

    for i in 0..2 {
        assert!(monitor
            .tick_once(start + TimeDelta::seconds(i))
            .await
            .is_err());
    }
    assert_eq!(monitor.health(), Health::Healthy);
    assert!(monitor
        .tick_once(start + TimeDelta::seconds(2))
        .await
        .is_err());
    assert!(health.has_changed().unwrap());
    assert_eq!(
        *health.borrow_and_update(),
        Health::Degraded {
            consecutive_failures: 3
        }
    );
    assert_eq!(monitor.statistics().snapshot().total_failed_ticks, 3);
    assert!(monitor.history().is_empty());

    bus.fill(INVERTER_UNIT, 500, 14);
    bus.fill(INVERTER_UNIT, 40000, 400);
    bus.fill(METER_UNIT, METER_BASE, 60);
    monitor
        .tick_once(start + TimeDelta::seconds(3))
        .await
        .unwrap();
    assert_eq!(*health.borrow_and_update(), Health::Healthy);
}

#[tokio::test(start_paused = true)]
async fn test_subscribers_drive_polling() {
    let plant = plant(monitor_config());
    let feed = Arc::new(MonitorFeed::new(
        plant.monitor.clone(),
        plant.monitor.record_sender(),
    ));
    assert_eq!(plant.monitor.state(), MonitorState::Stopped);

    let mut first = feed.subscribe();
    let mut second = feed.subscribe();
    assert_eq!(feed.subscriber_count(), 2);
    assert!(plant.monitor.is_running());

    let record = tokio::time::timeout(Duration::from_secs(5), first.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(record.inverter.is_some());
    let same = second.recv().await.unwrap();
    assert!(Arc::ptr_eq(&record, &same));
    assert_eq!(plant.monitor.state(), MonitorState::Running);
    assert!(!plant.monitor.history().is_empty());

    drop(first);
    assert!(plant.monitor.is_running());

    drop(second);
    assert_eq!(feed.subscriber_count(), 0);
    assert_eq!(plant.monitor.state(), MonitorState::Stopped);
    assert!(!plant.monitor.is_running());
    assert!(plant.monitor.history().is_empty());

    let requests = plant.symo_bus.request_count();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(plant.symo_bus.request_count(), requests);

    // A new subscriber restarts polling
    let mut third = feed.subscribe();
    assert!(third.recv().await.is_some());
    assert!(plant.monitor.is_running());
}
