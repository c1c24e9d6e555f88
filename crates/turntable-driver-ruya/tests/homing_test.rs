//! Homing against the simulated turntable.

mod common;

use std::time::Duration;
use tokio::sync::oneshot;
use turntable_core::homing::HomingEvent;
use turntable_core::{HomingError, HomingPhase};
use turntable_driver_ruya::sim::SimConfig;

fn from_angle(angle: f64) -> SimConfig {
    SimConfig {
        initial_angle: angle,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_homing_returns_to_zero() {
    let (table, device) = common::connect(from_angle(20.0), common::config()).await;

    let handle = table.start_homing().unwrap();
    let report = handle.wait().await.unwrap();

    assert!(report.final_angle.abs() < 0.01, "{}", report.final_angle);
    assert!(report.elapsed >= Duration::from_secs(1));
    assert_eq!(table.homing_phase(), HomingPhase::Completed);
    assert_eq!(device.payloads(), vec!["st", "1"]);
}

#[tokio::test(start_paused = true)]
async fn test_homing_publishes_progress() {
    let (table, _device) = common::connect(from_angle(300.0), common::config()).await;

    let mut handle = table.start_homing().unwrap();
    let mut progress = 0;
    loop {
        match handle.events().recv().await.unwrap() {
            HomingEvent::Started => {}
            HomingEvent::Progress(_) => progress += 1,
            HomingEvent::Finished(phase) => {
                assert_eq!(phase, HomingPhase::Completed);
                break;
            }
        }
    }
    assert!(progress >= 10);
    handle.wait().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_homing_callbacks() {
    let (table, _device) = common::connect(from_angle(45.0), common::config()).await;
    let (done_tx, done_rx) = oneshot::channel();
    let (ticks_tx, ticks_rx) = oneshot::channel();

    let mut ticks = 0usize;
    let mut ticks_tx = Some(ticks_tx);
    let started = table.start_homing_with(
        move |_progress| {
            ticks += 1;
            if ticks == 5 {
                if let Some(tx) = ticks_tx.take() {
                    let _ = tx.send(ticks);
                }
            }
        },
        move |result| {
            let _ = done_tx.send(result);
        },
    );
    assert!(started);

    assert_eq!(ticks_rx.await.unwrap(), 5);
    let report = done_rx.await.unwrap().unwrap();
    assert!(report.final_angle.abs() < 0.01);
}

#[tokio::test(start_paused = true)]
async fn test_only_one_homing_run_at_a_time() {
    let (table, _device) = common::connect(from_angle(90.0), common::config()).await;

    let handle = table.start_homing().unwrap();
    assert!(table.start_homing().is_none());
    assert!(!table.start_homing_with(|_| {}, |_| {}));

    handle.wait().await.unwrap();
    assert!(table.start_homing().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_homing_stops_device() {
    let (table, device) = common::connect(from_angle(180.0), common::config()).await;

    let handle = table.start_homing().unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(table.cancel_homing());

    assert!(matches!(handle.wait().await, Err(HomingError::Cancelled)));
    assert_eq!(table.homing_phase(), HomingPhase::Cancelled);
    assert!(common::eventually(Duration::from_secs(1), || {
        device.payloads().last().map(String::as_str) == Some("st")
    })
    .await);
}

#[tokio::test(start_paused = true)]
async fn test_homing_times_out_on_slow_device() {
    let sim = SimConfig {
        homing_rate: 1.0,
        ..from_angle(90.0)
    };
    let mut config = common::config();
    config.homing.timeout = Duration::from_secs(3);
    let (table, device) = common::connect(sim, config).await;

    let result = table.start_homing().unwrap().wait().await;

    assert!(matches!(result, Err(HomingError::TimedOut { .. })), "{result:?}");
    assert_eq!(table.homing_phase(), HomingPhase::TimedOut);
    assert!(common::eventually(Duration::from_secs(1), || {
        device.payloads() == vec!["st", "1", "st"]
    })
    .await);
}
