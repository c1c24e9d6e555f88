//! Disconnect, link loss and status logging.

mod common;

use std::time::Duration;
use turntable_core::{DeviceMode, DispatchError, HomingPhase, MotionCommand};
use turntable_driver_ruya::sim::SimConfig;
use turntable_driver_ruya::ShutdownMode;

#[tokio::test(start_paused = true)]
async fn test_disconnect_is_idempotent() {
    let (table, device) = common::connect_default().await;
    let before = table.snapshot();

    table.disconnect(ShutdownMode::Clean).await.unwrap();
    table.disconnect(ShutdownMode::Clean).await.unwrap();
    table.disconnect(ShutdownMode::Emergency).await.unwrap();

    assert!(!table.is_connected());
    assert_eq!(table.snapshot().mode, before.mode);
    assert!(matches!(
        table.dispatch(&MotionCommand::Stop).await,
        Err(DispatchError::Disconnected)
    ));
    assert!(table.start_homing().is_none());
    assert!(device.payloads().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_emergency_shutdown_releases_motor() {
    let (table, device) = common::connect_default().await;
    table
        .dispatch(&MotionCommand::SpeedRun {
            accel: 10,
            speed: 20.0,
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    table.disconnect(ShutdownMode::Emergency).await.unwrap();

    let payloads = device.payloads();
    assert_eq!(&payloads[payloads.len() - 2..], ["st", "mo=0"]);
    assert_eq!(device.mode(), DeviceMode::Released);
    assert!(!table.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_clean_shutdown_leaves_drive_alone() {
    let (table, device) = common::connect_default().await;
    table.disconnect(ShutdownMode::default()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(device.payloads().is_empty());
    assert_eq!(device.mode(), DeviceMode::ServoHold);
}

#[tokio::test(start_paused = true)]
async fn test_clean_shutdown_during_homing_sends_nothing() {
    // Cover the settle delay, the homing write and the poll ticks around it.
    for wait_ms in [50, 150, 199, 200, 250, 290, 295, 300, 305, 350, 420] {
        let sim = SimConfig {
            initial_angle: 180.0,
            ..Default::default()
        };
        let (table, device) = common::connect(sim, common::config()).await;
        let handle = table.start_homing().unwrap();
        tokio::time::sleep(Duration::from_millis(wait_ms)).await;

        table.disconnect(ShutdownMode::Clean).await.unwrap();
        assert_eq!(table.homing_phase(), HomingPhase::Cancelled, "wait {wait_ms}ms");
        assert!(handle.wait().await.is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let payloads = device.payloads();
        let stops = payloads.iter().filter(|p| *p == "st").count();
        assert_eq!(stops, 1, "wait {wait_ms}ms: {payloads:?}");
        assert_eq!(payloads[0], "st");
        assert_ne!(device.mode(), DeviceMode::Stopping, "wait {wait_ms}ms");
    }
}

#[tokio::test(start_paused = true)]
async fn test_emergency_shutdown_during_homing() {
    let sim = SimConfig {
        initial_angle: 180.0,
        ..Default::default()
    };
    let (table, device) = common::connect(sim, common::config()).await;
    let _handle = table.start_homing().unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(device.mode(), DeviceMode::Homing);

    table.disconnect(ShutdownMode::Emergency).await.unwrap();

    assert_eq!(device.payloads(), vec!["st", "1", "st", "mo=0"]);
    assert_eq!(device.mode(), DeviceMode::Released);
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_keeps_last_status() {
    let sim = SimConfig {
        initial_angle: 123.5,
        ..Default::default()
    };
    let (table, device) = common::connect(sim, common::config()).await;
    device.hang_up();

    assert!(common::eventually(Duration::from_secs(1), || !table.is_connected()).await);
    assert!(device.is_finished());
    let status = table.snapshot();
    assert_eq!(status.mode, Some(DeviceMode::ServoHold));
    assert!((status.angle - 123.5).abs() < 1e-9);
    assert!(matches!(
        table.dispatch(&MotionCommand::Init).await,
        Err(DispatchError::Disconnected)
    ));
    table.disconnect(ShutdownMode::Clean).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_status_rows_logged_to_csv() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("status.csv");
    let mut config = common::config();
    config.csv_path = Some(path.clone());
    config.print_status = true;

    let (table, _device) = common::connect(SimConfig::default(), config).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    table.disconnect(ShutdownMode::Clean).await.unwrap();

    let mut reader = csv::Reader::from_path(&path).unwrap();
    let headers: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
    assert_eq!(headers, ["timestamp", "mode", "alarm", "angle"]);
    let rows: Vec<_> = reader.records().map(Result::unwrap).collect();
    assert!(rows.len() >= 5, "only {} rows", rows.len());
    for row in &rows {
        assert_eq!(&row[1], "1");
        assert_eq!(&row[2], "0");
        assert_eq!(&row[3], "0.0000");
    }
}
