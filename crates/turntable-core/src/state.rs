//! Shared last-known device status.
//!
//! One writer (the reader loop) replaces the record wholesale; any number of readers
//! take clone snapshots. Built on `tokio::sync::watch` so readers never see a
//! half-written record and front ends can await changes instead of polling.

use crate::status::{DeviceStatus, StatusFrame};
use std::time::Duration;
use tokio::sync::watch;

/// Concurrently readable device status.
#[derive(Debug)]
pub struct DeviceState {
    sender: watch::Sender<DeviceStatus>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceState {
    /// State with no frame observed yet.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(DeviceStatus::default());
        Self { sender }
    }

    /// Replace the status with a freshly decoded frame. Returns the stored record.
    pub fn update(&self, frame: StatusFrame) -> DeviceStatus {
        let status = DeviceStatus::observed(frame);
        self.sender.send_replace(status.clone());
        status
    }

    /// Copy of the current status.
    pub fn snapshot(&self) -> DeviceStatus {
        self.sender.borrow().clone()
    }

    /// Receiver that is notified on every update.
    pub fn subscribe(&self) -> watch::Receiver<DeviceStatus> {
        self.sender.subscribe()
    }

    /// Wait until at least one frame has been observed.
    ///
    /// Returns `false` if `timeout` elapses first.
    pub async fn wait_for_first_frame(&self, timeout: Duration) -> bool {
        let mut rx = self.sender.subscribe();
        let wait = rx.wait_for(DeviceStatus::has_frame);
        let seen = matches!(tokio::time::timeout(timeout, wait).await, Ok(Ok(_)));
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{AlarmCode, DeviceMode};
    use std::sync::Arc;

    fn frame(mode: DeviceMode, angle: f64) -> StatusFrame {
        StatusFrame {
            alarm: AlarmCode::NONE,
            mode,
            sequence: "00".into(),
            angle,
        }
    }

    #[test]
    fn test_starts_unobserved() {
        let state = DeviceState::new();
        let status = state.snapshot();
        assert_eq!(status.mode, None);
        assert!(!status.has_frame());
    }

    #[tokio::test]
    async fn test_update_replaces_snapshot() {
        let state = DeviceState::new();
        state.update(frame(DeviceMode::Released, 1.0));
        state.update(frame(DeviceMode::ServoHold, 2.0));

        let status = state.snapshot();
        assert_eq!(status.mode, Some(DeviceMode::ServoHold));
        assert_eq!(status.angle, 2.0);
        assert!(status.observed_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_first_frame() {
        let state = Arc::new(DeviceState::new());
        assert!(!state.wait_for_first_frame(Duration::from_millis(200)).await);

        let writer = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            writer.update(frame(DeviceMode::ServoHold, 0.0));
        });
        assert!(state.wait_for_first_frame(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let state = DeviceState::new();
        let mut rx = state.subscribe();
        state.update(frame(DeviceMode::Homing, 12.0));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().mode, Some(DeviceMode::Homing));
    }
}
