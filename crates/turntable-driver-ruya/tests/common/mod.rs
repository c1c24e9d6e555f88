//! Shared setup for session tests against the simulated turntable.

#![allow(dead_code)]

use std::time::Duration;
use turntable_driver_ruya::sim::{SimConfig, SimulatedTurntable};
use turntable_driver_ruya::{Turntable, TurntableConfig};

pub fn config() -> TurntableConfig {
    TurntableConfig::for_port("sim", 115_200)
}

/// Connect a session to a fresh simulated device.
pub async fn connect(sim: SimConfig, config: TurntableConfig) -> (Turntable, SimulatedTurntable) {
    let (port, device) = SimulatedTurntable::spawn(sim);
    let table = Turntable::with_port(Box::new(port), config)
        .await
        .expect("simulated turntable should connect");
    (table, device)
}

pub async fn connect_default() -> (Turntable, SimulatedTurntable) {
    connect(SimConfig::default(), config()).await
}

/// Poll `condition` every 10 ms for up to `limit`.
pub async fn eventually(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
