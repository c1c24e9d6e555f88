//! Seams between the motion logic and the device link.
//!
//! The sequencer and homing monitor only need "what is the latest status" and
//! "put this payload on the wire". Hardware sessions implement these over the serial
//! reader loop and transport; tests implement them with scripted fakes.

use crate::state::DeviceState;
use crate::status::DeviceStatus;
use async_trait::async_trait;

/// Source of the latest device status.
pub trait StatusSource: Send + Sync {
    /// Copy of the latest known status.
    fn snapshot(&self) -> DeviceStatus;
}

impl StatusSource for DeviceState {
    fn snapshot(&self) -> DeviceStatus {
        DeviceState::snapshot(self)
    }
}

/// Writer of encoded command payloads.
///
/// Implementations add the wire framing and must write each payload atomically with
/// respect to other callers.
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Write one payload.
    async fn write_payload(&self, payload: &str) -> std::io::Result<()>;
}
