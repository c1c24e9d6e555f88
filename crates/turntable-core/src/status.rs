//! Device status model.
//!
//! The turntable publishes a fixed-width status line:
//!
//! ```text
//! $1<alarm:1><mode:1><seq:2><angle:8>\r\n
//! ```
//!
//! Angles are sent as `DDD.DDDD`. The device has no sign character, so negative angles
//! are encoded as `720 - |angle|`: any decoded value above 360 is shifted down by 720.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Operating mode reported in every status frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceMode {
    /// `0` - motor de-energized.
    Released,
    /// `1` - energized and idle; the only mode that accepts new motion.
    ServoHold,
    /// `2` - returning to zero.
    Homing,
    /// `3` - absolute position move in progress.
    PositionRun,
    /// `4` - accelerating in speed mode.
    SpeedRun,
    /// `5` - constant speed reached.
    SpeedStable,
    /// `6` - swing motion starting.
    SwingRun,
    /// `7` - swing motion stable.
    SwingStable,
    /// `8` - decelerating after a stop.
    Stopping,
    /// `9` - multi-turn move in progress.
    MultiTurnRun,
}

impl DeviceMode {
    /// Decode a mode character.
    pub fn from_code(code: char) -> Option<Self> {
        Some(match code {
            '0' => Self::Released,
            '1' => Self::ServoHold,
            '2' => Self::Homing,
            '3' => Self::PositionRun,
            '4' => Self::SpeedRun,
            '5' => Self::SpeedStable,
            '6' => Self::SwingRun,
            '7' => Self::SwingStable,
            '8' => Self::Stopping,
            '9' => Self::MultiTurnRun,
            _ => return None,
        })
    }

    /// Wire character for this mode.
    pub fn code(self) -> char {
        match self {
            Self::Released => '0',
            Self::ServoHold => '1',
            Self::Homing => '2',
            Self::PositionRun => '3',
            Self::SpeedRun => '4',
            Self::SpeedStable => '5',
            Self::SwingRun => '6',
            Self::SwingStable => '7',
            Self::Stopping => '8',
            Self::MultiTurnRun => '9',
        }
    }

    /// True for modes in which the motor is executing a motion profile.
    pub fn is_moving(self) -> bool {
        matches!(
            self,
            Self::Homing
                | Self::PositionRun
                | Self::SpeedRun
                | Self::SpeedStable
                | Self::SwingRun
                | Self::SwingStable
                | Self::MultiTurnRun
        )
    }

    /// True once motion has finished, whether or not the motor is still energized.
    pub fn is_idle(self) -> bool {
        matches!(self, Self::Released | Self::ServoHold)
    }

    /// Human-readable label.
    pub fn label(self) -> &'static str {
        match self {
            Self::Released => "released",
            Self::ServoHold => "servo-hold",
            Self::Homing => "homing",
            Self::PositionRun => "position-run",
            Self::SpeedRun => "speed-run",
            Self::SpeedStable => "speed-stable",
            Self::SwingRun => "swing-run",
            Self::SwingStable => "swing-stable",
            Self::Stopping => "stopping",
            Self::MultiTurnRun => "multi-turn-run",
        }
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code(), self.label())
    }
}

/// Single-character fault indicator. `'0'` means no fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlarmCode(pub char);

impl AlarmCode {
    /// No active fault.
    pub const NONE: Self = Self('0');

    /// True when the device reports a fault.
    pub fn is_fault(self) -> bool {
        self != Self::NONE
    }
}

impl Default for AlarmCode {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Display for AlarmCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fold a raw decoded angle into the device's signed range.
pub fn normalize_status_angle(raw: f64) -> f64 {
    if raw > 360.0 {
        raw - 720.0
    } else {
        raw
    }
}

/// Encode a signed angle the way the device reports it (inverse of
/// [`normalize_status_angle`]).
pub fn encode_status_angle(angle: f64) -> String {
    let raw = if angle < 0.0 { angle + 720.0 } else { angle };
    format!("{:08.4}", raw)
}

/// One decoded status frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusFrame {
    /// Fault indicator.
    pub alarm: AlarmCode,
    /// Operating mode.
    pub mode: DeviceMode,
    /// Two-digit rolling counter, kept verbatim.
    pub sequence: String,
    /// Signed angle in degrees, in (-360, 360].
    pub angle: f64,
}

/// Last-known device status plus when it was observed.
///
/// `mode` is `None` until the first valid frame arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Fault indicator.
    pub alarm: AlarmCode,
    /// Operating mode, `None` if never observed.
    pub mode: Option<DeviceMode>,
    /// Two-digit rolling counter from the last frame.
    pub sequence: String,
    /// Signed angle in degrees.
    pub angle: f64,
    /// Wall-clock time of the last frame, for logs and sinks.
    pub observed_wall: Option<DateTime<Utc>>,
    /// Monotonic time of the last frame, for freshness checks.
    #[serde(skip)]
    pub observed_at: Option<Instant>,
}

impl Default for DeviceStatus {
    fn default() -> Self {
        Self {
            alarm: AlarmCode::NONE,
            mode: None,
            sequence: String::new(),
            angle: 0.0,
            observed_wall: None,
            observed_at: None,
        }
    }
}

impl DeviceStatus {
    /// Status built from a freshly decoded frame, stamped now.
    pub fn observed(frame: StatusFrame) -> Self {
        Self {
            alarm: frame.alarm,
            mode: Some(frame.mode),
            sequence: frame.sequence,
            angle: frame.angle,
            observed_wall: Some(Utc::now()),
            observed_at: Some(Instant::now()),
        }
    }

    /// True once at least one frame has been decoded.
    pub fn has_frame(&self) -> bool {
        self.mode.is_some()
    }

    /// True if no frame has been seen within `max_age` (or ever).
    pub fn is_stale(&self, max_age: Duration) -> bool {
        match self.observed_at {
            Some(at) => at.elapsed() > max_age,
            None => true,
        }
    }

    /// True if this status was observed strictly after `instant`.
    pub fn observed_after(&self, instant: Instant) -> bool {
        self.observed_at.is_some_and(|at| at > instant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_codes_round_trip() {
        for code in '0'..='9' {
            let mode = DeviceMode::from_code(code).unwrap();
            assert_eq!(mode.code(), code);
        }
        assert_eq!(DeviceMode::from_code('A'), None);
    }

    #[test]
    fn test_mode_classification() {
        assert!(DeviceMode::PositionRun.is_moving());
        assert!(DeviceMode::MultiTurnRun.is_moving());
        assert!(!DeviceMode::Stopping.is_moving());
        assert!(!DeviceMode::ServoHold.is_moving());
        assert!(DeviceMode::Released.is_idle());
        assert!(!DeviceMode::Stopping.is_idle());
    }

    #[test]
    fn test_angle_normalization() {
        assert_eq!(normalize_status_angle(80.0), 80.0);
        assert_eq!(normalize_status_angle(360.0), 360.0);
        assert!((normalize_status_angle(719.5) - (-0.5)).abs() < 1e-9);
        assert!((normalize_status_angle(370.0) - (-350.0)).abs() < 1e-9);
    }

    #[test]
    fn test_angle_encoding_inverts_normalization() {
        for angle in [-359.9999, -12.3456, -0.0001, 0.0, 45.5, 359.9999] {
            let encoded = encode_status_angle(angle);
            assert_eq!(encoded.len(), 8, "{encoded}");
            let decoded = normalize_status_angle(encoded.parse().unwrap());
            assert!((decoded - angle).abs() <= 1e-4, "{angle} -> {encoded}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_staleness() {
        let status = DeviceStatus::default();
        assert!(status.is_stale(Duration::from_secs(60)));

        let status = DeviceStatus::observed(StatusFrame {
            alarm: AlarmCode::NONE,
            mode: DeviceMode::ServoHold,
            sequence: "01".into(),
            angle: 0.0,
        });
        assert!(!status.is_stale(Duration::from_millis(100)));
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(status.is_stale(Duration::from_millis(100)));
    }
}
