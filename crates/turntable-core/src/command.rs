//! Command encoding.
//!
//! Every command is an ASCII payload; the transport adds the `$1` marker and `\r\n`.
//! Field widths are fixed by the firmware:
//!
//! | Command        | Payload                                                     |
//! |----------------|-------------------------------------------------------------|
//! | Init / Free    | `mo=1` / `mo=0`                                             |
//! | Stop           | `st`                                                        |
//! | Homing         | `1`                                                         |
//! | SetStatusRate  | `rs=<0-7>`                                                  |
//! | SpeedRun       | `3` `0` accel(4) speed(9)                                   |
//! | PositionRun    | `2` dir(1) accel(4) speed(9) angle(8)                       |
//! | MultiTurnRun   | `5` dir(1) accel(4) speed(9) angle(8) loops(2)              |
//! | Swing          | `4` amplitude(8) frequency(6)                               |
//!
//! `accel` is a zero-padded integer, `speed` is `DDDD.DDDD`, angles are `DDD.DDDD`
//! and frequency is `DD.DDD`.

use crate::error::CommandError;
use serde::{Deserialize, Serialize};

/// Acceleration limits.
pub const ACCEL_RANGE: (u32, u32) = (1, 1000);
/// Speed limits in degrees per second.
pub const SPEED_RANGE: (f64, f64) = (0.0001, 1000.0);
/// Highest loop count a multi-turn command can carry.
pub const MAX_LOOPS: u32 = 99;
/// Highest status-rate index.
pub const MAX_STATUS_RATE_INDEX: u8 = 7;
/// Swing amplitude limits in degrees.
pub const AMPLITUDE_RANGE: (f64, f64) = (0.0, 360.0);
/// Swing frequency limits in Hz.
pub const FREQUENCY_RANGE: (f64, f64) = (0.0, 99.999);

/// Rotation direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// `0` - clockwise, positive deltas.
    Forward,
    /// `1` - counter-clockwise, negative deltas.
    Reverse,
}

impl Direction {
    /// Wire digit.
    pub fn code(self) -> char {
        match self {
            Self::Forward => '0',
            Self::Reverse => '1',
        }
    }
}

/// What to do with out-of-range accel/speed/loop/index values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterPolicy {
    /// Fail with [`CommandError::OutOfRange`].
    #[default]
    Reject,
    /// Clamp into range the way the firmware documentation describes.
    Clamp,
}

/// A command the turntable understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MotionCommand {
    /// Energize the motor (enter servo-hold).
    Init,
    /// De-energize the motor.
    Free,
    /// Stop any motion.
    Stop,
    /// Rotate continuously.
    SpeedRun {
        /// Acceleration.
        accel: u32,
        /// Speed in °/s.
        speed: f64,
    },
    /// Move to an absolute angle within one revolution.
    PositionRun {
        /// Rotation direction.
        direction: Direction,
        /// Acceleration.
        accel: u32,
        /// Speed in °/s.
        speed: f64,
        /// Absolute target in [0, 360).
        target: f64,
    },
    /// Spin whole revolutions, then stop at an absolute angle.
    MultiTurnRun {
        /// Rotation direction.
        direction: Direction,
        /// Acceleration.
        accel: u32,
        /// Speed in °/s.
        speed: f64,
        /// Absolute target in [0, 360).
        target: f64,
        /// Whole revolutions before the final approach.
        loops: u32,
    },
    /// Oscillate around the current position.
    Swing {
        /// Peak amplitude in degrees.
        amplitude: f64,
        /// Oscillation frequency in Hz.
        frequency: f64,
    },
    /// Return to zero.
    Homing,
    /// Select the status publishing rate.
    SetStatusRate {
        /// Rate table index.
        index: u8,
    },
}

impl MotionCommand {
    /// True for commands that may only be issued from servo-hold.
    pub fn requires_servo_hold(&self) -> bool {
        matches!(
            self,
            Self::SpeedRun { .. }
                | Self::PositionRun { .. }
                | Self::MultiTurnRun { .. }
                | Self::Swing { .. }
        )
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Free => "free",
            Self::Stop => "stop",
            Self::SpeedRun { .. } => "speed_run",
            Self::PositionRun { .. } => "position_run",
            Self::MultiTurnRun { .. } => "multi_turn_run",
            Self::Swing { .. } => "swing",
            Self::Homing => "homing",
            Self::SetStatusRate { .. } => "set_status_rate",
        }
    }

    /// Encode to the wire payload, applying `policy` to out-of-range parameters.
    pub fn encode(&self, policy: ParameterPolicy) -> Result<String, CommandError> {
        let payload = match self {
            Self::Init => "mo=1".to_string(),
            Self::Free => "mo=0".to_string(),
            Self::Stop => "st".to_string(),
            Self::Homing => "1".to_string(),
            Self::SetStatusRate { index } => {
                let index = bounded_u32(
                    "status_rate_index",
                    u32::from(*index),
                    (0, u32::from(MAX_STATUS_RATE_INDEX)),
                    policy,
                )?;
                format!("rs={}", index)
            }
            Self::SpeedRun { accel, speed } => {
                let accel = bounded_u32("accel", *accel, ACCEL_RANGE, policy)?;
                let speed = bounded_f64("speed", *speed, SPEED_RANGE, policy)?;
                format!("3{}{:04}{:09.4}", Direction::Forward.code(), accel, speed)
            }
            Self::PositionRun {
                direction,
                accel,
                speed,
                target,
            } => {
                let accel = bounded_u32("accel", *accel, ACCEL_RANGE, policy)?;
                let speed = bounded_f64("speed", *speed, SPEED_RANGE, policy)?;
                let target = target_angle(*target)?;
                format!(
                    "2{}{:04}{:09.4}{}",
                    direction.code(),
                    accel,
                    speed,
                    target
                )
            }
            Self::MultiTurnRun {
                direction,
                accel,
                speed,
                target,
                loops,
            } => {
                let accel = bounded_u32("accel", *accel, ACCEL_RANGE, policy)?;
                let speed = bounded_f64("speed", *speed, SPEED_RANGE, policy)?;
                let target = target_angle(*target)?;
                let loops = bounded_u32("loops", *loops, (0, MAX_LOOPS), policy)?;
                format!(
                    "5{}{:04}{:09.4}{}{:02}",
                    direction.code(),
                    accel,
                    speed,
                    target,
                    loops
                )
            }
            Self::Swing {
                amplitude,
                frequency,
            } => {
                let amplitude = bounded_f64("amplitude", *amplitude, AMPLITUDE_RANGE, policy)?;
                let frequency = bounded_f64("frequency", *frequency, FREQUENCY_RANGE, policy)?;
                format!("4{:08.4}{:06.3}", amplitude, frequency)
            }
        };
        Ok(payload)
    }
}

fn bounded_u32(
    field: &'static str,
    value: u32,
    (min, max): (u32, u32),
    policy: ParameterPolicy,
) -> Result<u32, CommandError> {
    if (min..=max).contains(&value) {
        return Ok(value);
    }
    match policy {
        ParameterPolicy::Clamp => Ok(value.clamp(min, max)),
        ParameterPolicy::Reject => Err(CommandError::OutOfRange {
            field,
            value: f64::from(value),
            min: f64::from(min),
            max: f64::from(max),
        }),
    }
}

fn bounded_f64(
    field: &'static str,
    value: f64,
    (min, max): (f64, f64),
    policy: ParameterPolicy,
) -> Result<f64, CommandError> {
    if !value.is_finite() {
        return Err(CommandError::NonFinite { field });
    }
    // `+ 0.0` folds -0.0 into 0.0 so no minus sign reaches the wire.
    if (min..=max).contains(&value) {
        return Ok(value + 0.0);
    }
    match policy {
        ParameterPolicy::Clamp => Ok(value.clamp(min, max) + 0.0),
        ParameterPolicy::Reject => Err(CommandError::OutOfRange {
            field,
            value,
            min,
            max,
        }),
    }
}

/// Validate and format an absolute target angle as `DDD.DDDD`.
///
/// A value that rounds up to 360.0000 is the same position as zero.
fn target_angle(angle: f64) -> Result<String, CommandError> {
    if !angle.is_finite() {
        return Err(CommandError::NonFinite { field: "target" });
    }
    if !(0.0..360.0).contains(&angle) {
        return Err(CommandError::OutOfRange {
            field: "target",
            value: angle,
            min: 0.0,
            max: 360.0,
        });
    }
    let rounded = (angle * 10_000.0).round() / 10_000.0;
    let rounded = if rounded >= 360.0 { 0.0 } else { rounded + 0.0 };
    Ok(format!("{:08.4}", rounded))
}
