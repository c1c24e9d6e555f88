//! Error types for the turntable protocol engine.
//!
//! Each stage of the engine has its own error enum so callers can match on the
//! failure that actually concerns them:
//!
//! - **`FrameError`**: a status line failed marker/length/numeric checks. These are
//!   produced while decoding and absorbed by [`FrameDecoder`](crate::frame::FrameDecoder);
//!   line noise and baud mismatch are expected, so they never reach callers.
//! - **`CommandError`**: a [`MotionCommand`](crate::command::MotionCommand) parameter cannot
//!   be represented on the wire under the active
//!   [`ParameterPolicy`](crate::command::ParameterPolicy).
//! - **`DispatchError`**: the servo-hold precondition was never reached, or the write
//!   itself failed.
//! - **`HomingError`**: homing did not converge, was cancelled, or could not start.
//! - **`ConnectError`**: the port could not be opened or never produced a status frame.

use crate::status::DeviceMode;
use std::time::Duration;
use thiserror::Error;

/// Reasons a received line is not a valid status frame.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    /// Line does not start with the `$1` marker.
    #[error("missing frame marker")]
    MissingMarker,

    /// Line is shorter than a full status frame.
    #[error("frame too short: {len} bytes")]
    TooShort {
        /// Observed length after trimming.
        len: usize,
    },

    /// Line contains bytes outside the ASCII range.
    #[error("frame contains non-ASCII bytes")]
    NonAscii,

    /// Mode character is not one of `'0'..='9'`.
    #[error("unknown mode code {0:?}")]
    BadMode(char),

    /// Angle field failed to parse as a number.
    #[error("unparseable angle field {0:?}")]
    BadAngle(String),
}

/// A command parameter that cannot be encoded.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    /// Value outside the range the wire format can carry.
    #[error("{field} = {value} is outside [{min}, {max}]")]
    OutOfRange {
        /// Parameter name.
        field: &'static str,
        /// Rejected value.
        value: f64,
        /// Inclusive lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
    },

    /// NaN or infinite input.
    #[error("{field} is not a finite number")]
    NonFinite {
        /// Parameter name.
        field: &'static str,
    },
}

/// Failure to get a motion command onto the wire.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The device never reached servo-hold within the ready timeout. Nothing was sent.
    #[error("turntable not ready after {waited:?} (last mode: {last_mode:?})")]
    NotReady {
        /// Last mode observed before giving up.
        last_mode: Option<DeviceMode>,
        /// Time spent waiting.
        waited: Duration,
    },

    /// The device is released and automatic initialization is disabled.
    #[error("turntable is released and auto-init is disabled")]
    Released,

    /// The command failed validation before anything was written.
    #[error("invalid command: {0}")]
    InvalidCommand(#[from] CommandError),

    /// The transport rejected the write.
    #[error("write to turntable failed: {0}")]
    WriteFailed(#[source] std::io::Error),

    /// The session has been disconnected.
    #[error("turntable is disconnected")]
    Disconnected,
}

impl DispatchError {
    /// Map a transport error, separating a closed link from other write failures.
    pub fn from_io(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotConnected => Self::Disconnected,
            _ => Self::WriteFailed(err),
        }
    }
}

/// Failure of a homing run.
#[derive(Error, Debug)]
pub enum HomingError {
    /// The angle never held inside tolerance for a full stability window.
    #[error("homing timed out after {elapsed:?} (last angle {last_angle:.4}°)")]
    TimedOut {
        /// Time spent homing.
        elapsed: Duration,
        /// Last polled angle.
        last_angle: f64,
    },

    /// The run was cancelled via its cancel flag.
    #[error("homing cancelled")]
    Cancelled,

    /// The Stop/Homing commands could not be written.
    #[error("homing could not start: {0}")]
    Dispatch(#[from] DispatchError),

    /// The monitor task panicked or was aborted.
    #[error("homing task failed: {0}")]
    TaskFailed(String),
}

/// Failure to establish a session.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The serial port could not be opened.
    #[error("failed to open {port}: {source}")]
    Open {
        /// Port path.
        port: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// No valid status frame arrived within the connect window.
    #[error("no status frame received within {timeout:?}")]
    NoStatus {
        /// Connect window.
        timeout: Duration,
    },

    /// The session configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),
}
