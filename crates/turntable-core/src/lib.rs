//! `turntable-core`
//!
//! Protocol engine for single-axis rotary turntables speaking the `$1` ASCII serial
//! protocol.
//!
//! The device streams status frames continuously and silently drops motion commands
//! it receives outside servo-hold. This crate turns that into a dependable command
//! surface:
//!
//! - [`frame`]: reassembles status frames from arbitrary byte chunks
//! - [`command`]: validates and encodes commands into fixed-width payloads
//! - [`state`]: last-known status, shared between the reader loop and callers
//! - [`sequencer`]: waits for servo-hold before writing motion commands
//! - [`homing`]: homing with settle detection and cancellation
//! - [`move_math`]: relative-to-absolute move decomposition
//!
//! Hardware I/O lives in driver crates; they plug in through the [`link`] traits.
//!
//! ## Example
//!
//! ```rust,no_run
//! use turntable_core::frame::FrameDecoder;
//!
//! let mut decoder = FrameDecoder::new();
//! let frame = decoder.push(b"$101010190.0000\r\n").unwrap();
//! assert_eq!(frame.angle, 190.0);
//! ```

pub mod command;
pub mod error;
pub mod frame;
pub mod homing;
pub mod link;
pub mod move_math;
pub mod sequencer;
#[cfg(feature = "serial")]
pub mod serial;
pub mod state;
pub mod status;

#[cfg(test)]
pub(crate) mod testing;

pub use command::{Direction, MotionCommand, ParameterPolicy};
pub use error::{CommandError, ConnectError, DispatchError, FrameError, HomingError};
pub use frame::FrameDecoder;
pub use homing::{HomingConfig, HomingEvent, HomingHandle, HomingMonitor, HomingPhase};
pub use link::{CommandSink, StatusSource};
pub use move_math::MovePlan;
pub use sequencer::{MotionSequencer, SequencerConfig};
pub use state::DeviceState;
pub use status::{AlarmCode, DeviceMode, DeviceStatus, StatusFrame};
