//! RUYA rotary turntable driver.
//!
//! A [`Turntable`] session opens the serial port (8N1), runs a reader task that keeps
//! the latest [`DeviceStatus`](turntable_core::DeviceStatus) current, and exposes
//! dispatch, homing, relative moves and shutdown on top of the `turntable-core`
//! protocol engine.
//!
//! ```rust,no_run
//! use turntable_driver_ruya::{ShutdownMode, Turntable};
//! use turntable_core::MotionCommand;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let table = Turntable::connect("/dev/ttyUSB0", 115_200).await?;
//! table.dispatch(&MotionCommand::Init).await?;
//! let report = table.move_relative(90.0, 100, 10.0).await?;
//! println!("now at {:.4}", report.final_angle);
//! table.disconnect(ShutdownMode::Clean).await?;
//! # Ok(())
//! # }
//! ```
//!
//! With the `sim` feature (on by default), `sim::SimulatedTurntable` runs the same
//! protocol in memory for tests and demos.

pub mod config;
#[cfg(any(test, feature = "sim"))]
pub mod mock_serial;
pub mod reader;
pub mod session;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod sink;
pub mod transport;

pub use config::{ConfigError, MotionConfig, TurntableConfig};
pub use session::{MoveError, MoveReport, ShutdownMode, Turntable};
pub use sink::{CsvStatusSink, SinkError, StatusSink};
