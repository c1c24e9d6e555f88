//! Serial port abstractions for driver crates.
//!
//! Requires the `serial` feature:
//!
//! ```toml
//! [dependencies]
//! turntable-core = { path = "../turntable-core", features = ["serial"] }
//! ```
//!
//! - [`SerialPortIO`]: anything that can stand in for a serial port
//! - [`DynSerial`]: type-erased boxed port
//! - [`open_serial_async`]: open a port with 8N1 settings off the async runtime
//! - [`drain_serial_buffer`]: discard stale bytes before a session starts

use crate::error::ConnectError;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

/// Async byte stream usable as a serial port.
///
/// Implemented for `tokio_serial::SerialStream`, `tokio::io::DuplexStream` and the
/// mock ports used in tests.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Open a serial port with 8 data bits, no parity, one stop bit and no flow control.
///
/// Opening runs under `spawn_blocking` since it can stall on some USB adapters.
/// `read_timeout` is the driver-level timeout for a single read.
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    read_timeout: Duration,
) -> Result<tokio_serial::SerialStream, ConnectError> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port = port_path.to_string();
    let opened = spawn_blocking(move || {
        tokio_serial::new(&port, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(read_timeout)
            .open_native_async()
    })
    .await
    .map_err(|err| ConnectError::Open {
        port: port_path.to_string(),
        source: std::io::Error::other(err.to_string()),
    })?;

    opened.map_err(|err| ConnectError::Open {
        port: port_path.to_string(),
        source: err.into(),
    })
}

/// Read and discard whatever is immediately available, for at most `timeout`.
///
/// Returns the number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, timeout: Duration) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + timeout;
    let mut total = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total += n,
            Ok(Err(_)) | Err(_) => break,
        }
    }

    total
}
