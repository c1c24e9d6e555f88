//! In-memory serial port for driving a session without hardware.
//!
//! [`MockSerialPort`] implements `AsyncRead`/`AsyncWrite` and is handed to the session
//! as its port; [`MockDeviceHarness`] is the device end, used by tests and by the
//! simulator to read what the host wrote and stream bytes back.
//!
//! Both directions are unbounded channels of byte chunks. Dropping the harness makes
//! the port read EOF and fail writes, which is how a yanked USB cable looks to the
//! session.
//!
//! ```rust,ignore
//! let (port, mut device) = mock_serial::new();
//! let session = Turntable::with_port(Box::new(port), config);
//!
//! device.send_bytes(b"$10100000.0000\r\n")?;
//! assert_eq!(device.next_line().await.as_deref(), Some("$1st"));
//! ```

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Host side of the mock port.
#[derive(Debug)]
pub struct MockSerialPort {
    writes_tx: UnboundedSender<Vec<u8>>,
    reads_rx: UnboundedReceiver<Vec<u8>>,
    read_buffer: VecDeque<u8>,
}

/// Device side of the mock port.
#[derive(Debug)]
pub struct MockDeviceHarness {
    writes_rx: UnboundedReceiver<Vec<u8>>,
    reads_tx: UnboundedSender<Vec<u8>>,
    write_buffer: Vec<u8>,
}

/// Create a connected port/harness pair.
pub fn new() -> (MockSerialPort, MockDeviceHarness) {
    let (host_tx, device_rx) = mpsc::unbounded_channel();
    let (device_tx, host_rx) = mpsc::unbounded_channel();

    let port = MockSerialPort {
        writes_tx: host_tx,
        reads_rx: host_rx,
        read_buffer: VecDeque::new(),
    };
    let harness = MockDeviceHarness {
        writes_rx: device_rx,
        reads_tx: device_tx,
        write_buffer: Vec::new(),
    };
    (port, harness)
}

impl MockSerialPort {
    fn fill(&mut self, buf: &mut ReadBuf<'_>) {
        let to_read = buf.remaining().min(self.read_buffer.len());
        let chunk: Vec<u8> = self.read_buffer.drain(..to_read).collect();
        buf.put_slice(&chunk);
    }
}

impl AsyncRead for MockSerialPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.read_buffer.is_empty() {
            self.fill(buf);
            return Poll::Ready(Ok(()));
        }

        match self.reads_rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                self.read_buffer.extend(chunk);
                self.fill(buf);
                Poll::Ready(Ok(()))
            }
            // Harness dropped: end of file
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for MockSerialPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.writes_tx.send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock device disconnected",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl MockDeviceHarness {
    /// Stream bytes to the host.
    ///
    /// # Errors
    /// Fails if the host port has been dropped.
    pub fn send_bytes(&self, data: &[u8]) -> Result<(), &'static str> {
        self.reads_tx
            .send(data.to_vec())
            .map_err(|_| "host port disconnected")
    }

    /// Next chunk written by the host, or `None` once the port is dropped.
    pub async fn recv_chunk(&mut self) -> Option<Vec<u8>> {
        self.writes_rx.recv().await
    }

    /// Next `\r\n`-terminated line written by the host, without the terminator.
    ///
    /// Returns `None` once the port is dropped and no complete line is buffered.
    pub async fn next_line(&mut self) -> Option<String> {
        loop {
            if let Some(line) = self.take_line() {
                return Some(line);
            }
            let chunk = self.writes_rx.recv().await?;
            self.write_buffer.extend_from_slice(&chunk);
        }
    }

    /// Complete lines already buffered, without waiting.
    pub fn take_line(&mut self) -> Option<String> {
        let end = self.write_buffer.windows(2).position(|w| w == b"\r\n")?;
        let line: Vec<u8> = self.write_buffer.drain(..end + 2).take(end).collect();
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Buffer a chunk received outside [`next_line`](Self::next_line).
    pub fn absorb(&mut self, chunk: &[u8]) {
        self.write_buffer.extend_from_slice(chunk);
    }

    /// Wait for the host to write `expected`, panicking on mismatch or after 2 s.
    pub async fn expect_write(&mut self, expected: &[u8]) {
        use tokio::time::{timeout, Duration};

        while self.write_buffer.len() < expected.len() {
            match timeout(Duration::from_secs(2), self.writes_rx.recv()).await {
                Ok(Some(chunk)) => self.write_buffer.extend_from_slice(&chunk),
                Ok(None) => panic!("host port closed while expecting a write"),
                Err(_) => panic!(
                    "timeout waiting for `{}`, received `{}`",
                    String::from_utf8_lossy(expected),
                    String::from_utf8_lossy(&self.write_buffer)
                ),
            }
        }

        let actual = &self.write_buffer[..expected.len()];
        assert_eq!(
            actual,
            expected,
            "expected `{}`, got `{}`",
            String::from_utf8_lossy(expected),
            String::from_utf8_lossy(actual)
        );
        self.write_buffer.drain(..expected.len());
    }
}
