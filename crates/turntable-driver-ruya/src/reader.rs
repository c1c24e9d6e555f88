//! Reader loop.
//!
//! Owns the read half of the port: drains it with a short per-read timeout, feeds the
//! frame decoder and publishes each decoded status. Malformed input is absorbed by the
//! decoder. EOF or a hard I/O error ends the loop and clears the running flag; the
//! last status stays readable.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, ReadHalf};
use tokio::task::JoinHandle;
use turntable_core::serial::DynSerial;
use turntable_core::{DeviceState, FrameDecoder};

use crate::sink::StatusSink;

const READ_CHUNK: usize = 512;

/// Why the reader loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderExit {
    /// The running flag was cleared.
    Stopped,
    /// The device end closed the link.
    Eof,
    /// A read failed with a non-transient error.
    Failed(io::ErrorKind),
}

/// Reader task configuration and resources.
pub struct ReaderLoop {
    reader: ReadHalf<DynSerial>,
    state: Arc<DeviceState>,
    running: Arc<AtomicBool>,
    read_timeout: Duration,
    print_status: bool,
    sink: Option<Box<dyn StatusSink>>,
}

impl ReaderLoop {
    /// Reader over `reader` publishing into `state` while `running` is set.
    pub fn new(
        reader: ReadHalf<DynSerial>,
        state: Arc<DeviceState>,
        running: Arc<AtomicBool>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            reader,
            state,
            running,
            read_timeout,
            print_status: false,
            sink: None,
        }
    }

    /// Log every parsed status at `info`.
    pub fn print_status(mut self, enabled: bool) -> Self {
        self.print_status = enabled;
        self
    }

    /// Hand every parsed status to `sink`.
    pub fn with_sink(mut self, sink: Option<Box<dyn StatusSink>>) -> Self {
        self.sink = sink;
        self
    }

    /// Run on a new task.
    pub fn spawn(self) -> JoinHandle<ReaderExit> {
        tokio::spawn(self.run())
    }

    /// Run until stopped or the link fails.
    pub async fn run(mut self) -> ReaderExit {
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; READ_CHUNK];
        tracing::debug!("Reader loop started");

        let exit = loop {
            if !self.running.load(Ordering::SeqCst) {
                break ReaderExit::Stopped;
            }

            let read = tokio::time::timeout(self.read_timeout, self.reader.read(&mut buf)).await;
            match read {
                Err(_) => continue,
                Ok(Ok(0)) => {
                    tracing::error!("Serial link closed by device");
                    break ReaderExit::Eof;
                }
                Ok(Ok(n)) => {
                    if let Some(frame) = decoder.push(&buf[..n]) {
                        let status = self.state.update(frame);
                        self.publish(&status);
                    }
                }
                Ok(Err(err)) if is_transient(&err) => continue,
                Ok(Err(err)) => {
                    tracing::error!(error = %err, "Serial read failed, stopping reader");
                    break ReaderExit::Failed(err.kind());
                }
            }
        };

        self.running.store(false, Ordering::SeqCst);
        if let Some(mut sink) = self.sink.take() {
            if let Err(err) = sink.flush() {
                tracing::warn!(error = %err, "Failed to flush status sink");
            }
        }
        tracing::debug!(?exit, rejected = decoder.rejected(), "Reader loop exited");
        exit
    }

    fn publish(&mut self, status: &turntable_core::DeviceStatus) {
        if self.print_status {
            tracing::info!(
                mode = ?status.mode,
                alarm = %status.alarm,
                angle = status.angle,
                sequence = %status.sequence,
                "Status"
            );
        }
        if let Some(sink) = self.sink.as_mut() {
            if let Err(err) = sink.record(status) {
                tracing::warn!(error = %err, "Status sink failed, disabling it");
                self.sink = None;
            }
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}
