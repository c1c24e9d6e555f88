//! Write side of the serial link.
//!
//! The reader loop owns the read half; every writer goes through the single lock
//! here so that frames from concurrent callers never interleave on the wire.

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::Mutex;
use turntable_core::frame::FRAME_MARKER;
use turntable_core::serial::DynSerial;
use turntable_core::CommandSink;

/// Serialized writer for `$1<payload>\r\n` frames.
pub struct Transport {
    writer: Mutex<Option<WriteHalf<DynSerial>>>,
}

impl Transport {
    /// Wrap the write half of a split port.
    pub fn new(writer: WriteHalf<DynSerial>) -> Self {
        Self {
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Frame and write one payload, then flush.
    ///
    /// Fails with [`io::ErrorKind::NotConnected`] once [`close`](Self::close) ran.
    pub async fn write_payload(&self, payload: &str) -> io::Result<()> {
        let frame = format!("{FRAME_MARKER}{payload}\r\n");
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport closed"))?;

        if let Err(err) = write_frame(writer, frame.as_bytes()).await {
            tracing::error!(error = %err, payload, "Serial write failed");
            return Err(err);
        }
        tracing::debug!(payload, "Sent frame");
        Ok(())
    }

    /// Shut down and drop the write half. Idempotent.
    pub async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(err) = writer.shutdown().await {
                tracing::debug!(error = %err, "Error shutting down serial writer");
            }
        }
    }

    /// True until [`close`](Self::close) runs.
    pub async fn is_open(&self) -> bool {
        self.writer.lock().await.is_some()
    }
}

async fn write_frame(writer: &mut WriteHalf<DynSerial>, frame: &[u8]) -> io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

#[async_trait]
impl CommandSink for Transport {
    async fn write_payload(&self, payload: &str) -> io::Result<()> {
        Transport::write_payload(self, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_serial;

    fn transport() -> (Transport, mock_serial::MockDeviceHarness) {
        let (port, device) = mock_serial::new();
        let port: DynSerial = Box::new(port);
        let (_reader, writer) = tokio::io::split(port);
        (Transport::new(writer), device)
    }

    #[tokio::test]
    async fn test_frames_payload() {
        let (transport, mut device) = transport();
        transport.write_payload("mo=1").await.unwrap();
        device.expect_write(b"$1mo=1\r\n").await;
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_writes() {
        let (transport, _device) = transport();
        transport.close().await;
        transport.close().await;

        let err = transport.write_payload("st").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(!transport.is_open().await);
    }

    #[tokio::test]
    async fn test_concurrent_writes_stay_whole() {
        let (transport, mut device) = transport();
        let transport = std::sync::Arc::new(transport);

        let mut tasks = Vec::new();
        for i in 0..8 {
            let transport = transport.clone();
            tasks.push(tokio::spawn(async move {
                transport.write_payload(&format!("rs={}", i % 8)).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        for _ in 0..8 {
            let line = device.next_line().await.unwrap();
            assert!(line.starts_with("$1rs="), "interleaved line: {line}");
            assert_eq!(line.len(), 6);
        }
    }
}
