//! Append-only status sinks.
//!
//! The reader loop hands every parsed status to an optional sink. Sink failures never
//! stop monitoring: the loop logs them and drops the sink.

use chrono::{SecondsFormat, Utc};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use turntable_core::DeviceStatus;

/// Sink write failure.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Opening or writing the file failed.
    #[error("status sink I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The CSV writer failed.
    #[error("status sink CSV write failed: {0}")]
    Csv(#[from] csv::Error),
}

/// Receives each parsed status on the reader task.
pub trait StatusSink: Send {
    /// Record one status.
    fn record(&mut self, status: &DeviceStatus) -> Result<(), SinkError>;

    /// Flush buffered rows.
    fn flush(&mut self) -> Result<(), SinkError>;
}

/// CSV file with columns `timestamp,mode,alarm,angle`.
///
/// The file is opened for append; the header is written only when the file is empty,
/// so restarting a session continues the same log.
pub struct CsvStatusSink {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl std::fmt::Debug for CsvStatusSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsvStatusSink")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl CsvStatusSink {
    /// Open or create `path` for appending.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let empty = file.metadata()?.len() == 0;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if empty {
            writer.write_record(["timestamp", "mode", "alarm", "angle"])?;
            writer.flush()?;
        }
        tracing::info!(path = %path.display(), "Status CSV sink opened");
        Ok(Self { path, writer })
    }

    /// File being written.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StatusSink for CsvStatusSink {
    fn record(&mut self, status: &DeviceStatus) -> Result<(), SinkError> {
        let timestamp = status
            .observed_wall
            .unwrap_or_else(Utc::now)
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        let mode = status
            .mode
            .map(|mode| mode.code().to_string())
            .unwrap_or_default();
        self.writer.write_record([
            timestamp,
            mode,
            status.alarm.0.to_string(),
            format!("{:.4}", status.angle),
        ])?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use turntable_core::{AlarmCode, DeviceMode, StatusFrame};

    fn status(angle: f64) -> DeviceStatus {
        DeviceStatus::observed(StatusFrame {
            alarm: AlarmCode::NONE,
            mode: DeviceMode::ServoHold,
            sequence: "07".into(),
            angle,
        })
    }

    #[test]
    fn test_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.csv");

        let mut sink = CsvStatusSink::open(&path).unwrap();
        sink.record(&status(12.5)).unwrap();
        sink.flush().unwrap();
        drop(sink);

        let mut sink = CsvStatusSink::open(&path).unwrap();
        sink.record(&status(-3.25)).unwrap();
        sink.flush().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "timestamp,mode,alarm,angle");
        assert!(lines[1].ends_with(",1,0,12.5000"));
        assert!(lines[2].ends_with(",1,0,-3.2500"));
    }

    #[test]
    fn test_timestamp_is_rfc3339() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.csv");
        let mut sink = CsvStatusSink::open(&path).unwrap();
        sink.record(&status(0.0)).unwrap();
        sink.flush().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let row = contents.lines().nth(1).unwrap();
        let timestamp = row.split(',').next().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());
    }

    #[test]
    fn test_open_fails_for_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = CsvStatusSink::open(dir.path().join("missing/status.csv")).unwrap_err();
        assert!(matches!(err, SinkError::Io(_)));
    }

    #[test]
    fn test_debug_shows_path() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvStatusSink::open(dir.path().join("status.csv")).unwrap();
        assert!(format!("{sink:?}").contains("status.csv"));
    }
}
