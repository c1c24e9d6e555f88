//! Status frame decoding.
//!
//! The device streams status lines at up to 200 Hz. Reads return arbitrary slices of
//! that stream, so the decoder accumulates bytes and only looks at segments that are
//! terminated by `\n`. When one read completes several frames, only the newest valid
//! one is returned: callers want the current state, not a backlog.
//!
//! Malformed segments (boot noise, baud mismatch, truncated lines) are dropped and
//! counted; they are never reported as errors.

use crate::error::FrameError;
use crate::status::{normalize_status_angle, AlarmCode, DeviceMode, StatusFrame};
use bytes::{Buf, BytesMut};

/// Marker that opens every frame.
pub const FRAME_MARKER: &str = "$1";

/// Marker + alarm(1) + mode(1) + sequence(2) + angle(8).
pub const MIN_FRAME_LEN: usize = 14;

/// Upper bound on bytes kept while waiting for a newline.
pub const MAX_PENDING_BYTES: usize = 4096;

/// Parse one line (terminator optional) into a status frame.
pub fn parse_frame(line: &str) -> Result<StatusFrame, FrameError> {
    if !line.is_ascii() {
        return Err(FrameError::NonAscii);
    }
    let line = line.trim();
    let content = line
        .strip_prefix(FRAME_MARKER)
        .ok_or(FrameError::MissingMarker)?;
    if line.len() < MIN_FRAME_LEN {
        return Err(FrameError::TooShort { len: line.len() });
    }

    let bytes = content.as_bytes();
    let alarm = AlarmCode(bytes[0] as char);
    let mode_code = bytes[1] as char;
    let mode = DeviceMode::from_code(mode_code).ok_or(FrameError::BadMode(mode_code))?;
    let sequence = content[2..4].to_string();

    let angle_field = &content[4..12];
    let raw: f64 = angle_field
        .trim()
        .parse()
        .map_err(|_| FrameError::BadAngle(angle_field.to_string()))?;
    if !raw.is_finite() {
        return Err(FrameError::BadAngle(angle_field.to_string()));
    }

    Ok(StatusFrame {
        alarm,
        mode,
        sequence,
        angle: normalize_status_angle(raw),
    })
}

/// Incremental decoder over an unbounded byte stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: BytesMut,
    rejected: u64,
}

impl FrameDecoder {
    /// Empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed newly read bytes.
    ///
    /// Returns the newest valid frame among the lines completed by this chunk, or
    /// `None` if no complete valid line is available yet. Bytes after the last
    /// newline stay buffered for the next call.
    pub fn push(&mut self, bytes: &[u8]) -> Option<StatusFrame> {
        self.pending.extend_from_slice(bytes);

        let Some(last_newline) = self.pending.iter().rposition(|&b| b == b'\n') else {
            self.enforce_bound();
            return None;
        };

        let complete = self.pending.split_to(last_newline + 1);
        self.enforce_bound();

        for segment in complete[..].split(|&b| b == b'\n').rev() {
            if segment.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let parsed = std::str::from_utf8(segment)
                .map_err(|_| FrameError::NonAscii)
                .and_then(parse_frame);
            match parsed {
                Ok(frame) => return Some(frame),
                Err(err) => {
                    self.rejected += 1;
                    tracing::trace!(
                        error = %err,
                        segment = %String::from_utf8_lossy(segment),
                        "Discarded status segment"
                    );
                }
            }
        }
        None
    }

    /// Drop any partial line, e.g. after reopening the port.
    pub fn reset(&mut self) {
        self.pending.clear();
    }

    /// Bytes waiting for a terminating newline.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Count of segments discarded as malformed.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    fn enforce_bound(&mut self) {
        if self.pending.len() > MAX_PENDING_BYTES {
            let excess = self.pending.len() - MAX_PENDING_BYTES;
            self.pending.advance(excess);
            tracing::debug!(discarded = excess, "Status buffer overflow without newline");
        }
    }
}
