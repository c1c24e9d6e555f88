//! Scripted status source and recording sink for engine tests.

use crate::link::{CommandSink, StatusSource};
use crate::status::{AlarmCode, DeviceMode, DeviceStatus};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Something the fakes observed, in order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Entry {
    Observed(DeviceMode),
    Wrote(String),
}

pub(crate) type Journal = Arc<Mutex<Vec<Entry>>>;

type AngleTrace = Box<dyn Fn(Duration) -> f64 + Send + Sync>;

/// Status source that replays a mode script, one entry per snapshot, then repeats the
/// last entry. Angles come from a function of time since construction.
pub(crate) struct ScriptedStatus {
    modes: Mutex<VecDeque<DeviceMode>>,
    last: Mutex<DeviceMode>,
    angle: AngleTrace,
    started: Instant,
    frozen_at: Option<Instant>,
    journal: Journal,
}

impl ScriptedStatus {
    pub(crate) fn modes(codes: &str, journal: Journal) -> Self {
        let modes: VecDeque<DeviceMode> = codes
            .chars()
            .filter_map(DeviceMode::from_code)
            .collect();
        let first = modes.front().copied().unwrap_or(DeviceMode::ServoHold);
        Self {
            modes: Mutex::new(modes),
            last: Mutex::new(first),
            angle: Box::new(|_| 0.0),
            started: Instant::now(),
            frozen_at: None,
            journal,
        }
    }

    pub(crate) fn angles(
        mode: DeviceMode,
        trace: impl Fn(Duration) -> f64 + Send + Sync + 'static,
        journal: Journal,
    ) -> Self {
        let mut source = Self::modes("", journal);
        *source.last.get_mut() = mode;
        source.angle = Box::new(trace);
        source
    }

    /// Every snapshot carries the construction instant, as if the reader had died.
    pub(crate) fn frozen(mode: DeviceMode, angle: f64, journal: Journal) -> Self {
        let mut source = Self::angles(mode, move |_| angle, journal);
        source.frozen_at = Some(source.started);
        source
    }
}

impl StatusSource for ScriptedStatus {
    fn snapshot(&self) -> DeviceStatus {
        let mode = {
            let mut last = self.last.lock();
            if let Some(next) = self.modes.lock().pop_front() {
                *last = next;
            }
            *last
        };
        self.journal.lock().push(Entry::Observed(mode));
        DeviceStatus {
            alarm: AlarmCode::NONE,
            mode: Some(mode),
            sequence: "00".into(),
            angle: (self.angle)(self.started.elapsed()),
            observed_wall: None,
            observed_at: Some(self.frozen_at.unwrap_or_else(Instant::now)),
        }
    }
}

/// Sink that journals every payload.
pub(crate) struct RecordingSink {
    journal: Journal,
    fail: bool,
}

impl RecordingSink {
    pub(crate) fn new(journal: Journal) -> Self {
        Self {
            journal,
            fail: false,
        }
    }

    pub(crate) fn failing(journal: Journal) -> Self {
        Self {
            journal,
            fail: true,
        }
    }
}

#[async_trait]
impl CommandSink for RecordingSink {
    async fn write_payload(&self, payload: &str) -> std::io::Result<()> {
        if self.fail {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "link down",
            ));
        }
        self.journal.lock().push(Entry::Wrote(payload.to_string()));
        Ok(())
    }
}

pub(crate) fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

pub(crate) fn writes(journal: &Journal) -> Vec<String> {
    journal
        .lock()
        .iter()
        .filter_map(|entry| match entry {
            Entry::Wrote(payload) => Some(payload.clone()),
            Entry::Observed(_) => None,
        })
        .collect()
}
