//! Homing with settle detection.
//!
//! The firmware's homing command drives the table toward 0° but never reports
//! "homing finished". Completion is inferred: the angle has to stay within a tolerance
//! of zero for a full stability window. Any excursion outside the tolerance restarts
//! the window.
//!
//! At most one homing run is active per monitor. Progress is published on a broadcast
//! channel and the current phase on a watch channel; cancellation is a shared flag
//! checked every poll tick. A cancelled run sends Stop unless it was abandoned, which
//! leaves the motor as it is.

use crate::command::MotionCommand;
use crate::error::HomingError;
use crate::link::{CommandSink, StatusSource};
use crate::sequencer::MotionSequencer;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

const EVENT_CAPACITY: usize = 64;

/// Homing timing and tolerance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HomingConfig {
    /// Angle poll period.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Maximum distance from 0° that counts as "at home".
    pub tolerance_deg: f64,
    /// How long the angle must stay in tolerance.
    #[serde(with = "humantime_serde")]
    pub stability_window: Duration,
    /// Overall limit for one run.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Pause between the preliminary stop and the homing command.
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,
    /// Statuses older than this never count toward the stability window.
    #[serde(with = "humantime_serde")]
    pub max_status_age: Duration,
}

impl Default for HomingConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            tolerance_deg: 0.01,
            stability_window: Duration::from_secs(1),
            timeout: Duration::from_secs(60),
            settle_delay: Duration::from_millis(200),
            max_status_age: Duration::from_millis(500),
        }
    }
}

/// Lifecycle of a homing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HomingPhase {
    /// No run has started.
    Idle,
    /// Waiting for the angle to settle at zero.
    Homing,
    /// Angle held within tolerance for the stability window.
    Completed,
    /// Cancelled by the caller.
    Cancelled,
    /// Did not settle before the timeout.
    TimedOut,
    /// The commands could not be sent.
    Failed,
}

impl HomingPhase {
    /// True for phases that end a run.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cancelled | Self::TimedOut | Self::Failed
        )
    }
}

/// One poll tick of a homing run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HomingProgress {
    /// Polled angle in degrees.
    pub angle: f64,
    /// Time the angle has been continuously in tolerance.
    pub stable_for: Duration,
    /// Time since the homing command was sent.
    pub elapsed: Duration,
}

/// Notification published while homing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HomingEvent {
    /// Stop and homing commands are about to be sent.
    Started,
    /// Poll tick.
    Progress(HomingProgress),
    /// Run ended in the given phase.
    Finished(HomingPhase),
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HomingReport {
    /// Time from the homing command to confirmed settle.
    pub elapsed: Duration,
    /// Last polled angle.
    pub final_angle: f64,
}

/// Angular distance from 0°, taking the short way round.
pub fn distance_from_zero(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(360.0);
    wrapped.min(360.0 - wrapped)
}

/// Cancellation request shared by a run and its handles.
#[derive(Debug, Default)]
struct CancelRequest {
    requested: AtomicBool,
    halt: AtomicBool,
}

impl CancelRequest {
    fn request(&self, halt: bool) {
        self.halt.store(halt, Ordering::SeqCst);
        self.requested.store(true, Ordering::SeqCst);
    }

    fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    fn halts(&self) -> bool {
        self.halt.load(Ordering::SeqCst)
    }
}

/// Runs homing and guards against concurrent runs.
pub struct HomingMonitor<S, C> {
    sequencer: Arc<MotionSequencer<S, C>>,
    config: HomingConfig,
    active: parking_lot::Mutex<Option<Arc<CancelRequest>>>,
    running: watch::Sender<bool>,
    phase: watch::Sender<HomingPhase>,
}

/// Releases the active slot when a run ends, however it ends.
struct RunGuard<'a, S, C>(&'a HomingMonitor<S, C>);

impl<S, C> Drop for RunGuard<'_, S, C> {
    fn drop(&mut self) {
        let monitor = self.0;
        let phase = *monitor.phase.borrow();
        if phase == HomingPhase::Homing {
            // panicked or aborted mid-run
            monitor.phase.send_replace(HomingPhase::Failed);
        }
        monitor.active.lock().take();
        monitor.running.send_replace(false);
    }
}

impl<S, C> HomingMonitor<S, C>
where
    S: StatusSource + 'static,
    C: CommandSink + 'static,
{
    /// Create an idle monitor.
    pub fn new(sequencer: Arc<MotionSequencer<S, C>>, config: HomingConfig) -> Self {
        let (phase, _) = watch::channel(HomingPhase::Idle);
        let (running, _) = watch::channel(false);
        Self {
            sequencer,
            config,
            active: parking_lot::Mutex::new(None),
            running,
            phase,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> HomingPhase {
        *self.phase.borrow()
    }

    /// Receiver notified on every phase change.
    pub fn watch_phase(&self) -> watch::Receiver<HomingPhase> {
        self.phase.subscribe()
    }

    /// True while a run is in progress.
    pub fn is_active(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Start a homing run in the background.
    ///
    /// Returns `None` without side effects if a run is already active.
    pub fn start(self: &Arc<Self>) -> Option<HomingHandle> {
        let cancel = {
            let mut active = self.active.lock();
            if active.is_some() {
                tracing::debug!("Homing already in progress, ignoring start request");
                return None;
            }
            let cancel = Arc::new(CancelRequest::default());
            *active = Some(cancel.clone());
            self.running.send_replace(true);
            cancel
        };

        let (events_tx, events) = broadcast::channel(EVENT_CAPACITY);
        let phase = self.phase.subscribe();
        let monitor = Arc::clone(self);
        let flag = cancel.clone();
        let task = tokio::spawn(async move {
            let _guard = RunGuard(&*monitor);
            monitor.run(&flag, &events_tx).await
        });

        Some(HomingHandle {
            events,
            phase,
            cancel,
            task,
        })
    }

    /// Request cancellation of the active run; the turntable is stopped. Returns
    /// `false` if no run is active.
    pub fn cancel(&self) -> bool {
        self.request_cancel(true)
    }

    /// Cancel the active run without stopping the turntable: no further command is
    /// written by the run. Returns `false` if no run is active.
    pub fn abandon(&self) -> bool {
        self.request_cancel(false)
    }

    /// Wait until no run is active. Returns `false` if `timeout` elapses first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut running = self.running.subscribe();
        let wait = running.wait_for(|running| !*running);
        let idle = matches!(tokio::time::timeout(timeout, wait).await, Ok(Ok(_)));
        idle
    }

    fn request_cancel(&self, halt: bool) -> bool {
        match self.active.lock().as_ref() {
            Some(request) => {
                request.request(halt);
                true
            }
            None => false,
        }
    }

    fn finish(&self, phase: HomingPhase, events: &broadcast::Sender<HomingEvent>) {
        self.phase.send_replace(phase);
        let _ = events.send(HomingEvent::Finished(phase));
    }

    async fn halt(&self) {
        if let Err(err) = self.sequencer.send_control(&MotionCommand::Stop).await {
            tracing::warn!(error = %err, "Failed to stop turntable after aborted homing");
        }
    }

    async fn cancelled(
        &self,
        cancel: &CancelRequest,
        events: &broadcast::Sender<HomingEvent>,
    ) -> Result<HomingReport, HomingError> {
        if cancel.halts() {
            tracing::info!("Homing cancelled");
            self.halt().await;
        } else {
            tracing::info!("Homing abandoned, motor left as is");
        }
        self.finish(HomingPhase::Cancelled, events);
        Err(HomingError::Cancelled)
    }

    async fn run(
        &self,
        cancel: &CancelRequest,
        events: &broadcast::Sender<HomingEvent>,
    ) -> Result<HomingReport, HomingError> {
        self.phase.send_replace(HomingPhase::Homing);
        let _ = events.send(HomingEvent::Started);
        tracing::info!("Homing started");

        let sent = self
            .sequencer
            .dispatch_after_stop(&MotionCommand::Homing, self.config.settle_delay, || {
                cancel.is_requested()
            })
            .await;
        match sent {
            Ok(true) => {}
            Ok(false) => return self.cancelled(cancel, events).await,
            Err(err) => {
                tracing::error!(error = %err, "Failed to send homing command");
                self.finish(HomingPhase::Failed, events);
                return Err(err.into());
            }
        }

        let started = Instant::now();
        let mut stable_since: Option<Instant> = None;

        loop {
            if cancel.is_requested() {
                return self.cancelled(cancel, events).await;
            }

            let now = Instant::now();
            let elapsed = now - started;
            let status = self.sequencer.status().snapshot();
            let angle = status.angle;
            let fresh = !status.is_stale(self.config.max_status_age);

            if fresh && distance_from_zero(angle) <= self.config.tolerance_deg {
                let since = *stable_since.get_or_insert(now);
                let stable_for = now - since;
                let _ = events.send(HomingEvent::Progress(HomingProgress {
                    angle,
                    stable_for,
                    elapsed,
                }));
                if stable_for >= self.config.stability_window {
                    tracing::info!(angle, elapsed = ?elapsed, "Homing completed");
                    self.finish(HomingPhase::Completed, events);
                    return Ok(HomingReport {
                        elapsed,
                        final_angle: angle,
                    });
                }
            } else {
                if stable_since.take().is_some() {
                    tracing::debug!(
                        angle,
                        fresh,
                        "Angle left tolerance or went stale, restarting stability window"
                    );
                }
                let _ = events.send(HomingEvent::Progress(HomingProgress {
                    angle,
                    stable_for: Duration::ZERO,
                    elapsed,
                }));
            }

            if elapsed >= self.config.timeout {
                tracing::warn!(angle, elapsed = ?elapsed, "Homing timed out");
                self.halt().await;
                self.finish(HomingPhase::TimedOut, events);
                return Err(HomingError::TimedOut {
                    elapsed,
                    last_angle: angle,
                });
            }

            sleep(self.config.poll_interval).await;
        }
    }
}

/// Caller's view of a running homing task.
#[derive(Debug)]
pub struct HomingHandle {
    events: broadcast::Receiver<HomingEvent>,
    phase: watch::Receiver<HomingPhase>,
    cancel: Arc<CancelRequest>,
    task: JoinHandle<Result<HomingReport, HomingError>>,
}

impl HomingHandle {
    /// Progress and completion events.
    pub fn events(&mut self) -> &mut broadcast::Receiver<HomingEvent> {
        &mut self.events
    }

    /// Current phase.
    pub fn phase(&self) -> HomingPhase {
        *self.phase.borrow()
    }

    /// Request cancellation. Takes effect at the next poll tick.
    pub fn cancel(&self) {
        self.cancel.request(true);
    }

    /// Wait for the run to end.
    pub async fn wait(self) -> Result<HomingReport, HomingError> {
        self.task
            .await
            .map_err(|err| HomingError::TaskFailed(err.to_string()))?
    }

    /// Drive callbacks from the event stream: `on_progress` for each tick, then
    /// `on_done` once with the outcome.
    pub fn spawn_callbacks<P, D>(self, mut on_progress: P, on_done: D) -> JoinHandle<()>
    where
        P: FnMut(HomingProgress) + Send + 'static,
        D: FnOnce(Result<HomingReport, HomingError>) + Send + 'static,
    {
        let mut handle = self;
        tokio::spawn(async move {
            loop {
                match handle.events.recv().await {
                    Ok(HomingEvent::Progress(progress)) => on_progress(progress),
                    Ok(HomingEvent::Started) => {}
                    Ok(HomingEvent::Finished(_)) | Err(broadcast::error::RecvError::Closed) => {
                        break
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Homing progress listener lagged");
                    }
                }
            }
            on_done(handle.wait().await);
        })
    }
}
