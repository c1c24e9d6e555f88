//! Turntable session.
//!
//! [`Turntable`] owns everything one connection needs: the reader task, the
//! serialized writer, the shared status, the sequencer and the homing monitor. There is
//! no global state; dropping or disconnecting the session releases the port.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::instrument;
use turntable_core::homing::{HomingProgress, HomingReport};
use turntable_core::move_math::{decompose, MovePlan};
use turntable_core::serial::{drain_serial_buffer, open_serial_async, DynSerial};
use turntable_core::{
    ConnectError, DeviceMode, DeviceState, DeviceStatus, DispatchError, HomingError,
    HomingHandle, HomingMonitor, HomingPhase, MotionCommand, MotionSequencer,
};

use crate::config::TurntableConfig;
use crate::reader::{ReaderExit, ReaderLoop};
use crate::sink::{CsvStatusSink, StatusSink};
use crate::transport::Transport;

const EMERGENCY_STEP_DELAY: Duration = Duration::from_millis(100);
const DRAIN_WINDOW: Duration = Duration::from_millis(50);

/// How [`Turntable::disconnect`] leaves the motor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownMode {
    /// Close the link only; the drive keeps its current mode.
    #[default]
    Clean,
    /// Stop, release the motor (`mo=0`), then close.
    Emergency,
}

/// Failure of a relative move.
#[derive(Debug, thiserror::Error)]
pub enum MoveError {
    /// The move command could not be dispatched.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// The device did not return to an idle mode in time.
    #[error("move did not complete within {timeout:?} (last mode: {last_mode:?})")]
    TimedOut {
        /// Completion timeout that elapsed.
        timeout: Duration,
        /// Last mode observed.
        last_mode: Option<DeviceMode>,
    },

    /// The requested delta was NaN or infinite.
    #[error("move delta must be a finite number")]
    NonFinite,
}

/// Outcome of [`Turntable::move_relative`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveReport {
    /// Angle before the move.
    pub start_angle: f64,
    /// Angle once the device was idle again.
    pub final_angle: f64,
    /// How the delta was decomposed.
    pub plan: MovePlan,
}

type Sequencer = MotionSequencer<DeviceState, Transport>;
type Homing = HomingMonitor<DeviceState, Transport>;

/// A connected turntable.
pub struct Turntable {
    config: TurntableConfig,
    state: Arc<DeviceState>,
    transport: Arc<Transport>,
    sequencer: Arc<Sequencer>,
    homing: Arc<Homing>,
    running: Arc<AtomicBool>,
    closed: AtomicBool,
    reader: tokio::sync::Mutex<Option<JoinHandle<ReaderExit>>>,
}

impl Turntable {
    /// Open `port` at `baud` with default settings.
    pub async fn connect(port: &str, baud: u32) -> Result<Self, ConnectError> {
        Self::connect_with_config(TurntableConfig::for_port(port, baud)).await
    }

    /// Open the configured serial port and wait for the first status frame.
    #[instrument(skip(config), fields(port = %config.port, baud = config.baud))]
    pub async fn connect_with_config(config: TurntableConfig) -> Result<Self, ConnectError> {
        config.validate()?;
        let mut port = open_serial_async(&config.port, config.baud, config.read_timeout).await?;
        let discarded = drain_serial_buffer(&mut port, DRAIN_WINDOW).await;
        if discarded > 0 {
            tracing::debug!(discarded, "Discarded stale bytes before connect");
        }
        Self::with_port(Box::new(port), config).await
    }

    /// Start a session over an already open port.
    ///
    /// Fails with [`ConnectError::NoStatus`] if no valid frame arrives within
    /// `connect_timeout`; the port is released in that case.
    pub async fn with_port(port: DynSerial, config: TurntableConfig) -> Result<Self, ConnectError> {
        let sink = config.csv_path.as_ref().and_then(|path| {
            match CsvStatusSink::open(path) {
                Ok(sink) => Some(Box::new(sink) as Box<dyn StatusSink>),
                Err(err) => {
                    tracing::warn!(error = %err, path = %path.display(), "Status CSV sink disabled");
                    None
                }
            }
        });

        let (read_half, write_half) = tokio::io::split(port);
        let state = Arc::new(DeviceState::new());
        let running = Arc::new(AtomicBool::new(true));
        let reader = ReaderLoop::new(
            read_half,
            state.clone(),
            running.clone(),
            config.read_timeout,
        )
        .print_status(config.print_status)
        .with_sink(sink)
        .spawn();

        let transport = Arc::new(Transport::new(write_half));
        let sequencer = Arc::new(MotionSequencer::new(
            state.clone(),
            transport.clone(),
            config.sequencer.clone(),
        ));
        let homing = Arc::new(HomingMonitor::new(sequencer.clone(), config.homing.clone()));

        let session = Self {
            config,
            state,
            transport,
            sequencer,
            homing,
            running,
            closed: AtomicBool::new(false),
            reader: tokio::sync::Mutex::new(Some(reader)),
        };

        let timeout = session.config.connect_timeout;
        if !session.state.wait_for_first_frame(timeout).await {
            tracing::warn!(timeout = ?timeout, "No status frame from turntable");
            session.closed.store(true, Ordering::SeqCst);
            session.shutdown_link().await;
            return Err(ConnectError::NoStatus { timeout });
        }

        let status = session.snapshot();
        tracing::info!(
            port = %session.config.port,
            mode = ?status.mode,
            angle = status.angle,
            "Turntable connected"
        );
        Ok(session)
    }

    /// Active configuration.
    pub fn config(&self) -> &TurntableConfig {
        &self.config
    }

    /// True until disconnect or loss of the link.
    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.running.load(Ordering::SeqCst)
    }

    /// Latest status. Still available after disconnect.
    pub fn snapshot(&self) -> DeviceStatus {
        self.state.snapshot()
    }

    /// Receiver notified on every parsed status.
    pub fn subscribe(&self) -> watch::Receiver<DeviceStatus> {
        self.state.subscribe()
    }

    /// Dispatch a command through the servo-hold handshake.
    pub async fn dispatch(&self, command: &MotionCommand) -> Result<(), DispatchError> {
        self.ensure_connected()?;
        self.sequencer.dispatch(command).await
    }

    /// Dispatch with the low-latency handshake, for interactive jogging.
    pub async fn dispatch_fast(&self, command: &MotionCommand) -> Result<(), DispatchError> {
        self.ensure_connected()?;
        self.sequencer.dispatch_fast(command).await
    }

    /// Start homing in the background.
    ///
    /// Returns `None` if a homing run is already active or the session is closed.
    pub fn start_homing(&self) -> Option<HomingHandle> {
        if !self.is_connected() {
            tracing::warn!("Cannot start homing on a disconnected turntable");
            return None;
        }
        self.homing.start()
    }

    /// Start homing and report through callbacks instead of a handle.
    ///
    /// `on_progress` runs on every poll tick, `on_done` once with the outcome. Returns
    /// `false` if homing could not start.
    pub fn start_homing_with<P, D>(&self, on_progress: P, on_done: D) -> bool
    where
        P: FnMut(HomingProgress) + Send + 'static,
        D: FnOnce(Result<HomingReport, HomingError>) + Send + 'static,
    {
        match self.start_homing() {
            Some(handle) => {
                handle.spawn_callbacks(on_progress, on_done);
                true
            }
            None => false,
        }
    }

    /// Request cancellation of the active homing run.
    pub fn cancel_homing(&self) -> bool {
        self.homing.cancel()
    }

    /// Phase of the latest homing run.
    pub fn homing_phase(&self) -> HomingPhase {
        self.homing.phase()
    }

    /// Wait until the device is idle (mode `0` or `1`) and still idle after the
    /// confirmation delay.
    pub async fn wait_motion_complete(&self, timeout: Duration) -> Result<DeviceStatus, MoveError> {
        let motion = &self.config.motion;
        // None when the timeout is too large to represent, i.e. no deadline
        let deadline = Instant::now().checked_add(timeout);
        sleep(motion.start_delay).await;

        loop {
            let status = self.snapshot();
            if status.mode.is_some_and(DeviceMode::is_idle) {
                sleep(motion.completion_confirm).await;
                let confirmed = self.snapshot();
                if confirmed.mode.is_some_and(DeviceMode::is_idle) {
                    return Ok(confirmed);
                }
            }
            if !self.is_connected() {
                return Err(DispatchError::Disconnected.into());
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(MoveError::TimedOut {
                    timeout,
                    last_mode: self.snapshot().mode,
                });
            }
            sleep(motion.completion_poll).await;
        }
    }

    /// Rotate by `delta` degrees from the current angle and wait for completion.
    ///
    /// Whole turns beyond the protocol's 99-loop limit are capped with a warning.
    #[instrument(skip(self))]
    pub async fn move_relative(
        &self,
        delta: f64,
        accel: u32,
        speed: f64,
    ) -> Result<MoveReport, MoveError> {
        if !delta.is_finite() {
            return Err(MoveError::NonFinite);
        }
        let start_angle = self.snapshot().angle;
        let plan = decompose(start_angle, delta);
        let command = plan.to_command(accel, speed);

        self.dispatch(&command).await?;
        let timeout = self.config.motion.timeout_for(plan.command_loops());
        let status = self.wait_motion_complete(timeout).await?;

        tracing::info!(
            start_angle,
            final_angle = status.angle,
            loops = plan.command_loops(),
            "Relative move completed"
        );
        Ok(MoveReport {
            start_angle,
            final_angle: status.angle,
            plan,
        })
    }

    /// Close the session. Idempotent; later calls return `Ok(())` and do nothing.
    ///
    /// Any homing run is abandoned without a stop of its own and joined within
    /// `shutdown_grace`, so a clean shutdown writes nothing. With
    /// [`ShutdownMode::Emergency`] the drive is then stopped and released; a failure
    /// there is returned after the link has still been closed.
    pub async fn disconnect(&self, mode: ShutdownMode) -> Result<(), DispatchError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("Turntable already disconnected");
            return Ok(());
        }
        if self.homing.abandon()
            && !self.homing.wait_idle(self.config.shutdown_grace).await
        {
            tracing::warn!("Homing run did not end within the shutdown grace period");
        }

        let result = match mode {
            ShutdownMode::Emergency if self.running.load(Ordering::SeqCst) => {
                self.emergency_release().await
            }
            ShutdownMode::Emergency => Err(DispatchError::Disconnected),
            ShutdownMode::Clean => Ok(()),
        };

        self.shutdown_link().await;
        tracing::info!(?mode, "Turntable disconnected");
        result
    }

    async fn emergency_release(&self) -> Result<(), DispatchError> {
        tracing::warn!("Emergency shutdown: stopping and releasing motor");
        let stopped = self.sequencer.send_control(&MotionCommand::Stop).await;
        sleep(EMERGENCY_STEP_DELAY).await;
        let released = self.sequencer.send_control(&MotionCommand::Free).await;
        sleep(EMERGENCY_STEP_DELAY).await;
        stopped.and(released)
    }

    async fn shutdown_link(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(mut handle) = self.reader.lock().await.take() {
            match tokio::time::timeout(self.config.shutdown_grace, &mut handle).await {
                Ok(Ok(exit)) => tracing::debug!(?exit, "Reader loop joined"),
                Ok(Err(err)) => tracing::warn!(error = %err, "Reader task failed"),
                Err(_) => {
                    tracing::warn!("Reader loop did not exit in time, aborting");
                    handle.abort();
                }
            }
        }
        self.transport.close().await;
    }

    fn ensure_connected(&self) -> Result<(), DispatchError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(DispatchError::Disconnected)
        }
    }
}

impl Drop for Turntable {
    fn drop(&mut self) {
        // The reader notices on its next read timeout and releases the port.
        self.running.store(false, Ordering::SeqCst);
        self.homing.abandon();
    }
}
