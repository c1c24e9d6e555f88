//! Safe motion dispatch.
//!
//! The firmware silently drops a motion command unless it is in servo-hold (mode `1`)
//! when the command arrives. [`MotionSequencer`] drives the device into servo-hold
//! first (stopping an in-progress move, initializing a released drive, waiting out a
//! deceleration) and only then writes the command.
//!
//! Motion dispatches are serialized end-to-end: while one caller is between "confirmed
//! servo-hold" and "command written", no other motion command can interleave. Control
//! commands (stop, init, free, homing) bypass the lock so an emergency stop is never
//! queued behind a pending dispatch.
//!
//! Status observed before our own latest write is not trusted: the device may not have
//! reacted to that write yet, so a `1` from before a stop says nothing about after it.

use crate::command::{MotionCommand, ParameterPolicy};
use crate::error::DispatchError;
use crate::link::{CommandSink, StatusSource};
use crate::status::{DeviceMode, DeviceStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::instrument;

/// Timing and policy for [`MotionSequencer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Give up on reaching servo-hold after this long.
    #[serde(with = "humantime_serde")]
    pub ready_timeout: Duration,
    /// Pause after writing `mo=1` to a released drive.
    #[serde(with = "humantime_serde")]
    pub init_settle: Duration,
    /// Pause after stopping an in-progress move.
    #[serde(with = "humantime_serde")]
    pub stop_settle: Duration,
    /// Poll interval while the device reports stopping.
    #[serde(with = "humantime_serde")]
    pub stopping_poll: Duration,
    /// Poll interval while status is missing or not yet fresh.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Fast path: re-issue stop if the device is still moving after this long.
    #[serde(with = "humantime_serde")]
    pub restop_interval: Duration,
    /// Send `mo=1` automatically when the drive is found released.
    pub auto_init: bool,
    /// What to do with out-of-range numeric parameters.
    pub parameter_policy: ParameterPolicy,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(5),
            init_settle: Duration::from_millis(500),
            stop_settle: Duration::from_millis(200),
            stopping_poll: Duration::from_millis(100),
            poll_interval: Duration::from_millis(100),
            restop_interval: Duration::from_millis(500),
            auto_init: true,
            parameter_policy: ParameterPolicy::default(),
        }
    }
}

/// Serializes motion commands behind a servo-hold handshake.
pub struct MotionSequencer<S, C> {
    status: Arc<S>,
    sink: Arc<C>,
    config: SequencerConfig,
    dispatch_lock: tokio::sync::Mutex<()>,
    last_write: parking_lot::Mutex<Option<Instant>>,
}

impl<S: StatusSource, C: CommandSink> MotionSequencer<S, C> {
    /// Create a sequencer over a status source and a command sink.
    pub fn new(status: Arc<S>, sink: Arc<C>, config: SequencerConfig) -> Self {
        Self {
            status,
            sink,
            config,
            dispatch_lock: tokio::sync::Mutex::new(()),
            last_write: parking_lot::Mutex::new(None),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &SequencerConfig {
        &self.config
    }

    /// Status source this sequencer reads.
    pub fn status(&self) -> &S {
        &self.status
    }

    /// Dispatch a command, waiting for servo-hold first if the command needs it.
    ///
    /// Invalid parameters fail before anything is written. On
    /// [`DispatchError::NotReady`] nothing but stop/init commands were sent.
    #[instrument(skip(self, command), fields(command = command.name()))]
    pub async fn dispatch(&self, command: &MotionCommand) -> Result<(), DispatchError> {
        let payload = command.encode(self.config.parameter_policy)?;
        if !command.requires_servo_hold() {
            return self.write(&payload).await;
        }

        let _exclusive = self.dispatch_lock.lock().await;
        self.ensure_ready().await?;
        self.write(&payload).await
    }

    /// Like [`dispatch`](Self::dispatch), but trusts a fresh servo-hold reading and
    /// otherwise stops and polls without the fixed settle delays.
    ///
    /// Used for interactive jogging where the extra settle time is noticeable.
    #[instrument(skip(self, command), fields(command = command.name()))]
    pub async fn dispatch_fast(&self, command: &MotionCommand) -> Result<(), DispatchError> {
        let payload = command.encode(self.config.parameter_policy)?;
        if !command.requires_servo_hold() {
            return self.write(&payload).await;
        }

        let _exclusive = self.dispatch_lock.lock().await;
        self.ensure_ready_fast().await?;
        self.write(&payload).await
    }

    /// Under the dispatch lock: stop, wait `settle`, then write `command`.
    ///
    /// Homing uses this because the firmware accepts the homing command from any
    /// non-moving mode, not only servo-hold. `abort` is checked after the settle
    /// delay; when it returns true the command is not written and `Ok(false)` is
    /// returned.
    #[instrument(skip(self, command, abort), fields(command = command.name()))]
    pub async fn dispatch_after_stop(
        &self,
        command: &MotionCommand,
        settle: Duration,
        abort: impl Fn() -> bool + Send,
    ) -> Result<bool, DispatchError> {
        let payload = command.encode(self.config.parameter_policy)?;
        let _exclusive = self.dispatch_lock.lock().await;
        self.send_control(&MotionCommand::Stop).await?;
        sleep(settle).await;
        if abort() {
            tracing::debug!("Dispatch abandoned after stop");
            return Ok(false);
        }
        self.write(&payload).await?;
        Ok(true)
    }

    /// Write a parameterless control command immediately, bypassing the lock.
    pub async fn send_control(&self, command: &MotionCommand) -> Result<(), DispatchError> {
        let payload = command.encode(self.config.parameter_policy)?;
        self.write(&payload).await
    }

    async fn write(&self, payload: &str) -> Result<(), DispatchError> {
        let result = self.sink.write_payload(payload).await;
        *self.last_write.lock() = Some(Instant::now());
        result.map_err(DispatchError::from_io)?;
        tracing::debug!(payload, "Command written");
        Ok(())
    }

    /// Snapshot plus whether it postdates our last write.
    fn observe(&self) -> (DeviceStatus, bool) {
        let status = self.status.snapshot();
        let fresh = match *self.last_write.lock() {
            Some(written) => status.observed_after(written),
            None => status.has_frame(),
        };
        (status, fresh)
    }

    async fn ensure_ready(&self) -> Result<(), DispatchError> {
        let started = Instant::now();
        let deadline = started + self.config.ready_timeout;
        let mut last_mode = None;

        loop {
            let (status, fresh) = self.observe();
            let mode = status.mode.filter(|_| fresh);
            if mode.is_some() {
                last_mode = mode;
            }
            if mode == Some(DeviceMode::ServoHold) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    last_mode = ?last_mode,
                    waited = ?started.elapsed(),
                    "Turntable did not reach servo-hold, dropping command"
                );
                return Err(DispatchError::NotReady {
                    last_mode,
                    waited: started.elapsed(),
                });
            }

            let pause = match mode {
                Some(DeviceMode::Released) => {
                    if !self.config.auto_init {
                        return Err(DispatchError::Released);
                    }
                    tracing::info!("Turntable released, initializing before dispatch");
                    self.send_control(&MotionCommand::Init).await?;
                    self.config.init_settle
                }
                Some(DeviceMode::Stopping) => self.config.stopping_poll,
                Some(moving) => {
                    tracing::info!(mode = %moving, "Stopping current motion before dispatch");
                    self.send_control(&MotionCommand::Stop).await?;
                    self.config.stop_settle
                }
                None => self.config.poll_interval,
            };
            sleep_until((Instant::now() + pause).min(deadline)).await;
        }
    }

    async fn ensure_ready_fast(&self) -> Result<(), DispatchError> {
        let (status, fresh) = self.observe();
        if fresh && status.mode == Some(DeviceMode::ServoHold) {
            return Ok(());
        }

        let started = Instant::now();
        let deadline = started + self.config.ready_timeout;
        let mut last_mode = status.mode.filter(|_| fresh);
        let mut last_stop = None;
        if last_mode != Some(DeviceMode::Released) {
            self.send_control(&MotionCommand::Stop).await?;
            last_stop = Some(Instant::now());
        }

        loop {
            let (status, fresh) = self.observe();
            let mode = status.mode.filter(|_| fresh);
            if mode.is_some() {
                last_mode = mode;
            }
            if mode == Some(DeviceMode::ServoHold) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    last_mode = ?last_mode,
                    waited = ?started.elapsed(),
                    "Turntable did not reach servo-hold, dropping command"
                );
                return Err(DispatchError::NotReady {
                    last_mode,
                    waited: started.elapsed(),
                });
            }

            let pause = match mode {
                Some(DeviceMode::Released) => {
                    if !self.config.auto_init {
                        return Err(DispatchError::Released);
                    }
                    tracing::info!("Turntable released, initializing before dispatch");
                    self.send_control(&MotionCommand::Init).await?;
                    self.config.init_settle
                }
                Some(moving) if moving.is_moving() => {
                    let due = last_stop
                        .map_or(true, |at: Instant| at.elapsed() >= self.config.restop_interval);
                    if due {
                        tracing::debug!(mode = %moving, "Still moving, re-issuing stop");
                        self.send_control(&MotionCommand::Stop).await?;
                        last_stop = Some(Instant::now());
                    }
                    self.config.poll_interval
                }
                _ => self.config.poll_interval,
            };
            sleep_until((Instant::now() + pause).min(deadline)).await;
        }
    }
}
