//! Simulated turntable on the in-memory serial pair.
//!
//! Streams status frames at a fixed period and reacts to commands the way the
//! firmware does, including the parts that make the protocol awkward: motion commands
//! outside servo-hold are silently dropped, stopping passes through mode `8`, and
//! homing never announces completion.
//!
//! Every command line is recorded with the mode the device was in when it arrived, so
//! tests can assert that motion was only ever sent in servo-hold.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use turntable_core::frame::FRAME_MARKER;
use turntable_core::status::encode_status_angle;
use turntable_core::{AlarmCode, DeviceMode};

use crate::mock_serial::{self, MockDeviceHarness, MockSerialPort};

/// Simulated device behavior.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Status frame period.
    pub frame_period: Duration,
    /// Mode at power-up.
    pub initial_mode: DeviceMode,
    /// Angle at power-up, degrees.
    pub initial_angle: f64,
    /// Time spent in mode `8` after a stop.
    pub stop_duration: Duration,
    /// Angular rate of position and multi-turn runs, degrees per second.
    pub travel_rate: f64,
    /// Angular rate while homing, degrees per second.
    pub homing_rate: f64,
    /// Time from run start to the "stable" mode of speed and swing runs.
    pub stabilize_after: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            frame_period: Duration::from_millis(10),
            initial_mode: DeviceMode::ServoHold,
            initial_angle: 0.0,
            stop_duration: Duration::from_millis(150),
            travel_rate: 360.0,
            homing_rate: 90.0,
            stabilize_after: Duration::from_millis(300),
        }
    }
}

/// One command line as the device saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedCommand {
    /// Payload without the `$1` marker.
    pub payload: String,
    /// Device mode when the line arrived.
    pub mode: DeviceMode,
    /// False if the firmware would have ignored it.
    pub accepted: bool,
}

#[derive(Debug, Clone, Copy)]
enum Motion {
    Idle,
    Travel {
        from: f64,
        delta: f64,
        started: Instant,
        duration: Duration,
    },
    Spin {
        speed: f64,
        started: Instant,
        last: Instant,
    },
    Swing {
        center: f64,
        amplitude: f64,
        frequency: f64,
        started: Instant,
    },
    Stopping {
        until: Instant,
    },
}

#[derive(Debug)]
struct Device {
    config: SimConfig,
    mode: DeviceMode,
    alarm: AlarmCode,
    angle: f64,
    sequence: u8,
    motion: Motion,
    received: Vec<ReceivedCommand>,
    malformed: usize,
    silent: bool,
    hung_up: bool,
}

impl Device {
    fn new(config: SimConfig) -> Self {
        Self {
            mode: config.initial_mode,
            alarm: AlarmCode::NONE,
            angle: config.initial_angle,
            sequence: 0,
            motion: Motion::Idle,
            received: Vec::new(),
            malformed: 0,
            silent: false,
            hung_up: false,
            config,
        }
    }

    fn advance(&mut self, now: Instant) {
        match self.motion {
            Motion::Idle => {}
            Motion::Travel {
                from,
                delta,
                started,
                duration,
            } => {
                let progress = if duration.is_zero() {
                    1.0
                } else {
                    (now - started).as_secs_f64() / duration.as_secs_f64()
                };
                if progress >= 1.0 {
                    self.angle = fold(from + delta);
                    self.mode = DeviceMode::ServoHold;
                    self.motion = Motion::Idle;
                } else {
                    self.angle = fold(from + delta * progress);
                }
            }
            Motion::Spin {
                speed,
                started,
                last,
            } => {
                self.angle = (self.angle + speed * (now - last).as_secs_f64()).rem_euclid(360.0);
                if now - started >= self.config.stabilize_after {
                    self.mode = DeviceMode::SpeedStable;
                }
                self.motion = Motion::Spin {
                    speed,
                    started,
                    last: now,
                };
            }
            Motion::Swing {
                center,
                amplitude,
                frequency,
                started,
            } => {
                let t = (now - started).as_secs_f64();
                let phase = 2.0 * std::f64::consts::PI * frequency * t;
                self.angle = (center + amplitude * phase.sin()).rem_euclid(360.0);
                if now - started >= self.config.stabilize_after {
                    self.mode = DeviceMode::SwingStable;
                }
            }
            Motion::Stopping { until } => {
                if now >= until {
                    self.mode = DeviceMode::ServoHold;
                    self.motion = Motion::Idle;
                }
            }
        }
    }

    fn frame(&mut self) -> String {
        let frame = format!(
            "{FRAME_MARKER}{}{}{:02}{}\r\n",
            self.alarm,
            self.mode.code(),
            self.sequence,
            encode_status_angle(self.angle)
        );
        self.sequence = (self.sequence + 1) % 100;
        frame
    }

    fn handle_line(&mut self, line: &str, now: Instant) {
        let Some(payload) = line.strip_prefix(FRAME_MARKER) else {
            self.malformed += 1;
            return;
        };
        self.advance(now);
        let mode = self.mode;
        let accepted = match self.apply(payload, now) {
            Some(accepted) => accepted,
            None => {
                self.malformed += 1;
                false
            }
        };
        if !accepted {
            tracing::debug!(payload, mode = %mode, "Simulated turntable ignored command");
        }
        self.received.push(ReceivedCommand {
            payload: payload.to_string(),
            mode,
            accepted,
        });
    }

    /// `None` for an unparseable payload, otherwise whether the firmware accepts it.
    fn apply(&mut self, payload: &str, now: Instant) -> Option<bool> {
        match payload {
            "mo=1" => {
                if self.mode == DeviceMode::Released {
                    self.mode = DeviceMode::ServoHold;
                }
                return Some(true);
            }
            "mo=0" => {
                self.mode = DeviceMode::Released;
                self.motion = Motion::Idle;
                return Some(true);
            }
            "st" => {
                if self.mode.is_moving() {
                    self.mode = DeviceMode::Stopping;
                    self.motion = Motion::Stopping {
                        until: now + self.config.stop_duration,
                    };
                }
                return Some(true);
            }
            "1" => {
                if self.mode.is_moving() || self.mode == DeviceMode::Stopping {
                    return Some(false);
                }
                let from = signed(self.angle);
                self.mode = DeviceMode::Homing;
                self.motion = Motion::Travel {
                    from,
                    delta: -from,
                    started: now,
                    duration: travel_time(from.abs(), self.config.homing_rate),
                };
                return Some(true);
            }
            _ => {}
        }

        if let Some(index) = payload.strip_prefix("rs=") {
            return index.parse::<u8>().ok().map(|index| index <= 7);
        }

        let kind = payload.chars().next()?;
        if !matches!(kind, '2' | '3' | '4' | '5') {
            return None;
        }
        let run = parse_run(payload)?;
        if self.mode != DeviceMode::ServoHold {
            return Some(false);
        }

        match run {
            Run::Position {
                reverse,
                target,
                loops,
            } => {
                let turns = f64::from(loops) * 360.0;
                let delta = if reverse {
                    -((self.angle - target).rem_euclid(360.0) + turns)
                } else {
                    (target - self.angle).rem_euclid(360.0) + turns
                };
                self.mode = if kind == '5' {
                    DeviceMode::MultiTurnRun
                } else {
                    DeviceMode::PositionRun
                };
                self.motion = Motion::Travel {
                    from: self.angle,
                    delta,
                    started: now,
                    duration: travel_time(delta.abs(), self.config.travel_rate),
                };
            }
            Run::Speed { speed } => {
                self.mode = DeviceMode::SpeedRun;
                self.motion = Motion::Spin {
                    speed,
                    started: now,
                    last: now,
                };
            }
            Run::Swing {
                amplitude,
                frequency,
            } => {
                self.mode = DeviceMode::SwingRun;
                self.motion = Motion::Swing {
                    center: self.angle,
                    amplitude,
                    frequency,
                    started: now,
                };
            }
        }
        Some(true)
    }
}

enum Run {
    Position { reverse: bool, target: f64, loops: u32 },
    Speed { speed: f64 },
    Swing { amplitude: f64, frequency: f64 },
}

fn parse_run(payload: &str) -> Option<Run> {
    let field = |range: std::ops::Range<usize>| payload.get(range);
    match payload.chars().next()? {
        '2' if payload.len() == 23 => Some(Run::Position {
            reverse: field(1..2)? == "1",
            target: field(15..23)?.parse().ok()?,
            loops: 0,
        }),
        '5' if payload.len() == 25 => Some(Run::Position {
            reverse: field(1..2)? == "1",
            target: field(15..23)?.parse().ok()?,
            loops: field(23..25)?.parse().ok()?,
        }),
        '3' if payload.len() == 15 => Some(Run::Speed {
            speed: field(6..15)?.parse().ok()?,
        }),
        '4' if payload.len() == 15 => Some(Run::Swing {
            amplitude: field(1..9)?.parse().ok()?,
            frequency: field(9..15)?.parse().ok()?,
        }),
        _ => None,
    }
}

fn fold(angle: f64) -> f64 {
    angle.rem_euclid(360.0)
}

/// Angle in (-180, 180], the short way back to zero.
fn signed(angle: f64) -> f64 {
    let folded = fold(angle);
    if folded > 180.0 {
        folded - 360.0
    } else {
        folded
    }
}

fn travel_time(distance: f64, rate: f64) -> Duration {
    if rate <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(distance / rate)
}

/// Handle to a running simulated device.
pub struct SimulatedTurntable {
    device: Arc<Mutex<Device>>,
    task: JoinHandle<()>,
}

impl SimulatedTurntable {
    /// Start the device; returns the host end of its serial link.
    pub fn spawn(config: SimConfig) -> (MockSerialPort, Self) {
        let (port, harness) = mock_serial::new();
        let period = config.frame_period;
        let device = Arc::new(Mutex::new(Device::new(config)));
        let task = tokio::spawn(run(harness, device.clone(), period));
        (port, Self { device, task })
    }

    /// Every command line received so far.
    pub fn received(&self) -> Vec<ReceivedCommand> {
        self.device.lock().received.clone()
    }

    /// Payloads received so far.
    pub fn payloads(&self) -> Vec<String> {
        self.device
            .lock()
            .received
            .iter()
            .map(|cmd| cmd.payload.clone())
            .collect()
    }

    /// Lines that did not parse as commands.
    pub fn malformed(&self) -> usize {
        self.device.lock().malformed
    }

    /// Current mode.
    pub fn mode(&self) -> DeviceMode {
        self.device.lock().mode
    }

    /// Current angle, degrees in [0, 360).
    pub fn angle(&self) -> f64 {
        self.device.lock().angle
    }

    /// Stop or resume status frames; commands are still processed.
    pub fn set_silent(&self, silent: bool) {
        self.device.lock().silent = silent;
    }

    /// Force the mode, e.g. to model a drive left moving by another client.
    pub fn force_mode(&self, mode: DeviceMode) {
        self.device.lock().mode = mode;
    }

    /// Set the alarm code reported in frames.
    pub fn set_alarm(&self, alarm: AlarmCode) {
        self.device.lock().alarm = alarm;
    }

    /// Drop the link as if the cable were pulled. The host reads EOF.
    pub fn hang_up(&self) {
        self.device.lock().hung_up = true;
    }

    /// True once the device task has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SimulatedTurntable {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(mut harness: MockDeviceHarness, device: Arc<Mutex<Device>>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let frame = {
                    let mut device = device.lock();
                    if device.hung_up {
                        break;
                    }
                    device.advance(Instant::now());
                    if device.silent { None } else { Some(device.frame()) }
                };
                if let Some(frame) = frame {
                    if harness.send_bytes(frame.as_bytes()).is_err() {
                        break;
                    }
                }
            }
            chunk = harness.recv_chunk() => {
                let Some(chunk) = chunk else { break };
                harness.absorb(&chunk);
                while let Some(line) = harness.take_line() {
                    device.lock().handle_line(&line, Instant::now());
                }
            }
        }
    }
    tracing::debug!("Simulated turntable stopped");
}
