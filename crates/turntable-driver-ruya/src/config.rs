//! Session configuration.
//!
//! Layered with `figment`: serde defaults, then a TOML file (or JSON when the file
//! ends in `.json`), then `TURNTABLE_`-prefixed environment variables with `__` as the
//! nesting separator (`TURNTABLE_SEQUENCER__READY_TIMEOUT=8s`).
//!
//! Durations are human-readable (`"500ms"`, `"2s"`).
//!
//! ```toml
//! port = "/dev/ttyUSB0"
//! baud = 115200
//! print_status = true
//!
//! [sequencer]
//! ready_timeout = "5s"
//! auto_init = true
//! parameter_policy = "reject"
//!
//! [homing]
//! tolerance_deg = 0.01
//! stability_window = "1s"
//! ```

use figment::providers::{Env, Format, Json, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use turntable_core::{HomingConfig, SequencerConfig};

/// Configuration loading or validation failure.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A provider failed or a value did not deserialize.
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    /// A value deserialized but is unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Load(Box::new(err))
    }
}

impl From<ConfigError> for turntable_core::ConnectError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Timing for the relative-move completion detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Poll period while waiting for the move to finish.
    #[serde(with = "humantime_serde")]
    pub completion_poll: Duration,
    /// Idle must still hold after this re-check delay.
    #[serde(with = "humantime_serde")]
    pub completion_confirm: Duration,
    /// Delay before the first poll so the device has left servo-hold.
    #[serde(with = "humantime_serde")]
    pub start_delay: Duration,
    /// Completion timeout for a move without whole turns.
    #[serde(with = "humantime_serde")]
    pub base_timeout: Duration,
    /// Extra completion time per whole turn.
    #[serde(with = "humantime_serde")]
    pub per_loop_timeout: Duration,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            completion_poll: Duration::from_millis(100),
            completion_confirm: Duration::from_millis(500),
            start_delay: Duration::from_millis(200),
            base_timeout: Duration::from_secs(120),
            per_loop_timeout: Duration::from_secs(60),
        }
    }
}

impl MotionConfig {
    /// Completion timeout for a move spanning `loops` whole turns. Saturates at
    /// `Duration::MAX`.
    pub fn timeout_for(&self, loops: u32) -> Duration {
        self.per_loop_timeout
            .checked_mul(loops)
            .and_then(|extra| self.base_timeout.checked_add(extra))
            .unwrap_or(Duration::MAX)
    }
}

/// Everything a [`Turntable`](crate::Turntable) session needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurntableConfig {
    /// Serial port path, e.g. `/dev/ttyUSB0` or `COM3`.
    #[serde(alias = "COMPort")]
    pub port: String,
    /// Baud rate.
    #[serde(alias = "Baudrate")]
    pub baud: u32,
    /// Per-read timeout of the reader loop.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// How long `connect` waits for the first valid status frame.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// How long `disconnect` waits for the reader loop to exit.
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    /// Servo-hold handshake settings.
    pub sequencer: SequencerConfig,
    /// Homing settle detection settings.
    pub homing: HomingConfig,
    /// Relative-move completion settings.
    pub motion: MotionConfig,
    /// Append every parsed status to this CSV file.
    pub csv_path: Option<PathBuf>,
    /// Log every parsed status at `info`.
    pub print_status: bool,
}

impl Default for TurntableConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud: 115_200,
            read_timeout: Duration::from_millis(20),
            connect_timeout: Duration::from_secs(2),
            shutdown_grace: Duration::from_millis(500),
            sequencer: SequencerConfig::default(),
            homing: HomingConfig::default(),
            motion: MotionConfig::default(),
            csv_path: None,
            print_status: false,
        }
    }
}

impl TurntableConfig {
    /// Defaults for `port` at `baud`.
    pub fn for_port(port: impl Into<String>, baud: u32) -> Self {
        Self {
            port: port.into(),
            baud,
            ..Self::default()
        }
    }

    /// Load from defaults, `path` and the environment, then validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        // Missing keys fall back to the serde defaults.
        let figment = if path.extension().is_some_and(|ext| ext == "json") {
            Figment::new().merge(Json::file(path))
        } else {
            Figment::new().merge(Toml::file(path))
        };
        let config: Self = figment
            .merge(Env::prefixed("TURNTABLE_").split("__"))
            .extract()?;
        config.validate()?;
        tracing::debug!(path = %path.display(), port = %config.port, "Loaded turntable configuration");
        Ok(config)
    }

    /// Reject values no session can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port.trim().is_empty() {
            return Err(ConfigError::Invalid("port must not be empty".into()));
        }
        if self.baud == 0 {
            return Err(ConfigError::Invalid("baud must be non-zero".into()));
        }
        let timeouts = [
            ("read_timeout", self.read_timeout),
            ("connect_timeout", self.connect_timeout),
            ("sequencer.ready_timeout", self.sequencer.ready_timeout),
            ("sequencer.poll_interval", self.sequencer.poll_interval),
            ("homing.poll_interval", self.homing.poll_interval),
            ("homing.timeout", self.homing.timeout),
            ("homing.max_status_age", self.homing.max_status_age),
            ("motion.completion_poll", self.motion.completion_poll),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, value)| value.is_zero()) {
            return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
        }
        if !self.homing.tolerance_deg.is_finite() || self.homing.tolerance_deg < 0.0 {
            return Err(ConfigError::Invalid(
                "homing.tolerance_deg must be a non-negative number".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use turntable_core::ParameterPolicy;

    #[test]
    fn test_defaults() {
        let config = TurntableConfig::default();
        assert_eq!(config.baud, 115_200);
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.sequencer.ready_timeout, Duration::from_secs(5));
        assert!(config.sequencer.auto_init);
        assert_eq!(config.sequencer.parameter_policy, ParameterPolicy::Reject);
        assert_eq!(config.homing.tolerance_deg, 0.01);
        assert_eq!(config.motion.timeout_for(2), Duration::from_secs(240));
    }

    #[test]
    fn test_load_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
port = "/dev/ttyUSB3"
print_status = true

[sequencer]
ready_timeout = "8s"
parameter_policy = "clamp"

[homing]
stability_window = "750ms"
"#
        )
        .unwrap();

        let config = TurntableConfig::load(file.path()).unwrap();
        assert_eq!(config.port, "/dev/ttyUSB3");
        assert!(config.print_status);
        assert_eq!(config.sequencer.ready_timeout, Duration::from_secs(8));
        assert_eq!(config.sequencer.parameter_policy, ParameterPolicy::Clamp);
        assert_eq!(config.homing.stability_window, Duration::from_millis(750));
        assert_eq!(config.baud, 115_200);
    }

    #[test]
    fn test_load_json_with_legacy_keys() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"COMPort": "COM4", "Baudrate": 57600}}"#).unwrap();

        let config = TurntableConfig::load(file.path()).unwrap();
        assert_eq!(config.port, "COM4");
        assert_eq!(config.baud, 57_600);
    }

    #[test]
    fn test_validate_rejects_empty_port() {
        let err = TurntableConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("port"));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = TurntableConfig::for_port("/dev/ttyUSB0", 115_200);
        config.sequencer.ready_timeout = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sequencer.ready_timeout"));
    }

    #[test]
    fn test_timeout_for_saturates() {
        let motion = MotionConfig {
            per_loop_timeout: Duration::MAX,
            ..Default::default()
        };
        assert_eq!(motion.timeout_for(0), Duration::from_secs(120));
        assert_eq!(motion.timeout_for(2), Duration::MAX);

        let motion = MotionConfig {
            base_timeout: Duration::MAX,
            ..Default::default()
        };
        assert_eq!(motion.timeout_for(1), Duration::MAX);
    }
}
