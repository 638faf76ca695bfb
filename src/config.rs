// Link settings, topics and the per-robot configuration
use std::f64::consts::PI;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::motion::profile::speed_to_tick_speed;

// Serial port for the motor controller board
pub const DEFAULT_PORT: &str = "/dev/ttyACM0";
pub const DEFAULT_BAUDRATE: u32 = 115_200;

// The ready query is resent at this interval until the device answers
pub const HANDSHAKE_RESEND: Duration = Duration::from_secs(1);

// Poses kept for `pose_history` while tracking is on
pub const POSE_HISTORY_LIMIT: usize = 10_000;

// Bridge loop frequency (drains requests, publishes telemetry)
pub const BRIDGE_LOOP_HZ: u64 = 50;

// Zenoh topics
pub const TOPIC_CMD_MOTION: &str = "diffdrive/cmd/motion"; // motion requests
pub const TOPIC_POSE: &str = "diffdrive/state/pose"; // pose, pose_odom, pose_imu
pub const TOPIC_ODOMETRY: &str = "diffdrive/state/odometry"; // raw tick deltas
pub const TOPIC_DEBUG: &str = "diffdrive/state/debug"; // device loop telemetry
pub const TOPIC_SPEED: &str = "diffdrive/state/speed"; // target vs actual speed
pub const TOPIC_LINK: &str = "diffdrive/state/link"; // error, disconnect, close

/// Which pose estimate `pose()` reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadingSource {
    /// Heading integrated from wheel ticks
    #[default]
    Odometry,
    /// Heading taken from an external sensor (IMU)
    Fused,
}

/// Errors raised while loading or validating a robot configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config is not complete, missing: {}", .0.join(", "))]
    Missing(Vec<&'static str>),

    #[error("Invalid config value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Validated physical and control constants of one robot.
///
/// Distances are in millimeters, speeds in mm/s, the loop period in
/// milliseconds and angles in radians.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RobotConfig {
    pub loop_time: f64,
    pub wheel_base: f64,
    pub left_distance_per_tick: f64,
    pub right_distance_per_tick: f64,
    pub min_speed: f64,
    pub max_speed: f64,
    pub max_rotation_speed: f64,
    /// Planning acceleration (mm/s²)
    pub acceleration: f64,
    /// Ramp increment applied every control loop (mm/s per tick)
    pub acceleration_step: f64,
    pub heading_kp: f64,
    pub heading_ki: f64,
    pub heading_kd: f64,
    pub heading_source: HeadingSource,
}

/// Configuration file as written by the user. Every key is optional here so
/// that validation can report all missing keys at once.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub loop_time: Option<f64>,
    pub wheel_base: Option<f64>,
    pub left_distance_per_tick: Option<f64>,
    pub right_distance_per_tick: Option<f64>,
    pub min_speed: Option<f64>,
    pub max_speed: Option<f64>,
    pub max_rotation_speed: Option<f64>,
    pub acceleration: Option<f64>,
    pub acceleration_step: Option<f64>,
    pub heading_kp: Option<f64>,
    pub heading_ki: Option<f64>,
    pub heading_kd: Option<f64>,
    pub heading_source: Option<HeadingSource>,

    // Used to derive distance-per-tick when it is not given directly
    pub encoder_cpr: Option<f64>,
    pub gear_ratio: Option<f64>,
    pub left_wheel_diameter: Option<f64>,
    pub right_wheel_diameter: Option<f64>,
}

/// Distance covered by one encoder tick for a wheel of the given diameter
pub fn distance_per_tick(wheel_diameter: f64, encoder_cpr: f64, gear_ratio: f64) -> f64 {
    (PI * wheel_diameter) / (encoder_cpr * gear_ratio)
}

impl ConfigFile {
    fn derived_distance_per_tick(&self, wheel_diameter: Option<f64>) -> Option<f64> {
        match (wheel_diameter, self.encoder_cpr, self.gear_ratio) {
            (Some(diameter), Some(cpr), Some(ratio)) => Some(distance_per_tick(diameter, cpr, ratio)),
            _ => None,
        }
    }

    /// Check completeness and ranges, producing an immutable `RobotConfig`
    pub fn validate(self) -> Result<RobotConfig> {
        let left_dpt = self
            .left_distance_per_tick
            .or_else(|| self.derived_distance_per_tick(self.left_wheel_diameter));
        let right_dpt = self
            .right_distance_per_tick
            .or_else(|| self.derived_distance_per_tick(self.right_wheel_diameter));

        let mut missing = Vec::new();
        let mut require = |key: &'static str, value: Option<f64>| {
            if value.is_none() {
                missing.push(key);
            }
            value.unwrap_or_default()
        };

        let config = RobotConfig {
            loop_time: require("loop_time", self.loop_time),
            wheel_base: require("wheel_base", self.wheel_base),
            left_distance_per_tick: require("left_distance_per_tick", left_dpt),
            right_distance_per_tick: require("right_distance_per_tick", right_dpt),
            min_speed: require("min_speed", self.min_speed),
            max_speed: require("max_speed", self.max_speed),
            max_rotation_speed: require("max_rotation_speed", self.max_rotation_speed),
            acceleration: require("acceleration", self.acceleration),
            acceleration_step: require("acceleration_step", self.acceleration_step),
            heading_kp: require("heading_kp", self.heading_kp),
            heading_ki: require("heading_ki", self.heading_ki),
            heading_kd: require("heading_kd", self.heading_kd),
            heading_source: self.heading_source.unwrap_or_default(),
        };
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }
        config.check_ranges()?;
        Ok(config)
    }
}

impl RobotConfig {
    /// Load and validate a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(text)?;
        file.validate()
    }

    /// Loop period in seconds
    pub fn loop_seconds(&self) -> f64 {
        self.loop_time / 1000.0
    }

    fn check_ranges(&self) -> Result<()> {
        let positive = [
            ("loop_time", self.loop_time),
            ("wheel_base", self.wheel_base),
            ("left_distance_per_tick", self.left_distance_per_tick),
            ("right_distance_per_tick", self.right_distance_per_tick),
            ("min_speed", self.min_speed),
            ("max_speed", self.max_speed),
            ("max_rotation_speed", self.max_rotation_speed),
            ("acceleration", self.acceleration),
            ("acceleration_step", self.acceleration_step),
        ];
        for (key, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::Invalid {
                    key,
                    reason: format!("expected a positive number, got {value}"),
                });
            }
        }

        let gains = [
            ("heading_kp", self.heading_kp),
            ("heading_ki", self.heading_ki),
            ("heading_kd", self.heading_kd),
        ];
        for (key, value) in gains {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid {
                    key,
                    reason: format!("expected a non-negative gain, got {value}"),
                });
            }
        }

        if self.min_speed > self.max_speed {
            return Err(ConfigError::Invalid {
                key: "min_speed",
                reason: format!(
                    "min_speed {} exceeds max_speed {}",
                    self.min_speed, self.max_speed
                ),
            });
        }
        // SetSpeed carries one byte per wheel
        let finest_tick = self.left_distance_per_tick.min(self.right_distance_per_tick);
        let top_ticks = speed_to_tick_speed(self.max_speed, finest_tick, self.loop_time);
        if top_ticks > u8::MAX as i64 {
            return Err(ConfigError::Invalid {
                key: "max_speed",
                reason: format!(
                    "max_speed {} needs {} ticks per loop, the device accepts at most {}",
                    self.max_speed,
                    top_ticks,
                    u8::MAX
                ),
            });
        }
        if self.max_rotation_speed > self.max_speed {
            return Err(ConfigError::Invalid {
                key: "max_rotation_speed",
                reason: format!(
                    "max_rotation_speed {} exceeds max_speed {}",
                    self.max_rotation_speed, self.max_speed
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> RobotConfig {
    RobotConfig {
        loop_time: 100.0,
        wheel_base: 189.7,
        left_distance_per_tick: 4.527,
        right_distance_per_tick: 4.527,
        min_speed: 50.0,
        max_speed: 400.0,
        max_rotation_speed: 200.0,
        acceleration: 500.0,
        acceleration_step: 50.0,
        heading_kp: 100.0,
        heading_ki: 0.0,
        heading_kd: 0.0,
        heading_source: HeadingSource::Odometry,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMPLETE: &str = r#"
        loop_time = 20.0
        wheel_base = 189.7
        encoder_cpr = 48.0
        gear_ratio = 46.85
        left_wheel_diameter = 69.14
        right_wheel_diameter = 69.14
        min_speed = 50.0
        max_speed = 400.0
        max_rotation_speed = 200.0
        acceleration = 500.0
        acceleration_step = 10.0
        heading_kp = 100.0
        heading_ki = 0.0
        heading_kd = 0.0
    "#;

    #[test]
    fn test_complete_config_derives_distance_per_tick() {
        let config = RobotConfig::from_toml_str(COMPLETE).unwrap();
        let expected = PI * 69.14 / (48.0 * 46.85);

        assert!((config.left_distance_per_tick - expected).abs() < 1e-12);
        assert!((config.right_distance_per_tick - expected).abs() < 1e-12);
        assert_eq!(config.heading_source, HeadingSource::Odometry);
    }

    #[test]
    fn test_missing_keys_are_all_listed() {
        let err = RobotConfig::from_toml_str("loop_time = 20.0\nwheel_base = 189.7\n").unwrap_err();
        match err {
            ConfigError::Missing(keys) => {
                assert!(keys.contains(&"left_distance_per_tick"));
                assert!(keys.contains(&"max_speed"));
                assert!(keys.contains(&"heading_kd"));
                assert!(!keys.contains(&"loop_time"));
                assert_eq!(keys.len(), 10);
            }
            other => panic!("expected Missing, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_message_lists_keys() {
        let err = ConfigError::Missing(vec!["wheel_base", "max_speed"]);
        assert_eq!(
            err.to_string(),
            "Config is not complete, missing: wheel_base, max_speed"
        );
    }

    #[test]
    fn test_zero_acceleration_rejected() {
        let text = COMPLETE.replace("acceleration = 500.0", "acceleration = 0.0");
        let err = RobotConfig::from_toml_str(&text).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "acceleration",
                ..
            }
        ));
    }

    #[test]
    fn test_max_speed_must_fit_speed_byte() {
        // 400 mm/s over a 100 ms loop at 0.0966 mm/tick is 414 ticks
        let text = COMPLETE.replace("loop_time = 20.0", "loop_time = 100.0");
        let err = RobotConfig::from_toml_str(&text).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "max_speed", .. }));

        let text = text.replace("max_speed = 400.0", "max_speed = 240.0");
        let config = RobotConfig::from_toml_str(&text).unwrap();
        assert_eq!(config.max_speed, 240.0);
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let config = RobotConfig::from_toml_str(include_str!("../robot.toml")).unwrap();
        assert_eq!(config.loop_time, 20.0);
        assert!((config.left_distance_per_tick - 0.0966).abs() < 1e-4);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let text = format!("{COMPLETE}\nwheel_radius = 3.0\n");
        assert!(matches!(
            RobotConfig::from_toml_str(&text),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_heading_source_parsed() {
        let text = format!("{COMPLETE}\nheading_source = \"fused\"\n");
        let config = RobotConfig::from_toml_str(&text).unwrap();
        assert_eq!(config.heading_source, HeadingSource::Fused);
    }
}
