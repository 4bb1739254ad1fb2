//! Tunables for the hover pipeline.
//!
//! Every section has a `Default` carrying the flight-tested values, so a JSON
//! file only needs to name the fields it overrides.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::filter;

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
#[serde(default)]
pub struct HoverConfig {
    pub fusion: FusionConfig,
    pub filter: FilterConfig,
    pub pid: PidConfig,
    pub control: LoopConfig,
    pub serial: SerialConfig,
}

impl HoverConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: HoverConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.filter.validate()?;
        self.pid.validate()?;
        self.control.validate()?;
        self.serial.validate()
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct FusionConfig {
    /// Streaming id of the rigid body mounted on the vehicle.
    pub rigid_body_id: i32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self { rigid_body_id: 1 }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct FilterConfig {
    pub window_size: usize,
    pub velocity_window: usize,
    /// Base displacement (m) beyond which a sample is rejected.
    pub outlier_threshold: f64,
    /// Upper bound for the adaptive threshold (m).
    pub max_outlier_threshold: f64,
    pub enable_prediction: bool,
    /// When false the base threshold is used unchanged.
    pub adaptive_threshold: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            window_size: 5,
            velocity_window: 3,
            outlier_threshold: 0.1,
            max_outlier_threshold: 0.4,
            enable_prediction: true,
            adaptive_threshold: true,
        }
    }
}

impl FilterConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size == 0 {
            return Err(ConfigError::invalid("filter.window_size", "must be at least 1"));
        }
        if self.velocity_window < 2 {
            return Err(ConfigError::invalid(
                "filter.velocity_window",
                "must be at least 2",
            ));
        }
        if !(self.outlier_threshold > 0.0) {
            return Err(ConfigError::invalid(
                "filter.outlier_threshold",
                format!("must be positive, got {}", self.outlier_threshold),
            ));
        }
        if !self.max_outlier_threshold.is_finite() {
            return Err(ConfigError::invalid(
                "filter.max_outlier_threshold",
                "must be finite",
            ));
        }
        let floor = filter::min_threshold(self.outlier_threshold);
        if self.max_outlier_threshold < floor {
            return Err(ConfigError::invalid(
                "filter.max_outlier_threshold",
                format!(
                    "must be at least {floor} (the adaptive floor), got {}",
                    self.max_outlier_threshold
                ),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct PidConfig {
    // Roll uses these gains as-is; pitch uses them negated.
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    /// Symmetric command limit in radians.
    pub output_limit: f64,
    pub d_filter_alpha: f64,
    pub i_decay_rate: f64,
    /// Integral only accumulates while |error| is below this (m).
    pub i_update_threshold: f64,
    pub enable_i_control: bool,
    /// Calls after an anomaly clears during which the integrator only decays.
    pub anomaly_recovery_ticks: u32,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            kp: 0.139,
            ki: 0.020,
            kd: 0.204,
            output_limit: 0.087,
            d_filter_alpha: 0.6,
            i_decay_rate: 0.98,
            i_update_threshold: 0.3,
            enable_i_control: true,
            anomaly_recovery_ticks: 10,
        }
    }
}

impl PidConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [("pid.kp", self.kp), ("pid.ki", self.ki), ("pid.kd", self.kd)] {
            if !value.is_finite() {
                return Err(ConfigError::invalid(field, "must be finite"));
            }
        }
        if !(self.output_limit > 0.0 && self.output_limit < std::f64::consts::FRAC_PI_2) {
            return Err(ConfigError::invalid(
                "pid.output_limit",
                format!("must be in (0, pi/2), got {}", self.output_limit),
            ));
        }
        if !(0.0..1.0).contains(&self.d_filter_alpha) {
            return Err(ConfigError::invalid("pid.d_filter_alpha", "must be in [0, 1)"));
        }
        if !(self.i_decay_rate > 0.0 && self.i_decay_rate <= 1.0) {
            return Err(ConfigError::invalid("pid.i_decay_rate", "must be in (0, 1]"));
        }
        if !(self.i_update_threshold > 0.0) {
            return Err(ConfigError::invalid(
                "pid.i_update_threshold",
                "must be positive",
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct LoopConfig {
    pub rate_hz: f64,
    /// Below this confidence the command is forced to level.
    pub confidence_floor: f64,
    /// Below this confidence the command is scaled by confidence.
    pub full_confidence: f64,
    pub arm_timeout_s: f64,
    pub join_grace_s: f64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            rate_hz: 100.0,
            confidence_floor: 0.2,
            full_confidence: 0.99,
            arm_timeout_s: 3.0,
            join_grace_s: 2.0,
        }
    }
}

impl LoopConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate_hz)
    }

    pub fn arm_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.arm_timeout_s)
    }

    pub fn join_grace(&self) -> Duration {
        Duration::from_secs_f64(self.join_grace_s)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.rate_hz > 0.0 && self.rate_hz <= 1000.0) {
            return Err(ConfigError::invalid(
                "control.rate_hz",
                format!("must be in (0, 1000], got {}", self.rate_hz),
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence_floor)
            || !(0.0..=1.0).contains(&self.full_confidence)
            || self.confidence_floor > self.full_confidence
        {
            return Err(ConfigError::invalid(
                "control.confidence_floor",
                "floor and full confidence must satisfy 0 <= floor <= full <= 1",
            ));
        }
        let bounded = |t: f64| t >= 0.0 && t.is_finite();
        if !bounded(self.arm_timeout_s) || !bounded(self.join_grace_s) {
            return Err(ConfigError::invalid(
                "control.arm_timeout_s",
                "timeouts must be finite and non-negative",
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct SerialConfig {
    /// Device path; `None` picks the platform default.
    pub port: Option<String>,
    pub baud_rate: u32,
    pub write_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 115200,
            write_timeout_ms: 10,
        }
    }
}

impl SerialConfig {
    pub fn port_name(&self) -> String {
        self.port.clone().unwrap_or_else(|| default_port().to_string())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.baud_rate == 0 {
            return Err(ConfigError::invalid("serial.baud_rate", "must be non-zero"));
        }
        Ok(())
    }
}

fn default_port() -> &'static str {
    if cfg!(target_os = "windows") {
        "COM3"
    } else if cfg!(target_os = "macos") {
        "/dev/cu.usbserial-1110"
    } else {
        "/dev/ttyUSB0"
    }
}
