//! Runtime configuration for the filter, the calibrator and the fusion loop.
//!
//! Every struct implements `Default` with the constants the system ships with,
//! and deserializes with `#[serde(default)]` so a JSON file only needs the keys
//! it overrides.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;

/// Standard gravity [m/s²]. Shared default for the EKF gravity model and the
/// calibrator's initial gravity magnitude.
pub const STANDARD_GRAVITY: f64 = 9.81;

// ─── EKF ─────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EkfConfig {
    /// Fixed integration step [s] (100 Hz)
    pub dt: f64,
    /// Gravity magnitude used by predict and the inclinometer model [m/s²]
    pub gravity: f64,
    /// Prior covariance diagonal
    pub initial_covariance: f64,
    /// Initial process noise diagonal
    pub initial_process_noise: f64,
    /// Accelerometer-as-inclinometer measurement variance
    pub measurement_noise: f64,
    /// Q multiplier when innovation energy exceeds the gate
    pub noise_inflation: f64,
    /// Q multiplier otherwise
    pub noise_deflation: f64,
    /// Element-wise lower bound for the Q diagonal
    pub noise_floor: f64,
    /// Gate on yᵗy as a multiple of tr(S)
    pub innovation_gate: f64,
    /// Near-zero quaternion norm below which the rotation helper returns identity
    pub min_quat_norm: f64,
}

impl Default for EkfConfig {
    fn default() -> Self {
        Self {
            dt: 0.01,
            gravity: STANDARD_GRAVITY,
            initial_covariance: 0.1,
            initial_process_noise: 0.001,
            measurement_noise: 0.01,
            noise_inflation: 1.01,
            noise_deflation: 0.999,
            noise_floor: 1e-6,
            innovation_gate: 2.0,
            min_quat_norm: 1e-10,
        }
    }
}

impl EkfConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("ekf.dt", self.dt)?;
        positive("ekf.gravity", self.gravity)?;
        positive("ekf.initial_covariance", self.initial_covariance)?;
        positive("ekf.initial_process_noise", self.initial_process_noise)?;
        positive("ekf.measurement_noise", self.measurement_noise)?;
        positive("ekf.noise_floor", self.noise_floor)?;
        positive("ekf.innovation_gate", self.innovation_gate)?;
        positive("ekf.min_quat_norm", self.min_quat_norm)?;
        if self.noise_inflation < 1.0 {
            return Err(invalid("ekf.noise_inflation", "must be >= 1.0"));
        }
        if !(self.noise_deflation > 0.0 && self.noise_deflation <= 1.0) {
            return Err(invalid("ekf.noise_deflation", "must be in (0, 1]"));
        }
        Ok(())
    }
}

// ─── Optimizer ───────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Hard cap on simplex iterations; the fit always terminates
    pub max_iterations: usize,
    /// Convergence tolerance on vertex spread (parameter space)
    pub xatol: f64,
    /// Convergence tolerance on cost spread
    pub fatol: f64,
    /// Relative step for non-zero seed components when building the simplex
    pub initial_step: f64,
    /// Absolute step for zero seed components
    pub zero_step: f64,
    /// Dimension-dependent reflection/expansion/contraction coefficients
    pub adaptive: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5000,
            xatol: 1e-8,
            fatol: 1e-4,
            initial_step: 0.05,
            zero_step: 0.05,
            adaptive: true,
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations == 0 {
            return Err(invalid("optimizer.max_iterations", "must be > 0"));
        }
        positive("optimizer.xatol", self.xatol)?;
        positive("optimizer.fatol", self.fatol)?;
        positive("optimizer.initial_step", self.initial_step)?;
        positive("optimizer.zero_step", self.zero_step)?;
        Ok(())
    }
}

// ─── Calibrator ──────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibratorConfig {
    /// Sliding window capacity (samples)
    pub window_size: usize,
    /// Stationarity detection starts once the window holds more than this
    pub min_samples: usize,
    /// Sub-window length used for the variance test
    pub stationary_window: usize,
    /// Mean per-axis accel variance bound [(m/s²)²]
    pub stationary_threshold: f64,
    /// Mean per-axis gyro variance bound [(rad/s)²]
    pub gyro_threshold: f64,
    /// Gravity magnitude before any stationary interval is seen [m/s²]
    pub default_gravity: f64,
    pub optimizer: OptimizerConfig,
}

impl Default for CalibratorConfig {
    fn default() -> Self {
        Self {
            window_size: 1000,
            min_samples: 100,
            stationary_window: 50,
            stationary_threshold: 0.05,
            gyro_threshold: 0.001,
            default_gravity: STANDARD_GRAVITY,
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl CalibratorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size == 0 {
            return Err(invalid("calibrator.window_size", "must be > 0"));
        }
        if self.min_samples >= self.window_size {
            return Err(invalid(
                "calibrator.min_samples",
                format!("must be below window_size ({})", self.window_size),
            ));
        }
        if self.stationary_window < 2 {
            return Err(invalid("calibrator.stationary_window", "must be >= 2"));
        }
        if self.stationary_window > self.window_size {
            return Err(invalid(
                "calibrator.stationary_window",
                format!("must not exceed window_size ({})", self.window_size),
            ));
        }
        positive("calibrator.stationary_threshold", self.stationary_threshold)?;
        positive("calibrator.gyro_threshold", self.gyro_threshold)?;
        positive("calibrator.default_gravity", self.default_gravity)?;
        self.optimizer.validate()
    }
}

// ─── Fusion loop ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Run the calibration fit on a worker thread with a window snapshot
    pub background_calibration: bool,
    /// Correct raw samples with the latest applied calibration before the EKF
    pub apply_calibration: bool,
    /// Push the calibrator's learned gravity magnitude into the EKF gravity model
    pub sync_gravity: bool,
    /// Weight of the newest sample in the processing-time EMA
    pub processing_ema_alpha: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            background_calibration: true,
            apply_calibration: true,
            sync_gravity: false,
            processing_ema_alpha: 0.01,
        }
    }
}

// ─── Top level ───────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HermesConfig {
    pub ekf: EkfConfig,
    pub calibrator: CalibratorConfig,
    pub fusion: FusionConfig,
}

impl HermesConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: HermesConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ekf.validate()?;
        self.calibrator.validate()?;
        if !(self.fusion.processing_ema_alpha > 0.0 && self.fusion.processing_ema_alpha <= 1.0) {
            return Err(invalid("fusion.processing_ema_alpha", "must be in (0, 1]"));
        }
        Ok(())
    }
}

fn invalid(parameter: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidParameter {
        parameter,
        message: message.into(),
    }
}

fn positive(parameter: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(invalid(parameter, format!("must be finite and > 0, got {}", value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(HermesConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = HermesConfig::from_json_str(r#"{ "calibrator": { "window_size": 400 } }"#)
            .expect("partial config should parse");
        assert_eq!(config.calibrator.window_size, 400);
        assert_eq!(config.calibrator.stationary_window, 50);
        assert_eq!(config.ekf.dt, 0.01);
    }

    #[test]
    fn test_rejects_stationary_window_larger_than_window() {
        let result = HermesConfig::from_json_str(
            r#"{ "calibrator": { "window_size": 20, "min_samples": 10, "stationary_window": 50 } }"#,
        );
        assert!(matches!(
            result,
            Err(ConfigError::InvalidParameter { parameter: "calibrator.stationary_window", .. })
        ));
    }

    #[test]
    fn test_rejects_min_samples_at_or_above_window() {
        let mut config = HermesConfig::default();
        config.calibrator.window_size = 100;
        config.calibrator.min_samples = 100;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidParameter { parameter: "calibrator.min_samples", .. })
        ));

        config.calibrator.min_samples = 99;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_non_positive_min_quat_norm() {
        let mut config = HermesConfig::default();
        config.ekf.min_quat_norm = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_non_positive_dt() {
        let mut config = HermesConfig::default();
        config.ekf.dt = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            HermesConfig::from_json_str("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
