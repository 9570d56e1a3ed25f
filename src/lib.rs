//! IMU state estimation with online self-calibration.
//!
//! A 13-state quaternion EKF (attitude, position, velocity, gyro bias) driven
//! by gyro/accel samples, with the accelerometer doubling as an inclinometer,
//! and a calibrator that learns gyro bias, local gravity and accelerometer
//! bias/scale from a sliding window of raw readings.

pub mod calibration;
pub mod config;
pub mod error;
pub mod filters;
pub mod live_status;
pub mod optimize;
pub mod sensor_fusion;
pub mod sensors;
pub mod types;

pub use calibration::{CalibrationPhase, CalibrationRecord, SelfCalibrator};
pub use config::{
    CalibratorConfig, EkfConfig, FusionConfig, HermesConfig, OptimizerConfig, STANDARD_GRAVITY,
};
pub use error::{ConfigError, FilterError, FilterResult};
pub use filters::{AdaptiveEkf, EkfSnapshot};
pub use sensor_fusion::{FusionEvent, FusionSnapshot, SensorFusion};
pub use types::ImuSample;
