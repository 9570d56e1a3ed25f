//! Driver-side sample handling: calibration correction and a synthetic IMU
//! source with known error terms.

use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tokio::sync::mpsc::{error::TrySendError, Sender};
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::calibration::CalibrationRecord;
use crate::config::STANDARD_GRAVITY;
use crate::types::ImuSample;

/// Apply a calibration record to a raw sample: `(raw - bias) ⊙ scale` per sensor.
pub fn apply_calibration(sample: &ImuSample, record: &CalibrationRecord) -> ImuSample {
    ImuSample::new(
        sample.timestamp,
        record.correct_accel(&sample.accel_vec()),
        record.correct_gyro(&sample.gyro_vec()),
    )
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotionProfile {
    /// Device lying still, level
    Stationary,
    /// Continuous slow tumble through many orientations
    Tumbling,
    /// Alternating still and tumbling intervals
    Mixed,
}

impl FromStr for MotionProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stationary" | "still" => Ok(MotionProfile::Stationary),
            "tumbling" | "tumble" => Ok(MotionProfile::Tumbling),
            "mixed" => Ok(MotionProfile::Mixed),
            other => Err(format!("unknown motion profile '{}'", other)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SyntheticImuConfig {
    pub dt: f64,
    pub gravity: f64,
    pub accel_bias: Vector3<f64>,
    /// Raw accel = true / scale + bias, so the calibrated scale recovers `accel_scale`
    pub accel_scale: Vector3<f64>,
    pub gyro_bias: Vector3<f64>,
    /// Peak amplitude of accel noise [m/s²]
    pub accel_noise: f64,
    /// Peak amplitude of gyro noise [rad/s]
    pub gyro_noise: f64,
    pub profile: MotionProfile,
    /// Mixed profile: length of each still interval [s]
    pub still_seconds: f64,
    /// Mixed profile: length of each tumbling interval [s]
    pub moving_seconds: f64,
}

impl Default for SyntheticImuConfig {
    fn default() -> Self {
        Self {
            dt: 0.01,
            gravity: STANDARD_GRAVITY,
            accel_bias: Vector3::new(0.15, -0.1, 0.2),
            accel_scale: Vector3::new(1.03, 0.98, 1.01),
            gyro_bias: Vector3::new(0.01, -0.005, 0.008),
            accel_noise: 0.02,
            gyro_noise: 0.002,
            profile: MotionProfile::Mixed,
            still_seconds: 3.0,
            moving_seconds: 7.0,
        }
    }
}

/// Deterministic IMU simulator.
///
/// Integrates a body attitude under a time-varying angular rate and reports the
/// specific force of gravity in the body frame, distorted by the configured
/// bias, scale and noise.
pub struct SyntheticImu {
    config: SyntheticImuConfig,
    attitude: UnitQuaternion<f64>,
    step: u64,
}

impl SyntheticImu {
    pub fn new(config: SyntheticImuConfig) -> Self {
        Self {
            config,
            attitude: UnitQuaternion::identity(),
            step: 0,
        }
    }

    pub fn config(&self) -> &SyntheticImuConfig {
        &self.config
    }

    pub fn elapsed(&self) -> f64 {
        self.step as f64 * self.config.dt
    }

    fn is_moving(&self, t: f64) -> bool {
        match self.config.profile {
            MotionProfile::Stationary => false,
            MotionProfile::Tumbling => true,
            MotionProfile::Mixed => {
                let period = self.config.still_seconds + self.config.moving_seconds;
                period > 0.0 && t.rem_euclid(period) >= self.config.still_seconds
            }
        }
    }

    fn true_rate(&self, t: f64) -> Vector3<f64> {
        if !self.is_moving(t) {
            return Vector3::zeros();
        }
        Vector3::new(
            0.8 * (0.31 * t).sin(),
            0.6 * (0.17 * t).cos(),
            0.4 * (0.23 * t + 1.0).sin(),
        )
    }

    /// Hash-style pseudo-noise in (-amplitude, amplitude), reproducible per step
    fn noise(&self, axis: usize, amplitude: f64) -> f64 {
        let k = self.step as f64;
        amplitude * ((k * 12.9898 + axis as f64 * 78.233).sin() * 43758.5453).fract()
    }

    pub fn next_sample(&mut self) -> ImuSample {
        let t = self.elapsed();
        let rate = self.true_rate(t);

        // Specific force of a body at rest in the world: gravity reaction, body frame
        let true_accel = self.attitude.inverse() * Vector3::new(0.0, 0.0, self.config.gravity);

        let accel_noise = Vector3::new(
            self.noise(0, self.config.accel_noise),
            self.noise(1, self.config.accel_noise),
            self.noise(2, self.config.accel_noise),
        );
        let gyro_noise = Vector3::new(
            self.noise(3, self.config.gyro_noise),
            self.noise(4, self.config.gyro_noise),
            self.noise(5, self.config.gyro_noise),
        );

        let distorted = true_accel.component_div(&self.config.accel_scale) + self.config.accel_bias;
        let accel = distorted + accel_noise;
        let gyro = rate + self.config.gyro_bias + gyro_noise;

        self.attitude *= UnitQuaternion::from_scaled_axis(rate * self.config.dt);
        self.step += 1;

        ImuSample::new(t, accel, gyro)
    }
}

impl Iterator for SyntheticImu {
    type Item = ImuSample;

    fn next(&mut self) -> Option<ImuSample> {
        Some(self.next_sample())
    }
}

/// Drive `source` at a fixed period and forward samples over `tx`.
/// Samples are dropped when the channel is full; the loop ends when it closes.
pub async fn sample_loop(tx: Sender<ImuSample>, mut source: SyntheticImu, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sample_count = 0u64;
    let mut dropped = 0u64;

    loop {
        ticker.tick().await;
        let sample = source.next_sample();

        match tx.try_send(sample) {
            Ok(_) => {
                sample_count += 1;
                if sample_count % 1000 == 0 {
                    log::debug!("[imu] {} samples ({} dropped)", sample_count, dropped);
                }
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("[imu] Channel closed after {} samples", sample_count);
                break;
            }
            Err(TrySendError::Full(_)) => {
                dropped += 1;
            }
        }
    }
}
