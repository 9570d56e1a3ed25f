//! Online self-calibration of accelerometer and gyroscope errors.
//!
//! `SelfCalibrator` keeps a sliding window of raw samples, watches the newest
//! part of it for stationary intervals (gyro bias and local gravity), and each
//! time the window refills runs a bias/scale fit over every accel sample.
//!
//! The fit is the only expensive step. `add_sample` runs it inline;
//! `ingest` instead hands back a [`CalibrationJob`] holding a copy of the
//! window so the fit can run elsewhere (see [`worker::CalibrationWorker`])
//! while the caller keeps using the last applied record.

pub mod fit;
pub mod stationary;
pub mod window;
pub mod worker;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::config::{CalibratorConfig, OptimizerConfig};
use crate::types::tuple3;

pub use fit::{calibration_cost, fit_accel_calibration, FitOutcome};
pub use stationary::{StationaryDetector, StationarySnapshot};
pub use window::{SamplePair, SampleWindow};
pub use worker::CalibrationWorker;

/// Corrections the sensor driver applies to raw readings:
/// `corrected = (raw - bias) ⊙ scale`.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationRecord {
    pub accel_bias: Vector3<f64>,
    pub gyro_bias: Vector3<f64>,
    pub accel_scale: Vector3<f64>,
    /// Never estimated; stays at unity
    pub gyro_scale: Vector3<f64>,
    /// Local gravity magnitude [m/s²], learned from stationary intervals
    pub gravity_magnitude: f64,
    /// Accel variance bound used by the stationarity test
    pub stationary_threshold: f64,
}

impl CalibrationRecord {
    pub fn new(gravity_magnitude: f64, stationary_threshold: f64) -> Self {
        Self {
            accel_bias: Vector3::zeros(),
            gyro_bias: Vector3::zeros(),
            accel_scale: Vector3::repeat(1.0),
            gyro_scale: Vector3::repeat(1.0),
            gravity_magnitude,
            stationary_threshold,
        }
    }

    pub fn correct_accel(&self, raw: &Vector3<f64>) -> Vector3<f64> {
        (raw - self.accel_bias).component_mul(&self.accel_scale)
    }

    pub fn correct_gyro(&self, raw: &Vector3<f64>) -> Vector3<f64> {
        (raw - self.gyro_bias).component_mul(&self.gyro_scale)
    }

    pub fn summary(&self) -> CalibrationSummary {
        CalibrationSummary {
            accel_bias: tuple3(&self.accel_bias),
            gyro_bias: tuple3(&self.gyro_bias),
            accel_scale: tuple3(&self.accel_scale),
            gyro_scale: tuple3(&self.gyro_scale),
            gravity_magnitude: self.gravity_magnitude,
            stationary_threshold: self.stationary_threshold,
        }
    }
}

impl Default for CalibrationRecord {
    fn default() -> Self {
        let config = CalibratorConfig::default();
        Self::new(config.default_gravity, config.stationary_threshold)
    }
}

/// Serializable view of a [`CalibrationRecord`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSummary {
    pub accel_bias: (f64, f64, f64),
    pub gyro_bias: (f64, f64, f64),
    pub accel_scale: (f64, f64, f64),
    pub gyro_scale: (f64, f64, f64),
    pub gravity_magnitude: f64,
    pub stationary_threshold: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalibrationPhase {
    /// No stationary interval seen, no successful fit yet
    Collecting,
    /// Gyro bias and gravity are known, accel fit pending or failed
    StationaryDetected,
    /// Last accel fit succeeded
    Calibrated,
}

/// Everything a fit needs, detached from the calibrator.
#[derive(Clone, Debug)]
pub struct CalibrationJob {
    /// Monotonic pass number, starting at 1
    pub id: u64,
    /// Copy of the window at trigger time, oldest first
    pub samples: Vec<SamplePair>,
    pub gravity: f64,
    /// Gyro mean of the last stationary interval, if any was seen
    pub stationary_gyro: Option<Vector3<f64>>,
    pub optimizer: OptimizerConfig,
}

impl CalibrationJob {
    /// Run the accel fit. Pure: touches nothing but the job's own data.
    pub fn run(&self) -> CalibrationResult {
        let accels: Vec<Vector3<f64>> = self.samples.iter().map(|(a, _)| *a).collect();
        let fit = fit_accel_calibration(&accels, self.gravity, &self.optimizer);
        CalibrationResult {
            id: self.id,
            fit,
            gyro_bias: self.stationary_gyro,
            gravity: self.gravity,
            sample_count: self.samples.len(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationResult {
    pub id: u64,
    pub fit: FitOutcome,
    /// `None` when no stationary interval preceded the pass
    pub gyro_bias: Option<Vector3<f64>>,
    pub gravity: f64,
    pub sample_count: usize,
}

pub struct SelfCalibrator {
    config: CalibratorConfig,
    window: SampleWindow,
    detector: StationaryDetector,
    record: CalibrationRecord,
    /// Most recent stationary interval
    stationary: Option<StationarySnapshot>,
    /// Whether the latest detection check passed
    is_stationary: bool,
    is_calibrated: bool,
    /// Window has filled at least once
    filled_once: bool,
    /// Samples ingested since the last window-fill pass
    since_last_pass: usize,
    jobs_issued: u64,
    calibration_count: usize,
}

impl SelfCalibrator {
    pub fn new(config: CalibratorConfig) -> Self {
        let window = SampleWindow::new(config.window_size);
        let detector = StationaryDetector::new(
            config.stationary_window,
            config.stationary_threshold,
            config.gyro_threshold,
        );
        let record = CalibrationRecord::new(config.default_gravity, config.stationary_threshold);

        Self {
            config,
            window,
            detector,
            record,
            stationary: None,
            is_stationary: false,
            is_calibrated: false,
            filled_once: false,
            since_last_pass: 0,
            jobs_issued: 0,
            calibration_count: 0,
        }
    }

    /// Append a sample and, when the window refills, calibrate inline.
    /// Returns the result of the pass if one ran.
    pub fn add_sample(
        &mut self,
        accel: Vector3<f64>,
        gyro: Vector3<f64>,
    ) -> Option<CalibrationResult> {
        let job = self.ingest(accel, gyro)?;
        let result = job.run();
        self.apply_result(&result);
        Some(result)
    }

    /// Append a sample and run stationarity detection. When the window
    /// refills, returns a job to run instead of fitting inline.
    pub fn ingest(&mut self, accel: Vector3<f64>, gyro: Vector3<f64>) -> Option<CalibrationJob> {
        self.window.push(accel, gyro);
        if self.filled_once {
            self.since_last_pass += 1;
        }

        if self.window.len() > self.config.min_samples {
            self.detect_stationary();
        }

        let due = self.window.is_full()
            && (!self.filled_once || self.since_last_pass >= self.window.capacity());
        if due {
            self.filled_once = true;
            self.since_last_pass = 0;
            Some(self.make_job())
        } else {
            None
        }
    }

    /// Bulk ingestion (warm-up batch), calibrating inline on each refill.
    /// Returns the number of passes that ran.
    pub fn extend<I>(&mut self, samples: I) -> usize
    where
        I: IntoIterator<Item = (Vector3<f64>, Vector3<f64>)>,
    {
        samples
            .into_iter()
            .filter_map(|(accel, gyro)| self.add_sample(accel, gyro))
            .count()
    }

    /// Calibrate over whatever the window holds right now.
    pub fn calibrate_now(&mut self) -> Option<CalibrationResult> {
        if self.window.is_empty() {
            log::warn!("Calibration requested with an empty window");
            return None;
        }
        let result = self.make_job().run();
        self.apply_result(&result);
        Some(result)
    }

    /// Adopt a finished fit.
    pub fn apply_result(&mut self, result: &CalibrationResult) {
        match result.gyro_bias {
            Some(bias) => self.record.gyro_bias = bias,
            None => log::warn!(
                "Calibration pass {}: no stationary interval yet, gyro bias left at ({:.5}, {:.5}, {:.5})",
                result.id,
                self.record.gyro_bias.x,
                self.record.gyro_bias.y,
                self.record.gyro_bias.z
            ),
        }

        if result.fit.fallback_used {
            self.record.accel_bias = Vector3::zeros();
            self.record.accel_scale = Vector3::repeat(1.0);
            self.is_calibrated = false;
            log::warn!(
                "Calibration pass {}: accel fit failed after {} iterations, using identity correction",
                result.id,
                result.fit.iterations
            );
        } else {
            self.record.accel_bias = result.fit.bias;
            self.record.accel_scale = result.fit.scale;
            self.is_calibrated = true;
            log::info!(
                "Calibration pass {} complete: {} samples, {} iterations, cost {:.3e}",
                result.id,
                result.sample_count,
                result.fit.iterations,
                result.fit.cost
            );
        }

        self.calibration_count += 1;
    }

    fn detect_stationary(&mut self) {
        match self.detector.detect(&self.window) {
            Some(snapshot) => {
                if !self.is_stationary {
                    log::debug!(
                        "Stationary interval: |g| = {:.4}, gyro mean = ({:.5}, {:.5}, {:.5})",
                        snapshot.gravity_magnitude(),
                        snapshot.gyro_mean.x,
                        snapshot.gyro_mean.y,
                        snapshot.gyro_mean.z
                    );
                }
                self.record.gravity_magnitude = snapshot.gravity_magnitude();
                self.stationary = Some(snapshot);
                self.is_stationary = true;
            }
            None => self.is_stationary = false,
        }
    }

    fn make_job(&mut self) -> CalibrationJob {
        self.jobs_issued += 1;
        CalibrationJob {
            id: self.jobs_issued,
            samples: self.window.to_vec(),
            gravity: self.record.gravity_magnitude,
            stationary_gyro: self.stationary.map(|s| s.gyro_mean),
            optimizer: self.config.optimizer.clone(),
        }
    }

    /// Owned copy of the current calibration record.
    pub fn get_calibration(&self) -> CalibrationRecord {
        self.record.clone()
    }

    pub fn is_calibrated(&self) -> bool {
        self.is_calibrated
    }

    pub fn phase(&self) -> CalibrationPhase {
        if self.is_calibrated {
            CalibrationPhase::Calibrated
        } else if self.stationary.is_some() {
            CalibrationPhase::StationaryDetected
        } else {
            CalibrationPhase::Collecting
        }
    }

    /// True while the newest sub-window passes the stationarity test
    pub fn is_stationary(&self) -> bool {
        self.is_stationary
    }

    pub fn last_stationary(&self) -> Option<&StationarySnapshot> {
        self.stationary.as_ref()
    }

    pub fn calibration_count(&self) -> usize {
        self.calibration_count
    }

    pub fn window(&self) -> &SampleWindow {
        &self.window
    }

    pub fn config(&self) -> &CalibratorConfig {
        &self.config
    }
}

impl Default for SelfCalibrator {
    fn default() -> Self {
        Self::new(CalibratorConfig::default())
    }
}
