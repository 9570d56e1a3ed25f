// sensor_fusion.rs — Per-sample computation layer
//
// Everything in this module is independent of:
//   - tokio / async runtime
//   - the sensor bus and its driver
//   - file I/O and status output
//
// It takes raw IMU samples in, produces state estimates and events out.
// The binary's fixed-period loop is a thin wrapper around `SensorFusion::feed`,
// so the same code runs against recorded data, the synthetic source or a real
// device.

use std::time::{Duration, Instant};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::calibration::{
    CalibrationJob, CalibrationPhase, CalibrationRecord, CalibrationResult, CalibrationSummary,
    CalibrationWorker, SelfCalibrator,
};
use crate::config::{FusionConfig, HermesConfig};
use crate::error::FilterError;
use crate::filters::{AdaptiveEkf, EkfSnapshot};
use crate::sensors::apply_calibration;
use crate::types::{tuple3, ImuSample};

// ─── Events ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub enum FusionEvent {
    /// Newest sub-window became stationary (edge, not level)
    StationaryDetected {
        gravity_magnitude: f64,
        gyro_mean: (f64, f64, f64),
    },
    /// Window refilled and the fit was handed to the worker
    CalibrationQueued { pass: u64 },
    /// Window refilled while a fit was still in flight; this pass was dropped
    CalibrationSkipped { pass: u64 },
    CalibrationApplied {
        pass: u64,
        cost: f64,
        iterations: usize,
    },
    /// Fit failed, identity accel correction in effect
    CalibrationFallback {
        pass: u64,
        iterations: usize,
    },
    /// Pass ran before any stationary interval; gyro bias kept its previous value
    GyroBiasUndefined { pass: u64 },
    FilterRecovered {
        stage: &'static str,
        recoveries: u64,
        reason: String,
    },
    UpdateSkipped { reason: String },
    SampleRejected { timestamp: f64 },
}

// ─── Stats ───────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FusionStats {
    pub samples_processed: u64,
    /// Calibration results adopted (successful or fallback)
    pub calibration_updates: u64,
    pub calibrations_skipped: u64,
    pub samples_rejected: u64,
    pub updates_skipped: u64,
    pub filter_recoveries: u64,
    /// EMA of per-sample processing time [ms]
    pub avg_processing_time_ms: f64,
}

// ─── Fusion output snapshot ──────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FusionSnapshot {
    pub ekf: EkfSnapshot,
    /// Record currently applied to incoming samples
    pub calibration: CalibrationSummary,
    pub is_calibrated: bool,
    pub phase: CalibrationPhase,
    pub is_stationary: bool,
    pub calibration_in_flight: bool,
    pub stats: FusionStats,
}

// ─── The main fusion struct ──────────────────────────────────────────────────

pub struct SensorFusion {
    config: FusionConfig,
    ekf: AdaptiveEkf,
    calibrator: SelfCalibrator,
    /// `None` runs calibration inline
    worker: Option<CalibrationWorker>,
    /// Record used to correct raw samples; replaced only when a fit is adopted
    applied: CalibrationRecord,
    stats: FusionStats,
}

impl SensorFusion {
    pub fn new(config: HermesConfig) -> Self {
        let worker = if config.fusion.background_calibration {
            match CalibrationWorker::spawn() {
                Ok(worker) => Some(worker),
                Err(e) => {
                    warn!("Calibration worker unavailable ({}), calibrating inline", e);
                    None
                }
            }
        } else {
            None
        };

        let calibrator = SelfCalibrator::new(config.calibrator);
        let applied = calibrator.get_calibration();

        Self {
            ekf: AdaptiveEkf::new(config.ekf),
            calibrator,
            worker,
            applied,
            stats: FusionStats::default(),
            config: config.fusion,
        }
    }

    /// Seed the calibrator with a warm-up batch and calibrate on it immediately.
    pub fn warm_up<I>(&mut self, samples: I) -> Vec<FusionEvent>
    where
        I: IntoIterator<Item = ImuSample>,
    {
        let mut events = Vec::new();
        let batch = samples
            .into_iter()
            .filter(|s| s.is_finite())
            .map(|s| (s.accel_vec(), s.gyro_vec()));
        let passes = self.calibrator.extend(batch);

        if let Some(result) = self.calibrator.calibrate_now() {
            self.stats.calibration_updates += passes as u64 + 1;
            self.adopt_applied(&result, &mut events);
        }
        info!(
            "Warm-up: {} samples, calibrated={}",
            self.calibrator.window().len(),
            self.calibrator.is_calibrated()
        );
        events
    }

    /// Process one raw sample.
    pub fn feed(&mut self, sample: &ImuSample) -> Vec<FusionEvent> {
        let started = Instant::now();
        let mut events = Vec::new();

        if !sample.is_finite() {
            self.stats.samples_rejected += 1;
            events.push(FusionEvent::SampleRejected { timestamp: sample.timestamp });
            return events;
        }

        // 1. Calibrator sees raw readings
        let was_stationary = self.calibrator.is_stationary();
        let job = self.calibrator.ingest(sample.accel_vec(), sample.gyro_vec());
        if !was_stationary && self.calibrator.is_stationary() {
            if let Some(snapshot) = self.calibrator.last_stationary() {
                events.push(FusionEvent::StationaryDetected {
                    gravity_magnitude: snapshot.gravity_magnitude(),
                    gyro_mean: tuple3(&snapshot.gyro_mean),
                });
            }
        }
        if let Some(job) = job {
            self.dispatch(job, &mut events);
        }

        // 2. Adopt any finished background fit
        self.poll_worker(&mut events);

        // 3. Correct with the last applied record
        let corrected = if self.config.apply_calibration {
            apply_calibration(sample, &self.applied)
        } else {
            sample.clone()
        };

        // 4. Filter step
        self.step_filter(&corrected, &mut events);

        // 5. Stats
        self.stats.samples_processed += 1;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let alpha = self.config.processing_ema_alpha;
        self.stats.avg_processing_time_ms =
            (1.0 - alpha) * self.stats.avg_processing_time_ms + alpha * elapsed_ms;

        events
    }

    /// Wait up to `timeout` for an in-flight background fit and adopt it.
    pub fn finish_calibration(&mut self, timeout: Duration) -> Vec<FusionEvent> {
        let mut events = Vec::new();
        let result = match self.worker.as_ref() {
            Some(worker) if worker.is_busy() => worker.recv_timeout(timeout),
            Some(worker) => worker.try_recv(),
            None => None,
        };
        if let Some(result) = result {
            self.adopt(&result, &mut events);
        }
        events
    }

    fn dispatch(&mut self, job: CalibrationJob, events: &mut Vec<FusionEvent>) {
        let pass = job.id;
        match self.worker.as_mut() {
            Some(worker) => {
                if worker.submit(job) {
                    events.push(FusionEvent::CalibrationQueued { pass });
                } else {
                    self.stats.calibrations_skipped += 1;
                    warn!("Calibration pass {} skipped: previous fit still running", pass);
                    events.push(FusionEvent::CalibrationSkipped { pass });
                }
            }
            None => {
                let result = job.run();
                self.adopt(&result, events);
            }
        }
    }

    fn poll_worker(&mut self, events: &mut Vec<FusionEvent>) {
        let Some(worker) = self.worker.as_ref() else {
            return;
        };
        let finished: Vec<CalibrationResult> = std::iter::from_fn(|| worker.try_recv()).collect();
        for result in finished {
            self.adopt(&result, events);
        }
    }

    fn adopt(&mut self, result: &CalibrationResult, events: &mut Vec<FusionEvent>) {
        self.calibrator.apply_result(result);
        self.stats.calibration_updates += 1;
        self.adopt_applied(result, events);
    }

    /// Take over the calibrator's record after `result` was applied to it.
    fn adopt_applied(&mut self, result: &CalibrationResult, events: &mut Vec<FusionEvent>) {
        self.applied = self.calibrator.get_calibration();

        if result.gyro_bias.is_none() {
            events.push(FusionEvent::GyroBiasUndefined { pass: result.id });
        }
        if result.fit.fallback_used {
            events.push(FusionEvent::CalibrationFallback {
                pass: result.id,
                iterations: result.fit.iterations,
            });
        } else {
            events.push(FusionEvent::CalibrationApplied {
                pass: result.id,
                cost: result.fit.cost,
                iterations: result.fit.iterations,
            });
        }

        if self.config.sync_gravity {
            self.ekf.set_gravity(self.applied.gravity_magnitude);
        }
    }

    fn step_filter(&mut self, sample: &ImuSample, events: &mut Vec<FusionEvent>) {
        let accel = sample.accel_vec();
        let gyro = sample.gyro_vec();

        match self.ekf.predict(&gyro, &accel) {
            Ok(()) => {}
            Err(FilterError::NumericalInstability(reason)) => {
                self.record_recovery("predict", reason, events);
            }
            Err(e) => {
                self.stats.updates_skipped += 1;
                events.push(FusionEvent::UpdateSkipped { reason: e.to_string() });
                return;
            }
        }

        match self.ekf.update(&accel) {
            Ok(_) => {}
            Err(FilterError::NumericalInstability(reason)) => {
                self.record_recovery("update", reason, events);
            }
            Err(e) => {
                self.stats.updates_skipped += 1;
                events.push(FusionEvent::UpdateSkipped { reason: e.to_string() });
            }
        }
    }

    fn record_recovery(
        &mut self,
        stage: &'static str,
        reason: String,
        events: &mut Vec<FusionEvent>,
    ) {
        self.stats.filter_recoveries += 1;
        events.push(FusionEvent::FilterRecovered {
            stage,
            recoveries: self.ekf.recovery_count(),
            reason,
        });
    }

    // ─── Read-only views ─────────────────────────────────────────────────────

    pub fn snapshot(&self) -> FusionSnapshot {
        FusionSnapshot {
            ekf: self.ekf.snapshot(),
            calibration: self.applied.summary(),
            is_calibrated: self.calibrator.is_calibrated(),
            phase: self.calibrator.phase(),
            is_stationary: self.calibrator.is_stationary(),
            calibration_in_flight: self.calibration_in_flight(),
            stats: self.stats.clone(),
        }
    }

    pub fn calibration_in_flight(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| w.is_busy())
    }

    /// Record currently applied to raw samples
    pub fn applied_calibration(&self) -> &CalibrationRecord {
        &self.applied
    }

    pub fn ekf(&self) -> &AdaptiveEkf {
        &self.ekf
    }

    pub fn calibrator(&self) -> &SelfCalibrator {
        &self.calibrator
    }

    pub fn stats(&self) -> &FusionStats {
        &self.stats
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }
}
