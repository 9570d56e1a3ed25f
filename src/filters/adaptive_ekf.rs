//! 13-Dimensional Adaptive Extended Kalman Filter
//!
//! State Vector (13D):
//! [0-3]:   Quaternion (qw, qx, qy, qz), body-to-world attitude
//! [4-6]:   Position (X, Y, Z) in world frame (meters), dead-reckoned
//! [7-9]:   Velocity (Vx, Vy, Vz) in world frame (m/s), dead-reckoned
//! [10-12]: Gyro Bias (bx, by, bz) in body frame (rad/s)
//!
//! Predict integrates gyro kinematics and world-frame linear acceleration.
//! Update treats the accelerometer as an inclinometer (gravity direction only)
//! and scales the process noise up or down from the innovation energy.

use log::{debug, warn};
use nalgebra::{Cholesky, Matrix4, Vector3, Vector4};
use serde::{Deserialize, Serialize};

use crate::config::EkfConfig;
use crate::error::{FilterError, FilterResult};
use crate::filters::quaternion;
use crate::types::{
    tuple3, AccelNoise, JacobianAccel, KalmanGainAccel, StateMat13, StateVec13, IDX_BIAS,
    IDX_POS, IDX_QUAT, IDX_VEL, STATE_DIM_13,
};

/// Named view of the 13-element state vector.
#[derive(Clone, Debug, PartialEq)]
pub struct FilterState {
    /// Unit quaternion (w, x, y, z)
    pub orientation: Vector4<f64>,
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
    pub gyro_bias: Vector3<f64>,
}

impl Default for FilterState {
    fn default() -> Self {
        Self {
            orientation: quaternion::identity(),
            position: Vector3::zeros(),
            velocity: Vector3::zeros(),
            gyro_bias: Vector3::zeros(),
        }
    }
}

impl FilterState {
    pub fn to_vector(&self) -> StateVec13 {
        let mut x = StateVec13::zeros();
        x.fixed_rows_mut::<4>(IDX_QUAT).copy_from(&self.orientation);
        x.fixed_rows_mut::<3>(IDX_POS).copy_from(&self.position);
        x.fixed_rows_mut::<3>(IDX_VEL).copy_from(&self.velocity);
        x.fixed_rows_mut::<3>(IDX_BIAS).copy_from(&self.gyro_bias);
        x
    }

    pub fn from_vector(x: &StateVec13) -> Self {
        Self {
            orientation: x.fixed_rows::<4>(IDX_QUAT).into_owned(),
            position: x.fixed_rows::<3>(IDX_POS).into_owned(),
            velocity: x.fixed_rows::<3>(IDX_VEL).into_owned(),
            gyro_bias: x.fixed_rows::<3>(IDX_BIAS).into_owned(),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.orientation
            .iter()
            .chain(self.position.iter())
            .chain(self.velocity.iter())
            .chain(self.gyro_bias.iter())
            .all(|v| v.is_finite())
    }
}

/// Outcome of one measurement update.
#[derive(Clone, Copy, Debug)]
pub struct Innovation {
    /// y = z − h(q)
    pub residual: Vector3<f64>,
    /// yᵗ·y
    pub energy: f64,
    /// tr(S)
    pub trace_s: f64,
    /// Whether Q was inflated on this update
    pub inflated: bool,
}

/// Read-only copy of the filter state for downstream consumers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EkfSnapshot {
    /// Quaternion (w, x, y, z) representing attitude
    pub quaternion: (f64, f64, f64, f64),

    /// Roll, pitch, yaw [deg]
    pub euler_deg: (f64, f64, f64),

    /// Position in world frame [meters]
    pub position: (f64, f64, f64),

    /// Velocity in world frame [m/s]
    pub velocity: (f64, f64, f64),

    /// Gyro bias estimate [rad/s]
    pub gyro_bias: (f64, f64, f64),

    /// Covariance trace for uncertainty
    pub covariance_trace: f64,

    /// Process noise trace (adaptive)
    pub process_noise_trace: f64,

    /// Update counters
    pub predict_count: u64,
    pub update_count: u64,
    pub recovery_count: u64,
}

pub struct AdaptiveEkf {
    config: EkfConfig,

    /// State estimate
    state: FilterState,

    /// Last state that passed the health check
    last_good: FilterState,

    /// Covariance matrix [13x13]
    covariance: StateMat13,

    /// Adaptive process noise matrix [13x13]
    process_noise: StateMat13,

    /// Accelerometer measurement noise [3x3], fixed
    measurement_noise: AccelNoise,

    /// Update counters
    predict_count: u64,
    update_count: u64,
    recovery_count: u64,
}

impl AdaptiveEkf {
    pub fn new(config: EkfConfig) -> Self {
        let measurement_noise = AccelNoise::identity() * config.measurement_noise;
        Self {
            covariance: Self::prior_covariance(&config),
            process_noise: Self::initial_process_noise(&config),
            measurement_noise,
            state: FilterState::default(),
            last_good: FilterState::default(),
            predict_count: 0,
            update_count: 0,
            recovery_count: 0,
            config,
        }
    }

    fn prior_covariance(config: &EkfConfig) -> StateMat13 {
        StateMat13::identity() * config.initial_covariance
    }

    fn initial_process_noise(config: &EkfConfig) -> StateMat13 {
        StateMat13::identity() * config.initial_process_noise
    }

    /// Prediction step with raw (or driver-corrected) gyro and accel.
    ///
    /// The accelerometer is rotated with the attitude from *before* this step.
    pub fn predict(&mut self, gyro: &Vector3<f64>, accel: &Vector3<f64>) -> FilterResult<()> {
        if !gyro.iter().chain(accel.iter()).all(|v| v.is_finite()) {
            return Err(FilterError::InvalidInput(format!(
                "predict gyro={:?} accel={:?}",
                gyro.as_slice(),
                accel.as_slice()
            )));
        }

        let dt = self.config.dt;
        let q = self.state.orientation;

        // Bias-corrected body rate
        let omega = gyro - self.state.gyro_bias;

        // Quaternion kinematics: q += ½·Ω(ω)·q·dt, then back onto the unit sphere
        let q_dot = quaternion::omega_matrix(&omega) * q * 0.5;
        let q_next = quaternion::normalize(&(q + q_dot * dt), self.config.min_quat_norm);

        // Body accel -> world accel (minus gravity), pre-update attitude
        let r = quaternion::rotation_matrix(&q, self.config.min_quat_norm);
        let accel_world = r * accel - Vector3::new(0.0, 0.0, self.config.gravity);

        // Kinematics: velocity first, then position from the new velocity
        self.state.velocity += accel_world * dt;
        self.state.position += self.state.velocity * dt;
        self.state.orientation = q_next;

        // Covariance prediction: P = F * P * F^T + Q
        let f = self.transition_jacobian(&omega);
        self.covariance = f * self.covariance * f.transpose() + self.process_noise;

        self.predict_count += 1;
        self.check_health("predict")
    }

    /// State-transition Jacobian.
    ///
    /// Only the quaternion block (w.r.t. the corrected rate) and
    /// position-from-velocity are linearized; every other partial is identity/zero.
    fn transition_jacobian(&self, omega: &Vector3<f64>) -> StateMat13 {
        let dt = self.config.dt;
        let mut f = StateMat13::identity();

        let quat_block = Matrix4::identity() + quaternion::omega_matrix(omega) * (0.5 * dt);
        f.fixed_view_mut::<4, 4>(IDX_QUAT, IDX_QUAT).copy_from(&quat_block);

        for i in 0..3 {
            f[(IDX_POS + i, IDX_VEL + i)] = dt;
        }
        f
    }

    /// Accelerometer update: predicted measurement is gravity rotated into body frame.
    ///
    /// Valid only while linear acceleration is small relative to gravity.
    pub fn update(&mut self, accel_meas: &Vector3<f64>) -> FilterResult<Innovation> {
        if !accel_meas.iter().all(|v| v.is_finite()) {
            return Err(FilterError::InvalidInput(format!(
                "update accel={:?}",
                accel_meas.as_slice()
            )));
        }

        let q = self.state.orientation;
        let gravity = self.config.gravity;

        let predicted = quaternion::gravity_in_body(&q, gravity, self.config.min_quat_norm);
        let residual = accel_meas - predicted;

        // H: only the quaternion columns are populated
        let mut h = JacobianAccel::zeros();
        h.fixed_view_mut::<3, 4>(0, IDX_QUAT)
            .copy_from(&quaternion::gravity_jacobian(&q, gravity));

        // Innovation covariance: S = H * P * H^T + R
        let ph_t = self.covariance * h.transpose();
        let s = h * ph_t + self.measurement_noise;

        let Some(s_inv) = s.try_inverse() else {
            warn!("EKF update skipped: singular innovation covariance (tr(S)={:.3e})", s.trace());
            return Err(FilterError::SingularInnovation);
        };

        // Kalman gain: K = P * H^T * S^-1
        let k: KalmanGainAccel = ph_t * s_inv;

        // State update: x += K * residual
        let x = self.state.to_vector() + k * residual;
        self.state = FilterState::from_vector(&x);
        self.state.orientation =
            quaternion::normalize(&self.state.orientation, self.config.min_quat_norm);

        // Covariance update: P = (I - K*H) * P
        self.covariance = (StateMat13::identity() - k * h) * self.covariance;

        // Symmetrize to limit numerical drift
        self.covariance = (self.covariance + self.covariance.transpose()) * 0.5;

        let inflated = self.adapt_noise(&residual, &s);
        let innovation = Innovation {
            residual,
            energy: residual.dot(&residual),
            trace_s: s.trace(),
            inflated,
        };
        self.update_count += 1;

        self.check_health("update")?;
        Ok(innovation)
    }

    /// Scalar innovation-energy feedback on Q. Returns true when Q was inflated.
    fn adapt_noise(&mut self, residual: &Vector3<f64>, s: &AccelNoise) -> bool {
        let energy = residual.dot(residual);
        let inflate = energy > self.config.innovation_gate * s.trace();

        let factor = if inflate {
            self.config.noise_inflation
        } else {
            self.config.noise_deflation
        };
        self.process_noise *= factor;

        // Element-wise floor against floor·I
        let floor = self.config.noise_floor;
        for i in 0..STATE_DIM_13 {
            for j in 0..STATE_DIM_13 {
                let bound = if i == j { floor } else { 0.0 };
                if self.process_noise[(i, j)] < bound {
                    self.process_noise[(i, j)] = bound;
                }
            }
        }

        if inflate {
            debug!(
                "Q inflated: yᵗy={:.4} > {:.1}·tr(S)={:.4}, tr(Q)={:.3e}",
                energy,
                self.config.innovation_gate,
                s.trace(),
                self.process_noise.trace()
            );
        }
        inflate
    }

    /// Finiteness and positive-definiteness check.
    ///
    /// On failure the state rolls back to the last healthy estimate and P/Q
    /// return to their priors.
    fn check_health(&mut self, stage: &str) -> FilterResult<()> {
        let state_ok = self.state.is_finite();
        let cov_ok = self.covariance.iter().all(|v| v.is_finite())
            && Cholesky::new(self.covariance).is_some();

        if state_ok && cov_ok {
            self.last_good = self.state.clone();
            return Ok(());
        }

        let reason = format!(
            "{}: state finite={}, covariance positive-definite={}",
            stage, state_ok, cov_ok
        );
        warn!("EKF numerical instability after {}, resetting covariance to prior", reason);

        self.state = self.last_good.clone();
        self.state.orientation =
            quaternion::normalize(&self.state.orientation, self.config.min_quat_norm);
        self.covariance = Self::prior_covariance(&self.config);
        self.process_noise = Self::initial_process_noise(&self.config);
        self.recovery_count += 1;

        Err(FilterError::NumericalInstability(reason))
    }

    /// Back to the prior (identity attitude, zero motion, initial P and Q).
    /// Step and recovery counters start over.
    pub fn reset(&mut self) {
        self.state = FilterState::default();
        self.last_good = FilterState::default();
        self.covariance = Self::prior_covariance(&self.config);
        self.process_noise = Self::initial_process_noise(&self.config);
        self.predict_count = 0;
        self.update_count = 0;
        self.recovery_count = 0;
    }

    /// Replace the gravity magnitude used by predict and update.
    pub fn set_gravity(&mut self, gravity: f64) {
        if gravity.is_finite() && gravity > 0.0 {
            self.config.gravity = gravity;
        } else {
            warn!("Ignoring invalid gravity magnitude {}", gravity);
        }
    }

    pub fn gravity(&self) -> f64 {
        self.config.gravity
    }

    pub fn config(&self) -> &EkfConfig {
        &self.config
    }

    pub fn state(&self) -> &FilterState {
        &self.state
    }

    pub fn orientation(&self) -> Vector4<f64> {
        self.state.orientation
    }

    pub fn position(&self) -> Vector3<f64> {
        self.state.position
    }

    pub fn velocity(&self) -> Vector3<f64> {
        self.state.velocity
    }

    pub fn gyro_bias(&self) -> Vector3<f64> {
        self.state.gyro_bias
    }

    pub fn covariance(&self) -> &StateMat13 {
        &self.covariance
    }

    pub fn process_noise(&self) -> &StateMat13 {
        &self.process_noise
    }

    pub fn process_noise_trace(&self) -> f64 {
        self.process_noise.trace()
    }

    pub fn recovery_count(&self) -> u64 {
        self.recovery_count
    }

    /// Get current state snapshot
    pub fn snapshot(&self) -> EkfSnapshot {
        let q = self.state.orientation;
        let (roll, pitch, yaw) = quaternion::euler_angles(&q);
        EkfSnapshot {
            quaternion: (q[0], q[1], q[2], q[3]),
            euler_deg: (roll.to_degrees(), pitch.to_degrees(), yaw.to_degrees()),
            position: tuple3(&self.state.position),
            velocity: tuple3(&self.state.velocity),
            gyro_bias: tuple3(&self.state.gyro_bias),
            covariance_trace: self.covariance.trace(),
            process_noise_trace: self.process_noise.trace(),
            predict_count: self.predict_count,
            update_count: self.update_count,
            recovery_count: self.recovery_count,
        }
    }
}

impl Default for AdaptiveEkf {
    fn default() -> Self {
        Self::new(EkfConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const G: f64 = 9.81;

    fn level() -> Vector3<f64> {
        Vector3::new(0.0, 0.0, G)
    }

    #[test]
    fn test_state_vector_layout() {
        let state = FilterState {
            orientation: Vector4::new(1.0, 2.0, 3.0, 4.0),
            position: Vector3::new(5.0, 6.0, 7.0),
            velocity: Vector3::new(8.0, 9.0, 10.0),
            gyro_bias: Vector3::new(11.0, 12.0, 13.0),
        };
        let x = state.to_vector();
        for i in 0..STATE_DIM_13 {
            assert_eq!(x[i], (i + 1) as f64);
        }
        assert_eq!(FilterState::from_vector(&x), state);
    }

    #[test]
    fn test_steady_state_stays_level() {
        let mut ekf = AdaptiveEkf::default();
        for _ in 0..1000 {
            ekf.predict(&Vector3::zeros(), &level()).unwrap();
            ekf.update(&level()).unwrap();
        }
        assert_relative_eq!(ekf.orientation(), quaternion::identity(), epsilon = 1e-9);
        assert!(ekf.position().norm() < 1e-6);
        assert!(ekf.velocity().norm() < 1e-6);
    }

    #[test]
    fn test_quaternion_norm_invariant() {
        let mut ekf = AdaptiveEkf::default();
        for i in 0..500 {
            let t = i as f64 * 0.01;
            let gyro = Vector3::new(0.5 * t.sin(), -0.3 * (2.0 * t).cos(), 0.8);
            let accel = Vector3::new(0.4 * t.cos(), 0.2, G + 0.1 * t.sin());
            ekf.predict(&gyro, &accel).unwrap();
            assert_relative_eq!(ekf.orientation().norm(), 1.0, epsilon = 1e-9);
            ekf.update(&accel).unwrap();
            assert_relative_eq!(ekf.orientation().norm(), 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_gyro_rotation_integrates_yaw() {
        let mut ekf = AdaptiveEkf::default();
        // 1 rad/s about z for 1 s, no update
        for _ in 0..100 {
            ekf.predict(&Vector3::new(0.0, 0.0, 1.0), &level()).unwrap();
        }
        let (_, _, yaw) = quaternion::euler_angles(&ekf.orientation());
        assert_relative_eq!(yaw, 1.0, epsilon = 1e-2);
    }

    #[test]
    fn test_linear_acceleration_dead_reckoning() {
        let mut ekf = AdaptiveEkf::default();
        // 1 m/s² along x for 1 s from rest
        for _ in 0..100 {
            ekf.predict(&Vector3::zeros(), &Vector3::new(1.0, 0.0, G)).unwrap();
        }
        assert_relative_eq!(ekf.velocity().x, 1.0, epsilon = 1e-9);
        // Semi-implicit Euler: Σ v_k·dt = 0.01² · Σk = 0.505
        assert_relative_eq!(ekf.position().x, 0.505, epsilon = 1e-9);
    }

    #[test]
    fn test_large_innovation_inflates_process_noise() {
        let mut ekf = AdaptiveEkf::default();
        for _ in 0..5 {
            ekf.predict(&Vector3::zeros(), &level()).unwrap();
            ekf.update(&level()).unwrap();
        }

        let spike = Vector3::new(40.0, -40.0, G);
        ekf.predict(&Vector3::zeros(), &level()).unwrap();
        let before = ekf.process_noise_trace();
        let innovation = ekf.update(&spike).unwrap();
        let after = ekf.process_noise_trace();

        assert!(innovation.inflated);
        assert!(after > before);
        assert_relative_eq!(after, before * 1.01, epsilon = 1e-12);
    }

    #[test]
    fn test_small_innovations_deflate_to_floor() {
        let mut ekf = AdaptiveEkf::default();
        let mut previous = ekf.process_noise_trace();
        for _ in 0..10 {
            ekf.predict(&Vector3::zeros(), &level()).unwrap();
            let innovation = ekf.update(&level()).unwrap();
            assert!(!innovation.inflated);
            assert!(ekf.process_noise_trace() < previous);
            previous = ekf.process_noise_trace();
        }

        // 0.001 → 1e-6 takes ln(1000)/−ln(0.999) ≈ 6904 updates
        for _ in 0..8000 {
            ekf.predict(&Vector3::zeros(), &level()).unwrap();
            ekf.update(&level()).unwrap();
        }
        let floor = ekf.config().noise_floor;
        assert_relative_eq!(ekf.process_noise_trace(), 13.0 * floor, epsilon = 1e-15);
        for i in 0..STATE_DIM_13 {
            assert!(ekf.process_noise()[(i, i)] >= floor);
        }
    }

    #[test]
    fn test_update_corrects_tilt() {
        let mut ekf = AdaptiveEkf::default();
        // Body rolled by 0.2 rad: gravity appears on +y and z
        let roll: f64 = 0.2;
        let meas = Vector3::new(0.0, G * roll.sin(), G * roll.cos());
        for _ in 0..500 {
            ekf.predict(&Vector3::zeros(), &meas).unwrap();
            ekf.update(&meas).unwrap();
        }
        let (est_roll, est_pitch, _) = quaternion::euler_angles(&ekf.orientation());
        assert_relative_eq!(est_roll, roll, epsilon = 1e-3);
        assert!(est_pitch.abs() < 1e-3);
    }

    #[test]
    fn test_non_finite_input_rejected_without_mutation() {
        let mut ekf = AdaptiveEkf::default();
        let before = ekf.state().clone();
        let result = ekf.predict(&Vector3::new(f64::NAN, 0.0, 0.0), &level());
        assert!(matches!(result, Err(FilterError::InvalidInput(_))));
        let result = ekf.update(&Vector3::new(0.0, f64::INFINITY, 0.0));
        assert!(matches!(result, Err(FilterError::InvalidInput(_))));
        assert_eq!(ekf.state(), &before);
    }

    #[test]
    fn test_recovers_from_non_finite_covariance() {
        let mut ekf = AdaptiveEkf::default();
        ekf.predict(&Vector3::zeros(), &level()).unwrap();
        ekf.covariance[(4, 4)] = f64::NAN;

        let result = ekf.predict(&Vector3::zeros(), &level());
        assert!(matches!(result, Err(FilterError::NumericalInstability(_))));
        assert_eq!(ekf.recovery_count(), 1);
        assert!(ekf.covariance().iter().all(|v| v.is_finite()));
        assert_relative_eq!(ekf.covariance().trace(), 13.0 * 0.1, epsilon = 1e-12);
        assert!(ekf.state().is_finite());
    }

    #[test]
    fn test_update_rolls_back_on_indefinite_covariance() {
        let mut ekf = AdaptiveEkf::default();
        let roll: f64 = 0.1;
        let tilted = Vector3::new(0.0, G * roll.sin(), G * roll.cos());
        ekf.predict(&Vector3::new(0.02, 0.0, 0.0), &tilted).unwrap();
        let before = ekf.state().clone();

        // Negative position variance is invisible to S but breaks positive-definiteness
        ekf.covariance[(4, 4)] = -5.0;
        let result = ekf.update(&tilted);

        assert!(matches!(result, Err(FilterError::NumericalInstability(_))));
        assert_eq!(ekf.recovery_count(), 1);
        assert_eq!(ekf.velocity(), before.velocity);
        assert_eq!(ekf.position(), before.position);
        assert_relative_eq!(ekf.orientation(), before.orientation, epsilon = 1e-12);
        assert_relative_eq!(ekf.covariance().trace(), 13.0 * 0.1, epsilon = 1e-12);
        assert_relative_eq!(ekf.process_noise_trace(), 13.0 * 0.001, epsilon = 1e-12);

        // Healthy again on the next cycle
        ekf.predict(&Vector3::zeros(), &tilted).unwrap();
        ekf.update(&tilted).unwrap();
        assert_eq!(ekf.recovery_count(), 1);
    }

    #[test]
    fn test_reset_returns_to_prior() {
        let mut ekf = AdaptiveEkf::default();
        for _ in 0..10 {
            ekf.predict(&Vector3::new(0.1, 0.1, 0.1), &Vector3::new(0.5, 0.0, G)).unwrap();
            ekf.update(&level()).unwrap();
        }
        ekf.covariance[(4, 4)] = f64::NAN;
        assert!(ekf.predict(&Vector3::zeros(), &level()).is_err());
        assert_ne!(ekf.state(), &FilterState::default());

        ekf.reset();

        assert_eq!(ekf.state(), &FilterState::default());
        assert_relative_eq!(ekf.covariance().trace(), 13.0 * 0.1, epsilon = 1e-12);
        assert_relative_eq!(ekf.process_noise_trace(), 13.0 * 0.001, epsilon = 1e-12);
        let snap = ekf.snapshot();
        assert_eq!(snap.predict_count, 0);
        assert_eq!(snap.update_count, 0);
        assert_eq!(snap.recovery_count, 0);

        // Runs from the prior like a fresh filter
        ekf.predict(&Vector3::zeros(), &level()).unwrap();
        ekf.update(&level()).unwrap();
        assert_relative_eq!(ekf.orientation(), quaternion::identity(), epsilon = 1e-12);
        assert_eq!(ekf.snapshot().predict_count, 1);
    }

    #[test]
    fn test_singular_innovation_skips_update() {
        let mut config = EkfConfig::default();
        config.measurement_noise = 0.0;
        let mut ekf = AdaptiveEkf::new(config);
        // Zero covariance in the quaternion block and zero R make S singular
        ekf.covariance = StateMat13::zeros();
        let before = ekf.state().clone();
        let result = ekf.update(&level());
        assert_eq!(result.unwrap_err(), FilterError::SingularInnovation);
        assert_eq!(ekf.state(), &before);
    }

    #[test]
    fn test_snapshot_reports_counters() {
        let mut ekf = AdaptiveEkf::default();
        ekf.predict(&Vector3::zeros(), &level()).unwrap();
        ekf.update(&level()).unwrap();
        let snap = ekf.snapshot();
        assert_eq!(snap.predict_count, 1);
        assert_eq!(snap.update_count, 1);
        assert_eq!(snap.quaternion, (1.0, 0.0, 0.0, 0.0));
        assert!(snap.covariance_trace > 0.0);
    }
}
