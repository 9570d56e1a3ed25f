//! Linear algebra type system for the IMU core
//!
//! Provides compile-time dimension checking and clean type aliases
//! for the adaptive EKF and the calibration fit.

use nalgebra::{SMatrix, SVector};

// ===== State Dimensions =====
pub const STATE_DIM_13: usize = 13;

// ===== State Partition (index of first component) =====
pub const IDX_QUAT: usize = 0; // qw, qx, qy, qz
pub const IDX_POS: usize = 4; // px, py, pz
pub const IDX_VEL: usize = 7; // vx, vy, vz
pub const IDX_BIAS: usize = 10; // gyro bias bx, by, bz

// ===== Measurement Dimensions =====
pub const MEASURE_DIM_ACCEL: usize = 3; // gravity direction in body frame

// ===== Calibration Fit Dimensions =====
pub const FIT_DIM: usize = 6; // 3 accel bias + 3 accel scale

// ===== 13-State Filter Types =====
pub type StateVec13 = SVector<f64, STATE_DIM_13>;
pub type StateMat13 = SMatrix<f64, STATE_DIM_13, STATE_DIM_13>;

// Measurement types for the accelerometer-as-inclinometer update
pub type AccelNoise = SMatrix<f64, MEASURE_DIM_ACCEL, MEASURE_DIM_ACCEL>;

// Kalman gain types
pub type KalmanGainAccel = SMatrix<f64, STATE_DIM_13, MEASURE_DIM_ACCEL>; // 13×3

// Jacobian types
pub type JacobianAccel = SMatrix<f64, MEASURE_DIM_ACCEL, STATE_DIM_13>; // 3×13

// Calibration parameter vector [bx, by, bz, sx, sy, sz]
pub type FitParams = SVector<f64, FIT_DIM>;
