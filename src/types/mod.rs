pub mod linalg;

pub use linalg::*;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// One accelerometer + gyroscope reading as delivered by the sensor driver.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImuSample {
    /// Seconds, caller-defined epoch. Not used for integration (dt is fixed).
    pub timestamp: f64,
    /// Body-frame specific force [m/s²]
    pub accel: (f64, f64, f64),
    /// Body-frame angular rate [rad/s]
    pub gyro: (f64, f64, f64),
}

impl ImuSample {
    pub fn new(timestamp: f64, accel: Vector3<f64>, gyro: Vector3<f64>) -> Self {
        Self {
            timestamp,
            accel: (accel.x, accel.y, accel.z),
            gyro: (gyro.x, gyro.y, gyro.z),
        }
    }

    pub fn accel_vec(&self) -> Vector3<f64> {
        Vector3::new(self.accel.0, self.accel.1, self.accel.2)
    }

    pub fn gyro_vec(&self) -> Vector3<f64> {
        Vector3::new(self.gyro.0, self.gyro.1, self.gyro.2)
    }

    pub fn is_finite(&self) -> bool {
        self.accel_vec().iter().chain(self.gyro_vec().iter()).all(|v| v.is_finite())
    }
}

pub(crate) fn tuple3(v: &Vector3<f64>) -> (f64, f64, f64) {
    (v.x, v.y, v.z)
}
