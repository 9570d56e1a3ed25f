//! Variance-based stationarity detection over the newest part of the window.

use nalgebra::Vector3;

use super::window::SampleWindow;

/// Means of the most recent sub-window that passed the stationarity test.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StationarySnapshot {
    pub accel_mean: Vector3<f64>,
    pub gyro_mean: Vector3<f64>,
    /// Mean per-axis variance of the accel sub-window
    pub accel_variance: f64,
    /// Mean per-axis variance of the gyro sub-window
    pub gyro_variance: f64,
}

impl StationarySnapshot {
    /// ‖mean accel‖, the locally observed gravity magnitude
    pub fn gravity_magnitude(&self) -> f64 {
        self.accel_mean.norm()
    }
}

#[derive(Clone, Debug)]
pub struct StationaryDetector {
    sub_window: usize,
    accel_threshold: f64,
    gyro_threshold: f64,
}

impl StationaryDetector {
    pub fn new(sub_window: usize, accel_threshold: f64, gyro_threshold: f64) -> Self {
        Self {
            sub_window: sub_window.max(2),
            accel_threshold,
            gyro_threshold,
        }
    }

    /// Test the newest `sub_window` samples. Both mean accel variance and mean
    /// gyro variance must be strictly below their thresholds.
    pub fn detect(&self, window: &SampleWindow) -> Option<StationarySnapshot> {
        if window.len() < self.sub_window {
            return None;
        }

        let n = self.sub_window as f64;
        let (accel_sum, gyro_sum) = window.recent(self.sub_window).fold(
            (Vector3::<f64>::zeros(), Vector3::<f64>::zeros()),
            |(sa, sg), (a, g)| (sa + a, sg + g),
        );
        let accel_mean: Vector3<f64> = accel_sum / n;
        let gyro_mean: Vector3<f64> = gyro_sum / n;

        // Population variance per axis
        let (accel_sq, gyro_sq) = window.recent(self.sub_window).fold(
            (Vector3::<f64>::zeros(), Vector3::<f64>::zeros()),
            |(sa, sg), (a, g)| {
                let da = a - accel_mean;
                let dg = g - gyro_mean;
                (sa + da.component_mul(&da), sg + dg.component_mul(&dg))
            },
        );
        let accel_variance = (accel_sq / n).mean();
        let gyro_variance = (gyro_sq / n).mean();

        if accel_variance < self.accel_threshold && gyro_variance < self.gyro_threshold {
            Some(StationarySnapshot {
                accel_mean,
                gyro_mean,
                accel_variance,
                gyro_variance,
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn detector() -> StationaryDetector {
        StationaryDetector::new(50, 0.05, 0.001)
    }

    #[test]
    fn test_still_device_detected() {
        let mut window = SampleWindow::new(200);
        for i in 0..120 {
            let jitter = 0.01 * (i as f64 * 1.3).sin();
            window.push(
                Vector3::new(jitter, -jitter, 9.81 + jitter),
                Vector3::new(0.02 + 0.001 * jitter, -0.01, 0.005),
            );
        }
        let snapshot = detector().detect(&window).expect("should be stationary");
        assert_relative_eq!(snapshot.gyro_mean.x, 0.02, epsilon = 1e-3);
        assert_relative_eq!(snapshot.gravity_magnitude(), 9.81, epsilon = 1e-2);
    }

    #[test]
    fn test_rotation_rejected() {
        let mut window = SampleWindow::new(200);
        for i in 0..120 {
            let t = i as f64 * 0.1;
            window.push(Vector3::new(0.0, 0.0, 9.81), Vector3::new(0.5 * t.sin(), 0.0, 0.0));
        }
        assert!(detector().detect(&window).is_none());
    }

    #[test]
    fn test_only_recent_samples_count() {
        let mut window = SampleWindow::new(200);
        // Violent motion followed by 50 still samples
        for i in 0..100 {
            let s = if i % 2 == 0 { 5.0 } else { -5.0 };
            window.push(Vector3::new(s, s, 9.81 + s), Vector3::new(s, -s, s));
        }
        for _ in 0..50 {
            window.push(Vector3::new(0.0, 0.0, 9.81), Vector3::zeros());
        }
        assert!(detector().detect(&window).is_some());
    }

    #[test]
    fn test_threshold_is_strict() {
        let mut window = SampleWindow::new(100);
        // Alternating ±a gives population variance a² on each axis, just above the bound
        let a = 0.0501_f64.sqrt();
        for i in 0..50 {
            let s = if i % 2 == 0 { a } else { -a };
            window.push(Vector3::new(s, s, 9.81 + s), Vector3::zeros());
        }
        assert!(detector().detect(&window).is_none());
    }

    #[test]
    fn test_short_window_not_evaluated() {
        let mut window = SampleWindow::new(100);
        for _ in 0..10 {
            window.push(Vector3::new(0.0, 0.0, 9.81), Vector3::zeros());
        }
        assert!(detector().detect(&window).is_none());
    }
}
