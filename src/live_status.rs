use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::calibration::{CalibrationPhase, CalibrationSummary};
use crate::sensor_fusion::{FusionSnapshot, FusionStats};

/// Status record written periodically by the binary.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LiveStatus {
    pub timestamp: f64,
    pub uptime_seconds: u64,
    // Attitude / motion
    pub orientation: (f64, f64, f64, f64),
    pub euler_deg: (f64, f64, f64),
    pub position: (f64, f64, f64),
    pub velocity: (f64, f64, f64),
    pub covariance_trace: f64,
    pub process_noise_trace: f64,
    pub filter_recoveries: u64,
    // Calibration
    pub calibrated: bool,
    pub phase: CalibrationPhase,
    pub stationary: bool,
    pub calibration_in_flight: bool,
    pub calibration: CalibrationSummary,
    pub stats: FusionStats,
}

impl LiveStatus {
    pub fn from_snapshot(snapshot: &FusionSnapshot, uptime_seconds: u64) -> Self {
        Self {
            timestamp: current_timestamp(),
            uptime_seconds,
            orientation: snapshot.ekf.quaternion,
            euler_deg: snapshot.ekf.euler_deg,
            position: snapshot.ekf.position,
            velocity: snapshot.ekf.velocity,
            covariance_trace: snapshot.ekf.covariance_trace,
            process_noise_trace: snapshot.ekf.process_noise_trace,
            filter_recoveries: snapshot.ekf.recovery_count,
            calibrated: snapshot.is_calibrated,
            phase: snapshot.phase,
            stationary: snapshot.is_stationary,
            calibration_in_flight: snapshot.calibration_in_flight,
            calibration: snapshot.calibration.clone(),
            stats: snapshot.stats.clone(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HermesConfig;
    use crate::sensor_fusion::SensorFusion;
    use crate::types::ImuSample;
    use nalgebra::Vector3;

    fn status_after(samples: usize) -> LiveStatus {
        let mut config = HermesConfig::default();
        config.fusion.background_calibration = false;
        let mut fusion = SensorFusion::new(config);
        for i in 0..samples {
            let level = Vector3::new(0.0, 0.0, 9.81);
            fusion.feed(&ImuSample::new(i as f64 * 0.01, level, Vector3::zeros()));
        }
        LiveStatus::from_snapshot(&fusion.snapshot(), 3)
    }

    #[test]
    fn test_status_reflects_fusion() {
        let status = status_after(150);
        assert_eq!(status.stats.samples_processed, 150);
        assert_eq!(status.uptime_seconds, 3);
        assert!(status.stationary);
        assert_eq!(status.phase, CalibrationPhase::StationaryDetected);
        assert!(!status.calibrated);
        assert!((status.orientation.0 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_save_round_trips_through_json() {
        let status = status_after(10);
        let path = std::env::temp_dir().join(format!("hermes_status_{}.json", std::process::id()));
        status.save(&path).expect("status should be written");

        let text = fs::read_to_string(&path).expect("status should be readable");
        let parsed: LiveStatus = serde_json::from_str(&text).expect("status should parse");
        assert_eq!(parsed.stats.samples_processed, 10);
        assert_eq!(parsed.phase, CalibrationPhase::Collecting);
        let _ = fs::remove_file(&path);
    }
}
