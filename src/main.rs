use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio::time::Duration;

use hermes_imu::config::HermesConfig;
use hermes_imu::live_status::LiveStatus;
use hermes_imu::sensor_fusion::{FusionEvent, SensorFusion};
use hermes_imu::sensors::{self, MotionProfile, SyntheticImu, SyntheticImuConfig};
use hermes_imu::types::ImuSample;

#[derive(Parser, Debug)]
#[command(name = "hermes_imu")]
#[command(about = "IMU attitude estimation with online self-calibration", long_about = None)]
struct Args {
    /// Duration in seconds (0 = continuous)
    #[arg(value_name = "SECONDS", default_value = "0")]
    duration: u64,

    /// JSON configuration file (missing keys keep their defaults)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Calibration window size in samples
    #[arg(long)]
    window_size: Option<usize>,

    /// Run the calibration fit on the sampling thread instead of a worker
    #[arg(long)]
    inline_calibration: bool,

    /// Feed the learned gravity magnitude back into the filter
    #[arg(long)]
    sync_gravity: bool,

    /// Synthetic motion profile (stationary, tumbling, mixed)
    #[arg(long, default_value = "mixed")]
    profile: MotionProfile,

    /// Warm-up samples collected and calibrated on before the loop starts
    #[arg(long, default_value = "500")]
    warmup: usize,

    /// Seconds between status reports
    #[arg(long, default_value = "2")]
    status_interval: u64,

    /// Directory for live_status.json (status is only logged when unset)
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => HermesConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => HermesConfig::default(),
    };
    if let Some(window_size) = args.window_size {
        config.calibrator.window_size = window_size;
    }
    if args.inline_calibration {
        config.fusion.background_calibration = false;
    }
    if args.sync_gravity {
        config.fusion.sync_gravity = true;
    }
    config.validate().context("invalid configuration")?;

    println!("[{}] Hermes IMU starting", ts_now());
    println!("  Duration: {} seconds (0=continuous)", args.duration);
    println!("  Profile: {:?}", args.profile);
    println!("  Window: {} samples", config.calibrator.window_size);
    println!(
        "  Calibration: {}",
        if config.fusion.background_calibration { "background" } else { "inline" }
    );

    if let Some(dir) = &args.output_dir {
        std::fs::create_dir_all(dir)?;
    }

    let period = Duration::from_secs_f64(config.ekf.dt);
    let mut imu = SyntheticImu::new(SyntheticImuConfig {
        dt: config.ekf.dt,
        profile: args.profile,
        ..SyntheticImuConfig::default()
    });

    let mut fusion = SensorFusion::new(config);

    // Warm-up batch, calibrated before the loop starts
    if args.warmup > 0 {
        println!("[{}] Calibrating on {} warm-up samples...", ts_now(), args.warmup);
        let warmup: Vec<ImuSample> = imu.by_ref().take(args.warmup).collect();
        for event in fusion.warm_up(warmup) {
            log_event(&event);
        }
    }

    let (tx, mut rx) = mpsc::channel::<ImuSample>(500);
    let _imu_handle = tokio::spawn(sensors::sample_loop(tx, imu, period));

    let start = Utc::now();
    let mut last_status = Utc::now();
    println!("[{}] Sampling at {:.0} Hz...", ts_now(), 1.0 / period.as_secs_f64());

    while let Some(sample) = rx.recv().await {
        for event in fusion.feed(&sample) {
            log_event(&event);
        }

        let now = Utc::now();
        let uptime = elapsed_secs(start, now);
        if args.duration > 0 && uptime >= args.duration {
            println!("[{}] Duration reached, stopping...", ts_now());
            break;
        }

        if elapsed_secs(last_status, now) >= args.status_interval {
            if let Err(e) = report_status(&fusion, uptime, args.output_dir.as_ref()) {
                log::warn!("[{}] status report failed: {:#}", ts_now(), e);
            }
            last_status = now;
        }
    }
    drop(rx);

    // Adopt a fit that is still in flight
    for event in fusion.finish_calibration(Duration::from_secs(5)) {
        log_event(&event);
    }

    let uptime = elapsed_secs(start, Utc::now());
    if let Err(e) = report_status(&fusion, uptime, args.output_dir.as_ref()) {
        log::warn!("[{}] final status report failed: {:#}", ts_now(), e);
    }

    let snapshot = fusion.snapshot();
    println!("\n=== Final Stats ===");
    println!("Samples processed: {}", snapshot.stats.samples_processed);
    println!("Calibration updates: {}", snapshot.stats.calibration_updates);
    println!("Calibrated: {} ({:?})", snapshot.is_calibrated, snapshot.phase);
    println!(
        "Attitude (roll, pitch, yaw): ({:.2}, {:.2}, {:.2}) deg",
        snapshot.ekf.euler_deg.0, snapshot.ekf.euler_deg.1, snapshot.ekf.euler_deg.2
    );
    println!("Avg processing time: {:.3} ms", snapshot.stats.avg_processing_time_ms);

    Ok(())
}

fn report_status(fusion: &SensorFusion, uptime: u64, output_dir: Option<&PathBuf>) -> Result<()> {
    let status = LiveStatus::from_snapshot(&fusion.snapshot(), uptime);
    match output_dir {
        Some(dir) => status.save(dir.join("live_status.json"))?,
        None => log::info!("[{}] status {}", ts_now(), status.to_json()?),
    }
    Ok(())
}

fn log_event(event: &FusionEvent) {
    match event {
        FusionEvent::CalibrationApplied { .. } | FusionEvent::StationaryDetected { .. } => {
            log::info!("[{}] {:?}", ts_now(), event)
        }
        FusionEvent::CalibrationQueued { .. } => log::debug!("[{}] {:?}", ts_now(), event),
        _ => log::warn!("[{}] {:?}", ts_now(), event),
    }
}

/// Whole seconds from `from` to `to`, zero if the wall clock stepped backwards
fn elapsed_secs(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    to.signed_duration_since(from).num_seconds().max(0) as u64
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}
