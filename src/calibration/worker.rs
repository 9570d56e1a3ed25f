//! Background calibration fits.
//!
//! One worker thread, one job at a time. Submission never blocks the caller:
//! while a fit is queued or running, further jobs are refused and the caller
//! keeps its current calibration.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::{CalibrationJob, CalibrationResult};

pub struct CalibrationWorker {
    jobs: Option<Sender<CalibrationJob>>,
    results: Receiver<CalibrationResult>,
    busy: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CalibrationWorker {
    pub fn spawn() -> std::io::Result<Self> {
        let (job_tx, job_rx) = channel::bounded::<CalibrationJob>(1);
        let (result_tx, result_rx) = channel::unbounded::<CalibrationResult>();
        let busy = Arc::new(AtomicBool::new(false));

        let worker_busy = Arc::clone(&busy);
        let handle = std::thread::Builder::new()
            .name("calibration-fit".to_string())
            .spawn(move || {
                // Ends when the job sender is dropped
                for job in job_rx.iter() {
                    log::debug!(
                        "Calibration pass {} started on {} samples",
                        job.id,
                        job.samples.len()
                    );
                    let result = job.run();
                    // Result is in the channel before the slot frees up
                    let sent = result_tx.send(result).is_ok();
                    worker_busy.store(false, Ordering::Release);
                    if !sent {
                        break;
                    }
                }
            })?;

        Ok(Self {
            jobs: Some(job_tx),
            results: result_rx,
            busy,
            handle: Some(handle),
        })
    }

    /// Queue a job. Returns `false` (job dropped) when a fit is already
    /// queued or running, or when the worker has stopped.
    pub fn submit(&mut self, job: CalibrationJob) -> bool {
        let Some(jobs) = self.jobs.as_ref() else {
            return false;
        };
        if self.busy.swap(true, Ordering::AcqRel) {
            return false;
        }
        match jobs.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.busy.store(false, Ordering::Release);
                false
            }
        }
    }

    /// Non-blocking poll for a finished fit.
    pub fn try_recv(&self) -> Option<CalibrationResult> {
        match self.results.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Block up to `timeout` for a finished fit.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<CalibrationResult> {
        match self.results.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// True while a submitted fit has not produced its result yet
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

impl Drop for CalibrationWorker {
    fn drop(&mut self) {
        // Closing the channel ends the thread's job loop
        self.jobs.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Calibration worker thread panicked");
            }
        }
    }
}
