//! Capture jobs: one at a time, interleaved with streaming.
//!
//! A job stops the stream, takes a still (auto exposure in daylight, an
//! exposure search otherwise), post-processes and publishes it, and then
//! brings the stream back for the current day period. The focus aid pauses
//! the coordinator while it holds the camera.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Local;

use crate::camera::{CameraError, CameraResource, CaptureRequest, Still};
use crate::config::{Config, ConfigStore};
use crate::day_period::{DayPeriod, DayPeriodOracle};
use crate::diagnostics::DiagnosticsPublisher;
use crate::exposure::ExposureSearch;
use crate::output::{ImageInfo, ImageSink, Uploader};
use crate::processing::{FrameContext, FrameProcessor};

/// How long `resume` waits for the camera before forcing it idle.
pub const RESUME_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

pub const STATUS_CAPTURING: &str = "Capturing Image";
pub const STATUS_CAPTURE_FAILED: &str = "Error: Capture Failed";
pub const STATUS_PROCESSING_FAILED: &str = "Error: Processing Failed";
pub const STATUS_UPLOAD_FAILED: &str = "Error: Upload Failed";
pub const STATUS_COMPLETED: &str = "Capture Completed";
pub const STATUS_IDLE: &str = "Idle";

/// Errors that end the process.
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("camera could not be re-acquired after hard reset: {0}")]
    HardResetFailed(#[source] CameraError),
    #[error("capture job panicked: {0}")]
    JobPanicked(String),
    #[error("supervised task '{0}' exited unexpectedly")]
    TaskExited(String),
}

/// What a finished job produced.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSummary {
    pub period: DayPeriod,
    pub exposure_index: Option<usize>,
    pub converged: bool,
    pub uploaded: bool,
    pub archived: Option<PathBuf>,
    pub shot_counter: u32,
    pub hard_reset: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// The coordinator is paused.
    Skipped,
    /// The day period is unknown; nothing was captured.
    Aborted,
    Failed(String),
    Completed(JobSummary),
}

/// Collaborators of a [`CaptureCoordinator`].
pub struct CoordinatorParts {
    pub config: Arc<ConfigStore>,
    pub camera: Arc<CameraResource>,
    pub search: ExposureSearch,
    pub oracle: Arc<dyn DayPeriodOracle>,
    pub processor: Box<dyn FrameProcessor>,
    pub uploader: Box<dyn Uploader>,
    pub sink: Box<dyn ImageSink>,
    pub diagnostics: Arc<dyn DiagnosticsPublisher>,
}

pub struct CaptureCoordinator {
    config: Arc<ConfigStore>,
    camera: Arc<CameraResource>,
    /// The capture mutex. It owns the exposure state, so only the job
    /// holding it can run a search.
    capture: Mutex<ExposureSearch>,
    oracle: Arc<dyn DayPeriodOracle>,
    processor: Box<dyn FrameProcessor>,
    uploader: Box<dyn Uploader>,
    sink: Box<dyn ImageSink>,
    diagnostics: Arc<dyn DiagnosticsPublisher>,
    active: AtomicBool,
    /// Set by `pause` when it stopped a running stream.
    stream_was_active: Mutex<bool>,
    shot_counter: AtomicU32,
    resume_timeout: Duration,
}

impl CaptureCoordinator {
    pub fn new(parts: CoordinatorParts) -> Self {
        Self {
            config: parts.config,
            camera: parts.camera,
            capture: Mutex::new(parts.search),
            oracle: parts.oracle,
            processor: parts.processor,
            uploader: parts.uploader,
            sink: parts.sink,
            diagnostics: parts.diagnostics,
            active: AtomicBool::new(true),
            stream_was_active: Mutex::new(false),
            shot_counter: AtomicU32::new(0),
            resume_timeout: RESUME_IDLE_TIMEOUT,
        }
    }

    /// Override the bound on the idle wait in [`resume`](Self::resume).
    pub fn with_resume_timeout(mut self, timeout: Duration) -> Self {
        self.resume_timeout = timeout;
        self
    }

    pub fn camera(&self) -> &Arc<CameraResource> {
        &self.camera
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.get()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// True while a job holds the capture mutex.
    pub fn is_capturing(&self) -> bool {
        self.capture.try_lock().is_err()
    }

    pub fn shot_counter(&self) -> u32 {
        self.shot_counter.load(Ordering::SeqCst)
    }

    pub fn publish(&self, status: &str) {
        self.diagnostics.publish(status);
    }

    /// Run one capture job, waiting for any job already in progress.
    pub fn run_capture_job(&self) -> Result<JobOutcome, FatalError> {
        let mut search = self.capture.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.is_active() {
            log::info!("Capture skipped, coordinator is paused");
            return Ok(JobOutcome::Skipped);
        }

        let config = self.config.reload();
        self.camera.update_config(&config.device_settings());
        search.set_settings(config.search_settings());
        self.publish(STATUS_CAPTURING);

        let period = self.oracle.day_period();
        let result = if period.is_known() {
            self.capture_and_publish(&mut search, &config, period)
        } else {
            log::warn!("Day period is unknown, skipping capture");
            self.publish(STATUS_IDLE);
            Ok(JobOutcome::Aborted)
        };

        self.restart_stream(&config, period);
        result
    }

    fn capture_and_publish(
        &self,
        search: &mut ExposureSearch,
        config: &Config,
        period: DayPeriod,
    ) -> Result<JobOutcome, FatalError> {
        log::info!("Capture job started ({})", period);
        if self.camera.is_streaming() {
            self.camera.stream_stop();
        }

        let still = match self.take_still(search, config, period) {
            Ok(still) => still,
            Err(reason) => {
                log::error!("Capture failed: {}", reason);
                self.publish(STATUS_CAPTURE_FAILED);
                return Ok(JobOutcome::Failed(reason));
            }
        };
        log::info!(
            "Captured {} bytes (index {:?}, exposure {:?}s, converged {})",
            still.frame.jpeg.len(),
            still.exposure_index,
            still.frame.metadata.exposure_secs(),
            still.converged
        );

        let ctx = FrameContext {
            device_id: config.device.id.clone(),
            period,
            time: Local::now(),
        };
        let jpeg = match self.processor.process(&still.frame.jpeg, &ctx) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                log::error!("Post-processing failed: {}", e);
                self.publish(STATUS_PROCESSING_FAILED);
                return Ok(JobOutcome::Failed(format!("processing: {}", e)));
            }
        };

        let archive = config.camera.archive;
        let info = ImageInfo {
            device_id: config.device.id.clone(),
            period,
            captured_at: still.frame.captured_at,
            exposure_index: still.exposure_index,
            metadata: still.frame.metadata.clone(),
        };

        let uploaded = match self.uploader.upload(&jpeg, &info) {
            Ok(()) => true,
            Err(e) => {
                log::error!("Upload failed: {}", e);
                self.publish(STATUS_UPLOAD_FAILED);
                false
            }
        };
        if let Err(e) = self.sink.save_latest(&jpeg) {
            log::error!("Failed to save latest image: {}", e);
        }
        let archived = if archive {
            match self.sink.archive(&jpeg, &info) {
                Ok(path) => {
                    log::info!("Archived {}", path.display());
                    Some(path)
                }
                Err(e) => {
                    log::error!("Failed to archive image: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let interval = config.camera.hard_reset_interval;
        let mut counter = self.shot_counter.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        self.diagnostics.record_capture(period, counter);
        let hard_reset = interval > 0 && counter >= interval;
        if hard_reset {
            log::info!("Shot {} reached hard reset interval {}", counter, interval);
            self.camera.hard_reset().map_err(FatalError::HardResetFailed)?;
            self.shot_counter.store(0, Ordering::SeqCst);
            counter = 0;
        }

        self.publish(STATUS_COMPLETED);
        self.publish(STATUS_IDLE);
        Ok(JobOutcome::Completed(JobSummary {
            period,
            exposure_index: still.exposure_index,
            converged: still.converged,
            uploaded,
            archived,
            shot_counter: counter,
            hard_reset,
        }))
    }

    fn take_still(
        &self,
        search: &mut ExposureSearch,
        config: &Config,
        period: DayPeriod,
    ) -> Result<Still, String> {
        let request = if period.uses_auto_exposure() {
            CaptureRequest::Day(config.day_controls())
        } else {
            CaptureRequest::Search {
                table: config.shutter_table().map_err(|e| e.to_string())?,
                target: config.brightness_target(period).map_err(|e| e.to_string())?,
            }
        };
        match self.camera.capture(&request, search) {
            Ok(Some(still)) => Ok(still),
            Ok(None) => Err("exposure search produced no frame".to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    fn restart_stream(&self, config: &Config, period: DayPeriod) {
        if !self.is_active() {
            return;
        }
        if let Err(e) = self.camera.stream_start(config.stream_settings(period).as_ref()) {
            log::error!("Failed to restart stream: {}", e);
        }
    }

    fn remembered(&self) -> MutexGuard<'_, bool> {
        self.stream_was_active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop taking captures and release the stream.
    pub fn pause(&self) {
        let mut remembered = self.remembered();
        self.active.store(false, Ordering::SeqCst);
        if self.camera.is_streaming() {
            self.camera.stream_stop();
            *remembered = true;
        }
        log::info!("Capture coordinator paused (stream remembered: {})", *remembered);
    }

    /// Undo [`pause`](Self::pause). Safe to call without a preceding pause.
    pub fn resume(&self) {
        let mut remembered = self.remembered();
        if *remembered {
            if !self.camera.wait_until_idle(self.resume_timeout) {
                log::warn!(
                    "Camera still busy after {:?}, forcing idle",
                    self.resume_timeout
                );
                self.camera.force_idle();
            }
            let config = self.config.get();
            let period = self.oracle.day_period();
            if let Err(e) = self.camera.stream_start(config.stream_settings(period).as_ref()) {
                log::error!("Failed to restart stream on resume: {}", e);
            }
            *remembered = false;
        }
        self.active.store(true, Ordering::SeqCst);
        log::info!("Capture coordinator resumed");
    }

    /// Stop streaming for process exit.
    pub fn shutdown(&self) {
        if self.camera.stream_stop() {
            log::info!("Stream stopped for shutdown");
        }
    }
}
