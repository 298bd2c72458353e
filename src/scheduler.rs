//! Timed and manual capture triggers.
//!
//! Jobs run on blocking threads. A job that fails fatally or panics takes
//! the process down with exit code 1; the service manager restarts it.

use std::any::Any;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::coordinator::{CaptureCoordinator, FatalError, JobOutcome};
use crate::diagnostics::StatusBoard;

pub const STATUS_JOB_CRASHED: &str = "Error: Capture Job CRASHED";
pub const STATUS_RESTARTING: &str = "Restarting";

/// Process-wide shutdown request plus the exit code to leave with.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    code: Arc<AtomicI32>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. The highest code requested wins.
    pub fn request(&self, code: i32) {
        self.code.fetch_max(code, Ordering::SeqCst);
        self.token.cancel();
    }

    pub fn is_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn exit_code(&self) -> i32 {
        self.code.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Messages for the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Capture now, waiting for any job in progress.
    Capture,
    /// Publish a diagnostics snapshot.
    Diagnostic,
    /// Exit so the service manager restarts the process.
    Restart,
}

/// Log a fatal error, publish the crash status and request exit code 1.
pub fn fail_fast(coordinator: &CaptureCoordinator, shutdown: &Shutdown, error: &FatalError) {
    log::error!("CRITICAL: {}", error);
    coordinator.publish(STATUS_JOB_CRASHED);
    shutdown.request(1);
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Turn the result of a blocking job into its outcome or a fatal error.
pub fn job_result(
    result: Result<Result<JobOutcome, FatalError>, JoinError>,
) -> Result<JobOutcome, FatalError> {
    match result {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => Err(FatalError::JobPanicked(panic_message(e.into_panic()))),
        Err(e) => Err(FatalError::JobPanicked(e.to_string())),
    }
}

/// Run one job on a blocking thread and handle its outcome.
pub async fn run_job(
    coordinator: Arc<CaptureCoordinator>,
    shutdown: Shutdown,
    trigger: &'static str,
) -> Option<JobOutcome> {
    log::debug!("Starting {} capture job", trigger);
    let worker = Arc::clone(&coordinator);
    let result = tokio::task::spawn_blocking(move || worker.run_capture_job()).await;
    match job_result(result) {
        Ok(outcome) => {
            match &outcome {
                JobOutcome::Completed(summary) => {
                    log::info!("{} capture completed (shot {})", trigger, summary.shot_counter)
                }
                JobOutcome::Failed(reason) => log::warn!("{} capture failed: {}", trigger, reason),
                JobOutcome::Aborted => log::info!("{} capture aborted", trigger),
                JobOutcome::Skipped => log::info!("{} capture skipped", trigger),
            }
            Some(outcome)
        }
        Err(e) => {
            fail_fast(&coordinator, &shutdown, &e);
            None
        }
    }
}

pub struct Scheduler {
    coordinator: Arc<CaptureCoordinator>,
    status: Arc<StatusBoard>,
    commands: mpsc::Receiver<Command>,
    shutdown: Shutdown,
    shot_interval: Duration,
    diagnostics_interval: Duration,
}

impl Scheduler {
    pub fn new(
        coordinator: Arc<CaptureCoordinator>,
        status: Arc<StatusBoard>,
        commands: mpsc::Receiver<Command>,
        shutdown: Shutdown,
    ) -> Self {
        let config = coordinator.config();
        Self {
            shot_interval: Duration::from_secs(config.camera.shot_interval_secs.max(1)),
            diagnostics_interval: Duration::from_secs(config.diagnostics.interval_secs.max(1)),
            coordinator,
            status,
            commands,
            shutdown,
        }
    }

    pub fn with_intervals(mut self, shot: Duration, diagnostics: Duration) -> Self {
        self.shot_interval = shot;
        self.diagnostics_interval = diagnostics;
        self
    }

    fn spawn_job(&self, trigger: &'static str) -> JoinHandle<Option<JobOutcome>> {
        tokio::spawn(run_job(
            Arc::clone(&self.coordinator),
            self.shutdown.clone(),
            trigger,
        ))
    }

    /// Run until shutdown is requested, then wait for jobs in flight.
    pub async fn run(mut self) {
        log::info!(
            "Scheduler started: capture every {:?}, diagnostics every {:?}",
            self.shot_interval,
            self.diagnostics_interval
        );
        // the first tick fires immediately
        let mut shots = interval(self.shot_interval);
        shots.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut diagnostics = interval_at(
            Instant::now() + self.diagnostics_interval,
            self.diagnostics_interval,
        );
        diagnostics.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut scheduled: Option<JoinHandle<Option<JobOutcome>>> = None;
        let mut manual: JoinSet<Option<JobOutcome>> = JoinSet::new();
        let mut commands_open = true;
        let token = self.shutdown.token();

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = shots.tick() => {
                    if scheduled.as_ref().is_some_and(|job| !job.is_finished()) {
                        log::info!("Previous scheduled capture still running, skipping this tick");
                    } else {
                        scheduled = Some(self.spawn_job("Scheduled"));
                    }
                }
                _ = diagnostics.tick() => {
                    self.status.publish_diagnostics();
                }
                command = self.commands.recv(), if commands_open => match command {
                    Some(Command::Capture) => {
                        log::info!("Manual capture requested");
                        let coordinator = Arc::clone(&self.coordinator);
                        manual.spawn(run_job(coordinator, self.shutdown.clone(), "Manual"));
                    }
                    Some(Command::Diagnostic) => {
                        self.status.publish_diagnostics();
                    }
                    Some(Command::Restart) => {
                        log::warn!("Restart requested");
                        self.coordinator.publish(STATUS_RESTARTING);
                        self.shutdown.request(1);
                    }
                    None => commands_open = false,
                },
                Some(_) = manual.join_next(), if !manual.is_empty() => {}
            }
        }

        log::info!("Scheduler stopping, waiting for running jobs");
        if let Some(job) = scheduled {
            let _ = job.await;
        }
        while manual.join_next().await.is_some() {}
        log::info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_keeps_highest_code() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_requested());
        shutdown.request(1);
        shutdown.request(0);
        assert!(shutdown.is_requested());
        assert_eq!(shutdown.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_panicking_job_is_fatal() {
        let result = tokio::task::spawn_blocking(|| -> Result<JobOutcome, FatalError> {
            panic!("sensor on fire")
        })
        .await;
        match job_result(result) {
            Err(FatalError::JobPanicked(msg)) => assert_eq!(msg, "sensor on fire"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_job_outcome_passes_through() {
        let result = tokio::task::spawn_blocking(|| Ok(JobOutcome::Skipped)).await;
        assert_eq!(job_result(result).unwrap(), JobOutcome::Skipped);
    }
}
