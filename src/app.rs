//! Building the appliance from configuration and supervising it.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::camera::{open_device, CameraError, CameraResource, DeviceSettings, ResourceTiming};
use crate::config::{log_config, ConfigError, ConfigStore};
use crate::coordinator::{CaptureCoordinator, CoordinatorParts, FatalError, JobOutcome};
use crate::diagnostics::StatusBoard;
use crate::exposure::{ExposureSearch, ExposureStore, LumaMeter};
use crate::focus::{mjpeg_part, FocusAid, FocusError};
use crate::output::{uploader_from_config, DiskSink};
use crate::processing::{load_overlays, ImagePipeline, Overlay};
use crate::scheduler::{fail_fast, run_job, Command, Scheduler, Shutdown};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error(transparent)]
    Focus(#[from] FocusError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("worker thread failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Every long-lived component, wired together.
pub struct Components {
    pub config: Arc<ConfigStore>,
    pub camera: Arc<CameraResource>,
    pub coordinator: Arc<CaptureCoordinator>,
    pub status: Arc<StatusBoard>,
}

impl Components {
    /// Open the camera and build the capture path.
    ///
    /// Call from inside the runtime so the uploader can reach it from
    /// blocking job threads.
    pub fn build(config: Arc<ConfigStore>, overlays: Vec<Overlay>) -> Result<Self, AppError> {
        let current = config.get();
        let settings = current.device_settings();
        let backend = current.camera.backend;
        let options = current.backend_options();

        let device = open_device(backend, &settings, &options)?;
        let factory_options = options.clone();
        let camera = Arc::new(CameraResource::new(
            device,
            settings,
            Box::new(move |s: &DeviceSettings| open_device(backend, s, &factory_options)),
            ResourceTiming {
                settle: current.settle(),
                teardown: current.teardown(),
            },
        ));

        let search = ExposureSearch::new(
            ExposureStore::new(current.camera.state_file.clone()),
            Arc::new(LumaMeter),
            current.search_settings(),
        );
        let status = Arc::new(StatusBoard::new(
            current.device.id.clone(),
            current.diagnostics.status_file.clone(),
        ));
        let coordinator = Arc::new(CaptureCoordinator::new(CoordinatorParts {
            config: Arc::clone(&config),
            camera: Arc::clone(&camera),
            search,
            oracle: current.day_period_oracle()?,
            processor: Box::new(ImagePipeline::from_config(&current, overlays)),
            uploader: uploader_from_config(&current.upload),
            sink: Box::new(DiskSink::new(
                current.camera.latest_image.clone(),
                current.camera.archive_dir.clone(),
            )),
            diagnostics: status.clone(),
        }));

        Ok(Self {
            config,
            camera,
            coordinator,
            status,
        })
    }

    /// Fetch overlays, then build.
    pub async fn load(config: Arc<ConfigStore>) -> Result<Self, AppError> {
        let overlays = {
            let current = config.get();
            load_overlays(&reqwest::Client::new(), &current.overlays).await
        };
        Self::build(config, overlays)
    }
}

/// The full appliance: scheduler, signal listeners and their supervisor.
pub struct App {
    components: Components,
    shutdown: Shutdown,
}

impl App {
    pub fn new(components: Components) -> Self {
        Self {
            components,
            shutdown: Shutdown::new(),
        }
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Run until shutdown and return the process exit code.
    pub async fn run(self) -> i32 {
        let Components {
            config,
            coordinator,
            status,
            ..
        } = self.components;
        let shutdown = self.shutdown;
        log_config(&config.get());

        let ctrlc_shutdown = shutdown.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            log::info!("Received Ctrl+C, shutting down...");
            ctrlc_shutdown.request(0);
        }) {
            log::warn!("Failed to install Ctrl+C handler: {}", e);
        }

        let (tx, rx) = mpsc::channel(8);
        let mut scheduler = tokio::spawn(
            Scheduler::new(Arc::clone(&coordinator), status, rx, shutdown.clone()).run(),
        );
        let mut signals = tokio::spawn(listen_for_signals(tx, shutdown.clone()));

        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = &mut scheduler => {
                if !shutdown.is_requested() {
                    fail_fast(&coordinator, &shutdown, &FatalError::TaskExited("scheduler".to_string()));
                }
            }
            _ = &mut signals => {
                if !shutdown.is_requested() {
                    fail_fast(&coordinator, &shutdown, &FatalError::TaskExited("signals".to_string()));
                }
            }
        }

        log::info!("Shutting down...");
        if !scheduler.is_finished() {
            if let Err(e) = scheduler.await {
                log::error!("Scheduler ended abnormally: {}", e);
            }
        }
        signals.abort();

        let worker = Arc::clone(&coordinator);
        if let Err(e) = tokio::task::spawn_blocking(move || worker.shutdown()).await {
            log::error!("Failed to stop stream: {}", e);
        }
        let code = shutdown.exit_code();
        log::info!("Exiting with code {}", code);
        code
    }
}

/// SIGUSR1 captures, SIGUSR2 publishes diagnostics, SIGTERM shuts down.
#[cfg(unix)]
async fn listen_for_signals(commands: mpsc::Sender<Command>, shutdown: Shutdown) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut usr1, mut usr2, mut term) = match (
        signal(SignalKind::user_defined1()),
        signal(SignalKind::user_defined2()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(usr1), Ok(usr2), Ok(term)) => (usr1, usr2, term),
        _ => {
            log::warn!("Signal handlers unavailable, only Ctrl+C will be honoured");
            shutdown.cancelled().await;
            return;
        }
    };

    loop {
        let command = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = usr1.recv() => Command::Capture,
            _ = usr2.recv() => Command::Diagnostic,
            _ = term.recv() => {
                log::info!("Received SIGTERM, shutting down...");
                shutdown.request(0);
                break;
            }
        };
        if commands.send(command).await.is_err() {
            break;
        }
    }
}

#[cfg(not(unix))]
async fn listen_for_signals(_commands: mpsc::Sender<Command>, shutdown: Shutdown) {
    shutdown.cancelled().await;
}

/// Run one capture job. Returns the exit code.
pub async fn capture_once(components: Components) -> i32 {
    let shutdown = Shutdown::new();
    let coordinator = Arc::clone(&components.coordinator);
    let outcome = run_job(Arc::clone(&coordinator), shutdown.clone(), "One-shot").await;
    let worker = Arc::clone(&coordinator);
    if let Err(e) = tokio::task::spawn_blocking(move || worker.shutdown()).await {
        log::error!("Failed to stop stream: {}", e);
    }
    match outcome {
        Some(JobOutcome::Completed(_)) | Some(JobOutcome::Skipped) => shutdown.exit_code(),
        Some(JobOutcome::Aborted) | Some(JobOutcome::Failed(_)) => 2,
        None => shutdown.exit_code(),
    }
}

/// Produce crosshair preview frames for `duration`.
///
/// Frames replace `focus.preview_path`, or go to `mjpeg` as
/// `multipart/x-mixed-replace` parts when a writer is given.
pub fn run_focus_session(
    components: &Components,
    duration: Duration,
    mut mjpeg: Option<&mut dyn Write>,
) -> Result<u64, AppError> {
    let config = components.config.get();
    let interval = Duration::from_millis(config.focus.frame_interval_ms);
    let path = config.focus.preview_path.clone();

    let mut aid = FocusAid::start(
        Arc::clone(&components.coordinator),
        Arc::clone(&components.camera),
    )?;
    if mjpeg.is_some() {
        log::info!("Focus aid streaming MJPEG for {:?}", duration);
    } else {
        log::info!("Focus aid writing frames to {} for {:?}", path.display(), duration);
    }

    let deadline = Instant::now() + duration;
    let mut frames = 0;
    let result = loop {
        if Instant::now() >= deadline {
            break Ok(frames);
        }
        match aid.next_frame() {
            Ok(jpeg) => {
                let written = match mjpeg.as_deref_mut() {
                    Some(out) => out.write_all(&mjpeg_part(&jpeg)).and_then(|()| out.flush()),
                    None => write_preview(&path, &jpeg),
                };
                if let Err(e) = written {
                    break Err(e.into());
                }
                frames += 1;
            }
            Err(e) => break Err(e.into()),
        }
        std::thread::sleep(interval);
    };
    aid.stop();
    result
}

fn write_preview(path: &Path, jpeg: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".part");
    std::fs::write(&tmp, jpeg)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::day_period::DayPeriod;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.camera.settle_secs = 0.0;
        config.camera.teardown_secs = 0.0;
        config.camera.fake.width = 32;
        config.camera.fake.height = 24;
        config.camera.state_file = dir.path().join(".capture_info");
        config.camera.latest_image = dir.path().join("latest.jpg");
        config.camera.archive_dir = dir.path().join("images");
        config.day_period.fixed = Some(DayPeriod::Day);
        config.focus.preview_path = dir.path().join("focus.jpg");
        config.focus.frame_interval_ms = 0;
        config
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_capture_once_writes_latest_image() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ConfigStore::fixed(test_config(&dir)));
        let components = Components::load(store).await.unwrap();
        assert_eq!(capture_once(components).await, 0);
        let latest = std::fs::read(dir.path().join("latest.jpg")).unwrap();
        assert!(image::load_from_memory(&latest).is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_focus_session_resumes_coordinator() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ConfigStore::fixed(test_config(&dir)));
        let components = Components::load(store).await.unwrap();
        let frames = run_focus_session(&components, Duration::from_millis(50), None).unwrap();
        assert!(frames >= 1);
        assert!(dir.path().join("focus.jpg").exists());
        assert!(components.coordinator.is_active());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_focus_session_streams_mjpeg() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ConfigStore::fixed(test_config(&dir)));
        let components = Components::load(store).await.unwrap();
        let mut out: Vec<u8> = Vec::new();
        let frames =
            run_focus_session(&components, Duration::from_millis(50), Some(&mut out)).unwrap();
        assert!(frames >= 1);
        assert!(out.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n"));
        assert!(!dir.path().join("focus.jpg").exists());
        assert!(components.coordinator.is_active());
    }
}
