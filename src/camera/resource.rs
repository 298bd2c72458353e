//! Exclusive ownership of the physical camera.
//!
//! The camera is in exactly one [`CaptureMode`] at a time. Entering a mode
//! tears the previous one down first: the stream worker is joined, the
//! device is stopped, and the sensor gets a short pause before it is handed
//! to the next user. Operations that touch the device hold one lock for
//! their whole duration, so mode changes are strictly serialized.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crate::exposure::{BrightnessTarget, ExposureSearch, ShutterTable};

use super::device::CameraDevice;
use super::stream::StreamWorker;
use super::types::{
    CameraError, CaptureMode, CapturedFrame, Controls, DeviceSettings, StreamSettings,
};

/// Builds a fresh device after a hard reset.
pub type DeviceFactory =
    Box<dyn Fn(&DeviceSettings) -> Result<Box<dyn CameraDevice>, CameraError> + Send + Sync>;

/// Voluntary delays in the capture path.
#[derive(Debug, Clone, Copy)]
pub struct ResourceTiming {
    /// After starting the sensor in auto exposure, before grabbing a frame.
    pub settle: Duration,
    /// After stopping a running device, before the next mode may use it.
    pub teardown: Duration,
}

impl Default for ResourceTiming {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(2),
            teardown: Duration::from_secs(2),
        }
    }
}

/// Daytime tuning; the sensor's own AE/AWB picks the exposure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DayControls {
    pub awb_mode: i32,
    pub metering_mode: i32,
    pub hdr_mode: i32,
    pub noise_reduction_mode: i32,
    pub sharpness: f32,
}

impl Default for DayControls {
    fn default() -> Self {
        Self {
            awb_mode: 0,
            metering_mode: 0,
            hdr_mode: 0,
            noise_reduction_mode: 0,
            sharpness: 1.0,
        }
    }
}

impl DayControls {
    pub fn controls(&self) -> Controls {
        Controls {
            ae_enable: Some(true),
            awb_enable: Some(true),
            awb_mode: Some(self.awb_mode),
            metering_mode: Some(self.metering_mode),
            analogue_gain: Some(1.0),
            exposure_time_us: Some(0),
            exposure_value: Some(0.0),
            hdr_mode: Some(self.hdr_mode),
            noise_reduction_mode: Some(self.noise_reduction_mode),
            sharpness: Some(self.sharpness),
            ..Controls::default()
        }
    }
}

/// How a still should be exposed.
#[derive(Debug, Clone)]
pub enum CaptureRequest {
    /// One auto-exposed frame.
    Day(DayControls),
    /// Bracket through the shutter table.
    Search {
        table: ShutterTable,
        target: BrightnessTarget,
    },
}

/// A still together with how it was exposed.
#[derive(Debug, Clone)]
pub struct Still {
    pub frame: CapturedFrame,
    /// Table index for searched frames.
    pub exposure_index: Option<usize>,
    /// False when a search fell back to the closest attempt.
    pub converged: bool,
}

struct State {
    device: Box<dyn CameraDevice>,
    settings: DeviceSettings,
    stream: Option<StreamWorker>,
}

/// The single camera, shared by `Arc` between all its users.
pub struct CameraResource {
    state: Mutex<State>,
    mode: Mutex<CaptureMode>,
    idle: Condvar,
    factory: DeviceFactory,
    timing: ResourceTiming,
}

impl CameraResource {
    pub fn new(
        device: Box<dyn CameraDevice>,
        settings: DeviceSettings,
        factory: DeviceFactory,
        timing: ResourceTiming,
    ) -> Self {
        Self {
            state: Mutex::new(State {
                device,
                settings,
                stream: None,
            }),
            mode: Mutex::new(CaptureMode::Idle),
            idle: Condvar::new(),
            factory,
            timing,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_mode(&self, mode: CaptureMode) {
        let mut current = self.mode.lock().unwrap_or_else(PoisonError::into_inner);
        *current = mode;
        if mode == CaptureMode::Idle {
            self.idle.notify_all();
        }
    }

    pub fn current_mode(&self) -> CaptureMode {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_streaming(&self) -> bool {
        self.current_mode() == CaptureMode::Streaming
    }

    /// Switch to `mode`, tearing down whatever is active first.
    ///
    /// This only claims the mode; activating the device is left to the
    /// mode-specific operations.
    pub fn enter_mode(&self, mode: CaptureMode) {
        let mut state = self.lock();
        self.enter_locked(&mut state, mode);
    }

    /// Tear down the active mode and return to Idle.
    pub fn exit_mode(&self) {
        let mut state = self.lock();
        self.teardown(&mut state);
    }

    fn enter_locked(&self, state: &mut State, mode: CaptureMode) {
        // the mode flag alone can lag behind the device
        if self.current_mode() != CaptureMode::Idle
            || state.stream.is_some()
            || state.device.is_started()
        {
            self.teardown(state);
        }
        if mode != CaptureMode::Idle {
            log::debug!("Camera entering {} mode", mode);
            self.set_mode(mode);
        }
    }

    fn teardown(&self, state: &mut State) {
        let previous = self.current_mode();
        let mut was_running = false;

        if let Some(mut worker) = state.stream.take() {
            log::info!("Stopping stream worker...");
            worker.stop_and_join();
            was_running = true;
        }
        if state.device.is_started() {
            if let Err(e) = state.device.stop() {
                log::warn!("Failed to stop camera: {}", e);
            }
            was_running = true;
        }
        if was_running && !self.timing.teardown.is_zero() {
            thread::sleep(self.timing.teardown);
        }

        if previous != CaptureMode::Idle {
            log::debug!("Camera left {} mode", previous);
        }
        self.set_mode(CaptureMode::Idle);
    }

    /// Take one still, exiting to Idle before returning.
    ///
    /// `Ok(None)` means the exposure search produced no usable frame.
    pub fn capture(
        &self,
        request: &CaptureRequest,
        search: &mut ExposureSearch,
    ) -> Result<Option<Still>, CameraError> {
        let mut state = self.lock();
        self.enter_locked(&mut state, CaptureMode::StillCapture);
        let result = self.capture_locked(&mut state, request, search);
        self.teardown(&mut state);
        result
    }

    fn capture_locked(
        &self,
        state: &mut State,
        request: &CaptureRequest,
        search: &mut ExposureSearch,
    ) -> Result<Option<Still>, CameraError> {
        let settings = state.settings.clone();
        state.device.update_config(&settings);
        state.device.configure_still()?;

        match request {
            CaptureRequest::Day(day) => {
                state.device.set_controls(&day.controls())?;
                state.device.start()?;
                if !self.timing.settle.is_zero() {
                    thread::sleep(self.timing.settle);
                }
                let frame = state.device.capture_still()?;
                if frame.is_empty() {
                    return Err(CameraError::EmptyFrame);
                }
                Ok(Some(Still {
                    frame,
                    exposure_index: None,
                    converged: true,
                }))
            }
            CaptureRequest::Search { table, target } => {
                let result = search.run(state.device.as_mut(), table, target)?;
                Ok(result.map(|r| Still {
                    frame: r.frame,
                    exposure_index: Some(r.index),
                    converged: r.converged,
                }))
            }
        }
    }

    /// Start streaming unless a stream is already running.
    ///
    /// `None` settings mean streaming is disabled right now. Returns whether
    /// a new stream was started.
    pub fn stream_start(&self, settings: Option<&StreamSettings>) -> Result<bool, CameraError> {
        let Some(settings) = settings else {
            return Ok(false);
        };
        let mut state = self.lock();
        if state.stream.as_ref().is_some_and(StreamWorker::is_running) {
            return Ok(false);
        }

        self.enter_locked(&mut state, CaptureMode::Streaming);
        match self.open_stream_locked(&mut state, settings) {
            Ok(worker) => {
                state.stream = Some(worker);
                log::info!(
                    "Streaming started ({}x{} @ {} fps)",
                    settings.width,
                    settings.height,
                    settings.framerate
                );
                Ok(true)
            }
            Err(e) => {
                self.teardown(&mut state);
                Err(e)
            }
        }
    }

    fn open_stream_locked(
        &self,
        state: &mut State,
        settings: &StreamSettings,
    ) -> Result<StreamWorker, CameraError> {
        let mut controls = Controls {
            ae_enable: Some(true),
            awb_enable: Some(true),
            exposure_time_us: Some(0),
            ..Controls::default()
        };
        controls.merge(&settings.controls);
        let device_settings = state.settings.clone();
        state.device.update_config(&device_settings);
        state.device.set_controls(&controls)?;
        state.device.start()?;
        let session = state.device.open_stream(settings)?;
        StreamWorker::spawn(session)
    }

    /// Stop the stream and wait for its worker. Returns whether one was
    /// running.
    pub fn stream_stop(&self) -> bool {
        let mut state = self.lock();
        if self.current_mode() != CaptureMode::Streaming && state.stream.is_none() {
            return false;
        }
        log::info!("Stopping stream...");
        self.teardown(&mut state);
        true
    }

    /// Put the camera in FocusPreview with the sensor running.
    pub fn start_preview(&self) -> Result<(), CameraError> {
        let mut state = self.lock();
        self.enter_locked(&mut state, CaptureMode::FocusPreview);
        if let Err(e) = self.activate_preview_locked(&mut state) {
            self.teardown(&mut state);
            return Err(e);
        }
        Ok(())
    }

    fn activate_preview_locked(&self, state: &mut State) -> Result<(), CameraError> {
        let settings = state.settings.clone();
        state.device.update_config(&settings);
        state.device.configure_still()?;
        state.device.set_controls(&Controls {
            ae_enable: Some(true),
            awb_enable: Some(true),
            exposure_time_us: Some(0),
            ..Controls::default()
        })?;
        state.device.start()
    }

    /// One frame for the focus aid.
    pub fn preview_frame(&self) -> Result<CapturedFrame, CameraError> {
        let mut state = self.lock();
        let mode = self.current_mode();
        if mode != CaptureMode::FocusPreview {
            return Err(CameraError::WrongMode {
                expected: CaptureMode::FocusPreview,
                actual: mode,
            });
        }
        let frame = state.device.capture_still()?;
        if frame.is_empty() {
            return Err(CameraError::EmptyFrame);
        }
        Ok(frame)
    }

    /// Block until the camera is Idle or `timeout` passes. Returns whether
    /// it became Idle.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let mode = self.mode.lock().unwrap_or_else(PoisonError::into_inner);
        let (mode, _) = self
            .idle
            .wait_timeout_while(mode, timeout, |m| *m != CaptureMode::Idle)
            .unwrap_or_else(PoisonError::into_inner);
        *mode == CaptureMode::Idle
    }

    /// Stop the stream and the device, whatever mode is active.
    ///
    /// Waits for an operation already holding the camera, then tears down
    /// whatever it left running.
    pub fn force_idle(&self) {
        let mut state = self.lock();
        log::warn!("Forcing camera Idle from {} mode", self.current_mode());
        self.teardown(&mut state);
    }

    /// Stop everything, close the device and open a fresh one.
    pub fn hard_reset(&self) -> Result<(), CameraError> {
        let mut state = self.lock();
        log::info!("Hard resetting camera ({})", state.device.name());
        self.teardown(&mut state);
        state.device.close();
        let device = (self.factory)(&state.settings)?;
        state.device = device;
        log::info!("Camera re-acquired ({})", state.device.name());
        Ok(())
    }

    /// Forward orientation and size changes to the device.
    pub fn update_config(&self, settings: &DeviceSettings) {
        let mut state = self.lock();
        if state.settings != *settings {
            log::debug!("Camera settings changed: {:?}", settings);
            state.settings = settings.clone();
        }
        state.device.update_config(settings);
    }
}

impl Drop for CameraResource {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut worker) = state.stream.take() {
            worker.stop_and_join();
        }
        if state.device.is_started() {
            let _ = state.device.stop();
        }
        state.device.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::fake::{FakeCamera, FakeSettings};

    fn fake(settings: &DeviceSettings) -> Box<dyn CameraDevice> {
        Box::new(FakeCamera::new(
            FakeSettings {
                width: 16,
                height: 16,
                scene_brightness: 20.0,
            },
            settings.clone(),
        ))
    }

    fn resource() -> CameraResource {
        CameraResource::new(
            fake(&DeviceSettings::default()),
            DeviceSettings::default(),
            Box::new(|s: &DeviceSettings| Ok(fake(s))),
            ResourceTiming {
                settle: Duration::ZERO,
                teardown: Duration::ZERO,
            },
        )
    }

    #[test]
    fn test_enter_mode_replaces_previous() {
        let camera = resource();
        assert_eq!(camera.current_mode(), CaptureMode::Idle);
        camera.enter_mode(CaptureMode::FocusPreview);
        assert_eq!(camera.current_mode(), CaptureMode::FocusPreview);
        camera.enter_mode(CaptureMode::StillCapture);
        assert_eq!(camera.current_mode(), CaptureMode::StillCapture);
        camera.enter_mode(CaptureMode::Idle);
        assert_eq!(camera.current_mode(), CaptureMode::Idle);
    }

    #[test]
    fn test_preview_requires_focus_mode() {
        let camera = resource();
        assert!(matches!(
            camera.preview_frame(),
            Err(CameraError::WrongMode {
                actual: CaptureMode::Idle,
                ..
            })
        ));
        camera.start_preview().unwrap();
        assert!(!camera.preview_frame().unwrap().is_empty());
        camera.exit_mode();
        assert_eq!(camera.current_mode(), CaptureMode::Idle);
    }

    #[test]
    fn test_wait_until_idle_times_out() {
        let camera = resource();
        assert!(camera.wait_until_idle(Duration::from_millis(10)));
        camera.enter_mode(CaptureMode::FocusPreview);
        assert!(!camera.wait_until_idle(Duration::from_millis(20)));
        camera.force_idle();
        assert!(camera.wait_until_idle(Duration::ZERO));
    }

    #[test]
    fn test_capture_tears_down_stream_behind_idle_flag() {
        let camera = resource();
        let settings = StreamSettings {
            width: 16,
            height: 16,
            framerate: 30,
            bitrate: "100k".to_string(),
            bufsize: "200k".to_string(),
            youtube_key: None,
            controls: Controls::default(),
        };
        assert!(camera.stream_start(Some(&settings)).unwrap());
        camera.set_mode(CaptureMode::Idle);

        camera.enter_mode(CaptureMode::StillCapture);
        let state = camera.lock();
        assert!(state.stream.is_none());
        assert!(!state.device.is_started());
    }

    #[test]
    fn test_stream_start_disabled_is_noop() {
        let camera = resource();
        assert!(!camera.stream_start(None).unwrap());
        assert_eq!(camera.current_mode(), CaptureMode::Idle);
        assert!(!camera.stream_stop());
    }

    #[test]
    fn test_day_controls() {
        let controls = DayControls::default().controls();
        assert!(controls.auto_exposure());
        assert_eq!(controls.exposure_time_us, Some(0));
        assert_eq!(controls.analogue_gain, Some(1.0));
    }

    #[test]
    fn test_hard_reset_reopens_device() {
        let camera = resource();
        camera.start_preview().unwrap();
        camera.hard_reset().unwrap();
        assert_eq!(camera.current_mode(), CaptureMode::Idle);
        camera.start_preview().unwrap();
        assert!(camera.preview_frame().is_ok());
    }
}
