//! Camera device capability interface and backend selection.

use serde::{Deserialize, Serialize};

use super::fake::{FakeCamera, FakeSettings};
use super::rpicam::{RpicamCamera, RpicamSettings};
use super::types::{CameraError, CapturedFrame, Controls, DeviceSettings, StreamSettings};

/// Operations every camera backend provides.
///
/// `start`/`stop` bracket sensor activity. A still capture happens between
/// them; a stream session is opened after `start` and the device is stopped
/// once the session has finished.
pub trait CameraDevice: Send {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Apply orientation and size changes from a configuration refresh.
    fn update_config(&mut self, settings: &DeviceSettings);

    /// Prepare the sensor for full-resolution stills.
    fn configure_still(&mut self) -> Result<(), CameraError>;

    /// Merge `controls` into the active control set.
    fn set_controls(&mut self, controls: &Controls) -> Result<(), CameraError>;

    fn start(&mut self) -> Result<(), CameraError>;

    fn stop(&mut self) -> Result<(), CameraError>;

    fn is_started(&self) -> bool;

    /// Grab one encoded frame with the current controls.
    fn capture_still(&mut self) -> Result<CapturedFrame, CameraError>;

    /// Open a video session. The session runs on the stream worker thread,
    /// so it must not borrow the device.
    fn open_stream(
        &mut self,
        settings: &StreamSettings,
    ) -> Result<Box<dyn StreamSession>, CameraError>;

    /// Release the device handle. Further calls fail with `Closed`.
    fn close(&mut self);
}

/// Outcome of one streaming step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// A frame went out.
    Frame,
    /// Nothing to do this step.
    Idle,
}

/// A live video session driven by the stream worker.
pub trait StreamSession: Send {
    /// Do one bounded unit of work. Must return within a few hundred
    /// milliseconds so the worker can observe its stop flag.
    fn pump(&mut self) -> Result<StreamStatus, CameraError>;

    /// Tear the session down. Called exactly once when the worker exits.
    fn finish(&mut self) -> Result<(), CameraError>;
}

/// Available camera backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraBackend {
    /// Synthetic frames, no hardware required.
    #[default]
    Fake,
    /// Raspberry Pi camera through the rpicam-apps command-line tools.
    Rpicam,
}

/// Backend-specific construction parameters.
#[derive(Debug, Clone, Default)]
pub struct BackendOptions {
    pub fake: FakeSettings,
    pub rpicam: RpicamSettings,
}

/// Build a device for the given backend.
pub fn open_device(
    backend: CameraBackend,
    settings: &DeviceSettings,
    options: &BackendOptions,
) -> Result<Box<dyn CameraDevice>, CameraError> {
    let device: Box<dyn CameraDevice> = match backend {
        CameraBackend::Fake => Box::new(FakeCamera::new(options.fake.clone(), settings.clone())),
        CameraBackend::Rpicam => Box::new(RpicamCamera::open(
            options.rpicam.clone(),
            settings.clone(),
        )?),
    };
    log::info!("Camera device created ({})", device.name());
    Ok(device)
}
