//! Camera access for the appliance.
//!
//! - Device backends behind [`CameraDevice`] ([`open_device`])
//! - Exclusive mode handling via [`CameraResource`]
//! - Streaming on a background thread via [`StreamWorker`]

mod device;
mod fake;
mod process;
mod resource;
mod rpicam;
mod stream;
mod types;

pub use device::{
    open_device, BackendOptions, CameraBackend, CameraDevice, StreamSession, StreamStatus,
};
pub use fake::{FakeCamera, FakeSettings};
pub use resource::{
    CameraResource, CaptureRequest, DayControls, DeviceFactory, ResourceTiming, Still,
};
pub use rpicam::{RpicamCamera, RpicamSettings, YOUTUBE_RTMP_URL};
pub use stream::StreamWorker;
pub use types::{
    CameraError, CaptureMode, CapturedFrame, Controls, DeviceSettings, FrameMetadata,
    StreamSettings, Transform,
};
