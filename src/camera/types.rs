//! Camera types and data structures.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The mutually exclusive ways the physical camera can be in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    #[default]
    Idle,
    StillCapture,
    Streaming,
    FocusPreview,
}

impl fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CaptureMode::Idle => "idle",
            CaptureMode::StillCapture => "still-capture",
            CaptureMode::Streaming => "streaming",
            CaptureMode::FocusPreview => "focus-preview",
        };
        f.write_str(name)
    }
}

/// Sensor readout orientation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transform {
    pub hflip: bool,
    pub vflip: bool,
}

/// Settings that follow the device across mode changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceSettings {
    pub transform: Transform,
    /// Still resolution; `None` lets the backend use the full sensor.
    pub still_size: Option<(u32, u32)>,
}

/// Sensor controls. Unset fields leave the device's current value alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Controls {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ae_enable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub awb_enable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub awb_mode: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metering_mode: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analogue_gain: Option<f32>,
    /// Microseconds; 0 hands exposure back to the AE algorithm.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exposure_time_us: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exposure_value: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hdr_mode: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub noise_reduction_mode: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sharpness: Option<f32>,
    /// (min, max) frame duration in microseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_duration_limits: Option<(u64, u64)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<f32>,
}

impl Controls {
    /// Manual exposure used while bracketing: AE off, AWB on, unity gain and
    /// frame durations long enough for the longest shutter in the table.
    pub fn manual_exposure() -> Self {
        Self {
            ae_enable: Some(false),
            awb_enable: Some(true),
            analogue_gain: Some(1.0),
            frame_duration_limits: Some((100, 100_000_000)),
            ..Self::default()
        }
    }

    pub fn with_exposure_time(mut self, exposure_us: u64) -> Self {
        self.exposure_time_us = Some(exposure_us);
        self
    }

    /// Overlay every field set in `other` onto `self`.
    pub fn merge(&mut self, other: &Controls) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() {
                    self.$field = other.$field;
                })*
            };
        }
        take!(
            ae_enable,
            awb_enable,
            awb_mode,
            metering_mode,
            analogue_gain,
            exposure_time_us,
            exposure_value,
            hdr_mode,
            noise_reduction_mode,
            sharpness,
            frame_duration_limits,
            frame_rate
        );
    }

    /// Whether the sensor is expected to pick its own exposure.
    pub fn auto_exposure(&self) -> bool {
        self.ae_enable.unwrap_or(true)
    }
}

/// Per-frame information reported by the sensor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exposure_time_us: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analogue_gain: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digital_gain: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lux: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub colour_temperature: Option<u32>,
}

impl FrameMetadata {
    /// Exposure in seconds, for log lines.
    pub fn exposure_secs(&self) -> Option<f64> {
        self.exposure_time_us.map(|us| us as f64 / 1_000_000.0)
    }
}

/// An encoded still frame as returned by the device.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// JPEG bytes.
    pub jpeg: Vec<u8>,
    pub metadata: FrameMetadata,
    pub captured_at: DateTime<Local>,
}

impl CapturedFrame {
    pub fn new(jpeg: Vec<u8>, metadata: FrameMetadata) -> Self {
        Self {
            jpeg,
            metadata,
            captured_at: Local::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.jpeg.is_empty()
    }
}

/// Everything a stream session needs to know when it is opened.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSettings {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub bitrate: String,
    pub bufsize: String,
    /// YouTube stream key; `None` streams to nowhere (sensor kept warm only).
    pub youtube_key: Option<String>,
    pub controls: Controls,
}

/// Errors that can occur during camera operations.
#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    /// The device produced a frame with no data.
    #[error("camera returned an empty frame")]
    EmptyFrame,
    /// The frame could not be decoded for measurement.
    #[error("captured frame could not be decoded: {0}")]
    Undecodable(String),
    /// A helper executable is not installed.
    #[error("'{0}' not found; is it installed and on PATH?")]
    CommandNotFound(String),
    /// A helper executable exited unsuccessfully.
    #[error("'{program}' exited with code {code:?}: {stderr}")]
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    /// Failed to start or keep a video stream.
    #[error("stream failed: {0}")]
    StreamFailed(String),
    /// The device handle has been closed.
    #[error("camera device is closed")]
    Closed,
    /// A frame was requested before `start`.
    #[error("camera is not started")]
    NotStarted,
    /// The device could not be opened.
    #[error("failed to open camera: {0}")]
    OpenFailed(String),
    /// Operation requires a different mode.
    #[error("camera is in {actual} mode, expected {expected}")]
    WrongMode {
        expected: CaptureMode,
        actual: CaptureMode,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CameraError {
    /// Failures that only spoil the current frame. Everything else points at
    /// the device itself.
    pub fn is_transient(&self) -> bool {
        matches!(self, CameraError::EmptyFrame | CameraError::Undecodable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_exposure_controls() {
        let controls = Controls::manual_exposure().with_exposure_time(250_000);
        assert_eq!(controls.ae_enable, Some(false));
        assert_eq!(controls.awb_enable, Some(true));
        assert_eq!(controls.analogue_gain, Some(1.0));
        assert_eq!(controls.exposure_time_us, Some(250_000));
        assert!(!controls.auto_exposure());
    }

    #[test]
    fn test_controls_merge_keeps_unset_fields() {
        let mut base = Controls::manual_exposure();
        let patch = Controls {
            exposure_time_us: Some(1_000_000),
            sharpness: Some(4.0),
            ..Controls::default()
        };
        base.merge(&patch);
        assert_eq!(base.ae_enable, Some(false));
        assert_eq!(base.exposure_time_us, Some(1_000_000));
        assert_eq!(base.sharpness, Some(4.0));
    }

    #[test]
    fn test_default_controls_are_auto() {
        assert!(Controls::default().auto_exposure());
    }

    #[test]
    fn test_transient_errors() {
        assert!(CameraError::EmptyFrame.is_transient());
        assert!(CameraError::Undecodable("bad".to_string()).is_transient());
        assert!(!CameraError::Closed.is_transient());
        assert!(!CameraError::CommandNotFound("rpicam-still".to_string()).is_transient());
    }

    #[test]
    fn test_camera_error_display() {
        let err = CameraError::CommandFailed {
            program: "rpicam-still".to_string(),
            code: Some(255),
            stderr: "no cameras available".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("rpicam-still"));
        assert!(msg.contains("no cameras available"));
        assert_eq!(
            CameraError::WrongMode {
                expected: CaptureMode::FocusPreview,
                actual: CaptureMode::Idle
            }
            .to_string(),
            "camera is in idle mode, expected focus-preview"
        );
    }

    #[test]
    fn test_metadata_exposure_secs() {
        let meta = FrameMetadata {
            exposure_time_us: Some(2_500_000),
            ..FrameMetadata::default()
        };
        assert_eq!(meta.exposure_secs(), Some(2.5));
    }
}
