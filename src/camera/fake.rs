//! Synthetic camera for development boards without a sensor.
//!
//! Frames are flat gray JPEGs. With auto exposure off, the gray level grows
//! linearly with exposure time, so the bracketing search behaves the way it
//! does against a real night sky.

use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use std::thread;
use std::time::{Duration, Instant};

use super::device::{CameraDevice, StreamSession, StreamStatus};
use super::types::{
    CameraError, CapturedFrame, Controls, DeviceSettings, FrameMetadata, StreamSettings,
};

/// Settings for the synthetic camera.
#[derive(Debug, Clone)]
pub struct FakeSettings {
    pub width: u32,
    pub height: u32,
    /// Gray levels gained per second of exposure at unity gain.
    pub scene_brightness: f64,
}

impl Default for FakeSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            scene_brightness: 20.0,
        }
    }
}

/// Gray level the AE algorithm settles on.
const AUTO_EXPOSURE_LEVEL: f64 = 118.0;
/// Exposure reported for auto-exposed frames.
const AUTO_EXPOSURE_US: u64 = 8_000;

pub struct FakeCamera {
    settings: FakeSettings,
    device: DeviceSettings,
    controls: Controls,
    started: bool,
    closed: bool,
    frames: u64,
}

impl FakeCamera {
    pub fn new(settings: FakeSettings, device: DeviceSettings) -> Self {
        Self {
            settings,
            device,
            controls: Controls::default(),
            started: false,
            closed: false,
            frames: 0,
        }
    }

    /// Gray level the current controls would produce.
    pub fn expected_level(&self) -> f64 {
        if self.controls.auto_exposure() {
            return AUTO_EXPOSURE_LEVEL;
        }
        let exposure_secs = self.controls.exposure_time_us.unwrap_or(0) as f64 / 1_000_000.0;
        let gain = self.controls.analogue_gain.unwrap_or(1.0) as f64;
        (self.settings.scene_brightness * exposure_secs * gain).clamp(0.0, 255.0)
    }

    fn ensure_open(&self) -> Result<(), CameraError> {
        if self.closed {
            Err(CameraError::Closed)
        } else {
            Ok(())
        }
    }

    fn render(&self, level: u8) -> Result<Vec<u8>, CameraError> {
        let (width, height) = self
            .device
            .still_size
            .unwrap_or((self.settings.width, self.settings.height));
        // slow tint drift so consecutive day frames are not byte-identical
        let tint = (self.frames % 16) as u8;
        let pixel = if self.controls.auto_exposure() {
            Rgb([level.saturating_add(tint), level, level.saturating_sub(tint)])
        } else {
            Rgb([level, level, level])
        };
        let image = RgbImage::from_pixel(width, height, pixel);

        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, 90)
            .encode_image(&image)
            .map_err(|e| CameraError::Io(std::io::Error::other(e)))?;
        Ok(jpeg)
    }
}

impl CameraDevice for FakeCamera {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn update_config(&mut self, settings: &DeviceSettings) {
        self.device = settings.clone();
    }

    fn configure_still(&mut self) -> Result<(), CameraError> {
        self.ensure_open()
    }

    fn set_controls(&mut self, controls: &Controls) -> Result<(), CameraError> {
        self.ensure_open()?;
        self.controls.merge(controls);
        Ok(())
    }

    fn start(&mut self) -> Result<(), CameraError> {
        self.ensure_open()?;
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CameraError> {
        self.started = false;
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started
    }

    fn capture_still(&mut self) -> Result<CapturedFrame, CameraError> {
        self.ensure_open()?;
        if !self.started {
            return Err(CameraError::NotStarted);
        }

        let level = self.expected_level().round() as u8;
        let jpeg = self.render(level)?;
        self.frames += 1;

        let exposure_time_us = if self.controls.auto_exposure() {
            AUTO_EXPOSURE_US
        } else {
            self.controls.exposure_time_us.unwrap_or(0)
        };
        let metadata = FrameMetadata {
            exposure_time_us: Some(exposure_time_us),
            analogue_gain: Some(self.controls.analogue_gain.unwrap_or(1.0)),
            ..FrameMetadata::default()
        };
        Ok(CapturedFrame::new(jpeg, metadata))
    }

    fn open_stream(
        &mut self,
        settings: &StreamSettings,
    ) -> Result<Box<dyn StreamSession>, CameraError> {
        self.ensure_open()?;
        if !self.started {
            return Err(CameraError::NotStarted);
        }
        log::info!(
            "Fake stream opened ({}x{} @ {} fps)",
            settings.width,
            settings.height,
            settings.framerate
        );
        Ok(Box::new(FakeStream::new(settings.framerate)))
    }

    fn close(&mut self) {
        self.started = false;
        self.closed = true;
    }
}

/// Paces "frames" at the configured rate and counts them.
struct FakeStream {
    interval: Duration,
    next_frame: Instant,
    frames: u64,
}

impl FakeStream {
    fn new(framerate: u32) -> Self {
        let interval = Duration::from_secs(1) / framerate.max(1);
        Self {
            interval,
            next_frame: Instant::now(),
            frames: 0,
        }
    }
}

impl StreamSession for FakeStream {
    fn pump(&mut self) -> Result<StreamStatus, CameraError> {
        let now = Instant::now();
        if now < self.next_frame {
            thread::sleep(self.next_frame - now);
        }
        self.next_frame += self.interval;
        self.frames += 1;
        Ok(StreamStatus::Frame)
    }

    fn finish(&mut self) -> Result<(), CameraError> {
        log::info!("Fake stream stopped after {} frames", self.frames);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera() -> FakeCamera {
        FakeCamera::new(
            FakeSettings {
                width: 32,
                height: 24,
                scene_brightness: 20.0,
            },
            DeviceSettings::default(),
        )
    }

    #[test]
    fn test_capture_requires_start() {
        let mut cam = camera();
        assert!(matches!(cam.capture_still(), Err(CameraError::NotStarted)));
        cam.start().unwrap();
        let frame = cam.capture_still().unwrap();
        assert!(!frame.is_empty());
        assert_eq!(frame.metadata.exposure_time_us, Some(AUTO_EXPOSURE_US));
    }

    #[test]
    fn test_manual_level_follows_exposure() {
        let mut cam = camera();
        cam.set_controls(&Controls::manual_exposure().with_exposure_time(2_000_000))
            .unwrap();
        assert_eq!(cam.expected_level(), 40.0);
        cam.set_controls(&Controls::default().with_exposure_time(60_000_000))
            .unwrap();
        assert_eq!(cam.expected_level(), 255.0);
    }

    #[test]
    fn test_frame_decodes_to_expected_gray() {
        let mut cam = camera();
        cam.set_controls(&Controls::manual_exposure().with_exposure_time(4_000_000))
            .unwrap();
        cam.start().unwrap();
        let frame = cam.capture_still().unwrap();
        let decoded = image::load_from_memory(&frame.jpeg).unwrap().to_luma8();
        let level = decoded.get_pixel(10, 10).0[0] as i32;
        assert!((level - 80).abs() <= 2, "level was {}", level);
    }

    #[test]
    fn test_closed_device_rejects_work() {
        let mut cam = camera();
        cam.close();
        assert!(matches!(cam.start(), Err(CameraError::Closed)));
        assert!(!cam.is_started());
    }

    #[test]
    fn test_stream_session_paces_frames() {
        let mut cam = camera();
        cam.start().unwrap();
        let settings = StreamSettings {
            width: 32,
            height: 24,
            framerate: 100,
            bitrate: "1k".to_string(),
            bufsize: "2k".to_string(),
            youtube_key: None,
            controls: Controls::default(),
        };
        let mut session = cam.open_stream(&settings).unwrap();
        let started = Instant::now();
        for _ in 0..5 {
            assert_eq!(session.pump().unwrap(), StreamStatus::Frame);
        }
        assert!(started.elapsed() >= Duration::from_millis(35));
        session.finish().unwrap();
    }
}
