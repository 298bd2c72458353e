//! Live preview with a crosshair, used while adjusting the lens.

use std::sync::Arc;

use image::{Rgb, RgbImage};

use crate::camera::{CameraError, CameraResource};
use crate::coordinator::CaptureCoordinator;
use crate::processing::{encode_jpeg, ProcessingError};

/// JPEG quality of preview frames.
pub const PREVIEW_QUALITY: u8 = 85;
/// Multipart boundary of the MJPEG preview.
pub const MJPEG_BOUNDARY: &str = "frame";

const CROSSHAIR: Rgb<u8> = Rgb([255, 0, 0]);

#[derive(Debug, thiserror::Error)]
pub enum FocusError {
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error(transparent)]
    Processing(#[from] ProcessingError),
    #[error("focus aid is not running")]
    Stopped,
}

/// A running focus session. Captures are paused until it stops.
pub struct FocusAid {
    coordinator: Arc<CaptureCoordinator>,
    camera: Arc<CameraResource>,
    running: bool,
}

impl FocusAid {
    pub fn start(
        coordinator: Arc<CaptureCoordinator>,
        camera: Arc<CameraResource>,
    ) -> Result<Self, FocusError> {
        log::info!("Starting focus aid");
        coordinator.pause();
        if let Err(e) = camera.start_preview() {
            coordinator.resume();
            return Err(e.into());
        }
        Ok(Self {
            coordinator,
            camera,
            running: true,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// One preview frame as JPEG with a crosshair through the center.
    pub fn next_frame(&self) -> Result<Vec<u8>, FocusError> {
        if !self.running {
            return Err(FocusError::Stopped);
        }
        let frame = self.camera.preview_frame()?;
        let mut image = image::load_from_memory(&frame.jpeg)
            .map_err(ProcessingError::Decode)?
            .to_rgb8();
        draw_crosshair(&mut image);
        Ok(encode_jpeg(&image, PREVIEW_QUALITY)?)
    }

    /// Leave preview mode and let captures run again.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.camera.exit_mode();
        self.coordinator.resume();
        log::info!("Focus aid stopped");
    }
}

impl Drop for FocusAid {
    fn drop(&mut self) {
        self.stop();
    }
}

pub fn draw_crosshair(image: &mut RgbImage) {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return;
    }
    let (cx, cy) = (w / 2, h / 2);
    for y in 0..h {
        image.put_pixel(cx, y, CROSSHAIR);
    }
    for x in 0..w {
        image.put_pixel(x, cy, CROSSHAIR);
    }
}

/// Wrap `jpeg` as one part of a `multipart/x-mixed-replace` stream.
pub fn mjpeg_part(jpeg: &[u8]) -> Vec<u8> {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        MJPEG_BOUNDARY,
        jpeg.len()
    );
    let mut part = Vec::with_capacity(header.len() + jpeg.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}
