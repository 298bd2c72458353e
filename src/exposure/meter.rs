//! Mean-brightness measurement of captured frames.

use crate::camera::CapturedFrame;

#[derive(Debug, thiserror::Error)]
pub enum MeterError {
    #[error("frame has no pixels")]
    Empty,
    #[error("failed to decode frame: {0}")]
    Decode(#[from] image::ImageError),
}

/// Scalar brightness on a 0-255 scale.
pub trait BrightnessMeter: Send + Sync {
    fn measure(&self, frame: &CapturedFrame) -> Result<f64, MeterError>;
}

/// Mean ITU-R BT.601 luminance of the decoded JPEG.
#[derive(Debug, Clone, Copy, Default)]
pub struct LumaMeter;

impl BrightnessMeter for LumaMeter {
    fn measure(&self, frame: &CapturedFrame) -> Result<f64, MeterError> {
        if frame.is_empty() {
            return Err(MeterError::Empty);
        }
        let rgb = image::load_from_memory(&frame.jpeg)?.to_rgb8();
        mean_luma(rgb.as_raw())
    }
}

/// Mean luminance over packed RGB bytes, integer BT.601 weights per pixel.
pub fn mean_luma(rgb: &[u8]) -> Result<f64, MeterError> {
    let mut total: u64 = 0;
    let mut pixels: u64 = 0;
    for px in rgb.chunks_exact(3) {
        let r = px[0] as u32;
        let g = px[1] as u32;
        let b = px[2] as u32;
        total += ((299 * r + 587 * g + 114 * b) / 1000) as u64;
        pixels += 1;
    }
    if pixels == 0 {
        return Err(MeterError::Empty);
    }
    Ok(total as f64 / pixels as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::FrameMetadata;
    use image::codecs::png::PngEncoder;
    use image::{ImageEncoder, Rgb, RgbImage};

    #[test]
    fn test_mean_luma_weights() {
        assert_eq!(mean_luma(&[255, 0, 0]).unwrap(), 76.0);
        assert_eq!(mean_luma(&[0, 255, 0]).unwrap(), 149.0);
        assert_eq!(mean_luma(&[0, 0, 255]).unwrap(), 29.0);
        assert_eq!(mean_luma(&[255, 255, 255, 0, 0, 0]).unwrap(), 127.5);
    }

    #[test]
    fn test_mean_luma_empty() {
        assert!(matches!(mean_luma(&[]), Err(MeterError::Empty)));
    }

    #[test]
    fn test_luma_meter_decodes_frame() {
        // PNG keeps the pixels exact
        let image = RgbImage::from_pixel(8, 8, Rgb([100, 100, 100]));
        let mut bytes = Vec::new();
        PngEncoder::new(&mut bytes)
            .write_image(image.as_raw(), 8, 8, image::ExtendedColorType::Rgb8)
            .unwrap();
        let frame = CapturedFrame::new(bytes, FrameMetadata::default());
        assert_eq!(LumaMeter.measure(&frame).unwrap(), 100.0);
    }

    #[test]
    fn test_luma_meter_rejects_garbage() {
        let frame = CapturedFrame::new(vec![1, 2, 3, 4], FrameMetadata::default());
        assert!(matches!(LumaMeter.measure(&frame), Err(MeterError::Decode(_))));
        let empty = CapturedFrame::new(Vec::new(), FrameMetadata::default());
        assert!(matches!(LumaMeter.measure(&empty), Err(MeterError::Empty)));
    }
}
