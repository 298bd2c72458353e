//! Post-processing of captured stills.
//!
//! [`ImagePipeline`] decodes the JPEG once, runs the stages in a fixed order
//! (unsharp mask, crop, privacy masks, annotation bar, overlays) and encodes
//! the result once.

mod annotate;
mod crop;
mod mask;
mod overlay;

pub use annotate::{expand_placeholders, Annotator};
pub use crop::{crop_box, CropBox};
pub use mask::{load_masks, point_in_polygon, MaskPoint, PrivacyMask, PrivacyMasker};
pub use overlay::{load_overlays, Overlay};

use chrono::{DateTime, Local};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};

use crate::config::Config;
use crate::day_period::DayPeriod;

/// JPEG quality of processed stills.
pub const OUTPUT_QUALITY: u8 = 90;
/// Sigma and threshold of the unsharp mask.
const UNSHARP_SIGMA: f32 = 3.0;
const UNSHARP_THRESHOLD: i32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("frame is empty")]
    Empty,
    #[error("failed to decode frame: {0}")]
    Decode(#[source] image::ImageError),
    #[error("failed to encode frame: {0}")]
    Encode(#[source] image::ImageError),
}

/// Facts about the frame the stages may print or use.
#[derive(Debug, Clone)]
pub struct FrameContext {
    pub device_id: String,
    pub period: DayPeriod,
    pub time: DateTime<Local>,
}

/// Turns a captured JPEG into the published JPEG.
pub trait FrameProcessor: Send + Sync {
    fn process(&self, jpeg: &[u8], ctx: &FrameContext) -> Result<Vec<u8>, ProcessingError>;
}

/// The standard stage chain.
pub struct ImagePipeline {
    unsharp: bool,
    crop: Option<CropBox>,
    masker: Option<PrivacyMasker>,
    annotator: Annotator,
    overlays: Vec<Overlay>,
}

impl ImagePipeline {
    pub fn new(
        unsharp: bool,
        crop: Option<CropBox>,
        masker: Option<PrivacyMasker>,
        annotator: Annotator,
        overlays: Vec<Overlay>,
    ) -> Self {
        Self {
            unsharp,
            crop,
            masker,
            annotator,
            overlays,
        }
    }

    pub fn from_config(config: &Config, overlays: Vec<Overlay>) -> Self {
        let c = &config.camera;
        let crop = c.crop.enabled.then(|| CropBox {
            width: c.crop.width,
            height: c.crop.height,
            x_offset: c.crop.x_offset,
            y_offset: c.crop.y_offset,
        });
        let masker = c.privacy_mask_file.clone().map(PrivacyMasker::new);
        Self::new(
            c.unsharp_mask,
            crop,
            masker,
            Annotator::from_config(&config.annotation),
            overlays,
        )
    }

    /// Run every stage on a decoded image.
    pub fn apply(&self, mut image: RgbImage, ctx: &FrameContext) -> RgbImage {
        if self.unsharp {
            image = image::imageops::unsharpen(&image, UNSHARP_SIGMA, UNSHARP_THRESHOLD);
        }
        if let Some(crop) = &self.crop {
            image = crop.apply(image);
        }
        if let Some(masker) = &self.masker {
            masker.apply(&mut image);
        }
        self.annotator.apply(&mut image, ctx);
        for overlay in &self.overlays {
            overlay.apply(&mut image);
        }
        image
    }
}

impl FrameProcessor for ImagePipeline {
    fn process(&self, jpeg: &[u8], ctx: &FrameContext) -> Result<Vec<u8>, ProcessingError> {
        if jpeg.is_empty() {
            return Err(ProcessingError::Empty);
        }
        let image = image::load_from_memory(jpeg)
            .map_err(ProcessingError::Decode)?
            .to_rgb8();
        let image = self.apply(image, ctx);
        encode_jpeg(&image, OUTPUT_QUALITY)
    }
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, ProcessingError> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode_image(image)
        .map_err(ProcessingError::Encode)?;
    Ok(out)
}

/// Alpha-blend `color` onto the pixel at (x, y). Out-of-bounds is ignored.
pub(crate) fn blend_pixel(image: &mut RgbImage, x: i64, y: i64, color: [u8; 3], alpha: u8) {
    if x < 0 || y < 0 || x >= image.width() as i64 || y >= image.height() as i64 {
        return;
    }
    let q = alpha as f32 / 255.0;
    let p = 1.0 - q;
    let Rgb(old) = *image.get_pixel(x as u32, y as u32);
    let new = [
        (old[0] as f32 * p + color[0] as f32 * q).round() as u8,
        (old[1] as f32 * p + color[1] as f32 * q).round() as u8,
        (old[2] as f32 * p + color[2] as f32 * q).round() as u8,
    ];
    image.put_pixel(x as u32, y as u32, Rgb(new));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnnotationConfig;

    fn ctx() -> FrameContext {
        FrameContext {
            device_id: "test".to_string(),
            period: DayPeriod::Night,
            time: Local::now(),
        }
    }

    fn jpeg(width: u32, height: u32, level: u8) -> Vec<u8> {
        encode_jpeg(&RgbImage::from_pixel(width, height, Rgb([level; 3])), 95).unwrap()
    }

    #[test]
    fn test_pipeline_crops_and_annotates() {
        let pipeline = ImagePipeline::new(
            false,
            Some(CropBox {
                width: 40,
                height: 30,
                x_offset: 0,
                y_offset: 0,
            }),
            None,
            Annotator::from_config(&AnnotationConfig {
                font_size: 6,
                offset: 2,
                ..AnnotationConfig::default()
            }),
            Vec::new(),
        );
        let out = pipeline.process(&jpeg(64, 48, 200), &ctx()).unwrap();
        let decoded = image::load_from_memory(&out).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (40, 30));
        // bar darkens the bottom rows, top stays bright
        assert!(decoded.get_pixel(20, 29).0[0] < 150);
        assert!(decoded.get_pixel(20, 2).0[0] > 180);
    }

    #[test]
    fn test_pipeline_rejects_bad_input() {
        let pipeline = ImagePipeline::new(
            true,
            None,
            None,
            Annotator::from_config(&AnnotationConfig::default()),
            Vec::new(),
        );
        assert!(matches!(pipeline.process(&[], &ctx()), Err(ProcessingError::Empty)));
        assert!(matches!(
            pipeline.process(&[0xff, 0xd8, 0x00], &ctx()),
            Err(ProcessingError::Decode(_))
        ));
    }

    #[test]
    fn test_blend_pixel() {
        let mut image = RgbImage::from_pixel(2, 2, Rgb([0, 0, 0]));
        blend_pixel(&mut image, 0, 0, [255, 255, 255], 255);
        blend_pixel(&mut image, 1, 0, [200, 100, 0], 128);
        blend_pixel(&mut image, -1, 5, [255, 255, 255], 255);
        assert_eq!(image.get_pixel(0, 0).0, [255, 255, 255]);
        assert_eq!(image.get_pixel(1, 0).0, [100, 50, 0]);
        assert_eq!(image.get_pixel(0, 1).0, [0, 0, 0]);
    }
}
