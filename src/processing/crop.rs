//! Centered crop with offsets.

use image::RgbImage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropBox {
    pub width: u32,
    pub height: u32,
    pub x_offset: i32,
    pub y_offset: i32,
}

/// Pixel rectangle `(x, y, width, height)` to keep, or `None` when the crop
/// is larger than the image or ends up empty.
pub fn crop_box(image_w: u32, image_h: u32, crop: &CropBox) -> Option<(u32, u32, u32, u32)> {
    if crop.width > image_w || crop.height > image_h {
        return None;
    }
    let (iw, ih) = (image_w as i64, image_h as i64);
    let (cw, ch) = (crop.width as i64, crop.height as i64);

    let left = ((iw - cw) / 2 + crop.x_offset as i64).max(0);
    let top = ((ih - ch) / 2 + crop.y_offset as i64).max(0);
    let right = ((iw + cw) / 2 + crop.x_offset as i64).min(iw);
    let bottom = ((ih + ch) / 2 + crop.y_offset as i64).min(ih);

    if right <= left || bottom <= top {
        return None;
    }
    Some((
        left as u32,
        top as u32,
        (right - left) as u32,
        (bottom - top) as u32,
    ))
}

impl CropBox {
    pub fn apply(&self, image: RgbImage) -> RgbImage {
        let (w, h) = image.dimensions();
        match crop_box(w, h, self) {
            Some((x, y, cw, ch)) => image::imageops::crop_imm(&image, x, y, cw, ch).to_image(),
            None => {
                log::warn!(
                    "Crop {}x{} does not fit a {}x{} image, skipping crop",
                    self.width,
                    self.height,
                    w,
                    h
                );
                image
            }
        }
    }
}
