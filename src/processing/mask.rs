//! Privacy masks: polygons blurred out of every still.
//!
//! The mask file is a JSON array of `{"points": [{"x": .., "y": ..}, ..]}`
//! with coordinates in percent of the image size. It is re-read on every
//! frame so edits take effect on the next capture.

use std::path::{Path, PathBuf};

use image::RgbImage;
use serde::Deserialize;

/// Sigma of the Gaussian blur applied inside masks.
pub const MASK_BLUR: f32 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct MaskPoint {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PrivacyMask {
    #[serde(default)]
    pub points: Vec<MaskPoint>,
}

/// Read masks from `path`. Missing or malformed files give no masks.
pub fn load_masks(path: &Path) -> Vec<PrivacyMask> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::debug!("{} not found, no privacy masks", path.display());
            return Vec::new();
        }
        Err(e) => {
            log::error!("Cannot read privacy masks from {}: {}", path.display(), e);
            return Vec::new();
        }
    };
    match serde_json::from_str::<Vec<PrivacyMask>>(&raw) {
        Ok(masks) => {
            let usable: Vec<_> = masks.into_iter().filter(|m| m.points.len() >= 3).collect();
            log::info!("Loaded {} privacy mask(s) from {}", usable.len(), path.display());
            usable
        }
        Err(e) => {
            log::error!("{} is corrupted, no privacy masks applied: {}", path.display(), e);
            Vec::new()
        }
    }
}

/// Even-odd test of `(x, y)` against `polygon`.
pub fn point_in_polygon(x: f64, y: f64, polygon: &[(f64, f64)]) -> bool {
    let mut inside = false;
    let mut j = polygon.len().wrapping_sub(1);
    for i in 0..polygon.len() {
        let (xi, yi) = polygon[i];
        let (xj, yj) = polygon[j];
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

pub struct PrivacyMasker {
    path: PathBuf,
}

impl PrivacyMasker {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn apply(&self, image: &mut RgbImage) {
        let masks = load_masks(&self.path);
        apply_masks(image, &masks);
    }
}

/// Replace the pixels inside each mask with a blurred copy.
pub fn apply_masks(image: &mut RgbImage, masks: &[PrivacyMask]) {
    if masks.is_empty() {
        return;
    }
    let (w, h) = image.dimensions();
    let polygons: Vec<Vec<(f64, f64)>> = masks
        .iter()
        .filter(|m| m.points.len() >= 3)
        .map(|m| {
            m.points
                .iter()
                .map(|p| (p.x / 100.0 * w as f64, p.y / 100.0 * h as f64))
                .collect()
        })
        .collect();
    if polygons.is_empty() {
        return;
    }

    let blurred = image::imageops::blur(&*image, MASK_BLUR);
    for polygon in &polygons {
        let (min_x, max_x, min_y, max_y) = bounds(polygon, w, h);
        for y in min_y..max_y {
            for x in min_x..max_x {
                if point_in_polygon(x as f64 + 0.5, y as f64 + 0.5, polygon) {
                    image.put_pixel(x, y, *blurred.get_pixel(x, y));
                }
            }
        }
    }
}

fn bounds(polygon: &[(f64, f64)], w: u32, h: u32) -> (u32, u32, u32, u32) {
    let clamp = |v: f64, max: u32| v.clamp(0.0, max as f64) as u32;
    let min_x = polygon.iter().map(|p| p.0).fold(f64::INFINITY, f64::min);
    let max_x = polygon.iter().map(|p| p.0).fold(f64::NEG_INFINITY, f64::max);
    let min_y = polygon.iter().map(|p| p.1).fold(f64::INFINITY, f64::min);
    let max_y = polygon.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max);
    (
        clamp(min_x.floor(), w),
        clamp(max_x.ceil(), w),
        clamp(min_y.floor(), h),
        clamp(max_y.ceil(), h),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use tempfile::TempDir;

    fn checkerboard(size: u32) -> RgbImage {
        RgbImage::from_fn(size, size, |x, y| {
            if (x + y) % 2 == 0 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        })
    }

    #[test]
    fn test_point_in_polygon() {
        let square = [(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)];
        assert!(point_in_polygon(5.0, 5.0, &square));
        assert!(!point_in_polygon(15.0, 5.0, &square));
        let triangle = [(0.0, 0.0), (10.0, 0.0), (0.0, 10.0)];
        assert!(point_in_polygon(2.0, 2.0, &triangle));
        assert!(!point_in_polygon(8.0, 8.0, &triangle));
    }

    #[test]
    fn test_mask_blurs_only_inside() {
        let mut image = checkerboard(40);
        let left_half = PrivacyMask {
            points: vec![
                MaskPoint { x: 0.0, y: 0.0 },
                MaskPoint { x: 50.0, y: 0.0 },
                MaskPoint { x: 50.0, y: 100.0 },
                MaskPoint { x: 0.0, y: 100.0 },
            ],
        };
        apply_masks(&mut image, &[left_half]);
        let inside = image.get_pixel(10, 20).0[0];
        assert!(inside > 60 && inside < 200, "inside was {}", inside);
        assert_eq!(image.get_pixel(30, 20).0[0], 255);
        assert_eq!(image.get_pixel(31, 20).0[0], 0);
    }

    #[test]
    fn test_load_masks_tolerates_bad_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".privacy_mask.json");
        assert!(load_masks(&path).is_empty());

        std::fs::write(&path, "{ not json").unwrap();
        assert!(load_masks(&path).is_empty());

        std::fs::write(
            &path,
            r#"[{"points": [{"x": 0, "y": 0}, {"x": 10, "y": 0}]},
                {"points": [{"x": 0, "y": 0}, {"x": 10, "y": 0}, {"x": 10, "y": 10}]}]"#,
        )
        .unwrap();
        assert_eq!(load_masks(&path).len(), 1);
    }
}
