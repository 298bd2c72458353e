//! Logo and watermark overlays.

use image::imageops::FilterType;
use image::RgbaImage;

use super::blend_pixel;
use crate::config::OverlayConfig;

/// A decoded overlay, already scaled.
#[derive(Debug, Clone)]
pub struct Overlay {
    pub name: String,
    pub image: RgbaImage,
    pub x: i64,
    pub y: i64,
}

impl Overlay {
    /// Decode `bytes` and scale by `config.scale` percent.
    pub fn from_bytes(config: &OverlayConfig, bytes: &[u8]) -> Result<Self, image::ImageError> {
        let image = image::load_from_memory(bytes)?.to_rgba8();
        let (w, h) = image.dimensions();
        let scale = config.scale.max(1);
        let image = if scale == 100 {
            image
        } else {
            let sw = (w * scale / 100).max(1);
            let sh = (h * scale / 100).max(1);
            image::imageops::resize(&image, sw, sh, FilterType::Lanczos3)
        };
        Ok(Self {
            name: config.name.clone(),
            image,
            x: config.x,
            y: config.y,
        })
    }

    /// Alpha-composite onto `target` at the configured position.
    pub fn apply(&self, target: &mut image::RgbImage) {
        for (ox, oy, px) in self.image.enumerate_pixels() {
            let [r, g, b, a] = px.0;
            if a == 0 {
                continue;
            }
            blend_pixel(target, self.x + ox as i64, self.y + oy as i64, [r, g, b], a);
        }
    }
}

async fn fetch(client: &reqwest::Client, source: &str) -> Result<Vec<u8>, String> {
    if source.starts_with("http://") || source.starts_with("https://") {
        let response = client
            .get(source)
            .send()
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?;
        let bytes = response.bytes().await.map_err(|e| e.to_string())?;
        Ok(bytes.to_vec())
    } else {
        tokio::fs::read(source).await.map_err(|e| e.to_string())
    }
}

/// Load every enabled overlay. Failures are logged and the overlay skipped.
pub async fn load_overlays(client: &reqwest::Client, configs: &[OverlayConfig]) -> Vec<Overlay> {
    let mut overlays = Vec::new();
    for config in configs.iter().filter(|c| c.enabled) {
        let bytes = match fetch(client, &config.source).await {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Failed to download {} from {}: {}", config.name, config.source, e);
                continue;
            }
        };
        match Overlay::from_bytes(config, &bytes) {
            Ok(overlay) => {
                log::info!(
                    "Loaded overlay {} ({}x{})",
                    overlay.name,
                    overlay.image.width(),
                    overlay.image.height()
                );
                overlays.push(overlay);
            }
            Err(e) => log::error!("Overlay {} is not an image: {}", config.name, e),
        }
    }
    overlays
}
