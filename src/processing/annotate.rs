//! Bottom annotation bar with a caption and a timestamp.

use std::fmt::Write;

use image::RgbImage;
use rusttype::{point, Font, Scale};

use super::{blend_pixel, FrameContext};
use crate::config::{AnnotationConfig, Rgba};

/// Left margin of the caption.
const TEXT_MARGIN: f32 = 10.0;

/// Substitute `{device}` and `{period}` in `text`.
pub fn expand_placeholders(text: &str, ctx: &FrameContext) -> String {
    text.replace("{device}", &ctx.device_id)
        .replace("{period}", ctx.period.as_str())
}

pub struct Annotator {
    config: AnnotationConfig,
    font: Option<Font<'static>>,
}

impl Annotator {
    /// Load the font named in `config`. Without one only the bar is drawn.
    pub fn from_config(config: &AnnotationConfig) -> Self {
        let font = config.font_path.as_ref().and_then(|path| {
            let bytes = match std::fs::read(path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::error!("Cannot read font {}: {}", path.display(), e);
                    return None;
                }
            };
            let font = Font::try_from_vec(bytes);
            if font.is_none() {
                log::error!("{} is not a usable TrueType font", path.display());
            }
            font
        });
        Self {
            config: config.clone(),
            font,
        }
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    pub fn bar_height(&self) -> u32 {
        self.config.font_size + 2 * self.config.offset
    }

    pub fn apply(&self, image: &mut RgbImage, ctx: &FrameContext) {
        let (w, h) = image.dimensions();
        let bar = self.bar_height().min(h);
        let color = self.config.bar_color;
        for y in (h - bar)..h {
            for x in 0..w {
                blend_pixel(image, x as i64, y as i64, [color.r, color.g, color.b], color.a);
            }
        }

        let Some(font) = &self.font else {
            return;
        };
        let top = h as f32 - (self.config.font_size + self.config.offset) as f32;
        let caption = expand_placeholders(&self.config.text, ctx);
        draw_text(image, font, self.config.font_size, TEXT_MARGIN, top, &caption, self.config.text_color);

        let mut stamp = String::new();
        if write!(stamp, "{}", ctx.time.format(&self.config.datetime_format)).is_err() {
            log::warn!("Invalid datetime_format '{}'", self.config.datetime_format);
            return;
        }
        let width = text_width(font, self.config.font_size, &stamp);
        let x = w as f32 - width - self.config.offset as f32;
        draw_text(image, font, self.config.font_size, x, top, &stamp, self.config.text_color);
    }
}

fn text_width(font: &Font<'_>, size: u32, text: &str) -> f32 {
    let scale = Scale::uniform(size as f32);
    font.layout(text, scale, point(0.0, 0.0))
        .last()
        .map(|g| g.position().x + g.unpositioned().h_metrics().advance_width)
        .unwrap_or(0.0)
}

fn draw_text(
    image: &mut RgbImage,
    font: &Font<'_>,
    size: u32,
    x: f32,
    top: f32,
    text: &str,
    color: Rgba,
) {
    let scale = Scale::uniform(size as f32);
    let ascent = font.v_metrics(scale).ascent;
    for glyph in font.layout(text, scale, point(x, top + ascent)) {
        if let Some(bb) = glyph.pixel_bounding_box() {
            glyph.draw(|gx, gy, coverage| {
                let alpha = (coverage * color.a as f32).round() as u8;
                blend_pixel(
                    image,
                    bb.min.x as i64 + gx as i64,
                    bb.min.y as i64 + gy as i64,
                    [color.r, color.g, color.b],
                    alpha,
                );
            });
        }
    }
}
