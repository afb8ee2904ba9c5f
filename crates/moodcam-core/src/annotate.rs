//! Drawing detection overlays onto frames.
//!
//! Each detected face gets a hollow box and an emotion label placed just
//! above it. Label text needs a TTF font supplied at construction; when
//! none is configured the annotator still draws boxes and logs that
//! labels are off.

use crate::types::Detection;
use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::path::Path;

/// Box border thickness in pixels.
const BOX_THICKNESS: i32 = 2;
/// Label text height in pixels.
const LABEL_HEIGHT: f32 = 24.0;
/// Gap between the label baseline and the top edge of the box.
const LABEL_GAP: i32 = 10;

/// Draws face boxes and emotion labels onto RGB frames.
pub struct Annotator {
    color: Rgb<u8>,
    font: Option<FontVec>,
}

impl Annotator {
    /// Build an annotator with the given box color and optional label font.
    pub fn new(color: Rgb<u8>, font_path: Option<&Path>) -> Self {
        let font = font_path.and_then(|path| match std::fs::read(path) {
            Ok(bytes) => match FontVec::try_from_vec(bytes) {
                Ok(font) => Some(font),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "label font did not parse, drawing boxes only"
                    );
                    None
                }
            },
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "label font not readable, drawing boxes only"
                );
                None
            }
        });

        Self { color, font }
    }

    /// Draw every detection onto the frame in place.
    pub fn annotate(&self, image: &mut RgbImage, detections: &[Detection]) {
        for detection in detections {
            let rect = &detection.rect;
            self.draw_box(image, rect.x, rect.y, rect.width, rect.height);

            if let Some(font) = &self.font {
                let label = format!("{} {}", detection.emotion.label(), detection.emotion.emoji());
                let text_y = (rect.y - LABEL_GAP - LABEL_HEIGHT as i32).max(0);
                draw_text_mut(
                    image,
                    self.color,
                    rect.x,
                    text_y,
                    PxScale::from(LABEL_HEIGHT),
                    font,
                    &label,
                );
            }
        }
    }

    /// Hollow rectangle with a fixed border thickness, drawn as nested
    /// one-pixel outlines.
    fn draw_box(&self, image: &mut RgbImage, x: i32, y: i32, w: u32, h: u32) {
        for i in 0..BOX_THICKNESS {
            let shrink = 2 * i as u32;
            if w <= shrink || h <= shrink {
                break;
            }
            let rect = Rect::at(x + i, y + i).of_size(w - shrink, h - shrink);
            draw_hollow_rect_mut(image, rect, self.color);
        }
    }
}

/// Parse a `#RRGGBB` (or bare `RRGGBB`) color string.
pub fn parse_hex_color(s: &str) -> Option<Rgb<u8>> {
    let hex = s.strip_prefix('#').unwrap_or(s);
    if hex.len() != 6 {
        return None;
    }
    let channel = |range: std::ops::Range<usize>| u8::from_str_radix(&hex[range], 16).ok();
    Some(Rgb([channel(0..2)?, channel(2..4)?, channel(4..6)?]))
}
