//! Text rasterization
//!
//! Glyphs are rasterized with fontdue from the first usable system font and
//! cached per character. Without a font, text is measured with fixed
//! metrics and not drawn, so damage accounting stays correct either way.

use std::collections::HashMap;

use crate::geometry::{Color, Point, Rect, Size};
use crate::image::Painter;

struct GlyphData {
    bitmap: Vec<u8>,
    width: i32,
    height: i32,
    x_offset: i32,
    y_offset: i32,
    advance: f32,
}

/// Font-backed text renderer with a glyph cache
pub struct TextRenderer {
    font: Option<fontdue::Font>,
    font_size: f32,
    glyph_cache: HashMap<char, GlyphData>,
}

impl TextRenderer {
    /// Common font search paths
    const FONT_SEARCH_PATHS: &'static [&'static str] = &[
        "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
        "/usr/share/fonts/TTF/DejaVuSans.ttf",
        "/usr/share/fonts/dejavu/DejaVuSans.ttf",
        "/usr/share/fonts/truetype/dejavu/DejaVuSansMono.ttf",
        "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
        "/usr/share/fonts/liberation-sans/LiberationSans-Regular.ttf",
        "/usr/share/fonts/truetype/noto/NotoSans-Regular.ttf",
        "/usr/share/fonts/noto/NotoSans-Regular.ttf",
    ];

    fn find_font() -> Option<(fontdue::Font, &'static str)> {
        Self::FONT_SEARCH_PATHS.iter().find_map(|&path| {
            let data = std::fs::read(path).ok()?;
            let font = fontdue::Font::from_bytes(data.as_slice(), fontdue::FontSettings::default()).ok()?;
            Some((font, path))
        })
    }

    /// Load the first available system font
    pub fn new(font_size: f32) -> Self {
        let font = match Self::find_font() {
            Some((font, path)) => {
                tracing::info!(path, font_size, "loaded font");
                Some(font)
            }
            None => {
                tracing::warn!("no font found, text will be measured but not drawn");
                None
            }
        };
        Self {
            font,
            font_size,
            glyph_cache: HashMap::new(),
        }
    }

    /// A renderer that never draws glyphs (deterministic metrics for tests)
    pub fn without_font(font_size: f32) -> Self {
        Self {
            font: None,
            font_size,
            glyph_cache: HashMap::new(),
        }
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    pub fn font_size(&self) -> f32 {
        self.font_size
    }

    /// (ascent, descent) in whole pixels, both positive
    pub fn line_metrics(&self) -> (i32, i32) {
        self.font
            .as_ref()
            .and_then(|f| f.horizontal_line_metrics(self.font_size))
            .map(|m| (m.ascent.ceil() as i32, (-m.descent).ceil() as i32))
            .unwrap_or_else(|| {
                (
                    (self.font_size * 4.0 / 5.0).ceil() as i32,
                    (self.font_size / 5.0).ceil() as i32,
                )
            })
    }

    fn glyph(&mut self, c: char) -> Option<&GlyphData> {
        let font = self.font.as_ref()?;
        let size = self.font_size;
        Some(self.glyph_cache.entry(c).or_insert_with(|| {
            let (metrics, bitmap) = font.rasterize(c, size);
            GlyphData {
                bitmap,
                width: metrics.width as i32,
                height: metrics.height as i32,
                x_offset: metrics.xmin,
                y_offset: metrics.ymin,
                advance: metrics.advance_width,
            }
        }))
    }

    /// Advance width of `text` in pixels
    pub fn measure(&mut self, text: &str) -> i32 {
        if self.font.is_none() {
            return (text.chars().count() as f32 * self.font_size * 3.0 / 5.0).ceil() as i32;
        }
        let mut width = 0.0f32;
        for c in text.chars() {
            if let Some(glyph) = self.glyph(c) {
                width += glyph.advance;
            }
        }
        width.ceil() as i32
    }

    /// Bounding rect of `text` drawn with its baseline starting at `baseline`
    pub fn text_rect(&mut self, baseline: Point, text: &str) -> Rect {
        let (ascent, descent) = self.line_metrics();
        Rect::new(baseline.x, baseline.y - ascent, self.measure(text), ascent + descent)
    }

    /// Draw `text` with its baseline at `baseline`. Returns the bounding rect.
    pub fn draw(&mut self, painter: &mut Painter<'_>, baseline: Point, text: &str, color: Color) -> Rect {
        let rect = self.text_rect(baseline, text);
        let mut x = baseline.x as f32;
        for c in text.chars() {
            let Some(glyph) = self.glyph(c) else { break };
            let pos = Point::new(
                x as i32 + glyph.x_offset,
                baseline.y - glyph.height - glyph.y_offset,
            );
            painter.draw_mask(pos, Size::new(glyph.width, glyph.height), &glyph.bitmap, color);
            x += glyph.advance;
        }
        rect
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Image;

    #[test]
    fn fallback_metrics_are_proportional() {
        let mut text = TextRenderer::without_font(10.0);
        assert_eq!(text.line_metrics(), (8, 2));
        assert_eq!(text.measure("abcd"), 24);
        assert_eq!(text.text_rect(Point::new(5, 20), "ab"), Rect::new(5, 12, 12, 10));
    }

    #[test]
    fn draw_without_font_leaves_pixels() {
        let mut text = TextRenderer::without_font(12.0);
        let mut img = Image::filled(Size::new(50, 20), Color::WHITE).unwrap();
        let rect = text.draw(&mut Painter::new(&mut img), Point::new(0, 15), "hi", Color::BLACK);
        assert!(!rect.is_empty());
        assert!(img.pixels().iter().all(|&p| p == Color::WHITE.to_argb()));
    }

    #[test]
    fn draw_with_system_font_touches_pixels_inside_rect() {
        // Skip this test if no font is available
        let mut text = TextRenderer::new(16.0);
        if !text.has_font() {
            return;
        }
        let mut img = Image::filled(Size::new(120, 40), Color::WHITE).unwrap();
        let rect = text.draw(&mut Painter::new(&mut img), Point::new(4, 28), "Hello", Color::BLACK);
        let mut changed = 0;
        for y in 0..img.height() {
            for x in 0..img.width() {
                if img.pixel(x, y) != Some(Color::WHITE.to_argb()) {
                    changed += 1;
                    assert!(
                        rect.translated(Point::new(-2, -2)).union(&rect.translated(Point::new(2, 2))).contains(Point::new(x, y)),
                        "pixel ({}, {}) outside text rect {:?}",
                        x,
                        y,
                        rect
                    );
                }
            }
        }
        assert!(changed > 0);
    }
}
