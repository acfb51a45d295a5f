//! Software pixel buffers
//!
//! `Image` is a 32-bit ARGB pixel buffer (0xAARRGGBB, stored native-endian
//! so the byte layout on little-endian machines is B, G, R, A). `Painter`
//! draws into an image through a translation origin and a clip rect, which
//! is how the scene graph paints each node in its own coordinate space.

use std::path::Path;

use crate::geometry::{Color, Point, Rect, Size};

/// Errors loading an image from disk
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("failed to open image: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode PNG: {0}")]
    Decode(#[from] png::DecodingError),

    #[error("unsupported PNG color type {0:?}")]
    UnsupportedColor(png::ColorType),

    #[error("image has zero area")]
    Empty,
}

/// Source-over blend of a non-premultiplied ARGB pixel onto another
#[inline]
fn blend(dst: u32, src: u32) -> u32 {
    let sa = src >> 24;
    if sa == 0xFF {
        return src;
    }
    if sa == 0 {
        return dst;
    }
    let inv = 0xFF - sa;
    let channel = |shift: u32| -> u32 {
        let s = (src >> shift) & 0xFF;
        let d = (dst >> shift) & 0xFF;
        (s * sa + d * inv + 127) / 0xFF
    };
    let da = dst >> 24;
    let a = sa + (da * inv + 127) / 0xFF;
    (a << 24) | (channel(16) << 16) | (channel(8) << 8) | channel(0)
}

#[inline]
fn with_alpha(color: Color, coverage: u8) -> u32 {
    let a = (color.a as u32 * coverage as u32 + 127) / 0xFF;
    (a << 24) | (color.to_argb() & 0x00FF_FFFF)
}

/// An owned ARGB32 pixel buffer
#[derive(Clone, PartialEq, Eq)]
pub struct Image {
    size: Size,
    pixels: Vec<u32>,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image").field("size", &self.size).finish()
    }
}

impl Image {
    /// A transparent image. Returns `None` for a zero-area size.
    pub fn new(size: Size) -> Option<Self> {
        Self::filled(size, Color::TRANSPARENT)
    }

    pub fn filled(size: Size, color: Color) -> Option<Self> {
        if size.is_empty() {
            return None;
        }
        Some(Self {
            size,
            pixels: vec![color.to_argb(); size.width as usize * size.height as usize],
        })
    }

    /// Wrap raw ARGB pixels. The pixel count must match the size.
    pub fn from_pixels(size: Size, pixels: Vec<u32>) -> Option<Self> {
        if size.is_empty() || pixels.len() != size.width as usize * size.height as usize {
            return None;
        }
        Some(Self { size, pixels })
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn width(&self) -> i32 {
        self.size.width
    }

    pub fn height(&self) -> i32 {
        self.size.height
    }

    pub fn rect(&self) -> Rect {
        Rect::from_size(self.size)
    }

    pub fn pixels(&self) -> &[u32] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [u32] {
        &mut self.pixels
    }

    #[inline]
    fn index(&self, x: i32, y: i32) -> usize {
        y as usize * self.size.width as usize + x as usize
    }

    pub fn pixel(&self, x: i32, y: i32) -> Option<u32> {
        if !self.rect().contains(Point::new(x, y)) {
            return None;
        }
        Some(self.pixels[self.index(x, y)])
    }

    pub fn set_pixel(&mut self, x: i32, y: i32, argb: u32) {
        if self.rect().contains(Point::new(x, y)) {
            let idx = self.index(x, y);
            self.pixels[idx] = argb;
        }
    }

    /// Fill `rect` (clipped to the image). Translucent colors blend.
    pub fn fill_rect(&mut self, rect: Rect, color: Color) {
        let area = rect.intersect(&self.rect());
        if area.is_empty() {
            return;
        }
        let argb = color.to_argb();
        let stride = self.size.width as usize;
        for y in area.y..area.bottom() {
            let row = y as usize * stride;
            let span = &mut self.pixels[row + area.x as usize..row + area.right() as usize];
            if color.a == 0xFF {
                span.fill(argb);
            } else {
                for px in span {
                    *px = blend(*px, argb);
                }
            }
        }
    }

    /// Copy `src_rect` of `src` to `dst_pos`, replacing destination pixels
    pub fn copy_from(&mut self, src: &Image, src_rect: Rect, dst_pos: Point) {
        self.transfer(src, src_rect, dst_pos, false);
    }

    /// Draw `src_rect` of `src` at `dst_pos` with source-over blending
    pub fn blend_from(&mut self, src: &Image, src_rect: Rect, dst_pos: Point) {
        self.transfer(src, src_rect, dst_pos, true);
    }

    fn transfer(&mut self, src: &Image, src_rect: Rect, dst_pos: Point, blended: bool) {
        let src_rect = src_rect.intersect(&src.rect());
        if src_rect.is_empty() {
            return;
        }
        let delta = dst_pos - src_rect.top_left();
        let dst_rect = src_rect.translated(delta).intersect(&self.rect());
        if dst_rect.is_empty() {
            return;
        }
        for y in dst_rect.y..dst_rect.bottom() {
            let sy = y - delta.y;
            let s0 = src.index(dst_rect.x - delta.x, sy);
            let d0 = self.index(dst_rect.x, y);
            let len = dst_rect.width as usize;
            let src_row = &src.pixels[s0..s0 + len];
            let dst_row = &mut self.pixels[d0..d0 + len];
            if blended {
                for (d, s) in dst_row.iter_mut().zip(src_row) {
                    *d = blend(*d, *s);
                }
            } else {
                dst_row.copy_from_slice(src_row);
            }
        }
    }

    /// Blend an 8-bit coverage mask (a rasterized glyph) in `color`
    pub fn blend_mask(&mut self, pos: Point, mask_size: Size, mask: &[u8], color: Color, clip: Rect) {
        let area = Rect::new(pos.x, pos.y, mask_size.width, mask_size.height)
            .intersect(&clip)
            .intersect(&self.rect());
        if area.is_empty() {
            return;
        }
        for y in area.y..area.bottom() {
            for x in area.x..area.right() {
                let m = (y - pos.y) as usize * mask_size.width as usize + (x - pos.x) as usize;
                let Some(&coverage) = mask.get(m) else { continue };
                if coverage == 0 {
                    continue;
                }
                let idx = self.index(x, y);
                self.pixels[idx] = blend(self.pixels[idx], with_alpha(color, coverage));
            }
        }
    }

    /// Decode a PNG file into ARGB pixels
    pub fn load_png(path: &Path) -> Result<Image, ImageError> {
        let mut decoder = png::Decoder::new(std::fs::File::open(path)?);
        decoder.set_transformations(png::Transformations::EXPAND | png::Transformations::STRIP_16);
        let mut reader = decoder.read_info()?;
        let mut buf = vec![0; reader.output_buffer_size()];
        let info = reader.next_frame(&mut buf)?;
        buf.truncate(info.buffer_size());

        let channels = match info.color_type {
            png::ColorType::Rgba => 4,
            png::ColorType::Rgb => 3,
            png::ColorType::GrayscaleAlpha => 2,
            png::ColorType::Grayscale => 1,
            other => return Err(ImageError::UnsupportedColor(other)),
        };
        let pixels = buf
            .chunks_exact(channels)
            .map(|px| {
                let color = match *px {
                    [r, g, b, a] => Color::rgba(r, g, b, a),
                    [r, g, b] => Color::rgb(r, g, b),
                    [l, a] => Color::rgba(l, l, l, a),
                    [l] => Color::rgb(l, l, l),
                    _ => Color::TRANSPARENT,
                };
                color.to_argb()
            })
            .collect();
        let size = Size::new(info.width as i32, info.height as i32);
        Image::from_pixels(size, pixels).ok_or(ImageError::Empty)
    }

    /// A copy of the pixels inside `rect`
    pub fn cropped(&self, rect: Rect) -> Option<Image> {
        let rect = rect.intersect(&self.rect());
        let mut out = Image::new(rect.size())?;
        out.copy_from(self, rect, Point::default());
        Some(out)
    }

    /// Nearest-neighbour resample to `size`
    pub fn scaled(&self, size: Size) -> Option<Image> {
        let mut out = Image::new(size)?;
        let (sw, sh) = (self.size.width as i64, self.size.height as i64);
        let (dw, dh) = (size.width as i64, size.height as i64);
        for y in 0..size.height {
            let sy = ((y as i64 * sh) / dh) as i32;
            for x in 0..size.width {
                let sx = ((x as i64 * sw) / dw) as i32;
                let idx = out.index(x, y);
                out.pixels[idx] = self.pixels[self.index(sx, sy)];
            }
        }
        Some(out)
    }
}

/// Draws into an [`Image`] through a translation origin and a clip rect
///
/// Child painters borrow the parent mutably, so nested scopes restore the
/// parent's origin and clip when they are dropped.
pub struct Painter<'a> {
    target: &'a mut Image,
    /// Offset of local (0, 0) in target pixels
    origin: Point,
    /// Clip in target pixels
    clip: Rect,
}

impl<'a> Painter<'a> {
    pub fn new(target: &'a mut Image) -> Self {
        let clip = target.rect();
        Self {
            target,
            origin: Point::default(),
            clip,
        }
    }

    /// A painter restricted to `clip` (target coordinates)
    pub fn with_clip(target: &'a mut Image, clip: Rect) -> Self {
        let clip = clip.intersect(&target.rect());
        Self {
            target,
            origin: Point::default(),
            clip,
        }
    }

    /// Sub-painter whose local space starts at `geometry.top_left()` and is
    /// clipped to `geometry` (both expressed in this painter's local space).
    pub fn child(&mut self, geometry: Rect) -> Painter<'_> {
        let clip = geometry.translated(self.origin).intersect(&self.clip);
        Painter {
            target: &mut *self.target,
            origin: self.origin + geometry.top_left(),
            clip,
        }
    }

    /// Sub-painter whose local space is shifted by `offset`. The clip is kept.
    pub fn translated(&mut self, offset: Point) -> Painter<'_> {
        Painter {
            target: &mut *self.target,
            origin: self.origin + offset,
            clip: self.clip,
        }
    }

    /// Clip rect in local coordinates
    pub fn clip_rect(&self) -> Rect {
        self.clip.translated(-self.origin)
    }

    pub fn is_clipped_out(&self) -> bool {
        self.clip.is_empty()
    }

    pub fn fill_rect(&mut self, rect: Rect, color: Color) {
        let area = rect.translated(self.origin).intersect(&self.clip);
        self.target.fill_rect(area, color);
    }

    /// Blend `image` with its top-left corner at `pos`
    pub fn draw_image(&mut self, pos: Point, image: &Image) {
        let dst = image.rect().translated(pos + self.origin).intersect(&self.clip);
        if dst.is_empty() {
            return;
        }
        let src_rect = dst.translated(-(pos + self.origin));
        self.target.blend_from(image, src_rect, dst.top_left());
    }

    pub fn draw_mask(&mut self, pos: Point, size: Size, mask: &[u8], color: Color) {
        self.target.blend_mask(pos + self.origin, size, mask, color, self.clip);
    }
}
