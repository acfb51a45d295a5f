//! Geometry primitives
//!
//! Integer pixel geometry shared by the scene graph, the paint pipeline and
//! the wire protocol. Rectangles are half-open: a rect at `x` with `width`
//! covers columns `x..x + width`.

use serde::{Deserialize, Serialize};

/// A point in some node's coordinate space
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl std::ops::Add for Point {
    type Output = Point;

    fn add(self, rhs: Point) -> Point {
        Point::new(self.x.saturating_add(rhs.x), self.y.saturating_add(rhs.y))
    }
}

impl std::ops::Sub for Point {
    type Output = Point;

    fn sub(self, rhs: Point) -> Point {
        Point::new(self.x.saturating_sub(rhs.x), self.y.saturating_sub(rhs.y))
    }
}

impl std::ops::Neg for Point {
    type Output = Point;

    fn neg(self) -> Point {
        Point::new(self.x.saturating_neg(), self.y.saturating_neg())
    }
}

/// Width and height in pixels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: i32,
    pub height: i32,
}

impl Size {
    pub const fn new(width: i32, height: i32) -> Self {
        Self { width, height }
    }

    /// True when either dimension is zero or negative
    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// Scale this size to the largest size that fits in `bounds` while
    /// keeping the aspect ratio.
    ///
    /// Integer arithmetic matches the classic toolkit behaviour, so a
    /// 1920x1080 frame fitted into 800x600 becomes exactly 800x450.
    pub fn scaled_keep_aspect(self, bounds: Size) -> Size {
        if self.is_empty() || bounds.is_empty() {
            return bounds;
        }

        let rw = bounds.height as i64 * self.width as i64 / self.height as i64;
        if rw <= bounds.width as i64 {
            Size::new(rw as i32, bounds.height)
        } else {
            let rh = bounds.width as i64 * self.height as i64 / self.width as i64;
            Size::new(bounds.width, rh as i32)
        }
    }
}

/// An axis-aligned rectangle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    /// A rect of the given size anchored at the origin
    pub const fn from_size(size: Size) -> Self {
        Self::new(0, 0, size.width, size.height)
    }

    pub fn top_left(&self) -> Point {
        Point::new(self.x, self.y)
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    /// Exclusive right edge, saturating at `i32::MAX`
    pub fn right(&self) -> i32 {
        self.x.saturating_add(self.width)
    }

    /// Exclusive bottom edge, saturating at `i32::MAX`
    pub fn bottom(&self) -> i32 {
        self.y.saturating_add(self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.size().is_empty()
    }

    pub fn contains(&self, p: Point) -> bool {
        !self.is_empty() && p.x >= self.x && p.x < self.right() && p.y >= self.y && p.y < self.bottom()
    }

    /// True when `other` lies entirely inside this rect
    pub fn contains_rect(&self, other: &Rect) -> bool {
        !other.is_empty()
            && other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    /// Overlapping area, or an empty rect when the two do not intersect
    pub fn intersect(&self, other: &Rect) -> Rect {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 <= x0 || y1 <= y0 {
            return Rect::default();
        }
        Rect::new(x0, y0, x1.saturating_sub(x0), y1.saturating_sub(y0))
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        !self.intersect(other).is_empty()
    }

    /// Bounding rect of both. Empty rects do not contribute.
    pub fn union(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x0 = self.x.min(other.x);
        let y0 = self.y.min(other.y);
        let x1 = self.right().max(other.right());
        let y1 = self.bottom().max(other.bottom());
        Rect::new(x0, y0, x1.saturating_sub(x0), y1.saturating_sub(y0))
    }

    pub fn translated(&self, offset: Point) -> Rect {
        Rect::new(
            self.x.saturating_add(offset.x),
            self.y.saturating_add(offset.y),
            self.width,
            self.height,
        )
    }

    pub fn moved_to(&self, pos: Point) -> Rect {
        Rect::new(pos.x, pos.y, self.width, self.height)
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2, self.y + self.height / 2)
    }

    /// A rect of `size` centred inside this rect
    pub fn centered(&self, size: Size) -> Rect {
        Rect::new(
            self.x + (self.width - size.width) / 2,
            self.y + (self.height - size.height) / 2,
            size.width,
            size.height,
        )
    }

    /// Clamp a point so it lies on a pixel inside this rect
    pub fn clamp_point(&self, p: Point) -> Point {
        if self.is_empty() {
            return p;
        }
        Point::new(
            p.x.clamp(self.x, self.right() - 1),
            p.y.clamp(self.y, self.bottom() - 1),
        )
    }
}

/// Rects a region holds before collapsing to its bounding rect
pub const MAX_REGION_RECTS: usize = 32;

/// A set of rectangles needing repaint
///
/// Rects are kept in insertion order. Rects already covered by another are
/// dropped on insert; overlap is otherwise allowed since every consumer
/// only repaints or copies, which is idempotent. Past
/// [`MAX_REGION_RECTS`] the region becomes its single bounding rect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Region {
    rects: Vec<Rect>,
}

impl Region {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    pub fn len(&self) -> usize {
        self.rects.len()
    }

    pub fn add_rect(&mut self, rect: Rect) {
        if rect.is_empty() || self.rects.iter().any(|r| r.contains_rect(&rect)) {
            return;
        }
        self.rects.retain(|r| !rect.contains_rect(r));
        self.rects.push(rect);
        if self.rects.len() > MAX_REGION_RECTS {
            let bounds = self.bounding_rect();
            self.rects.clear();
            self.rects.push(bounds);
        }
    }

    pub fn add_region(&mut self, other: &Region) {
        for rect in &other.rects {
            self.add_rect(*rect);
        }
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }

    /// Smallest rect covering the whole region
    pub fn bounding_rect(&self) -> Rect {
        self.rects.iter().fold(Rect::default(), |acc, r| acc.union(r))
    }

    pub fn translated(&self, offset: Point) -> Region {
        Region {
            rects: self.rects.iter().map(|r| r.translated(offset)).collect(),
        }
    }

    /// Clip every rect to `clip`, dropping those that fall outside
    pub fn intersected(&self, clip: &Rect) -> Region {
        let mut out = Region::new();
        for rect in &self.rects {
            out.add_rect(rect.intersect(clip));
        }
        out
    }

    pub fn intersects(&self, rect: &Rect) -> bool {
        self.rects.iter().any(|r| r.intersects(rect))
    }

    pub fn contains(&self, p: Point) -> bool {
        self.rects.iter().any(|r| r.contains(p))
    }
}

impl From<Rect> for Region {
    fn from(rect: Rect) -> Self {
        let mut region = Region::new();
        region.add_rect(rect);
        region
    }
}

fn opaque() -> u8 {
    0xFF
}

/// An 8-bit RGBA color
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    #[serde(default = "opaque")]
    pub a: u8,
}

impl Color {
    pub const BLACK: Color = Color::rgb(0, 0, 0);
    pub const WHITE: Color = Color::rgb(0xFF, 0xFF, 0xFF);
    pub const TRANSPARENT: Color = Color::rgba(0, 0, 0, 0);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 0xFF }
    }

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Pack as 0xAARRGGBB
    pub const fn to_argb(self) -> u32 {
        ((self.a as u32) << 24) | ((self.r as u32) << 16) | ((self.g as u32) << 8) | self.b as u32
    }

    pub const fn from_argb(v: u32) -> Self {
        Self {
            a: (v >> 24) as u8,
            r: (v >> 16) as u8,
            g: (v >> 8) as u8,
            b: v as u8,
        }
    }
}

impl Default for Color {
    fn default() -> Self {
        Color::BLACK
    }
}
