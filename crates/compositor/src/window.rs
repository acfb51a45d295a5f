//! Window content
//!
//! A window owns a double-buffered content image. Clients draw into the back
//! buffer inside a `begin`/`end` session; `end` copies only the damaged rects
//! to the front buffer, which is what the compositor samples when painting.

use serde::{Deserialize, Serialize};

use crate::geometry::{Color, Point, Rect, Region, Size};
use crate::image::{Image, Painter};
use crate::shm::{ShmError, ShmInfo, ShmPool};
use crate::text::TextRenderer;

/// Placement state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowState {
    #[default]
    Normal,
    Maximized,
}

/// Input and decoration events delivered to a window's owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WindowEvent {
    /// Position is in window content coordinates
    PointerButton {
        x: i32,
        y: i32,
        code: u32,
        pressed: bool,
    },
    Scroll {
        dx: i32,
        dy: i32,
    },
    Key {
        code: u32,
        pressed: bool,
    },
    CloseRequested,
}

/// Default content color of a freshly sized window
pub const WINDOW_BACKGROUND: Color = Color::WHITE;

#[derive(Debug, Default)]
pub struct Window {
    front: Option<Image>,
    back: Option<Image>,
    damage: Region,
    painting: bool,
    state: WindowState,
    restore_geometry: Option<Rect>,
    shm: ShmPool,
}

impl Window {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reallocate both buffers for a new content size
    ///
    /// A zero-area size leaves the window without buffers, so drawing is
    /// refused until it gets a real size. An open draw session is dropped.
    pub(crate) fn resize(&mut self, size: Size) {
        if self.front.as_ref().map(Image::size) == Some(size) {
            return;
        }
        self.front = Image::filled(size, WINDOW_BACKGROUND);
        self.back = self.front.clone();
        self.damage.clear();
        self.painting = false;
    }

    pub fn front(&self) -> Option<&Image> {
        self.front.as_ref()
    }

    pub fn size(&self) -> Size {
        self.front.as_ref().map(Image::size).unwrap_or_default()
    }

    pub fn is_painting(&self) -> bool {
        self.painting
    }

    /// Open a draw session. Refused without buffers or while one is open.
    pub fn begin(&mut self) -> bool {
        if self.back.is_none() || self.painting {
            return false;
        }
        self.painting = true;
        self.damage.clear();
        true
    }

    fn record(&mut self, rect: Rect) {
        let bounds = Rect::from_size(self.size());
        self.damage.add_rect(rect.intersect(&bounds));
    }

    pub fn fill_rect(&mut self, rect: Rect, color: Color) -> bool {
        if !self.painting {
            return false;
        }
        let Some(back) = self.back.as_mut() else { return false };
        back.fill_rect(rect, color);
        self.record(rect);
        true
    }

    /// Draw `text` with its baseline at `pos`
    pub fn draw_text(&mut self, text: &mut TextRenderer, pos: Point, s: &str, color: Color) -> bool {
        if !self.painting {
            return false;
        }
        let Some(back) = self.back.as_mut() else { return false };
        let rect = text.draw(&mut Painter::new(back), pos, s, color);
        self.record(rect);
        true
    }

    /// Close the draw session, copying damaged rects back to front.
    ///
    /// Returns the damage in content coordinates. Empty when nothing was
    /// drawn or no session was open.
    pub fn end(&mut self) -> Region {
        if !self.painting {
            return Region::new();
        }
        self.painting = false;
        let damage = std::mem::take(&mut self.damage);
        if let (Some(front), Some(back)) = (self.front.as_mut(), self.back.as_ref()) {
            for rect in damage.rects() {
                front.copy_from(back, *rect, rect.top_left());
            }
        }
        damage
    }

    pub fn state(&self) -> WindowState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: WindowState) {
        self.state = state;
    }

    pub(crate) fn restore_geometry(&self) -> Option<Rect> {
        self.restore_geometry
    }

    pub(crate) fn set_restore_geometry(&mut self, geometry: Option<Rect>) {
        self.restore_geometry = geometry;
    }

    /// A shared-memory segment matching the current content size
    pub fn get_shm(&mut self) -> Result<ShmInfo, ShmError> {
        let size = self.size();
        if size.is_empty() {
            return Err(ShmError::InvalidSize(size.width, size.height));
        }
        self.shm.acquire(size)
    }

    pub fn release_shm(&mut self, key: &str) -> Result<(), ShmError> {
        self.shm.release(key)
    }

    pub fn shm_segments(&self) -> usize {
        self.shm.len()
    }

    /// Copy `region` of segment `key` into both buffers.
    ///
    /// Returns the damage to report. A lock failure releases the segment.
    pub fn put_image(&mut self, key: &str, region: Rect) -> Result<Region, ShmError> {
        let (Some(front), Some(back)) = (self.front.as_mut(), self.back.as_mut()) else {
            return Err(ShmError::UnknownKey(key.to_string()));
        };
        let copied = self.shm.copy_out(key, region, &mut [front, back])?;
        Ok(Region::from(copied))
    }

    pub(crate) fn paint(&self, painter: &mut Painter<'_>) {
        if let Some(front) = &self.front {
            painter.draw_image(Point::default(), front);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::SharedBuffer;

    const RED: Color = Color::rgb(0xFF, 0, 0);

    fn sized(w: i32, h: i32) -> Window {
        let mut window = Window::new();
        window.resize(Size::new(w, h));
        window
    }

    #[test]
    fn begin_fails_without_buffers() {
        let mut window = Window::new();
        assert!(!window.begin());
        window.resize(Size::new(0, 20));
        assert!(!window.begin());
    }

    #[test]
    fn second_begin_fails_and_keeps_damage() {
        let mut window = sized(50, 50);
        assert!(window.begin());
        window.fill_rect(Rect::new(0, 0, 10, 10), RED);
        assert!(!window.begin());
        let damage = window.end();
        assert_eq!(damage.rects(), &[Rect::new(0, 0, 10, 10)]);
    }

    #[test]
    fn end_without_drawing_is_empty() {
        let mut window = sized(50, 50);
        assert!(window.begin());
        assert!(window.end().is_empty());
        assert!(window.end().is_empty());
    }

    #[test]
    fn drawing_reaches_front_only_after_end() {
        let mut window = sized(20, 20);
        window.begin();
        window.fill_rect(Rect::new(5, 5, 5, 5), RED);
        assert_eq!(window.front().unwrap().pixel(6, 6), Some(WINDOW_BACKGROUND.to_argb()));
        window.end();
        assert_eq!(window.front().unwrap().pixel(6, 6), Some(RED.to_argb()));
        assert_eq!(window.front().unwrap().pixel(0, 0), Some(WINDOW_BACKGROUND.to_argb()));
    }

    #[test]
    fn damage_is_clipped_to_content() {
        let mut window = sized(20, 20);
        window.begin();
        window.fill_rect(Rect::new(15, 15, 100, 100), RED);
        window.fill_rect(Rect::new(-50, -50, 10, 10), RED);
        assert_eq!(window.end().rects(), &[Rect::new(15, 15, 5, 5)]);
    }

    #[test]
    fn many_small_fills_keep_damage_bounded() {
        let mut window = sized(200, 200);
        window.begin();
        for i in 0..10_000 {
            window.fill_rect(Rect::new((i % 100) * 2, (i / 100) * 2, 1, 1), RED);
        }
        let damage = window.end();
        assert!(damage.len() <= crate::geometry::MAX_REGION_RECTS);
        assert_eq!(damage.bounding_rect(), Rect::new(0, 0, 199, 199));
        let front = window.front().unwrap();
        assert_eq!(front.pixel(198, 198), Some(RED.to_argb()));
        assert_eq!(front.pixel(1, 1), Some(WINDOW_BACKGROUND.to_argb()));
    }

    #[test]
    fn fill_outside_session_is_refused() {
        let mut window = sized(20, 20);
        assert!(!window.fill_rect(Rect::new(0, 0, 5, 5), RED));
        assert_eq!(window.front().unwrap().pixel(0, 0), Some(WINDOW_BACKGROUND.to_argb()));
    }

    #[test]
    fn resize_drops_open_session() {
        let mut window = sized(20, 20);
        window.begin();
        window.resize(Size::new(30, 30));
        assert!(!window.is_painting());
        assert_eq!(window.size(), Size::new(30, 30));
    }

    #[test]
    fn draw_text_records_text_rect() {
        let mut window = sized(100, 40);
        let mut text = TextRenderer::without_font(10.0);
        window.begin();
        window.draw_text(&mut text, Point::new(10, 20), "ab", Color::BLACK);
        assert_eq!(window.end().rects(), &[Rect::new(10, 12, 12, 10)]);
    }

    #[test]
    fn put_image_copies_region_into_both_buffers() {
        let mut window = sized(4, 4);
        let info = window.get_shm().unwrap();
        {
            let mut client = SharedBuffer::attach(&info).unwrap();
            let red = Image::filled(info.size(), RED).unwrap();
            client.lock().unwrap().write_image(&red);
        }
        let damage = window.put_image(&info.key, Rect::new(0, 0, 2, 2)).unwrap();
        assert_eq!(damage.rects(), &[Rect::new(0, 0, 2, 2)]);
        assert_eq!(window.front().unwrap().pixel(1, 1), Some(RED.to_argb()));
        assert_eq!(window.front().unwrap().pixel(3, 3), Some(WINDOW_BACKGROUND.to_argb()));

        // A later draw session must not bring back stale back-buffer pixels
        window.begin();
        window.fill_rect(Rect::new(0, 0, 4, 4), Color::rgba(0, 0, 0, 0));
        window.end();
        assert_eq!(window.front().unwrap().pixel(1, 1), Some(RED.to_argb()));
    }

    #[test]
    fn put_image_unknown_key_fails() {
        let mut window = sized(4, 4);
        assert!(matches!(
            window.put_image("/stone-missing", Rect::new(0, 0, 1, 1)),
            Err(ShmError::UnknownKey(_))
        ));
    }

    #[test]
    fn get_shm_requires_size() {
        let mut window = Window::new();
        assert!(matches!(window.get_shm(), Err(ShmError::InvalidSize(0, 0))));
    }
}
