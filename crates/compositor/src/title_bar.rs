//! Title bar decoration for windows
//!
//! Every window carries a title bar child node sitting directly above its
//! content. The bar shows the window title and three buttons
//! (minimize, maximize, close); the rest of the bar is a drag handle.

use crate::geometry::{Color, Point, Rect, Size};
use crate::image::Painter;
use crate::text::TextRenderer;

/// Title bar height in pixels
pub const TITLE_BAR_HEIGHT: i32 = 24;

/// Button width in pixels (square buttons)
pub const BUTTON_WIDTH: i32 = 24;

/// Left padding for title bar text (pixels)
pub const TITLE_BAR_PADDING: i32 = 8;

/// Action buttons, right-aligned in this order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TitleBarButton {
    Minimize,
    Maximize,
    Close,
}

impl TitleBarButton {
    const ALL: [TitleBarButton; 3] = [
        TitleBarButton::Minimize,
        TitleBarButton::Maximize,
        TitleBarButton::Close,
    ];

    /// Slot counted from the right edge
    fn slot(self) -> i32 {
        match self {
            TitleBarButton::Close => 1,
            TitleBarButton::Maximize => 2,
            TitleBarButton::Minimize => 3,
        }
    }
}

/// Focus-dependent colors
struct TitleBarColors {
    background: Color,
    text: Color,
    button: Color,
    glyph: Color,
}

impl TitleBarColors {
    fn for_focus(focused: bool) -> Self {
        if focused {
            Self {
                background: Color::rgb(0x33, 0x33, 0x33), // #333333
                text: Color::rgb(0xEE, 0xEE, 0xEE),
                button: Color::rgb(0x44, 0x44, 0x44),
                glyph: Color::WHITE,
            }
        } else {
            Self {
                background: Color::rgb(0x55, 0x55, 0x55),
                text: Color::rgb(0xAA, 0xAA, 0xAA),
                button: Color::rgb(0x5E, 0x5E, 0x5E),
                glyph: Color::rgb(0xCC, 0xCC, 0xCC),
            }
        }
    }
}

/// Title bar state
#[derive(Debug, Clone, Default)]
pub struct TitleBar {
    title: String,
    focused: bool,
}

impl TitleBar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn set_title(&mut self, title: &str) -> bool {
        if self.title == title {
            return false;
        }
        self.title = title.to_string();
        true
    }

    pub fn is_focused(&self) -> bool {
        self.focused
    }

    pub fn set_focused(&mut self, focused: bool) -> bool {
        std::mem::replace(&mut self.focused, focused) != focused
    }

    /// Geometry of the bar in its window's coordinate space
    pub fn geometry_for(window_width: i32) -> Rect {
        Rect::new(0, -TITLE_BAR_HEIGHT, window_width.max(0), TITLE_BAR_HEIGHT)
    }

    /// Button rect in title bar coordinates
    pub fn button_rect(button: TitleBarButton, width: i32) -> Rect {
        Rect::new(width - button.slot() * BUTTON_WIDTH, 0, BUTTON_WIDTH, TITLE_BAR_HEIGHT)
    }

    /// Which button, if any, sits under `point` (title bar coordinates)
    pub fn button_at(point: Point, width: i32) -> Option<TitleBarButton> {
        TitleBarButton::ALL
            .into_iter()
            .find(|b| Self::button_rect(*b, width).contains(point))
    }

    pub(crate) fn paint(&self, painter: &mut Painter<'_>, size: Size, text: &mut TextRenderer) {
        let colors = TitleBarColors::for_focus(self.focused);
        painter.fill_rect(Rect::from_size(size), colors.background);

        // Title, clipped so it never runs under the buttons
        let text_width = size.width - 3 * BUTTON_WIDTH - TITLE_BAR_PADDING;
        if text_width > 0 && !self.title.is_empty() {
            let mut text_area = painter.child(Rect::new(0, 0, text_width, size.height));
            let baseline = Point::new(TITLE_BAR_PADDING, size.height * 3 / 4);
            text.draw(&mut text_area, baseline, &self.title, colors.text);
        }

        for button in TitleBarButton::ALL {
            let rect = Self::button_rect(button, size.width);
            painter.fill_rect(rect, colors.button);
            paint_button_glyph(painter, button, rect, colors.glyph);
        }
    }
}

/// Draw the button symbol with plain rect fills
fn paint_button_glyph(painter: &mut Painter<'_>, button: TitleBarButton, rect: Rect, color: Color) {
    let inset = rect.width / 3;
    let glyph = Rect::new(
        rect.x + inset,
        rect.y + inset,
        rect.width - 2 * inset,
        rect.height - 2 * inset,
    );
    match button {
        TitleBarButton::Minimize => {
            painter.fill_rect(Rect::new(glyph.x, glyph.bottom() - 2, glyph.width, 2), color);
        }
        TitleBarButton::Maximize => {
            painter.fill_rect(Rect::new(glyph.x, glyph.y, glyph.width, 2), color);
            painter.fill_rect(Rect::new(glyph.x, glyph.bottom() - 1, glyph.width, 1), color);
            painter.fill_rect(Rect::new(glyph.x, glyph.y, 1, glyph.height), color);
            painter.fill_rect(Rect::new(glyph.right() - 1, glyph.y, 1, glyph.height), color);
        }
        TitleBarButton::Close => {
            for i in 0..glyph.width.min(glyph.height) {
                painter.fill_rect(Rect::new(glyph.x + i, glyph.y + i, 2, 1), color);
                painter.fill_rect(Rect::new(glyph.right() - 2 - i, glyph.y + i, 2, 1), color);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Image;

    #[test]
    fn geometry_sits_above_window() {
        assert_eq!(TitleBar::geometry_for(300), Rect::new(0, -24, 300, 24));
    }

    #[test]
    fn buttons_are_right_aligned() {
        let width = 200;
        assert_eq!(TitleBar::button_rect(TitleBarButton::Close, width), Rect::new(176, 0, 24, 24));
        assert_eq!(TitleBar::button_rect(TitleBarButton::Maximize, width), Rect::new(152, 0, 24, 24));
        assert_eq!(TitleBar::button_rect(TitleBarButton::Minimize, width), Rect::new(128, 0, 24, 24));
    }

    #[test]
    fn button_at_hits_each_button() {
        let width = 200;
        assert_eq!(TitleBar::button_at(Point::new(190, 10), width), Some(TitleBarButton::Close));
        assert_eq!(TitleBar::button_at(Point::new(160, 10), width), Some(TitleBarButton::Maximize));
        assert_eq!(TitleBar::button_at(Point::new(130, 10), width), Some(TitleBarButton::Minimize));
        assert_eq!(TitleBar::button_at(Point::new(20, 10), width), None);
    }

    #[test]
    fn set_title_reports_change() {
        let mut bar = TitleBar::new();
        assert!(bar.set_title("demo"));
        assert!(!bar.set_title("demo"));
        assert_eq!(bar.title(), "demo");
    }

    #[test]
    fn paint_fills_whole_bar() {
        let bar = TitleBar::new();
        let size = Size::new(120, TITLE_BAR_HEIGHT);
        let mut img = Image::filled(size, Color::rgb(1, 2, 3)).unwrap();
        let mut text = TextRenderer::without_font(14.0);
        bar.paint(&mut Painter::new(&mut img), size, &mut text);
        assert!(img.pixels().iter().all(|&p| p != Color::rgb(1, 2, 3).to_argb()));
    }
}
