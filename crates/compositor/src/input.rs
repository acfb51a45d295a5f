//! Input normalization
//!
//! Raw device events (evdev codes, relative or absolute motion, wheel
//! deltas) are turned into pointer and key events in compositor
//! coordinates. The pointer is clamped to the primary output.

use serde::{Deserialize, Serialize};

use crate::geometry::{Point, Rect, Size};

/// First evdev mouse button code (BTN_LEFT)
pub const BTN_LEFT: u32 = 0x110;
pub const BTN_RIGHT: u32 = 0x111;
pub const BTN_MIDDLE: u32 = 0x112;
/// Last code treated as a mouse button
pub const BTN_MOUSE_LAST: u32 = 0x11f;

/// Wheel delta per scroll unit, sign flipped so "down" is negative
pub const SCROLL_FACTOR: i32 = -8;

/// A raw event from an input device
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputEvent {
    PointerMove { dx: f64, dy: f64 },
    /// `x`/`y` are in device units spanning `extent`
    PointerMoveAbsolute { x: f64, y: f64, extent: Size },
    PointerButton { code: u32, pressed: bool },
    Scroll { dx: f64, dy: f64 },
    Key { code: u32, pressed: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
    /// Side and extra buttons, indexed from BTN_SIDE
    Other(u8),
}

impl MouseButton {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            BTN_LEFT => Some(MouseButton::Left),
            BTN_RIGHT => Some(MouseButton::Right),
            BTN_MIDDLE => Some(MouseButton::Middle),
            c if (BTN_MIDDLE + 1..=BTN_MOUSE_LAST).contains(&c) => {
                Some(MouseButton::Other((c - BTN_MIDDLE - 1) as u8))
            }
            _ => None,
        }
    }

    fn mask_bit(code: u32) -> u32 {
        1 << (code - BTN_LEFT)
    }
}

/// An event in compositor coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerEvent {
    Motion { position: Point },
    Button {
        button: MouseButton,
        code: u32,
        pressed: bool,
        position: Point,
    },
    Scroll { delta: Point, position: Point },
    Key { code: u32, pressed: bool },
}

/// Pointer position and pressed buttons
#[derive(Debug, Clone, Default)]
pub struct InputState {
    bounds: Rect,
    position: Point,
    /// One bit per mouse button, bit 0 = BTN_LEFT
    buttons: u32,
}

impl InputState {
    pub fn new(bounds: Rect) -> Self {
        Self {
            bounds,
            position: bounds.center(),
            buttons: 0,
        }
    }

    pub fn bounds(&self) -> Rect {
        self.bounds
    }

    pub fn set_bounds(&mut self, bounds: Rect) {
        self.bounds = bounds;
        self.position = bounds.clamp_point(self.position);
    }

    pub fn position(&self) -> Point {
        self.position
    }

    /// Move the pointer, clamped to bounds. Returns the new position.
    pub fn warp(&mut self, position: Point) -> Point {
        self.position = self.bounds.clamp_point(position);
        self.position
    }

    pub fn is_pressed(&self, button: u32) -> bool {
        (BTN_LEFT..=BTN_MOUSE_LAST).contains(&button) && self.buttons & MouseButton::mask_bit(button) != 0
    }

    pub fn any_pressed(&self) -> bool {
        self.buttons != 0
    }

    /// Normalize one raw event.
    ///
    /// Motion is dropped while no bounds are known. Unknown button codes
    /// are dropped.
    pub fn process(&mut self, event: InputEvent) -> Option<PointerEvent> {
        match event {
            InputEvent::PointerMove { dx, dy } => {
                if self.bounds.is_empty() {
                    return None;
                }
                let target = Point::new(
                    (self.position.x as f64 + dx).round() as i32,
                    (self.position.y as f64 + dy).round() as i32,
                );
                Some(PointerEvent::Motion { position: self.warp(target) })
            }
            InputEvent::PointerMoveAbsolute { x, y, extent } => {
                if self.bounds.is_empty() || extent.is_empty() {
                    return None;
                }
                let target = Point::new(
                    self.bounds
                        .x
                        .saturating_add((x * self.bounds.width as f64 / extent.width as f64).round() as i32),
                    self.bounds
                        .y
                        .saturating_add((y * self.bounds.height as f64 / extent.height as f64).round() as i32),
                );
                Some(PointerEvent::Motion { position: self.warp(target) })
            }
            InputEvent::PointerButton { code, pressed } => {
                let Some(button) = MouseButton::from_code(code) else {
                    tracing::debug!(code, "ignoring unknown button code");
                    return None;
                };
                if pressed {
                    self.buttons |= MouseButton::mask_bit(code);
                } else {
                    self.buttons &= !MouseButton::mask_bit(code);
                }
                Some(PointerEvent::Button {
                    button,
                    code,
                    pressed,
                    position: self.position,
                })
            }
            InputEvent::Scroll { dx, dy } => {
                let delta = Point::new(
                    (dx.round() as i32).saturating_mul(SCROLL_FACTOR),
                    (dy.round() as i32).saturating_mul(SCROLL_FACTOR),
                );
                if delta == Point::default() {
                    return None;
                }
                Some(PointerEvent::Scroll {
                    delta,
                    position: self.position,
                })
            }
            InputEvent::Key { code, pressed } => Some(PointerEvent::Key { code, pressed }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> InputState {
        InputState::new(Rect::new(0, 0, 800, 600))
    }

    #[test]
    fn starts_centred() {
        assert_eq!(state().position(), Point::new(400, 300));
    }

    #[test]
    fn relative_motion_is_clamped() {
        let mut input = state();
        let ev = input.process(InputEvent::PointerMove { dx: 1000.0, dy: -1000.0 });
        assert_eq!(ev, Some(PointerEvent::Motion { position: Point::new(799, 0) }));
    }

    #[test]
    fn relative_motion_rounds() {
        let mut input = state();
        input.process(InputEvent::PointerMove { dx: 1.6, dy: -0.4 });
        assert_eq!(input.position(), Point::new(402, 300));
    }

    #[test]
    fn absolute_motion_scales_extent() {
        let mut input = state();
        let ev = input.process(InputEvent::PointerMoveAbsolute {
            x: 50.0,
            y: 25.0,
            extent: Size::new(100, 100),
        });
        assert_eq!(ev, Some(PointerEvent::Motion { position: Point::new(400, 150) }));
    }

    #[test]
    fn motion_without_bounds_is_dropped() {
        let mut input = InputState::default();
        assert_eq!(input.process(InputEvent::PointerMove { dx: 1.0, dy: 1.0 }), None);
    }

    #[test]
    fn button_mask_tracks_presses() {
        let mut input = state();
        input.process(InputEvent::PointerButton { code: BTN_LEFT, pressed: true });
        input.process(InputEvent::PointerButton { code: BTN_MIDDLE, pressed: true });
        assert!(input.is_pressed(BTN_LEFT));
        assert!(input.is_pressed(BTN_MIDDLE));
        input.process(InputEvent::PointerButton { code: BTN_LEFT, pressed: false });
        assert!(!input.is_pressed(BTN_LEFT));
        assert!(input.any_pressed());
    }

    #[test]
    fn unknown_button_is_dropped() {
        let mut input = state();
        assert_eq!(input.process(InputEvent::PointerButton { code: 0x30, pressed: true }), None);
        assert!(!input.any_pressed());
    }

    #[test]
    fn button_codes_map() {
        assert_eq!(MouseButton::from_code(0x110), Some(MouseButton::Left));
        assert_eq!(MouseButton::from_code(0x111), Some(MouseButton::Right));
        assert_eq!(MouseButton::from_code(0x112), Some(MouseButton::Middle));
        assert_eq!(MouseButton::from_code(0x113), Some(MouseButton::Other(0)));
        assert_eq!(MouseButton::from_code(0x120), None);
    }

    #[test]
    fn scroll_is_scaled_and_inverted() {
        let mut input = state();
        let ev = input.process(InputEvent::Scroll { dx: 0.0, dy: 2.0 });
        assert_eq!(
            ev,
            Some(PointerEvent::Scroll {
                delta: Point::new(0, -16),
                position: Point::new(400, 300)
            })
        );
    }

    #[test]
    fn huge_deltas_saturate() {
        let mut input = state();
        let ev = input.process(InputEvent::Scroll { dx: 1e12, dy: -1e12 });
        assert!(matches!(
            ev,
            Some(PointerEvent::Scroll { delta, .. }) if delta == Point::new(i32::MIN, i32::MAX)
        ));

        let bottom_right = Point::new(input.bounds.right() - 1, input.bounds.bottom() - 1);
        let ev = input.process(InputEvent::PointerMove { dx: 1e12, dy: f64::INFINITY });
        assert!(matches!(ev, Some(PointerEvent::Motion { position }) if position == bottom_right));
        let ev = input.process(InputEvent::PointerMoveAbsolute {
            x: 1e12,
            y: 1e12,
            extent: Size::new(1, 1),
        });
        assert!(matches!(ev, Some(PointerEvent::Motion { position }) if position == bottom_right));
    }

    #[test]
    fn event_wire_format() {
        let ev: InputEvent = serde_json::from_str(r#"{"type":"key","code":30,"pressed":true}"#).unwrap();
        assert_eq!(ev, InputEvent::Key { code: 30, pressed: true });
    }
}
