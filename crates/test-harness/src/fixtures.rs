//! Test fixtures for common test scenarios

use compositor::geometry::{Color, Rect, Size};
use compositor::protocol::{ClientId, SurfaceId};

use crate::headless::TestCompositor;

/// Standard test output dimensions
pub const TEST_WIDTH: i32 = 800;
pub const TEST_HEIGHT: i32 = 600;

pub const RED: Color = Color::rgb(0xFF, 0, 0);
pub const GREEN: Color = Color::rgb(0, 0xFF, 0);
pub const BLUE: Color = Color::rgb(0, 0, 0xFF);

/// Create a compositor with one visible window painted `color`
pub fn single_window(rect: Rect, color: Color) -> (TestCompositor, ClientId, SurfaceId) {
    let mut tc = TestCompositor::new_headless(TEST_WIDTH, TEST_HEIGHT);
    let (client, surface) = tc.spawn_window(rect);
    tc.paint_solid(surface, color);
    (tc, client, surface)
}

/// Two overlapping windows from separate clients. The second is on top.
///
/// W covers (100, 100, 200, 200) in red, V covers (200, 200, 200, 200) in
/// blue.
pub fn overlapping_windows() -> (TestCompositor, [(ClientId, SurfaceId); 2]) {
    let mut tc = TestCompositor::new_headless(TEST_WIDTH, TEST_HEIGHT);
    let w = tc.spawn_window(Rect::new(100, 100, 200, 200));
    tc.paint_solid(w.1, RED);
    let v = tc.spawn_window(Rect::new(200, 200, 200, 200));
    tc.paint_solid(v.1, BLUE);
    (tc, [w, v])
}

/// A wide primary output with a 4:3 secondary mirroring it
pub fn mirrored_outputs() -> TestCompositor {
    TestCompositor::with_outputs(&[Size::new(800, 400), Size::new(400, 400)])
}
