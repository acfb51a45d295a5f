//! Test assertions for compositor state

use compositor::geometry::{Color, Point, Rect};
use compositor::protocol::SurfaceId;

use crate::headless::TestCompositor;

/// Assert that the composed frame shows `color` at `point`
pub fn assert_frame_color(tc: &TestCompositor, point: Point, color: Color) {
    let got = tc.frame_pixel(point);
    assert_eq!(
        got,
        Some(color.to_argb()),
        "frame pixel at {:?} should be {:08x}, got {:?}",
        point,
        color.to_argb(),
        got.map(|p| format!("{p:08x}"))
    );
}

/// Assert that an output shows `color` at (x, y)
pub fn assert_output_color(tc: &TestCompositor, output: usize, x: i32, y: i32, color: Color) {
    let got = tc.pixel(output, x, y);
    assert_eq!(
        got,
        Some(color.to_argb()),
        "output {} pixel at ({}, {}) should be {:08x}, got {:?}",
        output,
        x,
        y,
        color.to_argb(),
        got.map(|p| format!("{p:08x}"))
    );
}

/// Assert that hit testing at `point` finds `expected`
pub fn assert_hit(tc: &TestCompositor, point: Point, expected: Option<SurfaceId>) {
    let got = tc.surface_at(point);
    assert_eq!(got, expected, "hit test at {:?} should find {:?}, got {:?}", point, expected, got);
}

/// Assert that every pixel of `rect` in the composed frame is `color`
pub fn assert_rect_filled(tc: &TestCompositor, rect: Rect, color: Color) {
    let cursor = tc
        .compositor()
        .scene()
        .geometry(tc.compositor().cursor())
        .unwrap_or_default();
    for y in rect.y..rect.bottom() {
        for x in rect.x..rect.right() {
            let point = Point::new(x, y);
            if cursor.contains(point) {
                continue;
            }
            let got = tc.frame_pixel(point);
            assert_eq!(
                got,
                Some(color.to_argb()),
                "pixel at ({}, {}) inside {:?} should be {:08x}",
                x,
                y,
                rect,
                color.to_argb()
            );
        }
    }
}
