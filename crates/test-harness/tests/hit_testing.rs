//! Tests for hit testing and stacking
//!
//! Hit testing must agree with what is painted: the topmost visible
//! window under a point wins, decorations belong to their window, and the
//! cursor is never the answer.

use compositor::geometry::{Point, Rect};
use compositor::ipc::IpcCall;
use test_harness::assertions::{assert_frame_color, assert_hit};
use test_harness::fixtures::{self, BLUE, RED};
use test_harness::TestCompositor;

#[test]
fn later_window_is_on_top() {
    let (tc, [(_, w), (_, v)]) = fixtures::overlapping_windows();

    assert_hit(&tc, Point::new(150, 150), Some(w));
    assert_hit(&tc, Point::new(250, 250), Some(v));
    assert_hit(&tc, Point::new(350, 350), Some(v));
    assert_hit(&tc, Point::new(50, 50), None);

    assert_frame_color(&tc, Point::new(250, 250), BLUE);
    assert_frame_color(&tc, Point::new(150, 150), RED);
}

#[test]
fn clicking_lower_window_raises_it() {
    let (mut tc, [(_, w), (_, v)]) = fixtures::overlapping_windows();

    tc.click(Point::new(150, 150));

    assert_eq!(tc.focused_surface(), Some(w));
    assert_hit(&tc, Point::new(250, 250), Some(w));
    assert_hit(&tc, Point::new(350, 350), Some(v));
    assert_frame_color(&tc, Point::new(250, 250), RED);
}

#[test]
fn title_bar_belongs_to_its_window() {
    let (tc, [(_, w), (_, v)]) = fixtures::overlapping_windows();

    // W's bar spans y 76..100
    assert_hit(&tc, Point::new(150, 88), Some(w));
    // V's bar covers W's content
    assert_hit(&tc, Point::new(250, 190), Some(v));
}

#[test]
fn hidden_window_is_skipped() {
    let (mut tc, [(_, w), (_, v)]) = fixtures::overlapping_windows();

    tc.call(IpcCall::SetVisible {
        surface: v,
        visible: false,
    });

    assert_hit(&tc, Point::new(250, 250), Some(w));
    assert_hit(&tc, Point::new(350, 350), None);
    assert_frame_color(&tc, Point::new(250, 250), RED);
}

#[test]
fn cursor_is_never_hit() {
    let mut tc = TestCompositor::new_headless(fixtures::TEST_WIDTH, fixtures::TEST_HEIGHT);

    tc.move_pointer(Point::new(600, 500));
    let cursor = tc.compositor().cursor();
    assert_eq!(tc.compositor().node_at(Point::new(602, 502)), None);

    let (_, surface) = tc.spawn_window(Rect::new(100, 100, 200, 200));
    tc.move_pointer(Point::new(150, 150));
    let hit = tc.compositor().node_at(Point::new(152, 152));
    assert_ne!(hit, Some(cursor));
    assert_eq!(tc.surface_at(Point::new(152, 152)), Some(surface));
}

#[test]
fn destroyed_window_is_not_hit() {
    let (mut tc, [(_, w), (_, v)]) = fixtures::overlapping_windows();

    tc.call(IpcCall::DestroySurface { surface: v });

    assert_hit(&tc, Point::new(250, 250), Some(w));
    assert_hit(&tc, Point::new(350, 350), None);
    assert!(tc.request(IpcCall::DestroySurface { surface: v }).is_err());
}
