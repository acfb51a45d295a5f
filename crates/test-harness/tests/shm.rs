//! Tests for shared-memory image transfer

use compositor::geometry::{Color, Point, Rect};
use compositor::image::Image;
use compositor::ipc::IpcCall;
use compositor::protocol::SurfaceId;
use compositor::shm::ShmInfo;
use test_harness::assertions::{assert_frame_color, assert_rect_filled};
use test_harness::fixtures::{self, GREEN, RED};
use test_harness::TestCompositor;

fn get_shm(tc: &mut TestCompositor, surface: SurfaceId) -> ShmInfo {
    serde_json::from_value(tc.call(IpcCall::GetShm { surface })).expect("shm info")
}

fn put_image(tc: &mut TestCompositor, surface: SurfaceId, key: &str, rect: Rect) -> bool {
    serde_json::from_value(tc.call(IpcCall::PutImage {
        surface,
        key: key.to_string(),
        rect,
    }))
    .expect("bool")
}

#[test]
fn segment_matches_window_size() {
    let (mut tc, _, surface) = fixtures::single_window(Rect::new(100, 100, 120, 80), RED);

    let info = get_shm(&mut tc, surface);

    assert_eq!((info.width, info.height), (120, 80));
    assert_eq!(info.stride, 120 * 4);
    assert!(info.len >= info.stride * 80);
}

#[test]
fn put_image_copies_written_pixels() {
    let (mut tc, _, surface) = fixtures::single_window(Rect::new(100, 100, 120, 80), RED);
    let info = get_shm(&mut tc, surface);
    let image = Image::filled(info.size(), GREEN).unwrap();
    stone_client::write_shm(&info, &image).unwrap();

    assert!(put_image(&mut tc, surface, &info.key, Rect::new(0, 0, 120, 80)));

    assert_rect_filled(&tc, Rect::new(100, 100, 120, 80), GREEN);
}

#[test]
fn put_image_copies_only_the_requested_rect() {
    let (mut tc, _, surface) = fixtures::single_window(Rect::new(100, 100, 120, 80), RED);
    let info = get_shm(&mut tc, surface);
    let image = Image::filled(info.size(), GREEN).unwrap();
    stone_client::write_shm(&info, &image).unwrap();

    assert!(put_image(&mut tc, surface, &info.key, Rect::new(10, 10, 20, 20)));

    assert_frame_color(&tc, Point::new(115, 115), GREEN);
    assert_frame_color(&tc, Point::new(105, 105), RED);
    assert_frame_color(&tc, Point::new(150, 150), RED);
}

#[test]
fn released_segment_is_rejected() {
    let (mut tc, _, surface) = fixtures::single_window(Rect::new(100, 100, 120, 80), RED);
    let info = get_shm(&mut tc, surface);
    tc.call(IpcCall::ReleaseShm {
        surface,
        key: info.key.clone(),
    });

    assert!(!put_image(&mut tc, surface, &info.key, Rect::new(0, 0, 120, 80)));
    assert!(!put_image(&mut tc, surface, "/stone-nonexistent", Rect::new(0, 0, 10, 10)));
    assert_frame_color(&tc, Point::new(150, 150), RED);
}

#[test]
fn segment_of_another_surface_is_rejected() {
    let mut tc = TestCompositor::new_headless(fixtures::TEST_WIDTH, fixtures::TEST_HEIGHT);
    let (_, a) = tc.spawn_window(Rect::new(100, 100, 50, 50));
    let (_, b) = tc.spawn_window(Rect::new(300, 100, 50, 50));
    let info = get_shm(&mut tc, a);
    let image = Image::filled(info.size(), GREEN).unwrap();
    stone_client::write_shm(&info, &image).unwrap();

    assert!(!put_image(&mut tc, b, &info.key, Rect::new(0, 0, 50, 50)));
    assert_frame_color(&tc, Point::new(320, 120), Color::WHITE);
}

#[test]
fn unsized_window_has_no_segment() {
    let mut tc = TestCompositor::new_headless(fixtures::TEST_WIDTH, fixtures::TEST_HEIGHT);
    let client = tc.create_client();
    let surface = tc.create_surface(client);

    assert!(tc.request(IpcCall::GetShm { surface }).is_err());
}
