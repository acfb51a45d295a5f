//! Property-based tests for scene graph invariants
//!
//! These tests verify that stacking, hit testing and incremental repaint
//! hold across arbitrary sequences of operations.

use compositor::geometry::{Color, Point, Rect};
use compositor::ipc::IpcCall;
use compositor::scene::{NodeKind, SceneGraph};
use proptest::prelude::*;
use test_harness::TestCompositor;

fn stacked_scene(zs: &[i32]) -> (SceneGraph, Vec<compositor::scene::NodeId>) {
    let mut scene = SceneGraph::new();
    let root = scene.root();
    let nodes: Vec<_> = zs
        .iter()
        .map(|_| {
            let node = scene.create(NodeKind::Rectangle(Color::WHITE));
            scene.set_geometry(node, Rect::new(0, 0, 10, 10));
            scene.set_visible(node, true);
            scene.add_child(root, node);
            node
        })
        .collect();
    for (&node, &z) in nodes.iter().zip(zs) {
        scene.set_z(node, z);
    }
    (scene, nodes)
}

fn rect_strategy() -> impl Strategy<Value = Rect> {
    (0i32..700, 30i32..500, 1i32..200, 1i32..150).prop_map(|(x, y, w, h)| Rect::new(x, y, w, h))
}

proptest! {
    /// Children are always ordered by z, whatever order z was assigned in
    #[test]
    fn children_sorted_by_z(zs in prop::collection::vec(-5i32..5, 1..12)) {
        let (scene, _) = stacked_scene(&zs);
        let children = scene.children(scene.root());
        prop_assert_eq!(children.len(), zs.len());
        let ordered: Vec<i32> = children.iter().map(|&c| scene.z(c).unwrap()).collect();
        prop_assert!(ordered.windows(2).all(|w| w[0] <= w[1]), "not sorted: {:?}", ordered);
    }

    /// The hit node is the topmost one: highest z, last among equals
    #[test]
    fn hit_is_last_child(zs in prop::collection::vec(-5i32..5, 1..12)) {
        let (scene, nodes) = stacked_scene(&zs);
        let hit = scene.node_at(Point::new(5, 5));
        prop_assert_eq!(hit, scene.children(scene.root()).last().copied());
        let max = zs.iter().copied().max().unwrap();
        prop_assert_eq!(hit.and_then(|h| scene.z(h)), Some(max));
        prop_assert!(hit.is_some_and(|h| nodes.contains(&h)));
    }

    /// Painting only damaged areas produces the same frame as a full repaint
    #[test]
    fn incremental_repaint_matches_full(
        moves in prop::collection::vec((0usize..3, rect_strategy(), any::<bool>()), 1..12),
    ) {
        let colors = [Color::rgb(0xFF, 0, 0), Color::rgb(0, 0xFF, 0), Color::rgb(0, 0, 0xFF)];
        let mut tc = TestCompositor::new_headless(800, 600);
        let surfaces: Vec<_> = (0..3)
            .map(|i| tc.spawn_window(Rect::new(50 + i * 100, 50 + i * 50, 150, 100)).1)
            .collect();
        for (&surface, &color) in surfaces.iter().zip(&colors) {
            tc.paint_solid(surface, color);
        }

        for (index, rect, visible) in moves {
            let surface = surfaces[index];
            tc.call(IpcCall::SetGeometry { surface, rect });
            tc.call(IpcCall::SetVisible { surface, visible });
            if visible {
                tc.paint_solid(surface, colors[index]);
            }
        }

        let incremental = tc.compositor().composed().clone();
        tc.server_mut().compositor_mut().repaint();
        prop_assert!(incremental == *tc.compositor().composed(), "incremental repaint diverged");
    }
}
