//! Scene graph
//!
//! Nodes live in a generational arena owned by [`SceneGraph`]. A node has a
//! rect in its parent's coordinate space, a visibility flag, a z value and an
//! ordered child list kept sorted by z (stable for equal z).
//!
//! Damage flows upward: a node translates a repaint request into its
//! parent's space and forwards it only while it is visible. Requests that
//! reach the root are queued for the compositor to drain.

use crate::geometry::{Color, Point, Rect, Region};
use crate::image::{Image, Painter};
use crate::text::TextRenderer;
use crate::title_bar::TitleBar;
use crate::window::{Window, WindowState};

/// Handle to a node. Stale handles never alias a newer node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

/// What a node draws
#[derive(Debug)]
pub enum NodeKind {
    Root,
    Rectangle(Color),
    Cursor(Image),
    Window(Box<Window>),
    TitleBar(TitleBar),
}

#[derive(Debug)]
pub struct Node {
    geometry: Rect,
    visible: bool,
    z: i32,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    kind: NodeKind,
}

impl Node {
    fn new(kind: NodeKind) -> Self {
        Self {
            geometry: Rect::default(),
            visible: false,
            z: 0,
            parent: None,
            children: Vec::new(),
            kind,
        }
    }

    /// Rect in the parent's coordinate space
    pub fn geometry(&self) -> Rect {
        self.geometry
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn z(&self) -> i32 {
        self.z
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Children in paint order (ascending z)
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    fn paint(&self, painter: &mut Painter<'_>, text: &mut TextRenderer) {
        let size = self.geometry.size();
        match &self.kind {
            NodeKind::Root => {}
            NodeKind::Rectangle(color) => painter.fill_rect(Rect::from_size(size), *color),
            NodeKind::Cursor(image) => painter.draw_image(Point::default(), image),
            NodeKind::Window(window) => window.paint(painter),
            NodeKind::TitleBar(bar) => bar.paint(painter, size, text),
        }
    }
}

/// Changes observers care about
#[derive(Debug, Clone, PartialEq)]
pub enum SceneEvent {
    GeometryChanged { node: NodeId, geometry: Rect },
    VisibleChanged { node: NodeId, visible: bool },
    StateChanged { node: NodeId, state: WindowState },
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

#[derive(Debug)]
pub struct SceneGraph {
    slots: Vec<Slot>,
    free: Vec<u32>,
    root: NodeId,
    /// Root-level repaint requests in arrival order
    damage: Vec<Region>,
    events: Vec<SceneEvent>,
}

impl Default for SceneGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl SceneGraph {
    /// An empty scene with a visible root
    pub fn new() -> Self {
        let mut scene = Self {
            slots: Vec::new(),
            free: Vec::new(),
            root: NodeId { index: 0, generation: 0 },
            damage: Vec::new(),
            events: Vec::new(),
        };
        let mut root = Node::new(NodeKind::Root);
        root.visible = true;
        scene.root = scene.alloc(root);
        scene
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            return NodeId { index, generation: slot.generation };
        }
        self.slots.push(Slot { generation: 0, node: Some(node) });
        NodeId {
            index: (self.slots.len() - 1) as u32,
            generation: 0,
        }
    }

    fn release(&mut self, id: NodeId) {
        if let Some(slot) = self.slots.get_mut(id.index as usize) {
            if slot.generation == id.generation && slot.node.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(id.index);
            }
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
    }

    /// Number of live nodes, root included
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.node.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A detached, invisible node
    pub fn create(&mut self, kind: NodeKind) -> NodeId {
        self.alloc(Node::new(kind))
    }

    /// A detached, invisible window with its title bar child
    pub fn create_window(&mut self) -> NodeId {
        let window = self.create(NodeKind::Window(Box::new(Window::new())));
        let bar = self.create(NodeKind::TitleBar(TitleBar::new()));
        if let Some(node) = self.node_mut(bar) {
            node.visible = true;
            node.geometry = TitleBar::geometry_for(0);
        }
        self.add_child(window, bar);
        window
    }

    /// Destroy a node and its whole subtree, detaching it first
    pub fn destroy(&mut self, id: NodeId) -> bool {
        if id == self.root || !self.contains(id) {
            return false;
        }
        if let Some(parent) = self.node(id).and_then(Node::parent) {
            self.remove_child(parent, id);
        }
        self.release_subtree(id);
        true
    }

    fn release_subtree(&mut self, id: NodeId) {
        let children = self
            .node_mut(id)
            .map(|n| std::mem::take(&mut n.children))
            .unwrap_or_default();
        for child in children {
            self.release_subtree(child);
        }
        self.release(id);
    }

    fn is_ancestor(&self, ancestor: NodeId, mut id: NodeId) -> bool {
        while let Some(parent) = self.node(id).and_then(Node::parent) {
            if parent == ancestor {
                return true;
            }
            id = parent;
        }
        false
    }

    /// Insert `child` into `parent`'s list after every sibling with z <= its z
    fn insert_sorted(&mut self, parent: NodeId, child: NodeId) {
        let z = self.node(child).map_or(0, Node::z);
        let Some(siblings) = self.node(parent).map(Node::children) else { return };
        let pos = siblings
            .iter()
            .position(|&s| self.node(s).is_some_and(|n| n.z > z))
            .unwrap_or(siblings.len());
        if let Some(node) = self.node_mut(parent) {
            node.children.insert(pos, child);
        }
    }

    /// Attach `child` under `parent`, detaching it from any previous parent
    pub fn add_child(&mut self, parent: NodeId, child: NodeId) -> bool {
        if parent == child
            || child == self.root
            || !self.contains(parent)
            || !self.contains(child)
            || self.is_ancestor(child, parent)
        {
            return false;
        }
        if let Some(old) = self.node(child).and_then(Node::parent) {
            self.remove_child(old, child);
        }
        if let Some(node) = self.node_mut(child) {
            node.parent = Some(parent);
        }
        self.insert_sorted(parent, child);

        if self.node(child).is_some_and(Node::is_visible) {
            let whole = self.whole_geometry(child);
            self.update(parent, Region::from(whole), false);
        }
        true
    }

    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> bool {
        let Some(node) = self.node_mut(parent) else { return false };
        let Some(pos) = node.children.iter().position(|&c| c == child) else {
            return false;
        };
        node.children.remove(pos);

        let whole = self.whole_geometry(child);
        let visible = match self.node_mut(child) {
            Some(node) => {
                node.parent = None;
                node.visible
            }
            None => false,
        };
        if visible {
            self.update(parent, Region::from(whole), false);
        }
        true
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.node(id).map(Node::children).unwrap_or(&[])
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).and_then(Node::parent)
    }

    pub fn geometry(&self, id: NodeId) -> Option<Rect> {
        self.node(id).map(Node::geometry)
    }

    /// Move or resize a node.
    ///
    /// A window's buffers and title bar follow its size. When the node is
    /// visible its old and new whole geometry are both damaged.
    pub fn set_geometry(&mut self, id: NodeId, geometry: Rect) -> bool {
        let Some(node) = self.node(id) else { return false };
        if node.geometry == geometry {
            return false;
        }
        let old_whole = self.whole_geometry(id);
        let title_bar = self.title_bar_of(id);
        let Some(node) = self.node_mut(id) else { return false };
        node.geometry = geometry;
        if let NodeKind::Window(window) = &mut node.kind {
            window.resize(geometry.size());
        }
        let visible = node.visible;
        if let Some(bar) = title_bar.and_then(|bar| self.node_mut(bar)) {
            bar.geometry = TitleBar::geometry_for(geometry.width);
        }

        self.events.push(SceneEvent::GeometryChanged { node: id, geometry });
        if visible {
            let mut region = Region::from(old_whole);
            region.add_rect(self.whole_geometry(id));
            self.notify_parent(id, region);
        }
        true
    }

    pub fn is_visible(&self, id: NodeId) -> bool {
        self.node(id).is_some_and(Node::is_visible)
    }

    /// Show or hide a node. The parent always repaints the whole geometry.
    pub fn set_visible(&mut self, id: NodeId, visible: bool) -> bool {
        let Some(node) = self.node_mut(id) else { return false };
        if node.visible == visible {
            return false;
        }
        node.visible = visible;
        self.events.push(SceneEvent::VisibleChanged { node: id, visible });
        let whole = self.whole_geometry(id);
        self.notify_parent(id, Region::from(whole));
        true
    }

    pub fn z(&self, id: NodeId) -> Option<i32> {
        self.node(id).map(Node::z)
    }

    /// Change stacking order among siblings.
    ///
    /// The node moves forward past later siblings with a strictly smaller z,
    /// otherwise backward past earlier siblings with a strictly larger z.
    /// Siblings with an equal z never swap.
    pub fn set_z(&mut self, id: NodeId, z: i32) -> bool {
        let Some(node) = self.node_mut(id) else { return false };
        if node.z == z {
            return false;
        }
        node.z = z;
        let Some(parent) = node.parent else { return true };

        let siblings = self.children(parent);
        let Some(from) = siblings.iter().position(|&c| c == id) else { return true };
        let z_at = |i: usize| self.node(siblings[i]).map_or(0, Node::z);
        let mut to = from;
        while to + 1 < siblings.len() && z_at(to + 1) < z {
            to += 1;
        }
        if to == from {
            while to > 0 && z_at(to - 1) > z {
                to -= 1;
            }
        }
        if to == from {
            return true;
        }
        if let Some(node) = self.node_mut(parent) {
            node.children.remove(from);
            node.children.insert(to, id);
        }
        if self.is_visible(id) {
            let whole = self.whole_geometry(id);
            self.notify_parent(id, Region::from(whole));
        }
        true
    }

    /// Union of the node's rect and all descendants, in parent coordinates
    pub fn whole_geometry(&self, id: NodeId) -> Rect {
        let Some(node) = self.node(id) else { return Rect::default() };
        node.children
            .iter()
            .fold(Rect::from_size(node.geometry.size()), |acc, &child| {
                acc.union(&self.whole_geometry(child))
            })
            .translated(node.geometry.top_left())
    }

    /// Position of the node's local origin in root-parent coordinates
    pub fn scene_position(&self, id: NodeId) -> Point {
        let mut pos = Point::default();
        let mut current = Some(id);
        while let Some(node) = current.and_then(|c| self.node(c)) {
            pos = pos + node.geometry.top_left();
            current = node.parent;
        }
        pos
    }

    /// Repaint `region` of the node (local coordinates).
    ///
    /// Forwarded only while the node is visible, unless `force` is set.
    pub fn update(&mut self, id: NodeId, region: Region, force: bool) {
        if region.is_empty() {
            return;
        }
        let Some(node) = self.node(id) else { return };
        if !node.visible && !force {
            return;
        }
        let region = region.translated(node.geometry.top_left());
        self.notify_parent(id, region);
    }

    /// Hand a region (already in the parent's space) to the parent
    fn notify_parent(&mut self, id: NodeId, region: Region) {
        if region.is_empty() {
            return;
        }
        match self.parent(id) {
            Some(parent) => self.update(parent, region, false),
            None if id == self.root => self.damage.push(region),
            None => {}
        }
    }

    /// Drain root-level damage
    pub fn take_damage(&mut self) -> Vec<Region> {
        std::mem::take(&mut self.damage)
    }

    pub fn has_damage(&self) -> bool {
        !self.damage.is_empty()
    }

    pub fn take_events(&mut self) -> Vec<SceneEvent> {
        std::mem::take(&mut self.events)
    }

    /// Paint `id` and its subtree. `painter` is in the parent's space.
    pub fn draw(&self, id: NodeId, painter: &mut Painter<'_>, text: &mut TextRenderer) {
        let Some(node) = self.node(id) else { return };
        if !node.visible || !painter.clip_rect().intersects(&self.whole_geometry(id)) {
            return;
        }
        {
            let mut own = painter.child(node.geometry);
            if !own.is_clipped_out() {
                node.paint(&mut own, text);
            }
        }
        if node.children.is_empty() {
            return;
        }
        let mut inner = painter.translated(node.geometry.top_left());
        for &child in &node.children {
            self.draw(child, &mut inner, text);
        }
    }

    /// Topmost visible descendant under `point` (local coordinates of `id`).
    /// The cursor is never hit.
    pub fn child_at(&self, id: NodeId, point: Point) -> Option<NodeId> {
        let node = self.node(id)?;
        for &child in node.children.iter().rev() {
            let Some(c) = self.node(child) else { continue };
            if !c.visible || matches!(c.kind, NodeKind::Cursor(_)) {
                continue;
            }
            if let Some(hit) = self.child_at(child, point - c.geometry.top_left()) {
                return Some(hit);
            }
            if c.geometry.contains(point) {
                return Some(child);
            }
        }
        None
    }

    /// Hit test in root-parent coordinates
    pub fn node_at(&self, point: Point) -> Option<NodeId> {
        let origin = self.geometry(self.root).unwrap_or_default().top_left();
        self.child_at(self.root, point - origin)
    }

    pub fn window(&self, id: NodeId) -> Option<&Window> {
        match &self.node(id)?.kind {
            NodeKind::Window(window) => Some(window),
            _ => None,
        }
    }

    pub fn window_mut(&mut self, id: NodeId) -> Option<&mut Window> {
        match &mut self.node_mut(id)?.kind {
            NodeKind::Window(window) => Some(window),
            _ => None,
        }
    }

    pub fn is_window(&self, id: NodeId) -> bool {
        self.window(id).is_some()
    }

    pub fn title_bar(&self, id: NodeId) -> Option<&TitleBar> {
        match &self.node(id)?.kind {
            NodeKind::TitleBar(bar) => Some(bar),
            _ => None,
        }
    }

    fn title_bar_mut(&mut self, id: NodeId) -> Option<&mut TitleBar> {
        match &mut self.node_mut(id)?.kind {
            NodeKind::TitleBar(bar) => Some(bar),
            _ => None,
        }
    }

    /// The title bar child of a window
    pub fn title_bar_of(&self, window: NodeId) -> Option<NodeId> {
        self.children(window)
            .iter()
            .copied()
            .find(|&c| self.title_bar(c).is_some())
    }

    /// Nearest window at or above `id`
    pub fn window_of(&self, id: NodeId) -> Option<NodeId> {
        let mut current = Some(id);
        while let Some(node_id) = current {
            if self.is_window(node_id) {
                return Some(node_id);
            }
            current = self.parent(node_id);
        }
        None
    }

    fn repaint_title_bar(&mut self, bar: NodeId) {
        if let Some(size) = self.geometry(bar).map(|g| g.size()) {
            self.update(bar, Region::from(Rect::from_size(size)), false);
        }
    }

    pub fn set_title(&mut self, window: NodeId, title: &str) -> bool {
        let Some(bar) = self.title_bar_of(window) else { return false };
        let changed = self.title_bar_mut(bar).is_some_and(|b| b.set_title(title));
        if changed {
            self.repaint_title_bar(bar);
        }
        changed
    }

    pub fn set_window_focused(&mut self, window: NodeId, focused: bool) {
        let Some(bar) = self.title_bar_of(window) else { return };
        if self.title_bar_mut(bar).is_some_and(|b| b.set_focused(focused)) {
            self.repaint_title_bar(bar);
        }
    }

    /// Switch between normal and maximized placement.
    ///
    /// Maximizing remembers the current geometry and applies `maximized`;
    /// going back to normal restores what was remembered.
    pub fn set_window_state(&mut self, id: NodeId, state: WindowState, maximized: Rect) -> bool {
        let current = self.geometry(id).unwrap_or_default();
        let Some(window) = self.window_mut(id) else { return false };
        if window.state() == state {
            return false;
        }
        window.set_state(state);
        let target = match state {
            WindowState::Maximized => {
                window.set_restore_geometry(Some(current));
                Some(maximized)
            }
            WindowState::Normal => {
                let restore = window.restore_geometry();
                window.set_restore_geometry(None);
                restore
            }
        };
        self.events.push(SceneEvent::StateChanged { node: id, state });
        if let Some(target) = target {
            self.set_geometry(id, target);
        }
        true
    }
}
