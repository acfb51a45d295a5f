//! The compositor
//!
//! Owns the scene graph, the cursor, the outputs and the composed frame.
//! Every public mutator drains the damage the scene queued and repaints
//! it synchronously. A repaint composes background, wallpaper and scene
//! into the frame, then presents the damaged rects to each output.

use crate::config::Config;
use crate::cursor;
use crate::geometry::{Color, Point, Rect, Region, Size};
use crate::image::{Image, Painter};
use crate::input::{InputEvent, InputState, PointerEvent, BTN_LEFT};
use crate::output::{Letterbox, OutputSink, VirtualOutput};
use crate::scene::{NodeId, NodeKind, SceneEvent, SceneGraph};
use crate::shm::{ShmError, ShmInfo};
use crate::text::TextRenderer;
use crate::title_bar::{TitleBar, TitleBarButton, TITLE_BAR_HEIGHT};
use crate::window::{WindowEvent, WindowState};

/// A window may cover this many frames' worth of pixels
pub const MAX_WINDOW_AREA_FRAMES: i64 = 4;

/// Errors from compositor operations
#[derive(Debug, thiserror::Error)]
pub enum CompositorError {
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("node {0:?} is not a live window")]
    NoSuchWindow(NodeId),

    #[error("window size {width}x{height} exceeds the {max_area} pixel limit")]
    WindowTooLarge { width: i32, height: i32, max_area: i64 },

    #[error(transparent)]
    Shm(#[from] ShmError),
}

/// Startup settings
#[derive(Debug, Clone)]
pub struct CompositorOptions {
    pub background: Color,
    pub wallpaper: Option<Image>,
    pub cursor_size: u32,
    pub font_size: f32,
    /// Virtual output used when no output is given
    pub fallback_output: Option<(String, Size)>,
    /// Look for a system font. Without one text is measured but not drawn.
    pub load_font: bool,
}

impl Default for CompositorOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl CompositorOptions {
    /// Options from the runtime config. A wallpaper that fails to load is
    /// logged and skipped.
    pub fn from_config(config: &Config) -> Self {
        let wallpaper = config.wallpaper.as_deref().and_then(|path| match Image::load_png(path) {
            Ok(image) => {
                tracing::info!(?path, width = image.width(), height = image.height(), "loaded wallpaper");
                Some(image)
            }
            Err(e) => {
                tracing::warn!(?path, error = %e, "failed to load wallpaper");
                None
            }
        });
        Self {
            background: config.background,
            wallpaper,
            cursor_size: config.cursor_size,
            font_size: config.font_size,
            fallback_output: config
                .fallback_output
                .as_ref()
                .map(|o| (o.name.clone(), o.size())),
            load_font: true,
        }
    }
}

struct OutputSlot {
    sink: Box<dyn OutputSink>,
    /// Letterbox target buffer, for outputs that need scaling
    staging: Option<Image>,
    /// Missed a frame, needs a full present
    stale: bool,
}

/// Title bar drag in progress
#[derive(Debug, Clone, Copy)]
struct Drag {
    window: NodeId,
    /// Pointer position relative to the window origin
    offset: Point,
}

pub struct Compositor {
    scene: SceneGraph,
    cursor: NodeId,
    outputs: Vec<OutputSlot>,
    background: Color,
    wallpaper: Option<Image>,
    /// Wallpaper fitted to the composed frame
    wallpaper_cache: Option<Image>,
    composed: Image,
    painting: bool,
    /// Damage that arrived while painting
    deferred: Region,
    focused: Option<NodeId>,
    text: TextRenderer,
    input: InputState,
    drag: Option<Drag>,
    window_events: Vec<(NodeId, WindowEvent)>,
    frames: u64,
}

impl Compositor {
    /// Set up outputs, root and cursor, then paint the first frame.
    ///
    /// The first output is primary and sizes the composed frame. With no
    /// outputs the fallback virtual output is used; without one either,
    /// startup fails.
    pub fn start(mut outputs: Vec<Box<dyn OutputSink>>, options: CompositorOptions) -> Result<Self, CompositorError> {
        if outputs.is_empty() {
            let Some((name, size)) = options.fallback_output.clone() else {
                return Err(CompositorError::ResourceUnavailable(
                    "no outputs and no fallback output configured".to_string(),
                ));
            };
            tracing::warn!(name, width = size.width, height = size.height, "no outputs, using virtual fallback");
            outputs.push(Box::new(VirtualOutput::new(&name, size)));
        }
        let Some(primary) = outputs.first().map(|o| (o.name().to_string(), o.size())) else {
            return Err(CompositorError::ResourceUnavailable("no outputs".to_string()));
        };
        let composed = Image::filled(primary.1, options.background).ok_or_else(|| {
            CompositorError::ResourceUnavailable(format!("primary output {} has zero size", primary.0))
        })?;
        let frame = composed.rect();

        let mut scene = SceneGraph::new();
        let root = scene.root();
        scene.set_geometry(root, frame);

        let input = InputState::new(frame);
        let cursor_image = cursor::cursor_image(options.cursor_size)
            .ok_or_else(|| CompositorError::ResourceUnavailable("cursor image".to_string()))?;
        let cursor_rect = cursor_image.rect().translated(input.position());
        let cursor = scene.create(NodeKind::Cursor(cursor_image));
        scene.set_geometry(cursor, cursor_rect);
        scene.set_z(cursor, i32::MAX);
        scene.set_visible(cursor, true);
        scene.add_child(root, cursor);
        scene.take_damage();
        scene.take_events();

        let outputs = outputs
            .into_iter()
            .map(|sink| {
                let letterbox = Letterbox::fit(composed.size(), sink.size());
                let staging = if letterbox.is_identity() {
                    None
                } else {
                    Image::filled(sink.size(), options.background)
                };
                tracing::info!(
                    output = sink.name(),
                    width = sink.size().width,
                    height = sink.size().height,
                    format = ?sink.format(),
                    target = ?letterbox.target(),
                    "output attached"
                );
                OutputSlot {
                    sink,
                    staging,
                    stale: true,
                }
            })
            .collect();

        let text = if options.load_font {
            TextRenderer::new(options.font_size)
        } else {
            TextRenderer::without_font(options.font_size)
        };

        let mut compositor = Self {
            scene,
            cursor,
            outputs,
            background: options.background,
            wallpaper: options.wallpaper,
            wallpaper_cache: None,
            composed,
            painting: false,
            deferred: Region::new(),
            focused: None,
            text,
            input,
            drag: None,
            window_events: Vec::new(),
            frames: 0,
        };
        compositor.paint(&Region::new());
        Ok(compositor)
    }

    pub fn scene(&self) -> &SceneGraph {
        &self.scene
    }

    pub fn cursor(&self) -> NodeId {
        self.cursor
    }

    pub fn cursor_position(&self) -> Point {
        self.input.position()
    }

    /// The composed frame, at primary output size
    pub fn composed(&self) -> &Image {
        &self.composed
    }

    pub fn frame_rect(&self) -> Rect {
        self.composed.rect()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// Frames painted since startup
    pub fn frames_painted(&self) -> u64 {
        self.frames
    }

    pub fn is_painting(&self) -> bool {
        self.painting
    }

    pub fn background(&self) -> Color {
        self.background
    }

    pub fn set_background(&mut self, color: Color) {
        self.background = color;
        self.repaint();
    }

    pub fn set_wallpaper(&mut self, wallpaper: Option<Image>) {
        self.wallpaper = wallpaper;
        self.wallpaper_cache = None;
        self.repaint();
    }

    /// Repaint everything
    pub fn repaint(&mut self) {
        self.paint(&Region::new());
    }

    /// Root damage entry point.
    ///
    /// While a frame is being painted the region is kept for the frame
    /// right after it.
    pub fn mark_dirty(&mut self, region: &Region) {
        if self.painting {
            self.deferred.add_region(region);
            return;
        }
        self.paint(region);
    }

    /// Repaint whatever the scene queued since the last flush, in one frame
    pub fn flush_damage(&mut self) {
        let pending = self.scene.take_damage();
        if pending.is_empty() {
            return;
        }
        let mut region = Region::new();
        for r in &pending {
            region.add_region(r);
        }
        if !region.is_empty() {
            self.mark_dirty(&region);
        }
    }

    /// Compose `region` (everything when empty) and present it
    pub fn paint(&mut self, region: &Region) {
        debug_assert!(!self.painting, "paint re-entered while a frame is in progress");
        if self.painting {
            self.deferred.add_region(region);
            return;
        }
        self.painting = true;

        let frame = self.composed.rect();
        let root = self.scene.root();
        self.scene.set_geometry(root, frame);
        let clip = if region.is_empty() {
            Region::from(frame)
        } else {
            region.intersected(&frame)
        };
        self.refresh_wallpaper_cache();

        for rect in clip.rects() {
            let mut painter = Painter::with_clip(&mut self.composed, *rect);
            painter.fill_rect(frame, self.background);
            if let Some(wallpaper) = &self.wallpaper_cache {
                painter.draw_image(Point::default(), wallpaper);
            }
            self.scene.draw(root, &mut painter, &mut self.text);
        }
        self.present(&clip);
        self.frames += 1;
        tracing::trace!(rects = clip.len(), frame = self.frames, "painted");

        // Anything queued meanwhile goes to the next frame
        for pending in self.scene.take_damage() {
            self.mark_dirty(&pending);
        }
        self.painting = false;

        if !self.deferred.is_empty() {
            let deferred = std::mem::take(&mut self.deferred);
            tracing::debug!(rects = deferred.len(), "painting damage deferred during previous frame");
            self.paint(&deferred);
        }
    }

    fn refresh_wallpaper_cache(&mut self) {
        let size = self.composed.size();
        if self.wallpaper_cache.as_ref().is_some_and(|c| c.size() == size) {
            return;
        }
        self.wallpaper_cache = self.wallpaper.as_ref().and_then(|w| fit_wallpaper(w, size));
    }

    fn present(&mut self, clip: &Region) {
        let frame = self.composed.rect();
        let full = clip.rects().iter().any(|r| r.contains_rect(&frame));

        for slot in &mut self.outputs {
            if !slot.sink.wait_for_vsync() {
                tracing::debug!(output = slot.sink.name(), "vsync failed, skipping frame");
                slot.stale = true;
                continue;
            }
            let redraw_all = full || slot.stale;
            slot.stale = false;

            let Some(staging) = slot.staging.as_mut() else {
                // Same size as the frame: blit directly
                if redraw_all {
                    slot.sink.blit(&self.composed, frame);
                } else {
                    for rect in clip.rects() {
                        slot.sink.blit(&self.composed, *rect);
                    }
                }
                continue;
            };

            let letterbox = Letterbox::fit(self.composed.size(), staging.size());
            if redraw_all {
                staging.fill_rect(staging.rect(), self.background);
                letterbox.present(&self.composed, staging, letterbox.target());
                slot.sink.blit(staging, staging.rect());
            } else {
                for rect in clip.rects() {
                    let dst = letterbox.map_rect(*rect);
                    if dst.is_empty() {
                        continue;
                    }
                    letterbox.present(&self.composed, staging, dst);
                    slot.sink.blit(staging, dst);
                }
            }
        }
    }

    fn window_ref(&self, window: NodeId) -> Result<(), CompositorError> {
        if self.scene.is_window(window) {
            Ok(())
        } else {
            Err(CompositorError::NoSuchWindow(window))
        }
    }

    /// A detached, hidden window
    pub fn create_window(&mut self) -> NodeId {
        self.scene.create_window()
    }

    pub fn add_window(&mut self, window: NodeId) -> Result<(), CompositorError> {
        self.window_ref(window)?;
        let root = self.scene.root();
        self.scene.add_child(root, window);
        self.flush_damage();
        Ok(())
    }

    pub fn remove_window(&mut self, window: NodeId) -> Result<(), CompositorError> {
        self.window_ref(window)?;
        let root = self.scene.root();
        self.scene.remove_child(root, window);
        self.flush_damage();
        Ok(())
    }

    /// Detach and free a window, its title bar and its shm segments
    pub fn destroy_window(&mut self, window: NodeId) -> Result<(), CompositorError> {
        self.window_ref(window)?;
        if self.drag.is_some_and(|d| d.window == window) {
            self.drag = None;
        }
        self.scene.destroy(window);
        self.flush_damage();
        Ok(())
    }

    pub fn geometry(&self, window: NodeId) -> Result<Rect, CompositorError> {
        self.window_ref(window)?;
        Ok(self.scene.geometry(window).unwrap_or_default())
    }

    /// Largest content area a window may be given
    pub fn max_window_area(&self) -> i64 {
        let frame = self.composed.size();
        frame.width as i64 * frame.height as i64 * MAX_WINDOW_AREA_FRAMES
    }

    /// Move and resize a window. Sizes over [`Self::max_window_area`] are
    /// refused, leaving the window as it was.
    pub fn set_geometry(&mut self, window: NodeId, geometry: Rect) -> Result<bool, CompositorError> {
        self.window_ref(window)?;
        let max_area = self.max_window_area();
        if geometry.width.max(0) as i64 * geometry.height.max(0) as i64 > max_area {
            return Err(CompositorError::WindowTooLarge {
                width: geometry.width,
                height: geometry.height,
                max_area,
            });
        }
        let changed = self.scene.set_geometry(window, geometry);
        self.flush_damage();
        Ok(changed)
    }

    pub fn is_visible(&self, window: NodeId) -> Result<bool, CompositorError> {
        self.window_ref(window)?;
        Ok(self.scene.is_visible(window))
    }

    pub fn set_visible(&mut self, window: NodeId, visible: bool) -> Result<bool, CompositorError> {
        self.window_ref(window)?;
        let changed = self.scene.set_visible(window, visible);
        if !visible && self.focused_window() == Some(window) {
            self.set_focus(None);
        }
        self.flush_damage();
        Ok(changed)
    }

    pub fn set_z(&mut self, window: NodeId, z: i32) -> Result<bool, CompositorError> {
        self.window_ref(window)?;
        let changed = self.scene.set_z(window, z.min(i32::MAX - 1));
        self.flush_damage();
        Ok(changed)
    }

    pub fn set_title(&mut self, window: NodeId, title: &str) -> Result<bool, CompositorError> {
        self.window_ref(window)?;
        let changed = self.scene.set_title(window, title);
        self.flush_damage();
        Ok(changed)
    }

    pub fn window_state(&self, window: NodeId) -> Result<WindowState, CompositorError> {
        self.scene
            .window(window)
            .map(|w| w.state())
            .ok_or(CompositorError::NoSuchWindow(window))
    }

    pub fn set_window_state(&mut self, window: NodeId, state: WindowState) -> Result<bool, CompositorError> {
        self.window_ref(window)?;
        let changed = self.scene.set_window_state(window, state, self.maximized_geometry());
        self.flush_damage();
        Ok(changed)
    }

    /// Whole frame minus room for the title bar
    fn maximized_geometry(&self) -> Rect {
        let frame = self.composed.rect();
        Rect::new(0, TITLE_BAR_HEIGHT, frame.width, (frame.height - TITLE_BAR_HEIGHT).max(0))
    }

    pub fn begin(&mut self, window: NodeId) -> Result<bool, CompositorError> {
        let w = self.scene.window_mut(window).ok_or(CompositorError::NoSuchWindow(window))?;
        Ok(w.begin())
    }

    pub fn fill_rect(&mut self, window: NodeId, rect: Rect, color: Color) -> Result<bool, CompositorError> {
        let w = self.scene.window_mut(window).ok_or(CompositorError::NoSuchWindow(window))?;
        Ok(w.fill_rect(rect, color))
    }

    /// Draw `s` with its baseline starting at `pos`
    pub fn draw_text(&mut self, window: NodeId, pos: Point, s: &str, color: Color) -> Result<bool, CompositorError> {
        let w = self.scene.window_mut(window).ok_or(CompositorError::NoSuchWindow(window))?;
        Ok(w.draw_text(&mut self.text, pos, s, color))
    }

    /// Close the draw session and repaint what it touched
    pub fn end(&mut self, window: NodeId) -> Result<Region, CompositorError> {
        let w = self.scene.window_mut(window).ok_or(CompositorError::NoSuchWindow(window))?;
        let damage = w.end();
        if !damage.is_empty() {
            self.scene.update(window, damage.clone(), false);
            self.flush_damage();
        }
        Ok(damage)
    }

    pub fn get_shm(&mut self, window: NodeId) -> Result<ShmInfo, CompositorError> {
        let w = self.scene.window_mut(window).ok_or(CompositorError::NoSuchWindow(window))?;
        Ok(w.get_shm()?)
    }

    pub fn release_shm(&mut self, window: NodeId, key: &str) -> Result<(), CompositorError> {
        let w = self.scene.window_mut(window).ok_or(CompositorError::NoSuchWindow(window))?;
        Ok(w.release_shm(key)?)
    }

    /// Copy `region` of a shm segment into the window and repaint it
    pub fn put_image(&mut self, window: NodeId, key: &str, region: Rect) -> Result<Region, CompositorError> {
        let w = self.scene.window_mut(window).ok_or(CompositorError::NoSuchWindow(window))?;
        let damage = w.put_image(key, region)?;
        if !damage.is_empty() {
            self.scene.update(window, damage.clone(), false);
            self.flush_damage();
        }
        Ok(damage)
    }

    /// The focused window, if it still exists
    pub fn focused_window(&self) -> Option<NodeId> {
        self.focused.filter(|&w| self.scene.is_window(w))
    }

    pub fn set_focus(&mut self, window: Option<NodeId>) {
        let window = window.filter(|&w| self.scene.is_window(w));
        let previous = self.focused_window();
        if previous == window {
            return;
        }
        if let Some(previous) = previous {
            self.scene.set_window_focused(previous, false);
        }
        if let Some(window) = window {
            self.scene.set_window_focused(window, true);
        }
        tracing::debug!(?previous, ?window, "focus changed");
        self.focused = window;
        self.flush_damage();
    }

    /// Put `window` above every other root child except the cursor
    fn raise(&mut self, window: NodeId) {
        let root = self.scene.root();
        let top = self
            .scene
            .children(root)
            .iter()
            .filter(|&&c| c != window && c != self.cursor)
            .filter_map(|&c| self.scene.z(c))
            .max();
        let Some(top) = top else { return };
        if self.scene.z(window).is_some_and(|z| z > top) {
            return;
        }
        self.scene.set_z(window, top.saturating_add(1).min(i32::MAX - 1));
    }

    /// Topmost node under `point`, never the cursor
    pub fn node_at(&self, point: Point) -> Option<NodeId> {
        self.scene.node_at(point)
    }

    /// Window whose content or decoration is under `point`
    pub fn window_at(&self, point: Point) -> Option<NodeId> {
        self.node_at(point).and_then(|n| self.scene.window_of(n))
    }

    /// Events for window owners since the last call
    pub fn take_window_events(&mut self) -> Vec<(NodeId, WindowEvent)> {
        std::mem::take(&mut self.window_events)
    }

    pub fn take_scene_events(&mut self) -> Vec<SceneEvent> {
        self.scene.take_events()
    }

    /// Feed one raw input event
    pub fn handle_input(&mut self, event: InputEvent) {
        let Some(event) = self.input.process(event) else { return };
        match event {
            PointerEvent::Motion { position } => self.pointer_moved(position),
            PointerEvent::Button {
                code,
                pressed,
                position,
                ..
            } => self.pointer_button(code, pressed, position),
            PointerEvent::Scroll { delta, position } => {
                if let Some(window) = self.window_at(position) {
                    self.window_events.push((
                        window,
                        WindowEvent::Scroll {
                            dx: delta.x,
                            dy: delta.y,
                        },
                    ));
                }
            }
            PointerEvent::Key { code, pressed } => {
                if let Some(window) = self.focused_window() {
                    self.window_events.push((window, WindowEvent::Key { code, pressed }));
                }
            }
        }
        self.flush_damage();
    }

    fn pointer_moved(&mut self, position: Point) {
        if let Some(geometry) = self.scene.geometry(self.cursor) {
            self.scene.set_geometry(self.cursor, geometry.moved_to(position));
        }
        let Some(drag) = self.drag else { return };
        match self.scene.geometry(drag.window) {
            Some(geometry) => {
                self.scene.set_geometry(drag.window, geometry.moved_to(position - drag.offset));
            }
            None => self.drag = None,
        }
    }

    fn pointer_button(&mut self, code: u32, pressed: bool, position: Point) {
        if !pressed {
            if self.drag.take().is_some() {
                return;
            }
            // Decorations swallow releases like they swallow presses
            let content = self
                .node_at(position)
                .filter(|&hit| self.scene.title_bar(hit).is_none())
                .and_then(|hit| self.scene.window_of(hit));
            if let Some(window) = content {
                self.send_button(window, position, code, false);
            }
            return;
        }

        let Some(hit) = self.node_at(position) else {
            self.set_focus(None);
            return;
        };
        let Some(window) = self.scene.window_of(hit) else {
            self.set_focus(None);
            return;
        };
        self.set_focus(Some(window));
        self.raise(window);

        if self.scene.title_bar(hit).is_some() {
            if code == BTN_LEFT {
                self.title_bar_pressed(window, hit, position);
            }
            return;
        }
        self.send_button(window, position, code, true);
    }

    fn send_button(&mut self, window: NodeId, position: Point, code: u32, pressed: bool) {
        let local = position - self.scene.scene_position(window);
        self.window_events.push((
            window,
            WindowEvent::PointerButton {
                x: local.x,
                y: local.y,
                code,
                pressed,
            },
        ));
    }

    fn title_bar_pressed(&mut self, window: NodeId, bar: NodeId, position: Point) {
        let local = position - self.scene.scene_position(bar);
        let width = self.scene.geometry(bar).map_or(0, |g| g.width);
        match TitleBar::button_at(local, width) {
            Some(TitleBarButton::Minimize) => {
                self.scene.set_visible(window, false);
                self.set_focus(None);
            }
            Some(TitleBarButton::Maximize) => {
                let next = match self.scene.window(window).map(|w| w.state()) {
                    Some(WindowState::Maximized) => WindowState::Normal,
                    _ => WindowState::Maximized,
                };
                self.scene.set_window_state(window, next, self.maximized_geometry());
            }
            Some(TitleBarButton::Close) => {
                self.window_events.push((window, WindowEvent::CloseRequested));
            }
            None => {
                let origin = self.scene.geometry(window).unwrap_or_default().top_left();
                self.drag = Some(Drag {
                    window,
                    offset: position - origin,
                });
            }
        }
    }
}

/// Crop the wallpaper's top-left to the frame's aspect ratio, then scale
fn fit_wallpaper(wallpaper: &Image, size: Size) -> Option<Image> {
    let crop = Rect::from_size(size.scaled_keep_aspect(wallpaper.size()));
    wallpaper.cropped(crop)?.scaled(size)
}
