//! Display outputs
//!
//! An [`OutputSink`] is anything the compositor can present frames to. The
//! primary output receives the composed frame unscaled; every other output
//! shows it letterboxed (aspect-preserving fit, centred).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::geometry::{Color, Rect, Size};
use crate::image::Image;

/// Pixel layout accepted by an output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Argb8888,
    /// Alpha byte ignored by the device
    Xrgb8888,
}

/// A device frames are presented to
pub trait OutputSink {
    fn name(&self) -> &str;

    fn size(&self) -> Size;

    fn format(&self) -> PixelFormat {
        PixelFormat::Argb8888
    }

    /// Block until the device can take a new frame.
    ///
    /// Returns false when the wait failed; the frame is then skipped for
    /// this output.
    fn wait_for_vsync(&mut self) -> bool;

    /// Copy `rect` of `image` to the same rect of the device
    fn blit(&mut self, image: &Image, rect: Rect);
}

/// Aspect-preserving mapping of a frame onto an output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Letterbox {
    source: Size,
    target: Rect,
}

impl Letterbox {
    pub fn fit(source: Size, output: Size) -> Self {
        let target = Rect::from_size(output).centered(source.scaled_keep_aspect(output));
        Self { source, target }
    }

    /// Where the frame lands on the output
    pub fn target(&self) -> Rect {
        self.target
    }

    pub fn is_identity(&self) -> bool {
        self.target == Rect::from_size(self.source)
    }

    /// Output rect covering `rect` of the frame (rounded outward)
    pub fn map_rect(&self, rect: Rect) -> Rect {
        if self.source.is_empty() || self.target.is_empty() {
            return Rect::default();
        }
        let (sw, sh) = (self.source.width as i64, self.source.height as i64);
        let (tw, th) = (self.target.width as i64, self.target.height as i64);
        let floor = |v: i32, t: i64, s: i64| (v as i64 * t).div_euclid(s) as i32;
        let ceil = |v: i32, t: i64, s: i64| (v as i64 * t + s - 1).div_euclid(s) as i32;

        let x0 = self.target.x + floor(rect.x, tw, sw);
        let y0 = self.target.y + floor(rect.y, th, sh);
        let x1 = self.target.x + ceil(rect.right(), tw, sw);
        let y1 = self.target.y + ceil(rect.bottom(), th, sh);
        Rect::new(x0, y0, x1 - x0, y1 - y0).intersect(&self.target)
    }

    /// Nearest-neighbour sample the frame into `dst_rect` of `staging`
    pub fn present(&self, frame: &Image, staging: &mut Image, dst_rect: Rect) {
        let area = dst_rect.intersect(&self.target).intersect(&staging.rect());
        if area.is_empty() {
            return;
        }
        let (sw, sh) = (self.source.width as i64, self.source.height as i64);
        let (tw, th) = (self.target.width as i64, self.target.height as i64);
        for y in area.y..area.bottom() {
            let sy = (((y - self.target.y) as i64 * sh) / th) as i32;
            for x in area.x..area.right() {
                let sx = (((x - self.target.x) as i64 * sw) / tw) as i32;
                if let Some(px) = frame.pixel(sx, sy) {
                    staging.set_pixel(x, y, px);
                }
            }
        }
    }
}

/// Blits remembered for inspection; older ones are forgotten
const BLIT_LOG_CAPACITY: usize = 256;

#[derive(Debug)]
struct VirtualState {
    frame: Option<Image>,
    format: PixelFormat,
    frames: u64,
    blits: VecDeque<Rect>,
    fail_vsync: u32,
}

/// An in-memory output, used headless and in tests
///
/// Clones share the same state, so a test can keep a handle while the
/// compositor owns the sink.
#[derive(Debug, Clone)]
pub struct VirtualOutput {
    name: Rc<str>,
    state: Rc<RefCell<VirtualState>>,
    size: Size,
}

impl VirtualOutput {
    pub fn new(name: &str, size: Size) -> Self {
        Self {
            name: Rc::from(name),
            state: Rc::new(RefCell::new(VirtualState {
                frame: Image::filled(size, Color::BLACK),
                format: PixelFormat::Argb8888,
                frames: 0,
                blits: VecDeque::new(),
                fail_vsync: 0,
            })),
            size,
        }
    }

    pub fn with_format(self, format: PixelFormat) -> Self {
        self.state.borrow_mut().format = format;
        self
    }

    /// Pixel currently shown at (x, y)
    pub fn pixel(&self, x: i32, y: i32) -> Option<u32> {
        self.state.borrow().frame.as_ref().and_then(|f| f.pixel(x, y))
    }

    /// A copy of everything shown
    pub fn snapshot(&self) -> Option<Image> {
        self.state.borrow().frame.clone()
    }

    /// Number of vsyncs that succeeded
    pub fn frames_presented(&self) -> u64 {
        self.state.borrow().frames
    }

    /// Rects blitted since the last call, at most the latest 256
    pub fn take_blits(&self) -> Vec<Rect> {
        self.state.borrow_mut().blits.drain(..).collect()
    }

    /// Make the next `count` vsync waits fail
    pub fn fail_next_vsyncs(&self, count: u32) {
        self.state.borrow_mut().fail_vsync = count;
    }

    pub fn boxed(&self) -> Box<dyn OutputSink> {
        Box::new(self.clone())
    }
}

impl OutputSink for VirtualOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> Size {
        self.size
    }

    fn format(&self) -> PixelFormat {
        self.state.borrow().format
    }

    fn wait_for_vsync(&mut self) -> bool {
        let mut state = self.state.borrow_mut();
        if state.fail_vsync > 0 {
            state.fail_vsync -= 1;
            return false;
        }
        state.frames += 1;
        true
    }

    fn blit(&mut self, image: &Image, rect: Rect) {
        let mut state = self.state.borrow_mut();
        let format = state.format;
        if state.blits.len() == BLIT_LOG_CAPACITY {
            state.blits.pop_front();
        }
        state.blits.push_back(rect);
        let Some(frame) = state.frame.as_mut() else { return };
        frame.copy_from(image, rect, rect.top_left());
        if format == PixelFormat::Xrgb8888 {
            let area = rect.intersect(&frame.rect());
            for y in area.y..area.bottom() {
                for x in area.x..area.right() {
                    if let Some(px) = frame.pixel(x, y) {
                        frame.set_pixel(x, y, px | 0xFF00_0000);
                    }
                }
            }
        }
    }
}
