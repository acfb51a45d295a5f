//! Headless compositor wrapper for testing
//!
//! Drives a real [`Server`] over virtual outputs. Requests travel through
//! the same line-based wire path as socket clients, replies and events are
//! captured in memory, and time is a synthetic clock advanced by the test.

use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;
use std::time::{Duration, Instant};

use compositor::compositor::{Compositor, CompositorOptions};
use compositor::config::Config;
use compositor::geometry::{Color, Point, Rect, Size};
use compositor::input::{InputEvent, BTN_LEFT};
use compositor::ipc::{self, IpcCall, IpcRequest, ServerMessage};
use compositor::output::VirtualOutput;
use compositor::protocol::{ClientEvent, ClientId, SurfaceId};
use compositor::scene::NodeId;
use compositor::server::{ConnectionId, Server};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("request {0} got no reply")]
    NoReply(u64),

    #[error("compositor error: {0}")]
    Compositor(String),
}

/// Writer that keeps everything the server sends
#[derive(Clone, Default)]
pub struct Capture(Rc<RefCell<Vec<u8>>>);

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Capture {
    /// Decode and drain everything written so far
    pub fn take_messages(&self) -> Vec<ServerMessage> {
        let bytes = std::mem::take(&mut *self.0.borrow_mut());
        String::from_utf8_lossy(&bytes)
            .lines()
            .filter(|l| !l.is_empty())
            .map(|l| serde_json::from_str(l).expect("server sent invalid JSON"))
            .collect()
    }
}

/// Options for tests: no system font, small cursor, black background
pub fn test_options() -> CompositorOptions {
    CompositorOptions {
        background: Color::BLACK,
        wallpaper: None,
        cursor_size: 16,
        font_size: 12.0,
        fallback_output: None,
        load_font: false,
    }
}

/// Config for tests: input injection on, default liveness timings
pub fn test_config() -> Config {
    Config {
        allow_input_injection: true,
        ..Config::default()
    }
}

/// Test compositor wrapper
pub struct TestCompositor {
    server: Server,
    outputs: Vec<VirtualOutput>,
    conn: ConnectionId,
    capture: Capture,
    /// Synthetic clock
    now: Instant,
    next_request: u64,
    /// Events received but not yet taken by the test
    events: Vec<(ClientId, ClientEvent)>,
}

impl TestCompositor {
    /// Create a new headless test compositor with one output
    pub fn new_headless(width: i32, height: i32) -> Self {
        Self::with_outputs(&[Size::new(width, height)])
    }

    /// One virtual output per size, the first is primary
    pub fn with_outputs(sizes: &[Size]) -> Self {
        Self::with_config(sizes, test_config())
    }

    pub fn with_config(sizes: &[Size], config: Config) -> Self {
        let outputs: Vec<VirtualOutput> = sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| VirtualOutput::new(&format!("virtual-{i}"), size))
            .collect();
        let compositor = Compositor::start(outputs.iter().map(VirtualOutput::boxed).collect(), test_options())
            .expect("failed to start headless compositor");
        let mut server = Server::new(compositor, &config);
        let capture = Capture::default();
        let conn = server.connect(Box::new(capture.clone()));
        Self {
            server,
            outputs,
            conn,
            capture,
            now: Instant::now(),
            next_request: 1,
            events: Vec::new(),
        }
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn server_mut(&mut self) -> &mut Server {
        &mut self.server
    }

    pub fn compositor(&self) -> &Compositor {
        self.server.compositor()
    }

    pub fn output(&self, index: usize) -> &VirtualOutput {
        &self.outputs[index]
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    /// Move the clock forward and run the liveness timer
    pub fn advance(&mut self, by: Duration) {
        self.now += by;
        self.server.tick(self.now);
        self.collect();
    }

    /// Send raw bytes as if read from the socket
    pub fn send_raw(&mut self, bytes: &[u8]) -> Vec<ServerMessage> {
        self.server.receive(self.conn, bytes, self.now);
        let messages = self.capture.take_messages();
        for m in &messages {
            if let ServerMessage::Event { client, event } = m {
                self.events.push((*client, event.clone()));
            }
        }
        messages
    }

    /// Send one request over the wire and return its reply
    pub fn request(&mut self, call: IpcCall) -> Result<Value, TestError> {
        let id = self.next_request;
        self.next_request += 1;
        let line = ipc::encode(&IpcRequest { id, call }).map_err(|e| TestError::Compositor(e.to_string()))?;
        let messages = self.send_raw(line.as_bytes());
        for message in messages {
            match message {
                ServerMessage::Reply { id: got, value } if got == id => return Ok(value),
                ServerMessage::Error { id: Some(got), message } if got == id => {
                    return Err(TestError::Compositor(message));
                }
                _ => {}
            }
        }
        Err(TestError::NoReply(id))
    }

    /// Like [`request`](Self::request), panicking on failure
    pub fn call(&mut self, call: IpcCall) -> Value {
        let description = format!("{call:?}");
        self.request(call)
            .unwrap_or_else(|e| panic!("{description} failed: {e}"))
    }

    fn collect(&mut self) {
        self.send_raw(b"");
    }

    pub fn create_client(&mut self) -> ClientId {
        serde_json::from_value(self.call(IpcCall::CreateClient)).expect("client id")
    }

    pub fn create_surface(&mut self, client: ClientId) -> SurfaceId {
        serde_json::from_value(self.call(IpcCall::CreateSurface { client })).expect("surface id")
    }

    /// A new client owning one visible surface at `rect`
    pub fn spawn_window(&mut self, rect: Rect) -> (ClientId, SurfaceId) {
        let client = self.create_client();
        let surface = self.create_surface(client);
        self.call(IpcCall::SetGeometry { surface, rect });
        self.call(IpcCall::SetVisible { surface, visible: true });
        (client, surface)
    }

    /// Fill the whole surface with one color in a single draw session
    pub fn paint_solid(&mut self, surface: SurfaceId, color: Color) {
        let rect = Rect::from_size(self.geometry(surface).size());
        self.call(IpcCall::Begin { surface });
        self.call(IpcCall::FillRect { surface, rect, color });
        self.call(IpcCall::End { surface });
    }

    pub fn geometry(&mut self, surface: SurfaceId) -> Rect {
        serde_json::from_value(self.call(IpcCall::Geometry { surface })).expect("rect")
    }

    pub fn window(&self, surface: SurfaceId) -> NodeId {
        self.server
            .manager()
            .window(surface)
            .expect("surface should be registered")
    }

    /// Surface whose window is hit at `point`
    pub fn surface_at(&self, point: Point) -> Option<SurfaceId> {
        let window = self.compositor().window_at(point)?;
        self.server.manager().surface_for_window(window)
    }

    pub fn focused_surface(&self) -> Option<SurfaceId> {
        let window = self.compositor().focused_window()?;
        self.server.manager().surface_for_window(window)
    }

    pub fn inject(&mut self, event: InputEvent) {
        self.call(IpcCall::InjectInput { event });
    }

    /// Warp the pointer to `point` on the primary output
    pub fn move_pointer(&mut self, point: Point) {
        let frame = self.compositor().frame_rect();
        self.inject(InputEvent::PointerMoveAbsolute {
            x: (point.x - frame.x) as f64,
            y: (point.y - frame.y) as f64,
            extent: frame.size(),
        });
    }

    pub fn press(&mut self, code: u32, pressed: bool) {
        self.inject(InputEvent::PointerButton { code, pressed });
    }

    /// Left click at `point`
    pub fn click(&mut self, point: Point) {
        self.move_pointer(point);
        self.press(BTN_LEFT, true);
        self.press(BTN_LEFT, false);
    }

    /// Left-button drag from `from` to `to`
    pub fn drag(&mut self, from: Point, to: Point) {
        self.move_pointer(from);
        self.press(BTN_LEFT, true);
        self.move_pointer(to);
        self.press(BTN_LEFT, false);
    }

    pub fn take_events(&mut self) -> Vec<(ClientId, ClientEvent)> {
        std::mem::take(&mut self.events)
    }

    /// Events for `client` only, dropping pings
    pub fn take_events_for(&mut self, client: ClientId) -> Vec<ClientEvent> {
        self.take_events()
            .into_iter()
            .filter(|(c, e)| *c == client && *e != ClientEvent::Ping)
            .map(|(_, e)| e)
            .collect()
    }

    /// Pixel shown on an output
    pub fn pixel(&self, output: usize, x: i32, y: i32) -> Option<u32> {
        self.outputs[output].pixel(x, y)
    }

    /// Pixel of the composed frame in scene coordinates
    pub fn frame_pixel(&self, point: Point) -> Option<u32> {
        self.compositor().composed().pixel(point.x, point.y)
    }
}
