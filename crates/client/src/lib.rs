//! Client library for the stone compositor
//!
//! [`Connection`] speaks the compositor's newline-delimited JSON protocol.
//! Requests are asynchronous: [`Connection::send`] returns at once and its
//! callback runs when [`Connection::dispatch`] reads the matching reply.
//! Replies arrive in request order. [`Connection::call`] and the typed
//! helpers block until their reply, dispatching anything that arrives
//! before it.
//!
//! Pings are answered automatically unless disabled, so a client only
//! needs to keep dispatching to stay alive.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io::{self, ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::rc::Rc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde_json::Value;

pub use compositor;
use compositor::geometry::{Color, Point, Rect};
use compositor::image::Image;
use compositor::input::InputEvent;
use compositor::ipc::{self, IpcCall, IpcError, IpcRequest, LineReader, ServerMessage};
use compositor::protocol::{ClientEvent, ClientId, SurfaceId};
use compositor::shm::{SharedBuffer, ShmError, ShmInfo};
use compositor::window::WindowState;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error("unexpected message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("compositor error: {0}")]
    Server(String),

    #[error("connection closed by compositor")]
    Disconnected,

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Shm(#[from] ShmError),
}

/// A reply value, or the compositor's error message
pub type Reply = Result<Value, String>;

type Callback = Box<dyn FnOnce(Reply)>;

/// How long blocking calls wait for their reply
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Connection {
    stream: UnixStream,
    reader: LineReader,
    next_id: u64,
    /// Callbacks by request id. `None` means the reply is only logged.
    pending: HashMap<u64, Option<Callback>>,
    events: VecDeque<(ClientId, ClientEvent)>,
    auto_pong: bool,
    timeout: Duration,
    closed: bool,
}

impl Connection {
    pub fn connect(path: &Path) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(path)?;
        tracing::debug!(?path, "connected to compositor");
        Ok(Self::from_stream(stream))
    }

    /// Connect to the socket the compositor advertises in STONE_SOCKET
    pub fn connect_default() -> Result<Self, ClientError> {
        Self::connect(&ipc::socket_path(None))
    }

    pub fn from_stream(stream: UnixStream) -> Self {
        Self {
            stream,
            reader: LineReader::new(),
            next_id: 1,
            pending: HashMap::new(),
            events: VecDeque::new(),
            auto_pong: true,
            timeout: DEFAULT_TIMEOUT,
            closed: false,
        }
    }

    pub fn set_auto_pong(&mut self, enabled: bool) {
        self.auto_pong = enabled;
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Requests still waiting for a reply
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Send a request. `callback` runs with its reply during a later dispatch.
    pub fn send(&mut self, call: IpcCall, callback: impl FnOnce(Reply) + 'static) -> Result<u64, ClientError> {
        self.send_inner(call, Some(Box::new(callback)))
    }

    fn send_inner(&mut self, call: IpcCall, callback: Option<Callback>) -> Result<u64, ClientError> {
        if self.closed {
            return Err(ClientError::Disconnected);
        }
        let id = self.next_id;
        self.next_id += 1;
        let line = ipc::encode(&IpcRequest { id, call })?;
        self.stream.write_all(line.as_bytes())?;
        self.pending.insert(id, callback);
        Ok(id)
    }

    /// Handle buffered messages, or wait up to `timeout` for more.
    ///
    /// `None` blocks until data arrives. Returns the number of messages
    /// handled.
    pub fn dispatch(&mut self, timeout: Option<Duration>) -> Result<usize, ClientError> {
        let handled = self.drain_lines()?;
        if handled > 0 {
            return Ok(handled);
        }
        if self.closed {
            return Err(ClientError::Disconnected);
        }

        // A zero timeout is rejected by the socket
        self.stream
            .set_read_timeout(timeout.map(|t| t.max(Duration::from_millis(1))))?;
        let mut buf = [0u8; 16 * 1024];
        match self.stream.read(&mut buf) {
            Ok(0) => {
                self.closed = true;
                return Err(ClientError::Disconnected);
            }
            Ok(n) => self.reader.push(&buf[..n]),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted) => {
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        }
        self.drain_lines()
    }

    fn drain_lines(&mut self) -> Result<usize, ClientError> {
        let mut handled = 0;
        while let Some(line) = self.reader.next_line() {
            let message: ServerMessage = serde_json::from_str(&line?)?;
            self.handle_message(message)?;
            handled += 1;
        }
        Ok(handled)
    }

    fn handle_message(&mut self, message: ServerMessage) -> Result<(), ClientError> {
        match message {
            ServerMessage::Reply { id, value } => self.complete(id, Ok(value)),
            ServerMessage::Error { id: Some(id), message } => self.complete(id, Err(message)),
            ServerMessage::Error { id: None, message } => {
                tracing::warn!(%message, "compositor could not read a request");
            }
            ServerMessage::Event { client, event } => {
                if event == ClientEvent::Ping && self.auto_pong {
                    self.send_inner(IpcCall::Pong { client }, None)?;
                }
                self.events.push_back((client, event));
            }
        }
        Ok(())
    }

    fn complete(&mut self, id: u64, reply: Reply) {
        match self.pending.remove(&id) {
            Some(Some(callback)) => callback(reply),
            Some(None) => {
                if let Err(message) = reply {
                    tracing::debug!(id, %message, "request failed");
                }
            }
            None => tracing::warn!(id, "reply to unknown request"),
        }
    }

    /// Next queued event
    pub fn poll_event(&mut self) -> Option<(ClientId, ClientEvent)> {
        self.events.pop_front()
    }

    pub fn take_events(&mut self) -> Vec<(ClientId, ClientEvent)> {
        self.events.drain(..).collect()
    }

    /// Send a request and wait for its reply
    pub fn call(&mut self, call: IpcCall) -> Result<Value, ClientError> {
        let slot: Rc<RefCell<Option<Reply>>> = Rc::default();
        let sink = Rc::clone(&slot);
        let id = self.send(call, move |reply| *sink.borrow_mut() = Some(reply))?;

        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(reply) = slot.borrow_mut().take() {
                return reply.map_err(ClientError::Server);
            }
            let now = Instant::now();
            if now >= deadline {
                self.pending.remove(&id);
                return Err(ClientError::Timeout(self.timeout));
            }
            if let Err(e) = self.dispatch(Some(deadline - now)) {
                self.pending.remove(&id);
                return Err(e);
            }
        }
    }

    fn call_as<T: DeserializeOwned>(&mut self, call: IpcCall) -> Result<T, ClientError> {
        Ok(serde_json::from_value(self.call(call)?)?)
    }

    fn call_unit(&mut self, call: IpcCall) -> Result<(), ClientError> {
        self.call(call).map(|_| ())
    }

    pub fn create_client(&mut self) -> Result<ClientId, ClientError> {
        self.call_as(IpcCall::CreateClient)
    }

    pub fn destroy_client(&mut self, client: ClientId) -> Result<(), ClientError> {
        self.call_unit(IpcCall::DestroyClient { client })
    }

    pub fn pong(&mut self, client: ClientId) -> Result<(), ClientError> {
        self.call_unit(IpcCall::Pong { client })
    }

    pub fn create_surface(&mut self, client: ClientId) -> Result<SurfaceId, ClientError> {
        self.call_as(IpcCall::CreateSurface { client })
    }

    pub fn destroy_surface(&mut self, surface: SurfaceId) -> Result<(), ClientError> {
        self.call_unit(IpcCall::DestroySurface { surface })
    }

    pub fn geometry(&mut self, surface: SurfaceId) -> Result<Rect, ClientError> {
        self.call_as(IpcCall::Geometry { surface })
    }

    pub fn set_geometry(&mut self, surface: SurfaceId, rect: Rect) -> Result<(), ClientError> {
        self.call_unit(IpcCall::SetGeometry { surface, rect })
    }

    pub fn visible(&mut self, surface: SurfaceId) -> Result<bool, ClientError> {
        self.call_as(IpcCall::Visible { surface })
    }

    pub fn set_visible(&mut self, surface: SurfaceId, visible: bool) -> Result<(), ClientError> {
        self.call_unit(IpcCall::SetVisible { surface, visible })
    }

    pub fn set_title(&mut self, surface: SurfaceId, title: &str) -> Result<(), ClientError> {
        self.call_unit(IpcCall::SetTitle {
            surface,
            title: title.to_string(),
        })
    }

    pub fn state(&mut self, surface: SurfaceId) -> Result<WindowState, ClientError> {
        self.call_as(IpcCall::State { surface })
    }

    pub fn set_state(&mut self, surface: SurfaceId, state: WindowState) -> Result<(), ClientError> {
        self.call_unit(IpcCall::SetState { surface, state })
    }

    /// Open a draw session. False if one is already open.
    pub fn begin(&mut self, surface: SurfaceId) -> Result<bool, ClientError> {
        self.call_as(IpcCall::Begin { surface })
    }

    pub fn fill_rect(&mut self, surface: SurfaceId, rect: Rect, color: Color) -> Result<(), ClientError> {
        self.call_unit(IpcCall::FillRect { surface, rect, color })
    }

    /// Draw text with its baseline starting at `pos`
    pub fn draw_text(&mut self, surface: SurfaceId, pos: Point, text: &str, color: Color) -> Result<(), ClientError> {
        self.call_unit(IpcCall::DrawText {
            surface,
            pos,
            text: text.to_string(),
            color,
        })
    }

    pub fn end(&mut self, surface: SurfaceId) -> Result<(), ClientError> {
        self.call_unit(IpcCall::End { surface })
    }

    pub fn get_shm(&mut self, surface: SurfaceId) -> Result<ShmInfo, ClientError> {
        self.call_as(IpcCall::GetShm { surface })
    }

    pub fn release_shm(&mut self, surface: SurfaceId, key: &str) -> Result<(), ClientError> {
        self.call_unit(IpcCall::ReleaseShm {
            surface,
            key: key.to_string(),
        })
    }

    /// Copy `rect` of a shm segment into the surface. False when the
    /// compositor could not lock or find the segment.
    pub fn put_image(&mut self, surface: SurfaceId, key: &str, rect: Rect) -> Result<bool, ClientError> {
        self.call_as(IpcCall::PutImage {
            surface,
            key: key.to_string(),
            rect,
        })
    }

    pub fn inject_input(&mut self, event: InputEvent) -> Result<(), ClientError> {
        self.call_unit(IpcCall::InjectInput { event })
    }
}

/// Write `image` into the segment described by `info`, under its lock
pub fn write_shm(info: &ShmInfo, image: &Image) -> Result<(), ClientError> {
    let mut buffer = SharedBuffer::attach(info)?;
    let mut guard = buffer.lock()?;
    guard.write_image(image);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader};
    use std::sync::mpsc;
    use std::thread;

    use serde_json::json;

    use super::*;

    /// A scripted compositor on the other end of a socket pair
    fn scripted<F>(script: F) -> Connection
    where
        F: FnOnce(&mut BufReader<UnixStream>, &mut UnixStream) + Send + 'static,
    {
        let (client, server) = UnixStream::pair().expect("failed to create socket pair");
        thread::spawn(move || {
            let mut writer = server.try_clone().unwrap();
            let mut reader = BufReader::new(server);
            script(&mut reader, &mut writer);
        });
        Connection::from_stream(client)
    }

    fn read_request(reader: &mut BufReader<UnixStream>) -> IpcRequest {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        ipc::parse_request(&line).unwrap()
    }

    fn write(writer: &mut UnixStream, message: &ServerMessage) {
        writer.write_all(ipc::encode(message).unwrap().as_bytes()).unwrap();
    }

    #[test]
    fn typed_call_decodes_reply() {
        let mut conn = scripted(|reader, writer| {
            let req = read_request(reader);
            assert_eq!(req.call, IpcCall::CreateClient);
            write(writer, &ServerMessage::reply(req.id, &7u64).unwrap());
        });
        assert_eq!(conn.create_client().unwrap(), ClientId(7));
        assert_eq!(conn.pending_requests(), 0);
    }

    #[test]
    fn callbacks_run_in_reply_order() {
        let mut conn = scripted(|reader, writer| {
            let first = read_request(reader);
            let second = read_request(reader);
            write(writer, &ServerMessage::reply(first.id, &"a").unwrap());
            write(writer, &ServerMessage::reply(second.id, &"b").unwrap());
        });
        let seen = Rc::new(RefCell::new(Vec::new()));
        for _ in 0..2 {
            let seen = Rc::clone(&seen);
            conn.send(IpcCall::CreateClient, move |reply| seen.borrow_mut().push(reply.unwrap()))
                .unwrap();
        }
        let mut handled = 0;
        while handled < 2 {
            handled += conn.dispatch(Some(Duration::from_secs(5))).unwrap();
        }
        assert_eq!(*seen.borrow(), vec![json!("a"), json!("b")]);
    }

    #[test]
    fn error_reply_becomes_server_error() {
        let mut conn = scripted(|reader, writer| {
            let req = read_request(reader);
            write(writer, &ServerMessage::error(Some(req.id), "unknown surface 9"));
        });
        match conn.begin(SurfaceId(9)) {
            Err(ClientError::Server(message)) => assert_eq!(message, "unknown surface 9"),
            other => panic!("expected server error, got {other:?}"),
        }
    }

    #[test]
    fn ping_is_answered_and_queued() {
        let (tx, rx) = mpsc::channel();
        let mut conn = scripted(move |reader, writer| {
            write(
                writer,
                &ServerMessage::Event {
                    client: ClientId(3),
                    event: ClientEvent::Ping,
                },
            );
            tx.send(read_request(reader)).unwrap();
        });
        while conn.dispatch(Some(Duration::from_secs(5))).unwrap() == 0 {}
        assert_eq!(conn.poll_event(), Some((ClientId(3), ClientEvent::Ping)));
        let pong = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(pong.call, IpcCall::Pong { client: ClientId(3) });
    }

    #[test]
    fn timed_out_call_forgets_its_request() {
        let (done, wait) = mpsc::channel::<()>();
        let mut conn = scripted(move |reader, _| {
            read_request(reader);
            // Hold the socket open without replying
            let _ = wait.recv();
        });
        conn.set_timeout(Duration::from_millis(50));
        assert!(matches!(conn.create_client(), Err(ClientError::Timeout(_))));
        assert_eq!(conn.pending_requests(), 0);
        drop(done);
    }

    #[test]
    fn closed_socket_reports_disconnect() {
        let mut conn = scripted(|_, _| {});
        let result = loop {
            match conn.dispatch(Some(Duration::from_secs(5))) {
                Ok(_) => continue,
                other => break other,
            }
        };
        assert!(matches!(result, Err(ClientError::Disconnected)));
        assert!(matches!(conn.create_client(), Err(ClientError::Disconnected)));
    }
}
