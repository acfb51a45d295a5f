//! Request dispatch
//!
//! [`Server`] owns the compositor and the protocol manager and speaks the
//! wire format with any number of connections. It knows nothing about
//! sockets: bytes come in through [`Server::receive`], replies and events
//! leave through the writer each connection was registered with. The
//! event loop in `setup` wires real sockets to it, tests wire in buffers.
//!
//! Writers may be non-blocking. Output a writer cannot take yet stays
//! queued on the connection until [`Server::flush`] is called again.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{ErrorKind, Write};
use std::time::Instant;

use serde_json::{json, Value};

use crate::compositor::{Compositor, CompositorError};
use crate::config::Config;
use crate::input::InputEvent;
use crate::ipc::{self, IpcCall, IpcError, ServerMessage};
use crate::protocol::{ClientEvent, ClientId, Manager, ProtocolError, ProtocolEvent, SurfaceId};
use crate::scene::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

/// Queued output allowed per connection before it is dropped
pub const MAX_PENDING_OUTPUT: usize = 16 * 1024 * 1024;

struct Connection {
    writer: Box<dyn Write>,
    /// Encoded messages the writer has not taken yet
    outgoing: Vec<u8>,
    reader: ipc::LineReader,
    /// Clients created over this connection
    clients: BTreeSet<ClientId>,
    broken: bool,
}

pub struct Server {
    compositor: Compositor,
    manager: Manager,
    connections: BTreeMap<ConnectionId, Connection>,
    client_connections: HashMap<ClientId, ConnectionId>,
    next_connection: u64,
    allow_input_injection: bool,
}

impl Server {
    pub fn new(compositor: Compositor, config: &Config) -> Self {
        Self {
            compositor,
            manager: Manager::new(config.liveness),
            connections: BTreeMap::new(),
            client_connections: HashMap::new(),
            next_connection: 1,
            allow_input_injection: config.allow_input_injection,
        }
    }

    pub fn compositor(&self) -> &Compositor {
        &self.compositor
    }

    pub fn compositor_mut(&mut self) -> &mut Compositor {
        &mut self.compositor
    }

    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connect(&mut self, writer: Box<dyn Write>) -> ConnectionId {
        let id = ConnectionId(self.next_connection);
        self.next_connection += 1;
        self.connections.insert(
            id,
            Connection {
                writer,
                outgoing: Vec::new(),
                reader: ipc::LineReader::new(),
                clients: BTreeSet::new(),
                broken: false,
            },
        );
        tracing::debug!(connection = id.0, "connection opened");
        id
    }

    /// Feed bytes read from a connection and answer every complete request.
    ///
    /// Returns false once the connection is gone or its writer failed; the
    /// caller should then [`disconnect`](Self::disconnect) it.
    pub fn receive(&mut self, conn: ConnectionId, bytes: &[u8], now: Instant) -> bool {
        let Some(connection) = self.connections.get_mut(&conn) else { return false };
        connection.reader.push(bytes);
        loop {
            let Some(line) = self.connections.get_mut(&conn).and_then(|c| c.reader.next_line()) else {
                break;
            };
            let reply = match line {
                Ok(line) => self.handle_line(conn, &line, now),
                Err(e) => {
                    tracing::warn!(connection = conn.0, error = %e, "unreadable request");
                    Some(ServerMessage::error(None, e))
                }
            };
            if let Some(reply) = reply {
                self.send(conn, &reply);
            }
        }
        self.flush_events();
        self.connections.get(&conn).is_some_and(|c| !c.broken)
    }

    fn handle_line(&mut self, conn: ConnectionId, line: &str, now: Instant) -> Option<ServerMessage> {
        let request = match ipc::parse_request(line) {
            Ok(request) => request,
            Err(IpcError::EmptyMessage) => return None,
            Err(e) => {
                tracing::warn!(connection = conn.0, error = %e, "IPC request parsing failed");
                return Some(ServerMessage::error(None, e));
            }
        };
        tracing::trace!(connection = conn.0, id = request.id, call = ?request.call, "request");
        let id = request.id;
        Some(match self.handle_request(conn, request.call, now) {
            Ok(value) => ServerMessage::Reply { id, value },
            Err(e) => {
                tracing::debug!(connection = conn.0, id, error = %e, "request rejected");
                ServerMessage::error(Some(id), e)
            }
        })
    }

    fn owned_client(&self, conn: ConnectionId, client: ClientId) -> Result<ClientId, ProtocolError> {
        match self.connections.get(&conn) {
            Some(c) if c.clients.contains(&client) => Ok(client),
            _ => Err(ProtocolError::UnknownClient(client)),
        }
    }

    /// Window of a surface owned by one of this connection's clients
    fn owned_window(&self, conn: ConnectionId, surface: SurfaceId) -> Result<NodeId, ProtocolError> {
        let owner = self.manager.owner(surface)?;
        self.owned_client(conn, owner)
            .map_err(|_| ProtocolError::UnknownSurface(surface))?;
        self.manager.window(surface)
    }

    /// Run one call on behalf of a connection
    pub fn handle_request(&mut self, conn: ConnectionId, call: IpcCall, now: Instant) -> Result<Value, ProtocolError> {
        let value = match call {
            IpcCall::CreateClient => {
                let client = self.manager.create_client(now);
                self.client_connections.insert(client, conn);
                if let Some(c) = self.connections.get_mut(&conn) {
                    c.clients.insert(client);
                }
                json!(client)
            }
            IpcCall::DestroyClient { client } => {
                let client = self.owned_client(conn, client)?;
                self.forget_client(client);
                self.manager.destroy_client(&mut self.compositor, client)?;
                Value::Null
            }
            IpcCall::Pong { client } => {
                let client = self.owned_client(conn, client)?;
                self.manager.pong(client, now)?;
                Value::Null
            }
            IpcCall::CreateSurface { client } => {
                let client = self.owned_client(conn, client)?;
                json!(self.manager.create_surface(&mut self.compositor, client)?)
            }
            IpcCall::DestroySurface { surface } => {
                self.owned_window(conn, surface)?;
                self.manager.destroy_surface(&mut self.compositor, surface)?;
                Value::Null
            }
            IpcCall::Geometry { surface } => {
                let window = self.owned_window(conn, surface)?;
                json!(self.compositor.geometry(window)?)
            }
            IpcCall::SetGeometry { surface, rect } => {
                let window = self.owned_window(conn, surface)?;
                self.compositor.set_geometry(window, rect)?;
                Value::Null
            }
            IpcCall::Visible { surface } => {
                let window = self.owned_window(conn, surface)?;
                json!(self.compositor.is_visible(window)?)
            }
            IpcCall::SetVisible { surface, visible } => {
                let window = self.owned_window(conn, surface)?;
                self.compositor.set_visible(window, visible)?;
                Value::Null
            }
            IpcCall::SetTitle { surface, title } => {
                let window = self.owned_window(conn, surface)?;
                self.compositor.set_title(window, &title)?;
                Value::Null
            }
            IpcCall::State { surface } => {
                let window = self.owned_window(conn, surface)?;
                json!(self.compositor.window_state(window)?)
            }
            IpcCall::SetState { surface, state } => {
                let window = self.owned_window(conn, surface)?;
                self.compositor.set_window_state(window, state)?;
                Value::Null
            }
            IpcCall::Begin { surface } => {
                let window = self.owned_window(conn, surface)?;
                json!(self.compositor.begin(window)?)
            }
            IpcCall::FillRect { surface, rect, color } => {
                let window = self.owned_window(conn, surface)?;
                self.compositor.fill_rect(window, rect, color)?;
                Value::Null
            }
            IpcCall::DrawText {
                surface,
                pos,
                text,
                color,
            } => {
                let window = self.owned_window(conn, surface)?;
                self.compositor.draw_text(window, pos, &text, color)?;
                Value::Null
            }
            IpcCall::End { surface } => {
                let window = self.owned_window(conn, surface)?;
                self.compositor.end(window)?;
                Value::Null
            }
            IpcCall::GetShm { surface } => {
                let window = self.owned_window(conn, surface)?;
                json!(self.compositor.get_shm(window)?)
            }
            IpcCall::ReleaseShm { surface, key } => {
                let window = self.owned_window(conn, surface)?;
                self.compositor.release_shm(window, &key)?;
                Value::Null
            }
            IpcCall::PutImage { surface, key, rect } => {
                let window = self.owned_window(conn, surface)?;
                match self.compositor.put_image(window, &key, rect) {
                    Ok(_) => json!(true),
                    Err(CompositorError::Shm(e)) => {
                        tracing::warn!(surface = surface.0, key = %key, error = %e, "put_image failed");
                        json!(false)
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            IpcCall::InjectInput { event } => {
                if !self.allow_input_injection {
                    return Err(ProtocolError::InputInjectionDisabled);
                }
                self.compositor.handle_input(event);
                Value::Null
            }
        };
        Ok(value)
    }

    /// Drop a connection and every client created over it
    pub fn disconnect(&mut self, conn: ConnectionId) {
        let Some(connection) = self.connections.remove(&conn) else { return };
        for client in connection.clients {
            self.client_connections.remove(&client);
            if let Err(e) = self.manager.destroy_client(&mut self.compositor, client) {
                tracing::debug!(client = client.0, error = %e, "client already gone");
            }
        }
        tracing::debug!(connection = conn.0, "connection closed");
        self.flush_events();
    }

    /// Advance liveness timers
    pub fn tick(&mut self, now: Instant) {
        let expired = self.manager.tick(&mut self.compositor, now);
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "destroyed unresponsive clients");
        }
        self.flush_events();
    }

    /// Feed input from a device
    pub fn handle_input(&mut self, event: InputEvent) {
        self.compositor.handle_input(event);
        self.flush_events();
    }

    /// Deliver pending events to the connections owning their clients
    pub fn flush_events(&mut self) {
        self.manager.collect_events(&mut self.compositor);
        for ProtocolEvent { client, event } in self.manager.take_events() {
            let Some(&conn) = self.client_connections.get(&client) else { continue };
            let destroyed = event == ClientEvent::ClientDestroyed;
            self.send(conn, &ServerMessage::Event { client, event });
            if destroyed {
                self.forget_client(client);
            }
        }
    }

    fn forget_client(&mut self, client: ClientId) {
        if let Some(conn) = self.client_connections.remove(&client) {
            if let Some(c) = self.connections.get_mut(&conn) {
                c.clients.remove(&client);
            }
        }
    }

    /// Connections with output waiting for their writer
    pub fn backlogged_connections(&self) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|(_, c)| !c.broken && !c.outgoing.is_empty())
            .map(|(&id, _)| id)
            .collect()
    }

    /// Connections whose writer failed, waiting to be disconnected
    pub fn broken_connections(&self) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|(_, c)| c.broken)
            .map(|(&id, _)| id)
            .collect()
    }

    pub fn pending_output(&self, conn: ConnectionId) -> usize {
        self.connections.get(&conn).map_or(0, |c| c.outgoing.len())
    }

    /// Write as much queued output as the writer takes.
    ///
    /// Returns false once the connection is gone or its writer failed.
    pub fn flush(&mut self, conn: ConnectionId) -> bool {
        let Some(connection) = self.connections.get_mut(&conn) else { return false };
        if connection.broken {
            return false;
        }
        if let Err(e) = connection.write_pending() {
            tracing::warn!(connection = conn.0, error = %e, "failed to write to connection");
            connection.broken = true;
            connection.outgoing.clear();
            return false;
        }
        true
    }

    fn send(&mut self, conn: ConnectionId, message: &ServerMessage) {
        let Some(connection) = self.connections.get_mut(&conn) else { return };
        if connection.broken {
            return;
        }
        let line = match ipc::encode(message) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode message");
                return;
            }
        };
        if connection.outgoing.len() + line.len() > MAX_PENDING_OUTPUT {
            tracing::warn!(
                connection = conn.0,
                pending = connection.outgoing.len(),
                "connection stopped reading, dropping it"
            );
            connection.broken = true;
            connection.outgoing.clear();
            return;
        }
        connection.outgoing.extend_from_slice(line.as_bytes());
        self.flush(conn);
    }
}

impl Connection {
    /// Stops without error when the writer would block
    fn write_pending(&mut self) -> std::io::Result<()> {
        while !self.outgoing.is_empty() {
            match self.writer.write(&self.outgoing) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.outgoing.drain(..n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        match self.writer.flush() {
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(()),
            result => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::io;
    use std::rc::Rc;

    use super::*;
    use crate::compositor::CompositorOptions;
    use crate::geometry::{Color, Rect, Size};
    use crate::output::VirtualOutput;

    /// Writer that keeps everything written, shared with the test
    #[derive(Clone, Default)]
    struct Capture(Rc<RefCell<Vec<u8>>>);

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
        fn messages(&self) -> Vec<ServerMessage> {
            let bytes = std::mem::take(&mut *self.0.borrow_mut());
            String::from_utf8(bytes)
                .unwrap()
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect()
        }
    }

    fn server(config: &Config) -> Server {
        let options = CompositorOptions {
            background: Color::BLACK,
            wallpaper: None,
            cursor_size: 16,
            font_size: 10.0,
            fallback_output: None,
            load_font: false,
        };
        let output = VirtualOutput::new("test", Size::new(320, 240));
        Server::new(Compositor::start(vec![output.boxed()], options).unwrap(), config)
    }

    fn reply_value(messages: &[ServerMessage], want: u64) -> Value {
        messages
            .iter()
            .find_map(|m| match m {
                ServerMessage::Reply { id, value } if *id == want => Some(value.clone()),
                _ => None,
            })
            .unwrap_or_else(|| panic!("no reply {want} in {messages:?}"))
    }

    #[test]
    fn requests_are_answered_in_order() {
        let mut server = server(&Config::default());
        let out = Capture::default();
        let conn = server.connect(Box::new(out.clone()));
        let now = Instant::now();

        let script = concat!(
            r#"{"id":1,"call":{"method":"create_client"}}"#,
            "\n",
            r#"{"id":2,"call":{"method":"create_surface","client":1}}"#,
            "\n",
            r#"{"id":3,"call":{"method":"visible","surface":1}}"#,
            "\n",
        );
        assert!(server.receive(conn, script.as_bytes(), now));
        let messages = out.messages();
        let ids: Vec<u64> = messages
            .iter()
            .filter_map(|m| match m {
                ServerMessage::Reply { id, .. } => Some(*id),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(reply_value(&messages, 1), json!(1));
        assert_eq!(reply_value(&messages, 2), json!(1));
        assert_eq!(reply_value(&messages, 3), json!(false));
    }

    #[test]
    fn other_connections_cannot_touch_surfaces() {
        let mut server = server(&Config::default());
        let now = Instant::now();
        let a = server.connect(Box::new(io::sink()));
        let b = server.connect(Box::new(io::sink()));
        let client = server.handle_request(a, IpcCall::CreateClient, now).unwrap();
        let client: ClientId = serde_json::from_value(client).unwrap();
        let surface = server.handle_request(a, IpcCall::CreateSurface { client }, now).unwrap();
        let surface: SurfaceId = serde_json::from_value(surface).unwrap();

        assert!(matches!(
            server.handle_request(b, IpcCall::Begin { surface }, now),
            Err(ProtocolError::UnknownSurface(_))
        ));
        assert!(matches!(
            server.handle_request(b, IpcCall::CreateSurface { client }, now),
            Err(ProtocolError::UnknownClient(_))
        ));
    }

    #[test]
    fn parse_errors_are_reported_without_id() {
        let mut server = server(&Config::default());
        let out = Capture::default();
        let conn = server.connect(Box::new(out.clone()));
        assert!(server.receive(conn, b"garbage\n\n", Instant::now()));
        let messages = out.messages();
        assert_eq!(messages.len(), 1);
        assert!(matches!(&messages[0], ServerMessage::Error { id: None, .. }));
    }

    #[test]
    fn geometry_change_is_pushed_as_event() {
        let mut server = server(&Config::default());
        let out = Capture::default();
        let conn = server.connect(Box::new(out.clone()));
        let now = Instant::now();
        server.handle_request(conn, IpcCall::CreateClient, now).unwrap();
        server
            .handle_request(conn, IpcCall::CreateSurface { client: ClientId(1) }, now)
            .unwrap();
        let rect = Rect::new(10, 30, 40, 40);
        server
            .handle_request(
                conn,
                IpcCall::SetGeometry {
                    surface: SurfaceId(1),
                    rect,
                },
                now,
            )
            .unwrap();
        server.flush_events();
        assert_eq!(
            out.messages(),
            vec![ServerMessage::Event {
                client: ClientId(1),
                event: ClientEvent::GeometryChanged {
                    surface: SurfaceId(1),
                    geometry: rect
                }
            }]
        );
    }

    #[test]
    fn disconnect_destroys_clients_and_windows() {
        let mut server = server(&Config::default());
        let now = Instant::now();
        let conn = server.connect(Box::new(io::sink()));
        server.handle_request(conn, IpcCall::CreateClient, now).unwrap();
        server
            .handle_request(conn, IpcCall::CreateSurface { client: ClientId(1) }, now)
            .unwrap();
        let window = server.manager().window(SurfaceId(1)).unwrap();

        server.disconnect(conn);
        assert_eq!(server.connection_count(), 0);
        assert_eq!(server.manager().client_count(), 0);
        assert!(!server.compositor().scene().contains(window));
    }

    #[test]
    fn input_injection_is_gated() {
        let mut server = server(&Config::default());
        let conn = server.connect(Box::new(io::sink()));
        let call = IpcCall::InjectInput {
            event: InputEvent::PointerMove { dx: 5.0, dy: 0.0 },
        };
        assert!(matches!(
            server.handle_request(conn, call.clone(), Instant::now()),
            Err(ProtocolError::InputInjectionDisabled)
        ));

        let mut config = Config::default();
        config.allow_input_injection = true;
        let mut server = self::server(&config);
        let conn = server.connect(Box::new(io::sink()));
        server.handle_request(conn, call, Instant::now()).unwrap();
        assert_eq!(server.compositor().cursor_position().x, 165);
    }

    /// Takes up to `room` bytes, then reports WouldBlock
    #[derive(Clone, Default)]
    struct Throttled {
        written: Rc<RefCell<Vec<u8>>>,
        room: Rc<RefCell<usize>>,
    }

    impl Write for Throttled {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut room = self.room.borrow_mut();
            if *room == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(*room);
            *room -= n;
            self.written.borrow_mut().extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn blocked_writer_queues_replies() {
        let mut server = server(&Config::default());
        let out = Throttled::default();
        *out.room.borrow_mut() = 100;
        let conn = server.connect(Box::new(out.clone()));
        let now = Instant::now();

        let mut script = String::from("{\"id\":0,\"call\":{\"method\":\"create_client\"}}\n");
        for id in 1..=2000 {
            script.push_str(&format!(
                "{{\"id\":{id},\"call\":{{\"method\":\"create_surface\",\"client\":1}}}}\n"
            ));
        }
        assert!(server.receive(conn, script.as_bytes(), now));
        assert!(server.pending_output(conn) > 0);
        assert_eq!(server.backlogged_connections(), vec![conn]);
        assert!(server.broken_connections().is_empty());

        *out.room.borrow_mut() = usize::MAX;
        assert!(server.flush(conn));
        assert_eq!(server.pending_output(conn), 0);
        assert!(server.backlogged_connections().is_empty());

        let written = String::from_utf8(out.written.borrow().clone()).unwrap();
        let ids: Vec<u64> = written
            .lines()
            .filter_map(|l| match serde_json::from_str(l).unwrap() {
                ServerMessage::Reply { id, .. } => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(ids, (0..=2000).collect::<Vec<_>>());
    }

    #[test]
    fn far_off_rects_are_rejected_without_panicking() {
        let mut server = server(&Config::default());
        let out = Capture::default();
        let conn = server.connect(Box::new(out.clone()));
        let now = Instant::now();
        server.handle_request(conn, IpcCall::CreateClient, now).unwrap();
        let surface = SurfaceId(1);
        server
            .handle_request(conn, IpcCall::CreateSurface { client: ClientId(1) }, now)
            .unwrap();
        server
            .handle_request(
                conn,
                IpcCall::SetGeometry {
                    surface,
                    rect: Rect::new(10, 30, 100, 100),
                },
                now,
            )
            .unwrap();
        server
            .handle_request(conn, IpcCall::SetVisible { surface, visible: true }, now)
            .unwrap();
        server.handle_request(conn, IpcCall::Begin { surface }, now).unwrap();
        out.messages();

        let far = i32::MAX - 5;
        let script = format!(
            "{{\"id\":1,\"call\":{{\"method\":\"set_geometry\",\"surface\":1,\"rect\":{{\"x\":{far},\"y\":10,\"width\":100,\"height\":100}}}}}}\n\
             {{\"id\":2,\"call\":{{\"method\":\"fill_rect\",\"surface\":1,\"rect\":{{\"x\":{far},\"y\":0,\"width\":10,\"height\":10}},\"color\":{{\"r\":0,\"g\":0,\"b\":0}}}}}}\n"
        );
        assert!(server.receive(conn, script.as_bytes(), now));
        let errors = out
            .messages()
            .into_iter()
            .filter(|m| matches!(m, ServerMessage::Error { .. }))
            .count();
        assert_eq!(errors, 2);

        // Calls that skip wire validation still leave the server running
        server
            .handle_request(
                conn,
                IpcCall::SetGeometry {
                    surface,
                    rect: Rect::new(far, 10, 100, 100),
                },
                now,
            )
            .unwrap();
        server.handle_request(conn, IpcCall::Begin { surface }, now).unwrap();
        server
            .handle_request(
                conn,
                IpcCall::FillRect {
                    surface,
                    rect: Rect::new(far, 0, 10, 10),
                    color: Color::WHITE,
                },
                now,
            )
            .unwrap();
        server.handle_request(conn, IpcCall::End { surface }, now).unwrap();
        let geometry = server.handle_request(conn, IpcCall::Geometry { surface }, now).unwrap();
        assert_eq!(geometry, json!(Rect::new(far, 10, 100, 100)));
    }

    #[test]
    fn failed_writer_marks_connection_broken() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::from(io::ErrorKind::BrokenPipe))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let mut server = server(&Config::default());
        let conn = server.connect(Box::new(Broken));
        let alive = server.receive(conn, b"{\"id\":1,\"call\":{\"method\":\"create_client\"}}\n", Instant::now());
        assert!(!alive);
    }
}
