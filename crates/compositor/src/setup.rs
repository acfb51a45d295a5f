//! Event loop wiring
//!
//! Creates the outputs from config, binds the IPC socket and inserts the
//! listener, every accepted connection and the liveness timer into the
//! calloop event loop.
//!
//! Each connection has a read source and a write source. The write source
//! stays disabled until the server queues output the socket would not
//! take, and disables itself again once that output is flushed.

use std::collections::HashMap;
use std::io::{ErrorKind, Read};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use calloop::generic::Generic;
use calloop::timer::{TimeoutAction, Timer};
use calloop::{Interest, LoopHandle, Mode, PostAction, RegistrationToken};

use crate::config::Config;
use crate::output::{OutputSink, VirtualOutput};
use crate::server::{ConnectionId, Server};

/// Everything the event loop callbacks can reach
pub struct LoopState {
    pub server: Server,
    pub handle: LoopHandle<'static, LoopState>,
    connections: HashMap<ConnectionId, ConnectionSources>,
}

impl LoopState {
    pub fn new(server: Server, handle: LoopHandle<'static, LoopState>) -> Self {
        Self {
            server,
            handle,
            connections: HashMap::new(),
        }
    }
}

struct ConnectionSources {
    read: RegistrationToken,
    write: RegistrationToken,
    /// The write source is enabled
    writing: bool,
}

/// Which of a connection's sources is running the current callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Running {
    Read,
    Write,
    Other,
}

/// Virtual outputs listed in the config, primary first
pub fn create_outputs(config: &Config) -> Vec<Box<dyn OutputSink>> {
    config
        .outputs
        .iter()
        .map(|o| {
            tracing::info!(name = %o.name, width = o.width, height = o.height, "creating virtual output");
            Box::new(VirtualOutput::new(&o.name, o.size())) as Box<dyn OutputSink>
        })
        .collect()
}

/// Bind the IPC socket and insert the accept handler into the event loop.
///
/// Sets `STONE_SOCKET` for child processes. Returns the socket path.
pub fn setup_ipc_socket(handle: &LoopHandle<'static, LoopState>, config: &Config) -> anyhow::Result<PathBuf> {
    let socket_path = crate::ipc::socket_path(config.socket_path.as_deref());
    listen_on(handle, &socket_path)?;

    std::env::set_var("STONE_SOCKET", &socket_path);
    tracing::info!(path = ?socket_path, "IPC socket created, STONE_SOCKET set");
    Ok(socket_path)
}

/// Bind `socket_path`, replacing a stale socket, and accept connections on it
pub fn listen_on(handle: &LoopHandle<'static, LoopState>, socket_path: &Path) -> anyhow::Result<()> {
    let _ = std::fs::remove_file(socket_path); // Clean up old socket

    let listener = UnixListener::bind(socket_path).map_err(|e| {
        if e.kind() == ErrorKind::AddrInUse {
            anyhow::anyhow!(
                "IPC socket already in use: {:?}\n\
                 Another stone compositor may be running, or a stale socket exists.\n\
                 Try: rm {:?}",
                socket_path,
                socket_path
            )
        } else {
            anyhow::anyhow!("Failed to create IPC socket at {:?}: {}", socket_path, e)
        }
    })?;
    listener
        .set_nonblocking(true)
        .map_err(|e| anyhow::anyhow!("Failed to set IPC socket nonblocking: {}", e))?;

    handle
        .insert_source(
            Generic::new(listener, Interest::READ, Mode::Level),
            |_, listener, state| {
                loop {
                    match listener.accept() {
                        Ok((stream, _)) => {
                            if let Err(e) = insert_connection(state, stream) {
                                tracing::warn!(error = ?e, "failed to register IPC connection");
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                        Err(e) => {
                            tracing::warn!(error = ?e, "IPC accept error");
                            break;
                        }
                    }
                }
                Ok(PostAction::Continue)
            },
        )
        .map_err(|e| anyhow::anyhow!("Failed to insert IPC socket source: {e:?}"))?;
    Ok(())
}

fn insert_connection(state: &mut LoopState, stream: UnixStream) -> anyhow::Result<()> {
    stream.set_nonblocking(true)?;
    let writer = stream.try_clone()?;
    let writable = stream.try_clone()?;
    let conn = state.server.connect(Box::new(writer));
    tracing::info!(connection = conn.0, "IPC client connected");

    let read = match state.handle.insert_source(
        Generic::new(stream, Interest::READ, Mode::Level),
        move |_, stream, state| Ok(read_connection(state, conn, stream)),
    ) {
        Ok(token) => token,
        Err(e) => {
            state.server.disconnect(conn);
            return Err(anyhow::anyhow!("Failed to insert connection source: {e:?}"));
        }
    };
    let write = match state.handle.insert_source(
        Generic::new(writable, Interest::WRITE, Mode::Level),
        move |_, _, state| Ok(write_connection(state, conn)),
    ) {
        Ok(token) => token,
        Err(e) => {
            state.server.disconnect(conn);
            state.handle.remove(read);
            return Err(anyhow::anyhow!("Failed to insert connection write source: {e:?}"));
        }
    };
    // Enabled only while output is queued
    if let Err(e) = state.handle.disable(&write) {
        state.server.disconnect(conn);
        state.handle.remove(read);
        state.handle.remove(write);
        return Err(anyhow::anyhow!("Failed to park connection write source: {e:?}"));
    }
    state.connections.insert(
        conn,
        ConnectionSources {
            read,
            write,
            writing: false,
        },
    );
    Ok(())
}

/// Drop a connection and whichever of its sources is not `running`
fn close_connection(state: &mut LoopState, conn: ConnectionId, running: Running) {
    state.server.disconnect(conn);
    let Some(sources) = state.connections.remove(&conn) else { return };
    if running != Running::Read {
        state.handle.remove(sources.read);
    }
    if running != Running::Write {
        state.handle.remove(sources.write);
    }
}

/// Drop broken connections and wake the write source of backlogged ones.
///
/// Runs after every callback that can make the server send.
pub fn sync_connections(state: &mut LoopState) {
    for conn in state.server.broken_connections() {
        tracing::info!(connection = conn.0, "dropping broken IPC connection");
        close_connection(state, conn, Running::Other);
    }
    for conn in state.server.backlogged_connections() {
        let Some(sources) = state.connections.get_mut(&conn) else { continue };
        if sources.writing {
            continue;
        }
        match state.handle.enable(&sources.write) {
            Ok(()) => sources.writing = true,
            Err(e) => tracing::warn!(connection = conn.0, error = ?e, "failed to watch connection for writing"),
        }
    }
}

/// Flush queued output once the socket takes more
fn write_connection(state: &mut LoopState, conn: ConnectionId) -> PostAction {
    if !state.server.flush(conn) {
        tracing::info!(connection = conn.0, "dropping broken IPC connection");
        close_connection(state, conn, Running::Write);
        return PostAction::Remove;
    }
    if state.server.pending_output(conn) > 0 {
        return PostAction::Continue;
    }
    if let Some(sources) = state.connections.get_mut(&conn) {
        sources.writing = false;
    }
    PostAction::Disable
}

/// Drain a readable connection into the server
fn read_connection(state: &mut LoopState, conn: ConnectionId, stream: &UnixStream) -> PostAction {
    let mut buf = [0u8; 16 * 1024];
    loop {
        let mut reader = stream;
        match reader.read(&mut buf) {
            Ok(0) => {
                tracing::info!(connection = conn.0, "IPC client disconnected");
                close_connection(state, conn, Running::Read);
                sync_connections(state);
                return PostAction::Remove;
            }
            Ok(n) => {
                if !state.server.receive(conn, &buf[..n], Instant::now()) {
                    tracing::info!(connection = conn.0, "dropping broken IPC connection");
                    close_connection(state, conn, Running::Read);
                    sync_connections(state);
                    return PostAction::Remove;
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                sync_connections(state);
                return PostAction::Continue;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(connection = conn.0, error = ?e, "IPC read error");
                close_connection(state, conn, Running::Read);
                sync_connections(state);
                return PostAction::Remove;
            }
        }
    }
}

/// Re-evaluate liveness deadlines every `interval`
pub fn setup_tick_timer(handle: &LoopHandle<'static, LoopState>, interval: Duration) -> anyhow::Result<()> {
    handle
        .insert_source(Timer::from_duration(interval), move |_, _, state| {
            state.server.tick(Instant::now());
            sync_connections(state);
            TimeoutAction::ToDuration(interval)
        })
        .map_err(|e| anyhow::anyhow!("Failed to insert tick timer: {e:?}"))?;
    Ok(())
}
