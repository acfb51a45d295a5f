//! Client and surface bookkeeping
//!
//! The [`Manager`] hands out opaque client and surface ids. Each surface
//! wraps one compositor window. Clients are kept alive by a ping/pong
//! exchange: a client that misses its pong deadline is torn down together
//! with all of its surfaces.
//!
//! Deadlines are plain [`Instant`]s checked on every [`Manager::tick`], so
//! tests can drive time explicitly.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::compositor::{Compositor, CompositorError};
use crate::config::LivenessConfig;
use crate::geometry::Rect;
use crate::scene::{NodeId, SceneEvent};
use crate::window::{WindowEvent, WindowState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SurfaceId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client {}", self.0)
    }
}

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "surface {}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown {0}")]
    UnknownClient(ClientId),

    #[error("unknown {0}")]
    UnknownSurface(SurfaceId),

    #[error("input injection is disabled")]
    InputInjectionDisabled,

    #[error(transparent)]
    Compositor(#[from] CompositorError),
}

/// Where a client is in the ping/pong cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Next ping goes out at `next_ping`
    Connected { next_ping: Instant },
    /// Ping sent, pong due by `deadline`
    Pinged { deadline: Instant },
}

#[derive(Debug)]
struct Client {
    liveness: Liveness,
    surfaces: BTreeSet<SurfaceId>,
}

#[derive(Debug, Clone, Copy)]
struct Surface {
    window: NodeId,
    client: ClientId,
}

/// Events sent to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Answer with `pong` before the deadline
    Ping,
    /// The client missed its deadline and no longer exists
    ClientDestroyed,
    GeometryChanged { surface: SurfaceId, geometry: Rect },
    VisibleChanged { surface: SurfaceId, visible: bool },
    StateChanged { surface: SurfaceId, state: WindowState },
    PointerButton {
        surface: SurfaceId,
        x: i32,
        y: i32,
        code: u32,
        pressed: bool,
    },
    Scroll { surface: SurfaceId, dx: i32, dy: i32 },
    Key { surface: SurfaceId, code: u32, pressed: bool },
    CloseRequested { surface: SurfaceId },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolEvent {
    pub client: ClientId,
    pub event: ClientEvent,
}

#[derive(Debug)]
pub struct Manager {
    clients: BTreeMap<ClientId, Client>,
    surfaces: BTreeMap<SurfaceId, Surface>,
    windows: HashMap<NodeId, SurfaceId>,
    next_client: u64,
    next_surface: u64,
    liveness: LivenessConfig,
    events: Vec<ProtocolEvent>,
}

impl Manager {
    pub fn new(liveness: LivenessConfig) -> Self {
        Self {
            clients: BTreeMap::new(),
            surfaces: BTreeMap::new(),
            windows: HashMap::new(),
            next_client: 1,
            next_surface: 1,
            liveness,
            events: Vec::new(),
        }
    }

    pub fn create_client(&mut self, now: Instant) -> ClientId {
        let id = ClientId(self.next_client);
        self.next_client += 1;
        self.clients.insert(
            id,
            Client {
                liveness: Liveness::Connected {
                    next_ping: now + self.liveness.ping_interval(),
                },
                surfaces: BTreeSet::new(),
            },
        );
        tracing::info!(client = id.0, "client created");
        id
    }

    /// Tear down a client and every surface it owns
    pub fn destroy_client(&mut self, compositor: &mut Compositor, id: ClientId) -> Result<(), ProtocolError> {
        let client = self.clients.remove(&id).ok_or(ProtocolError::UnknownClient(id))?;
        for surface in client.surfaces {
            if let Some(s) = self.surfaces.remove(&surface) {
                self.windows.remove(&s.window);
                if let Err(e) = compositor.destroy_window(s.window) {
                    tracing::warn!(surface = surface.0, error = %e, "window already gone");
                }
            }
        }
        tracing::info!(client = id.0, "client destroyed");
        Ok(())
    }

    pub fn contains_client(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn liveness(&self, id: ClientId) -> Option<Liveness> {
        self.clients.get(&id).map(|c| c.liveness)
    }

    pub fn surfaces_of(&self, id: ClientId) -> Vec<SurfaceId> {
        self.clients
            .get(&id)
            .map(|c| c.surfaces.iter().copied().collect())
            .unwrap_or_default()
    }

    /// A new hidden surface, attached to the compositor's root
    pub fn create_surface(&mut self, compositor: &mut Compositor, client: ClientId) -> Result<SurfaceId, ProtocolError> {
        let Some(owner) = self.clients.get_mut(&client) else {
            return Err(ProtocolError::UnknownClient(client));
        };
        let window = compositor.create_window();
        compositor.add_window(window)?;

        let id = SurfaceId(self.next_surface);
        self.next_surface += 1;
        owner.surfaces.insert(id);
        self.surfaces.insert(id, Surface { window, client });
        self.windows.insert(window, id);
        tracing::debug!(client = client.0, surface = id.0, ?window, "surface created");
        Ok(id)
    }

    /// Destroy a surface. A second call reports the surface as unknown.
    pub fn destroy_surface(&mut self, compositor: &mut Compositor, id: SurfaceId) -> Result<(), ProtocolError> {
        let surface = self.surfaces.remove(&id).ok_or(ProtocolError::UnknownSurface(id))?;
        self.windows.remove(&surface.window);
        if let Some(owner) = self.clients.get_mut(&surface.client) {
            owner.surfaces.remove(&id);
        }
        compositor.destroy_window(surface.window)?;
        tracing::debug!(surface = id.0, "surface destroyed");
        Ok(())
    }

    /// Window behind a surface
    pub fn window(&self, id: SurfaceId) -> Result<NodeId, ProtocolError> {
        self.surfaces
            .get(&id)
            .map(|s| s.window)
            .ok_or(ProtocolError::UnknownSurface(id))
    }

    pub fn owner(&self, id: SurfaceId) -> Result<ClientId, ProtocolError> {
        self.surfaces
            .get(&id)
            .map(|s| s.client)
            .ok_or(ProtocolError::UnknownSurface(id))
    }

    pub fn surface_for_window(&self, window: NodeId) -> Option<SurfaceId> {
        self.windows.get(&window).copied()
    }

    /// Record a pong. The next ping is scheduled one interval from `now`.
    pub fn pong(&mut self, id: ClientId, now: Instant) -> Result<(), ProtocolError> {
        let client = self.clients.get_mut(&id).ok_or(ProtocolError::UnknownClient(id))?;
        if let Liveness::Pinged { .. } = client.liveness {
            client.liveness = Liveness::Connected {
                next_ping: now + self.liveness.ping_interval(),
            };
            tracing::trace!(client = id.0, "pong received");
        }
        Ok(())
    }

    /// Send due pings and destroy clients past their deadline.
    ///
    /// Returns the clients destroyed on this tick.
    pub fn tick(&mut self, compositor: &mut Compositor, now: Instant) -> Vec<ClientId> {
        let mut expired = Vec::new();
        for (&id, client) in &mut self.clients {
            match client.liveness {
                Liveness::Connected { next_ping } if now >= next_ping => {
                    client.liveness = Liveness::Pinged {
                        deadline: now + self.liveness.ping_timeout(),
                    };
                    self.events.push(ProtocolEvent {
                        client: id,
                        event: ClientEvent::Ping,
                    });
                }
                Liveness::Pinged { deadline } if now >= deadline => expired.push(id),
                _ => {}
            }
        }
        for &id in &expired {
            tracing::warn!(client = id.0, "client missed its pong deadline");
            if self.destroy_client(compositor, id).is_ok() {
                self.events.push(ProtocolEvent {
                    client: id,
                    event: ClientEvent::ClientDestroyed,
                });
            }
        }
        expired
    }

    /// Turn compositor scene and window events into client events.
    ///
    /// Nodes without a surface (cursor, title bars, destroyed windows) are
    /// skipped.
    pub fn collect_events(&mut self, compositor: &mut Compositor) {
        for event in compositor.take_scene_events() {
            let node = match event {
                SceneEvent::GeometryChanged { node, .. }
                | SceneEvent::VisibleChanged { node, .. }
                | SceneEvent::StateChanged { node, .. } => node,
            };
            if let Some((client, surface)) = self.owner_of_window(node) {
                self.events.push(ProtocolEvent {
                    client,
                    event: scene_event(surface, event),
                });
            }
        }
        for (window, event) in compositor.take_window_events() {
            if let Some((client, surface)) = self.owner_of_window(window) {
                self.events.push(ProtocolEvent {
                    client,
                    event: window_event(surface, event),
                });
            }
        }
    }

    fn owner_of_window(&self, window: NodeId) -> Option<(ClientId, SurfaceId)> {
        let surface = *self.windows.get(&window)?;
        let client = self.surfaces.get(&surface)?.client;
        Some((client, surface))
    }

    pub fn take_events(&mut self) -> Vec<ProtocolEvent> {
        std::mem::take(&mut self.events)
    }
}

fn scene_event(surface: SurfaceId, event: SceneEvent) -> ClientEvent {
    match event {
        SceneEvent::GeometryChanged { geometry, .. } => ClientEvent::GeometryChanged { surface, geometry },
        SceneEvent::VisibleChanged { visible, .. } => ClientEvent::VisibleChanged { surface, visible },
        SceneEvent::StateChanged { state, .. } => ClientEvent::StateChanged { surface, state },
    }
}

fn window_event(surface: SurfaceId, event: WindowEvent) -> ClientEvent {
    match event {
        WindowEvent::PointerButton { x, y, code, pressed } => ClientEvent::PointerButton {
            surface,
            x,
            y,
            code,
            pressed,
        },
        WindowEvent::Scroll { dx, dy } => ClientEvent::Scroll { surface, dx, dy },
        WindowEvent::Key { code, pressed } => ClientEvent::Key { surface, code, pressed },
        WindowEvent::CloseRequested => ClientEvent::CloseRequested { surface },
    }
}
