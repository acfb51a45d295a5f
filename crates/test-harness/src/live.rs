//! Live compositor testing infrastructure
//!
//! Runs the real event loop (socket listener, per-connection sources and
//! the liveness timer) on a background thread, so tests can talk to it
//! through [`stone_client::Connection`] exactly like a separate process.
//!
//! The compositor and its virtual outputs are not `Send`, so everything is
//! built inside the thread. Pixels are read back through a channel.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use calloop::{EventLoop, LoopSignal};
use compositor::compositor::Compositor;
use compositor::config::{Config, OutputConfig};
use compositor::output::{OutputSink, VirtualOutput};
use compositor::server::Server;
use compositor::setup::{self, LoopState};
use stone_client::Connection;

use crate::headless::test_options;

static NEXT_SOCKET: AtomicU64 = AtomicU64::new(0);

/// A socket path unique to this process and call
pub fn unique_socket_path() -> PathBuf {
    let n = NEXT_SOCKET.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("stone-test-{}-{}.sock", std::process::id(), n))
}

enum Query {
    Pixel(i32, i32, mpsc::Sender<Option<u32>>),
}

/// A compositor serving a socket from a background thread
pub struct LiveCompositor {
    socket: PathBuf,
    signal: LoopSignal,
    queries: mpsc::Sender<Query>,
    thread: Option<JoinHandle<()>>,
}

impl LiveCompositor {
    /// Start on one virtual output of `width` x `height`
    pub fn start(width: u32, height: u32) -> anyhow::Result<Self> {
        let config = Config {
            outputs: vec![OutputConfig {
                name: "live-0".to_string(),
                width,
                height,
            }],
            socket_path: Some(unique_socket_path()),
            allow_input_injection: true,
            tick_interval_ms: 10,
            ..Config::default()
        };
        Self::with_config(config)
    }

    pub fn with_config(config: Config) -> anyhow::Result<Self> {
        let socket = config
            .socket_path
            .clone()
            .ok_or_else(|| anyhow::anyhow!("live compositor needs a socket path"))?;
        let socket_for_loop = socket.clone();
        let (ready_tx, ready_rx) = mpsc::channel();
        let (query_tx, query_rx) = mpsc::channel();

        let thread = thread::spawn(move || {
            if let Err(e) = run(config, socket_for_loop, query_rx, &ready_tx) {
                let _ = ready_tx.send(Err(e));
            }
        });

        let signal = ready_rx
            .recv_timeout(Duration::from_secs(10))
            .map_err(|_| anyhow::anyhow!("live compositor did not start"))??;
        Ok(Self {
            socket,
            signal,
            queries: query_tx,
            thread: Some(thread),
        })
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn connect(&self) -> anyhow::Result<Connection> {
        Ok(Connection::connect(&self.socket)?)
    }

    /// Pixel shown on the output, read on the loop thread
    pub fn pixel(&self, x: i32, y: i32) -> Option<u32> {
        let (tx, rx) = mpsc::channel();
        self.queries.send(Query::Pixel(x, y, tx)).ok()?;
        self.signal.wakeup();
        rx.recv_timeout(Duration::from_secs(5)).ok().flatten()
    }
}

impl Drop for LiveCompositor {
    fn drop(&mut self) {
        self.signal.stop();
        self.signal.wakeup();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        let _ = std::fs::remove_file(&self.socket);
    }
}

fn run(
    config: Config,
    socket: PathBuf,
    queries: mpsc::Receiver<Query>,
    ready: &mpsc::Sender<anyhow::Result<LoopSignal>>,
) -> anyhow::Result<()> {
    let outputs: Vec<VirtualOutput> = config
        .outputs
        .iter()
        .map(|o| VirtualOutput::new(&o.name, o.size()))
        .collect();
    let sinks: Vec<Box<dyn OutputSink>> = outputs.iter().map(VirtualOutput::boxed).collect();
    let compositor = Compositor::start(sinks, test_options())?;

    let mut event_loop: EventLoop<'static, LoopState> = EventLoop::try_new()?;
    let handle = event_loop.handle();
    // Bound directly: STONE_SOCKET may name another live compositor
    setup::listen_on(&handle, &socket)?;
    setup::setup_tick_timer(&handle, config.tick_interval())?;

    let mut state = LoopState::new(Server::new(compositor, &config), handle);
    tracing::debug!(?socket, "live compositor running");
    let _ = ready.send(Ok(event_loop.get_signal()));

    event_loop.run(Duration::from_millis(20), &mut state, |_| {
        while let Ok(query) = queries.try_recv() {
            match query {
                Query::Pixel(x, y, reply) => {
                    let _ = reply.send(outputs.first().and_then(|o| o.pixel(x, y)));
                }
            }
        }
    })?;
    Ok(())
}
