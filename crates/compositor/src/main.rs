//! Stone compositor - a minimal scene-graph display server
//!
//! Loads the config, starts the compositor on the configured outputs and
//! serves clients on the IPC socket until killed.

use calloop::EventLoop;

use compositor::compositor::{Compositor, CompositorOptions};
use compositor::config::Config;
use compositor::server::Server;
use compositor::setup::{self, LoopState};

fn main() -> anyhow::Result<()> {
    // Initialize logging
    setup_logging();

    tracing::info!("starting stone-compositor");

    // Load configuration
    let config = Config::load();
    config.validate()?;

    let outputs = setup::create_outputs(&config);
    let compositor = Compositor::start(outputs, CompositorOptions::from_config(&config))?;
    tracing::info!(
        width = compositor.frame_rect().width,
        height = compositor.frame_rect().height,
        outputs = compositor.output_count(),
        "compositor started"
    );

    // Create event loop
    let mut event_loop: EventLoop<'static, LoopState> = EventLoop::try_new()?;
    let handle = event_loop.handle();

    let socket_path = setup::setup_ipc_socket(&handle, &config)?;
    setup::setup_tick_timer(&handle, config.tick_interval())?;

    let mut state = LoopState::new(Server::new(compositor, &config), handle);

    tracing::info!(socket = ?socket_path, "entering main loop");
    event_loop.run(None, &mut state, |_| {})?;

    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}

fn setup_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,calloop=warn"));

    // Respect NO_COLOR environment variable for testing
    let use_ansi = std::env::var("NO_COLOR").is_err();

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_line_number(true)
                .with_ansi(use_ansi),
        )
        .with(filter)
        .init();
}
