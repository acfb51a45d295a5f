#![no_main]
//! Fuzz target for request dispatch
//!
//! Feeds random bytes to a server on a small virtual output. Any request
//! sequence must be answered without panicking.

use std::io::sink;
use std::time::Instant;

use libfuzzer_sys::fuzz_target;

use compositor::compositor::{Compositor, CompositorOptions};
use compositor::config::Config;
use compositor::geometry::Size;
use compositor::output::VirtualOutput;
use compositor::server::Server;

fuzz_target!(|data: &[u8]| {
    let options = CompositorOptions {
        load_font: false,
        fallback_output: None,
        ..CompositorOptions::default()
    };
    let output = VirtualOutput::new("fuzz", Size::new(64, 48));
    let Ok(compositor) = Compositor::start(vec![output.boxed()], options) else { return };
    let config = Config {
        allow_input_injection: true,
        ..Config::default()
    };
    let mut server = Server::new(compositor, &config);
    let conn = server.connect(Box::new(sink()));
    server.receive(conn, data, Instant::now());
    server.disconnect(conn);
});
