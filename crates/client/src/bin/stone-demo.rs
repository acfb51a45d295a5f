//! stone-demo - a single window with a painted button
//!
//! Usage: stone-demo [--shm] [--socket PATH]
//!
//! With `--shm` the content is rendered locally into a shared-memory
//! segment and copied in with `put_image` instead of drawn remotely.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use stone_client::compositor::geometry::{Color, Point, Rect, Size};
use stone_client::compositor::image::Image;
use stone_client::compositor::protocol::{ClientEvent, SurfaceId};
use stone_client::{write_shm, Connection};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const GRAY: Color = Color::rgb(0xA0, 0xA0, 0xA4);
const RED: Color = Color::rgb(0xFF, 0, 0);

struct Args {
    shm: bool,
    socket: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args { shm: false, socket: None };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--shm" => args.shm = true,
            "--socket" => {
                let path = iter.next().context("--socket needs a path")?;
                args.socket = Some(PathBuf::from(path));
            }
            "-h" | "--help" => {
                println!("Usage: stone-demo [--shm] [--socket PATH]");
                std::process::exit(0);
            }
            other => bail!("unknown argument: {other}"),
        }
    }
    Ok(args)
}

fn paint(conn: &mut Connection, surface: SurfaceId, size: Size) -> anyhow::Result<()> {
    if !conn.begin(surface)? {
        tracing::debug!("draw session already open, skipping paint");
        return Ok(());
    }
    conn.fill_rect(surface, Rect::from_size(size), Color::WHITE)?;
    conn.fill_rect(surface, Rect::new(102, 102, 50, 30), Color::BLACK)?;
    conn.fill_rect(surface, Rect::new(100, 100, 50, 30), GRAY)?;
    conn.draw_text(surface, Point::new(102, 102), "Button", RED)?;
    conn.end(surface)?;
    Ok(())
}

fn paint_shm(conn: &mut Connection, surface: SurfaceId, size: Size) -> anyhow::Result<()> {
    let info = conn.get_shm(surface)?;
    let mut image = Image::new(info.size()).context("surface has no area")?;
    for y in 0..image.height() {
        for x in 0..image.width() {
            let r = (x * 255 / image.width().max(1)) as u8;
            let b = (y * 255 / image.height().max(1)) as u8;
            image.set_pixel(x, y, Color::rgb(r, 0x40, b).to_argb());
        }
    }
    image.fill_rect(Rect::new(102, 102, 50, 30), Color::BLACK);
    image.fill_rect(Rect::new(100, 100, 50, 30), GRAY);
    write_shm(&info, &image)?;

    let copied = conn.put_image(surface, &info.key, Rect::from_size(size))?;
    if !copied {
        tracing::warn!(key = %info.key, "compositor could not copy shm segment");
    }
    conn.release_shm(surface, &info.key)?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = parse_args()?;
    let mut conn = match &args.socket {
        Some(path) => Connection::connect(path),
        None => Connection::connect_default(),
    }
    .context("failed to connect to stone compositor")?;

    let client = conn.create_client()?;
    let surface = conn.create_surface(client)?;
    conn.set_geometry(surface, Rect::new(100, 100, 600, 400))?;
    conn.set_title(surface, "stone demo")?;
    conn.set_visible(surface, true)?;
    tracing::info!(%client, %surface, "surface created");

    let redraw = |conn: &mut Connection, size: Size| {
        if args.shm {
            paint_shm(conn, surface, size)
        } else {
            paint(conn, surface, size)
        }
    };
    let size = conn.geometry(surface)?.size();
    redraw(&mut conn, size)?;

    loop {
        conn.dispatch(Some(Duration::from_millis(500)))?;
        while let Some((_, event)) = conn.poll_event() {
            match event {
                ClientEvent::GeometryChanged { surface: s, geometry } if s == surface => {
                    redraw(&mut conn, geometry.size())?;
                }
                ClientEvent::CloseRequested { surface: s } if s == surface => {
                    tracing::info!("close requested, exiting");
                    conn.destroy_client(client)?;
                    return Ok(());
                }
                ClientEvent::ClientDestroyed => {
                    tracing::warn!("compositor destroyed our client");
                    return Ok(());
                }
                ClientEvent::PointerButton { x, y, pressed: true, .. } => {
                    tracing::info!(x, y, "click");
                }
                _ => {}
            }
        }
    }
}
