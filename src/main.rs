//! Overlay Painter
//!
//! Puts the X server into automatic compositing mode, makes the Composite
//! Overlay Window click-through and keeps a red rectangle painted in the
//! middle of the screen until SIGINT/SIGTERM.

mod canvas;
mod config;
mod geometry;
mod overlay;
mod painter;
mod stats;
mod x11_async;

use anyhow::{Context, Result, bail};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::{Config, RepaintMode};
use overlay::OverlayContext;
use painter::FrameLoop;
use x11_async::X11EventStream;

/// Command line options
#[derive(Debug, Default, PartialEq)]
struct Options {
    /// Config file overriding the default location
    config: Option<PathBuf>,
    /// Force event-driven repaint regardless of config
    events: bool,
}

impl Options {
    fn parse(args: &[String]) -> Result<Self> {
        let mut options = Self::default();
        let mut iter = args.iter().skip(1);

        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--events" | "-e" => options.events = true,
                "--config" | "-c" => {
                    let path = iter.next().context("--config needs a path")?;
                    options.config = Some(PathBuf::from(path));
                }
                other => bail!("Unknown argument: {}", other),
            }
        }

        Ok(options)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "overlay_painter=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Overlay Painter");

    let args: Vec<String> = std::env::args().collect();
    let options = Options::parse(&args)?;

    let mut config = match &options.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load().context("Failed to load configuration")?,
    };
    if options.events {
        info!("--events flag detected: repainting on X events only");
        config.repaint = RepaintMode::Events;
    }

    // Setup signal handlers for graceful shutdown
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let tx = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully");
                }
            }
            let _ = tx.send(()).await;
        });
    }

    let context = OverlayContext::connect(config.display.as_deref())?;
    let canvas = context.bind_canvas()?;
    info!(
        "Painting on overlay {} (root {})",
        context.overlay(),
        context.root()
    );

    // Both modes read events so protocol errors from our requests surface
    let events = X11EventStream::new(context.conn())
        .context("Failed to initialize X11 event stream")?;

    let mut frames = FrameLoop::new(&context, &canvas, context.size(), config.stats_interval());
    match config.repaint {
        RepaintMode::Poll => {
            frames
                .run_polling(&events, config.frame_interval(), &mut shutdown_rx)
                .await?
        }
        RepaintMode::Events => frames.run_event_driven(&events, &mut shutdown_rx).await?,
    }

    info!("Shutdown signal received, cleaning up...");
    drop(events);
    drop(canvas);
    drop(context);

    Ok(())
}
