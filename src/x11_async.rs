//! X events feeding the repaint loop
//!
//! The loop sees `OverlayEvent`s rather than raw protocol events: damage
//! (repaint wanted), ignorable traffic, and protocol errors, which end the loop.
//! `X11EventStream` is the live source; a mio thread watches the X socket and
//! wakes the loop through a `Notify`.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::sync::{Notify, oneshot};
use tracing::{debug, trace, warn};
use x11rb::connection::Connection;
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;

/// What an X event means for the overlay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayEvent {
    /// Overlay exposed or the window stack changed
    Damage,
    Ignored,
    /// An earlier request failed on the server
    ProtocolError(String),
}

impl OverlayEvent {
    pub fn classify(event: &Event) -> Self {
        match event {
            Event::Error(e) => Self::ProtocolError(format!("{:?}", e)),
            // Only the last Expose of a batch
            Event::Expose(e) if e.count == 0 => Self::Damage,
            Event::MapNotify(_)
            | Event::UnmapNotify(_)
            | Event::ConfigureNotify(_)
            | Event::DestroyNotify(_)
            | Event::ReparentNotify(_)
            | Event::CirculateNotify(_)
            | Event::GravityNotify(_) => Self::Damage,
            _ => Self::Ignored,
        }
    }
}

/// Result of emptying the event queue
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Drained {
    pub events: usize,
    pub damaged: bool,
}

/// Where the frame loop gets its events from
pub trait EventSource {
    /// Next queued event, `None` once the queue is empty
    fn next_event(&self) -> Result<Option<OverlayEvent>>;

    /// Resolve once new events may be available
    async fn wait_readable(&self);

    /// Consume every queued event; a protocol error fails the drain
    fn drain(&self) -> Result<Drained> {
        let mut drained = Drained::default();
        while let Some(event) = self.next_event()? {
            drained.events += 1;
            match event {
                OverlayEvent::Damage => drained.damaged = true,
                OverlayEvent::Ignored => {}
                OverlayEvent::ProtocolError(error) => bail!("X protocol error: {}", error),
            }
        }
        Ok(drained)
    }
}

/// Live events from an X connection
pub struct X11EventStream<'c> {
    conn: &'c RustConnection,
    readable: Arc<Notify>,
    /// Dropping this stops the socket watcher
    _watcher: oneshot::Receiver<()>,
}

impl<'c> X11EventStream<'c> {
    pub fn new(conn: &'c RustConnection) -> Result<Self> {
        let readable = Arc::new(Notify::new());
        let (alive, watcher) = oneshot::channel::<()>();

        watch_socket(conn.stream().as_raw_fd(), readable.clone(), alive)?;

        Ok(Self {
            conn,
            readable,
            _watcher: watcher,
        })
    }
}

impl EventSource for X11EventStream<'_> {
    fn next_event(&self) -> Result<Option<OverlayEvent>> {
        let Some(event) = self.conn.poll_for_event()? else {
            return Ok(None);
        };
        trace!("X event: {:?}", event);
        Ok(Some(OverlayEvent::classify(&event)))
    }

    async fn wait_readable(&self) {
        self.readable.notified().await;
    }
}

/// Poll `fd` on a blocking thread, notifying `readable` until `alive` closes
fn watch_socket(fd: RawFd, readable: Arc<Notify>, alive: oneshot::Sender<()>) -> Result<()> {
    let mut poll = mio::Poll::new().context("Failed to create mio Poll")?;
    poll.registry()
        .register(
            &mut mio::unix::SourceFd(&fd),
            mio::Token(0),
            mio::Interest::READABLE,
        )
        .context("Failed to register X11 FD with mio")?;

    // Bounds how long the thread outlives the stream
    let timeout = Duration::from_millis(100);
    tokio::task::spawn_blocking(move || {
        let mut events = mio::Events::with_capacity(1);
        while !alive.is_closed() {
            if let Err(err) = poll.poll(&mut events, Some(timeout)) {
                warn!("X11 socket poll failed: {:?}", err);
                continue;
            }
            if !events.is_empty() {
                readable.notify_one();
            }
        }
        debug!("X11 socket watcher stopped");
    });

    Ok(())
}
