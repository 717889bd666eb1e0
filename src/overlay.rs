//! Composite overlay setup
//!
//! Owns the X connection, puts the server into automatic compositing mode and
//! turns the Composite Overlay Window into a click-through drawing surface.

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};
use x11rb::connection::{Connection, RequestConnection};
use x11rb::protocol::composite::{self, ConnectionExt as _, Redirect};
use x11rb::protocol::shape::SK;
use x11rb::protocol::xfixes::{self, ConnectionExt as _};
use x11rb::protocol::xproto::{
    ChangeWindowAttributesAux, ConnectionExt as _, EventMask, Screen, Window,
};
use x11rb::rust_connection::RustConnection;

use crate::canvas::GcCanvas;
use crate::painter::OverlaySession;

/// Everything the painter needs from the X server, created once at startup
pub struct OverlayContext {
    conn: RustConnection,
    screen_num: usize,
    root: Window,
    /// Overlay reference taken during setup, released on drop
    overlay: Window,
    width: u16,
    height: u16,
}

impl OverlayContext {
    /// Connect, enable compositing and prepare the overlay window
    pub fn connect(display: Option<&str>) -> Result<Self> {
        let (conn, screen_num) =
            x11rb::connect(display).context("Failed to connect to X server")?;

        let screen = &conn.setup().roots[screen_num];
        let root = screen.root;
        let width = screen.width_in_pixels;
        let height = screen.height_in_pixels;

        info!("Connected to X server, screen {}, root window {}", screen_num, root);
        info!("Screen size: {}x{}", width, height);

        enable_compositing(&conn, root)?;

        let overlay = conn
            .composite_get_overlay_window(root)?
            .reply()
            .context("Failed to get Composite Overlay Window")?
            .overlay_win;
        info!("Using Composite Overlay Window: {}", overlay);

        let context = Self {
            conn,
            screen_num,
            root,
            overlay,
            width,
            height,
        };
        context.make_input_transparent(overlay)?;
        context.conn.flush()?;

        Ok(context)
    }

    /// Let all pointer and keyboard input fall through `window`
    ///
    /// Resets the bounding shape and sets the input shape to an empty region.
    pub fn make_input_transparent(&self, window: Window) -> Result<()> {
        self.conn
            .xfixes_set_window_shape_region(window, SK::BOUNDING, 0, 0, x11rb::NONE)?
            .check()
            .context("Failed to reset bounding shape")?;

        let region = self.conn.generate_id()?;
        self.conn
            .xfixes_create_region(region, &[])?
            .check()
            .context("Failed to create empty region")?;
        let applied = self
            .conn
            .xfixes_set_window_shape_region(window, SK::INPUT, 0, 0, region)?
            .check();
        self.conn.xfixes_destroy_region(region)?;
        applied.context("Failed to clear input shape; the overlay would swallow input")?;

        debug!("Window {} is now input-transparent", window);
        Ok(())
    }

    /// Bind a drawing context to the overlay and watch it for exposure
    pub fn bind_canvas(&self) -> Result<GcCanvas<'_>> {
        let canvas = GcCanvas::new(&self.conn, self.screen(), self.overlay)
            .context("Failed to create graphics context on overlay")?;

        self.conn
            .change_window_attributes(
                self.overlay,
                &ChangeWindowAttributesAux::new().event_mask(EventMask::EXPOSURE),
            )?
            .check()
            .context("Failed to select Exposure on overlay")?;

        Ok(canvas)
    }

    pub fn conn(&self) -> &RustConnection {
        &self.conn
    }

    pub fn screen(&self) -> &Screen {
        &self.conn.setup().roots[self.screen_num]
    }

    pub fn root(&self) -> Window {
        self.root
    }

    pub fn overlay(&self) -> Window {
        self.overlay
    }

    /// Screen size captured at connect time
    pub fn size(&self) -> (u16, u16) {
        (self.width, self.height)
    }
}

impl OverlaySession for OverlayContext {
    fn acquire_overlay(&self) -> Result<Window> {
        let overlay = self
            .conn
            .composite_get_overlay_window(self.root)?
            .reply()?
            .overlay_win;
        Ok(overlay)
    }

    fn release_overlay(&self) -> Result<()> {
        self.conn.composite_release_overlay_window(self.root)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.conn.flush()?;
        Ok(())
    }
}

impl Drop for OverlayContext {
    fn drop(&mut self) {
        info!("Releasing Composite Overlay Window {}", self.overlay);
        if let Err(e) = self.conn.composite_release_overlay_window(self.root) {
            warn!("Failed to release overlay window: {}", e);
        }
        let _ = self.conn.flush();
    }
}

/// Negotiate Composite/XFixes and redirect every child of `root` automatically
fn enable_compositing(conn: &RustConnection, root: Window) -> Result<()> {
    conn.extension_information(composite::X11_EXTENSION_NAME)?
        .context("Composite extension not available")?;
    let composite_version = conn
        .composite_query_version(0, 4)?
        .reply()
        .context("Failed to query composite version")?;
    info!(
        "Composite extension {}.{}",
        composite_version.major_version, composite_version.minor_version
    );

    conn.extension_information(xfixes::X11_EXTENSION_NAME)?
        .context("XFixes extension not available")?;
    let xfixes_version = conn
        .xfixes_query_version(5, 0)?
        .reply()
        .context("Failed to query XFixes version")?;
    info!(
        "XFixes extension {}.{}",
        xfixes_version.major_version, xfixes_version.minor_version
    );
    ensure_shape_regions(xfixes_version.major_version)?;

    // Automatic: the server keeps painting redirected windows itself
    conn.composite_redirect_subwindows(root, Redirect::AUTOMATIC)?
        .check()
        .context("Failed to redirect subwindows of root")?;
    conn.change_window_attributes(
        root,
        &ChangeWindowAttributesAux::new().event_mask(EventMask::SUBSTRUCTURE_NOTIFY),
    )?
    .check()
    .context("Failed to select SubstructureNotify on root")?;
    info!("Redirected subwindows of root (Automatic)");

    Ok(())
}

/// Window shape regions arrived in XFixes 2.0
fn ensure_shape_regions(xfixes_major: u32) -> Result<()> {
    if xfixes_major < 2 {
        bail!(
            "XFixes {}.x cannot set window shape regions (2.0 required)",
            xfixes_major
        );
    }
    Ok(())
}
