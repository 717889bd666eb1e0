//! 2D drawing onto X11 drawables
//!
//! `GcCanvas` wraps a core-protocol graphics context bound to the overlay
//! window. Fills go out as PolyFillRectangle requests.

use std::cell::Cell;

use anyhow::{Context, Result};
use tracing::{debug, warn};
use x11rb::connection::Connection;
use x11rb::protocol::xproto::{
    ChangeGCAux, ConnectionExt as _, CreateGCAux, Gcontext, Rectangle, Screen, Window,
};
use x11rb::rust_connection::RustConnection;

use crate::geometry::{ChannelMasks, Rect, Rgb};

/// Something rectangles can be filled on
pub trait Canvas {
    fn fill_rect(&self, target: Window, rect: Rect, color: Rgb) -> Result<()>;
}

/// Graphics context drawing through an X connection
pub struct GcCanvas<'c> {
    conn: &'c RustConnection,
    gc: Gcontext,
    masks: ChannelMasks,
    /// Foreground pixel currently set on the GC
    foreground: Cell<Option<u32>>,
}

impl<'c> GcCanvas<'c> {
    /// Create a graphics context against `drawable`
    ///
    /// The GC can later draw on any window sharing the drawable's root and depth.
    pub fn new(conn: &'c RustConnection, screen: &Screen, drawable: Window) -> Result<Self> {
        let gc = conn.generate_id()?;
        conn.create_gc(gc, drawable, &CreateGCAux::new())?
            .check()
            .context("CreateGC rejected")?;

        let masks = visual_masks(screen);
        debug!("Created GC {} on drawable {} ({:?})", gc, drawable, masks);

        Ok(Self {
            conn,
            gc,
            masks,
            foreground: Cell::new(None),
        })
    }

    fn set_foreground(&self, pixel: u32) -> Result<()> {
        if self.foreground.get() != Some(pixel) {
            self.conn
                .change_gc(self.gc, &ChangeGCAux::new().foreground(pixel))?;
            self.foreground.set(Some(pixel));
        }
        Ok(())
    }
}

impl Canvas for GcCanvas<'_> {
    fn fill_rect(&self, target: Window, rect: Rect, color: Rgb) -> Result<()> {
        if rect.is_empty() {
            return Ok(());
        }

        self.set_foreground(color.to_pixel(&self.masks))?;
        self.conn.poly_fill_rectangle(
            target,
            self.gc,
            &[Rectangle {
                x: rect.x,
                y: rect.y,
                width: rect.width,
                height: rect.height,
            }],
        )?;
        Ok(())
    }
}

impl Drop for GcCanvas<'_> {
    fn drop(&mut self) {
        debug!("Freeing GC {}", self.gc);
        if let Err(e) = self.conn.free_gc(self.gc) {
            warn!("Failed to free GC {}: {}", self.gc, e);
        }
        let _ = self.conn.flush();
    }
}

/// Channel masks of the screen's root visual
fn visual_masks(screen: &Screen) -> ChannelMasks {
    let visual = screen
        .allowed_depths
        .iter()
        .flat_map(|depth| depth.visuals.iter())
        .find(|visual| visual.visual_id == screen.root_visual);

    match visual {
        Some(v) => ChannelMasks {
            red: v.red_mask,
            green: v.green_mask,
            blue: v.blue_mask,
        },
        None => {
            warn!(
                "Root visual {} not found, assuming 24-bit RGB",
                screen.root_visual
            );
            ChannelMasks::RGB888
        }
    }
}
