//! Geometry and colour primitives for the overlay
//!
//! Everything in here is pure: no X requests, no state.

/// Axis-aligned rectangle in overlay coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i16,
    pub y: i16,
    pub width: u16,
    pub height: u16,
}

impl Rect {
    /// True when the rectangle covers no pixels
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Rectangle spanning the middle half of a `width` x `height` surface
///
/// The corner sits at (width/4, height/4) and the size is twice the quarter,
/// so odd dimensions round down and never overflow the surface.
pub fn centered_half(width: u16, height: u16) -> Rect {
    let quarter_w = width / 4;
    let quarter_h = height / 4;

    // u16::MAX / 4 fits in i16
    Rect {
        x: quarter_w as i16,
        y: quarter_h as i16,
        width: quarter_w * 2,
        height: quarter_h * 2,
    }
}

/// RGB colour with channels in 0.0..=1.0
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rgb {
    pub r: f64,
    pub g: f64,
    pub b: f64,
}

impl Rgb {
    pub const RED: Rgb = Rgb {
        r: 1.0,
        g: 0.0,
        b: 0.0,
    };

    /// Encode as a pixel value for a TrueColor/DirectColor visual
    pub fn to_pixel(&self, masks: &ChannelMasks) -> u32 {
        scale_channel(self.r, masks.red)
            | scale_channel(self.g, masks.green)
            | scale_channel(self.b, masks.blue)
    }
}

/// Channel masks of an X visual
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMasks {
    pub red: u32,
    pub green: u32,
    pub blue: u32,
}

impl ChannelMasks {
    /// Standard 24-bit 0xRRGGBB layout
    pub const RGB888: ChannelMasks = ChannelMasks {
        red: 0x00ff_0000,
        green: 0x0000_ff00,
        blue: 0x0000_00ff,
    };
}

fn scale_channel(value: f64, mask: u32) -> u32 {
    if mask == 0 {
        return 0;
    }
    let shift = mask.trailing_zeros();
    let max = mask >> shift;
    let level = (value.clamp(0.0, 1.0) * f64::from(max)).round() as u32;
    (level << shift) & mask
}
