//! Color formats used by the 3D pipeline
//!
//! The renderer works internally in "6665" color: 6 bits per RGB channel and a 5-bit alpha,
//! stored one channel per byte in [`Color4u8`]. Output buffers are either that same layout,
//! full 8-bit RGBA ("8888"), or packed RGB555 with a 1-bit alpha ("5551").
//!
//! # Usage
//!
//! ```
//! use emu_core::graphics::Color4u8;
//!
//! let c = Color4u8::from_rgb555(0x7FFF, 31);
//! assert_eq!(c, Color4u8::new(63, 63, 63, 31));
//! assert_eq!(c.to_8888(), Color4u8::new(255, 255, 255, 255));
//! ```

use serde::{Deserialize, Serialize};

/// Maximum value of a 6-bit color channel
pub const MAX_COLOR6: u8 = 0x3F;

/// Maximum value of a 5-bit alpha channel
pub const MAX_ALPHA5: u8 = 0x1F;

/// One pixel, one byte per channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(C)]
pub struct Color4u8 {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color4u8 {
    pub const TRANSPARENT: Color4u8 = Color4u8::new(0, 0, 0, 0);

    #[inline]
    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Expand a 5-bit channel to 6 bits (0 stays 0, 31 becomes 63)
    #[inline]
    pub const fn expand5to6(c: u8) -> u8 {
        if c == 0 {
            0
        } else {
            (c << 1) | 1
        }
    }

    /// Decode an RGB555 word (red in the low bits) into 6665 with the given 5-bit alpha
    #[inline]
    pub fn from_rgb555(color: u16, alpha: u8) -> Self {
        Self {
            r: Self::expand5to6((color & 0x1F) as u8),
            g: Self::expand5to6(((color >> 5) & 0x1F) as u8),
            b: Self::expand5to6(((color >> 10) & 0x1F) as u8),
            a: alpha & MAX_ALPHA5,
        }
    }

    /// Widen a 6665 color to 8 bits per channel
    #[inline]
    pub fn to_8888(self) -> Self {
        Self {
            r: (self.r << 2) | (self.r >> 4),
            g: (self.g << 2) | (self.g >> 4),
            b: (self.b << 2) | (self.b >> 4),
            a: (self.a << 3) | (self.a >> 2),
        }
    }

    /// Requantize an 8888 color down to 6665 (6-bit color, 5-bit alpha)
    #[inline]
    pub fn to_6665(self) -> Self {
        Self {
            r: self.r >> 2,
            g: self.g >> 2,
            b: self.b >> 2,
            a: self.a >> 3,
        }
    }

    /// Pack a 6665 color as RGB555 with bit 15 set when alpha is non-zero
    #[inline]
    pub fn to_5551(self) -> u16 {
        let alpha_bit = if self.a != 0 { 0x8000 } else { 0 };
        ((self.r >> 1) as u16)
            | (((self.g >> 1) as u16) << 5)
            | (((self.b >> 1) as u16) << 10)
            | alpha_bit
    }

    /// Convert a 6665 color to a 0xAARRGGBB word for presentation
    #[inline]
    pub fn to_argb(self) -> u32 {
        let c = self.to_8888();
        ((c.a as u32) << 24) | ((c.r as u32) << 16) | ((c.g as u32) << 8) | (c.b as u32)
    }

    /// Alpha-blend `src` over `dst`, both in 6665
    ///
    /// Color is `(src * (a + 1) + dst * (31 - a)) >> 5`, alpha is the larger of the two.
    /// A destination with zero alpha is overwritten when `zero_dst_overwrite` is set.
    #[inline]
    pub fn blend(src: Self, dst: Self, zero_dst_overwrite: bool) -> Self {
        if zero_dst_overwrite && dst.a == 0 {
            return src;
        }
        if src.a >= MAX_ALPHA5 {
            return Self { a: MAX_ALPHA5, ..src };
        }
        let sa = src.a as u16 + 1;
        let da = 32 - sa;
        let mix = |s: u8, d: u8| ((s as u16 * sa + d as u16 * da) >> 5) as u8;
        Self {
            r: mix(src.r, dst.r),
            g: mix(src.g, dst.g),
            b: mix(src.b, dst.b),
            a: src.a.max(dst.a),
        }
    }
}
