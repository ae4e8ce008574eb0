//! 24-bit depth values and the comparison functions shared by depth and stencil tests
//!
//! Depth is stored as an unsigned 24-bit integer where 0 is the near plane and
//! [`DEPTH_MAX`] is the far plane.
//!
//! ```
//! use emu_core::graphics::depth::{CompareFunc, offset_depth, DEPTH_MAX};
//!
//! assert!(CompareFunc::LessEqual.test(10, 10));
//! assert_eq!(offset_depth(DEPTH_MAX, 5), DEPTH_MAX);
//! ```

use serde::{Deserialize, Serialize};

/// Far plane
pub const DEPTH_MAX: u32 = 0x00FF_FFFF;

/// Comparison used by a depth or stencil test
///
/// `test(incoming, stored)` answers "does `incoming FUNC stored` hold", which is the
/// same operand order as the fixed-function GPU tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareFunc {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

impl CompareFunc {
    #[inline]
    pub fn test<T: PartialOrd>(self, incoming: T, stored: T) -> bool {
        match self {
            CompareFunc::Never => false,
            CompareFunc::Less => incoming < stored,
            CompareFunc::Equal => incoming == stored,
            CompareFunc::LessEqual => incoming <= stored,
            CompareFunc::Greater => incoming > stored,
            CompareFunc::NotEqual => incoming != stored,
            CompareFunc::GreaterEqual => incoming >= stored,
            CompareFunc::Always => true,
        }
    }
}

/// Apply a signed offset to a depth value, clamping to the 24-bit range
#[inline]
pub fn offset_depth(depth: u32, offset: i32) -> u32 {
    (depth as i64 + offset as i64).clamp(0, DEPTH_MAX as i64) as u32
}

/// Widen a 15-bit clear depth to 24 bits (0x7FFF maps to the far plane)
#[inline]
pub fn expand_depth15(depth: u16) -> u32 {
    let d = (depth & 0x7FFF) as u32;
    (d << 9) | if d == 0x7FFF { 0x1FF } else { 0 }
}

/// Depth for Z-buffering from a normalized `z / w` in [0, 1]
///
/// The two low bits are dropped to match the console's 22-bit Z precision.
#[inline]
pub fn depth_from_z(z01: f32) -> u32 {
    let z = z01.clamp(0.0, 1.0);
    ((z * 0x3F_FFFF as f32).floor() as u32) << 2
}

/// Depth for W-buffering from a W value in 20.12 fixed point
#[inline]
pub fn depth_from_w(w_raw: f32) -> u32 {
    w_raw.clamp(0.0, DEPTH_MAX as f32) as u32
}
