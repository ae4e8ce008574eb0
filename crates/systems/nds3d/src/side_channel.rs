//! The 8-bit per-pixel side channel and the draw passes that read and write it
//!
//! Composition rules the console applies (translucent self-overlap rejection, shadow volumes,
//! the depth-equal tolerance window) cannot be expressed as one depth test plus blending. Both
//! backends instead draw each polygon as an ordered list of [`DrawPass`]es, each one a masked
//! read-modify-write of this byte gated by a predicate and a depth test. The GPU backend maps a
//! pass onto its stencil unit one to one; the software backend runs [`DrawPass::resolve`] per
//! fragment.
//!
//! Bit layout:
//!
//! | bits | meaning |
//! |------|---------|
//! | 0-5  | ID of the last polygon written here |
//! | 6    | last write was translucent (or a per-pass marker inside the opaque group) |
//! | 7    | scratch mask: shadow volume, depth-equal window, zero-alpha marker |

use emu_core::graphics::depth::{offset_depth, CompareFunc};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SideChannel(pub u8);

impl SideChannel {
    pub const POLY_ID_MASK: u8 = 0x3F;
    pub const TRANSLUCENT_BIT: u8 = 0x40;
    pub const SCRATCH_BIT: u8 = 0x80;

    #[inline]
    pub fn poly_id(self) -> u8 {
        self.0 & Self::POLY_ID_MASK
    }

    #[inline]
    pub fn is_translucent(self) -> bool {
        self.0 & Self::TRANSLUCENT_BIT != 0
    }

    #[inline]
    pub fn scratch(self) -> bool {
        self.0 & Self::SCRATCH_BIT != 0
    }

    #[inline]
    pub fn opaque(id: u8) -> Self {
        Self(id & Self::POLY_ID_MASK)
    }

    #[inline]
    pub fn translucent(id: u8) -> Self {
        Self((id & Self::POLY_ID_MASK) | Self::TRANSLUCENT_BIT)
    }

    #[inline]
    pub fn clear_bits(&mut self, mask: u8) {
        self.0 &= !mask;
    }

    #[inline]
    pub fn set_bits(&mut self, mask: u8) {
        self.0 |= mask;
    }
}

/// `(reference & mask) FUNC (stored & mask)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SidePredicate {
    pub func: CompareFunc,
    pub reference: u8,
    pub mask: u8,
}

impl SidePredicate {
    pub const fn new(func: CompareFunc, reference: u8, mask: u8) -> Self {
        Self {
            func,
            reference,
            mask,
        }
    }

    pub const fn always(reference: u8) -> Self {
        Self::new(CompareFunc::Always, reference, 0xFF)
    }

    #[inline]
    pub fn test(&self, side: SideChannel) -> bool {
        self.func
            .test(self.reference & self.mask, side.0 & self.mask)
    }
}

/// Value written into the masked bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SideWrite {
    Keep,
    Zero,
    /// The predicate's reference value
    Replace,
}

/// Writes for the three outcomes of a pass, all under one write mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SideWrites {
    pub on_predicate_fail: SideWrite,
    pub on_depth_fail: SideWrite,
    pub on_depth_pass: SideWrite,
    pub write_mask: u8,
}

impl SideWrites {
    pub const NONE: SideWrites = SideWrites::new(SideWrite::Keep, SideWrite::Keep, SideWrite::Keep, 0);

    pub const fn new(
        on_predicate_fail: SideWrite,
        on_depth_fail: SideWrite,
        on_depth_pass: SideWrite,
        write_mask: u8,
    ) -> Self {
        Self {
            on_predicate_fail,
            on_depth_fail,
            on_depth_pass,
            write_mask,
        }
    }

    #[inline]
    fn apply(&self, op: SideWrite, side: &mut SideChannel, reference: u8) {
        let value = match op {
            SideWrite::Keep => return,
            SideWrite::Zero => 0,
            SideWrite::Replace => reference,
        };
        side.0 = (side.0 & !self.write_mask) | (value & self.write_mask);
    }
}

/// Which fragments of a textured polygon a pass draws
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FragmentFilter {
    All,
    /// Texel alpha is fully opaque
    OpaqueTexels,
    /// Texel alpha below full
    TranslucentTexels,
}

impl FragmentFilter {
    #[inline]
    pub fn accepts(self, texel_alpha: u8) -> bool {
        match self {
            FragmentFilter::All => true,
            FragmentFilter::OpaqueTexels => texel_alpha >= 31,
            FragmentFilter::TranslucentTexels => texel_alpha < 31,
        }
    }
}

/// One step of a polygon's draw
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DrawPass {
    pub predicate: SidePredicate,
    pub writes: SideWrites,
    pub depth_func: CompareFunc,
    /// Added to the fragment depth before the test, in 24-bit units
    pub depth_offset: i32,
    pub depth_write: bool,
    pub color_write: bool,
    /// With `color_write`, false writes RGB only and skips blending
    pub alpha_write: bool,
    /// Update polygon ID / fog / translucency attributes with the color
    pub attribute_write: bool,
    pub blend: bool,
    pub filter: FragmentFilter,
    /// Only draw where the destination's stored facing is back
    pub require_dst_back_facing: bool,
}

/// Result of the predicate and depth stages for one fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    PredicateFailed,
    DepthFailed,
    /// Passed, with the depth value the pass would write
    Passed(u32),
}

impl DrawPass {
    /// A mask-only pass: no color, depth or attribute writes
    pub const fn mask(predicate: SidePredicate, writes: SideWrites, depth_func: CompareFunc) -> Self {
        Self {
            predicate,
            writes,
            depth_func,
            depth_offset: 0,
            depth_write: false,
            color_write: false,
            alpha_write: false,
            attribute_write: false,
            blend: false,
            filter: FragmentFilter::All,
            require_dst_back_facing: false,
        }
    }

    /// A color-writing pass
    pub const fn draw(
        predicate: SidePredicate,
        writes: SideWrites,
        depth_func: CompareFunc,
        depth_write: bool,
        blend: bool,
    ) -> Self {
        Self {
            predicate,
            writes,
            depth_func,
            depth_offset: 0,
            depth_write,
            color_write: true,
            alpha_write: true,
            attribute_write: true,
            blend,
            filter: FragmentFilter::All,
            require_dst_back_facing: false,
        }
    }

    pub const fn with_depth_offset(mut self, offset: i32) -> Self {
        self.depth_offset = offset;
        self
    }

    pub const fn with_filter(mut self, filter: FragmentFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Run the predicate and depth stages, applying the matching side-channel write
    #[inline]
    pub fn resolve(&self, side: &mut SideChannel, stored_depth: u32, fragment_depth: u32) -> PassOutcome {
        let reference = self.predicate.reference;
        if !self.predicate.test(*side) {
            self.writes
                .apply(self.writes.on_predicate_fail, side, reference);
            return PassOutcome::PredicateFailed;
        }
        let depth = offset_depth(fragment_depth, self.depth_offset);
        if !self.depth_func.test(depth, stored_depth) {
            self.writes.apply(self.writes.on_depth_fail, side, reference);
            return PassOutcome::DepthFailed;
        }
        self.writes.apply(self.writes.on_depth_pass, side, reference);
        PassOutcome::Passed(depth)
    }
}
