//! Per-pixel fragment attributes
//!
//! Alongside color, every framebuffer pixel carries the attributes later stages need: depth,
//! the opaque and translucent polygon IDs (edge marking, translucency rules), the side channel,
//! fog and translucency flags, and the facing of the last opaque write.
//!
//! [`FragmentAttributesBuffer`] stores them as one array per field so postprocessing can
//! stream a single attribute without touching the rest.

use crate::side_channel::SideChannel;
use emu_core::graphics::depth::DEPTH_MAX;

/// Translucent polygon ID of a pixel no translucent polygon has touched
pub const UNSET_TRANSLUCENT_POLY_ID: u8 = 255;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PolyFacing {
    #[default]
    Unwritten,
    Front,
    Back,
}

impl PolyFacing {
    pub fn from_back_facing(back_facing: bool) -> Self {
        if back_facing {
            PolyFacing::Back
        } else {
            PolyFacing::Front
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentAttributes {
    pub depth: u32,
    pub opaque_poly_id: u8,
    pub translucent_poly_id: u8,
    pub side: SideChannel,
    pub is_fogged: bool,
    pub is_translucent: bool,
    pub is_wireframe: bool,
    pub facing: PolyFacing,
}

impl Default for FragmentAttributes {
    fn default() -> Self {
        Self {
            depth: DEPTH_MAX,
            opaque_poly_id: 0,
            translucent_poly_id: UNSET_TRANSLUCENT_POLY_ID,
            side: SideChannel(0),
            is_fogged: false,
            is_translucent: false,
            is_wireframe: false,
            facing: PolyFacing::Unwritten,
        }
    }
}

/// Structure-of-arrays fragment attributes for a block of pixels
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FragmentAttributesBuffer {
    pub depth: Vec<u32>,
    pub opaque_poly_id: Vec<u8>,
    pub translucent_poly_id: Vec<u8>,
    pub side: Vec<SideChannel>,
    pub is_fogged: Vec<bool>,
    pub is_translucent: Vec<bool>,
    pub is_wireframe: Vec<bool>,
    pub facing: Vec<PolyFacing>,
}

impl FragmentAttributesBuffer {
    pub fn new(len: usize) -> Self {
        let mut buffer = Self::default();
        buffer.resize(len);
        buffer
    }

    pub fn len(&self) -> usize {
        self.depth.len()
    }

    pub fn is_empty(&self) -> bool {
        self.depth.is_empty()
    }

    /// Resize, filling new entries with default attributes
    pub fn resize(&mut self, len: usize) {
        let d = FragmentAttributes::default();
        self.depth.resize(len, d.depth);
        self.opaque_poly_id.resize(len, d.opaque_poly_id);
        self.translucent_poly_id.resize(len, d.translucent_poly_id);
        self.side.resize(len, d.side);
        self.is_fogged.resize(len, d.is_fogged);
        self.is_translucent.resize(len, d.is_translucent);
        self.is_wireframe.resize(len, d.is_wireframe);
        self.facing.resize(len, d.facing);
    }

    #[inline]
    pub fn get(&self, i: usize) -> FragmentAttributes {
        FragmentAttributes {
            depth: self.depth[i],
            opaque_poly_id: self.opaque_poly_id[i],
            translucent_poly_id: self.translucent_poly_id[i],
            side: self.side[i],
            is_fogged: self.is_fogged[i],
            is_translucent: self.is_translucent[i],
            is_wireframe: self.is_wireframe[i],
            facing: self.facing[i],
        }
    }

    #[inline]
    pub fn set_at_index(&mut self, i: usize, attr: FragmentAttributes) {
        self.depth[i] = attr.depth;
        self.opaque_poly_id[i] = attr.opaque_poly_id;
        self.translucent_poly_id[i] = attr.translucent_poly_id;
        self.side[i] = attr.side;
        self.is_fogged[i] = attr.is_fogged;
        self.is_translucent[i] = attr.is_translucent;
        self.is_wireframe[i] = attr.is_wireframe;
        self.facing[i] = attr.facing;
    }

    /// Set every entry to the same attributes
    pub fn fill(&mut self, attr: FragmentAttributes) {
        self.depth.fill(attr.depth);
        self.opaque_poly_id.fill(attr.opaque_poly_id);
        self.translucent_poly_id.fill(attr.translucent_poly_id);
        self.side.fill(attr.side);
        self.is_fogged.fill(attr.is_fogged);
        self.is_translucent.fill(attr.is_translucent);
        self.is_wireframe.fill(attr.is_wireframe);
        self.facing.fill(attr.facing);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_attributes_are_far_and_unset() {
        let attr = FragmentAttributes::default();
        assert_eq!(attr.depth, DEPTH_MAX);
        assert_eq!(attr.translucent_poly_id, UNSET_TRANSLUCENT_POLY_ID);
        assert_eq!(attr.facing, PolyFacing::Unwritten);
    }

    #[test]
    fn test_set_and_get_round_trip_one_index() {
        let mut buffer = FragmentAttributesBuffer::new(4);
        let attr = FragmentAttributes {
            depth: 1234,
            opaque_poly_id: 9,
            side: SideChannel::translucent(3),
            is_translucent: true,
            facing: PolyFacing::Back,
            ..Default::default()
        };
        buffer.set_at_index(2, attr);
        assert_eq!(buffer.get(2), attr);
        assert_eq!(buffer.get(1), FragmentAttributes::default());
    }

    #[test]
    fn test_fill_and_resize() {
        let mut buffer = FragmentAttributesBuffer::new(2);
        let attr = FragmentAttributes {
            opaque_poly_id: 7,
            ..Default::default()
        };
        buffer.fill(attr);
        buffer.resize(3);
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.opaque_poly_id, vec![7, 7, 0]);
    }
}
