//! Edge marking and fog
//!
//! Both stages read only the resolved fragment attributes of the finished geometry pass and
//! rewrite color in place. They work on a block of rows at a time; edge marking also needs the
//! row just above and just below the block, passed in as [`EdgeRow`] halos.

use std::ops::Range;

use emu_core::graphics::Color4u8;

use crate::fragment::FragmentAttributesBuffer;
use crate::state::RenderState;

/// Fog table entries, indexed by `depth >> 9`
pub const FOG_TABLE_SIZE: usize = 32768;

/// The attributes edge marking reads from a neighboring row
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeRow {
    pub poly_id: Vec<u8>,
    pub depth: Vec<u32>,
    pub wireframe: Vec<bool>,
}

impl EdgeRow {
    /// Copy local row `row` out of a block of attributes `width` wide
    pub fn from_attrs(attrs: &FragmentAttributesBuffer, row: usize, width: usize) -> Self {
        let span = row * width..(row + 1) * width;
        Self {
            poly_id: attrs.opaque_poly_id[span.clone()].to_vec(),
            depth: attrs.depth[span.clone()].to_vec(),
            wireframe: attrs.is_wireframe[span].to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeMarkParams {
    pub colors: [Color4u8; 8],
    pub clear_poly_id: u8,
    pub clear_depth: u32,
}

impl EdgeMarkParams {
    pub fn from_state(state: &RenderState) -> Self {
        Self {
            colors: state.edge_colors_6665(),
            clear_poly_id: state.clear_poly_id & 0x3F,
            clear_depth: state.clear_depth24(),
        }
    }
}

/// Where the attributes of one block of rows come from
pub struct AttrBlock<'a> {
    pub attrs: &'a FragmentAttributesBuffer,
    pub width: usize,
    /// Absolute rows held by `attrs`
    pub rows: Range<usize>,
    /// Framebuffer height
    pub height: usize,
    pub above: Option<&'a EdgeRow>,
    pub below: Option<&'a EdgeRow>,
}

enum Neighbor {
    Pixel { id: u8, depth: u32, wireframe: bool },
    Border,
}

impl AttrBlock<'_> {
    fn neighbor(&self, x: isize, y: isize) -> Neighbor {
        if x < 0 || y < 0 || x as usize >= self.width || y as usize >= self.height {
            return Neighbor::Border;
        }
        let (x, y) = (x as usize, y as usize);
        let row = if y < self.rows.start {
            self.above
        } else if y >= self.rows.end {
            self.below
        } else {
            let i = (y - self.rows.start) * self.width + x;
            return Neighbor::Pixel {
                id: self.attrs.opaque_poly_id[i],
                depth: self.attrs.depth[i],
                wireframe: self.attrs.is_wireframe[i],
            };
        };
        match row {
            Some(r) => Neighbor::Pixel {
                id: r.poly_id[x],
                depth: r.depth[x],
                wireframe: r.wireframe[x],
            },
            // a missing halo inside the frame never marks an edge
            None => Neighbor::Pixel {
                id: u8::MAX,
                depth: u32::MAX,
                wireframe: true,
            },
        }
    }
}

/// Draw edge colors into `color`, which holds the same rows as `block.attrs`
pub fn edge_mark(color: &mut [Color4u8], block: &AttrBlock<'_>, params: &EdgeMarkParams) {
    const NEIGHBORS: [(isize, isize); 4] = [(1, 0), (0, 1), (-1, 0), (0, -1)];
    let width = block.width;

    for (ly, y) in block.rows.clone().enumerate() {
        for x in 0..width {
            let i = ly * width + x;
            if block.attrs.is_wireframe[i] {
                continue;
            }
            let id = block.attrs.opaque_poly_id[i];
            let depth = block.attrs.depth[i];

            let edge = NEIGHBORS.iter().find_map(|&(dx, dy)| {
                match block.neighbor(x as isize + dx, y as isize + dy) {
                    Neighbor::Pixel {
                        id: nid,
                        depth: ndepth,
                        wireframe: false,
                    } if nid != id && depth >= ndepth => Some(params.colors[(nid >> 3) as usize & 7]),
                    Neighbor::Border if id != params.clear_poly_id && depth < params.clear_depth => {
                        Some(params.colors[(id >> 3) as usize & 7])
                    }
                    _ => None,
                }
            });

            if let Some(edge_color) = edge {
                color[i] = Color4u8::blend(edge_color, color[i], true);
            }
        }
    }
}

/// Depth indices per density step; 0 once the shift passes 10
pub fn fog_step(shift: u8) -> u32 {
    0x400u32.checked_shr(shift as u32).unwrap_or(0)
}

/// Fog weights (0..=128) for every 15-bit depth
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FogTable {
    weights: Vec<u8>,
}

impl FogTable {
    pub fn new(offset: u16, shift: u8, densities: &[u8; 32]) -> Self {
        let density = |i: usize| -> i32 {
            match densities[i] & 0x7F {
                127 => 128,
                d => d as i32,
            }
        };
        let step = fog_step(shift) as i32;
        let offset = (offset & 0x7FFF) as i32;
        let first = offset + step;
        let last = offset + 32 * step;

        // a zero step leaves only the two outer densities, split at the offset
        let weights = (0..FOG_TABLE_SIZE as i32)
            .map(|idx| {
                if idx < first {
                    density(0)
                } else if idx >= last {
                    density(31)
                } else {
                    let i = ((idx - offset) / step - 1) as usize;
                    let frac = (idx - offset) % step;
                    let (d0, d1) = (density(i), density(i + 1));
                    d0 + (d1 - d0) * frac / step
                }
            })
            .map(|w| w.clamp(0, 128) as u8)
            .collect();
        Self { weights }
    }

    pub fn from_state(state: &RenderState) -> Self {
        Self::new(state.fog_offset, state.fog_shift, &state.fog_density)
    }

    #[inline]
    pub fn weight(&self, depth: u32) -> u8 {
        self.weights[((depth >> 9) as usize).min(FOG_TABLE_SIZE - 1)]
    }

    pub fn weights(&self) -> &[u8] {
        &self.weights
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FogParams {
    pub table: FogTable,
    pub color: Color4u8,
    pub alpha_only: bool,
}

impl FogParams {
    pub fn from_state(state: &RenderState) -> Self {
        Self {
            table: FogTable::from_state(state),
            color: state.fog_color_6665(),
            alpha_only: state.fog_alpha_only,
        }
    }
}

#[inline]
fn fog_mix(fog: u8, dst: u8, w: u32) -> u8 {
    ((fog as u32 * w + dst as u32 * (128 - w)) >> 7) as u8
}

/// Blend fog into every fogged pixel of a block
pub fn fog(color: &mut [Color4u8], attrs: &FragmentAttributesBuffer, params: &FogParams) {
    let fog = params.color;
    for (i, c) in color.iter_mut().enumerate().take(attrs.len()) {
        if !attrs.is_fogged[i] {
            continue;
        }
        let w = params.table.weight(attrs.depth[i]) as u32;
        if params.alpha_only {
            c.a = fog_mix(fog.a, c.a, w);
        } else {
            *c = Color4u8::new(
                fog_mix(fog.r, c.r, w),
                fog_mix(fog.g, c.g, w),
                fog_mix(fog.b, c.b, w),
                fog_mix(fog.a, c.a, w),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::FragmentAttributes;

    const RED: Color4u8 = Color4u8::new(63, 0, 0, 31);

    fn params(clear_id: u8) -> EdgeMarkParams {
        let mut colors = [Color4u8::new(0, 0, 0, 31); 8];
        colors[0] = Color4u8::new(0, 63, 0, 31);
        colors[1] = Color4u8::new(0, 0, 63, 31);
        EdgeMarkParams {
            colors,
            clear_poly_id: clear_id,
            clear_depth: 0xFF_FFFF,
        }
    }

    fn uniform(width: usize, height: usize, id: u8, depth: u32) -> FragmentAttributesBuffer {
        let mut attrs = FragmentAttributesBuffer::new(width * height);
        attrs.fill(FragmentAttributes {
            opaque_poly_id: id,
            depth,
            ..Default::default()
        });
        attrs
    }

    fn run_edge(attrs: &FragmentAttributesBuffer, w: usize, h: usize, p: &EdgeMarkParams) -> Vec<Color4u8> {
        let mut color = vec![RED; w * h];
        let block = AttrBlock {
            attrs,
            width: w,
            rows: 0..h,
            height: h,
            above: None,
            below: None,
        };
        edge_mark(&mut color, &block, p);
        color
    }

    #[test]
    fn test_uniform_frame_has_no_interior_edges() {
        let attrs = uniform(6, 4, 2, 1000);
        // clear ID equal to the polygon: nothing at all
        assert!(run_edge(&attrs, 6, 4, &params(2)).iter().all(|&c| c == RED));

        // clear ID differs: only border pixels change
        let color = run_edge(&attrs, 6, 4, &params(9));
        for y in 0..4 {
            for x in 0..6 {
                let border = x == 0 || y == 0 || x == 5 || y == 3;
                assert_eq!(color[y * 6 + x] != RED, border, "({}, {})", x, y);
            }
        }
        assert_eq!(color[0], Color4u8::new(0, 63, 0, 31));
    }

    #[test]
    fn test_edge_on_farther_pixel_uses_neighbor_color() {
        let mut attrs = uniform(4, 1, 3, 5000);
        attrs.opaque_poly_id[2] = 8;
        attrs.depth[2] = 1000;
        // keep the frame border out of it
        let mut p = params(3);
        p.clear_depth = 0;
        let color = run_edge(&attrs, 4, 1, &p);
        // pixels 1 and 3 are behind pixel 2
        assert_eq!(color[1], Color4u8::new(0, 0, 63, 31));
        assert_eq!(color[3], Color4u8::new(0, 0, 63, 31));
        // pixel 2 is in front of its neighbors: no edge
        assert_eq!(color[2], RED);
        assert_eq!(color[0], RED);
    }

    #[test]
    fn test_wireframe_neighbors_do_not_mark() {
        let mut attrs = uniform(3, 1, 3, 5000);
        attrs.opaque_poly_id[1] = 8;
        attrs.depth[1] = 1000;
        attrs.is_wireframe[1] = true;
        let color = run_edge(&attrs, 3, 1, &params(3));
        assert!(color.iter().all(|&c| c == RED));
    }

    #[test]
    fn test_halo_rows_are_consulted() {
        let attrs = uniform(2, 1, 3, 5000);
        let above = EdgeRow {
            poly_id: vec![8, 3],
            depth: vec![1000, 5000],
            wireframe: vec![false, false],
        };
        let mut color = vec![RED; 2];
        let block = AttrBlock {
            attrs: &attrs,
            width: 2,
            rows: 1..2,
            height: 3,
            above: Some(&above),
            below: None,
        };
        edge_mark(&mut color, &block, &params(3));
        assert_eq!(color[0], Color4u8::new(0, 0, 63, 31));
        assert_eq!(color[1], RED);
    }

    #[test]
    fn test_antialiased_edge_blends_half() {
        let mut attrs = uniform(2, 1, 3, 5000);
        attrs.opaque_poly_id[1] = 0;
        attrs.depth[1] = 1000;
        let mut p = params(3);
        p.colors[0] = Color4u8::new(0, 63, 0, 16);
        let color = run_edge(&attrs, 2, 1, &p);
        assert_eq!(color[0], Color4u8::new(29, 33, 0, 31));
    }

    #[test]
    fn test_fog_table_shape() {
        let mut densities = [0u8; 32];
        for (i, d) in densities.iter_mut().enumerate() {
            *d = (i * 4) as u8;
        }
        densities[31] = 127;
        // step 0x200
        let table = FogTable::new(0x100, 1, &densities);
        let w = table.weights();
        assert_eq!(w.len(), FOG_TABLE_SIZE);
        assert_eq!(w[0], 0);
        assert_eq!(w[0x100 + 0x200 - 1], 0);
        assert_eq!(w[0x100 + 0x200], 0);
        assert_eq!(w[0x100 + 0x200 * 2], 4);
        assert_eq!(w[0x100 + 0x200 + 0x100], 2);
        assert_eq!(w[0x100 + 0x200 * 31], 120);
        assert_eq!(w[0x100 + 0x200 * 32], 128);
        assert_eq!(w[FOG_TABLE_SIZE - 1], 128);
        assert!(w.windows(2).all(|p| p[0] <= p[1]));
    }

    #[test]
    fn test_fog_table_zero_step_splits_at_offset() {
        let mut densities = [10u8; 32];
        densities[31] = 90;
        assert_eq!(fog_step(10), 1);
        assert_eq!(fog_step(11), 0);
        assert_eq!(fog_step(40), 0);

        let table = FogTable::new(0x4000, 12, &densities);
        let w = table.weights();
        assert_eq!(w[0x3FFF], 10);
        assert_eq!(w[0x4000], 90);
        assert_eq!(w[FOG_TABLE_SIZE - 1], 90);
        assert_eq!(w.iter().filter(|&&d| d == 10).count(), 0x4000);
    }

    #[test]
    fn test_fog_blend_full_and_alpha_only() {
        let mut attrs = FragmentAttributesBuffer::new(2);
        attrs.is_fogged[0] = true;
        attrs.depth[0] = 0;
        let params = FogParams {
            table: FogTable::new(0, 0, &[127; 32]),
            color: Color4u8::new(10, 20, 30, 5),
            alpha_only: false,
        };
        let mut color = vec![RED; 2];
        fog(&mut color, &attrs, &params);
        assert_eq!(color[0], Color4u8::new(10, 20, 30, 5));
        assert_eq!(color[1], RED);

        let params = FogParams {
            alpha_only: true,
            ..params
        };
        let mut color = vec![RED; 2];
        fog(&mut color, &attrs, &params);
        assert_eq!(color[0], Color4u8::new(63, 0, 0, 5));
    }
}
