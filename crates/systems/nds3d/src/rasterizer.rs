//! Scan conversion of convex polygons
//!
//! Coverage is decided per row at pixel centers: a row's span runs from the leftmost to the
//! rightmost edge crossing, a pixel is inside when `left <= x + 0.5 < right`, and an edge owns
//! the rows from its top (inclusive) to its bottom (exclusive), so polygons sharing an edge
//! never draw a pixel twice.
//!
//! Attributes are walked along the two edges bounding each row and then interpolated across
//! the span. Depth (z/w) and the `/w` attributes are linear along both walks; texture
//! coordinates and colors are recovered per fragment by dividing by the interpolated `1/w`.

use std::ops::Range;

use emu_core::graphics::color::MAX_COLOR6;
use emu_core::graphics::depth::{depth_from_w, depth_from_z};

use crate::geometry::ScreenVertex;

const ATTR_COUNT: usize = 7;
const MIN_AREA: f32 = 1.0e-4;

/// z, 1/w, s/w, t/w, r/w, g/w, b/w
type AttrVec = [f32; ATTR_COUNT];

fn attrs_of(v: &ScreenVertex) -> AttrVec {
    [
        v.z,
        v.inv_w,
        v.s_w,
        v.t_w,
        v.color_w[0],
        v.color_w[1],
        v.color_w[2],
    ]
}

#[inline]
fn lerp_attrs(a: &AttrVec, b: &AttrVec, t: f32) -> AttrVec {
    let mut out = *a;
    for k in 0..ATTR_COUNT {
        out[k] += (b[k] - a[k]) * t;
    }
    out
}

/// One covered pixel with its resolved attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Fragment {
    pub x: usize,
    pub y: usize,
    pub depth: u32,
    /// Interpolated vertex color, rounded to 6 bits
    pub color: [u8; 3],
    /// Texel coordinates
    pub s: i32,
    pub t: i32,
}

/// Per-frame rasterization parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct RasterOptions {
    pub width: usize,
    pub height: usize,
    pub w_buffer: bool,
    /// Framebuffer pixels per native pixel, when sampling attributes at native centers
    pub sampling_scale: Option<(f32, f32)>,
}

/// Twice the signed area of the polygon outline
fn signed_area2(verts: &[ScreenVertex]) -> f32 {
    let n = verts.len();
    (0..n)
        .map(|i| {
            let (a, b) = (&verts[i], &verts[(i + 1) % n]);
            a.x * b.y - b.x * a.y
        })
        .sum()
}

/// Edge crossing of a row: x position and the attributes walked down to it
type Crossing = (f32, AttrVec);

/// A polygon in framebuffer space, ready to be scanned by any number of row ranges
#[derive(Debug, Clone)]
pub(crate) struct RasterPolygon {
    verts: Vec<ScreenVertex>,
    attrs: Vec<AttrVec>,
    /// Encloses area and is scanned as a filled polygon
    solid: bool,
    rows: Range<usize>,
    wireframe: bool,
    /// Endpoints of the line drawn for a zero-area polygon
    line: Option<(ScreenVertex, ScreenVertex)>,
}

impl RasterPolygon {
    pub fn new(verts: &[ScreenVertex], height: usize, wireframe: bool, line_hack: bool) -> Self {
        let solid = !is_degenerate(verts);

        let line = if !solid && line_hack && !verts.is_empty() {
            farthest_pair(verts)
        } else {
            None
        };

        let (min_y, max_y) = verts
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(v.y), hi.max(v.y))
            });
        let rows = if verts.is_empty() {
            0..0
        } else {
            let start = (min_y - 0.5).ceil().max(0.0) as usize;
            let end = ((max_y - 0.5).ceil().max(0.0) as usize).min(height);
            start..end.max(start)
        };

        Self {
            verts: verts.to_vec(),
            attrs: verts.iter().map(attrs_of).collect(),
            solid,
            rows,
            wireframe,
            line,
        }
    }

    /// Rows with at least potential coverage
    pub fn rows(&self) -> Range<usize> {
        if let Some((a, b)) = &self.line {
            let lo = a.y.min(b.y).floor().max(0.0) as usize;
            let hi = a.y.max(b.y).floor().max(0.0) as usize + 1;
            return lo..hi;
        }
        self.rows.clone()
    }

    /// Leftmost and rightmost edge crossings of the horizontal line at `yc`
    fn crossings(&self, yc: f32) -> Option<(Crossing, Crossing)> {
        let mut left: Option<Crossing> = None;
        let mut right: Option<Crossing> = None;
        let n = self.verts.len();
        for i in 0..n {
            let j = (i + 1) % n;
            let (top, bottom) = if self.verts[i].y <= self.verts[j].y {
                (i, j)
            } else {
                (j, i)
            };
            let (a, b) = (&self.verts[top], &self.verts[bottom]);
            if a.y == b.y || yc < a.y || yc >= b.y {
                continue;
            }
            let t = (yc - a.y) / (b.y - a.y);
            let x = a.x + (b.x - a.x) * t;
            if left.as_ref().map_or(true, |(lx, _)| x < *lx) {
                left = Some((x, lerp_attrs(&self.attrs[top], &self.attrs[bottom], t)));
            }
            if right.as_ref().map_or(true, |(rx, _)| x > *rx) {
                right = Some((x, lerp_attrs(&self.attrs[top], &self.attrs[bottom], t)));
            }
        }
        left.zip(right)
    }

    /// Covered pixel range `[start, end)` of row `y`
    fn span(&self, y: usize, width: usize) -> Option<(usize, usize)> {
        if !self.rows.contains(&y) {
            return None;
        }
        let row = self.crossings(y as f32 + 0.5)?;
        pixel_range(&row, width)
    }

    /// Attributes at `(sx, sy)`, walked down the bounding edges and across the span
    fn attrs_at(&self, sx: f32, sy: f32, yc: f32, row: &(Crossing, Crossing)) -> AttrVec {
        // a sample row outside the polygon keeps the covered row's edges
        let sampled = if sy == yc { None } else { self.crossings(sy) };
        let ((lx, la), (rx, ra)) = sampled.as_ref().unwrap_or(row);
        if rx - lx <= f32::EPSILON {
            return *la;
        }
        let t = ((sx - lx) / (rx - lx)).clamp(0.0, 1.0);
        lerp_attrs(la, ra, t)
    }

    fn fragment(&self, attrs: AttrVec, x: usize, y: usize, opts: &RasterOptions) -> Fragment {
        let inv_w = attrs[1].max(f32::MIN_POSITIVE);
        let w = 1.0 / inv_w;
        let depth = if opts.w_buffer {
            depth_from_w(w)
        } else {
            depth_from_z(attrs[0])
        };
        let channel = |v: f32| (v * w).round().clamp(0.0, MAX_COLOR6 as f32) as u8;
        Fragment {
            x,
            y,
            depth,
            color: [channel(attrs[4]), channel(attrs[5]), channel(attrs[6])],
            s: (attrs[2] * w).floor() as i32,
            t: (attrs[3] * w).floor() as i32,
        }
    }

    fn sample_point(x: usize, y: usize, opts: &RasterOptions) -> (f32, f32) {
        match opts.sampling_scale {
            Some((sx, sy)) if sx > 1.0 || sy > 1.0 => (
                (((x as f32 + 0.5) / sx).floor() + 0.5) * sx,
                (((y as f32 + 0.5) / sy).floor() + 0.5) * sy,
            ),
            _ => (x as f32 + 0.5, y as f32 + 0.5),
        }
    }

    /// Emit every covered pixel in `rows`
    pub fn rasterize<F>(&self, rows: Range<usize>, opts: &RasterOptions, mut emit: F)
    where
        F: FnMut(Fragment),
    {
        if let Some((a, b)) = &self.line {
            self.rasterize_line(a, b, rows, opts, &mut emit);
            return;
        }
        if !self.solid {
            return;
        }

        let start = rows.start.max(self.rows.start);
        let end = rows.end.min(self.rows.end);
        for y in start..end {
            let yc = y as f32 + 0.5;
            let Some(row) = self.crossings(yc) else {
                continue;
            };
            let Some((x0, x1)) = pixel_range(&row, opts.width) else {
                continue;
            };
            let (above, below) = if self.wireframe {
                (
                    y.checked_sub(1).and_then(|py| self.span(py, opts.width)),
                    self.span(y + 1, opts.width),
                )
            } else {
                (None, None)
            };
            for x in x0..x1 {
                if self.wireframe && !on_outline(x, (x0, x1), above, below) {
                    continue;
                }
                let (sx, sy) = Self::sample_point(x, y, opts);
                emit(self.fragment(self.attrs_at(sx, sy, yc, &row), x, y, opts));
            }
        }
    }

    fn rasterize_line<F>(
        &self,
        a: &ScreenVertex,
        b: &ScreenVertex,
        rows: Range<usize>,
        opts: &RasterOptions,
        emit: &mut F,
    ) where
        F: FnMut(Fragment),
    {
        let (aa, ba) = (attrs_of(a), attrs_of(b));
        let dx = b.x - a.x;
        let dy = b.y - a.y;
        let steps = dx.abs().max(dy.abs()).ceil().max(1.0) as usize;
        let mut last = None;
        for i in 0..=steps {
            let t = i as f32 / steps as f32;
            let px = (a.x + dx * t).floor();
            let py = (a.y + dy * t).floor();
            if px < 0.0 || py < 0.0 {
                continue;
            }
            let (x, y) = (px as usize, py as usize);
            if x >= opts.width || y >= opts.height || !rows.contains(&y) || last == Some((x, y)) {
                continue;
            }
            last = Some((x, y));
            emit(self.fragment(lerp_attrs(&aa, &ba, t), x, y, opts));
        }
    }
}

fn pixel_range(((left, _), (right, _)): &(Crossing, Crossing), width: usize) -> Option<(usize, usize)> {
    let start = (left - 0.5).ceil().max(0.0) as usize;
    let end = ((right - 0.5).ceil().max(0.0) as usize).min(width);
    (start < end).then_some((start, end))
}

fn on_outline(
    x: usize,
    (x0, x1): (usize, usize),
    above: Option<(usize, usize)>,
    below: Option<(usize, usize)>,
) -> bool {
    let inside = |span: Option<(usize, usize)>| span.is_some_and(|(s, e)| x >= s && x < e);
    x == x0 || x + 1 == x1 || !inside(above) || !inside(below)
}

/// The polygon covers no area and can only be drawn as a line
#[cfg_attr(not(feature = "opengl"), allow(dead_code))]
pub(crate) fn is_degenerate(verts: &[ScreenVertex]) -> bool {
    verts.len() < 3 || signed_area2(verts).abs() < MIN_AREA
}

pub(crate) fn farthest_pair(verts: &[ScreenVertex]) -> Option<(ScreenVertex, ScreenVertex)> {
    let mut best: Option<(f32, usize, usize)> = None;
    for i in 0..verts.len() {
        for j in i..verts.len() {
            let d = (verts[i].x - verts[j].x).powi(2) + (verts[i].y - verts[j].y).powi(2);
            if best.map_or(true, |(bd, _, _)| d > bd) {
                best = Some((d, i, j));
            }
        }
    }
    best.map(|(_, i, j)| (verts[i], verts[j]))
}
