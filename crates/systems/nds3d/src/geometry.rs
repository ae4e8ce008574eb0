//! Per-frame geometry snapshot
//!
//! The geometry engine upstream transforms, lights and clips polygons, then hands the renderer
//! one [`GeometryList`] per frame. The renderer only reads it: vertices are referenced by index
//! from the clipped polygons and never duplicated, and the list is dropped before the next frame
//! begins.
//!
//! Positions stay in homogeneous clip space (20.12 fixed point) so both backends can project them
//! with [`project`] at whatever framebuffer size is active.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::texture::{TexParams, TextureMemory};
use crate::{Render3DError, Render3DResult, NATIVE_HEIGHT, NATIVE_WIDTH};

/// A clipped polygon has at most 10 vertices (a quad clipped against six planes)
pub const MAX_CLIPPED_VERTS: usize = 10;
/// Raw polygons per frame
pub const POLYLIST_SIZE: usize = 2048;
/// Clipped polygons per frame
pub const CLIPPED_POLYLIST_SIZE: usize = POLYLIST_SIZE * 2;
/// Vertices per frame
pub const VERTLIST_SIZE: usize = 6144;

/// One transformed vertex
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vertex {
    /// Clip-space x, y, z, w in 20.12 fixed point
    pub position: [i32; 4],
    /// Texture coordinate in texels, 12.4 fixed point
    pub tex_coord: [i16; 2],
    /// Vertex color, 6 bits per channel
    pub color: [u8; 3],
}

impl Vertex {
    /// Vertex at normalized device coordinates with w = 1.0
    pub fn from_ndc(x: f32, y: f32, z: f32, color: [u8; 3]) -> Self {
        let fx = |v: f32| (v * 4096.0).round() as i32;
        Self {
            position: [fx(x), fx(y), fx(z), 4096],
            tex_coord: [0, 0],
            color,
        }
    }

    pub fn with_tex_coord(self, s: f32, t: f32) -> Self {
        Self {
            tex_coord: [(s * 16.0).round() as i16, (t * 16.0).round() as i16],
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolygonMode {
    Modulate,
    Decal,
    ToonHighlight,
    Shadow,
}

/// The POLYGON_ATTR word
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PolygonAttr(pub u32);

impl PolygonAttr {
    const MODE_SHIFT: u32 = 4;
    const RENDER_BACK: u32 = 1 << 6;
    const RENDER_FRONT: u32 = 1 << 7;
    const TRANSLUCENT_DEPTH_WRITE: u32 = 1 << 11;
    const FAR_PLANE: u32 = 1 << 12;
    const ONE_DOT: u32 = 1 << 13;
    const DEPTH_EQUAL: u32 = 1 << 14;
    const FOG: u32 = 1 << 15;
    const ALPHA_SHIFT: u32 = 16;
    const ID_SHIFT: u32 = 24;

    /// Attribute for a front-and-back rendered polygon with the given mode, alpha and ID
    pub fn new(mode: PolygonMode, alpha: u8, id: u8) -> Self {
        let mode_bits = match mode {
            PolygonMode::Modulate => 0,
            PolygonMode::Decal => 1,
            PolygonMode::ToonHighlight => 2,
            PolygonMode::Shadow => 3,
        };
        Self(
            (mode_bits << Self::MODE_SHIFT)
                | Self::RENDER_BACK
                | Self::RENDER_FRONT
                | (((alpha & 0x1F) as u32) << Self::ALPHA_SHIFT)
                | (((id & 0x3F) as u32) << Self::ID_SHIFT),
        )
    }

    #[inline]
    pub fn mode(self) -> PolygonMode {
        match (self.0 >> Self::MODE_SHIFT) & 3 {
            0 => PolygonMode::Modulate,
            1 => PolygonMode::Decal,
            2 => PolygonMode::ToonHighlight,
            _ => PolygonMode::Shadow,
        }
    }

    #[inline]
    pub fn render_back(self) -> bool {
        self.0 & Self::RENDER_BACK != 0
    }
    #[inline]
    pub fn render_front(self) -> bool {
        self.0 & Self::RENDER_FRONT != 0
    }
    #[inline]
    pub fn translucent_depth_write(self) -> bool {
        self.0 & Self::TRANSLUCENT_DEPTH_WRITE != 0
    }
    #[inline]
    pub fn far_plane_intersecting(self) -> bool {
        self.0 & Self::FAR_PLANE != 0
    }
    #[inline]
    pub fn one_dot(self) -> bool {
        self.0 & Self::ONE_DOT != 0
    }
    #[inline]
    pub fn depth_equal(self) -> bool {
        self.0 & Self::DEPTH_EQUAL != 0
    }
    #[inline]
    pub fn fog_enabled(self) -> bool {
        self.0 & Self::FOG != 0
    }
    /// 5-bit alpha; 0 means wireframe
    #[inline]
    pub fn alpha(self) -> u8 {
        ((self.0 >> Self::ALPHA_SHIFT) & 0x1F) as u8
    }
    #[inline]
    pub fn polygon_id(self) -> u8 {
        ((self.0 >> Self::ID_SHIFT) & 0x3F) as u8
    }
    #[inline]
    pub fn is_wireframe(self) -> bool {
        self.alpha() == 0
    }

    pub fn with_depth_equal(self, on: bool) -> Self {
        self.with_bit(Self::DEPTH_EQUAL, on)
    }
    pub fn with_fog(self, on: bool) -> Self {
        self.with_bit(Self::FOG, on)
    }
    pub fn with_translucent_depth_write(self, on: bool) -> Self {
        self.with_bit(Self::TRANSLUCENT_DEPTH_WRITE, on)
    }

    fn with_bit(self, bit: u32, on: bool) -> Self {
        if on {
            Self(self.0 | bit)
        } else {
            Self(self.0 & !bit)
        }
    }
}

/// Viewport in native coordinates; `y` counts up from the bottom of the screen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            x: 0,
            y: 0,
            width: NATIVE_WIDTH as u16,
            height: NATIVE_HEIGHT as u16,
        }
    }
}

/// A polygon as submitted to the geometry engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Polygon {
    pub vertex_count: u8,
    pub attr: PolygonAttr,
    pub tex_params: TexParams,
    pub tex_palette: u32,
    pub viewport: Viewport,
}

impl Polygon {
    /// Translucent polygons are drawn after all opaque ones
    pub fn is_translucent(&self) -> bool {
        let alpha = self.attr.alpha();
        (alpha > 0 && alpha < 31) || self.tex_params.has_alpha_texels()
    }
}

/// A polygon after clipping, referring to vertices by index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClippedPolygon {
    /// Index into [`GeometryList::polygons`]
    pub poly_index: u16,
    pub vertex_indices: [u16; MAX_CLIPPED_VERTS],
    pub vertex_count: u8,
    pub back_facing: bool,
}

impl ClippedPolygon {
    pub fn new(poly_index: u16, indices: &[u16], back_facing: bool) -> Self {
        let mut vertex_indices = [0u16; MAX_CLIPPED_VERTS];
        let count = indices.len().min(MAX_CLIPPED_VERTS);
        vertex_indices[..count].copy_from_slice(&indices[..count]);
        Self {
            poly_index,
            vertex_indices,
            vertex_count: count as u8,
            back_facing,
        }
    }

    pub fn indices(&self) -> &[u16] {
        &self.vertex_indices[..self.vertex_count as usize]
    }
}

/// Everything the renderer reads for one frame
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeometryList {
    pub vertices: Vec<Vertex>,
    pub polygons: Vec<Polygon>,
    /// Opaque polygons first, then translucent ones
    pub clipped: Vec<ClippedPolygon>,
    pub opaque_count: usize,
    #[serde(skip)]
    pub texture_memory: Arc<TextureMemory>,
}

impl GeometryList {
    pub fn polygon(&self, clipped: &ClippedPolygon) -> &Polygon {
        &self.polygons[clipped.poly_index as usize]
    }

    /// Append a polygon together with its vertices and return its clipped index
    pub fn push_polygon(&mut self, poly: Polygon, vertices: &[Vertex], back_facing: bool) -> usize {
        let first = self.vertices.len() as u16;
        self.vertices.extend_from_slice(vertices);
        let indices: Vec<u16> = (0..vertices.len() as u16).map(|i| first + i).collect();
        let poly_index = self.polygons.len() as u16;
        self.polygons.push(Polygon {
            vertex_count: vertices.len() as u8,
            ..poly
        });
        self.clipped
            .push(ClippedPolygon::new(poly_index, &indices, back_facing));
        self.clipped.len() - 1
    }

    /// Stable partition into opaque-then-translucent order and set `opaque_count`
    pub fn sort_translucent_last(&mut self) {
        let polygons = &self.polygons;
        let (opaque, translucent): (Vec<ClippedPolygon>, Vec<ClippedPolygon>) =
            std::mem::take(&mut self.clipped)
                .into_iter()
                .partition(|c| !polygons[c.poly_index as usize].is_translucent());
        self.opaque_count = opaque.len();
        self.clipped = opaque.into_iter().chain(translucent).collect();
    }

    /// Reject lists that exceed console limits or reference missing data
    pub fn validate(&self) -> Render3DResult<()> {
        if self.vertices.len() > VERTLIST_SIZE {
            return Err(Render3DError::InvalidValue(format!(
                "{} vertices exceeds the limit of {}",
                self.vertices.len(),
                VERTLIST_SIZE
            )));
        }
        if self.polygons.len() > POLYLIST_SIZE || self.clipped.len() > CLIPPED_POLYLIST_SIZE {
            return Err(Render3DError::InvalidValue(format!(
                "{} polygons / {} clipped polygons exceeds the frame limit",
                self.polygons.len(),
                self.clipped.len()
            )));
        }
        if self.opaque_count > self.clipped.len() {
            return Err(Render3DError::InvalidValue(format!(
                "opaque count {} larger than polygon count {}",
                self.opaque_count,
                self.clipped.len()
            )));
        }
        for (i, clipped) in self.clipped.iter().enumerate() {
            if clipped.poly_index as usize >= self.polygons.len() {
                return Err(Render3DError::InvalidValue(format!(
                    "clipped polygon {} refers to missing polygon {}",
                    i, clipped.poly_index
                )));
            }
            if clipped.vertex_count as usize > MAX_CLIPPED_VERTS
                || clipped
                    .indices()
                    .iter()
                    .any(|&v| v as usize >= self.vertices.len())
            {
                return Err(Render3DError::InvalidValue(format!(
                    "clipped polygon {} has an invalid vertex reference",
                    i
                )));
            }
        }
        Ok(())
    }
}

/// A vertex in framebuffer space, ready for scan conversion
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScreenVertex {
    pub x: f32,
    pub y: f32,
    /// z / w mapped to [0, 1]
    pub z: f32,
    /// 1 / w with w in 20.12 units
    pub inv_w: f32,
    /// Texture coordinate in texels, divided by w
    pub s_w: f32,
    pub t_w: f32,
    /// Vertex color (6-bit scale), divided by w
    pub color_w: [f32; 3],
}

/// Project a clip-space vertex through its viewport onto a framebuffer of the given size
pub fn project(v: &Vertex, viewport: &Viewport, fb_width: usize, fb_height: usize) -> ScreenVertex {
    let w = if v.position[3] == 0 {
        1.0
    } else {
        v.position[3] as f32
    };
    let ndc_x = v.position[0] as f32 / w;
    let ndc_y = v.position[1] as f32 / w;
    let ndc_z = v.position[2] as f32 / w;

    let scale_x = fb_width as f32 / NATIVE_WIDTH as f32;
    let scale_y = fb_height as f32 / NATIVE_HEIGHT as f32;
    let top = NATIVE_HEIGHT as f32 - viewport.y as f32 - viewport.height as f32;

    let inv_w = 1.0 / w.abs();
    ScreenVertex {
        x: ((ndc_x + 1.0) * viewport.width as f32 * 0.5 + viewport.x as f32) * scale_x,
        y: ((1.0 - ndc_y) * viewport.height as f32 * 0.5 + top) * scale_y,
        z: ((ndc_z + 1.0) * 0.5).clamp(0.0, 1.0),
        inv_w,
        s_w: v.tex_coord[0] as f32 / 16.0 * inv_w,
        t_w: v.tex_coord[1] as f32 / 16.0 * inv_w,
        color_w: [
            v.color[0] as f32 * inv_w,
            v.color[1] as f32 * inv_w,
            v.color[2] as f32 * inv_w,
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::texture::TextureFormat;

    fn quad(list: &mut GeometryList, attr: PolygonAttr) -> usize {
        let v = [
            Vertex::from_ndc(-1.0, 1.0, 0.0, [63, 0, 0]),
            Vertex::from_ndc(1.0, 1.0, 0.0, [63, 0, 0]),
            Vertex::from_ndc(1.0, -1.0, 0.0, [63, 0, 0]),
            Vertex::from_ndc(-1.0, -1.0, 0.0, [63, 0, 0]),
        ];
        list.push_polygon(
            Polygon {
                attr,
                ..Default::default()
            },
            &v,
            false,
        )
    }

    #[test]
    fn test_polygon_attr_fields() {
        let attr = PolygonAttr::new(PolygonMode::Shadow, 17, 42)
            .with_depth_equal(true)
            .with_fog(true);
        assert_eq!(attr.mode(), PolygonMode::Shadow);
        assert_eq!(attr.alpha(), 17);
        assert_eq!(attr.polygon_id(), 42);
        assert!(attr.depth_equal());
        assert!(attr.fog_enabled());
        assert!(!attr.translucent_depth_write());
        assert!(PolygonAttr::new(PolygonMode::Modulate, 0, 1).is_wireframe());
    }

    #[test]
    fn test_translucency_classification() {
        let mut poly = Polygon {
            attr: PolygonAttr::new(PolygonMode::Modulate, 31, 1),
            ..Default::default()
        };
        assert!(!poly.is_translucent());
        poly.attr = PolygonAttr::new(PolygonMode::Modulate, 15, 1);
        assert!(poly.is_translucent());
        poly.attr = PolygonAttr::new(PolygonMode::Modulate, 31, 1);
        poly.tex_params = TexParams::new(TextureFormat::A5I3, 0, 0, 0);
        assert!(poly.is_translucent());
        // wireframe polygons are opaque
        poly.attr = PolygonAttr::new(PolygonMode::Modulate, 0, 1);
        poly.tex_params = TexParams(0);
        assert!(!poly.is_translucent());
    }

    #[test]
    fn test_sort_translucent_last_is_stable() {
        let mut list = GeometryList::default();
        quad(&mut list, PolygonAttr::new(PolygonMode::Modulate, 10, 1));
        quad(&mut list, PolygonAttr::new(PolygonMode::Modulate, 31, 2));
        quad(&mut list, PolygonAttr::new(PolygonMode::Modulate, 12, 3));
        quad(&mut list, PolygonAttr::new(PolygonMode::Modulate, 31, 4));
        list.sort_translucent_last();

        let ids: Vec<u8> = list
            .clipped
            .iter()
            .map(|c| list.polygon(c).attr.polygon_id())
            .collect();
        assert_eq!(ids, vec![2, 4, 1, 3]);
        assert_eq!(list.opaque_count, 2);
        assert!(list.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_indices() {
        let mut list = GeometryList::default();
        quad(&mut list, PolygonAttr::new(PolygonMode::Modulate, 31, 1));
        list.clipped[0].vertex_indices[2] = 99;
        assert!(matches!(
            list.validate(),
            Err(Render3DError::InvalidValue(_))
        ));

        let mut list = GeometryList::default();
        quad(&mut list, PolygonAttr::new(PolygonMode::Modulate, 31, 1));
        list.opaque_count = 5;
        assert!(list.validate().is_err());
    }

    #[test]
    fn test_project_full_viewport_corners() {
        let vp = Viewport::default();
        let top_left = project(&Vertex::from_ndc(-1.0, 1.0, -1.0, [0; 3]), &vp, 256, 192);
        assert_eq!((top_left.x, top_left.y, top_left.z), (0.0, 0.0, 0.0));

        let bottom_right = project(&Vertex::from_ndc(1.0, -1.0, 1.0, [0; 3]), &vp, 512, 384);
        assert_eq!((bottom_right.x, bottom_right.y, bottom_right.z), (512.0, 384.0, 1.0));
    }

    #[test]
    fn test_project_viewport_origin_is_bottom_left() {
        // lower-left quarter of the screen
        let vp = Viewport {
            x: 0,
            y: 0,
            width: 128,
            height: 96,
        };
        let v = project(&Vertex::from_ndc(-1.0, 1.0, 0.0, [0; 3]), &vp, 256, 192);
        assert_eq!((v.x, v.y), (0.0, 96.0));
    }
}
