//! Frame-wide render state
//!
//! Register state latched by the geometry engine at the start of a frame: fog, toon and edge
//! tables, alpha test, clear values and the optional clear image.

use emu_core::graphics::depth::expand_depth15;
use emu_core::graphics::Color4u8;
use serde::{Deserialize, Serialize};

use crate::fragment::{FragmentAttributes, PolyFacing, UNSET_TRANSLUCENT_POLY_ID};
use crate::side_channel::SideChannel;
use crate::texture::TextureMemory;
use crate::{NATIVE_HEIGHT, NATIVE_WIDTH};

/// Rear-plane color bitmap in texture VRAM
const CLEAR_IMAGE_COLOR_BASE: usize = 0x40000;
/// Rear-plane depth bitmap in texture VRAM
const CLEAR_IMAGE_DEPTH_BASE: usize = 0x60000;

/// What toon/highlight polygons do with the toon table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShadingMode {
    #[default]
    Toon,
    Highlight,
}

/// Clear image scroll offsets, in native pixels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearImage {
    pub scroll_x: u8,
    pub scroll_y: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderState {
    pub enable_texturing: bool,
    pub shading: ShadingMode,
    pub enable_alpha_test: bool,
    /// Fragments with alpha at or below this 5-bit value are discarded
    pub alpha_test_ref: u8,
    pub enable_alpha_blending: bool,
    pub enable_antialiasing: bool,
    pub enable_edge_marking: bool,

    pub enable_fog: bool,
    pub fog_alpha_only: bool,
    pub fog_shift: u8,
    pub fog_offset: u16,
    /// RGB555 fog color
    pub fog_color: u16,
    pub fog_alpha: u8,
    /// 7-bit densities
    pub fog_density: [u8; 32],

    /// RGB555 entries indexed by vertex red / 2
    pub toon_table: [u16; 32],
    /// RGB555 entries indexed by polygon ID / 8
    pub edge_colors: [u16; 8],

    /// Depth from W instead of Z
    pub w_buffer: bool,

    /// RGB555 clear color
    pub clear_color: u16,
    pub clear_alpha: u8,
    pub clear_fog: bool,
    pub clear_poly_id: u8,
    /// 15-bit clear depth
    pub clear_depth: u16,
    pub clear_image: Option<ClearImage>,
}

impl Default for RenderState {
    fn default() -> Self {
        Self {
            enable_texturing: true,
            shading: ShadingMode::Toon,
            enable_alpha_test: false,
            alpha_test_ref: 0,
            enable_alpha_blending: true,
            enable_antialiasing: false,
            enable_edge_marking: false,
            enable_fog: false,
            fog_alpha_only: false,
            fog_shift: 0,
            fog_offset: 0,
            fog_color: 0,
            fog_alpha: 0,
            fog_density: [0; 32],
            toon_table: [0; 32],
            edge_colors: [0; 8],
            w_buffer: false,
            clear_color: 0,
            clear_alpha: 0,
            clear_fog: false,
            clear_poly_id: 0,
            clear_depth: 0x7FFF,
            clear_image: None,
        }
    }
}

impl RenderState {
    pub fn clear_color_6665(&self) -> Color4u8 {
        Color4u8::from_rgb555(self.clear_color, self.clear_alpha)
    }

    pub fn clear_depth24(&self) -> u32 {
        expand_depth15(self.clear_depth)
    }

    pub fn fog_color_6665(&self) -> Color4u8 {
        Color4u8::from_rgb555(self.fog_color, self.fog_alpha)
    }

    /// Toon table widened to 6665
    pub fn toon_colors(&self) -> [Color4u8; 32] {
        self.toon_table.map(|c| Color4u8::from_rgb555(c, 31))
    }

    /// Edge colors widened to 6665; half alpha when antialiasing
    pub fn edge_colors_6665(&self) -> [Color4u8; 8] {
        let alpha = if self.enable_antialiasing { 16 } else { 31 };
        self.edge_colors.map(|c| Color4u8::from_rgb555(c, alpha))
    }

    /// Attributes of an untouched pixel when no clear image is used
    pub fn clear_attributes(&self) -> FragmentAttributes {
        FragmentAttributes {
            depth: self.clear_depth24(),
            opaque_poly_id: self.clear_poly_id & SideChannel::POLY_ID_MASK,
            translucent_poly_id: UNSET_TRANSLUCENT_POLY_ID,
            side: SideChannel::opaque(self.clear_poly_id),
            is_fogged: self.clear_fog,
            is_translucent: false,
            is_wireframe: false,
            facing: PolyFacing::Unwritten,
        }
    }

    /// Clear color and attributes for framebuffer pixel (x, y)
    ///
    /// With a clear image the values come from the rear-plane bitmaps, sampled at the native
    /// pixel that covers (x, y) and offset by the scroll registers.
    pub fn clear_fragment(
        &self,
        mem: &TextureMemory,
        x: usize,
        y: usize,
        fb_width: usize,
        fb_height: usize,
    ) -> (Color4u8, FragmentAttributes) {
        let Some(image) = self.clear_image else {
            return (self.clear_color_6665(), self.clear_attributes());
        };
        let nx = x * NATIVE_WIDTH / fb_width.max(1) + image.scroll_x as usize;
        let ny = y * NATIVE_HEIGHT / fb_height.max(1) + image.scroll_y as usize;

        let color_word = mem.rear_plane_u16(CLEAR_IMAGE_COLOR_BASE, nx, ny);
        let depth_word = mem.rear_plane_u16(CLEAR_IMAGE_DEPTH_BASE, nx, ny);
        let alpha = if color_word & 0x8000 != 0 { 31 } else { 0 };
        let color = Color4u8::from_rgb555(color_word, alpha);
        let attr = FragmentAttributes {
            depth: expand_depth15(depth_word),
            is_fogged: depth_word & 0x8000 != 0,
            ..self.clear_attributes()
        };
        (color, attr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emu_core::graphics::depth::DEPTH_MAX;

    #[test]
    fn test_flat_clear_values() {
        let state = RenderState {
            clear_color: 0x001F,
            clear_alpha: 31,
            clear_poly_id: 0x3F,
            clear_fog: true,
            ..Default::default()
        };
        let mem = TextureMemory::default();
        let (color, attr) = state.clear_fragment(&mem, 10, 10, 256, 192);
        assert_eq!(color, Color4u8::new(63, 0, 0, 31));
        assert_eq!(attr.depth, DEPTH_MAX);
        assert_eq!(attr.opaque_poly_id, 0x3F);
        assert_eq!(attr.side.poly_id(), 0x3F);
        assert!(attr.is_fogged);
    }

    #[test]
    fn test_clear_image_reads_rear_plane_with_scroll() {
        let mut mem = TextureMemory::default();
        // native pixel (3, 1) after scrolling by (1, 1) from (2, 0)
        let offset = (256 + 3) * 2;
        mem.texture[CLEAR_IMAGE_COLOR_BASE + offset..CLEAR_IMAGE_COLOR_BASE + offset + 2]
            .copy_from_slice(&0x83E0u16.to_le_bytes());
        mem.texture[CLEAR_IMAGE_DEPTH_BASE + offset..CLEAR_IMAGE_DEPTH_BASE + offset + 2]
            .copy_from_slice(&0x8001u16.to_le_bytes());
        let state = RenderState {
            clear_image: Some(ClearImage {
                scroll_x: 1,
                scroll_y: 1,
            }),
            ..Default::default()
        };

        // framebuffer at 2x: pixel (4, 1) is native (2, 0)
        let (color, attr) = state.clear_fragment(&mem, 4, 1, 512, 384);
        assert_eq!(color, Color4u8::new(0, 63, 0, 31));
        assert_eq!(attr.depth, 0x200);
        assert!(attr.is_fogged);
    }

    #[test]
    fn test_edge_colors_antialias_alpha() {
        let mut state = RenderState::default();
        assert_eq!(state.edge_colors_6665()[0].a, 31);
        state.enable_antialiasing = true;
        assert_eq!(state.edge_colors_6665()[0].a, 16);
    }
}
