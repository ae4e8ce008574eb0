//! Texture decoding and caching
//!
//! Textures live in a 512 KiB texture VRAM snapshot plus a 96 KiB palette snapshot. A polygon's
//! texture parameter word selects one of eight formats; decoding produces a flat buffer of
//! 6665 texels that both backends sample from (the GPU backend widens it to 8888 on upload).
//!
//! Decoded textures are cached by their parameter words and a CRC32 of the bytes they were
//! decoded from, so rewritten VRAM never serves a stale texture even without an explicit
//! invalidation.

use std::collections::HashMap;
use std::sync::Arc;

use emu_core::graphics::Color4u8;
use emu_core::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};

pub const TEXTURE_VRAM_SIZE: usize = 512 * 1024;
pub const PALETTE_VRAM_SIZE: usize = 96 * 1024;

/// 4x4-compressed textures keep their per-block palette info in the second VRAM slot
const COMPRESSED_INFO_BASE: usize = 0x20000;

/// Above this many entries the cache starts over
const MAX_CACHE_ENTRIES: usize = 4096;

/// Texture and palette memory as seen by the 3D engine for one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureMemory {
    pub texture: Vec<u8>,
    pub palette: Vec<u8>,
}

impl Default for TextureMemory {
    fn default() -> Self {
        Self {
            texture: vec![0; TEXTURE_VRAM_SIZE],
            palette: vec![0; PALETTE_VRAM_SIZE],
        }
    }
}

impl TextureMemory {
    #[inline]
    fn tex_u8(&self, addr: usize) -> u8 {
        self.texture[addr % self.texture.len().max(1)]
    }

    #[inline]
    fn tex_u16(&self, addr: usize) -> u16 {
        u16::from_le_bytes([self.tex_u8(addr), self.tex_u8(addr + 1)])
    }

    #[inline]
    fn tex_u32(&self, addr: usize) -> u32 {
        (self.tex_u16(addr) as u32) | ((self.tex_u16(addr + 2) as u32) << 16)
    }

    #[inline]
    fn palette_u16(&self, addr: usize) -> u16 {
        let len = self.palette.len().max(1);
        u16::from_le_bytes([self.palette[addr % len], self.palette[(addr + 1) % len]])
    }

    /// Bytes `[start, start + len)` of `mem` with wraparound, as contiguous slices
    fn wrapped_slices(mem: &[u8], start: usize, len: usize) -> impl Iterator<Item = &[u8]> + '_ {
        let size = mem.len();
        let mut pos = if size == 0 { 0 } else { start % size };
        let mut left = if size == 0 { 0 } else { len };
        std::iter::from_fn(move || {
            if left == 0 {
                return None;
            }
            let take = left.min(size - pos);
            let chunk = &mem[pos..pos + take];
            left -= take;
            pos = (pos + take) % size;
            Some(chunk)
        })
    }

    fn texture_slices(&self, start: usize, len: usize) -> impl Iterator<Item = &[u8]> + '_ {
        Self::wrapped_slices(&self.texture, start, len)
    }

    fn palette_slices(&self, start: usize, len: usize) -> impl Iterator<Item = &[u8]> + '_ {
        Self::wrapped_slices(&self.palette, start, len)
    }

    /// Rear-plane bitmap word at (x, y) of a 256x256 RGB555 image stored at `base`
    pub fn rear_plane_u16(&self, base: usize, x: usize, y: usize) -> u16 {
        self.tex_u16(base + ((y & 0xFF) * 256 + (x & 0xFF)) * 2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TextureFormat {
    None = 0,
    A3I5 = 1,
    Palette4 = 2,
    Palette16 = 3,
    Palette256 = 4,
    Compressed4x4 = 5,
    A5I3 = 6,
    Direct = 7,
}

impl TextureFormat {
    fn from_bits(bits: u32) -> Self {
        match bits & 7 {
            1 => TextureFormat::A3I5,
            2 => TextureFormat::Palette4,
            3 => TextureFormat::Palette16,
            4 => TextureFormat::Palette256,
            5 => TextureFormat::Compressed4x4,
            6 => TextureFormat::A5I3,
            7 => TextureFormat::Direct,
            _ => TextureFormat::None,
        }
    }

    /// Bits per texel in texture VRAM (the 4x4 format also reads its info slot)
    fn bits_per_texel(self) -> usize {
        match self {
            TextureFormat::None => 0,
            TextureFormat::Palette4 | TextureFormat::Compressed4x4 => 2,
            TextureFormat::Palette16 => 4,
            TextureFormat::A3I5 | TextureFormat::Palette256 | TextureFormat::A5I3 => 8,
            TextureFormat::Direct => 16,
        }
    }

    /// Palette entries addressed by the format
    fn palette_entries(self) -> usize {
        match self {
            TextureFormat::Palette4 => 4,
            TextureFormat::Palette16 => 16,
            TextureFormat::A3I5 => 32,
            TextureFormat::A5I3 => 8,
            TextureFormat::Palette256 => 256,
            // block palettes may point anywhere in the palette
            TextureFormat::Compressed4x4 => PALETTE_VRAM_SIZE / 2,
            TextureFormat::None | TextureFormat::Direct => 0,
        }
    }
}

/// The TEXIMAGE_PARAM word of a polygon
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TexParams(pub u32);

impl TexParams {
    #[inline]
    pub fn vram_offset(self) -> usize {
        ((self.0 & 0xFFFF) as usize) << 3
    }
    #[inline]
    pub fn repeat_s(self) -> bool {
        self.0 & (1 << 16) != 0
    }
    #[inline]
    pub fn repeat_t(self) -> bool {
        self.0 & (1 << 17) != 0
    }
    #[inline]
    pub fn flip_s(self) -> bool {
        self.0 & (1 << 18) != 0
    }
    #[inline]
    pub fn flip_t(self) -> bool {
        self.0 & (1 << 19) != 0
    }
    #[inline]
    pub fn width(self) -> usize {
        8 << ((self.0 >> 20) & 7)
    }
    #[inline]
    pub fn height(self) -> usize {
        8 << ((self.0 >> 23) & 7)
    }
    #[inline]
    pub fn format(self) -> TextureFormat {
        TextureFormat::from_bits(self.0 >> 26)
    }
    #[inline]
    pub fn color0_transparent(self) -> bool {
        self.0 & (1 << 29) != 0
    }

    /// A3I5 and A5I3 carry per-texel alpha and get the split opaque/translucent draw
    pub fn has_alpha_texels(self) -> bool {
        matches!(self.format(), TextureFormat::A3I5 | TextureFormat::A5I3)
    }

    /// Builder used by tests and demo scenes
    pub fn new(format: TextureFormat, width_log: u32, height_log: u32, vram_offset: usize) -> Self {
        Self(
            ((vram_offset as u32 >> 3) & 0xFFFF)
                | ((width_log & 7) << 20)
                | ((height_log & 7) << 23)
                | ((format as u32) << 26),
        )
    }

    pub fn with_repeat(self, s: bool, t: bool) -> Self {
        Self((self.0 & !(3 << 16)) | ((s as u32) << 16) | ((t as u32) << 17))
    }

    pub fn with_flip(self, s: bool, t: bool) -> Self {
        Self((self.0 & !(3 << 18)) | ((s as u32) << 18) | ((t as u32) << 19))
    }

    pub fn with_color0_transparent(self, transparent: bool) -> Self {
        Self((self.0 & !(1 << 29)) | ((transparent as u32) << 29))
    }

    /// Bits that affect decoded texels (wrap mode and texcoord transform only affect sampling)
    fn decode_bits(self) -> u32 {
        self.0 & !(0xF << 16) & !(3 << 30)
    }
}

/// A decoded texture in 6665
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTexture {
    pub width: usize,
    pub height: usize,
    pub texels: Vec<Color4u8>,
}

#[inline]
fn wrap_coord(coord: i32, size: usize, repeat: bool, flip: bool) -> usize {
    let size = size as i32;
    if !repeat {
        return coord.clamp(0, size - 1) as usize;
    }
    if flip {
        let m = coord.rem_euclid(size * 2);
        (if m >= size { size * 2 - 1 - m } else { m }) as usize
    } else {
        coord.rem_euclid(size) as usize
    }
}

impl DecodedTexture {
    /// Nearest texel at integer texel coordinates, wrapped per the parameter word
    #[inline]
    pub fn sample(&self, params: TexParams, s: i32, t: i32) -> Color4u8 {
        let x = wrap_coord(s, self.width, params.repeat_s(), params.flip_s());
        let y = wrap_coord(t, self.height, params.repeat_t(), params.flip_t());
        self.texels[y * self.width + x]
    }

    /// Texels widened to RGBA8 bytes for GPU upload
    pub fn to_rgba8(&self) -> Vec<u8> {
        self.texels
            .iter()
            .flat_map(|c| {
                let w = c.to_8888();
                [w.r, w.g, w.b, w.a]
            })
            .collect()
    }
}

/// Palette base address in bytes for a format
fn palette_address(format: TextureFormat, palette: u32) -> usize {
    let base = (palette & 0x1FFF) as usize;
    if format == TextureFormat::Palette4 {
        base << 3
    } else {
        base << 4
    }
}

/// 4x4-compressed block palette modes blend colors in RGB555 space
fn mix555(c0: u16, c1: u16, w0: u16, w1: u16) -> u16 {
    let total = w0 + w1;
    let ch = |shift: u16| {
        let a = (c0 >> shift) & 0x1F;
        let b = (c1 >> shift) & 0x1F;
        ((a * w0 + b * w1) / total) << shift
    };
    ch(0) | ch(5) | ch(10)
}

/// Decode a texture from VRAM; `None` for polygons without a texture format
pub fn decode(params: TexParams, palette: u32, mem: &TextureMemory) -> Option<DecodedTexture> {
    let format = params.format();
    if format == TextureFormat::None {
        return None;
    }

    let (width, height) = (params.width(), params.height());
    let base = params.vram_offset();
    let pal_base = palette_address(format, palette);
    let opaque = |color: u16| Color4u8::from_rgb555(color, 31);
    let mut texels = Vec::with_capacity(width * height);

    match format {
        TextureFormat::None => {}
        TextureFormat::A3I5 | TextureFormat::A5I3 => {
            let (index_bits, index_mask) = if format == TextureFormat::A3I5 {
                (5, 0x1F)
            } else {
                (3, 0x07)
            };
            for i in 0..width * height {
                let byte = mem.tex_u8(base + i);
                let index = (byte & index_mask) as usize;
                let alpha = byte >> index_bits;
                let alpha = if format == TextureFormat::A3I5 {
                    (alpha << 2) | (alpha >> 1)
                } else {
                    alpha
                };
                let color = mem.palette_u16(pal_base + index * 2);
                texels.push(Color4u8::from_rgb555(color, alpha));
            }
        }
        TextureFormat::Palette4 | TextureFormat::Palette16 | TextureFormat::Palette256 => {
            let bits = format.bits_per_texel();
            let per_byte = 8 / bits;
            let mask = ((1u16 << bits) - 1) as u8;
            for i in 0..width * height {
                let byte = mem.tex_u8(base + i / per_byte);
                let index = (byte >> ((i % per_byte) * bits)) & mask;
                if index == 0 && params.color0_transparent() {
                    texels.push(Color4u8::TRANSPARENT);
                } else {
                    texels.push(opaque(mem.palette_u16(pal_base + index as usize * 2)));
                }
            }
        }
        TextureFormat::Direct => {
            for i in 0..width * height {
                let color = mem.tex_u16(base + i * 2);
                let alpha = if color & 0x8000 != 0 { 31 } else { 0 };
                texels.push(Color4u8::from_rgb555(color, alpha));
            }
        }
        TextureFormat::Compressed4x4 => {
            texels.resize(width * height, Color4u8::TRANSPARENT);
            let slot_offset = base & 0x1FFFF;
            let info_base = COMPRESSED_INFO_BASE
                + (slot_offset >> 1)
                + if base >= 0x40000 { 0x10000 } else { 0 };
            let blocks_x = width / 4;
            for by in 0..height / 4 {
                for bx in 0..blocks_x {
                    let block = by * blocks_x + bx;
                    let indices = mem.tex_u32(base + block * 4);
                    let info = mem.tex_u16(info_base + block * 2);
                    let block_pal = pal_base + ((info & 0x3FFF) as usize) * 4;
                    let pal = |n: usize| mem.palette_u16(block_pal + n * 2);
                    let colors: [Option<u16>; 4] = match info >> 14 {
                        0 => [Some(pal(0)), Some(pal(1)), Some(pal(2)), None],
                        1 => [
                            Some(pal(0)),
                            Some(pal(1)),
                            Some(mix555(pal(0), pal(1), 1, 1)),
                            None,
                        ],
                        2 => [Some(pal(0)), Some(pal(1)), Some(pal(2)), Some(pal(3))],
                        _ => [
                            Some(pal(0)),
                            Some(pal(1)),
                            Some(mix555(pal(0), pal(1), 5, 3)),
                            Some(mix555(pal(0), pal(1), 3, 5)),
                        ],
                    };
                    for ty in 0..4 {
                        for tx in 0..4 {
                            let sel = (indices >> ((ty * 4 + tx) * 2)) & 3;
                            let x = bx * 4 + tx;
                            let y = by * 4 + ty;
                            texels[y * width + x] = colors[sel as usize]
                                .map_or(Color4u8::TRANSPARENT, opaque);
                        }
                    }
                }
            }
        }
    }

    Some(DecodedTexture {
        width,
        height,
        texels,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TextureKey {
    params: u32,
    palette: u32,
    crc: u32,
}

fn source_crc(params: TexParams, palette: u32, mem: &TextureMemory) -> u32 {
    let format = params.format();
    let base = params.vram_offset();
    let texel_bytes = params.width() * params.height() * format.bits_per_texel() / 8;
    let mut hasher = crc32fast::Hasher::new();
    mem.texture_slices(base, texel_bytes).for_each(|s| hasher.update(s));
    if format == TextureFormat::Compressed4x4 {
        let info_base = COMPRESSED_INFO_BASE + ((base & 0x1FFFF) >> 1);
        mem.texture_slices(info_base, texel_bytes / 2)
            .for_each(|s| hasher.update(s));
    }
    let pal_entries = format.palette_entries();
    if pal_entries > 0 {
        let start = palette_address(format, palette);
        mem.palette_slices(start, pal_entries * 2)
            .for_each(|s| hasher.update(s));
    }
    hasher.finalize()
}

/// Decoded textures shared between frames
///
/// Source bytes are hashed once per (parameters, palette) pair per frame; texture memory is a
/// per-frame snapshot, so [`TextureCache::begin_frame`] must run before each frame's lookups.
#[derive(Debug, Default)]
pub struct TextureCache {
    entries: HashMap<TextureKey, Arc<DecodedTexture>>,
    frame_crcs: HashMap<(u32, u32), u32>,
    misses: u64,
    hashes: u64,
}

impl TextureCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget this frame's source hashes
    pub fn begin_frame(&mut self) {
        self.frame_crcs.clear();
    }

    /// Decoded texture for the parameters, decoding on first use or when its bytes changed
    pub fn get_or_decode(
        &mut self,
        params: TexParams,
        palette: u32,
        mem: &TextureMemory,
    ) -> Option<Arc<DecodedTexture>> {
        if params.format() == TextureFormat::None {
            return None;
        }
        let (params_bits, palette_bits) = (params.decode_bits(), palette & 0x1FFF);
        let crc = match self.frame_crcs.get(&(params_bits, palette_bits)) {
            Some(&crc) => crc,
            None => {
                let crc = source_crc(params, palette, mem);
                self.hashes += 1;
                self.frame_crcs.insert((params_bits, palette_bits), crc);
                crc
            }
        };
        let key = TextureKey {
            params: params_bits,
            palette: palette_bits,
            crc,
        };
        if let Some(texture) = self.entries.get(&key) {
            return Some(Arc::clone(texture));
        }

        if self.entries.len() >= MAX_CACHE_ENTRIES {
            log(LogCategory::Texture, LogLevel::Debug, || {
                format!("texture cache full ({} entries), flushing", self.entries.len())
            });
            self.entries.clear();
        }

        let texture = Arc::new(decode(params, palette, mem)?);
        self.misses += 1;
        log(LogCategory::Texture, LogLevel::Trace, || {
            format!(
                "decoded {:?} {}x{} at {:#07X}",
                params.format(),
                params.width(),
                params.height(),
                params.vram_offset()
            )
        });
        self.entries.insert(key, Arc::clone(&texture));
        Some(texture)
    }

    /// Drop every cached texture (VRAM mapping changed or renderer reset)
    pub fn invalidate(&mut self) {
        self.entries.clear();
        self.frame_crcs.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of decodes performed since creation
    pub fn decode_count(&self) -> u64 {
        self.misses
    }

    /// Number of source hashes computed since creation
    pub fn hash_count(&self) -> u64 {
        self.hashes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_palette(mem: &mut TextureMemory, addr: usize, colors: &[u16]) {
        for (i, c) in colors.iter().enumerate() {
            mem.palette[addr + i * 2..addr + i * 2 + 2].copy_from_slice(&c.to_le_bytes());
        }
    }

    #[test]
    fn test_params_fields() {
        let p = TexParams::new(TextureFormat::Palette16, 1, 2, 0x1000)
            .with_repeat(true, false)
            .with_flip(true, false);
        assert_eq!(p.width(), 16);
        assert_eq!(p.height(), 32);
        assert_eq!(p.vram_offset(), 0x1000);
        assert_eq!(p.format(), TextureFormat::Palette16);
        assert!(p.repeat_s() && !p.repeat_t());
        assert!(p.flip_s() && !p.flip_t());
    }

    #[test]
    fn test_wrap_modes() {
        assert_eq!(wrap_coord(9, 8, false, false), 7);
        assert_eq!(wrap_coord(-3, 8, false, false), 0);
        assert_eq!(wrap_coord(9, 8, true, false), 1);
        assert_eq!(wrap_coord(-1, 8, true, false), 7);
        // mirrored: 8 -> 7, 15 -> 0, 16 -> 0
        assert_eq!(wrap_coord(8, 8, true, true), 7);
        assert_eq!(wrap_coord(15, 8, true, true), 0);
        assert_eq!(wrap_coord(16, 8, true, true), 0);
    }

    #[test]
    fn test_decode_palette4_with_transparent_color0() {
        let mut mem = TextureMemory::default();
        // 8x8 texture: first byte holds texels 0..3 = indices 0,1,2,3
        mem.texture[0] = 0b11_10_01_00;
        write_palette(&mut mem, 0, &[0x001F, 0x03E0, 0x7C00, 0x7FFF]);
        let params = TexParams::new(TextureFormat::Palette4, 0, 0, 0).with_color0_transparent(true);

        let tex = decode(params, 0, &mem).unwrap();
        assert_eq!(tex.texels[0], Color4u8::TRANSPARENT);
        assert_eq!(tex.texels[1], Color4u8::new(0, 63, 0, 31));
        assert_eq!(tex.texels[2], Color4u8::new(0, 0, 63, 31));
        assert_eq!(tex.texels[3], Color4u8::new(63, 63, 63, 31));
    }

    #[test]
    fn test_decode_a3i5_alpha_expansion() {
        let mut mem = TextureMemory::default();
        mem.texture[0] = (7 << 5) | 1;
        mem.texture[1] = (3 << 5) | 1;
        write_palette(&mut mem, 0, &[0, 0x001F]);
        let tex = decode(TexParams::new(TextureFormat::A3I5, 0, 0, 0), 0, &mem).unwrap();
        assert_eq!(tex.texels[0], Color4u8::new(63, 0, 0, 31));
        assert_eq!(tex.texels[1].a, 13);
    }

    #[test]
    fn test_decode_direct_color_alpha_bit() {
        let mut mem = TextureMemory::default();
        mem.texture[0..2].copy_from_slice(&0x801Fu16.to_le_bytes());
        mem.texture[2..4].copy_from_slice(&0x001Fu16.to_le_bytes());
        let tex = decode(TexParams::new(TextureFormat::Direct, 0, 0, 0), 0, &mem).unwrap();
        assert_eq!(tex.texels[0].a, 31);
        assert_eq!(tex.texels[1].a, 0);
    }

    #[test]
    fn test_decode_compressed_block_modes() {
        let mut mem = TextureMemory::default();
        // block 0: all texels select color 2; info word mode 1 (half blend), palette offset 0
        mem.texture[0..4].copy_from_slice(&0xAAAA_AAAAu32.to_le_bytes());
        mem.texture[0x20000..0x20002].copy_from_slice(&(1u16 << 14).to_le_bytes());
        write_palette(&mut mem, 0, &[0x001F, 0x0000]);
        let tex = decode(TexParams::new(TextureFormat::Compressed4x4, 0, 0, 0), 0, &mem).unwrap();
        // (31 + 0) / 2 = 15 -> 31 in six bits
        assert_eq!(tex.texels[0], Color4u8::new(31, 0, 0, 31));
        // color 3 is transparent in mode 1
        mem.texture[0..4].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        let tex = decode(TexParams::new(TextureFormat::Compressed4x4, 0, 0, 0), 0, &mem).unwrap();
        assert_eq!(tex.texels[5], Color4u8::TRANSPARENT);
    }

    #[test]
    fn test_cache_hits_and_detects_rewrites() {
        let mut mem = TextureMemory::default();
        let params = TexParams::new(TextureFormat::Direct, 0, 0, 0);
        let mut cache = TextureCache::new();

        let a = cache.get_or_decode(params, 0, &mem).unwrap();
        let b = cache.get_or_decode(params.with_repeat(true, true), 0, &mem).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.decode_count(), 1);

        mem.texture[0] = 0xFF;
        cache.begin_frame();
        let c = cache.get_or_decode(params, 0, &mem).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.decode_count(), 2);

        cache.invalidate();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_source_hashed_once_per_frame() {
        let mem = TextureMemory::default();
        let params = TexParams::new(TextureFormat::Direct, 0, 0, 0);
        let mut cache = TextureCache::new();
        for _ in 0..2000 {
            cache.get_or_decode(params, 0, &mem).unwrap();
        }
        assert_eq!(cache.hash_count(), 1);
        assert_eq!(cache.decode_count(), 1);

        cache.begin_frame();
        cache.get_or_decode(params, 0, &mem).unwrap();
        assert_eq!(cache.hash_count(), 2);
        assert_eq!(cache.decode_count(), 1);
    }

    #[test]
    fn test_wrapped_slices_cover_the_range() {
        let mem: Vec<u8> = (0..10).collect();
        let chunks: Vec<&[u8]> = TextureMemory::wrapped_slices(&mem, 7, 6).collect();
        assert_eq!(chunks, vec![&[7u8, 8, 9][..], &[0, 1, 2][..]]);
        assert_eq!(TextureMemory::wrapped_slices(&mem, 13, 25).map(<[u8]>::len).sum::<usize>(), 25);
        assert_eq!(TextureMemory::wrapped_slices(&[], 0, 4).count(), 0);
    }

    #[test]
    fn test_untextured_polygon_has_no_texture() {
        let mem = TextureMemory::default();
        let mut cache = TextureCache::new();
        assert!(cache.get_or_decode(TexParams(0), 0, &mem).is_none());
    }
}
