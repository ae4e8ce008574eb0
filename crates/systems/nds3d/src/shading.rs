//! Fragment color combination
//!
//! All math is in 6-bit color and 5-bit alpha.

use emu_core::graphics::color::{MAX_ALPHA5, MAX_COLOR6};
use emu_core::graphics::Color4u8;

use crate::geometry::PolygonMode;
use crate::state::ShadingMode;

#[inline]
fn modulate6(a: u8, b: u8) -> u8 {
    (((a as u16 + 1) * (b as u16 + 1) - 1) >> 6) as u8
}

#[inline]
fn modulate5(a: u8, b: u8) -> u8 {
    (((a as u16 + 1) * (b as u16 + 1) - 1) >> 5) as u8
}

fn modulate(base: [u8; 3], alpha: u8, texel: Option<Color4u8>) -> Color4u8 {
    match texel {
        Some(t) => Color4u8::new(
            modulate6(t.r, base[0]),
            modulate6(t.g, base[1]),
            modulate6(t.b, base[2]),
            modulate5(t.a, alpha),
        ),
        None => Color4u8::new(base[0], base[1], base[2], alpha),
    }
}

/// Combine the interpolated vertex color, the texel (when textured) and the polygon alpha
pub(crate) fn shade(
    mode: PolygonMode,
    shading: ShadingMode,
    toon_table: &[Color4u8; 32],
    vertex: [u8; 3],
    texel: Option<Color4u8>,
    poly_alpha: u8,
) -> Color4u8 {
    let vertex = vertex.map(|c| c.min(MAX_COLOR6));
    let alpha = poly_alpha.min(MAX_ALPHA5);
    match mode {
        PolygonMode::Modulate | PolygonMode::Shadow => modulate(vertex, alpha, texel),
        PolygonMode::Decal => match texel {
            None => Color4u8::new(vertex[0], vertex[1], vertex[2], alpha),
            Some(t) if t.a == 0 => Color4u8::new(vertex[0], vertex[1], vertex[2], alpha),
            Some(t) if t.a >= MAX_ALPHA5 => Color4u8::new(t.r, t.g, t.b, alpha),
            Some(t) => {
                let ta = t.a as u16;
                let mix = |tc: u8, vc: u8| ((tc as u16 * ta + vc as u16 * (31 - ta)) >> 5) as u8;
                Color4u8::new(
                    mix(t.r, vertex[0]),
                    mix(t.g, vertex[1]),
                    mix(t.b, vertex[2]),
                    alpha,
                )
            }
        },
        PolygonMode::ToonHighlight => {
            let toon = toon_table[(vertex[0] >> 1) as usize];
            match shading {
                ShadingMode::Toon => modulate([toon.r, toon.g, toon.b], alpha, texel),
                ShadingMode::Highlight => {
                    let r = vertex[0];
                    let base = modulate([r, r, r], alpha, texel);
                    Color4u8::new(
                        (base.r + toon.r).min(MAX_COLOR6),
                        (base.g + toon.g).min(MAX_COLOR6),
                        (base.b + toon.b).min(MAX_COLOR6),
                        base.a,
                    )
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_TOON: [Color4u8; 32] = [Color4u8::TRANSPARENT; 32];

    #[test]
    fn test_modulate_white_texel_keeps_vertex_color() {
        let texel = Color4u8::new(63, 63, 63, 31);
        let c = shade(PolygonMode::Modulate, ShadingMode::Toon, &NO_TOON, [40, 20, 0], Some(texel), 31);
        assert_eq!(c, Color4u8::new(40, 20, 0, 31));
    }

    #[test]
    fn test_modulate_alpha() {
        let texel = Color4u8::new(63, 63, 63, 15);
        let c = shade(PolygonMode::Modulate, ShadingMode::Toon, &NO_TOON, [63; 3], Some(texel), 31);
        assert_eq!(c.a, 15);
        let c = shade(PolygonMode::Modulate, ShadingMode::Toon, &NO_TOON, [63; 3], None, 12);
        assert_eq!(c, Color4u8::new(63, 63, 63, 12));
    }

    #[test]
    fn test_decal_blends_by_texel_alpha() {
        let v = [0, 0, 62];
        let opaque = Color4u8::new(62, 0, 0, 31);
        let c = shade(PolygonMode::Decal, ShadingMode::Toon, &NO_TOON, v, Some(opaque), 20);
        assert_eq!(c, Color4u8::new(62, 0, 0, 20));

        let clear = Color4u8::new(62, 0, 0, 0);
        let c = shade(PolygonMode::Decal, ShadingMode::Toon, &NO_TOON, v, Some(clear), 20);
        assert_eq!(c, Color4u8::new(0, 0, 62, 20));

        let half = Color4u8::new(62, 0, 0, 16);
        let c = shade(PolygonMode::Decal, ShadingMode::Toon, &NO_TOON, v, Some(half), 20);
        assert_eq!(c, Color4u8::new(31, 0, 29, 20));
    }

    #[test]
    fn test_toon_looks_up_by_red() {
        let mut toon = NO_TOON;
        toon[10] = Color4u8::new(1, 2, 3, 31);
        let c = shade(PolygonMode::ToonHighlight, ShadingMode::Toon, &toon, [21, 0, 0], None, 31);
        assert_eq!(c, Color4u8::new(1, 2, 3, 31));
    }

    #[test]
    fn test_highlight_adds_and_saturates() {
        let mut toon = NO_TOON;
        toon[25] = Color4u8::new(20, 0, 63, 31);
        let c = shade(PolygonMode::ToonHighlight, ShadingMode::Highlight, &toon, [50, 0, 0], None, 31);
        assert_eq!(c, Color4u8::new(63, 50, 63, 31));
    }
}
