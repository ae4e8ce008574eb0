//! Compiles a frame's polygons into ordered side-channel draw passes
//!
//! Each polygon becomes a short list of [`DrawPass`]es chosen by its category (opaque,
//! translucent, shadow mask, shadow, alpha-keyed texture) and the emulation toggles. A
//! [`FramePlan`] strings those lists together with the frame-level steps between the
//! opaque and translucent groups. Both backends execute the same plan.

use std::ops::Range;

use emu_core::graphics::depth::CompareFunc;

use crate::geometry::{GeometryList, Polygon, PolygonMode};
use crate::settings::{Capabilities, RenderSettings};
use crate::side_channel::{
    DrawPass, FragmentFilter, SideChannel, SidePredicate, SideWrite, SideWrites,
};
use crate::state::RenderState;

/// Half-width of the depth-equal window, in 24-bit depth units
pub const DEPTH_EQUAL_TOLERANCE: i32 = 255;

const ID: u8 = SideChannel::POLY_ID_MASK;
const TRANSLUCENT: u8 = SideChannel::TRANSLUCENT_BIT;
const SCRATCH: u8 = SideChannel::SCRATCH_BIT;

use SideWrite::{Keep, Replace, Zero};

/// Toggles that shape a frame plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanOptions {
    /// Side-channel passes available; false selects the simplified path
    pub multipass: bool,
    pub emulate_shadow: bool,
    pub emulate_depth_equal_tolerance: bool,
    pub emulate_facing: bool,
    /// Run the zero-destination-alpha pre-pass before the translucent group
    pub zero_dst_alpha: bool,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            multipass: true,
            emulate_shadow: true,
            emulate_depth_equal_tolerance: true,
            emulate_facing: false,
            zero_dst_alpha: false,
        }
    }
}

impl PlanOptions {
    pub fn new(settings: &RenderSettings, state: &RenderState, caps: &Capabilities) -> Self {
        let clear_may_be_transparent = state.clear_alpha == 0 || state.clear_image.is_some();
        Self {
            multipass: caps.supports_multipass(),
            emulate_shadow: settings.emulate_shadow_polygon,
            emulate_depth_equal_tolerance: settings.emulate_depth_equal_tolerance,
            emulate_facing: settings.emulate_depth_lequal_polygon_facing,
            zero_dst_alpha: settings.emulate_special_zero_alpha_blending
                && state.enable_alpha_blending
                && clear_may_be_transparent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrawGroup {
    Opaque,
    Translucent,
    /// RGB-only pre-pass of translucent polygons into untouched pixels
    ZeroDstAlpha,
}

/// The properties of a polygon that select its passes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolygonClass {
    pub id: u8,
    pub mode: PolygonMode,
    pub translucent: bool,
    pub depth_equal: bool,
    pub translucent_depth_write: bool,
    /// 1-bit or few-bit alpha texture outside decal/shadow modes
    pub alpha_texture: bool,
    /// Some texels can come out fully opaque
    pub can_have_opaque_texels: bool,
    pub back_facing: bool,
    pub wireframe: bool,
    /// Not culled by the front/back render flags
    pub visible: bool,
}

impl PolygonClass {
    pub fn new(poly: &Polygon, back_facing: bool) -> Self {
        let attr = poly.attr;
        let mode = attr.mode();
        Self {
            id: attr.polygon_id(),
            mode,
            translucent: poly.is_translucent(),
            depth_equal: attr.depth_equal(),
            translucent_depth_write: attr.translucent_depth_write(),
            alpha_texture: poly.tex_params.has_alpha_texels()
                && !matches!(mode, PolygonMode::Decal | PolygonMode::Shadow),
            can_have_opaque_texels: attr.alpha() == 31 || attr.is_wireframe(),
            back_facing,
            wireframe: attr.is_wireframe(),
            visible: if back_facing {
                attr.render_back()
            } else {
                attr.render_front()
            },
        }
    }

    fn uses_tolerance(&self, opts: &PlanOptions) -> bool {
        self.depth_equal && opts.emulate_depth_equal_tolerance
    }

    fn base_depth_func(&self, opts: &PlanOptions) -> CompareFunc {
        if self.depth_equal && !opts.emulate_depth_equal_tolerance {
            CompareFunc::Equal
        } else {
            CompareFunc::Less
        }
    }
}

/// Write ID, clear bits 6-7
fn opaque_pass(class: &PolygonClass, depth_func: CompareFunc) -> DrawPass {
    DrawPass::draw(
        SidePredicate::always(class.id),
        SideWrites::new(Keep, Keep, Replace, 0xFF),
        depth_func,
        true,
        false,
    )
}

/// Reject fragments over the same translucent ID, write ID with bit 6
fn translucent_pass(class: &PolygonClass, depth_func: CompareFunc) -> DrawPass {
    DrawPass::draw(
        SidePredicate::new(CompareFunc::NotEqual, TRANSLUCENT | class.id, TRANSLUCENT | ID),
        SideWrites::new(Keep, Keep, Replace, 0xFF),
        depth_func,
        class.translucent_depth_write,
        true,
    )
}

/// Gate `draw` on the fragment lying within the tolerance window of the stored depth
fn push_depth_equal(out: &mut Vec<DrawPass>, draw: DrawPass, class: &PolygonClass, translucent: bool) {
    let filter = draw.filter;
    // bit 7 := frag <= stored + tol
    out.push(
        DrawPass::mask(
            SidePredicate::new(CompareFunc::Always, SCRATCH, SCRATCH),
            SideWrites::new(Zero, Zero, Replace, SCRATCH),
            CompareFunc::LessEqual,
        )
        .with_depth_offset(-DEPTH_EQUAL_TOLERANCE)
        .with_filter(filter),
    );
    // bit 7 &= frag >= stored - tol
    out.push(
        DrawPass::mask(
            SidePredicate::new(CompareFunc::Equal, SCRATCH, SCRATCH),
            SideWrites::new(Zero, Zero, Keep, SCRATCH),
            CompareFunc::GreaterEqual,
        )
        .with_depth_offset(DEPTH_EQUAL_TOLERANCE)
        .with_filter(filter),
    );
    if translucent {
        out.push(
            DrawPass::mask(
                SidePredicate::new(CompareFunc::NotEqual, TRANSLUCENT | class.id, TRANSLUCENT | ID),
                SideWrites::new(Zero, Zero, Keep, SCRATCH),
                CompareFunc::Always,
            )
            .with_filter(filter),
        );
    }
    let reference = if translucent {
        SCRATCH | TRANSLUCENT | class.id
    } else {
        SCRATCH | class.id
    };
    out.push(DrawPass {
        predicate: SidePredicate::new(CompareFunc::Equal, reference, SCRATCH),
        writes: SideWrites::new(Keep, Keep, Replace, TRANSLUCENT | ID),
        depth_func: CompareFunc::Always,
        depth_offset: 0,
        ..draw
    });
    out.push(clear_scratch(filter));
}

fn clear_scratch(filter: FragmentFilter) -> DrawPass {
    DrawPass::mask(
        SidePredicate::always(0),
        SideWrites::new(Keep, Keep, Zero, SCRATCH),
        CompareFunc::Always,
    )
    .with_filter(filter)
}

fn push_opaque(out: &mut Vec<DrawPass>, class: &PolygonClass, opts: &PlanOptions, filter: FragmentFilter) {
    if class.uses_tolerance(opts) {
        push_depth_equal(out, opaque_pass(class, CompareFunc::Less).with_filter(filter), class, false);
        return;
    }
    let base = class.base_depth_func(opts);
    if opts.emulate_facing && filter == FragmentFilter::All && base == CompareFunc::Less {
        if class.back_facing {
            let mut pass = opaque_pass(class, base);
            pass.predicate = SidePredicate::always(TRANSLUCENT | class.id);
            out.push(pass);
            return;
        }
        // front faces win depth ties against back faces drawn earlier in the group
        // writing the ID with a full mask also clears bit 6 wherever the tie is taken
        out.push(DrawPass {
            predicate: SidePredicate::new(CompareFunc::Equal, TRANSLUCENT | class.id, TRANSLUCENT),
            writes: SideWrites::new(Keep, Keep, Replace, 0xFF),
            ..opaque_pass(class, CompareFunc::Equal)
        });
    }
    out.push(opaque_pass(class, base).with_filter(filter));
}

fn push_translucent(
    out: &mut Vec<DrawPass>,
    class: &PolygonClass,
    opts: &PlanOptions,
    filter: FragmentFilter,
) {
    if class.uses_tolerance(opts) {
        push_depth_equal(out, translucent_pass(class, CompareFunc::Less).with_filter(filter), class, true);
        return;
    }
    let base = class.base_depth_func(opts);
    if opts.emulate_facing && !class.back_facing && base == CompareFunc::Less {
        // only over opaque destinations: bit 6 is clear until a translucent polygon lands
        let mut tie = translucent_pass(class, CompareFunc::Equal).with_filter(filter);
        tie.predicate = SidePredicate::new(CompareFunc::NotEqual, TRANSLUCENT | class.id, TRANSLUCENT);
        tie.require_dst_back_facing = true;
        out.push(tie);
    }
    out.push(translucent_pass(class, base).with_filter(filter));
}

fn push_shadow_mask(out: &mut Vec<DrawPass>, class: &PolygonClass, opts: &PlanOptions) {
    let set_on_depth_fail = SideWrites::new(Keep, Replace, Keep, SCRATCH);
    if class.uses_tolerance(opts) {
        out.push(
            DrawPass::mask(
                SidePredicate::new(CompareFunc::Always, SCRATCH, SCRATCH),
                set_on_depth_fail,
                CompareFunc::LessEqual,
            )
            .with_depth_offset(-DEPTH_EQUAL_TOLERANCE),
        );
        out.push(
            DrawPass::mask(
                SidePredicate::new(CompareFunc::NotEqual, SCRATCH, SCRATCH),
                set_on_depth_fail,
                CompareFunc::GreaterEqual,
            )
            .with_depth_offset(DEPTH_EQUAL_TOLERANCE),
        );
        return;
    }
    out.push(DrawPass::mask(
        SidePredicate::new(CompareFunc::Always, SCRATCH, SCRATCH),
        set_on_depth_fail,
        class.base_depth_func(opts),
    ));
}

fn push_shadow(out: &mut Vec<DrawPass>, class: &PolygonClass, group: DrawGroup, opts: &PlanOptions) {
    let translucent = group == DrawGroup::Translucent;

    // no shadow on pixels last written by a polygon with the shadow's own ID
    out.push(DrawPass::mask(
        SidePredicate::new(CompareFunc::NotEqual, class.id, ID),
        SideWrites::new(Zero, Keep, Keep, SCRATCH),
        CompareFunc::Always,
    ));

    let depth_func = if class.uses_tolerance(opts) {
        let clear_on_depth_fail = SideWrites::new(Keep, Zero, Keep, SCRATCH);
        out.push(
            DrawPass::mask(SidePredicate::always(0), clear_on_depth_fail, CompareFunc::LessEqual)
                .with_depth_offset(-DEPTH_EQUAL_TOLERANCE),
        );
        out.push(
            DrawPass::mask(SidePredicate::always(0), clear_on_depth_fail, CompareFunc::GreaterEqual)
                .with_depth_offset(DEPTH_EQUAL_TOLERANCE),
        );
        CompareFunc::Always
    } else {
        class.base_depth_func(opts)
    };

    if translucent {
        out.push(DrawPass::mask(
            SidePredicate::new(CompareFunc::NotEqual, TRANSLUCENT | class.id, TRANSLUCENT | ID),
            SideWrites::new(Zero, Keep, Keep, SCRATCH),
            CompareFunc::Always,
        ));
    }

    let reference = if translucent {
        SCRATCH | TRANSLUCENT | class.id
    } else {
        SCRATCH | class.id
    };
    out.push(DrawPass::mask(
        SidePredicate::new(CompareFunc::Equal, reference, SCRATCH),
        SideWrites::new(Keep, Keep, Replace, TRANSLUCENT | ID),
        depth_func,
    ));

    let depth_write = !translucent || class.translucent_depth_write;
    out.push(DrawPass::draw(
        SidePredicate::new(CompareFunc::Equal, SCRATCH, SCRATCH),
        SideWrites::new(Zero, Zero, Zero, SCRATCH),
        depth_func,
        depth_write,
        translucent,
    ));
}

/// Append the passes that draw one polygon in the given group
pub fn polygon_passes(
    class: &PolygonClass,
    group: DrawGroup,
    opts: &PlanOptions,
    out: &mut Vec<DrawPass>,
) {
    if !class.visible {
        return;
    }
    let is_shadow = class.mode == PolygonMode::Shadow;
    if is_shadow && (!opts.emulate_shadow || !opts.multipass) {
        return;
    }

    if !opts.multipass {
        let depth_func = class.base_depth_func(opts);
        let pass = match group {
            DrawGroup::Opaque => DrawPass::draw(
                SidePredicate::always(class.id),
                SideWrites::NONE,
                depth_func,
                true,
                false,
            ),
            DrawGroup::Translucent => DrawPass::draw(
                SidePredicate::always(TRANSLUCENT | class.id),
                SideWrites::NONE,
                depth_func,
                class.translucent_depth_write,
                true,
            ),
            DrawGroup::ZeroDstAlpha => return,
        };
        out.push(pass);
        return;
    }

    match group {
        DrawGroup::ZeroDstAlpha => {
            if is_shadow {
                return;
            }
            out.push(DrawPass {
                predicate: SidePredicate::new(CompareFunc::NotEqual, TRANSLUCENT, TRANSLUCENT),
                writes: SideWrites::new(Keep, Keep, Replace, TRANSLUCENT),
                depth_func: class.base_depth_func(opts),
                depth_offset: 0,
                depth_write: false,
                color_write: true,
                alpha_write: false,
                attribute_write: false,
                blend: false,
                filter: FragmentFilter::All,
                require_dst_back_facing: false,
            });
        }
        _ if is_shadow && class.id == 0 => push_shadow_mask(out, class, opts),
        _ if is_shadow => push_shadow(out, class, group, opts),
        DrawGroup::Opaque => push_opaque(out, class, opts, FragmentFilter::All),
        DrawGroup::Translucent => {
            if class.alpha_texture && class.can_have_opaque_texels {
                push_opaque(out, class, opts, FragmentFilter::OpaqueTexels);
                push_translucent(out, class, opts, FragmentFilter::TranslucentTexels);
            } else {
                push_translucent(out, class, opts, FragmentFilter::All);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameStep {
    /// Fill color, depth and attributes with the clear values
    Clear,
    /// Clear bits of the side channel at every pixel
    ClearSideBits { mask: u8 },
    /// Set bit 6 wherever the color buffer alpha is non-zero
    MarkNonZeroAlpha,
    DrawPolygon {
        /// Index into [`GeometryList::clipped`]
        clipped_index: usize,
        group: DrawGroup,
        /// Range into [`FramePlan::passes`]
        passes: Range<usize>,
    },
}

/// The whole frame as an ordered list of steps
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FramePlan {
    pub steps: Vec<FrameStep>,
    pub passes: Vec<DrawPass>,
    /// Built for a backend without side-channel support
    pub degraded: bool,
}

impl FramePlan {
    pub fn passes(&self, range: &Range<usize>) -> &[DrawPass] {
        &self.passes[range.clone()]
    }

    pub fn polygon_steps(&self) -> impl Iterator<Item = (usize, DrawGroup, &[DrawPass])> + '_ {
        self.steps.iter().filter_map(move |step| match step {
            FrameStep::DrawPolygon {
                clipped_index,
                group,
                passes,
            } => Some((*clipped_index, *group, self.passes(passes))),
            _ => None,
        })
    }

    fn push_polygon(&mut self, list: &GeometryList, clipped_index: usize, group: DrawGroup, opts: &PlanOptions) {
        let clipped = &list.clipped[clipped_index];
        let class = PolygonClass::new(list.polygon(clipped), clipped.back_facing);
        let start = self.passes.len();
        polygon_passes(&class, group, opts, &mut self.passes);
        if self.passes.len() > start {
            self.steps.push(FrameStep::DrawPolygon {
                clipped_index,
                group,
                passes: start..self.passes.len(),
            });
        }
    }
}

/// Order the frame: clear, opaque group, optional zero-alpha pre-pass, translucent group
pub fn build_frame_plan(list: &GeometryList, opts: &PlanOptions) -> FramePlan {
    let mut plan = FramePlan {
        degraded: !opts.multipass,
        ..Default::default()
    };
    plan.steps.push(FrameStep::Clear);

    let opaque_count = list.opaque_count.min(list.clipped.len());
    for i in 0..opaque_count {
        plan.push_polygon(list, i, DrawGroup::Opaque, opts);
    }

    if opts.multipass {
        if opts.zero_dst_alpha && opaque_count < list.clipped.len() {
            plan.steps.push(FrameStep::MarkNonZeroAlpha);
            for i in opaque_count..list.clipped.len() {
                plan.push_polygon(list, i, DrawGroup::ZeroDstAlpha, opts);
            }
        }
        plan.steps.push(FrameStep::ClearSideBits {
            mask: TRANSLUCENT | SCRATCH,
        });
    }

    for i in opaque_count..list.clipped.len() {
        plan.push_polygon(list, i, DrawGroup::Translucent, opts);
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{PolygonAttr, Vertex};
    use crate::side_channel::PassOutcome;
    use crate::texture::{TexParams, TextureFormat};

    /// One pixel run through pass lists the way the software backend runs them
    struct Pixel {
        side: SideChannel,
        depth: u32,
        draws: u32,
        back_facing: bool,
    }

    impl Pixel {
        fn new(depth: u32) -> Self {
            Self {
                side: SideChannel(0),
                depth,
                draws: 0,
                back_facing: false,
            }
        }

        fn run(&mut self, passes: &[DrawPass], frag_depth: u32, texel_alpha: u8) {
            for pass in passes {
                if !pass.filter.accepts(texel_alpha) {
                    continue;
                }
                if pass.require_dst_back_facing && !self.back_facing {
                    continue;
                }
                if let PassOutcome::Passed(d) = pass.resolve(&mut self.side, self.depth, frag_depth) {
                    if pass.depth_write {
                        self.depth = d;
                    }
                    if pass.color_write {
                        self.draws += 1;
                    }
                }
            }
        }
    }

    fn class(mode: PolygonMode, alpha: u8, id: u8) -> PolygonClass {
        let poly = Polygon {
            attr: PolygonAttr::new(mode, alpha, id),
            ..Default::default()
        };
        PolygonClass::new(&poly, false)
    }

    fn passes(class: &PolygonClass, group: DrawGroup, opts: &PlanOptions) -> Vec<DrawPass> {
        let mut out = Vec::new();
        polygon_passes(class, group, opts, &mut out);
        out
    }

    #[test]
    fn test_opaque_last_passing_polygon_owns_pixel() {
        let opts = PlanOptions::default();
        let mut px = Pixel::new(u32::MAX >> 8);
        px.run(&passes(&class(PolygonMode::Modulate, 31, 1), DrawGroup::Opaque, &opts), 5000, 31);
        px.run(&passes(&class(PolygonMode::Modulate, 31, 2), DrawGroup::Opaque, &opts), 6000, 31);
        assert_eq!(px.side.poly_id(), 1);
        px.run(&passes(&class(PolygonMode::Modulate, 31, 3), DrawGroup::Opaque, &opts), 4000, 31);
        assert_eq!(px.side.0, 3);
        assert_eq!(px.depth, 4000);
    }

    #[test]
    fn test_translucent_self_overlap_blends_once() {
        let opts = PlanOptions::default();
        let tri = passes(&class(PolygonMode::Modulate, 15, 2), DrawGroup::Translucent, &opts);
        let mut px = Pixel::new(10_000);
        px.run(&tri, 5000, 31);
        px.run(&tri, 5000, 31);
        assert_eq!(px.draws, 1);
        assert_eq!(px.side, SideChannel::translucent(2));

        // a different ID still blends
        let other = passes(&class(PolygonMode::Modulate, 15, 3), DrawGroup::Translucent, &opts);
        px.run(&other, 5000, 31);
        assert_eq!(px.draws, 2);
        assert_eq!(px.side, SideChannel::translucent(3));
    }

    #[test]
    fn test_depth_equal_window_is_symmetric() {
        let opts = PlanOptions::default();
        let mut c = class(PolygonMode::Modulate, 31, 4);
        c.depth_equal = true;
        let pl = passes(&c, DrawGroup::Opaque, &opts);
        let stored = 100_000;
        let tol = DEPTH_EQUAL_TOLERANCE as u32;

        for (frag, expect) in [
            (stored, true),
            (stored - tol, true),
            (stored + tol, true),
            (stored - tol - 1, false),
            (stored + tol + 1, false),
        ] {
            let mut px = Pixel::new(stored);
            px.run(&pl, frag, 31);
            assert_eq!(px.draws == 1, expect, "fragment depth {}", frag);
            assert!(!px.side.scratch());
        }
    }

    #[test]
    fn test_depth_equal_without_tolerance_is_exact() {
        let opts = PlanOptions {
            emulate_depth_equal_tolerance: false,
            ..Default::default()
        };
        let mut c = class(PolygonMode::Modulate, 31, 4);
        c.depth_equal = true;
        let pl = passes(&c, DrawGroup::Opaque, &opts);
        assert_eq!(pl.len(), 1);
        assert_eq!(pl[0].depth_func, CompareFunc::Equal);
    }

    #[test]
    fn test_translucent_depth_equal_respects_self_overlap() {
        let opts = PlanOptions::default();
        let mut c = class(PolygonMode::Modulate, 10, 7);
        c.depth_equal = true;
        let pl = passes(&c, DrawGroup::Translucent, &opts);
        let mut px = Pixel::new(2000);
        px.run(&pl, 2000, 31);
        px.run(&pl, 2000, 31);
        assert_eq!(px.draws, 1);
        assert_eq!(px.side, SideChannel::translucent(7));
    }

    #[test]
    fn test_shadow_draws_where_mask_set_and_ids_differ() {
        let opts = PlanOptions::default();
        let floor = passes(&class(PolygonMode::Modulate, 31, 3), DrawGroup::Opaque, &opts);
        let mask = passes(&class(PolygonMode::Shadow, 20, 0), DrawGroup::Translucent, &opts);
        let shadow = passes(&class(PolygonMode::Shadow, 20, 5), DrawGroup::Translucent, &opts);

        let mut px = Pixel::new(u32::MAX >> 8);
        px.run(&floor, 1000, 31);
        // volume back face behind the floor: depth test fails, mask set
        px.run(&mask, 2000, 31);
        assert!(px.side.scratch());
        px.run(&shadow, 500, 31);
        assert_eq!(px.draws, 2);
        assert_eq!(px.side, SideChannel::translucent(5));

        // mask not set: no shadow
        let mut px = Pixel::new(u32::MAX >> 8);
        px.run(&floor, 1000, 31);
        px.run(&mask, 800, 31);
        assert!(!px.side.scratch());
        px.run(&shadow, 500, 31);
        assert_eq!(px.draws, 1);
    }

    #[test]
    fn test_shadow_skips_own_id_and_clears_mask() {
        let opts = PlanOptions::default();
        let floor = passes(&class(PolygonMode::Modulate, 31, 5), DrawGroup::Opaque, &opts);
        let mask = passes(&class(PolygonMode::Shadow, 20, 0), DrawGroup::Translucent, &opts);
        let shadow = passes(&class(PolygonMode::Shadow, 20, 5), DrawGroup::Translucent, &opts);

        let mut px = Pixel::new(u32::MAX >> 8);
        px.run(&floor, 1000, 31);
        px.run(&mask, 2000, 31);
        px.run(&shadow, 500, 31);
        assert_eq!(px.draws, 1);
        assert!(!px.side.scratch());
        assert_eq!(px.side.0, 5);
    }

    #[test]
    fn test_shadow_disabled_or_degraded_emits_nothing() {
        let c = class(PolygonMode::Shadow, 20, 5);
        let off = PlanOptions {
            emulate_shadow: false,
            ..Default::default()
        };
        assert!(passes(&c, DrawGroup::Translucent, &off).is_empty());
        let degraded = PlanOptions {
            multipass: false,
            ..Default::default()
        };
        assert!(passes(&c, DrawGroup::Translucent, &degraded).is_empty());
    }

    #[test]
    fn test_degraded_is_single_pass_without_side_writes() {
        let opts = PlanOptions {
            multipass: false,
            ..Default::default()
        };
        let pl = passes(&class(PolygonMode::Modulate, 15, 2), DrawGroup::Translucent, &opts);
        assert_eq!(pl.len(), 1);
        assert!(pl[0].blend);
        assert_eq!(pl[0].writes, SideWrites::NONE);

        // without side writes the same ID blends twice
        let mut px = Pixel::new(10_000);
        px.run(&pl, 5000, 31);
        px.run(&pl, 5000, 31);
        assert_eq!(px.draws, 2);
    }

    #[test]
    fn test_alpha_texture_splits_by_texel_alpha() {
        let opts = PlanOptions::default();
        let poly = Polygon {
            attr: PolygonAttr::new(PolygonMode::Modulate, 31, 9),
            tex_params: TexParams::new(TextureFormat::A5I3, 3, 3, 0),
            ..Default::default()
        };
        let c = PolygonClass::new(&poly, false);
        assert!(c.alpha_texture && c.can_have_opaque_texels);
        let pl = passes(&c, DrawGroup::Translucent, &opts);
        assert_eq!(pl.len(), 2);
        assert_eq!(pl[0].filter, FragmentFilter::OpaqueTexels);
        assert!(pl[0].depth_write && !pl[0].blend);
        assert_eq!(pl[1].filter, FragmentFilter::TranslucentTexels);
        assert!(pl[1].blend);

        // opaque texel: opaque rule, no translucent bit
        let mut px = Pixel::new(10_000);
        px.run(&pl, 5000, 31);
        assert_eq!(px.side.0, 9);
        assert_eq!(px.draws, 1);

        // decal mode does not split
        let decal = Polygon {
            attr: PolygonAttr::new(PolygonMode::Decal, 31, 9),
            ..poly
        };
        assert!(!PolygonClass::new(&decal, false).alpha_texture);
    }

    #[test]
    fn test_facing_front_wins_tie_over_back() {
        let opts = PlanOptions {
            emulate_facing: true,
            ..Default::default()
        };
        let mut back = class(PolygonMode::Modulate, 31, 1);
        back.back_facing = true;
        let front = class(PolygonMode::Modulate, 31, 2);

        let mut px = Pixel::new(10_000);
        px.run(&passes(&back, DrawGroup::Opaque, &opts), 3000, 31);
        assert_eq!(px.side.0, TRANSLUCENT | 1);
        px.run(&passes(&front, DrawGroup::Opaque, &opts), 3000, 31);
        assert_eq!(px.draws, 2);
        assert_eq!(px.side.0, 2);
        // the tie draw is the only pass that touched bit 6
        assert_eq!(passes(&front, DrawGroup::Opaque, &opts).len(), 2);
    }

    #[test]
    fn test_translucent_facing_tie_only_over_opaque() {
        let opts = PlanOptions {
            emulate_facing: true,
            ..Default::default()
        };
        let mut back = class(PolygonMode::Modulate, 31, 1);
        back.back_facing = true;

        let mut px = Pixel::new(10_000);
        px.run(&passes(&back, DrawGroup::Opaque, &opts), 3000, 31);
        px.back_facing = true;
        // bits 6 and 7 are cleared between the groups
        px.side.0 &= !(TRANSLUCENT | SCRATCH);
        let opaque_draws = px.draws;

        let first = passes(&class(PolygonMode::Modulate, 15, 2), DrawGroup::Translucent, &opts);
        let second = passes(&class(PolygonMode::Modulate, 15, 3), DrawGroup::Translucent, &opts);
        px.run(&first, 3000, 31);
        assert_eq!(px.draws, opaque_draws + 1);
        assert_eq!(px.side, SideChannel::translucent(2));

        // the destination is now translucent: no second tie
        px.run(&second, 3000, 31);
        assert_eq!(px.draws, opaque_draws + 1);
        assert_eq!(px.side, SideChannel::translucent(2));
    }

    #[test]
    fn test_culled_polygon_has_no_passes() {
        let poly = Polygon {
            attr: PolygonAttr(PolygonAttr::new(PolygonMode::Modulate, 31, 1).0 & !(1 << 6)),
            ..Default::default()
        };
        let c = PolygonClass::new(&poly, true);
        assert!(!c.visible);
        assert!(passes(&c, DrawGroup::Opaque, &PlanOptions::default()).is_empty());
    }

    fn quad_list(attrs: &[PolygonAttr]) -> GeometryList {
        let mut list = GeometryList::default();
        for &attr in attrs {
            let v = [
                Vertex::from_ndc(-1.0, 1.0, 0.0, [63; 3]),
                Vertex::from_ndc(1.0, 1.0, 0.0, [63; 3]),
                Vertex::from_ndc(1.0, -1.0, 0.0, [63; 3]),
                Vertex::from_ndc(-1.0, -1.0, 0.0, [63; 3]),
            ];
            list.push_polygon(
                Polygon {
                    attr,
                    ..Default::default()
                },
                &v,
                false,
            );
        }
        list.sort_translucent_last();
        list
    }

    #[test]
    fn test_frame_plan_order_with_zero_alpha_prepass() {
        let list = quad_list(&[
            PolygonAttr::new(PolygonMode::Modulate, 10, 2),
            PolygonAttr::new(PolygonMode::Modulate, 31, 1),
        ]);
        let opts = PlanOptions {
            zero_dst_alpha: true,
            ..Default::default()
        };
        let plan = build_frame_plan(&list, &opts);
        let kinds: Vec<String> = plan
            .steps
            .iter()
            .map(|s| match s {
                FrameStep::Clear => "clear".to_string(),
                FrameStep::ClearSideBits { .. } => "clear-bits".to_string(),
                FrameStep::MarkNonZeroAlpha => "mark".to_string(),
                FrameStep::DrawPolygon { clipped_index, group, .. } => {
                    format!("{:?}{}", group, clipped_index)
                }
            })
            .collect();
        assert_eq!(
            kinds,
            vec!["clear", "Opaque0", "mark", "ZeroDstAlpha1", "clear-bits", "Translucent1"]
        );
        assert!(!plan.degraded);
        assert_eq!(plan.polygon_steps().count(), 3);
    }

    #[test]
    fn test_zero_alpha_pass_touches_pixel_once() {
        let opts = PlanOptions {
            zero_dst_alpha: true,
            ..Default::default()
        };
        let pl = passes(&class(PolygonMode::Modulate, 10, 2), DrawGroup::ZeroDstAlpha, &opts);
        assert_eq!(pl.len(), 1);
        assert!(pl[0].color_write && !pl[0].alpha_write && !pl[0].attribute_write);
        let mut px = Pixel::new(10_000);
        px.run(&pl, 5000, 31);
        px.run(&pl, 5000, 31);
        assert_eq!(px.draws, 1);
    }

    #[test]
    fn test_plan_options_from_settings() {
        let settings = RenderSettings::default();
        let state = RenderState {
            clear_alpha: 0,
            ..Default::default()
        };
        let opts = PlanOptions::new(&settings, &state, &Capabilities::software(1));
        assert!(opts.multipass && opts.zero_dst_alpha);

        let state = RenderState {
            clear_alpha: 31,
            ..Default::default()
        };
        let caps = Capabilities {
            supports_stencil: false,
            ..Capabilities::software(1)
        };
        let opts = PlanOptions::new(&settings, &state, &caps);
        assert!(!opts.multipass && !opts.zero_dst_alpha);
    }
}
