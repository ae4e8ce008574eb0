//! OpenGL renderer - GPU backend for the shared frame plan
//!
//! **Architecture**:
//! - OpenGL 3.3 core (or ES 3.0) through `glow`, rendering offscreen into an FBO with three
//!   attachments: RGBA8 color, RGBA8 attributes (polygon ID, fog, back-facing, wireframe) and a
//!   DEPTH24_STENCIL8 texture. The stencil buffer is the 8-bit side channel.
//! - Every [`DrawPass`] of the frame plan maps onto fixed-function state: stencil func/op/mask,
//!   depth func/mask, per-attachment color masks and blending. Depth offsets, texel filters and
//!   the facing gate are shader uniforms.
//! - Optional multisampled FBO, resolved into the single-sample textures before postprocessing
//!   and whenever a step needs to read back the frame mid-draw.
//! - Edge marking and fog run as one fullscreen pass; the result is read back, flipped and
//!   requantized into [`ColorOut`].
//!
//! **Integration**:
//! - The GL context comes from the front-end through [`OpenGLRendererFactory`]
//! - Without stencil support the renderer builds degraded single-pass plans and says so once

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use emu_core::graphics::depth::CompareFunc;
use emu_core::graphics::Color4u8;
use emu_core::logging::{log, LogCategory, LogLevel};
use glow::HasContext;

use crate::color_out::{ColorFormat, ColorOut};
use crate::composite::{build_frame_plan, DrawGroup, FramePlan, FrameStep, PlanOptions};
use crate::geometry::{project, GeometryList, PolygonMode, ScreenVertex};
use crate::postprocess::{fog_step, EdgeMarkParams, FogParams};
use crate::rasterizer::{farthest_pair, is_degenerate};
use crate::render3d::{
    resolve_color_format, validate_framebuffer_size, DegradedReport, DeviceInfo, Render3D,
    RendererFactory, RendererId,
};
use crate::settings::{Capabilities, RenderSettings};
use crate::side_channel::{DrawPass, FragmentFilter, SideChannel, SideWrite};
use crate::state::{RenderState, ShadingMode};
use crate::texture::{DecodedTexture, TexParams, TextureCache};
use crate::{Render3DError, Render3DResult, NATIVE_HEIGHT, NATIVE_WIDTH};

const GEOMETRY_VERTEX: &str = include_str!("shaders/geometry_vertex.glsl");
const GEOMETRY_FRAGMENT: &str = include_str!("shaders/geometry_fragment.glsl");
const FULLSCREEN_VERTEX: &str = include_str!("shaders/fullscreen_vertex.glsl");
const ZERO_ALPHA_FRAGMENT: &str = include_str!("shaders/zero_alpha_fragment.glsl");
const CLEAR_IMAGE_FRAGMENT: &str = include_str!("shaders/clear_image_fragment.glsl");
const POSTPROCESS_FRAGMENT: &str = include_str!("shaders/postprocess_fragment.glsl");

/// Floats per vertex: clip xyzw, color rgb, texel st
const VERTEX_FLOATS: usize = 9;
const DEPTH_SCALE: f32 = 16_777_215.0;
/// Flush GPU textures when this many are resident
const MAX_GPU_TEXTURES: usize = 1024;

/// Wrapper for glow::Context that implements Send
/// Safety: the renderer only touches the context from the thread that drives it; the
/// front-end moves the renderer along with its current context.
struct SendContext(glow::Context);

unsafe impl Send for SendContext {}

impl std::ops::Deref for SendContext {
    type Target = glow::Context;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// The context version the capability checks work from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlVersion {
    pub major: u32,
    pub minor: u32,
    pub embedded: bool,
}

impl GlVersion {
    fn of(gl: &glow::Context) -> Self {
        let v = gl.version();
        Self {
            major: v.major,
            minor: v.minor,
            embedded: v.is_embedded,
        }
    }

    fn shader_header(self) -> &'static str {
        if self.embedded {
            "#version 300 es\nprecision highp float;\nprecision highp int;\n"
        } else {
            "#version 330 core\n"
        }
    }
}

pub fn renderer_id_for(version: GlVersion) -> RendererId {
    if version.embedded {
        RendererId::OpenGlEs
    } else if (version.major, version.minor) >= (3, 2) {
        RendererId::OpenGl32
    } else {
        RendererId::OpenGlLegacy
    }
}

/// What the context can do, from its version and what target creation managed
pub fn capabilities_for(version: GlVersion, stencil: bool, max_samples: u32) -> Capabilities {
    let shaders = if version.embedded {
        version.major >= 3
    } else {
        (version.major, version.minor) >= (3, 3)
    };
    Capabilities {
        supports_shaders: shaders,
        supports_stencil: stencil,
        supports_fbo: shaders,
        supports_multisample: max_samples > 1,
        max_samples,
        max_workers: 1,
    }
}

fn compare_func(func: CompareFunc) -> u32 {
    match func {
        CompareFunc::Never => glow::NEVER,
        CompareFunc::Less => glow::LESS,
        CompareFunc::Equal => glow::EQUAL,
        CompareFunc::LessEqual => glow::LEQUAL,
        CompareFunc::Greater => glow::GREATER,
        CompareFunc::NotEqual => glow::NOTEQUAL,
        CompareFunc::GreaterEqual => glow::GEQUAL,
        CompareFunc::Always => glow::ALWAYS,
    }
}

fn stencil_op(write: SideWrite) -> u32 {
    match write {
        SideWrite::Keep => glow::KEEP,
        SideWrite::Zero => glow::ZERO,
        SideWrite::Replace => glow::REPLACE,
    }
}

fn filter_index(filter: FragmentFilter) -> i32 {
    match filter {
        FragmentFilter::All => 0,
        FragmentFilter::OpaqueTexels => 1,
        FragmentFilter::TranslucentTexels => 2,
    }
}

fn mode_index(mode: PolygonMode) -> i32 {
    match mode {
        PolygonMode::Modulate => 0,
        PolygonMode::Decal => 1,
        PolygonMode::ToonHighlight => 2,
        PolygonMode::Shadow => 3,
    }
}

fn wrap_mode(repeat: bool, flip: bool) -> i32 {
    match (repeat, flip) {
        (true, true) => glow::MIRRORED_REPEAT as i32,
        (true, false) => glow::REPEAT as i32,
        _ => glow::CLAMP_TO_EDGE as i32,
    }
}

/// Fog table inputs as the postprocess shader interpolates them
#[derive(Debug, Clone, PartialEq)]
struct FogUniforms {
    params: FogParams,
    offset: f32,
    step: f32,
    densities: [f32; 32],
}

impl FogUniforms {
    fn from_state(state: &RenderState) -> Self {
        Self {
            params: FogParams::from_state(state),
            offset: (state.fog_offset & 0x7FFF) as f32,
            step: fog_step(state.fog_shift) as f32,
            densities: state.fog_density.map(|d| match d & 0x7F {
                127 => 128.0,
                d => d as f32,
            }),
        }
    }
}

/// Where a polygon's vertices sit in the frame's vertex buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DrawRange {
    first: i32,
    count: i32,
    primitive: u32,
}

fn push_vertex(out: &mut Vec<f32>, v: &ScreenVertex, width: usize, height: usize) {
    let w = 1.0 / v.inv_w.max(f32::MIN_POSITIVE);
    let ndc_x = v.x / width as f32 * 2.0 - 1.0;
    let ndc_y = 1.0 - v.y / height as f32 * 2.0;
    let ndc_z = v.z * 2.0 - 1.0;
    out.extend_from_slice(&[
        ndc_x * w,
        ndc_y * w,
        ndc_z * w,
        w,
        v.color_w[0] * w,
        v.color_w[1] * w,
        v.color_w[2] * w,
        v.s_w * w,
        v.t_w * w,
    ]);
}

/// Vertex data for every polygon the plan draws, as triangles, outlines or hack lines
fn build_vertices(
    list: &GeometryList,
    plan: &FramePlan,
    width: usize,
    height: usize,
    line_hack: bool,
) -> (Vec<f32>, Vec<Option<DrawRange>>) {
    let mut data = Vec::new();
    let mut ranges = vec![None; list.clipped.len()];

    for (clipped_index, _, _) in plan.polygon_steps() {
        if ranges[clipped_index].is_some() {
            continue;
        }
        let clipped = &list.clipped[clipped_index];
        let poly = list.polygon(clipped);
        let verts: Vec<ScreenVertex> = clipped
            .indices()
            .iter()
            .map(|&v| project(&list.vertices[v as usize], &poly.viewport, width, height))
            .collect();
        let first = (data.len() / VERTEX_FLOATS) as i32;

        let primitive = if is_degenerate(&verts) {
            let Some((a, b)) = line_hack.then(|| farthest_pair(&verts)).flatten() else {
                continue;
            };
            push_vertex(&mut data, &a, width, height);
            push_vertex(&mut data, &b, width, height);
            glow::LINES
        } else if poly.attr.is_wireframe() {
            for v in &verts {
                push_vertex(&mut data, v, width, height);
            }
            glow::LINE_LOOP
        } else {
            for i in 1..verts.len() - 1 {
                for v in [&verts[0], &verts[i], &verts[i + 1]] {
                    push_vertex(&mut data, v, width, height);
                }
            }
            glow::TRIANGLES
        };
        let count = (data.len() / VERTEX_FLOATS) as i32 - first;
        ranges[clipped_index] = Some(DrawRange {
            first,
            count,
            primitive,
        });
    }
    (data, ranges)
}

/// Packed clear image: RGBA color and (depth 24-bit, fog) per native pixel
fn clear_image_pixels(state: &RenderState, list: &GeometryList) -> (Vec<u8>, Vec<u8>) {
    let mut color = Vec::with_capacity(NATIVE_WIDTH * NATIVE_HEIGHT * 4);
    let mut depth = Vec::with_capacity(NATIVE_WIDTH * NATIVE_HEIGHT * 4);
    for y in 0..NATIVE_HEIGHT {
        for x in 0..NATIVE_WIDTH {
            let (c, attr) =
                state.clear_fragment(&list.texture_memory, x, y, NATIVE_WIDTH, NATIVE_HEIGHT);
            let c = c.to_8888();
            color.extend_from_slice(&[c.r, c.g, c.b, c.a]);
            let d = attr.depth;
            depth.extend_from_slice(&[
                (d >> 16) as u8,
                (d >> 8) as u8,
                d as u8,
                if attr.is_fogged { 255 } else { 0 },
            ]);
        }
    }
    (color, depth)
}

unsafe fn compile_shader(
    gl: &glow::Context,
    shader_type: u32,
    header: &str,
    source: &str,
) -> Result<glow::Shader, String> {
    let shader = gl
        .create_shader(shader_type)
        .map_err(|e| format!("Failed to create shader: {}", e))?;
    gl.shader_source(shader, &format!("{}{}", header, source));
    gl.compile_shader(shader);
    if !gl.get_shader_compile_status(shader) {
        let log = gl.get_shader_info_log(shader);
        gl.delete_shader(shader);
        return Err(format!("Shader compilation failed: {}", log));
    }
    Ok(shader)
}

unsafe fn create_program(
    gl: &glow::Context,
    header: &str,
    vertex: &str,
    fragment: &str,
) -> Result<glow::Program, String> {
    let vs = compile_shader(gl, glow::VERTEX_SHADER, header, vertex)?;
    let fs = match compile_shader(gl, glow::FRAGMENT_SHADER, header, fragment) {
        Ok(fs) => fs,
        Err(e) => {
            gl.delete_shader(vs);
            return Err(e);
        }
    };
    let program = gl
        .create_program()
        .map_err(|e| format!("Failed to create program: {}", e))?;
    gl.attach_shader(program, vs);
    gl.attach_shader(program, fs);
    gl.link_program(program);
    let linked = gl.get_program_link_status(program);
    gl.delete_shader(vs);
    gl.delete_shader(fs);
    if !linked {
        let log = gl.get_program_info_log(program);
        gl.delete_program(program);
        return Err(format!("Program linking failed: {}", log));
    }
    Ok(program)
}

struct Programs {
    geometry: glow::Program,
    zero_alpha: glow::Program,
    clear_image: glow::Program,
    postprocess: glow::Program,
}

impl Programs {
    unsafe fn new(gl: &glow::Context, version: GlVersion) -> Result<Self, String> {
        let header = version.shader_header();
        Ok(Self {
            geometry: create_program(gl, header, GEOMETRY_VERTEX, GEOMETRY_FRAGMENT)?,
            zero_alpha: create_program(gl, header, FULLSCREEN_VERTEX, ZERO_ALPHA_FRAGMENT)?,
            clear_image: create_program(gl, header, FULLSCREEN_VERTEX, CLEAR_IMAGE_FRAGMENT)?,
            postprocess: create_program(gl, header, FULLSCREEN_VERTEX, POSTPROCESS_FRAGMENT)?,
        })
    }

    unsafe fn delete(&self, gl: &glow::Context) {
        gl.delete_program(self.geometry);
        gl.delete_program(self.zero_alpha);
        gl.delete_program(self.clear_image);
        gl.delete_program(self.postprocess);
    }
}

unsafe fn create_texture(
    gl: &glow::Context,
    internal_format: u32,
    format: u32,
    ty: u32,
    width: usize,
    height: usize,
) -> Result<glow::Texture, String> {
    let texture = gl
        .create_texture()
        .map_err(|e| format!("Failed to create texture: {}", e))?;
    gl.bind_texture(glow::TEXTURE_2D, Some(texture));
    gl.tex_image_2d(
        glow::TEXTURE_2D,
        0,
        internal_format as i32,
        width as i32,
        height as i32,
        0,
        format,
        ty,
        None,
    );
    gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MIN_FILTER, glow::NEAREST as i32);
    gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MAG_FILTER, glow::NEAREST as i32);
    gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_WRAP_S, glow::CLAMP_TO_EDGE as i32);
    gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_WRAP_T, glow::CLAMP_TO_EDGE as i32);
    Ok(texture)
}

unsafe fn create_renderbuffer(
    gl: &glow::Context,
    samples: u32,
    internal_format: u32,
    width: usize,
    height: usize,
) -> Result<glow::Renderbuffer, String> {
    let rb = gl
        .create_renderbuffer()
        .map_err(|e| format!("Failed to create renderbuffer: {}", e))?;
    gl.bind_renderbuffer(glow::RENDERBUFFER, Some(rb));
    gl.renderbuffer_storage_multisample(
        glow::RENDERBUFFER,
        samples as i32,
        internal_format,
        width as i32,
        height as i32,
    );
    Ok(rb)
}

unsafe fn create_framebuffer(gl: &glow::Context) -> Result<glow::Framebuffer, String> {
    let fbo = gl
        .create_framebuffer()
        .map_err(|e| format!("Failed to create framebuffer: {}", e))?;
    gl.bind_framebuffer(glow::FRAMEBUFFER, Some(fbo));
    Ok(fbo)
}

unsafe fn check_framebuffer(gl: &glow::Context, what: &str) -> Result<(), String> {
    let status = gl.check_framebuffer_status(glow::FRAMEBUFFER);
    if status != glow::FRAMEBUFFER_COMPLETE {
        return Err(format!("{} framebuffer incomplete: status = 0x{:X}", what, status));
    }
    Ok(())
}

struct MsaaTargets {
    fbo: glow::Framebuffer,
    color: glow::Renderbuffer,
    attr: glow::Renderbuffer,
    depth_stencil: glow::Renderbuffer,
}

/// Every offscreen surface of one framebuffer size
struct FrameTargets {
    width: usize,
    height: usize,
    has_stencil: bool,
    samples: u32,
    fbo: glow::Framebuffer,
    color: glow::Texture,
    attr: glow::Texture,
    depth_stencil: glow::Texture,
    msaa: Option<MsaaTargets>,
    /// Resolved copies for reads during the geometry pass
    scratch_color_fbo: glow::Framebuffer,
    scratch_color: glow::Texture,
    scratch_attr_fbo: glow::Framebuffer,
    scratch_attr: glow::Texture,
    post_fbo: glow::Framebuffer,
    post_color: glow::Texture,
    clear_color: glow::Texture,
    clear_depth: glow::Texture,
}

impl FrameTargets {
    unsafe fn new(gl: &glow::Context, width: usize, height: usize, samples: u32) -> Result<Self, String> {
        let (fbo, color, attr, depth_stencil, has_stencil) = match Self::main_targets(gl, width, height, true) {
            Ok(t) => t,
            Err(e) => {
                log(LogCategory::Gpu, LogLevel::Warn, || {
                    format!("stencil framebuffer unavailable ({}), using depth only", e)
                });
                Self::main_targets(gl, width, height, false)?
            }
        };

        let msaa = if samples > 1 {
            Some(Self::msaa_targets(gl, width, height, samples, has_stencil)?)
        } else {
            None
        };

        let scratch_color_fbo = create_framebuffer(gl)?;
        let scratch_color = create_texture(gl, glow::RGBA8, glow::RGBA, glow::UNSIGNED_BYTE, width, height)?;
        gl.framebuffer_texture_2d(glow::FRAMEBUFFER, glow::COLOR_ATTACHMENT0, glow::TEXTURE_2D, Some(scratch_color), 0);
        check_framebuffer(gl, "scratch color")?;

        let scratch_attr_fbo = create_framebuffer(gl)?;
        let scratch_attr = create_texture(gl, glow::RGBA8, glow::RGBA, glow::UNSIGNED_BYTE, width, height)?;
        gl.framebuffer_texture_2d(glow::FRAMEBUFFER, glow::COLOR_ATTACHMENT0, glow::TEXTURE_2D, Some(scratch_attr), 0);
        check_framebuffer(gl, "scratch attribute")?;

        let post_fbo = create_framebuffer(gl)?;
        let post_color = create_texture(gl, glow::RGBA8, glow::RGBA, glow::UNSIGNED_BYTE, width, height)?;
        gl.framebuffer_texture_2d(glow::FRAMEBUFFER, glow::COLOR_ATTACHMENT0, glow::TEXTURE_2D, Some(post_color), 0);
        check_framebuffer(gl, "postprocess")?;

        let clear_color = create_texture(gl, glow::RGBA8, glow::RGBA, glow::UNSIGNED_BYTE, NATIVE_WIDTH, NATIVE_HEIGHT)?;
        let clear_depth = create_texture(gl, glow::RGBA8, glow::RGBA, glow::UNSIGNED_BYTE, NATIVE_WIDTH, NATIVE_HEIGHT)?;

        gl.bind_framebuffer(glow::FRAMEBUFFER, None);
        Ok(Self {
            width,
            height,
            has_stencil,
            samples: if msaa.is_some() { samples } else { 0 },
            fbo,
            color,
            attr,
            depth_stencil,
            msaa,
            scratch_color_fbo,
            scratch_color,
            scratch_attr_fbo,
            scratch_attr,
            post_fbo,
            post_color,
            clear_color,
            clear_depth,
        })
    }

    #[allow(clippy::type_complexity)]
    unsafe fn main_targets(
        gl: &glow::Context,
        width: usize,
        height: usize,
        stencil: bool,
    ) -> Result<(glow::Framebuffer, glow::Texture, glow::Texture, glow::Texture, bool), String> {
        let fbo = create_framebuffer(gl)?;
        let color = create_texture(gl, glow::RGBA8, glow::RGBA, glow::UNSIGNED_BYTE, width, height)?;
        gl.framebuffer_texture_2d(glow::FRAMEBUFFER, glow::COLOR_ATTACHMENT0, glow::TEXTURE_2D, Some(color), 0);
        let attr = create_texture(gl, glow::RGBA8, glow::RGBA, glow::UNSIGNED_BYTE, width, height)?;
        gl.framebuffer_texture_2d(glow::FRAMEBUFFER, glow::COLOR_ATTACHMENT1, glow::TEXTURE_2D, Some(attr), 0);

        let (internal, format, ty, attachment) = if stencil {
            (glow::DEPTH24_STENCIL8, glow::DEPTH_STENCIL, glow::UNSIGNED_INT_24_8, glow::DEPTH_STENCIL_ATTACHMENT)
        } else {
            (glow::DEPTH_COMPONENT24, glow::DEPTH_COMPONENT, glow::UNSIGNED_INT, glow::DEPTH_ATTACHMENT)
        };
        let depth_stencil = create_texture(gl, internal, format, ty, width, height)?;
        gl.framebuffer_texture_2d(glow::FRAMEBUFFER, attachment, glow::TEXTURE_2D, Some(depth_stencil), 0);
        gl.draw_buffers(&[glow::COLOR_ATTACHMENT0, glow::COLOR_ATTACHMENT1]);

        if let Err(e) = check_framebuffer(gl, "geometry") {
            gl.bind_framebuffer(glow::FRAMEBUFFER, None);
            gl.delete_framebuffer(fbo);
            gl.delete_texture(color);
            gl.delete_texture(attr);
            gl.delete_texture(depth_stencil);
            return Err(e);
        }
        Ok((fbo, color, attr, depth_stencil, stencil))
    }

    unsafe fn msaa_targets(
        gl: &glow::Context,
        width: usize,
        height: usize,
        samples: u32,
        stencil: bool,
    ) -> Result<MsaaTargets, String> {
        let fbo = create_framebuffer(gl)?;
        let color = create_renderbuffer(gl, samples, glow::RGBA8, width, height)?;
        gl.framebuffer_renderbuffer(glow::FRAMEBUFFER, glow::COLOR_ATTACHMENT0, glow::RENDERBUFFER, Some(color));
        let attr = create_renderbuffer(gl, samples, glow::RGBA8, width, height)?;
        gl.framebuffer_renderbuffer(glow::FRAMEBUFFER, glow::COLOR_ATTACHMENT1, glow::RENDERBUFFER, Some(attr));
        let (internal, attachment) = if stencil {
            (glow::DEPTH24_STENCIL8, glow::DEPTH_STENCIL_ATTACHMENT)
        } else {
            (glow::DEPTH_COMPONENT24, glow::DEPTH_ATTACHMENT)
        };
        let depth_stencil = create_renderbuffer(gl, samples, internal, width, height)?;
        gl.framebuffer_renderbuffer(glow::FRAMEBUFFER, attachment, glow::RENDERBUFFER, Some(depth_stencil));
        gl.draw_buffers(&[glow::COLOR_ATTACHMENT0, glow::COLOR_ATTACHMENT1]);
        let targets = MsaaTargets {
            fbo,
            color,
            attr,
            depth_stencil,
        };
        if let Err(e) = check_framebuffer(gl, "multisample") {
            targets.delete(gl);
            return Err(e);
        }
        Ok(targets)
    }

    /// The framebuffer geometry is drawn into
    fn draw_fbo(&self) -> glow::Framebuffer {
        self.msaa.as_ref().map_or(self.fbo, |m| m.fbo)
    }

    /// Copy one color attachment of the draw framebuffer into a single-attachment target
    unsafe fn copy_attachment(&self, gl: &glow::Context, attachment: u32, dst: glow::Framebuffer) {
        let (w, h) = (self.width as i32, self.height as i32);
        gl.bind_framebuffer(glow::READ_FRAMEBUFFER, Some(self.draw_fbo()));
        gl.read_buffer(attachment);
        gl.bind_framebuffer(glow::DRAW_FRAMEBUFFER, Some(dst));
        gl.blit_framebuffer(0, 0, w, h, 0, 0, w, h, glow::COLOR_BUFFER_BIT, glow::NEAREST);
        gl.bind_framebuffer(glow::FRAMEBUFFER, Some(self.draw_fbo()));
    }

    /// Resolve the multisampled frame into the textures postprocessing samples
    unsafe fn resolve(&self, gl: &glow::Context) {
        let Some(msaa) = &self.msaa else {
            return;
        };
        let (w, h) = (self.width as i32, self.height as i32);
        gl.bind_framebuffer(glow::READ_FRAMEBUFFER, Some(msaa.fbo));
        gl.bind_framebuffer(glow::DRAW_FRAMEBUFFER, Some(self.fbo));
        for (i, attachment) in [glow::COLOR_ATTACHMENT0, glow::COLOR_ATTACHMENT1].into_iter().enumerate() {
            gl.read_buffer(attachment);
            let mut buffers = [glow::NONE, glow::NONE];
            buffers[i] = attachment;
            gl.draw_buffers(&buffers);
            gl.blit_framebuffer(0, 0, w, h, 0, 0, w, h, glow::COLOR_BUFFER_BIT, glow::NEAREST);
        }
        let mask = if self.has_stencil {
            glow::DEPTH_BUFFER_BIT | glow::STENCIL_BUFFER_BIT
        } else {
            glow::DEPTH_BUFFER_BIT
        };
        gl.blit_framebuffer(0, 0, w, h, 0, 0, w, h, mask, glow::NEAREST);
        gl.draw_buffers(&[glow::COLOR_ATTACHMENT0, glow::COLOR_ATTACHMENT1]);
        gl.bind_framebuffer(glow::FRAMEBUFFER, None);
    }

    unsafe fn delete(&self, gl: &glow::Context) {
        gl.delete_framebuffer(self.fbo);
        gl.delete_texture(self.color);
        gl.delete_texture(self.attr);
        gl.delete_texture(self.depth_stencil);
        if let Some(msaa) = &self.msaa {
            msaa.delete(gl);
        }
        gl.delete_framebuffer(self.scratch_color_fbo);
        gl.delete_texture(self.scratch_color);
        gl.delete_framebuffer(self.scratch_attr_fbo);
        gl.delete_texture(self.scratch_attr);
        gl.delete_framebuffer(self.post_fbo);
        gl.delete_texture(self.post_color);
        gl.delete_texture(self.clear_color);
        gl.delete_texture(self.clear_depth);
    }
}

impl MsaaTargets {
    unsafe fn delete(&self, gl: &glow::Context) {
        gl.delete_framebuffer(self.fbo);
        gl.delete_renderbuffer(self.color);
        gl.delete_renderbuffer(self.attr);
        gl.delete_renderbuffer(self.depth_stencil);
    }
}

struct GpuTexture {
    // keeps the decoded texture alive so its address stays a valid key
    _source: Arc<DecodedTexture>,
    texture: glow::Texture,
}

/// State for one polygon while its passes are drawn
struct PolygonDraw {
    range: DrawRange,
    opaque_attrs: bool,
    fog: bool,
}

/// OpenGL-backed renderer
pub struct OpenGLRenderer {
    gl: SendContext,
    version: GlVersion,
    caps: Capabilities,
    max_anisotropy: f32,
    settings: RenderSettings,
    targets: FrameTargets,
    programs: Programs,
    vao: glow::VertexArray,
    vbo: glow::Buffer,
    fullscreen_vao: glow::VertexArray,
    textures: TextureCache,
    gpu_textures: HashMap<usize, GpuTexture>,
    color_out: Arc<ColorOut>,
    format: ColorFormat,
    /// Last finished frame in 6665 or 8888, top row first
    frame: Vec<Color4u8>,
    readback: Vec<u8>,
    needs_finish: bool,
    pending_post: Option<(Option<EdgeMarkParams>, Option<FogUniforms>)>,
    degraded: DegradedReport,
    name: String,
}

impl OpenGLRenderer {
    /// Create a renderer on the given context at native resolution
    pub fn new(gl: glow::Context, settings: &RenderSettings) -> Result<Self, String> {
        let gl = SendContext(gl);
        let version = GlVersion::of(&gl);
        unsafe {
            let max_samples = gl.get_parameter_i32(glow::MAX_SAMPLES).max(0) as u32;
            let max_anisotropy = if gl
                .supported_extensions()
                .contains("GL_EXT_texture_filter_anisotropic")
            {
                gl.get_parameter_f32(glow::MAX_TEXTURE_MAX_ANISOTROPY_EXT).max(1.0)
            } else {
                1.0
            };
            let caps = capabilities_for(version, true, max_samples);
            if !caps.supports_shaders {
                return Err(format!(
                    "OpenGL {}.{} lacks the required shader support",
                    version.major, version.minor
                ));
            }

            let samples = Self::sample_count(settings, &caps);
            let targets = match FrameTargets::new(&gl, NATIVE_WIDTH, NATIVE_HEIGHT, samples) {
                Ok(t) => t,
                Err(e) if samples > 0 => {
                    log(LogCategory::Gpu, LogLevel::Warn, || {
                        format!("multisampled targets failed ({}), using single-sample", e)
                    });
                    FrameTargets::new(&gl, NATIVE_WIDTH, NATIVE_HEIGHT, 0)?
                }
                Err(e) => return Err(e),
            };
            let programs = Programs::new(&gl, version)?;
            let vao = gl
                .create_vertex_array()
                .map_err(|e| format!("Failed to create VAO: {}", e))?;
            let vbo = gl
                .create_buffer()
                .map_err(|e| format!("Failed to create VBO: {}", e))?;
            let fullscreen_vao = gl
                .create_vertex_array()
                .map_err(|e| format!("Failed to create VAO: {}", e))?;

            gl.bind_vertex_array(Some(vao));
            gl.bind_buffer(glow::ARRAY_BUFFER, Some(vbo));
            let stride = (VERTEX_FLOATS * std::mem::size_of::<f32>()) as i32;
            let float = std::mem::size_of::<f32>() as i32;
            gl.vertex_attrib_pointer_f32(0, 4, glow::FLOAT, false, stride, 0);
            gl.enable_vertex_attrib_array(0);
            gl.vertex_attrib_pointer_f32(1, 3, glow::FLOAT, false, stride, 4 * float);
            gl.enable_vertex_attrib_array(1);
            gl.vertex_attrib_pointer_f32(2, 2, glow::FLOAT, false, stride, 7 * float);
            gl.enable_vertex_attrib_array(2);
            gl.bind_vertex_array(None);

            let caps = capabilities_for(version, targets.has_stencil, max_samples);
            let id = renderer_id_for(version);
            let name = format!(
                "OpenGL {}{}.{}",
                if version.embedded { "ES " } else { "" },
                version.major,
                version.minor
            );
            let mut renderer = Self {
                gl,
                version,
                caps,
                max_anisotropy,
                settings: settings.clone(),
                targets,
                programs,
                vao,
                vbo,
                fullscreen_vao,
                textures: TextureCache::new(),
                gpu_textures: HashMap::new(),
                color_out: Arc::new(ColorOut::default()),
                format: ColorFormat::Rgb666,
                frame: vec![Color4u8::TRANSPARENT; NATIVE_WIDTH * NATIVE_HEIGHT],
                readback: Vec::new(),
                needs_finish: false,
                pending_post: None,
                degraded: DegradedReport::default(),
                name,
            };
            if !renderer.caps.supports_multipass() {
                renderer
                    .degraded
                    .report(&renderer.name, "no stencil buffer; shadows and depth-equal tolerance disabled");
            }
            log(LogCategory::Gpu, LogLevel::Info, || {
                format!("{} ready ({:?}), max samples {}", renderer.name, id, max_samples)
            });
            Ok(renderer)
        }
    }

    fn sample_count(settings: &RenderSettings, caps: &Capabilities) -> u32 {
        if caps.supports_multisample && settings.multisample_size > 1 {
            settings.multisample_size.min(caps.max_samples)
        } else {
            0
        }
    }

    /// Recreate the offscreen targets; falls back to no multisampling on failure
    fn rebuild_targets(&mut self, width: usize, height: usize) -> Render3DResult<()> {
        let samples = Self::sample_count(&self.settings, &self.caps);
        unsafe {
            let targets = match FrameTargets::new(&self.gl, width, height, samples) {
                Ok(t) => t,
                Err(e) if samples > 0 => {
                    self.degraded
                        .report(&self.name, &format!("multisampling unavailable: {}", e));
                    FrameTargets::new(&self.gl, width, height, 0).map_err(Render3DError::ResourceCreate)?
                }
                Err(e) => return Err(Render3DError::ResourceCreate(e)),
            };
            self.targets.delete(&self.gl);
            self.targets = targets;
        }
        self.caps = capabilities_for(self.version, self.targets.has_stencil, self.caps.max_samples);
        self.frame = vec![Color4u8::TRANSPARENT; width * height];
        self.color_out.set_size(width, height);
        Ok(())
    }

    fn clear_gpu_textures(&mut self) {
        for (_, tex) in self.gpu_textures.drain() {
            unsafe { self.gl.delete_texture(tex.texture) };
        }
    }

    unsafe fn uniform_location(&self, program: glow::Program, name: &str) -> Option<glow::UniformLocation> {
        self.gl.get_uniform_location(program, name)
    }

    unsafe fn set_i32(&self, program: glow::Program, name: &str, value: i32) {
        let loc = self.uniform_location(program, name);
        self.gl.uniform_1_i32(loc.as_ref(), value);
    }

    unsafe fn set_f32(&self, program: glow::Program, name: &str, value: f32) {
        let loc = self.uniform_location(program, name);
        self.gl.uniform_1_f32(loc.as_ref(), value);
    }

    unsafe fn set_vec2(&self, program: glow::Program, name: &str, x: f32, y: f32) {
        let loc = self.uniform_location(program, name);
        self.gl.uniform_2_f32(loc.as_ref(), x, y);
    }

    unsafe fn set_vec4(&self, program: glow::Program, name: &str, v: [f32; 4]) {
        let loc = self.uniform_location(program, name);
        self.gl.uniform_4_f32(loc.as_ref(), v[0], v[1], v[2], v[3]);
    }

    unsafe fn bind_sampler(&self, program: glow::Program, name: &str, unit: u32, texture: glow::Texture) {
        self.gl.active_texture(glow::TEXTURE0 + unit);
        self.gl.bind_texture(glow::TEXTURE_2D, Some(texture));
        self.set_i32(program, name, unit as i32);
    }

    fn color6665(c: Color4u8) -> [f32; 4] {
        [c.r as f32, c.g as f32, c.b as f32, c.a as f32]
    }

    /// Upload (or reuse) the GPU copy of a decoded texture and bind it to unit 0
    unsafe fn bind_polygon_texture(&mut self, texture: &Arc<DecodedTexture>, params: TexParams) -> Result<(), String> {
        let key = Arc::as_ptr(texture) as usize;
        if !self.gpu_textures.contains_key(&key) {
            if self.gpu_textures.len() >= MAX_GPU_TEXTURES {
                self.clear_gpu_textures();
            }
            let gl_tex = create_texture(
                &self.gl,
                glow::RGBA8,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                texture.width,
                texture.height,
            )?;
            self.gl.pixel_store_i32(glow::UNPACK_ALIGNMENT, 1);
            self.gl.tex_image_2d(
                glow::TEXTURE_2D,
                0,
                glow::RGBA8 as i32,
                texture.width as i32,
                texture.height as i32,
                0,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                Some(texture.to_rgba8().as_slice()),
            );
            self.gpu_textures.insert(
                key,
                GpuTexture {
                    _source: Arc::clone(texture),
                    texture: gl_tex,
                },
            );
        }
        let Some(gpu) = self.gpu_textures.get(&key) else {
            return Ok(());
        };
        let gl = &self.gl;
        gl.active_texture(glow::TEXTURE0);
        gl.bind_texture(glow::TEXTURE_2D, Some(gpu.texture));
        let filter = if self.settings.texture_smoothing {
            glow::LINEAR
        } else {
            glow::NEAREST
        } as i32;
        gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MIN_FILTER, filter);
        gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MAG_FILTER, filter);
        gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_WRAP_S, wrap_mode(params.repeat_s(), params.flip_s()));
        gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_WRAP_T, wrap_mode(params.repeat_t(), params.flip_t()));
        if self.max_anisotropy > 1.0 {
            let aniso = (self.settings.max_anisotropy as f32).clamp(1.0, self.max_anisotropy);
            gl.tex_parameter_f32(glow::TEXTURE_2D, glow::TEXTURE_MAX_ANISOTROPY_EXT, aniso);
        }
        Ok(())
    }

    unsafe fn draw_fullscreen(&self) {
        self.gl.bind_vertex_array(Some(self.fullscreen_vao));
        self.gl.draw_arrays(glow::TRIANGLES, 0, 3);
    }

    unsafe fn reset_write_masks(&self) {
        let gl = &self.gl;
        gl.color_mask(true, true, true, true);
        gl.depth_mask(true);
        gl.stencil_mask(0xFF);
        gl.disable(glow::BLEND);
    }

    unsafe fn clear_frame(&mut self, state: &RenderState, list: &GeometryList) {
        self.reset_write_masks();
        let gl = &self.gl;
        gl.disable(glow::STENCIL_TEST);
        let color = Self::color6665(state.clear_color_6665());
        let clear_id = (state.clear_poly_id & SideChannel::POLY_ID_MASK) as f32 / 63.0;
        gl.clear_buffer_f32_slice(
            glow::COLOR,
            0,
            &[color[0] / 63.0, color[1] / 63.0, color[2] / 63.0, color[3] / 31.0],
        );
        gl.clear_buffer_f32_slice(
            glow::COLOR,
            1,
            &[clear_id, if state.clear_fog { 1.0 } else { 0.0 }, 0.0, 0.0],
        );
        let depth = state.clear_depth24() as f32 / DEPTH_SCALE;
        if self.targets.has_stencil {
            let stencil = SideChannel::opaque(state.clear_poly_id).0 as i32;
            gl.clear_buffer_depth_stencil(glow::DEPTH_STENCIL, 0, depth, stencil);
        } else {
            gl.clear_buffer_f32_slice(glow::DEPTH, 0, &[depth]);
        }

        if state.clear_image.is_none() {
            return;
        }
        let (color_px, depth_px) = clear_image_pixels(state, list);
        for (texture, pixels) in [
            (self.targets.clear_color, &color_px),
            (self.targets.clear_depth, &depth_px),
        ] {
            gl.bind_texture(glow::TEXTURE_2D, Some(texture));
            gl.pixel_store_i32(glow::UNPACK_ALIGNMENT, 1);
            gl.tex_image_2d(
                glow::TEXTURE_2D,
                0,
                glow::RGBA8 as i32,
                NATIVE_WIDTH as i32,
                NATIVE_HEIGHT as i32,
                0,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                Some(pixels.as_slice()),
            );
        }
        let program = self.programs.clear_image;
        gl.use_program(Some(program));
        self.bind_sampler(program, "u_clear_color", 0, self.targets.clear_color);
        self.bind_sampler(program, "u_clear_depth", 1, self.targets.clear_depth);
        self.set_f32(program, "u_clear_id", clear_id);
        let gl = &self.gl;
        gl.enable(glow::DEPTH_TEST);
        gl.depth_func(glow::ALWAYS);
        self.draw_fullscreen();
    }

    unsafe fn clear_side_bits(&self, mask: u8) {
        let gl = &self.gl;
        if !self.targets.has_stencil {
            return;
        }
        gl.stencil_mask(mask as u32);
        gl.clear_buffer_depth_stencil(glow::STENCIL, 0, 0.0, 0);
        gl.stencil_mask(0xFF);
        // the translucent group gates facing ties on the attributes as they stand now
        self.targets
            .copy_attachment(gl, glow::COLOR_ATTACHMENT1, self.targets.scratch_attr_fbo);
    }

    unsafe fn mark_non_zero_alpha(&self) {
        if !self.targets.has_stencil {
            return;
        }
        let gl = &self.gl;
        self.targets
            .copy_attachment(gl, glow::COLOR_ATTACHMENT0, self.targets.scratch_color_fbo);
        let program = self.programs.zero_alpha;
        gl.use_program(Some(program));
        self.bind_sampler(program, "u_color", 0, self.targets.scratch_color);
        gl.color_mask(false, false, false, false);
        gl.depth_mask(false);
        gl.disable(glow::DEPTH_TEST);
        gl.enable(glow::STENCIL_TEST);
        let bit = SideChannel::TRANSLUCENT_BIT;
        gl.stencil_func(glow::ALWAYS, bit as i32, bit as u32);
        gl.stencil_op(glow::KEEP, glow::KEEP, glow::REPLACE);
        gl.stencil_mask(bit as u32);
        self.draw_fullscreen();
        self.reset_write_masks();
    }

    unsafe fn apply_pass(&self, pass: &DrawPass, draw: &PolygonDraw, state: &RenderState) {
        let gl = &self.gl;
        let program = self.programs.geometry;

        gl.enable(glow::DEPTH_TEST);
        gl.depth_func(compare_func(pass.depth_func));
        gl.depth_mask(pass.depth_write);

        if self.targets.has_stencil {
            gl.enable(glow::STENCIL_TEST);
            let pred = pass.predicate;
            gl.stencil_func(compare_func(pred.func), pred.reference as i32, pred.mask as u32);
            gl.stencil_op(
                stencil_op(pass.writes.on_predicate_fail),
                stencil_op(pass.writes.on_depth_fail),
                stencil_op(pass.writes.on_depth_pass),
            );
            gl.stencil_mask(pass.writes.write_mask as u32);
        } else {
            gl.disable(glow::STENCIL_TEST);
        }

        let color = pass.color_write;
        gl.color_mask_draw_buffer(0, color, color, color, color && pass.alpha_write);
        let attrs = color && pass.attribute_write;
        if draw.opaque_attrs {
            gl.color_mask_draw_buffer(1, attrs, attrs, attrs, attrs);
        } else {
            // translucent fragments keep the opaque ID and can only clear the fog flag
            gl.color_mask_draw_buffer(1, false, attrs && !draw.fog, false, false);
        }

        if pass.blend && color && pass.alpha_write && state.enable_alpha_blending {
            gl.enable_draw_buffer(glow::BLEND, 0);
        } else {
            gl.disable_draw_buffer(glow::BLEND, 0);
        }
        gl.disable_draw_buffer(glow::BLEND, 1);

        self.set_f32(program, "u_depth_offset", pass.depth_offset as f32);
        self.set_i32(program, "u_filter", filter_index(pass.filter));
        self.set_i32(program, "u_facing_gate", pass.require_dst_back_facing as i32);
    }

    #[allow(clippy::too_many_arguments)]
    unsafe fn draw_polygon(
        &mut self,
        list: &GeometryList,
        state: &RenderState,
        clipped_index: usize,
        group: DrawGroup,
        passes: &[DrawPass],
        range: DrawRange,
        texturing: bool,
    ) {
        let clipped = &list.clipped[clipped_index];
        let poly = *list.polygon(clipped);
        let program = self.programs.geometry;

        let texture = if texturing {
            self.textures
                .get_or_decode(poly.tex_params, poly.tex_palette, &list.texture_memory)
        } else {
            None
        };
        let textured = match &texture {
            Some(tex) => match self.bind_polygon_texture(tex, poly.tex_params) {
                Ok(()) => true,
                Err(e) => {
                    log(LogCategory::Gpu, LogLevel::Warn, || format!("texture upload failed: {}", e));
                    false
                }
            },
            None => false,
        };
        self.gl.use_program(Some(program));
        self.set_i32(program, "u_textured", textured as i32);
        if let Some(tex) = &texture {
            self.set_vec2(program, "u_texture_size", tex.width as f32, tex.height as f32);
        }

        let wireframe = poly.attr.is_wireframe();
        let mode = poly.attr.mode();
        self.set_i32(program, "u_mode", mode_index(mode));
        self.set_f32(
            program,
            "u_poly_alpha",
            if wireframe { 31.0 } else { poly.attr.alpha() as f32 },
        );
        let fog = poly.attr.fog_enabled();
        self.set_vec4(
            program,
            "u_attr",
            [
                poly.attr.polygon_id() as f32 / 63.0,
                fog as u8 as f32,
                clipped.back_facing as u8 as f32,
                wireframe as u8 as f32,
            ],
        );

        let draw = PolygonDraw {
            range,
            opaque_attrs: group == DrawGroup::Opaque,
            fog,
        };
        self.gl.bind_vertex_array(Some(self.vao));
        for pass in passes {
            let draw = PolygonDraw {
                opaque_attrs: draw.opaque_attrs || pass.filter == FragmentFilter::OpaqueTexels,
                ..draw
            };
            self.apply_pass(pass, &draw, state);
            self.gl
                .draw_arrays(draw.range.primitive, draw.range.first, draw.range.count);
        }
    }

    unsafe fn set_frame_uniforms(&self, state: &RenderState) {
        let program = self.programs.geometry;
        let gl = &self.gl;
        gl.use_program(Some(program));
        self.set_i32(program, "u_highlight", (state.shading == ShadingMode::Highlight) as i32);
        let toon: Vec<f32> = state
            .toon_colors()
            .iter()
            .flat_map(|c| [c.r as f32, c.g as f32, c.b as f32])
            .collect();
        let loc = self.uniform_location(program, "u_toon");
        gl.uniform_3_f32_slice(loc.as_ref(), &toon);
        self.set_i32(program, "u_alpha_test", state.enable_alpha_test as i32);
        self.set_f32(program, "u_alpha_ref", state.alpha_test_ref as f32);
        self.set_i32(program, "u_w_buffer", state.w_buffer as i32);
        self.set_vec2(
            program,
            "u_framebuffer_size",
            self.targets.width as f32,
            self.targets.height as f32,
        );
        self.set_i32(program, "u_texture", 0);
        self.bind_sampler(program, "u_attr_snapshot", 1, self.targets.scratch_attr);

        gl.blend_equation_separate(glow::FUNC_ADD, glow::MAX);
        gl.blend_func_separate(glow::SRC_ALPHA, glow::ONE_MINUS_SRC_ALPHA, glow::ONE, glow::ONE);
    }

    unsafe fn execute_plan(&mut self, plan: &FramePlan, state: &RenderState, list: &GeometryList) {
        let (width, height) = (self.targets.width, self.targets.height);
        let (vertices, ranges) = build_vertices(list, plan, width, height, self.settings.enable_line_hack);
        let texturing = self.settings.enable_textures && state.enable_texturing;

        self.gl.bind_framebuffer(glow::FRAMEBUFFER, Some(self.targets.draw_fbo()));
        self.gl.viewport(0, 0, width as i32, height as i32);
        self.gl.bind_vertex_array(Some(self.vao));
        self.gl.bind_buffer(glow::ARRAY_BUFFER, Some(self.vbo));
        self.gl.buffer_data_u8_slice(
            glow::ARRAY_BUFFER,
            bytemuck::cast_slice(&vertices),
            glow::STREAM_DRAW,
        );

        for step in &plan.steps {
            match step {
                FrameStep::Clear => {
                    self.clear_frame(state, list);
                    self.set_frame_uniforms(state);
                }
                FrameStep::ClearSideBits { mask } => self.clear_side_bits(*mask),
                FrameStep::MarkNonZeroAlpha => {
                    self.mark_non_zero_alpha();
                    self.set_frame_uniforms(state);
                }
                FrameStep::DrawPolygon {
                    clipped_index,
                    group,
                    passes,
                } => {
                    let Some(range) = ranges[*clipped_index] else {
                        continue;
                    };
                    self.draw_polygon(
                        list,
                        state,
                        *clipped_index,
                        *group,
                        plan.passes(passes),
                        range,
                        texturing,
                    );
                }
            }
        }
        self.reset_write_masks();
        self.gl.disable(glow::STENCIL_TEST);
        self.gl.bind_vertex_array(None);
        self.gl.bind_framebuffer(glow::FRAMEBUFFER, None);
    }

    unsafe fn run_postprocess(&self, edge: Option<&EdgeMarkParams>, fog: Option<&FogUniforms>) {
        let gl = &self.gl;
        let program = self.programs.postprocess;
        gl.bind_framebuffer(glow::FRAMEBUFFER, Some(self.targets.post_fbo));
        gl.viewport(0, 0, self.targets.width as i32, self.targets.height as i32);
        gl.disable(glow::DEPTH_TEST);
        gl.disable(glow::STENCIL_TEST);
        self.reset_write_masks();
        gl.use_program(Some(program));
        self.bind_sampler(program, "u_color", 0, self.targets.color);
        self.bind_sampler(program, "u_attr", 1, self.targets.attr);
        self.bind_sampler(program, "u_depth", 2, self.targets.depth_stencil);

        self.set_i32(program, "u_edge_mark", edge.is_some() as i32);
        if let Some(edge) = edge {
            let colors: Vec<f32> = edge.colors.iter().flat_map(|&c| Self::color6665(c)).collect();
            let loc = self.uniform_location(program, "u_edge_colors");
            gl.uniform_4_f32_slice(loc.as_ref(), &colors);
            self.set_f32(program, "u_clear_id", edge.clear_poly_id as f32);
            self.set_f32(program, "u_clear_depth", edge.clear_depth as f32);
        }

        self.set_i32(program, "u_fog", fog.is_some() as i32);
        if let Some(fog) = fog {
            self.set_i32(program, "u_fog_alpha_only", fog.params.alpha_only as i32);
            self.set_vec4(program, "u_fog_color", Self::color6665(fog.params.color));
            self.set_f32(program, "u_fog_offset", fog.offset);
            self.set_f32(program, "u_fog_step", fog.step);
            let loc = self.uniform_location(program, "u_fog_density");
            gl.uniform_1_f32_slice(loc.as_ref(), &fog.densities);
        }
        self.draw_fullscreen();
    }

    /// Read the finished frame back, top row first
    unsafe fn read_frame(&mut self, fbo: glow::Framebuffer) {
        let (w, h) = (self.targets.width, self.targets.height);
        self.readback.resize(w * h * 4, 0);
        let gl = &self.gl;
        gl.bind_framebuffer(glow::FRAMEBUFFER, Some(fbo));
        gl.read_buffer(glow::COLOR_ATTACHMENT0);
        gl.pixel_store_i32(glow::PACK_ALIGNMENT, 1);
        gl.read_pixels(
            0,
            0,
            w as i32,
            h as i32,
            glow::RGBA,
            glow::UNSIGNED_BYTE,
            glow::PixelPackData::Slice(&mut self.readback),
        );
        gl.bind_framebuffer(glow::FRAMEBUFFER, None);

        self.frame.resize(w * h, Color4u8::TRANSPARENT);
        let expand = self.format == ColorFormat::Rgb888;
        for y in 0..h {
            let src_row = &self.readback[(h - 1 - y) * w * 4..(h - y) * w * 4];
            let dst_row = &mut self.frame[y * w..(y + 1) * w];
            for (dst, px) in dst_row.iter_mut().zip(src_row.chunks_exact(4)) {
                let c = Color4u8::new(px[0], px[1], px[2], px[3]);
                *dst = if expand { c } else { c.to_6665() };
            }
        }
    }

    fn publish(&self, flush_32: bool, flush_16: bool) -> Render3DResult<()> {
        let index = self.color_out.bind_renderer().ok_or_else(|| {
            Render3DError::InvalidBuffer("no color output slot available".to_string())
        })?;
        let expanded = self.format == ColorFormat::Rgb888;
        self.color_out.write(index, |buffers| {
            if flush_32 {
                for (out, c) in buffers.buffer32.iter_mut().zip(&self.frame) {
                    *out = *c;
                }
            }
            if flush_16 {
                for (out, c) in buffers.buffer16.iter_mut().zip(&self.frame) {
                    let c = if expanded { c.to_6665() } else { *c };
                    *out = c.to_5551();
                }
            }
        })?;
        self.color_out.unbind_renderer(index)
    }
}

impl Drop for OpenGLRenderer {
    fn drop(&mut self) {
        self.clear_gpu_textures();
        unsafe {
            self.targets.delete(&self.gl);
            self.programs.delete(&self.gl);
            self.gl.delete_vertex_array(self.vao);
            self.gl.delete_vertex_array(self.fullscreen_vao);
            self.gl.delete_buffer(self.vbo);
        }
    }
}

impl Render3D for OpenGLRenderer {
    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            renderer_id: renderer_id_for(self.version),
            name: self.name.clone(),
            texturing_supported: true,
            edge_mark_supported: true,
            fog_supported: true,
            texture_smoothing_supported: true,
            max_anisotropy: self.max_anisotropy,
            max_samples: self.caps.max_samples.min(u8::MAX as u32) as u8,
        }
    }

    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn reset(&mut self) -> Render3DResult<()> {
        self.render_finish()?;
        self.textures.invalidate();
        self.clear_gpu_textures();
        self.frame.fill(Color4u8::TRANSPARENT);
        self.color_out.fill_zero()
    }

    fn apply_rendering_settings(&mut self, settings: &RenderSettings) -> Render3DResult<()> {
        self.render_finish()?;
        let diff = self.settings.diff(settings);
        if !diff.any() {
            return Ok(());
        }
        self.settings = settings.clone();
        if diff.texture_filtering {
            self.clear_gpu_textures();
        }
        if diff.multisample {
            let (w, h) = (self.targets.width, self.targets.height);
            self.rebuild_targets(w, h)?;
        }
        log(LogCategory::Render3D, LogLevel::Debug, || {
            format!("{} settings applied: {:?}", self.name, diff)
        });
        Ok(())
    }

    fn render(&mut self, state: &RenderState, list: &GeometryList) -> Render3DResult<()> {
        self.render_finish()?;
        list.validate()?;

        self.textures.begin_frame();
        let opts = PlanOptions::new(&self.settings, state, &self.caps);
        let plan = build_frame_plan(list, &opts);
        unsafe { self.execute_plan(&plan, state, list) };

        let edge = (state.enable_edge_marking && self.settings.enable_edge_mark)
            .then(|| EdgeMarkParams::from_state(state));
        let fog = (state.enable_fog && self.settings.enable_fog).then(|| FogUniforms::from_state(state));
        self.pending_post = Some((edge, fog));
        self.needs_finish = true;
        Ok(())
    }

    fn render_finish(&mut self) -> Render3DResult<()> {
        if !self.needs_finish {
            return Ok(());
        }
        self.needs_finish = false;
        let (edge, fog) = self.pending_post.take().unwrap_or((None, None));
        unsafe {
            self.targets.resolve(&self.gl);
            if edge.is_some() || fog.is_some() {
                self.run_postprocess(edge.as_ref(), fog.as_ref());
                self.read_frame(self.targets.post_fbo);
            } else {
                self.read_frame(self.targets.fbo);
            }
        }
        Ok(())
    }

    fn render_flush(&mut self, flush_32: bool, flush_16: bool) -> Render3DResult<()> {
        self.render_finish()?;
        if !flush_32 && !flush_16 {
            return Ok(());
        }
        self.publish(flush_32, flush_16)
    }

    fn render_power_off(&mut self) -> Render3DResult<()> {
        self.render_finish()?;
        self.frame.fill(Color4u8::TRANSPARENT);
        self.color_out.fill_zero()
    }

    fn vram_reconfigure_signal(&mut self) {
        self.textures.invalidate();
        self.clear_gpu_textures();
    }

    fn set_framebuffer_size(&mut self, width: usize, height: usize) -> Render3DResult<()> {
        validate_framebuffer_size(width, height)?;
        self.render_finish()?;
        if (width, height) == (self.targets.width, self.targets.height) {
            return Ok(());
        }
        self.rebuild_targets(width, height)
    }

    fn framebuffer_size(&self) -> (usize, usize) {
        (self.targets.width, self.targets.height)
    }

    fn request_color_format(&mut self, format: ColorFormat) -> ColorFormat {
        self.format = resolve_color_format(format);
        self.color_out.set_format(self.format);
        self.format
    }

    fn color_format(&self) -> ColorFormat {
        self.format
    }

    fn color_out(&self) -> Arc<ColorOut> {
        Arc::clone(&self.color_out)
    }

    fn render_needs_finish(&self) -> bool {
        self.needs_finish
    }
}

/// Hands one GL context to the renderer it creates
pub struct OpenGLRendererFactory {
    context: Mutex<Option<SendContext>>,
    settings: RenderSettings,
}

impl OpenGLRendererFactory {
    pub fn new(gl: glow::Context, settings: RenderSettings) -> Self {
        Self {
            context: Mutex::new(Some(SendContext(gl))),
            settings,
        }
    }
}

impl RendererFactory for OpenGLRendererFactory {
    fn id(&self) -> RendererId {
        RendererId::OpenGlAuto
    }

    fn name(&self) -> &str {
        "OpenGL"
    }

    fn init(&self) -> Render3DResult<Box<dyn Render3D>> {
        let context = self
            .context
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| Render3DError::ResourceCreate("GL context already in use".to_string()))?;
        let renderer = OpenGLRenderer::new(context.0, &self.settings).map_err(Render3DError::ResourceCreate)?;
        Ok(Box::new(renderer))
    }
}
