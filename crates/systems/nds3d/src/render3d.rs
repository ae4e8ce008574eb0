//! Renderer trait - the lifecycle every 3D backend implements
//!
//! A front-end picks a backend through a [`RendererFactory`], then drives it once per frame:
//!
//! ```text
//! apply_rendering_settings? -> render(state, geometry) -> render_finish -> render_flush
//! ```
//!
//! `render` may return before the frame is done (the software backend hands rows to its
//! workers); `render_finish` is the only point that blocks, and nothing may read the output
//! before it returns. Settings and framebuffer size only change between frames: both finish an
//! in-flight frame first.
//!
//! Backends that lack a feature the full compositing algorithm needs keep running with reduced
//! fidelity. They report that once per instance through [`DegradedReport`].

use std::sync::Arc;

use emu_core::logging::{log, LogCategory, LogLevel};

use crate::color_out::{ColorFormat, ColorOut};
use crate::geometry::GeometryList;
use crate::render3d_software::SoftRasterizerFactory;
use crate::settings::{Capabilities, RenderSettings};
use crate::state::RenderState;
use crate::{Render3DError, Render3DResult, MAX_FRAMEBUFFER_SCALE, NATIVE_HEIGHT, NATIVE_WIDTH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RendererId {
    Null = 0,
    SoftRasterizer = 1,
    OpenGlAuto = 1000,
    OpenGlLegacy = 1001,
    OpenGl32 = 1002,
    OpenGlEs = 1003,
}

/// What a renderer reports about itself to the front-end
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub renderer_id: RendererId,
    pub name: String,
    pub texturing_supported: bool,
    pub edge_mark_supported: bool,
    pub fog_supported: bool,
    pub texture_smoothing_supported: bool,
    pub max_anisotropy: f32,
    pub max_samples: u8,
}

pub trait Render3D: Send {
    fn device_info(&self) -> DeviceInfo;

    fn capabilities(&self) -> Capabilities;

    fn name(&self) -> &str;

    /// Drop all cached backend state and clear the output
    fn reset(&mut self) -> Render3DResult<()>;

    /// Apply new settings; an in-flight frame is finished first
    fn apply_rendering_settings(&mut self, settings: &RenderSettings) -> Render3DResult<()>;

    /// Start rendering a frame from the snapshot
    fn render(&mut self, state: &RenderState, list: &GeometryList) -> Render3DResult<()>;

    /// Block until the current frame is complete; a no-op when nothing is in flight
    fn render_finish(&mut self) -> Render3DResult<()>;

    /// Publish the finished frame as 32-bit and/or RGB555 output
    fn render_flush(&mut self, flush_32: bool, flush_16: bool) -> Render3DResult<()>;

    /// Clear the output to black
    fn render_power_off(&mut self) -> Render3DResult<()>;

    /// Texture VRAM mapping changed
    fn vram_reconfigure_signal(&mut self);

    /// Sizes below 256x192 are rejected and the current size is kept
    fn set_framebuffer_size(&mut self, width: usize, height: usize) -> Render3DResult<()>;

    fn framebuffer_size(&self) -> (usize, usize);

    /// Returns the format actually used
    fn request_color_format(&mut self, format: ColorFormat) -> ColorFormat;

    fn color_format(&self) -> ColorFormat;

    /// Shared output buffers for readers on other threads
    fn color_out(&self) -> Arc<ColorOut>;

    fn render_needs_finish(&self) -> bool;
}

/// Reject framebuffer sizes below the native resolution or above its largest scale
pub fn validate_framebuffer_size(width: usize, height: usize) -> Render3DResult<()> {
    if width < NATIVE_WIDTH || height < NATIVE_HEIGHT {
        return Err(Render3DError::InvalidValue(format!(
            "framebuffer {}x{} is smaller than {}x{}",
            width, height, NATIVE_WIDTH, NATIVE_HEIGHT
        )));
    }
    let (max_w, max_h) = (
        NATIVE_WIDTH * MAX_FRAMEBUFFER_SCALE,
        NATIVE_HEIGHT * MAX_FRAMEBUFFER_SCALE,
    );
    if width > max_w || height > max_h || width.checked_mul(height).is_none() {
        return Err(Render3DError::InvalidValue(format!(
            "framebuffer {}x{} exceeds {}x{}",
            width, height, max_w, max_h
        )));
    }
    Ok(())
}

/// The color format a request resolves to; 555 output is rendered in 6665
pub fn resolve_color_format(requested: ColorFormat) -> ColorFormat {
    match requested {
        ColorFormat::Rgb555 => ColorFormat::Rgb666,
        other => other,
    }
}

/// Logs a degraded mode the first time it happens
#[derive(Debug, Default)]
pub struct DegradedReport {
    reported: bool,
}

impl DegradedReport {
    /// Returns true if this call emitted the report
    pub fn report(&mut self, renderer: &str, reason: &str) -> bool {
        if self.reported {
            return false;
        }
        self.reported = true;
        log(LogCategory::Render3D, LogLevel::Warn, || {
            format!("{}: running with reduced fidelity: {}", renderer, reason)
        });
        true
    }

    pub fn is_reported(&self) -> bool {
        self.reported
    }
}

/// Creates renderers of one kind
pub trait RendererFactory: Send + Sync {
    fn id(&self) -> RendererId;

    fn name(&self) -> &str;

    fn init(&self) -> Render3DResult<Box<dyn Render3D>>;

    fn close(&self, renderer: Box<dyn Render3D>) {
        log(LogCategory::Render3D, LogLevel::Debug, || {
            format!("closing {}", renderer.name())
        });
        drop(renderer);
    }
}

/// A renderer that draws nothing
pub struct NullRenderer {
    color_out: Arc<ColorOut>,
    width: usize,
    height: usize,
    format: ColorFormat,
}

impl Default for NullRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl NullRenderer {
    pub fn new() -> Self {
        Self {
            color_out: Arc::new(ColorOut::default()),
            width: NATIVE_WIDTH,
            height: NATIVE_HEIGHT,
            format: ColorFormat::Rgb666,
        }
    }
}

impl Render3D for NullRenderer {
    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            renderer_id: RendererId::Null,
            name: self.name().to_string(),
            texturing_supported: false,
            edge_mark_supported: false,
            fog_supported: false,
            texture_smoothing_supported: false,
            max_anisotropy: 1.0,
            max_samples: 0,
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_shaders: false,
            supports_stencil: false,
            supports_fbo: false,
            supports_multisample: false,
            max_samples: 0,
            max_workers: 0,
        }
    }

    fn name(&self) -> &str {
        "None"
    }

    fn reset(&mut self) -> Render3DResult<()> {
        self.color_out.fill_zero()
    }

    fn apply_rendering_settings(&mut self, _settings: &RenderSettings) -> Render3DResult<()> {
        Ok(())
    }

    fn render(&mut self, _state: &RenderState, _list: &GeometryList) -> Render3DResult<()> {
        Ok(())
    }

    fn render_finish(&mut self) -> Render3DResult<()> {
        Ok(())
    }

    fn render_flush(&mut self, flush_32: bool, flush_16: bool) -> Render3DResult<()> {
        if flush_32 || flush_16 {
            self.color_out.fill_zero()?;
        }
        Ok(())
    }

    fn render_power_off(&mut self) -> Render3DResult<()> {
        self.color_out.fill_zero()
    }

    fn vram_reconfigure_signal(&mut self) {}

    fn set_framebuffer_size(&mut self, width: usize, height: usize) -> Render3DResult<()> {
        validate_framebuffer_size(width, height)?;
        self.color_out.set_size(width, height);
        self.width = width;
        self.height = height;
        Ok(())
    }

    fn framebuffer_size(&self) -> (usize, usize) {
        (self.width, self.height)
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
        false
    }
}

pub struct NullRendererFactory;

impl RendererFactory for NullRendererFactory {
    fn id(&self) -> RendererId {
        RendererId::Null
    }

    fn name(&self) -> &str {
        "None"
    }

    fn init(&self) -> Render3DResult<Box<dyn Render3D>> {
        Ok(Box::new(NullRenderer::new()))
    }
}

/// Factories that need no external context, in menu order
pub fn core_3d_list() -> Vec<Box<dyn RendererFactory>> {
    vec![
        Box::new(NullRendererFactory),
        Box::new(SoftRasterizerFactory::default()),
    ]
}

/// Look a context-free factory up by ID
pub fn find_factory(id: RendererId) -> Option<Box<dyn RendererFactory>> {
    core_3d_list().into_iter().find(|f| f.id() == id)
}
