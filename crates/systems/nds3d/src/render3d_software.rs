//! Software rasterizer backend
//!
//! # Architecture
//!
//! The framebuffer is split into horizontal bands, one per worker. Each worker thread owns its
//! band (color plus fragment attributes) for its whole life and receives jobs over a channel:
//!
//! 1. **Geometry**: run the frame plan over the band. Every covered pixel of a polygon goes
//!    through that polygon's pass list in order, the same way the GPU backend runs its
//!    stencil passes.
//! 2. **Postprocess**: edge marking and fog, once every band has finished geometry. Edge
//!    marking reads one row above and below the band; those halos are copied out between the
//!    two jobs.
//!
//! Bands never overlap, so the result does not depend on the worker count. With a single
//! worker everything runs inline on the calling thread.

use std::ops::Range;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use emu_core::graphics::Color4u8;
use emu_core::logging::{log, LogCategory, LogLevel};

use crate::color_out::{ColorFormat, ColorOut};
use crate::composite::{build_frame_plan, FramePlan, FrameStep, PlanOptions};
use crate::fragment::{FragmentAttributes, FragmentAttributesBuffer, PolyFacing};
use crate::geometry::{project, GeometryList, PolygonMode, ScreenVertex};
use crate::postprocess::{edge_mark, fog, AttrBlock, EdgeMarkParams, EdgeRow, FogParams};
use crate::rasterizer::{Fragment, RasterOptions, RasterPolygon};
use crate::render3d::{
    resolve_color_format, validate_framebuffer_size, DegradedReport, DeviceInfo, Render3D,
    RendererFactory, RendererId,
};
use crate::settings::{Capabilities, RenderSettings, MAX_RENDER_THREADS};
use crate::shading::shade;
use crate::side_channel::{DrawPass, PassOutcome, SideChannel};
use crate::state::{RenderState, ShadingMode};
use crate::texture::{DecodedTexture, TexParams, TextureCache, TextureMemory};
use crate::{Render3DError, Render3DResult, NATIVE_HEIGHT, NATIVE_WIDTH};

const RENDERER_NAME: &str = "SoftRasterizer";

/// A polygon projected, set up for scanning and with its texture resolved
struct PreparedPolygon {
    raster: RasterPolygon,
    mode: PolygonMode,
    id: u8,
    alpha: u8,
    fog: bool,
    wireframe: bool,
    facing: PolyFacing,
    texture: Option<Arc<DecodedTexture>>,
    tex_params: TexParams,
}

/// Everything the workers need to draw one frame
struct FrameJob {
    plan: FramePlan,
    /// Indexed by clipped polygon index; `None` for polygons the plan never draws
    polygons: Vec<Option<PreparedPolygon>>,
    state: RenderState,
    toon: [Color4u8; 32],
    shading: ShadingMode,
    raster: RasterOptions,
    texture_memory: Arc<TextureMemory>,
}

struct PostJob {
    edge: Option<EdgeMarkParams>,
    fog: Option<FogParams>,
    /// (above, below) halo rows for each band
    halos: Vec<(Option<EdgeRow>, Option<EdgeRow>)>,
    height: usize,
}

enum WorkerJob {
    Geometry(Arc<FrameJob>),
    Postprocess(Arc<PostJob>),
    Shutdown,
}

/// One band of the framebuffer
struct ScanlineSlice {
    rows: Range<usize>,
    width: usize,
    color: Vec<Color4u8>,
    attrs: FragmentAttributesBuffer,
}

impl ScanlineSlice {
    fn new(rows: Range<usize>, width: usize) -> Self {
        let len = rows.len() * width;
        Self {
            rows,
            width,
            color: vec![Color4u8::TRANSPARENT; len],
            attrs: FragmentAttributesBuffer::new(len),
        }
    }

    fn run(&mut self, job: &WorkerJob, band: usize) {
        match job {
            WorkerJob::Geometry(frame) => self.draw_frame(frame),
            WorkerJob::Postprocess(post) => self.postprocess(post, band),
            WorkerJob::Shutdown => {}
        }
    }

    fn draw_frame(&mut self, job: &FrameJob) {
        for step in &job.plan.steps {
            match step {
                FrameStep::Clear => self.clear(job),
                FrameStep::ClearSideBits { mask } => {
                    for side in self.attrs.side.iter_mut() {
                        side.clear_bits(*mask);
                    }
                }
                FrameStep::MarkNonZeroAlpha => {
                    for (side, color) in self.attrs.side.iter_mut().zip(&self.color) {
                        if color.a != 0 {
                            side.set_bits(SideChannel::TRANSLUCENT_BIT);
                        }
                    }
                }
                FrameStep::DrawPolygon {
                    clipped_index,
                    passes,
                    ..
                } => {
                    if let Some(Some(poly)) = job.polygons.get(*clipped_index) {
                        self.draw_polygon(job, poly, job.plan.passes(passes));
                    }
                }
            }
        }
    }

    fn clear(&mut self, job: &FrameJob) {
        let state = &job.state;
        if state.clear_image.is_none() {
            self.color.fill(state.clear_color_6665());
            self.attrs.fill(state.clear_attributes());
            return;
        }
        let (width, height) = (job.raster.width, job.raster.height);
        for (ly, y) in self.rows.clone().enumerate() {
            for x in 0..width {
                let (color, attr) = state.clear_fragment(&job.texture_memory, x, y, width, height);
                let i = ly * width + x;
                self.color[i] = color;
                self.attrs.set_at_index(i, attr);
            }
        }
    }

    fn draw_polygon(&mut self, job: &FrameJob, poly: &PreparedPolygon, passes: &[DrawPass]) {
        let poly_rows = poly.raster.rows();
        let rows = self.rows.start.max(poly_rows.start)..self.rows.end.min(poly_rows.end);
        if rows.is_empty() {
            return;
        }
        let band_start = self.rows.start;
        let width = self.width;
        poly.raster.rasterize(rows, &job.raster, |frag| {
            let i = (frag.y - band_start) * width + frag.x;
            self.shade_fragment(job, poly, passes, i, &frag);
        });
    }

    fn shade_fragment(
        &mut self,
        job: &FrameJob,
        poly: &PreparedPolygon,
        passes: &[DrawPass],
        i: usize,
        frag: &Fragment,
    ) {
        let texel = poly
            .texture
            .as_ref()
            .map(|tex| tex.sample(poly.tex_params, frag.s, frag.t));
        let src = shade(poly.mode, job.shading, &job.toon, frag.color, texel, poly.alpha);
        if src.a == 0 {
            return;
        }
        if job.state.enable_alpha_test && src.a <= job.state.alpha_test_ref {
            return;
        }
        let texel_alpha = texel.map_or(31, |t| t.a);

        for pass in passes {
            if !pass.filter.accepts(texel_alpha) {
                continue;
            }
            if pass.require_dst_back_facing && self.attrs.facing[i] != PolyFacing::Back {
                continue;
            }
            let depth = match pass.resolve(&mut self.attrs.side[i], self.attrs.depth[i], frag.depth) {
                PassOutcome::Passed(depth) => depth,
                PassOutcome::PredicateFailed | PassOutcome::DepthFailed => continue,
            };
            if pass.depth_write {
                self.attrs.depth[i] = depth;
            }
            if pass.color_write {
                self.write_color(job, pass, poly, i, src);
            }
        }
    }

    fn write_color(&mut self, job: &FrameJob, pass: &DrawPass, poly: &PreparedPolygon, i: usize, src: Color4u8) {
        let dst = self.color[i];
        self.color[i] = if !pass.alpha_write {
            Color4u8::new(src.r, src.g, src.b, dst.a)
        } else if pass.blend && src.a < 31 && job.state.enable_alpha_blending {
            Color4u8::blend(src, dst, false)
        } else {
            src
        };

        if !pass.attribute_write {
            return;
        }
        if src.a >= 31 {
            self.attrs.opaque_poly_id[i] = poly.id;
            self.attrs.is_translucent[i] = false;
            self.attrs.is_fogged[i] = poly.fog;
            self.attrs.facing[i] = poly.facing;
            self.attrs.is_wireframe[i] = poly.wireframe;
        } else {
            self.attrs.translucent_poly_id[i] = poly.id;
            self.attrs.is_translucent[i] = true;
            self.attrs.is_fogged[i] = self.attrs.is_fogged[i] && poly.fog;
        }
    }

    fn postprocess(&mut self, job: &PostJob, band: usize) {
        if let Some(params) = &job.edge {
            let (above, below) = job
                .halos
                .get(band)
                .map_or((None, None), |(a, b)| (a.as_ref(), b.as_ref()));
            let block = AttrBlock {
                attrs: &self.attrs,
                width: self.width,
                rows: self.rows.clone(),
                height: job.height,
                above,
                below,
            };
            edge_mark(&mut self.color, &block, params);
        }
        if let Some(params) = &job.fog {
            fog(&mut self.color, &self.attrs, params);
        }
    }

    fn first_row(&self) -> Option<EdgeRow> {
        (!self.rows.is_empty()).then(|| EdgeRow::from_attrs(&self.attrs, 0, self.width))
    }

    fn last_row(&self) -> Option<EdgeRow> {
        (!self.rows.is_empty())
            .then(|| EdgeRow::from_attrs(&self.attrs, self.rows.len() - 1, self.width))
    }
}

fn lock_slice(slice: &Mutex<ScanlineSlice>) -> MutexGuard<'_, ScanlineSlice> {
    slice.lock().unwrap_or_else(|e| e.into_inner())
}

struct WorkerThread {
    jobs: Sender<WorkerJob>,
    done: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

fn worker_main(band: usize, slice: Arc<Mutex<ScanlineSlice>>, jobs: Receiver<WorkerJob>, done: Sender<()>) {
    while let Ok(job) = jobs.recv() {
        if matches!(job, WorkerJob::Shutdown) {
            break;
        }
        lock_slice(&slice).run(&job, band);
        if done.send(()).is_err() {
            break;
        }
    }
}

/// Split `height` rows into `count` contiguous bands
fn band_ranges(height: usize, count: usize) -> Vec<Range<usize>> {
    let count = count.clamp(1, height.max(1));
    let chunk = height.div_ceil(count);
    (0..count)
        .map(|i| (i * chunk).min(height)..((i + 1) * chunk).min(height))
        .collect()
}

/// Bands plus, when multithreaded, the threads that own them
struct WorkerPool {
    slices: Vec<Arc<Mutex<ScanlineSlice>>>,
    threads: Vec<WorkerThread>,
}

impl WorkerPool {
    fn inline(width: usize, height: usize) -> Self {
        Self {
            slices: vec![Arc::new(Mutex::new(ScanlineSlice::new(0..height, width)))],
            threads: Vec::new(),
        }
    }

    fn spawn(count: usize, width: usize, height: usize) -> Render3DResult<Self> {
        if count <= 1 {
            return Ok(Self::inline(width, height));
        }
        let mut pool = Self {
            slices: Vec::new(),
            threads: Vec::new(),
        };
        for (band, rows) in band_ranges(height, count).into_iter().enumerate() {
            let slice = Arc::new(Mutex::new(ScanlineSlice::new(rows, width)));
            let (job_tx, job_rx) = channel();
            let (done_tx, done_rx) = channel();
            let worker_slice = Arc::clone(&slice);
            let handle = std::thread::Builder::new()
                .name(format!("softrast-{}", band))
                .spawn(move || worker_main(band, worker_slice, job_rx, done_tx))
                .map_err(|e| Render3DError::ResourceCreate(format!("render worker {}: {}", band, e)))?;
            pool.slices.push(slice);
            pool.threads.push(WorkerThread {
                jobs: job_tx,
                done: done_rx,
                handle: Some(handle),
            });
        }
        Ok(pool)
    }

    fn worker_count(&self) -> usize {
        self.slices.len()
    }

    fn is_threaded(&self) -> bool {
        !self.threads.is_empty()
    }

    /// Hand a job to every band; inline pools run it before returning
    fn dispatch(&self, make: impl Fn() -> WorkerJob) -> Render3DResult<()> {
        if !self.is_threaded() {
            for (band, slice) in self.slices.iter().enumerate() {
                lock_slice(slice).run(&make(), band);
            }
            return Ok(());
        }
        for (band, worker) in self.threads.iter().enumerate() {
            worker
                .jobs
                .send(make())
                .map_err(|_| Render3DError::ResourceCreate(format!("render worker {} exited", band)))?;
        }
        Ok(())
    }

    fn wait(&self) -> Render3DResult<()> {
        for (band, worker) in self.threads.iter().enumerate() {
            worker
                .done
                .recv()
                .map_err(|_| Render3DError::ResourceCreate(format!("render worker {} exited", band)))?;
        }
        Ok(())
    }

    fn halos(&self) -> Vec<(Option<EdgeRow>, Option<EdgeRow>)> {
        let edges: Vec<(Option<EdgeRow>, Option<EdgeRow>)> = self
            .slices
            .iter()
            .map(|slice| {
                let slice = lock_slice(slice);
                (slice.first_row(), slice.last_row())
            })
            .collect();
        (0..edges.len())
            .map(|band| {
                let above = band.checked_sub(1).and_then(|prev| edges[prev].1.clone());
                let below = edges.get(band + 1).and_then(|next| next.0.clone());
                (above, below)
            })
            .collect()
    }

    fn for_each_slice(&self, mut f: impl FnMut(&mut ScanlineSlice)) {
        for slice in &self.slices {
            f(&mut lock_slice(slice));
        }
    }

    fn shutdown(&mut self) {
        for worker in &self.threads {
            let _ = worker.jobs.send(WorkerJob::Shutdown);
        }
        for worker in &mut self.threads {
            if let Some(handle) = worker.handle.take() {
                if handle.join().is_err() {
                    log(LogCategory::Raster, LogLevel::Error, || {
                        "render worker panicked".to_string()
                    });
                }
            }
        }
        self.threads.clear();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The CPU renderer
pub struct SoftRasterizer {
    settings: RenderSettings,
    pool: WorkerPool,
    textures: TextureCache,
    color_out: Arc<ColorOut>,
    width: usize,
    height: usize,
    format: ColorFormat,
    needs_finish: bool,
    pending_post: Option<(Option<EdgeMarkParams>, Option<FogParams>)>,
    degraded: DegradedReport,
    frame_count: u64,
}

impl SoftRasterizer {
    pub fn new(settings: &RenderSettings) -> Self {
        let mut renderer = Self {
            settings: settings.clone(),
            pool: WorkerPool::inline(NATIVE_WIDTH, NATIVE_HEIGHT),
            textures: TextureCache::new(),
            color_out: Arc::new(ColorOut::default()),
            width: NATIVE_WIDTH,
            height: NATIVE_HEIGHT,
            format: ColorFormat::Rgb666,
            needs_finish: false,
            pending_post: None,
            degraded: DegradedReport::default(),
            frame_count: 0,
        };
        renderer.rebuild_pool();
        renderer
    }

    /// Number of bands the framebuffer is split into
    pub fn worker_count(&self) -> usize {
        self.pool.worker_count()
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    pub fn texture_cache(&self) -> &TextureCache {
        &self.textures
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Attributes stored at (x, y) by the last finished frame
    pub fn fragment_attributes(&self, x: usize, y: usize) -> Option<FragmentAttributes> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let mut found = None;
        self.pool.for_each_slice(|slice| {
            if slice.rows.contains(&y) {
                found = Some(slice.attrs.get((y - slice.rows.start) * slice.width + x));
            }
        });
        found
    }

    fn rebuild_pool(&mut self) {
        let count = self.settings.resolved_thread_count().min(self.height);
        // drop the old threads before spawning new ones
        self.pool = WorkerPool::inline(self.width, self.height);
        match WorkerPool::spawn(count, self.width, self.height) {
            Ok(pool) => {
                self.pool = pool;
                log(LogCategory::Raster, LogLevel::Info, || {
                    format!("{} using {} render worker(s)", RENDERER_NAME, count)
                });
            }
            Err(e) => {
                self.degraded
                    .report(RENDERER_NAME, &format!("{}; rendering on the calling thread", e));
            }
        }
    }

    fn prepare(&mut self, state: &RenderState, list: &GeometryList) -> FrameJob {
        let caps = self.capabilities();
        let opts = PlanOptions::new(&self.settings, state, &caps);
        let plan = build_frame_plan(list, &opts);

        let texturing = self.settings.enable_textures && state.enable_texturing;
        let mut polygons: Vec<Option<PreparedPolygon>> = Vec::new();
        polygons.resize_with(list.clipped.len(), || None);

        for (clipped_index, _, _) in plan.polygon_steps() {
            if polygons[clipped_index].is_some() {
                continue;
            }
            let clipped = &list.clipped[clipped_index];
            let poly = list.polygon(clipped);
            let verts: Vec<ScreenVertex> = clipped
                .indices()
                .iter()
                .map(|&v| project(&list.vertices[v as usize], &poly.viewport, self.width, self.height))
                .collect();
            let wireframe = poly.attr.is_wireframe();
            let texture = if texturing {
                self.textures
                    .get_or_decode(poly.tex_params, poly.tex_palette, &list.texture_memory)
            } else {
                None
            };
            polygons[clipped_index] = Some(PreparedPolygon {
                raster: RasterPolygon::new(&verts, self.height, wireframe, self.settings.enable_line_hack),
                mode: poly.attr.mode(),
                id: poly.attr.polygon_id(),
                alpha: if wireframe { 31 } else { poly.attr.alpha() },
                fog: poly.attr.fog_enabled(),
                wireframe,
                facing: PolyFacing::from_back_facing(clipped.back_facing),
                texture,
                tex_params: poly.tex_params,
            });
        }

        let scale = (
            self.width as f32 / NATIVE_WIDTH as f32,
            self.height as f32 / NATIVE_HEIGHT as f32,
        );
        FrameJob {
            plan,
            polygons,
            state: state.clone(),
            toon: state.toon_colors(),
            shading: state.shading,
            raster: RasterOptions {
                width: self.width,
                height: self.height,
                w_buffer: state.w_buffer,
                sampling_scale: self.settings.enable_fragment_sampling_hack.then_some(scale),
            },
            texture_memory: Arc::clone(&list.texture_memory),
        }
    }

    fn publish(&self, flush_32: bool, flush_16: bool) -> Render3DResult<()> {
        let index = self.color_out.bind_renderer().ok_or_else(|| {
            Render3DError::InvalidBuffer("no color output slot available".to_string())
        })?;
        let width = self.width;
        let format = self.format;
        self.color_out.write(index, |buffers| {
            self.pool.for_each_slice(|slice| {
                let start = slice.rows.start * width;
                let end = start + slice.color.len();
                if flush_32 {
                    for (out, c) in buffers.buffer32[start..end].iter_mut().zip(&slice.color) {
                        *out = match format {
                            ColorFormat::Rgb888 => c.to_8888(),
                            _ => *c,
                        };
                    }
                }
                if flush_16 {
                    for (out, c) in buffers.buffer16[start..end].iter_mut().zip(&slice.color) {
                        *out = c.to_5551();
                    }
                }
            });
        })?;
        self.color_out.unbind_renderer(index)
    }

    fn clear_bands(&mut self) {
        self.pool.for_each_slice(|slice| {
            slice.color.fill(Color4u8::TRANSPARENT);
        });
    }
}

impl Drop for SoftRasterizer {
    fn drop(&mut self) {
        if self.needs_finish {
            let _ = self.pool.wait();
        }
    }
}

impl Render3D for SoftRasterizer {
    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            renderer_id: RendererId::SoftRasterizer,
            name: RENDERER_NAME.to_string(),
            texturing_supported: true,
            edge_mark_supported: true,
            fog_supported: true,
            texture_smoothing_supported: false,
            max_anisotropy: 1.0,
            max_samples: 0,
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::software(MAX_RENDER_THREADS)
    }

    fn name(&self) -> &str {
        RENDERER_NAME
    }

    fn reset(&mut self) -> Render3DResult<()> {
        self.render_finish()?;
        self.textures.invalidate();
        self.clear_bands();
        self.color_out.fill_zero()
    }

    fn apply_rendering_settings(&mut self, settings: &RenderSettings) -> Render3DResult<()> {
        self.render_finish()?;
        let diff = self.settings.diff(settings);
        if !diff.any() {
            return Ok(());
        }
        self.settings = settings.clone();
        if diff.thread_count {
            self.rebuild_pool();
        }
        if diff.texture_filtering {
            self.textures.invalidate();
        }
        log(LogCategory::Render3D, LogLevel::Debug, || {
            format!("{} settings applied: {:?}", RENDERER_NAME, diff)
        });
        Ok(())
    }

    fn render(&mut self, state: &RenderState, list: &GeometryList) -> Render3DResult<()> {
        self.render_finish()?;
        list.validate()?;

        self.textures.begin_frame();
        let job = Arc::new(self.prepare(state, list));
        log(LogCategory::Raster, LogLevel::Trace, || {
            format!(
                "frame {}: {} steps, {} passes over {} band(s)",
                self.frame_count,
                job.plan.steps.len(),
                job.plan.passes.len(),
                self.pool.worker_count()
            )
        });

        let edge = (state.enable_edge_marking && self.settings.enable_edge_mark)
            .then(|| EdgeMarkParams::from_state(state));
        let fog = (state.enable_fog && self.settings.enable_fog).then(|| FogParams::from_state(state));

        self.pool.dispatch(|| WorkerJob::Geometry(Arc::clone(&job)))?;
        self.pending_post = Some((edge, fog));
        self.needs_finish = true;
        self.frame_count += 1;
        Ok(())
    }

    fn render_finish(&mut self) -> Render3DResult<()> {
        if !self.needs_finish {
            return Ok(());
        }
        self.needs_finish = false;
        self.pool.wait()?;

        let Some((edge, fog)) = self.pending_post.take() else {
            return Ok(());
        };
        if edge.is_none() && fog.is_none() {
            return Ok(());
        }
        let halos = if edge.is_some() {
            self.pool.halos()
        } else {
            Vec::new()
        };
        let post = Arc::new(PostJob {
            edge,
            fog,
            halos,
            height: self.height,
        });
        self.pool.dispatch(|| WorkerJob::Postprocess(Arc::clone(&post)))?;
        self.pool.wait()
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
        self.clear_bands();
        self.color_out.fill_zero()
    }

    fn vram_reconfigure_signal(&mut self) {
        self.textures.invalidate();
    }

    fn set_framebuffer_size(&mut self, width: usize, height: usize) -> Render3DResult<()> {
        validate_framebuffer_size(width, height)?;
        self.render_finish()?;
        if (width, height) == (self.width, self.height) {
            return Ok(());
        }
        self.color_out.set_size(width, height);
        self.width = width;
        self.height = height;
        self.rebuild_pool();
        log(LogCategory::Render3D, LogLevel::Info, || {
            format!("{} framebuffer resized to {}x{}", RENDERER_NAME, width, height)
        });
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
        self.needs_finish
    }
}

/// Creates [`SoftRasterizer`]s with the given settings
#[derive(Debug, Clone, Default)]
pub struct SoftRasterizerFactory {
    pub settings: RenderSettings,
}

impl SoftRasterizerFactory {
    pub fn new(settings: RenderSettings) -> Self {
        Self { settings }
    }
}

impl RendererFactory for SoftRasterizerFactory {
    fn id(&self) -> RendererId {
        RendererId::SoftRasterizer
    }

    fn name(&self) -> &str {
        RENDERER_NAME
    }

    fn init(&self) -> Render3DResult<Box<dyn Render3D>> {
        Ok(Box::new(SoftRasterizer::new(&self.settings)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Polygon, PolygonAttr, Vertex};

    fn settings(threads: usize) -> RenderSettings {
        RenderSettings {
            thread_count: threads,
            ..Default::default()
        }
    }

    fn full_quad(list: &mut GeometryList, attr: PolygonAttr, z: f32, color: [u8; 3]) {
        let v = [
            Vertex::from_ndc(-1.0, 1.0, z, color),
            Vertex::from_ndc(1.0, 1.0, z, color),
            Vertex::from_ndc(1.0, -1.0, z, color),
            Vertex::from_ndc(-1.0, -1.0, z, color),
        ];
        let poly = Polygon {
            attr,
            ..Default::default()
        };
        list.push_polygon(poly, &v, false);
        list.sort_translucent_last();
    }

    fn render_once(renderer: &mut SoftRasterizer, state: &RenderState, list: &GeometryList) -> Vec<Color4u8> {
        renderer.render(state, list).expect("render");
        renderer.render_flush(true, true).expect("flush");
        renderer.color_out().snapshot32().expect("frame")
    }

    #[test]
    fn test_band_ranges_cover_every_row() {
        let bands = band_ranges(192, 5);
        assert_eq!(bands.len(), 5);
        assert_eq!(bands[0].start, 0);
        assert_eq!(bands[4].end, 192);
        for pair in bands.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert_eq!(band_ranges(192, 1), vec![0..192]);
    }

    #[test]
    fn test_empty_frame_is_clear_color() {
        let mut renderer = SoftRasterizer::new(&settings(1));
        let state = RenderState {
            clear_color: 0x001F,
            clear_alpha: 31,
            ..Default::default()
        };
        let frame = render_once(&mut renderer, &state, &GeometryList::default());
        assert_eq!(frame.len(), 256 * 192);
        assert!(frame.iter().all(|&c| c == Color4u8::new(63, 0, 0, 31)));
    }

    #[test]
    fn test_opaque_quad_covers_frame() {
        let mut renderer = SoftRasterizer::new(&settings(1));
        let mut list = GeometryList::default();
        full_quad(&mut list, PolygonAttr::new(PolygonMode::Modulate, 31, 1), 0.0, [0, 63, 0]);
        let frame = render_once(&mut renderer, &RenderState::default(), &list);
        assert_eq!(frame[0], Color4u8::new(0, 63, 0, 31));
        assert_eq!(frame[256 * 192 - 1], Color4u8::new(0, 63, 0, 31));
    }

    #[test]
    fn test_render_needs_finish_until_finished() {
        let mut renderer = SoftRasterizer::new(&settings(2));
        assert!(!renderer.render_needs_finish());
        renderer
            .render(&RenderState::default(), &GeometryList::default())
            .expect("render");
        assert!(renderer.render_needs_finish());
        renderer.render_finish().expect("finish");
        assert!(!renderer.render_needs_finish());
        // a second finish is a no-op
        renderer.render_finish().expect("finish");
    }

    #[test]
    fn test_thread_count_change_rebuilds_pool() {
        let mut renderer = SoftRasterizer::new(&settings(1));
        assert_eq!(renderer.worker_count(), 1);
        renderer.apply_rendering_settings(&settings(4)).expect("apply");
        assert_eq!(renderer.worker_count(), 4);
        renderer.apply_rendering_settings(&settings(1)).expect("apply");
        assert_eq!(renderer.worker_count(), 1);
    }

    #[test]
    fn test_resize_rejects_out_of_range_and_keeps_size() {
        let mut renderer = SoftRasterizer::new(&settings(1));
        let err = renderer.set_framebuffer_size(128, 96).unwrap_err();
        assert_eq!(err.code(), 1);
        assert_eq!(renderer.framebuffer_size(), (256, 192));

        for (w, h) in [(usize::MAX / 2, 192), (256, usize::MAX), (256 * 17, 192)] {
            let err = renderer.set_framebuffer_size(w, h).unwrap_err();
            assert_eq!(err.code(), 1);
            assert_eq!(renderer.framebuffer_size(), (256, 192));
            assert_eq!(renderer.color_out().size(), (256, 192));
        }

        renderer.set_framebuffer_size(512, 384).expect("resize");
        let frame = render_once(&mut renderer, &RenderState::default(), &GeometryList::default());
        assert_eq!(frame.len(), 512 * 384);
    }

    #[test]
    fn test_power_off_clears_output() {
        let mut renderer = SoftRasterizer::new(&settings(1));
        let mut list = GeometryList::default();
        full_quad(&mut list, PolygonAttr::new(PolygonMode::Modulate, 31, 1), 0.0, [63, 63, 63]);
        render_once(&mut renderer, &RenderState::default(), &list);
        renderer.render_power_off().expect("power off");
        let frame = renderer.color_out().snapshot32().expect("frame");
        assert!(frame.iter().all(|&c| c == Color4u8::TRANSPARENT));
    }

    #[test]
    fn test_rgb888_output_expands() {
        let mut renderer = SoftRasterizer::new(&settings(1));
        assert_eq!(renderer.request_color_format(ColorFormat::Rgb888), ColorFormat::Rgb888);
        let state = RenderState {
            clear_color: 0x7FFF,
            clear_alpha: 31,
            ..Default::default()
        };
        let frame = render_once(&mut renderer, &state, &GeometryList::default());
        assert_eq!(frame[0], Color4u8::new(255, 255, 255, 255));
    }

    #[test]
    fn test_alpha_test_discards_fragments() {
        let mut renderer = SoftRasterizer::new(&settings(1));
        let mut list = GeometryList::default();
        full_quad(&mut list, PolygonAttr::new(PolygonMode::Modulate, 10, 1), 0.0, [63, 0, 0]);
        assert_eq!(list.opaque_count, 0);
        let state = RenderState {
            enable_alpha_test: true,
            alpha_test_ref: 12,
            ..Default::default()
        };
        let frame = render_once(&mut renderer, &state, &list);
        assert_eq!(frame[0], Color4u8::TRANSPARENT);
    }
}
