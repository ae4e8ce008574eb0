mod scene;

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::mpsc::sync_channel;
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use emu_core::logging::{LogConfig, LogLevel};
use emu_core::types::Frame;
use emu_nds3d::{ColorFormat, GeometryResource, RenderSettings, RendererId};

use scene::Scene;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Soft,
    Null,
}

impl Backend {
    fn renderer_id(self) -> RendererId {
        match self {
            Backend::Soft => RendererId::SoftRasterizer,
            Backend::Null => RendererId::Null,
        }
    }
}

/// Render a 3D scene headlessly and write the last frame as PNG
#[derive(Parser, Debug)]
#[command(name = "nds3d", version)]
struct Args {
    /// Scene JSON; the built-in demo when omitted
    #[arg(long)]
    scene: Option<PathBuf>,

    /// Renderer settings JSON (missing file falls back to defaults)
    #[arg(long)]
    settings: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Backend::Soft)]
    backend: Backend,

    #[arg(long, default_value_t = 256)]
    width: usize,

    #[arg(long, default_value_t = 192)]
    height: usize,

    /// Worker threads for the software backend (overrides settings)
    #[arg(long)]
    threads: Option<usize>,

    /// Frames the producer thread submits
    #[arg(long, default_value_t = 1)]
    frames: u32,

    /// Output PNG path
    #[arg(long, default_value = "frame.png")]
    output: PathBuf,

    /// Emit 8-bit color instead of 6-bit expanded output
    #[arg(long, default_value_t = false)]
    rgb888: bool,

    /// Renderer log level: off, error, warn, info, debug, trace
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Write the scene (demo included) as JSON next to the PNG
    #[arg(long, default_value_t = false)]
    dump_scene: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let level = LogLevel::from_str(&args.log_level)
        .ok_or_else(|| anyhow!("unknown log level '{}'", args.log_level))?;
    LogConfig::global().set_global_level(level);

    let scene = match &args.scene {
        Some(path) => Scene::load(path)?,
        None => Scene::demo(),
    };
    if args.dump_scene {
        let path = args.output.with_extension("json");
        fs::write(&path, serde_json::to_string_pretty(&scene)?)
            .with_context(|| format!("write scene '{}'", path.display()))?;
    }

    let mut settings = match &args.settings {
        Some(path) => RenderSettings::load(path),
        None => RenderSettings::default(),
    };
    if let Some(threads) = args.threads {
        settings.thread_count = threads;
    }

    let frame = render_frames(&args, &scene, &settings)?;
    write_png(&args.output, &frame)?;
    log::info!("wrote {} ({}x{})", args.output.display(), frame.width, frame.height);
    Ok(())
}

/// Produce geometry on a second thread and render whatever is newest on this one
fn render_frames(args: &Args, scene: &Scene, settings: &RenderSettings) -> Result<Frame> {
    let factory = emu_nds3d::render3d::find_factory(args.backend.renderer_id())
        .ok_or_else(|| anyhow!("backend {:?} unavailable", args.backend))?;
    let mut renderer = factory.init()?;
    renderer.apply_rendering_settings(settings)?;
    renderer.set_framebuffer_size(args.width, args.height)?;
    if args.rgb888 {
        renderer.request_color_format(ColorFormat::Rgb888);
    }
    let info = renderer.device_info();
    log::info!("renderer: {} ({:?})", info.name, info.renderer_id);

    let geometry = Arc::new(GeometryResource::new());
    let (tx, rx) = sync_channel::<u32>(2);
    let producer = {
        let geometry = Arc::clone(&geometry);
        let scene = scene.clone();
        let frames = args.frames.max(1);
        thread::Builder::new()
            .name("geometry".to_string())
            .spawn(move || -> emu_nds3d::Render3DResult<()> {
                for frame in 0..frames {
                    geometry.publish(scene.geometry(frame))?;
                    if tx.send(frame).is_err() {
                        break;
                    }
                }
                Ok(())
            })?
    };

    let mut rendered = 0u32;
    for frame in rx {
        let Some(list) = geometry.acquire() else {
            continue;
        };
        renderer.render(&scene.state, &list)?;
        renderer.render_flush(true, false)?;
        geometry.release()?;
        rendered += 1;
        log::debug!("frame {} rendered", frame);
    }
    producer
        .join()
        .map_err(|_| anyhow!("geometry thread panicked"))??;
    log::info!("rendered {} of {} submitted frames", rendered, args.frames.max(1));

    let out = renderer.color_out();
    let frame = out.to_frame().ok_or_else(|| anyhow!("no frame was rendered"))?;
    factory.close(renderer);
    Ok(frame)
}

fn write_png(path: &Path, frame: &Frame) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create output dir '{}'", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("create '{}'", path.display()))?;
    let mut encoder = png::Encoder::new(BufWriter::new(file), frame.width, frame.height);
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);
    let mut writer = encoder.write_header()?;
    // alpha is coverage, not transparency, in the output
    let rgba: Vec<u8> = frame
        .to_rgba8()
        .chunks_exact(4)
        .flat_map(|px| [px[0], px[1], px[2], 255])
        .collect();
    writer
        .write_image_data(&rgba)
        .with_context(|| format!("write png '{}'", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["nds3d"]);
        assert_eq!(args.backend, Backend::Soft);
        assert_eq!((args.width, args.height), (256, 192));
        assert_eq!(args.frames, 1);
    }

    #[test]
    fn test_render_demo_frames() {
        let args = Args::parse_from(["nds3d", "--frames", "4", "--threads", "2"]);
        let frame = render_frames(&args, &Scene::demo(), &RenderSettings::default()).expect("render");
        assert_eq!((frame.width, frame.height), (256, 192));
        // the triangle covers the center
        let center = frame.pixel(128, 96).expect("pixel");
        assert_ne!(center, frame.pixel(2, 2).expect("pixel"));
    }

    #[test]
    fn test_null_backend_produces_blank_frame() {
        let args = Args::parse_from(["nds3d", "--backend", "null"]);
        let frame = render_frames(&args, &Scene::demo(), &RenderSettings::default()).expect("render");
        assert!(frame.pixels.iter().all(|&p| p == 0));
    }
}
