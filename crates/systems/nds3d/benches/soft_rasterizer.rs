use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use emu_nds3d::composite::{build_frame_plan, PlanOptions};
use emu_nds3d::geometry::PolygonMode;
use emu_nds3d::{
    GeometryList, Polygon, PolygonAttr, Render3D, RenderSettings, RenderState, SoftRasterizer,
    Vertex,
};

/// A grid of overlapping quads, every third one translucent
fn scene(quads: usize) -> GeometryList {
    let mut list = GeometryList::default();
    let side = (quads as f32).sqrt().ceil() as usize;
    let size = 2.0 / side as f32;
    for i in 0..quads {
        let x0 = -1.0 + (i % side) as f32 * size;
        let y0 = -1.0 + (i / side) as f32 * size;
        let (x1, y1) = (x0 + size * 1.5, y0 + size * 1.5);
        let z = (i % 7) as f32 * 0.1 - 0.3;
        let color = [(i * 7 % 64) as u8, (i * 13 % 64) as u8, (i * 29 % 64) as u8];
        let alpha = if i % 3 == 0 { 16 } else { 31 };
        let v = [
            Vertex::from_ndc(x0, y1, z, color),
            Vertex::from_ndc(x1, y1, z, color),
            Vertex::from_ndc(x1, y0, z, color),
            Vertex::from_ndc(x0, y0, z, color),
        ];
        let poly = Polygon {
            attr: PolygonAttr::new(PolygonMode::Modulate, alpha, (i % 64) as u8).with_fog(i % 2 == 0),
            ..Default::default()
        };
        list.push_polygon(poly, &v, false);
    }
    list.sort_translucent_last();
    list
}

fn postprocess_state() -> RenderState {
    RenderState {
        enable_edge_marking: true,
        enable_fog: true,
        fog_color: 0x4210,
        fog_alpha: 31,
        fog_density: std::array::from_fn(|i| (i * 4) as u8),
        ..Default::default()
    }
}

fn bench_frame_plan(c: &mut Criterion) {
    let list = scene(256);
    let opts = PlanOptions::default();
    c.bench_function("frame_plan_256_polygons", |b| {
        b.iter(|| black_box(build_frame_plan(black_box(&list), &opts)));
    });
}

fn bench_render_threads(c: &mut Criterion) {
    let mut group = c.benchmark_group("soft_rasterizer_frame");
    let list = scene(64);
    let state = postprocess_state();

    for threads in [1, 2, 4].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(threads), threads, |b, &threads| {
            let mut renderer = SoftRasterizer::new(&RenderSettings {
                thread_count: threads,
                ..Default::default()
            });
            b.iter(|| {
                renderer.render(&state, &list).expect("render");
                renderer.render_finish().expect("finish");
            });
        });
    }

    group.finish();
}

fn bench_render_upscaled(c: &mut Criterion) {
    let list = scene(64);
    let state = RenderState::default();
    let mut renderer = SoftRasterizer::new(&RenderSettings {
        thread_count: 4,
        ..Default::default()
    });
    renderer.set_framebuffer_size(512, 384).expect("resize");
    c.bench_function("soft_rasterizer_2x", |b| {
        b.iter(|| {
            renderer.render(&state, &list).expect("render");
            renderer.render_flush(true, true).expect("flush");
        });
    });
}

criterion_group!(benches, bench_frame_plan, bench_render_threads, bench_render_upscaled);
criterion_main!(benches);
