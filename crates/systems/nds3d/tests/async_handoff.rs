//! Geometry and color hand-off between threads

use std::sync::Arc;
use std::thread;

use emu_nds3d::resource::Direction;
use emu_nds3d::{
    AsyncResource, GeometryList, GeometryResource, Polygon, Render3D, RenderSettings, RenderState,
    SlotState, SoftRasterizer,
};

/// A list tagged with its frame number
fn tagged(frame: u32) -> GeometryList {
    let mut list = GeometryList::default();
    list.polygons.push(Polygon {
        tex_palette: frame,
        ..Default::default()
    });
    list
}

fn tag(list: &GeometryList) -> u32 {
    list.polygons[0].tex_palette
}

#[test]
fn test_only_newest_ready_slot_is_visible() {
    let mut res: AsyncResource<3> = AsyncResource::new(Direction::Upload);
    let first = res.bind_write().expect("first slot");
    res.unbind_write(first).expect("unbind");
    let second = res.bind_write().expect("second slot");
    res.unbind_write(second).expect("unbind");

    assert_eq!(res.state(first), Some(SlotState::Free));
    assert_eq!(res.bind_usage(), Some(second));
    assert_eq!(res.unbind_usage().expect("release"), second);
    assert_eq!(res.bind_usage(), None);
}

#[test]
fn test_double_unbind_is_a_binding_error() {
    let mut res: AsyncResource<3> = AsyncResource::new(Direction::Readback);
    let slot = res.bind_write().expect("slot");
    res.unbind_write(slot).expect("unbind");
    let err = res.unbind_write(slot).unwrap_err();
    assert_eq!(err.code(), 3);
    // state machine untouched
    assert_eq!(res.ready_index(), Some(slot));
    assert!(res.unbind_usage().is_err());
}

#[test]
fn test_consumer_sees_frames_in_order_latest_wins() {
    const FRAMES: u32 = 2000;
    let shared = Arc::new(GeometryResource::new());

    let producer = {
        let shared = Arc::clone(&shared);
        thread::spawn(move || {
            for frame in 1..=FRAMES {
                shared.publish(tagged(frame)).expect("a slot is always free");
            }
        })
    };

    let mut seen = Vec::new();
    while seen.last() != Some(&FRAMES) {
        if let Some(list) = shared.acquire() {
            let frame = tag(&list);
            if seen.last() != Some(&frame) {
                seen.push(frame);
            }
            shared.release().expect("release");
        }
        thread::yield_now();
    }
    producer.join().expect("producer");

    assert!(seen.windows(2).all(|w| w[0] < w[1]), "frames reordered: {:?}", seen);
    assert_eq!(seen.last(), Some(&FRAMES));
    assert!(shared.acquire().is_none());
}

#[test]
fn test_color_output_read_from_another_thread() {
    let mut renderer = SoftRasterizer::new(&RenderSettings {
        thread_count: 2,
        ..Default::default()
    });
    let out = renderer.color_out();
    let state = RenderState {
        clear_color: 0x7C00,
        clear_alpha: 31,
        ..Default::default()
    };
    renderer.render(&state, &GeometryList::default()).expect("render");
    renderer.render_flush(true, true).expect("flush");

    let reader = thread::spawn(move || {
        let index = out.bind_read32().expect("ready frame");
        let frame = out.framebuffer32(index).expect("pixels");
        out.unbind_read32().expect("unbind");
        frame
    });
    let frame = reader.join().expect("reader");
    assert_eq!(frame.len(), 256 * 192);
    assert!(frame.iter().all(|c| c.b == 63 && c.r == 0 && c.a == 31));
}
