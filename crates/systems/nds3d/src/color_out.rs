//! Finished framebuffers handed from the renderer to the front-end
//!
//! Two readback slots, each holding the frame as 32-bit color and as RGB555 + 1-bit alpha.
//! The renderer writes into a slot between `bind_renderer` and `unbind_renderer`; readers see
//! the newest finished slot.

use std::sync::{Mutex, MutexGuard};

use emu_core::graphics::Color4u8;
use emu_core::types::Frame;
use serde::{Deserialize, Serialize};

use crate::resource::{AsyncResource, Direction, SlotState};
use crate::{Render3DError, Render3DResult, NATIVE_HEIGHT, NATIVE_WIDTH};

/// Output pixel format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColorFormat {
    /// RGB555 with a 1-bit alpha
    Rgb555,
    /// 6-bit color and 5-bit alpha, one channel per byte
    #[default]
    Rgb666,
    /// 8 bits per channel
    Rgb888,
}

/// One slot's buffers
#[derive(Debug, Clone, Default)]
pub struct ColorBuffers {
    /// 6665 or 8888, per the output format
    pub buffer32: Vec<Color4u8>,
    pub buffer16: Vec<u16>,
}

impl ColorBuffers {
    fn resize(&mut self, len: usize) {
        self.buffer32.clear();
        self.buffer32.resize(len, Color4u8::TRANSPARENT);
        self.buffer16.clear();
        self.buffer16.resize(len, 0);
    }
}

struct ColorOutInner {
    resource: AsyncResource<2>,
    slots: [ColorBuffers; 2],
    width: usize,
    height: usize,
    format: ColorFormat,
    reading16: bool,
    reading32: bool,
}

impl ColorOutInner {
    fn release_reader_if_idle(&mut self) -> Render3DResult<()> {
        if !self.reading16 && !self.reading32 {
            self.resource.unbind_usage()?;
        }
        Ok(())
    }
}

pub struct ColorOut {
    inner: Mutex<ColorOutInner>,
}

impl Default for ColorOut {
    fn default() -> Self {
        Self::new(NATIVE_WIDTH, NATIVE_HEIGHT, ColorFormat::Rgb666)
    }
}

impl ColorOut {
    pub fn new(width: usize, height: usize, format: ColorFormat) -> Self {
        let mut slots = [ColorBuffers::default(), ColorBuffers::default()];
        for slot in slots.iter_mut() {
            slot.resize(width * height);
        }
        Self {
            inner: Mutex::new(ColorOutInner {
                resource: AsyncResource::new(Direction::Readback),
                slots,
                width,
                height,
                format,
                reading16: false,
                reading32: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ColorOutInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn size(&self) -> (usize, usize) {
        let inner = self.lock();
        (inner.width, inner.height)
    }

    pub fn format(&self) -> ColorFormat {
        self.lock().format
    }

    pub fn set_format(&self, format: ColorFormat) {
        self.lock().format = format;
    }

    /// Resize both slots, dropping their contents and any outstanding bindings
    pub fn set_size(&self, width: usize, height: usize) {
        let mut inner = self.lock();
        if inner.width == width && inner.height == height {
            return;
        }
        inner.width = width;
        inner.height = height;
        for slot in inner.slots.iter_mut() {
            slot.resize(width * height);
        }
        inner.resource.reset();
        inner.reading16 = false;
        inner.reading32 = false;
    }

    /// Claim a slot for the renderer, taking back an unread finished slot when none is free
    pub fn bind_renderer(&self) -> Option<usize> {
        self.lock().resource.bind_write_reclaim()
    }

    /// Fill the renderer's slot
    pub fn write<F>(&self, index: usize, f: F) -> Render3DResult<()>
    where
        F: FnOnce(&mut ColorBuffers),
    {
        let mut inner = self.lock();
        if inner.resource.state(index) != Some(SlotState::Using) {
            return Err(Render3DError::InvalidBinding(format!(
                "color slot {} is not bound to the renderer",
                index
            )));
        }
        f(&mut inner.slots[index]);
        Ok(())
    }

    pub fn unbind_renderer(&self, index: usize) -> Render3DResult<()> {
        self.lock().resource.unbind_write(index)
    }

    pub fn bind_read32(&self) -> Option<usize> {
        let mut inner = self.lock();
        let index = inner.resource.bind_usage()?;
        inner.reading32 = true;
        Some(index)
    }

    pub fn bind_read16(&self) -> Option<usize> {
        let mut inner = self.lock();
        let index = inner.resource.bind_usage()?;
        inner.reading16 = true;
        Some(index)
    }

    pub fn unbind_read32(&self) -> Render3DResult<()> {
        let mut inner = self.lock();
        if !inner.reading32 {
            return Err(Render3DError::InvalidBinding(
                "32-bit framebuffer is not bound for reading".to_string(),
            ));
        }
        inner.reading32 = false;
        inner.release_reader_if_idle()
    }

    pub fn unbind_read16(&self) -> Render3DResult<()> {
        let mut inner = self.lock();
        if !inner.reading16 {
            return Err(Render3DError::InvalidBinding(
                "16-bit framebuffer is not bound for reading".to_string(),
            ));
        }
        inner.reading16 = false;
        inner.release_reader_if_idle()
    }

    /// Copy of the 32-bit buffer of a slot bound for reading
    pub fn framebuffer32(&self, index: usize) -> Render3DResult<Vec<Color4u8>> {
        let inner = self.lock();
        if inner.resource.state(index) != Some(SlotState::Reading) || !inner.reading32 {
            return Err(Render3DError::InvalidBinding(format!(
                "color slot {} is not bound for 32-bit reading",
                index
            )));
        }
        Ok(inner.slots[index].buffer32.clone())
    }

    pub fn framebuffer16(&self, index: usize) -> Render3DResult<Vec<u16>> {
        let inner = self.lock();
        if inner.resource.state(index) != Some(SlotState::Reading) || !inner.reading16 {
            return Err(Render3DError::InvalidBinding(format!(
                "color slot {} is not bound for 16-bit reading",
                index
            )));
        }
        Ok(inner.slots[index].buffer16.clone())
    }

    /// Newest finished 32-bit frame, binding and releasing the slot around the copy
    pub fn snapshot32(&self) -> Option<Vec<Color4u8>> {
        let index = self.bind_read32()?;
        let pixels = self.framebuffer32(index).ok();
        let _ = self.unbind_read32();
        pixels
    }

    pub fn snapshot16(&self) -> Option<Vec<u16>> {
        let index = self.bind_read16()?;
        let pixels = self.framebuffer16(index).ok();
        let _ = self.unbind_read16();
        pixels
    }

    /// Newest finished frame as ARGB8888
    pub fn to_frame(&self) -> Option<Frame> {
        let (width, height) = self.size();
        let format = self.format();
        let pixels = self.snapshot32()?;
        let mut frame = Frame::new(width as u32, height as u32);
        for (dst, c) in frame.pixels.iter_mut().zip(pixels) {
            *dst = match format {
                ColorFormat::Rgb888 => {
                    ((c.a as u32) << 24) | ((c.r as u32) << 16) | ((c.g as u32) << 8) | c.b as u32
                }
                ColorFormat::Rgb555 | ColorFormat::Rgb666 => c.to_argb(),
            };
        }
        Some(frame)
    }

    /// Publish an all-zero frame
    pub fn fill_zero(&self) -> Render3DResult<()> {
        let index = self.bind_renderer().ok_or_else(|| {
            Render3DError::InvalidBuffer("no color slot available".to_string())
        })?;
        self.write(index, |buffers| {
            buffers.buffer32.fill(Color4u8::TRANSPARENT);
            buffers.buffer16.fill(0);
        })?;
        self.unbind_renderer(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish(out: &ColorOut, color: Color4u8) -> usize {
        let index = out.bind_renderer().expect("slot");
        out.write(index, |b| {
            b.buffer32.fill(color);
            b.buffer16.fill(color.to_5551());
        })
        .expect("write");
        out.unbind_renderer(index).expect("unbind");
        index
    }

    #[test]
    fn test_reader_sees_latest_frame() {
        let out = ColorOut::new(4, 2, ColorFormat::Rgb666);
        assert!(out.snapshot32().is_none());

        publish(&out, Color4u8::new(1, 2, 3, 31));
        publish(&out, Color4u8::new(63, 0, 0, 31));
        let pixels = out.snapshot32().expect("frame");
        assert_eq!(pixels.len(), 8);
        assert_eq!(pixels[0], Color4u8::new(63, 0, 0, 31));
        assert_eq!(out.snapshot16().expect("frame")[0], 0x801F);
    }

    #[test]
    fn test_renderer_reclaims_unread_slot() {
        let out = ColorOut::new(2, 2, ColorFormat::Rgb666);
        let first = publish(&out, Color4u8::new(1, 1, 1, 31));
        let reading = out.bind_read32().expect("read");
        assert_eq!(reading, first);

        // one slot being read, one left: it is reclaimed over and over
        let a = publish(&out, Color4u8::new(2, 2, 2, 31));
        let b = publish(&out, Color4u8::new(3, 3, 3, 31));
        assert_eq!(a, b);
        assert_ne!(a, reading);
        assert_eq!(out.framebuffer32(reading).expect("bound")[0].r, 1);
        out.unbind_read32().expect("unbind");
    }

    #[test]
    fn test_binding_errors() {
        let out = ColorOut::new(2, 2, ColorFormat::Rgb666);
        assert!(out.unbind_read32().is_err());
        assert!(out.write(0, |_| {}).is_err());
        assert!(out.framebuffer32(0).is_err());
    }

    #[test]
    fn test_to_frame_converts_6665() {
        let out = ColorOut::new(1, 1, ColorFormat::Rgb666);
        publish(&out, Color4u8::new(63, 0, 63, 31));
        let frame = out.to_frame().expect("frame");
        assert_eq!(frame.pixels[0], 0xFFFF00FF);
    }

    #[test]
    fn test_resize_clears_bindings() {
        let out = ColorOut::new(2, 2, ColorFormat::Rgb666);
        publish(&out, Color4u8::new(1, 1, 1, 31));
        out.set_size(3, 3);
        assert_eq!(out.size(), (3, 3));
        assert!(out.snapshot32().is_none());
        out.fill_zero().expect("fill");
        assert_eq!(out.snapshot32().expect("frame").len(), 9);
    }
}
