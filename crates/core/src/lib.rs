//! Core primitives shared by the renderer crates.

pub mod graphics;
pub mod logging;

pub mod types {
    use serde::{Deserialize, Serialize};

    /// A presentable frame in ARGB8888 (0xAARRGGBB), row-major
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Frame {
        pub width: u32,
        pub height: u32,
        pub pixels: Vec<u32>,
    }

    impl Frame {
        pub fn new(width: u32, height: u32) -> Self {
            Self {
                width,
                height,
                pixels: vec![0; (width * height) as usize],
            }
        }

        /// Pixel at (x, y), or None outside the frame
        pub fn pixel(&self, x: u32, y: u32) -> Option<u32> {
            if x < self.width && y < self.height {
                self.pixels.get((y * self.width + x) as usize).copied()
            } else {
                None
            }
        }

        /// Frame as tightly packed RGBA8 bytes
        pub fn to_rgba8(&self) -> Vec<u8> {
            self.pixels
                .iter()
                .flat_map(|&p| {
                    [
                        (p >> 16) as u8,
                        (p >> 8) as u8,
                        p as u8,
                        (p >> 24) as u8,
                    ]
                })
                .collect()
        }
    }
}
