//! Graphics primitives shared by the 3D renderer backends
//!
//! Color conversions between the internal 6665 format and the output formats, and the
//! 24-bit depth helpers used by both the software and the GPU depth tests.

pub mod color;
pub mod depth;

pub use color::Color4u8;
pub use depth::CompareFunc;
