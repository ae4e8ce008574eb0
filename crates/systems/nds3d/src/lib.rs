//! Nintendo DS style fixed-function 3D renderer.
//!
//! Turns a per-frame geometry snapshot (clipped polygons, vertices, render state) into a
//! finished framebuffer. Two backends share one polygon compositing algorithm:
//!
//! - **Software**: scanline rasterizer with a worker pool over disjoint row ranges
//! - **OpenGL**: GPU backend behind the `opengl` feature, using the depth/stencil buffer
//!
//! The pieces, leaf first:
//!
//! - [`texture`]: decodes the eight texture formats and caches the results
//! - [`geometry`] / [`state`]: the read-only per-frame snapshot and projection to screen space
//! - [`resource`] / [`color_out`]: latest-wins buffer hand-off between threads
//! - [`side_channel`] / [`composite`]: the per-pixel 8-bit side channel and the multi-pass
//!   draw plans built on it
//! - [`postprocess`]: edge marking and fog over resolved fragment attributes
//! - [`render3d`]: the renderer lifecycle trait, factories and device info

pub mod color_out;
pub mod composite;
pub mod fragment;
pub mod geometry;
pub mod postprocess;
mod rasterizer;
pub mod render3d;
#[cfg(feature = "opengl")]
pub mod render3d_opengl;
pub mod render3d_software;
pub mod resource;
pub mod settings;
mod shading;
pub mod side_channel;
pub mod state;
pub mod texture;

use thiserror::Error;

pub use color_out::{ColorFormat, ColorOut};
pub use geometry::{ClippedPolygon, GeometryList, Polygon, PolygonAttr, Vertex, Viewport};
pub use render3d::{
    core_3d_list, DeviceInfo, NullRenderer, Render3D, RendererFactory, RendererId,
};
#[cfg(feature = "opengl")]
pub use render3d_opengl::{OpenGLRenderer, OpenGLRendererFactory};
pub use render3d_software::{SoftRasterizer, SoftRasterizerFactory};
pub use resource::{AsyncResource, GeometryResource, SlotState, RESOURCE_INDEX_NONE};
pub use settings::{Capabilities, RenderSettings};
pub use state::RenderState;

/// Native output width of the console
pub const NATIVE_WIDTH: usize = 256;
/// Native output height of the console
pub const NATIVE_HEIGHT: usize = 192;
/// Largest framebuffer scale, per axis, over the native resolution
pub const MAX_FRAMEBUFFER_SCALE: usize = 16;

/// Errors surfaced by the renderer and its resources
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Render3DError {
    /// A requested size, format or parameter is out of range; prior state is kept
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    /// A buffer the operation needs does not exist or has the wrong size
    #[error("Invalid buffer: {0}")]
    InvalidBuffer(String),
    /// The caller does not own the resource it tried to release or use
    #[error("Invalid binding: {0}")]
    InvalidBinding(String),
    /// A backend resource (thread, GL object, shader) could not be created
    #[error("Failed to create resource: {0}")]
    ResourceCreate(String),
    /// The backend lacks a required feature
    #[error("Unsupported feature: {0}")]
    Unsupported(&'static str),
}

impl Render3DError {
    /// Numeric error code: 1 invalid value, 2 invalid buffer, 3 invalid binding, 4 resource
    pub fn code(&self) -> u32 {
        match self {
            Render3DError::InvalidValue(_) => 1,
            Render3DError::InvalidBuffer(_) => 2,
            Render3DError::InvalidBinding(_) => 3,
            Render3DError::ResourceCreate(_) | Render3DError::Unsupported(_) => 4,
        }
    }
}

pub type Render3DResult<T> = Result<T, Render3DError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Render3DError::InvalidValue("w".into()).code(), 1);
        assert_eq!(Render3DError::InvalidBuffer("b".into()).code(), 2);
        assert_eq!(Render3DError::InvalidBinding("x".into()).code(), 3);
        assert_eq!(Render3DError::Unsupported("stencil").code(), 4);
    }

    #[test]
    fn test_error_display() {
        let err = Render3DError::InvalidValue("framebuffer 0x192".into());
        assert_eq!(err.to_string(), "Invalid value: framebuffer 0x192");
    }
}
