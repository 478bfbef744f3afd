//! Core scene types for the Prism ray tracer.
//!
//! This crate provides the data the GPU layers consume:
//! - Vertex layout shared with the acceleration structure build
//! - The fixed triangle mesh rendered by the viewer
//! - Instance transforms for the top-level structure

pub mod scene;

pub use scene::{InstanceTransform, TriangleMesh, Vertex};

// Re-export glam for convenience
pub use glam;

/// Renderer-wide constants
pub mod constants {
    /// Default output width in pixels
    pub const DEFAULT_WIDTH: u32 = 800;
    /// Default output height in pixels
    pub const DEFAULT_HEIGHT: u32 = 600;
    /// Visibility mask that makes an instance visible to every ray
    pub const FULL_VISIBILITY_MASK: u8 = 0xFF;
}
