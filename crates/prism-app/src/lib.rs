//! Application layer for the Prism ray tracer.
//!
//! This crate ties the GPU crates to a window:
//! - Renderer assembly, in dependency order, with reverse-order teardown
//! - The per-frame state machine and its Vulkan backend
//! - The overlay seam and its load-op render pass
//! - An imgui overlay drawn with its own graphics pipeline
//! - The winit event loop
//!
//! # Example
//!
//! ```no_run
//! use prism_app::{run_app, AppConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app(AppConfig::new("Prism").with_shader_dir("shaders/spv"))
//! }
//! ```

mod frame;
mod gui;
mod overlay;
mod renderer;
mod runner;

pub use frame::{
    DispatchBindings, FrameBackend, FrameExecutor, FramePhase, FrameRecording, FrameState,
    SwapchainTarget,
};
pub use gui::{
    clip_scissor, ortho_projection, DemoWindow, ImguiOverlay, OverlayDraw, OverlayMesh,
    OverlayVertex, OVERLAY_FRAGMENT_SHADER, OVERLAY_VERTEX_SHADER,
};
pub use overlay::{
    overlay_attachment, overlay_dependency, Framebuffers, NoOverlay, Overlay, OverlayInit,
    OverlayRenderPass,
};
pub use renderer::{swapchain_targets, Renderer, RendererConfig, VulkanFrameBackend};
pub use runner::{init_logging, run_app, run_app_with_overlay, AppConfig, DEFAULT_SHADER_DIR};

// Re-export commonly used types for convenience
pub use prism_gpu::{GpuContext, GpuError};
