//! Vulkan abstraction layer for the Prism ray tracer.
//!
//! This crate provides:
//! - Vulkan instance, surface and device management
//! - GPU capability detection and ray tracing device requirements
//! - Buffers with dedicated memory allocations
//! - Command pools and the one-time submit helper
//! - Descriptors, swapchain and synchronization primitives
//!
//! Every wrapper that owns a Vulkan object holds an `Arc<ash::Device>` and
//! releases the object on drop.

pub mod capabilities;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod error;
pub mod instance;
pub mod memory;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use capabilities::{
    missing_extensions, GpuCapabilities, GpuVendor, RayTracingProperties,
    REQUIRED_DEVICE_EXTENSIONS,
};
pub use command::{
    begin_command_buffer, cmd_transition_image, color_subresource_range, end_command_buffer,
    CommandPool,
};
pub use context::{GpuContext, GpuContextBuilder};
pub use descriptors::{
    write_acceleration_structure, write_storage_image, DescriptorPool, DescriptorSetLayoutBuilder,
};
pub use error::{ErrorKind, GpuError, Result};
pub use memory::{find_memory_type, BufferDesc, GpuBuffer, MappedMemory};
pub use surface::{SurfaceCapabilities, SurfaceContext};
pub use swapchain::Swapchain;
pub use sync::{FrameSync, Semaphore};
