//! Hardware ray tracing for the Prism renderer.
//!
//! This crate builds everything a ray dispatch needs, in init order:
//! - BLAS and TLAS over the scene (`VK_KHR_acceleration_structure`)
//! - Shader stages and groups loaded from SPIR-V
//! - The ray tracing pipeline and its descriptor set (`VK_KHR_ray_tracing_pipeline`)
//! - The shader binding table

pub mod acceleration;
pub mod pipeline;
pub mod sbt;
pub mod shader;

// Re-exports for convenience
pub use acceleration::{
    instance_record, AccelerationStructure, BottomLevelAccel, BuildContext, TopLevelAccel,
};
pub use pipeline::{DescriptorBinder, DescriptorPools, RayTracingPipeline};
pub use sbt::{align_up, SbtLayout, SbtRegions, ShaderBindingTable};
pub use shader::{
    load_spirv, shader_groups, validate_stage_kinds, ShaderStageKind, ShaderStageRegistry,
};
