//! Ray tracing pipeline and its descriptor set.
//!
//! The set has two bindings, both visible to the ray generation stage:
//! - binding 0: the TLAS, written once
//! - binding 1: the swapchain image being rendered, rewritten every frame

use crate::shader::ShaderStageRegistry;
use ash::vk;
use prism_gpu::{
    write_acceleration_structure, write_storage_image, DescriptorPool, DescriptorSetLayoutBuilder,
    GpuError, Result,
};
use std::sync::Arc;
use tracing::{debug, info};

/// Binding of the TLAS.
pub const TLAS_BINDING: u32 = 0;
/// Binding of the output storage image.
pub const OUTPUT_IMAGE_BINDING: u32 = 1;

/// Maximum recursion depth; rays are traced from raygen only.
pub const MAX_RAY_RECURSION_DEPTH: u32 = 1;

/// Descriptors per type, and sets, in the overlay pool.
pub const OVERLAY_POOL_CAPACITY: u32 = 1000;

/// Descriptor set layout builder for the ray tracing set.
pub fn ray_tracing_set_layout() -> DescriptorSetLayoutBuilder<'static> {
    DescriptorSetLayoutBuilder::new()
        .acceleration_structure(TLAS_BINDING, vk::ShaderStageFlags::RAYGEN_KHR)
        .storage_image(OUTPUT_IMAGE_BINDING, vk::ShaderStageFlags::RAYGEN_KHR)
}

/// Pool sizes for the single ray tracing set.
pub fn ray_tracing_pool_sizes() -> [vk::DescriptorPoolSize; 2] {
    [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            descriptor_count: 1,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_IMAGE,
            descriptor_count: 1,
        },
    ]
}

/// Pool sizes for the overlay, generous across every classic descriptor type.
pub fn overlay_pool_sizes() -> Vec<vk::DescriptorPoolSize> {
    [
        vk::DescriptorType::SAMPLER,
        vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        vk::DescriptorType::SAMPLED_IMAGE,
        vk::DescriptorType::STORAGE_IMAGE,
        vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
        vk::DescriptorType::STORAGE_TEXEL_BUFFER,
        vk::DescriptorType::UNIFORM_BUFFER,
        vk::DescriptorType::STORAGE_BUFFER,
        vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
        vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
        vk::DescriptorType::INPUT_ATTACHMENT,
    ]
    .into_iter()
    .map(|ty| vk::DescriptorPoolSize {
        ty,
        descriptor_count: OVERLAY_POOL_CAPACITY,
    })
    .collect()
}

/// Ray tracing pipeline, its layout and its descriptor set layout.
pub struct RayTracingPipeline {
    device: Arc<ash::Device>,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    set_layout: vk::DescriptorSetLayout,
}

impl RayTracingPipeline {
    /// Create the pipeline from the registry's stages and groups.
    ///
    /// # Safety
    /// The loader must belong to `device`, and the registry's modules must
    /// have been created on it.
    pub unsafe fn new(
        device: Arc<ash::Device>,
        rt_loader: &ash::khr::ray_tracing_pipeline::Device,
        registry: &ShaderStageRegistry,
    ) -> Result<Self> {
        // Null handles are skipped on destroy, so a partial build cleans up through Drop.
        let mut this = Self {
            device,
            pipeline: vk::Pipeline::null(),
            layout: vk::PipelineLayout::null(),
            set_layout: vk::DescriptorSetLayout::null(),
        };

        this.set_layout = ray_tracing_set_layout().build(&this.device)?;

        let set_layouts = [this.set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        this.layout = this.device.create_pipeline_layout(&layout_info, None)?;

        let stages = registry.stage_infos();
        let groups = registry.groups();
        let pipeline_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(MAX_RAY_RECURSION_DEPTH)
            .layout(this.layout);

        let pipelines = rt_loader
            .create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[pipeline_info],
                None,
            )
            .map_err(|(partial, e)| {
                for pipeline in partial {
                    this.device.destroy_pipeline(pipeline, None);
                }
                GpuError::PipelineCreation(format!("Ray tracing pipeline: {e:?}"))
            })?;

        this.pipeline = pipelines
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::PipelineCreation("driver returned no pipeline".into()))?;

        info!(
            "Created ray tracing pipeline: {} stages, {} groups",
            stages.len(),
            groups.len()
        );

        Ok(this)
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }
}

impl Drop for RayTracingPipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
            self.device
                .destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

/// Descriptor pools, kept apart so the overlay can never exhaust the ray tracing set.
pub struct DescriptorPools {
    pub ray_tracing: DescriptorPool,
    pub overlay: DescriptorPool,
}

impl DescriptorPools {
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &Arc<ash::Device>) -> Result<Self> {
        let ray_tracing = DescriptorPool::new(
            Arc::clone(device),
            1,
            &ray_tracing_pool_sizes(),
            vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET,
        )?;
        let overlay = DescriptorPool::new(
            Arc::clone(device),
            OVERLAY_POOL_CAPACITY,
            &overlay_pool_sizes(),
            vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET,
        )?;
        Ok(Self {
            ray_tracing,
            overlay,
        })
    }
}

/// The ray tracing descriptor set and the pools it came from.
pub struct DescriptorBinder {
    device: Arc<ash::Device>,
    descriptor_set: vk::DescriptorSet,
    pools: DescriptorPools,
}

impl DescriptorBinder {
    /// Allocate the set and point binding 0 at `tlas`.
    ///
    /// # Safety
    /// `set_layout` and `tlas` must be valid and created on `device`.
    pub unsafe fn new(
        device: Arc<ash::Device>,
        set_layout: vk::DescriptorSetLayout,
        tlas: vk::AccelerationStructureKHR,
    ) -> Result<Self> {
        let pools = DescriptorPools::new(&device)?;
        let descriptor_set = pools
            .ray_tracing
            .allocate(&[set_layout])?
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::Other("descriptor pool returned no set".into()))?;

        write_acceleration_structure(&device, descriptor_set, TLAS_BINDING, tlas);
        debug!("Wrote TLAS to binding {}", TLAS_BINDING);

        Ok(Self {
            device,
            descriptor_set,
            pools,
        })
    }

    /// Point binding 1 at `view`, in `GENERAL` layout. Binding 0 is untouched.
    ///
    /// # Safety
    /// The view must be valid and the set must not be in use by pending work.
    pub unsafe fn bind_output_image(&self, view: vk::ImageView) {
        write_storage_image(
            &self.device,
            self.descriptor_set,
            OUTPUT_IMAGE_BINDING,
            view,
            vk::ImageLayout::GENERAL,
        );
    }

    pub fn descriptor_set(&self) -> vk::DescriptorSet {
        self.descriptor_set
    }

    /// Pool reserved for the overlay.
    pub fn overlay_pool(&self) -> vk::DescriptorPool {
        self.pools.overlay.handle()
    }
}
