//! Renderer assembly and the Vulkan frame backend.

use std::path::PathBuf;
use std::sync::Arc;

use ash::vk;
use prism_core::{InstanceTransform, TriangleMesh};
use prism_gpu::{
    begin_command_buffer, cmd_transition_image, end_command_buffer, CommandPool, FrameSync,
    GpuContext, GpuContextBuilder, Result as GpuResult, Swapchain,
};
use prism_rt::{
    BottomLevelAccel, BuildContext, DescriptorBinder, RayTracingPipeline, ShaderBindingTable,
    ShaderStageKind, ShaderStageRegistry, TopLevelAccel,
};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{debug, info, warn};
use winit::window::Window;

use crate::frame::{
    DispatchBindings, FrameBackend, FrameExecutor, FrameRecording, FrameState, SwapchainTarget,
};
use crate::overlay::{Framebuffers, Overlay, OverlayInit, OverlayRenderPass};

/// Settings the renderer is built from.
#[derive(Debug, Clone)]
pub struct RendererConfig {
    pub app_name: String,
    pub width: u32,
    pub height: u32,
    pub validation: bool,
    /// Directory holding the compiled ray tracing stages.
    pub shader_dir: PathBuf,
    /// Placement of the triangle instance.
    pub transform: InstanceTransform,
}

/// Everything needed to trace and present the scene.
///
/// Fields drop top to bottom: GPU resources, then the swapchain, then the
/// device itself.
pub struct Renderer {
    overlay: Box<dyn Overlay>,
    framebuffers: Framebuffers,
    overlay_pass: OverlayRenderPass,
    sbt: ShaderBindingTable,
    descriptors: DescriptorBinder,
    pipeline: RayTracingPipeline,
    tlas: TopLevelAccel,
    blas: BottomLevelAccel,
    _sync: FrameSync,
    command_pool: CommandPool,
    bindings: DispatchBindings,
    targets: Vec<SwapchainTarget>,
    frame: FrameState,
    swapchain: Swapchain,
    gpu: GpuContext,
}

impl Renderer {
    /// Build the renderer for `window`.
    ///
    /// Resources are created in dependency order; anything built before a
    /// failure is released on return.
    pub fn new<W>(
        window: &W,
        config: &RendererConfig,
        mut overlay: Box<dyn Overlay>,
    ) -> anyhow::Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let gpu = GpuContextBuilder::new()
            .app_name(config.app_name.clone())
            .validation(config.validation)
            .build(window)?;

        info!("GPU: {}", gpu.capabilities().summary());
        let device = Arc::clone(gpu.device());

        // SAFETY: every handle below comes from `gpu` and outlives its use here.
        unsafe {
            let swapchain = Swapchain::new(
                Arc::clone(&device),
                gpu.swapchain_loader().clone(),
                gpu.surface(),
                gpu.physical_device(),
                gpu.queue_family(),
                config.width,
                config.height,
            )?;

            let command_pool = CommandPool::new(
                Arc::clone(&device),
                gpu.queue_family(),
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )?;
            swapchain.transition_to_present(&command_pool, gpu.queue())?;

            let build_ctx = BuildContext::new(&gpu, &command_pool);
            let blas = BottomLevelAccel::from_mesh(&build_ctx, &TriangleMesh::single_triangle())?;
            let tlas = TopLevelAccel::single_instance(&build_ctx, &blas, &config.transform)?;

            let (pipeline, miss_count, hit_count) = {
                let registry = ShaderStageRegistry::from_dir(Arc::clone(&device), &config.shader_dir)?;
                let pipeline =
                    RayTracingPipeline::new(Arc::clone(&device), gpu.ray_tracing_loader(), &registry)?;
                (
                    pipeline,
                    registry.count(ShaderStageKind::Miss),
                    registry.count(ShaderStageKind::ClosestHit),
                )
            };

            let descriptors =
                DescriptorBinder::new(Arc::clone(&device), pipeline.set_layout(), tlas.handle())?;

            let sbt = ShaderBindingTable::new(
                Arc::clone(&device),
                gpu.memory_properties(),
                gpu.ray_tracing_loader(),
                pipeline.handle(),
                &gpu.capabilities().ray_tracing,
                miss_count,
                hit_count,
            )?;

            let overlay_pass = OverlayRenderPass::new(Arc::clone(&device), swapchain.format())?;
            let framebuffers = Framebuffers::new(
                Arc::clone(&device),
                overlay_pass.handle(),
                swapchain.image_views(),
                swapchain.extent(),
            )?;

            let targets = swapchain_targets(
                swapchain.images(),
                swapchain.image_views(),
                framebuffers.handles(),
            );

            let sync = FrameSync::new(&device, swapchain.image_count())?;
            let command_buffer = command_pool.allocate_command_buffer()?;
            let frame = FrameState::new(
                sync.image_available.handle(),
                sync.render_finished_handles(),
                command_buffer,
            );

            let bindings = DispatchBindings {
                pipeline: pipeline.handle(),
                pipeline_layout: pipeline.layout(),
                descriptor_set: descriptors.descriptor_set(),
                tlas: tlas.handle(),
                tlas_address: tlas.device_address(),
                sbt: *sbt.regions(),
                extent: swapchain.extent(),
            };

            overlay.init(&OverlayInit {
                instance: gpu.instance(),
                physical_device: gpu.physical_device(),
                device: &device,
                queue_family: gpu.queue_family(),
                queue: gpu.queue(),
                descriptor_pool: descriptors.overlay_pool(),
                render_pass: overlay_pass.handle(),
                image_count: swapchain.image_count(),
                extent: swapchain.extent(),
            })?;

            info!(
                "Renderer ready: {}x{}, {} swapchain images",
                bindings.extent.width,
                bindings.extent.height,
                targets.len()
            );

            Ok(Self {
                overlay,
                framebuffers,
                overlay_pass,
                sbt,
                descriptors,
                pipeline,
                tlas,
                blas,
                _sync: sync,
                command_pool,
                bindings,
                targets,
                frame,
                swapchain,
                gpu,
            })
        }
    }

    /// Draw and present one frame into `window`'s swapchain.
    pub fn render_frame(&mut self, window: &Window) -> GpuResult<u32> {
        self.overlay.begin_frame(window);
        self.overlay.end_frame()?;

        let mut backend = VulkanFrameBackend {
            device: self.gpu.device(),
            rt_loader: self.gpu.ray_tracing_loader(),
            queue: self.gpu.queue(),
            swapchain: &self.swapchain,
            descriptors: &self.descriptors,
            bindings: &self.bindings,
            targets: &self.targets,
            overlay_pass: self.overlay_pass.handle(),
            overlay: self.overlay.as_mut(),
        };
        FrameExecutor::run_frame(&mut self.frame, &mut backend)
    }

    /// The overlay drawn over every frame.
    pub fn overlay_mut(&mut self) -> &mut dyn Overlay {
        self.overlay.as_mut()
    }

    pub fn frames_presented(&self) -> u64 {
        self.frame.frames_presented()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.bindings.extent
    }

    pub fn gpu(&self) -> &GpuContext {
        &self.gpu
    }

    pub fn blas(&self) -> &BottomLevelAccel {
        &self.blas
    }

    pub fn tlas(&self) -> &TopLevelAccel {
        &self.tlas
    }

    pub fn pipeline(&self) -> &RayTracingPipeline {
        &self.pipeline
    }

    pub fn sbt(&self) -> &ShaderBindingTable {
        &self.sbt
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.gpu.wait_idle() {
            warn!("Failed to wait idle before teardown: {e}");
        }
        debug!(
            "Releasing renderer: {} framebuffers, command pool {:?}, {} frames presented",
            self.framebuffers.handles().len(),
            self.command_pool.handle(),
            self.frame.frames_presented()
        );
    }
}

/// Pair each swapchain image with its view and framebuffer.
pub fn swapchain_targets(
    images: &[vk::Image],
    views: &[vk::ImageView],
    framebuffers: &[vk::Framebuffer],
) -> Vec<SwapchainTarget> {
    images
        .iter()
        .zip(views)
        .zip(framebuffers)
        .map(|((&image, &view), &framebuffer)| SwapchainTarget {
            image,
            view,
            framebuffer,
        })
        .collect()
}

/// [`FrameBackend`] over the real device and swapchain.
pub struct VulkanFrameBackend<'a> {
    device: &'a Arc<ash::Device>,
    rt_loader: &'a ash::khr::ray_tracing_pipeline::Device,
    queue: vk::Queue,
    swapchain: &'a Swapchain,
    descriptors: &'a DescriptorBinder,
    bindings: &'a DispatchBindings,
    targets: &'a [SwapchainTarget],
    overlay_pass: vk::RenderPass,
    overlay: &'a mut dyn Overlay,
}

impl FrameBackend for VulkanFrameBackend<'_> {
    fn image_count(&self) -> u32 {
        self.swapchain.image_count()
    }

    fn acquire(&mut self, signal: vk::Semaphore) -> GpuResult<u32> {
        // SAFETY: the semaphore is unsignaled; the previous frame waited on it.
        unsafe { self.swapchain.acquire_next_image(signal) }
    }

    fn bind_output(&mut self, image_index: u32) -> GpuResult<()> {
        let recording = FrameRecording::new(self.bindings, self.targets, image_index)?;
        // SAFETY: the queue is idle after every submit, so the set is not in use.
        unsafe { self.descriptors.bind_output_image(recording.target.view) };
        Ok(())
    }

    fn record(&mut self, cmd: vk::CommandBuffer, image_index: u32) -> GpuResult<()> {
        let recording = FrameRecording::new(self.bindings, self.targets, image_index)?;
        // SAFETY: the command buffer is not pending and every handle is live.
        unsafe {
            record_frame(
                self.device,
                self.rt_loader,
                cmd,
                &recording,
                self.overlay_pass,
                &mut *self.overlay,
            )
        }
    }

    fn submit(
        &mut self,
        cmd: vk::CommandBuffer,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
    ) -> GpuResult<()> {
        let wait_semaphores = [wait];
        let wait_stages = [vk::PipelineStageFlags::TOP_OF_PIPE];
        let signal_semaphores = [signal];
        let command_buffers = [cmd];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        // SAFETY: handles are valid; waiting idle keeps one frame in flight.
        unsafe {
            self.device
                .queue_submit(self.queue, &[submit_info], vk::Fence::null())?;
            self.device.queue_wait_idle(self.queue)?;
        }
        Ok(())
    }

    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> GpuResult<()> {
        // SAFETY: the image was acquired this frame and `wait` is signaled by the submit.
        unsafe { self.swapchain.present(self.queue, image_index, wait) }
    }
}

/// Record one frame: trace into the image, draw the overlay, hand it back for present.
///
/// # Safety
/// The command buffer must be resettable and not pending, and every handle in
/// `recording` must be valid.
unsafe fn record_frame(
    device: &ash::Device,
    rt_loader: &ash::khr::ray_tracing_pipeline::Device,
    cmd: vk::CommandBuffer,
    recording: &FrameRecording<'_>,
    overlay_pass: vk::RenderPass,
    overlay: &mut dyn Overlay,
) -> GpuResult<()> {
    unsafe {
        let bindings = recording.bindings;
        let image = recording.target.image;

        begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;

        cmd_transition_image(
            device,
            cmd,
            image,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::ImageLayout::GENERAL,
            vk::PipelineStageFlags2::TOP_OF_PIPE,
            vk::AccessFlags2::NONE,
            vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
            vk::AccessFlags2::SHADER_STORAGE_WRITE,
        );

        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::RAY_TRACING_KHR, bindings.pipeline);
        device.cmd_bind_descriptor_sets(
            cmd,
            vk::PipelineBindPoint::RAY_TRACING_KHR,
            bindings.pipeline_layout,
            0,
            &[bindings.descriptor_set],
            &[],
        );

        rt_loader.cmd_trace_rays(
            cmd,
            &bindings.sbt.raygen,
            &bindings.sbt.miss,
            &bindings.sbt.hit,
            &bindings.sbt.callable,
            bindings.extent.width,
            bindings.extent.height,
            1,
        );

        let render_pass_begin = vk::RenderPassBeginInfo::default()
            .render_pass(overlay_pass)
            .framebuffer(recording.target.framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: bindings.extent,
            });
        device.cmd_begin_render_pass(cmd, &render_pass_begin, vk::SubpassContents::INLINE);
        overlay.record_draw(device, cmd);
        device.cmd_end_render_pass(cmd);

        cmd_transition_image(
            device,
            cmd,
            image,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
            vk::AccessFlags2::NONE,
        );

        end_command_buffer(device, cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn targets_pair_by_index() {
        let images = [vk::Image::from_raw(1), vk::Image::from_raw(2)];
        let views = [vk::ImageView::from_raw(11), vk::ImageView::from_raw(12)];
        let framebuffers = [
            vk::Framebuffer::from_raw(21),
            vk::Framebuffer::from_raw(22),
        ];

        let targets = swapchain_targets(&images, &views, &framebuffers);

        assert_eq!(targets.len(), 2);
        assert_eq!(targets[1].image, images[1]);
        assert_eq!(targets[1].view, views[1]);
        assert_eq!(targets[1].framebuffer, framebuffers[1]);
    }
}
