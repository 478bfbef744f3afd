//! Overlay integration.
//!
//! An overlay (a debug UI, for example) draws on top of the traced image
//! inside a render pass that loads the image instead of clearing it.

use std::sync::Arc;

use ash::vk;
use prism_gpu::Result;
use winit::event::Event;
use winit::window::Window;

/// Handles an overlay needs to set up its own GPU resources.
pub struct OverlayInit<'a> {
    pub instance: &'a ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: &'a Arc<ash::Device>,
    pub queue_family: u32,
    pub queue: vk::Queue,
    /// Pool reserved for the overlay, apart from the ray tracing set.
    pub descriptor_pool: vk::DescriptorPool,
    pub render_pass: vk::RenderPass,
    pub image_count: u32,
    pub extent: vk::Extent2D,
}

/// Something drawn over the traced image each frame.
///
/// Call order: `attach` once the window exists, `init` once the renderer is
/// assembled, then per frame `begin_frame`, `end_frame` and `record_draw`.
/// Window events may arrive at any point after `attach`.
pub trait Overlay {
    /// Bind to the window the renderer presents into.
    fn attach(&mut self, _window: &Window) {}

    /// Create GPU resources.
    fn init(&mut self, _init: &OverlayInit<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Feed one window event to the overlay.
    fn handle_event(&mut self, _window: &Window, _event: &Event<()>) {}

    /// Start building this frame's draw data.
    fn begin_frame(&mut self, _window: &Window) {}

    /// Finish building this frame's draw data and stage it for recording.
    fn end_frame(&mut self) -> Result<()> {
        Ok(())
    }

    /// Record draw commands inside the overlay render pass.
    fn record_draw(&mut self, _device: &ash::Device, _cmd: vk::CommandBuffer) {}
}

/// Overlay that draws nothing.
#[derive(Debug, Default)]
pub struct NoOverlay;

impl Overlay for NoOverlay {}

/// Color attachment of the overlay pass.
///
/// The traced image is already in `GENERAL`, so it is loaded and left there.
pub fn overlay_attachment(format: vk::Format) -> vk::AttachmentDescription {
    vk::AttachmentDescription::default()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::LOAD)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::GENERAL)
        .final_layout(vk::ImageLayout::GENERAL)
}

/// Ray tracing writes must land before the overlay touches the image.
pub fn overlay_dependency() -> vk::SubpassDependency {
    vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR)
        .src_access_mask(vk::AccessFlags::SHADER_WRITE)
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        )
}

/// Single-subpass render pass the overlay draws in.
pub struct OverlayRenderPass {
    device: Arc<ash::Device>,
    render_pass: vk::RenderPass,
}

impl OverlayRenderPass {
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: Arc<ash::Device>, format: vk::Format) -> Result<Self> {
        let attachments = [overlay_attachment(format)];
        let color_refs = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let subpasses = [vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)];
        let dependencies = [overlay_dependency()];

        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let render_pass = device.create_render_pass(&create_info, None)?;
        Ok(Self {
            device,
            render_pass,
        })
    }

    pub fn handle(&self) -> vk::RenderPass {
        self.render_pass
    }
}

impl Drop for OverlayRenderPass {
    fn drop(&mut self) {
        unsafe { self.device.destroy_render_pass(self.render_pass, None) };
    }
}

/// One framebuffer per swapchain image view.
pub struct Framebuffers {
    device: Arc<ash::Device>,
    framebuffers: Vec<vk::Framebuffer>,
}

impl Framebuffers {
    /// # Safety
    /// The render pass and views must be valid and created on `device`.
    pub unsafe fn new(
        device: Arc<ash::Device>,
        render_pass: vk::RenderPass,
        views: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let mut this = Self {
            device,
            framebuffers: Vec::with_capacity(views.len()),
        };

        for &view in views {
            let attachments = [view];
            let create_info = vk::FramebufferCreateInfo::default()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);
            let framebuffer = this.device.create_framebuffer(&create_info, None)?;
            this.framebuffers.push(framebuffer);
        }

        Ok(this)
    }

    pub fn handles(&self) -> &[vk::Framebuffer] {
        &self.framebuffers
    }
}

impl Drop for Framebuffers {
    fn drop(&mut self) {
        for &framebuffer in &self.framebuffers {
            unsafe { self.device.destroy_framebuffer(framebuffer, None) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_keeps_traced_pixels() {
        let attachment = overlay_attachment(vk::Format::B8G8R8A8_UNORM);
        assert_eq!(attachment.load_op, vk::AttachmentLoadOp::LOAD);
        assert_eq!(attachment.store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(attachment.initial_layout, vk::ImageLayout::GENERAL);
        assert_eq!(attachment.final_layout, vk::ImageLayout::GENERAL);
        assert_eq!(attachment.format, vk::Format::B8G8R8A8_UNORM);
    }

    #[test]
    fn dependency_waits_for_ray_tracing() {
        let dependency = overlay_dependency();
        assert_eq!(dependency.src_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(dependency.dst_subpass, 0);
        assert_eq!(
            dependency.src_stage_mask,
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR
        );
        assert!(dependency
            .dst_access_mask
            .contains(vk::AccessFlags::COLOR_ATTACHMENT_WRITE));
    }

    #[test]
    fn no_overlay_accepts_frames() {
        let mut overlay = NoOverlay;
        assert!(overlay.end_frame().is_ok());
    }
}
