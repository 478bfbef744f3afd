//! Swapchain management.
//!
//! Images are created with storage usage so the ray generation shader can
//! write to them directly, and with color attachment usage for the overlay
//! pass. The window never resizes, so the swapchain is created once.

use crate::command::{cmd_transition_image, color_subresource_range, CommandPool};
use crate::error::{GpuError, Result};
use crate::surface::SurfaceContext;
use ash::vk;
use std::sync::Arc;
use tracing::info;

/// Usage every swapchain image is created with.
pub const SWAPCHAIN_IMAGE_USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::from_raw(
    vk::ImageUsageFlags::STORAGE.as_raw() | vk::ImageUsageFlags::COLOR_ATTACHMENT.as_raw(),
);

/// Swapchain wrapper. Image views and the swapchain are destroyed on drop.
pub struct Swapchain {
    device: Arc<ash::Device>,
    loader: ash::khr::swapchain::Device,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    format: vk::Format,
    extent: vk::Extent2D,
}

impl Swapchain {
    /// Create a swapchain for the surface.
    ///
    /// # Safety
    /// All handles must be valid and the queue family must support
    /// presentation to the surface.
    pub unsafe fn new(
        device: Arc<ash::Device>,
        loader: ash::khr::swapchain::Device,
        surface: &SurfaceContext,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let caps = surface.capabilities(physical_device)?;

        if !caps
            .capabilities
            .supported_usage_flags
            .contains(SWAPCHAIN_IMAGE_USAGE)
        {
            return Err(GpuError::SwapchainCreation(format!(
                "surface does not support {SWAPCHAIN_IMAGE_USAGE:?} images"
            )));
        }

        let surface_format = select_surface_format(&caps.formats).ok_or_else(|| {
            GpuError::SwapchainCreation("surface reports no formats".to_string())
        })?;
        let present_mode = select_present_mode(&caps.present_modes);
        let extent = calculate_extent(&caps.capabilities, width, height);

        // Determine image count
        let mut image_count = caps.capabilities.min_image_count + 1;
        if caps.capabilities.max_image_count > 0 && image_count > caps.capabilities.max_image_count
        {
            image_count = caps.capabilities.max_image_count;
        }

        let queue_families = [queue_family];
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(SWAPCHAIN_IMAGE_USAGE)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&queue_families)
            .pre_transform(caps.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        let swapchain = loader
            .create_swapchain(&create_info, None)
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;

        let mut this = Self {
            device,
            loader,
            swapchain,
            images: Vec::new(),
            image_views: Vec::new(),
            format: surface_format.format,
            extent,
        };

        this.images = this.loader.get_swapchain_images(swapchain)?;

        for &image in &this.images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surface_format.format)
                .components(vk::ComponentMapping::default())
                .subresource_range(color_subresource_range());

            let view = this.device.create_image_view(&view_info, None)?;
            this.image_views.push(view);
        }

        info!(
            "Created swapchain: {} images, {}x{}, {:?}, {:?}",
            this.images.len(),
            extent.width,
            extent.height,
            surface_format.format,
            present_mode
        );

        Ok(this)
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Move every image from `UNDEFINED` to `PRESENT_SRC_KHR`.
    ///
    /// Frames expect the acquired image in the present layout, so this runs
    /// once after creation.
    ///
    /// # Safety
    /// The pool's queue family must match `queue`; no image may be in use.
    pub unsafe fn transition_to_present(&self, pool: &CommandPool, queue: vk::Queue) -> Result<()> {
        pool.one_time_submit(queue, |device, cmd| {
            for &image in &self.images {
                unsafe {
                    cmd_transition_image(
                        device,
                        cmd,
                        image,
                        vk::ImageLayout::UNDEFINED,
                        vk::ImageLayout::PRESENT_SRC_KHR,
                        vk::PipelineStageFlags2::TOP_OF_PIPE,
                        vk::AccessFlags2::NONE,
                        vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
                        vk::AccessFlags2::NONE,
                    );
                }
            }
            Ok(())
        })
    }

    /// Acquire the next image, waiting without timeout.
    ///
    /// Anything other than `SUCCESS`, including `SUBOPTIMAL_KHR`, is an error.
    ///
    /// # Safety
    /// The semaphore must be valid and unsignaled.
    pub unsafe fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<u32> {
        let result =
            self.loader
                .acquire_next_image(self.swapchain, u64::MAX, semaphore, vk::Fence::null());
        acquire_outcome(result)
    }

    /// Present an image after `wait_semaphore` signals.
    ///
    /// # Safety
    /// All handles must be valid.
    pub unsafe fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<()> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let wait_semaphores = [wait_semaphore];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        present_outcome(self.loader.queue_present(queue, &present_info))
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for &view in &self.image_views {
                self.device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

fn acquire_outcome(result: ash::prelude::VkResult<(u32, bool)>) -> Result<u32> {
    match result {
        Ok((index, false)) => Ok(index),
        Ok((_, true)) => Err(GpuError::AcquireImage(vk::Result::SUBOPTIMAL_KHR)),
        Err(e) => Err(GpuError::AcquireImage(e)),
    }
}

fn present_outcome(result: ash::prelude::VkResult<bool>) -> Result<()> {
    match result {
        Ok(false) => Ok(()),
        Ok(true) => Err(GpuError::Present(vk::Result::SUBOPTIMAL_KHR)),
        Err(e) => Err(GpuError::Present(e)),
    }
}

/// Select the surface format: UNORM BGRA, then UNORM RGBA, then whatever comes first.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    const PREFERRED: [vk::Format; 2] = [vk::Format::B8G8R8A8_UNORM, vk::Format::R8G8B8A8_UNORM];

    PREFERRED
        .iter()
        .find_map(|&wanted| available.iter().find(|f| f.format == wanted))
        .or_else(|| available.first())
        .copied()
}

/// Select the present mode. FIFO is always supported and is the only mode used.
pub fn select_present_mode(available: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if !available.contains(&vk::PresentModeKHR::FIFO) {
        tracing::warn!("Surface does not list FIFO; using it regardless");
    }
    vk::PresentModeKHR::FIFO
}

/// Calculate swapchain extent.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}
