//! Synchronization primitives.

use crate::error::Result;
use ash::vk;
use std::sync::Arc;

/// Binary semaphore, destroyed on drop.
pub struct Semaphore {
    device: Arc<ash::Device>,
    semaphore: vk::Semaphore,
}

impl Semaphore {
    /// Create a semaphore.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: Arc<ash::Device>) -> Result<Self> {
        let create_info = vk::SemaphoreCreateInfo::default();
        let semaphore = device.create_semaphore(&create_info, None)?;
        Ok(Self { device, semaphore })
    }

    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe { self.device.destroy_semaphore(self.semaphore, None) };
    }
}

/// Semaphores for the single frame in flight.
///
/// Present may still hold a render-finished semaphore after the queue goes
/// idle, so each swapchain image gets its own and the acquired index picks it.
pub struct FrameSync {
    /// Signaled when the swapchain image is available
    pub image_available: Semaphore,
    /// Signaled when rendering into image `i` is complete
    pub render_finished: Vec<Semaphore>,
}

impl FrameSync {
    /// Create frame synchronization resources for `image_count` swapchain images.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &Arc<ash::Device>, image_count: u32) -> Result<Self> {
        let image_available = unsafe { Semaphore::new(Arc::clone(device))? };
        let render_finished = (0..image_count)
            .map(|_| unsafe { Semaphore::new(Arc::clone(device)) })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            image_available,
            render_finished,
        })
    }

    /// Raw render-finished handles, indexed by swapchain image.
    pub fn render_finished_handles(&self) -> Vec<vk::Semaphore> {
        self.render_finished.iter().map(Semaphore::handle).collect()
    }
}
