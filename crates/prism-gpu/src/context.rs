//! GPU context management.

use crate::capabilities::{extension_name_ptrs, GpuCapabilities, REQUIRED_DEVICE_EXTENSIONS};
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, select_physical_device, DebugMessenger, SelectedDevice};
use crate::surface::SurfaceContext;
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;
use tracing::info;

/// Main GPU context holding Vulkan resources.
///
/// Owns the instance, the window surface, the logical device and the
/// extension loaders. Everything created from the device must be dropped
/// before the context.
pub struct GpuContext {
    // Entry must be kept alive for the lifetime of the context
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    debug_messenger: Option<DebugMessenger>,
    surface: SurfaceContext,
    physical_device: vk::PhysicalDevice,
    device: Arc<ash::Device>,
    capabilities: GpuCapabilities,

    queue_family: u32,
    queue: vk::Queue,

    swapchain_loader: ash::khr::swapchain::Device,
    acceleration_structure_loader: ash::khr::acceleration_structure::Device,
    ray_tracing_loader: ash::khr::ray_tracing_pipeline::Device,
}

impl GpuContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &Arc<ash::Device> {
        &self.device
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get GPU capabilities.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Memory types and heaps of the physical device.
    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.capabilities.memory_properties
    }

    /// Get the graphics+present queue.
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    /// Get the graphics+present queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the window surface.
    pub fn surface(&self) -> &SurfaceContext {
        &self.surface
    }

    pub fn swapchain_loader(&self) -> &ash::khr::swapchain::Device {
        &self.swapchain_loader
    }

    pub fn acceleration_structure_loader(&self) -> &ash::khr::acceleration_structure::Device {
        &self.acceleration_structure_loader
    }

    pub fn ray_tracing_loader(&self) -> &ash::khr::ray_tracing_pipeline::Device {
        &self.ray_tracing_loader
    }

    /// Wait for device to be idle.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            self.device.destroy_device(None);
            self.surface.destroy();
            if let Some(messenger) = &self.debug_messenger {
                messenger.destroy();
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Prism".to_string(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Build the GPU context for a window.
    ///
    /// Creates the instance and surface, then picks a device that supports
    /// ray tracing and can present to the surface.
    pub fn build<W>(self, window: &W) -> Result<GpuContext>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?
            .as_raw();
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?
            .as_raw();

        // Load Vulkan entry point
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let instance =
            unsafe { create_instance(&entry, &self.app_name, display, self.enable_validation) }?;

        let debug_messenger = if self.enable_validation {
            match unsafe { DebugMessenger::new(&entry, &instance) } {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        let surface = match unsafe { SurfaceContext::new(&entry, &instance, display, window_handle) }
        {
            Ok(surface) => surface,
            Err(e) => {
                unsafe { destroy_instance(&instance, debug_messenger.as_ref()) };
                return Err(e);
            }
        };

        let device_parts = match unsafe { create_device_parts(&instance, &surface) } {
            Ok(parts) => parts,
            Err(e) => {
                unsafe {
                    surface.destroy();
                    destroy_instance(&instance, debug_messenger.as_ref());
                }
                return Err(e);
            }
        };

        let DeviceParts {
            selected,
            device,
            queue,
            capabilities,
        } = device_parts;
        let device = Arc::new(device);

        let swapchain_loader = ash::khr::swapchain::Device::new(&instance, &device);
        let acceleration_structure_loader =
            ash::khr::acceleration_structure::Device::new(&instance, &device);
        let ray_tracing_loader = ash::khr::ray_tracing_pipeline::Device::new(&instance, &device);

        Ok(GpuContext {
            entry,
            instance,
            debug_messenger,
            surface,
            physical_device: selected.physical_device,
            device,
            capabilities,
            queue_family: selected.queue_family,
            queue,
            swapchain_loader,
            acceleration_structure_loader,
            ray_tracing_loader,
        })
    }
}

struct DeviceParts {
    selected: SelectedDevice,
    device: ash::Device,
    queue: vk::Queue,
    capabilities: GpuCapabilities,
}

unsafe fn create_device_parts(
    instance: &ash::Instance,
    surface: &SurfaceContext,
) -> Result<DeviceParts> {
    let selected = select_physical_device(instance, &surface.surface_loader, surface.surface)?;
    let capabilities = GpuCapabilities::query(instance, selected.physical_device);

    if let Some(missing) = capabilities.missing_required_extensions().first() {
        return Err(GpuError::ExtensionNotSupported(
            missing.to_string_lossy().into_owned(),
        ));
    }

    info!("Selected GPU: {}", capabilities.summary());
    info!("Using queue family {}", selected.queue_family);

    let (device, queue) = create_device(instance, &selected)?;

    Ok(DeviceParts {
        selected,
        device,
        queue,
        capabilities,
    })
}

unsafe fn destroy_instance(instance: &ash::Instance, messenger: Option<&DebugMessenger>) {
    if let Some(messenger) = messenger {
        messenger.destroy();
    }
    instance.destroy_instance(None);
}

/// Create the logical device with the ray tracing feature chain and retrieve its queue.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    selected: &SelectedDevice,
) -> Result<(ash::Device, vk::Queue)> {
    let queue_priority = 1.0_f32;
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(selected.queue_family)
        .queue_priorities(std::slice::from_ref(&queue_priority))];

    let extension_names = extension_name_ptrs(&REQUIRED_DEVICE_EXTENSIONS);

    let mut vulkan_1_3_features =
        vk::PhysicalDeviceVulkan13Features::default().synchronization2(true);

    let mut vulkan_1_2_features =
        vk::PhysicalDeviceVulkan12Features::default().buffer_device_address(true);

    let mut acceleration_structure_features =
        vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
            .acceleration_structure(true);

    let mut ray_tracing_features =
        vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);

    // Chain features together
    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut vulkan_1_3_features)
        .push_next(&mut vulkan_1_2_features)
        .push_next(&mut acceleration_structure_features)
        .push_next(&mut ray_tracing_features);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    let device = instance
        .create_device(selected.physical_device, &device_create_info, None)
        .map_err(GpuError::from)?;

    let queue = device.get_device_queue(selected.queue_family, 0);

    Ok((device, queue))
}
