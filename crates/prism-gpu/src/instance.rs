//! Vulkan instance creation and physical device selection.

use crate::capabilities::{query_device_extensions, REQUIRED_DEVICE_EXTENSIONS};
use crate::error::{GpuError, Result};
use ash::vk;
use raw_window_handle::RawDisplayHandle;
use std::ffi::{c_void, CStr, CString};
use tracing::{debug, error, info, warn};

/// Validation layers to enable when validation is requested.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Create a Vulkan instance with the surface extensions the display needs.
///
/// When `enable_validation` is set the validation layer and debug utils are
/// enabled; a missing layer is logged and skipped.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    display_handle: RawDisplayHandle,
    enable_validation: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|_| GpuError::Other("application name contains a NUL byte".into()))?;
    let engine_name = c"Prism";

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(engine_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let mut extension_names = ash_window::enumerate_required_extensions(display_handle)
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?
        .to_vec();

    let mut layer_names = Vec::new();
    if enable_validation {
        let available_layers = entry.enumerate_instance_layer_properties()?;
        for layer in validation_layers() {
            let found = available_layers.iter().any(|props| {
                CStr::from_ptr(props.layer_name.as_ptr()) == layer
            });
            if found {
                layer_names.push(layer.as_ptr());
            } else {
                warn!("Validation layer {:?} not available", layer);
            }
        }
        extension_names.push(ash::ext::debug_utils::NAME.as_ptr());
    }

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names);

    let instance = entry.create_instance(&create_info, None)?;
    debug!(
        "Created Vulkan instance ({} extensions, {} layers)",
        extension_names.len(),
        layer_names.len()
    );

    Ok(instance)
}

/// Debug messenger that forwards validation output to `tracing`.
pub struct DebugMessenger {
    loader: ash::ext::debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

impl DebugMessenger {
    /// Install the messenger.
    ///
    /// # Safety
    /// The instance must have been created with the debug utils extension and
    /// must outlive the messenger.
    pub unsafe fn new(entry: &ash::Entry, instance: &ash::Instance) -> Result<Self> {
        let loader = ash::ext::debug_utils::Instance::new(entry, instance);
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));
        let messenger = loader.create_debug_utils_messenger(&create_info, None)?;
        Ok(Self { loader, messenger })
    }

    /// Remove the messenger.
    ///
    /// # Safety
    /// Must be called once, before the instance is destroyed.
    pub unsafe fn destroy(&self) {
        self.loader
            .destroy_debug_utils_messenger(self.messenger, None);
    }
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    let message = if callback_data.is_null() || unsafe { (*callback_data).p_message.is_null() } {
        "<no message>".into()
    } else {
        unsafe { CStr::from_ptr((*callback_data).p_message) }.to_string_lossy()
    };

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "vulkan", "[{:?}] {}", message_type, message);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!(target: "vulkan", "[{:?}] {}", message_type, message);
    } else {
        debug!(target: "vulkan", "[{:?}] {}", message_type, message);
    }

    vk::FALSE
}

/// A physical device that passed selection, with the queue family to use.
#[derive(Debug, Clone, Copy)]
pub struct SelectedDevice {
    pub physical_device: vk::PhysicalDevice,
    /// Queue family supporting both graphics and presentation to the surface
    pub queue_family: u32,
}

/// Select the best physical device that can ray trace and present to `surface`.
///
/// Devices missing a required extension or a graphics+present queue family
/// are skipped.
///
/// # Safety
/// The instance and surface must be valid.
pub unsafe fn select_physical_device(
    instance: &ash::Instance,
    surface_loader: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<SelectedDevice> {
    let devices = instance.enumerate_physical_devices()?;

    if devices.is_empty() {
        return Err(GpuError::NoSuitableDevice);
    }

    let mut best: Option<(i32, SelectedDevice)> = None;

    for device in devices {
        let properties = instance.get_physical_device_properties(device);
        let name = CStr::from_ptr(properties.device_name.as_ptr()).to_string_lossy();

        let available = query_device_extensions(instance, device);
        let missing = crate::capabilities::missing_extensions(&REQUIRED_DEVICE_EXTENSIONS, &available);
        if !missing.is_empty() {
            info!("Skipping {}: missing extensions {:?}", name, missing);
            continue;
        }

        let Some(queue_family) = find_queue_family(instance, surface_loader, surface, device)
        else {
            info!("Skipping {}: no graphics+present queue family", name);
            continue;
        };

        let score = score_physical_device(instance, device);
        if score < 0 {
            info!("Skipping {}: Vulkan 1.3 not supported", name);
            continue;
        }

        if best.map_or(true, |(best_score, _)| score > best_score) {
            best = Some((
                score,
                SelectedDevice {
                    physical_device: device,
                    queue_family,
                },
            ));
        }
    }

    best.map(|(_, selected)| selected)
        .ok_or(GpuError::NoSuitableDevice)
}

/// First queue family with graphics support that can present to the surface.
unsafe fn find_queue_family(
    instance: &ash::Instance,
    surface_loader: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    device: vk::PhysicalDevice,
) -> Option<u32> {
    let families = instance.get_physical_device_queue_family_properties(device);
    families.iter().enumerate().find_map(|(index, family)| {
        let index = index as u32;
        let graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let present = surface_loader
            .get_physical_device_surface_support(device, index, surface)
            .unwrap_or(false);
        (graphics && present).then_some(index)
    })
}

/// Score a physical device for selection.
unsafe fn score_physical_device(instance: &ash::Instance, device: vk::PhysicalDevice) -> i32 {
    let properties = instance.get_physical_device_properties(device);

    let api_version = properties.api_version;
    if vk::api_version_major(api_version) < 1
        || (vk::api_version_major(api_version) == 1 && vk::api_version_minor(api_version) < 3)
    {
        return -1;
    }

    let mut score = 0;

    // Prefer discrete GPUs
    match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => score += 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => score += 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => score += 50,
        _ => {}
    }

    // Prefer more VRAM
    let memory = instance.get_physical_device_memory_properties(device);
    let vram_mb: u64 = memory
        .memory_heaps
        .iter()
        .take(memory.memory_heap_count as usize)
        .filter(|h| h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|h| h.size / (1024 * 1024))
        .sum();
    score += (vram_mb / 1024) as i32; // +1 per GB

    score
}
