//! GPU capability detection.

use ash::vk;
use std::collections::HashSet;
use std::ffi::{c_char, CStr};

/// Device extensions a ray tracing device must expose.
pub const REQUIRED_DEVICE_EXTENSIONS: [&CStr; 6] = [
    ash::khr::swapchain::NAME,
    ash::khr::acceleration_structure::NAME,
    ash::khr::ray_tracing_pipeline::NAME,
    ash::khr::deferred_host_operations::NAME,
    ash::khr::buffer_device_address::NAME,
    ash::khr::pipeline_library::NAME,
];

/// Raw name pointers for `vk::DeviceCreateInfo::enabled_extension_names`.
pub fn extension_name_ptrs(names: &[&CStr]) -> Vec<*const c_char> {
    names.iter().map(|name| name.as_ptr()).collect()
}

/// Names from `required` that are absent from `available`, in `required` order.
pub fn missing_extensions<'a>(
    required: &[&'a CStr],
    available: &HashSet<String>,
) -> Vec<&'a CStr> {
    required
        .iter()
        .copied()
        .filter(|name| {
            name.to_str()
                .map_or(true, |name| !available.contains(name))
        })
        .collect()
}

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Shader group handle layout reported by the ray tracing pipeline properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RayTracingProperties {
    /// Size of one shader group handle in bytes
    pub handle_size: u32,
    /// Required alignment of each handle within a region
    pub handle_alignment: u32,
    /// Required alignment of each region's start address
    pub base_alignment: u32,
    /// Maximum ray recursion depth
    pub max_recursion_depth: u32,
}

impl From<&vk::PhysicalDeviceRayTracingPipelinePropertiesKHR<'_>> for RayTracingProperties {
    fn from(props: &vk::PhysicalDeviceRayTracingPipelinePropertiesKHR<'_>) -> Self {
        Self {
            handle_size: props.shader_group_handle_size,
            handle_alignment: props.shader_group_handle_alignment,
            base_alignment: props.shader_group_base_alignment,
            max_recursion_depth: props.max_ray_recursion_depth,
        }
    }
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    /// Memory types and heaps, used for buffer allocation
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,

    /// Shader group handle layout
    pub ray_tracing: RayTracingProperties,

    // Available extensions
    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let mut rt_properties = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut properties2 =
            vk::PhysicalDeviceProperties2::default().push_next(&mut rt_properties);
        instance.get_physical_device_properties2(physical_device, &mut properties2);
        let properties = properties2.properties;
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let available_extensions = query_device_extensions(instance, physical_device);

        let vendor = GpuVendor::from_vendor_id(properties.vendor_id);
        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        Self {
            vendor,
            device_name,
            api_version: properties.api_version,
            driver_version: properties.driver_version,
            device_local_memory_mb,
            memory_properties,
            ray_tracing: RayTracingProperties::from(&rt_properties),
            available_extensions,
        }
    }

    /// Required extensions this device lacks.
    pub fn missing_required_extensions(&self) -> Vec<&'static CStr> {
        missing_extensions(&REQUIRED_DEVICE_EXTENSIONS, &self.available_extensions)
    }

    /// Check if the GPU can run the ray tracer: Vulkan 1.3 and every required extension.
    pub fn meets_requirements(&self) -> bool {
        let api_major = vk::api_version_major(self.api_version);
        let api_minor = vk::api_version_minor(self.api_version);

        if api_major < 1 || (api_major == 1 && api_minor < 3) {
            return false;
        }

        self.missing_required_extensions().is_empty()
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM - SBT handle {}B",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
            self.ray_tracing.handle_size,
        )
    }
}

/// Names of all device extensions the physical device exposes.
///
/// # Safety
/// The instance and physical device must be valid.
pub unsafe fn query_device_extensions(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> HashSet<String> {
    instance
        .enumerate_device_extension_properties(physical_device)
        .unwrap_or_default()
        .iter()
        .filter_map(|ext| {
            CStr::from_ptr(ext.extension_name.as_ptr())
                .to_str()
                .ok()
                .map(String::from)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extension_set(names: &[&CStr]) -> HashSet<String> {
        names
            .iter()
            .map(|n| n.to_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn full_extension_set_has_nothing_missing() {
        let available = extension_set(&REQUIRED_DEVICE_EXTENSIONS);
        assert!(missing_extensions(&REQUIRED_DEVICE_EXTENSIONS, &available).is_empty());
    }

    #[test]
    fn device_without_ray_tracing_is_rejected() {
        let available = extension_set(&[
            ash::khr::swapchain::NAME,
            ash::khr::acceleration_structure::NAME,
            ash::khr::deferred_host_operations::NAME,
            ash::khr::buffer_device_address::NAME,
            ash::khr::pipeline_library::NAME,
        ]);
        let missing = missing_extensions(&REQUIRED_DEVICE_EXTENSIONS, &available);
        assert_eq!(missing, vec![ash::khr::ray_tracing_pipeline::NAME]);
    }

    #[test]
    fn missing_extensions_keep_required_order() {
        let available = extension_set(&[ash::khr::swapchain::NAME]);
        let missing = missing_extensions(&REQUIRED_DEVICE_EXTENSIONS, &available);
        assert_eq!(missing.len(), REQUIRED_DEVICE_EXTENSIONS.len() - 1);
        assert_eq!(missing[0], ash::khr::acceleration_structure::NAME);
    }

    #[test]
    fn extension_pointers_read_back_as_names() {
        let ptrs = extension_name_ptrs(&REQUIRED_DEVICE_EXTENSIONS);
        assert_eq!(ptrs.len(), REQUIRED_DEVICE_EXTENSIONS.len());
        for (&ptr, &name) in ptrs.iter().zip(REQUIRED_DEVICE_EXTENSIONS.iter()) {
            // SAFETY: the pointer comes from a 'static CStr.
            assert_eq!(unsafe { CStr::from_ptr(ptr) }, name);
        }
    }

    #[test]
    fn ray_tracing_properties_from_vulkan() {
        let props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR {
            shader_group_handle_size: 32,
            shader_group_handle_alignment: 32,
            shader_group_base_alignment: 64,
            max_ray_recursion_depth: 31,
            ..Default::default()
        };
        let rt = RayTracingProperties::from(&props);
        assert_eq!(rt.handle_size, 32);
        assert_eq!(rt.handle_alignment, 32);
        assert_eq!(rt.base_alignment, 64);
        assert_eq!(rt.max_recursion_depth, 31);
    }
}
