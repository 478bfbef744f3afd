//! GPU memory management.
//!
//! Every [`GpuBuffer`] owns one `vk::Buffer` bound to its own dedicated
//! `vk::DeviceMemory` allocation. Both are released when the buffer drops.

use crate::error::{GpuError, Result};
use ash::vk;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

/// Find the first memory type allowed by `type_bits` that has every flag in `required`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Result<u32> {
    let count = memory_properties.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32);
    (0..count)
        .find(|&i| {
            type_bits & (1 << i) != 0
                && memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(required)
        })
        .ok_or(GpuError::NoCompatibleMemoryType {
            type_bits,
            properties: required,
        })
}

/// How one buffer's memory is allocated: a dedicated block of a type picked by property mask.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct AllocationPlan {
    size: u64,
    memory_type_index: u32,
    flags: vk::MemoryAllocateFlags,
    dedicated: vk::Buffer,
}

impl AllocationPlan {
    fn new(
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        requirements: &vk::MemoryRequirements,
        desc: &BufferDesc<'_>,
        buffer: vk::Buffer,
    ) -> Result<Self> {
        let memory_type_index =
            find_memory_type(memory_properties, requirements.memory_type_bits, desc.memory)?;
        let flags = if desc.wants_device_address() {
            vk::MemoryAllocateFlags::DEVICE_ADDRESS
        } else {
            vk::MemoryAllocateFlags::empty()
        };
        Ok(Self {
            size: requirements.size,
            memory_type_index,
            flags,
            dedicated: buffer,
        })
    }
}

/// Parameters for creating a [`GpuBuffer`].
#[derive(Clone, Copy, Debug)]
pub struct BufferDesc<'a> {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    pub memory: vk::MemoryPropertyFlags,
    /// Debug name used in log output.
    pub name: &'a str,
}

impl<'a> BufferDesc<'a> {
    /// Host-visible, coherent memory.
    pub fn host_visible(name: &'a str, size: u64, usage: vk::BufferUsageFlags) -> Self {
        Self {
            size,
            usage,
            memory: vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            name,
        }
    }

    /// Device-local memory.
    pub fn device_local(name: &'a str, size: u64, usage: vk::BufferUsageFlags) -> Self {
        Self {
            size,
            usage,
            memory: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            name,
        }
    }

    fn wants_device_address(&self) -> bool {
        self.usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
    }
}

/// A GPU buffer with its own memory allocation.
pub struct GpuBuffer {
    device: Arc<ash::Device>,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: u64,
    allocation_size: u64,
    memory_type_index: u32,
    memory_flags: vk::MemoryPropertyFlags,
    device_address: Option<vk::DeviceAddress>,
}

impl GpuBuffer {
    /// Create a buffer, allocate and bind its memory, and optionally upload `initial_data`.
    ///
    /// The device address is queried when the usage includes `SHADER_DEVICE_ADDRESS`.
    /// Initial data requires host-visible memory.
    ///
    /// # Safety
    /// The device must be valid and `memory_properties` must belong to its
    /// physical device.
    pub unsafe fn new(
        device: Arc<ash::Device>,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        desc: &BufferDesc<'_>,
        initial_data: Option<&[u8]>,
    ) -> Result<Self> {
        if desc.size == 0 {
            return Err(GpuError::InvalidState(format!(
                "buffer '{}' has zero size",
                desc.name
            )));
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let plan = match AllocationPlan::new(memory_properties, &requirements, desc, buffer) {
            Ok(plan) => plan,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };
        let memory_type_index = plan.memory_type_index;

        let mut dedicated_info = vk::MemoryDedicatedAllocateInfo::default().buffer(plan.dedicated);
        let mut flags_info = vk::MemoryAllocateFlagsInfo::default().flags(plan.flags);
        let mut alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(plan.size)
            .memory_type_index(plan.memory_type_index)
            .push_next(&mut dedicated_info);
        if !plan.flags.is_empty() {
            alloc_info = alloc_info.push_next(&mut flags_info);
        }

        let memory = match unsafe { device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e.into());
            }
        };

        // From here on Drop releases both handles.
        let mut gpu_buffer = Self {
            device,
            buffer,
            memory,
            size: desc.size,
            allocation_size: requirements.size,
            memory_type_index,
            memory_flags: memory_properties.memory_types[memory_type_index as usize].property_flags,
            device_address: None,
        };

        unsafe {
            gpu_buffer
                .device
                .bind_buffer_memory(buffer, memory, 0)?;
        }

        if let Some(data) = initial_data {
            gpu_buffer.write_bytes(0, data)?;
        }

        if desc.wants_device_address() {
            let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
            gpu_buffer.device_address =
                Some(unsafe { gpu_buffer.device.get_buffer_device_address(&info) });
        }

        debug!(
            "Created buffer '{}': {} bytes, memory type {}, address {:?}",
            desc.name, desc.size, memory_type_index, gpu_buffer.device_address
        );

        Ok(gpu_buffer)
    }

    /// Vulkan buffer handle.
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Requested size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Size of the backing allocation, at least [`Self::size`].
    pub fn allocation_size(&self) -> u64 {
        self.allocation_size
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    /// Device address, present only for `SHADER_DEVICE_ADDRESS` buffers.
    pub fn device_address(&self) -> Option<vk::DeviceAddress> {
        self.device_address
    }

    /// Device address, or an error if the buffer was created without one.
    pub fn require_device_address(&self) -> Result<vk::DeviceAddress> {
        self.device_address.ok_or_else(|| {
            GpuError::InvalidState("buffer was created without SHADER_DEVICE_ADDRESS".into())
        })
    }

    /// Map the whole buffer for host access.
    ///
    /// The mapping is released when the returned guard drops.
    pub fn map(&mut self) -> Result<MappedMemory<'_>> {
        if !self
            .memory_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
        {
            return Err(GpuError::InvalidState(
                "cannot map memory that is not host-visible".into(),
            ));
        }

        let ptr = unsafe {
            self.device
                .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())?
        };

        Ok(MappedMemory {
            device: &self.device,
            memory: self.memory,
            ptr: ptr.cast(),
            len: self.size as usize,
            _buffer: PhantomData,
        })
    }

    /// Copy `data` into the buffer at `offset`.
    pub fn write_bytes(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        check_range(self.size, offset, data.len())?;
        let mut mapped = self.map()?;
        mapped.as_mut_slice()[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_buffer(self.buffer, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

/// Host mapping of a [`GpuBuffer`]; unmaps on drop.
pub struct MappedMemory<'a> {
    device: &'a ash::Device,
    memory: vk::DeviceMemory,
    ptr: *mut u8,
    len: usize,
    _buffer: PhantomData<&'a mut GpuBuffer>,
}

impl MappedMemory<'_> {
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the pointer maps `len` bytes for as long as the guard lives, and the
        // guard holds the only borrow of the buffer.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MappedMemory<'_> {
    fn drop(&mut self) {
        unsafe { self.device.unmap_memory(self.memory) };
    }
}

fn check_range(size: u64, offset: u64, len: usize) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
    if end > size {
        return Err(GpuError::InvalidState(format!(
            "write of {len} bytes at offset {offset} exceeds buffer size {size}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn memory_properties(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: flags.len() as u32,
            ..Default::default()
        };
        for (slot, &property_flags) in props.memory_types.iter_mut().zip(flags) {
            slot.property_flags = property_flags;
        }
        props
    }

    #[test]
    fn picks_first_type_with_all_flags() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);
        let wanted = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(find_memory_type(&props, 0b111, wanted).unwrap(), 2);
        assert_eq!(
            find_memory_type(&props, 0b111, vk::MemoryPropertyFlags::HOST_VISIBLE).unwrap(),
            1
        );
    }

    #[test]
    fn respects_type_bits() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE,
        ]);
        assert_eq!(
            find_memory_type(&props, 0b10, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            1
        );
    }

    #[test]
    fn no_compatible_type_is_a_configuration_error() {
        let props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        let err = find_memory_type(&props, 0b1, vk::MemoryPropertyFlags::HOST_VISIBLE).unwrap_err();
        assert!(matches!(err, GpuError::NoCompatibleMemoryType { type_bits: 1, .. }));
        assert_eq!(err.kind(), ErrorKind::Configuration);

        // Allowed by flags but masked out by the requirements.
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        ]);
        assert!(find_memory_type(&props, 0b01, vk::MemoryPropertyFlags::HOST_VISIBLE).is_err());
    }

    #[test]
    fn empty_requirement_matches_first_allowed_type() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        ]);
        assert_eq!(
            find_memory_type(&props, 0b10, vk::MemoryPropertyFlags::empty()).unwrap(),
            1
        );
    }

    #[test]
    fn allocation_is_dedicated_to_its_buffer() {
        use ash::vk::Handle;

        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);
        let requirements = vk::MemoryRequirements {
            size: 512,
            alignment: 256,
            memory_type_bits: 0b11,
        };
        let buffer = vk::Buffer::from_raw(0x40);

        let usage = vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        let scratch = BufferDesc::device_local("scratch", 300, usage);
        let plan = AllocationPlan::new(&props, &requirements, &scratch, buffer).unwrap();
        assert_eq!(
            plan,
            AllocationPlan {
                size: 512,
                memory_type_index: 0,
                flags: vk::MemoryAllocateFlags::DEVICE_ADDRESS,
                dedicated: buffer,
            }
        );

        let staging = BufferDesc::host_visible("staging", 300, vk::BufferUsageFlags::TRANSFER_SRC);
        let plan = AllocationPlan::new(&props, &requirements, &staging, buffer).unwrap();
        assert_eq!(plan.memory_type_index, 1);
        assert!(plan.flags.is_empty());

        let masked = vk::MemoryRequirements {
            memory_type_bits: 0b01,
            ..requirements
        };
        assert!(AllocationPlan::new(&props, &masked, &staging, buffer).is_err());
    }

    #[test]
    fn write_range_is_bounds_checked() {
        assert!(check_range(64, 0, 64).is_ok());
        assert!(check_range(64, 32, 32).is_ok());
        assert!(check_range(64, 33, 32).is_err());
        assert!(check_range(64, u64::MAX, 1).is_err());
    }

    #[test]
    fn descriptor_presets() {
        let usage = vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        let scratch = BufferDesc::device_local("scratch", 256, usage);
        assert!(scratch.wants_device_address());
        assert_eq!(scratch.memory, vk::MemoryPropertyFlags::DEVICE_LOCAL);

        let staging = BufferDesc::host_visible("staging", 16, vk::BufferUsageFlags::TRANSFER_SRC);
        assert!(!staging.wants_device_address());
        assert!(staging.memory.contains(vk::MemoryPropertyFlags::HOST_COHERENT));
    }
}
