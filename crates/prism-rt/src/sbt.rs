//! Shader Binding Table (SBT) management for hardware ray tracing.
//!
//! The SBT is a GPU buffer containing shader handles organized by type:
//! - Ray generation shader (exactly one)
//! - Miss shaders
//! - Hit groups (closest-hit)
//! - Callable shaders (unused, the region is empty)
//!
//! [`SbtLayout`] holds the region math and handle packing so they can be
//! checked without a device.

use ash::vk;
use prism_gpu::{BufferDesc, GpuBuffer, GpuError, RayTracingProperties, Result};
use std::sync::Arc;
use tracing::info;

/// Align a value up to the given power-of-two alignment.
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Placement of one region inside the SBT buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    /// Byte offset from the start of the buffer
    pub offset: u64,
    /// Distance between consecutive handles
    pub stride: u64,
    /// Region size, a multiple of the base alignment
    pub size: u64,
    /// Number of handles in the region
    pub count: u32,
}

impl RegionLayout {
    fn region(&self, base_address: vk::DeviceAddress) -> vk::StridedDeviceAddressRegionKHR {
        vk::StridedDeviceAddressRegionKHR {
            device_address: base_address + self.offset,
            stride: self.stride,
            size: self.size,
        }
    }
}

/// The four regions passed to `vkCmdTraceRaysKHR`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SbtRegions {
    pub raygen: vk::StridedDeviceAddressRegionKHR,
    pub miss: vk::StridedDeviceAddressRegionKHR,
    pub hit: vk::StridedDeviceAddressRegionKHR,
    pub callable: vk::StridedDeviceAddressRegionKHR,
}

/// Region layout of an SBT with one raygen handle followed by miss and hit handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtLayout {
    pub handle_size: u32,
    pub raygen: RegionLayout,
    pub miss: RegionLayout,
    pub hit: RegionLayout,
    /// Buffer size covering all three regions
    pub total_size: u64,
}

impl SbtLayout {
    /// Compute the layout for the given handle properties and group counts.
    pub fn new(props: &RayTracingProperties, miss_count: u32, hit_count: u32) -> Self {
        let base_alignment = u64::from(props.base_alignment);
        let handle_stride = align_up(
            u64::from(props.handle_size),
            u64::from(props.handle_alignment),
        );

        // Raygen must have size == stride.
        let raygen_stride = align_up(handle_stride, base_alignment);
        let raygen = RegionLayout {
            offset: 0,
            stride: raygen_stride,
            size: raygen_stride,
            count: 1,
        };

        let miss = RegionLayout {
            offset: raygen.size,
            stride: handle_stride,
            size: align_up(u64::from(miss_count) * handle_stride, base_alignment),
            count: miss_count,
        };

        let hit = RegionLayout {
            offset: raygen.size + miss.size,
            stride: handle_stride,
            size: align_up(u64::from(hit_count) * handle_stride, base_alignment),
            count: hit_count,
        };

        Self {
            handle_size: props.handle_size,
            raygen,
            miss,
            hit,
            total_size: raygen.size + miss.size + hit.size,
        }
    }

    /// Total number of shader groups.
    pub fn group_count(&self) -> u32 {
        self.raygen.count + self.miss.count + self.hit.count
    }

    /// Size of the tightly packed handle data returned by the driver.
    pub fn handle_data_size(&self) -> usize {
        self.group_count() as usize * self.handle_size as usize
    }

    /// Copy tightly packed `handles` into `dst` at their region offsets.
    ///
    /// Handle `i` of a region lands at `offset + i * stride`; bytes between
    /// handles are left as they are.
    pub fn pack(&self, handles: &[u8], dst: &mut [u8]) -> Result<()> {
        if handles.len() < self.handle_data_size() {
            return Err(GpuError::InvalidState(format!(
                "handle data has {} bytes, expected {}",
                handles.len(),
                self.handle_data_size()
            )));
        }
        if (dst.len() as u64) < self.total_size {
            return Err(GpuError::InvalidState(format!(
                "SBT destination has {} bytes, expected {}",
                dst.len(),
                self.total_size
            )));
        }

        let handle_size = self.handle_size as usize;
        let mut group = 0usize;
        for region in [&self.raygen, &self.miss, &self.hit] {
            for i in 0..region.count as usize {
                let src = &handles[group * handle_size..(group + 1) * handle_size];
                let at = (region.offset + i as u64 * region.stride) as usize;
                dst[at..at + handle_size].copy_from_slice(src);
                group += 1;
            }
        }
        Ok(())
    }

    /// Device address regions for an SBT buffer starting at `base_address`.
    pub fn regions(&self, base_address: vk::DeviceAddress) -> SbtRegions {
        SbtRegions {
            raygen: self.raygen.region(base_address),
            miss: self.miss.region(base_address),
            hit: self.hit.region(base_address),
            callable: vk::StridedDeviceAddressRegionKHR::default(),
        }
    }
}

/// Shader Binding Table for the ray tracing pipeline.
pub struct ShaderBindingTable {
    layout: SbtLayout,
    regions: SbtRegions,
    buffer: GpuBuffer,
}

impl ShaderBindingTable {
    /// Fetch the group handles of `pipeline` and write them into a new SBT buffer.
    ///
    /// # Safety
    /// - The loader must belong to `device`.
    /// - `pipeline` must be a ray tracing pipeline with exactly
    ///   `1 + miss_count + hit_count` groups in raygen, miss, hit order.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn new(
        device: Arc<ash::Device>,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        rt_loader: &ash::khr::ray_tracing_pipeline::Device,
        pipeline: vk::Pipeline,
        props: &RayTracingProperties,
        miss_count: u32,
        hit_count: u32,
    ) -> Result<Self> {
        let layout = SbtLayout::new(props, miss_count, hit_count);

        let handles = rt_loader
            .get_ray_tracing_shader_group_handles(
                pipeline,
                0,
                layout.group_count(),
                layout.handle_data_size(),
            )
            .map_err(GpuError::ShaderGroupHandles)?;

        let mut buffer = GpuBuffer::new(
            device,
            memory_properties,
            &BufferDesc::host_visible(
                "shader_binding_table",
                layout.total_size,
                vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                    | vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            ),
            None,
        )?;

        {
            let mut mapped = buffer.map()?;
            layout.pack(&handles, mapped.as_mut_slice())?;
        }

        let regions = layout.regions(buffer.require_device_address()?);

        info!(
            "Created SBT: {} bytes, raygen {:#x}, miss {:#x}, hit {:#x}",
            layout.total_size,
            regions.raygen.device_address,
            regions.miss.device_address,
            regions.hit.device_address
        );

        Ok(Self {
            layout,
            regions,
            buffer,
        })
    }

    pub fn layout(&self) -> &SbtLayout {
        &self.layout
    }

    /// Regions for `vkCmdTraceRaysKHR`.
    pub fn regions(&self) -> &SbtRegions {
        &self.regions
    }

    pub fn buffer(&self) -> &GpuBuffer {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(handle_size: u32, handle_alignment: u32, base_alignment: u32) -> RayTracingProperties {
        RayTracingProperties {
            handle_size,
            handle_alignment,
            base_alignment,
            max_recursion_depth: 1,
        }
    }

    #[test]
    fn align_up_test() {
        assert_eq!(align_up(32, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(4, 4), 4);
        assert_eq!(align_up(0, 64), 0);
    }

    #[test]
    fn miss_region_is_padded_to_base_alignment() {
        let layout = SbtLayout::new(&props(32, 32, 64), 1, 1);
        assert_eq!(layout.miss.stride, 32);
        assert_eq!(layout.miss.size, 64);
        assert_eq!(layout.hit.stride, 32);
        assert_eq!(layout.hit.size, 64);
    }

    #[test]
    fn raygen_size_equals_stride() {
        let layout = SbtLayout::new(&props(32, 32, 64), 1, 1);
        assert_eq!(layout.raygen.stride, 64);
        assert_eq!(layout.raygen.size, layout.raygen.stride);
        assert_eq!(layout.raygen.offset, 0);
        assert_eq!(layout.miss.offset, 64);
        assert_eq!(layout.hit.offset, 128);
        assert_eq!(layout.total_size, 192);
    }

    #[test]
    fn handle_stride_rounds_to_handle_alignment() {
        let layout = SbtLayout::new(&props(20, 16, 64), 3, 2);
        assert_eq!(layout.miss.stride, 32);
        // 3 * 32 = 96, padded to 128.
        assert_eq!(layout.miss.size, 128);
        assert_eq!(layout.hit.size, 64);
        for region in [&layout.miss, &layout.hit] {
            assert!(region.size >= u64::from(region.count) * region.stride);
            assert_eq!(region.size % 64, 0);
        }
        assert_eq!(layout.group_count(), 6);
        assert_eq!(layout.handle_data_size(), 120);
    }

    #[test]
    fn regions_use_cumulative_offsets() {
        let layout = SbtLayout::new(&props(32, 32, 64), 1, 1);
        let regions = layout.regions(0x1_0000);
        assert_eq!(regions.raygen.device_address, 0x1_0000);
        assert_eq!(regions.miss.device_address, 0x1_0000 + 64);
        assert_eq!(regions.hit.device_address, 0x1_0000 + 128);
        assert_eq!(regions.raygen.size, regions.raygen.stride);
        assert_eq!(regions.callable.device_address, 0);
        assert_eq!(regions.callable.stride, 0);
        assert_eq!(regions.callable.size, 0);
    }

    #[test]
    fn pack_places_handles_at_region_offsets() {
        let layout = SbtLayout::new(&props(4, 8, 16), 2, 1);
        // raygen: stride 16 @0; miss: stride 8, size 16 @16; hit: stride 8, size 16 @32
        let handles: Vec<u8> = (0..4u8)
            .flat_map(|group| [group + 1; 4])
            .collect();
        let mut dst = vec![0u8; layout.total_size as usize];

        layout.pack(&handles, &mut dst).unwrap();

        assert_eq!(&dst[0..4], &[1; 4]);
        assert_eq!(&dst[4..16], &[0; 12]);
        assert_eq!(&dst[16..20], &[2; 4]);
        // Gap between miss handles is preserved.
        assert_eq!(&dst[20..24], &[0; 4]);
        assert_eq!(&dst[24..28], &[3; 4]);
        assert_eq!(&dst[32..36], &[4; 4]);
        assert_eq!(&dst[36..48], &[0; 12]);
    }

    #[test]
    fn pack_rejects_short_buffers() {
        let layout = SbtLayout::new(&props(32, 32, 64), 1, 1);
        let mut dst = vec![0u8; layout.total_size as usize];
        assert!(layout.pack(&[0u8; 64], &mut dst).is_err());

        let mut short = vec![0u8; 100];
        assert!(layout.pack(&[0u8; 96], &mut short).is_err());
    }
}
