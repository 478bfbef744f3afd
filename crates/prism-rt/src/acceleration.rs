//! Acceleration structure management for hardware ray tracing.
//!
//! This module provides BLAS (Bottom-Level Acceleration Structure) and
//! TLAS (Top-Level Acceleration Structure) construction. Builds are recorded
//! into a one-time command buffer and block until the queue is idle, so a
//! structure is ready for use as soon as its constructor returns.

use ash::vk;
use prism_core::constants::FULL_VISIBILITY_MASK;
use prism_core::{InstanceTransform, TriangleMesh, Vertex};
use prism_gpu::{BufferDesc, CommandPool, GpuBuffer, GpuContext, GpuError, Result};
use std::sync::Arc;
use tracing::{debug, info};

/// Everything a build needs from the GPU context.
#[derive(Clone, Copy)]
pub struct BuildContext<'a> {
    pub device: &'a Arc<ash::Device>,
    pub memory_properties: &'a vk::PhysicalDeviceMemoryProperties,
    pub loader: &'a ash::khr::acceleration_structure::Device,
    pub command_pool: &'a CommandPool,
    pub queue: vk::Queue,
}

impl<'a> BuildContext<'a> {
    /// Borrow the pieces of `gpu` used for builds, submitting through `command_pool`.
    pub fn new(gpu: &'a GpuContext, command_pool: &'a CommandPool) -> Self {
        Self {
            device: gpu.device(),
            memory_properties: gpu.memory_properties(),
            loader: gpu.acceleration_structure_loader(),
            command_pool,
            queue: gpu.queue(),
        }
    }

    fn buffer(&self, desc: &BufferDesc<'_>, data: Option<&[u8]>) -> Result<GpuBuffer> {
        unsafe { GpuBuffer::new(Arc::clone(self.device), self.memory_properties, desc, data) }
    }
}

/// A built acceleration structure and the buffer backing it.
///
/// The handle is destroyed before the buffer is freed.
pub struct AccelerationStructure {
    loader: ash::khr::acceleration_structure::Device,
    handle: vk::AccelerationStructureKHR,
    device_address: vk::DeviceAddress,
    level: vk::AccelerationStructureTypeKHR,
    primitive_count: u32,
    buffer: GpuBuffer,
}

impl AccelerationStructure {
    /// Size, allocate, create and build an acceleration structure over one geometry.
    ///
    /// The scratch buffer only lives for the duration of the build.
    ///
    /// # Safety
    /// Any device addresses referenced by `geometry` must stay valid until
    /// this returns.
    pub unsafe fn build(
        ctx: &BuildContext<'_>,
        level: vk::AccelerationStructureTypeKHR,
        geometry: &vk::AccelerationStructureGeometryKHR<'_>,
        primitive_count: u32,
    ) -> Result<Self> {
        let geometries = std::slice::from_ref(geometry);
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(level)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(geometries);

        let mut build_sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            ctx.loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[primitive_count],
                &mut build_sizes,
            );
        }
        debug!(
            "{:?} build sizes: structure {} bytes, scratch {} bytes",
            level, build_sizes.acceleration_structure_size, build_sizes.build_scratch_size
        );

        let buffer = ctx.buffer(
            &BufferDesc::device_local(
                "acceleration_structure",
                build_sizes.acceleration_structure_size,
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            ),
            None,
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer.handle())
            .offset(0)
            .size(build_sizes.acceleration_structure_size)
            .ty(level);

        let handle = unsafe { ctx.loader.create_acceleration_structure(&create_info, None)? };

        let mut structure = Self {
            loader: ctx.loader.clone(),
            handle,
            device_address: 0,
            level,
            primitive_count,
            buffer,
        };

        let scratch = ctx.buffer(
            &BufferDesc::device_local(
                "acceleration_structure_scratch",
                build_sizes.build_scratch_size,
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            ),
            None,
        )?;
        let scratch_address = scratch.require_device_address()?;

        let build_info = build_info
            .dst_acceleration_structure(handle)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch_address,
            });

        let build_range = vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(primitive_count)
            .primitive_offset(0)
            .first_vertex(0)
            .transform_offset(0);

        unsafe {
            ctx.command_pool.one_time_submit(ctx.queue, |_, cmd| {
                ctx.loader.cmd_build_acceleration_structures(
                    cmd,
                    std::slice::from_ref(&build_info),
                    &[std::slice::from_ref(&build_range)],
                );
                Ok(())
            })?;
        }
        drop(scratch);

        let address_info =
            vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(handle);
        structure.device_address =
            unsafe { ctx.loader.get_acceleration_structure_device_address(&address_info) };

        Ok(structure)
    }

    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.handle
    }

    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    pub fn level(&self) -> vk::AccelerationStructureTypeKHR {
        self.level
    }

    pub fn primitive_count(&self) -> u32 {
        self.primitive_count
    }

    /// Buffer holding the structure.
    pub fn buffer(&self) -> &GpuBuffer {
        &self.buffer
    }
}

impl Drop for AccelerationStructure {
    fn drop(&mut self) {
        unsafe {
            self.loader
                .destroy_acceleration_structure(self.handle, None);
        }
    }
}

/// Bottom-level structure over one opaque triangle geometry.
pub struct BottomLevelAccel {
    structure: AccelerationStructure,
    // Build inputs, kept with the structure that was built from them.
    _vertex_buffer: GpuBuffer,
    _index_buffer: GpuBuffer,
}

impl BottomLevelAccel {
    /// Upload `mesh` and build a BLAS over it.
    pub fn from_mesh(ctx: &BuildContext<'_>, mesh: &TriangleMesh) -> Result<Self> {
        mesh.validate().map_err(GpuError::InvalidState)?;

        let usage = vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;

        let vertex_bytes = mesh.vertex_bytes();
        let vertex_buffer = ctx.buffer(
            &BufferDesc::host_visible("blas_vertices", vertex_bytes.len() as u64, usage),
            Some(vertex_bytes),
        )?;
        let index_bytes = mesh.index_bytes();
        let index_buffer = ctx.buffer(
            &BufferDesc::host_visible("blas_indices", index_bytes.len() as u64, usage),
            Some(index_bytes),
        )?;

        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
            .vertex_format(vk::Format::R32G32B32_SFLOAT)
            .vertex_data(vk::DeviceOrHostAddressConstKHR {
                device_address: vertex_buffer.require_device_address()?,
            })
            .vertex_stride(Vertex::STRIDE)
            .max_vertex(mesh.vertices.len() as u32 - 1)
            .index_type(vk::IndexType::UINT32)
            .index_data(vk::DeviceOrHostAddressConstKHR {
                device_address: index_buffer.require_device_address()?,
            });

        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles });

        let structure = unsafe {
            AccelerationStructure::build(
                ctx,
                vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                &geometry,
                mesh.triangle_count(),
            )?
        };

        info!(
            "Built BLAS: {} triangles, address {:#x}",
            structure.primitive_count(),
            structure.device_address()
        );

        Ok(Self {
            structure,
            _vertex_buffer: vertex_buffer,
            _index_buffer: index_buffer,
        })
    }

    pub fn structure(&self) -> &AccelerationStructure {
        &self.structure
    }

    pub fn device_address(&self) -> vk::DeviceAddress {
        self.structure.device_address()
    }
}

/// Top-level structure holding exactly one instance of a BLAS.
pub struct TopLevelAccel {
    structure: AccelerationStructure,
    instance: vk::AccelerationStructureInstanceKHR,
}

impl TopLevelAccel {
    /// Build a TLAS with one instance of `blas` placed at `transform`.
    pub fn single_instance(
        ctx: &BuildContext<'_>,
        blas: &BottomLevelAccel,
        transform: &InstanceTransform,
    ) -> Result<Self> {
        let instance = instance_record(transform, blas.device_address());

        let instance_buffer = ctx.buffer(
            &BufferDesc::host_visible(
                "tlas_instances",
                std::mem::size_of::<vk::AccelerationStructureInstanceKHR>() as u64,
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            ),
            Some(instance_bytes(&instance)),
        )?;

        let instances = vk::AccelerationStructureGeometryInstancesDataKHR::default()
            .array_of_pointers(false)
            .data(vk::DeviceOrHostAddressConstKHR {
                device_address: instance_buffer.require_device_address()?,
            });

        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .geometry(vk::AccelerationStructureGeometryDataKHR { instances });

        // The build has completed when this returns, so the instance buffer can go.
        let structure = unsafe {
            AccelerationStructure::build(
                ctx,
                vk::AccelerationStructureTypeKHR::TOP_LEVEL,
                &geometry,
                1,
            )?
        };

        info!(
            "Built TLAS: 1 instance of BLAS {:#x}, address {:#x}",
            blas.device_address(),
            structure.device_address()
        );

        Ok(Self {
            structure,
            instance,
        })
    }

    pub fn structure(&self) -> &AccelerationStructure {
        &self.structure
    }

    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.structure.handle()
    }

    pub fn device_address(&self) -> vk::DeviceAddress {
        self.structure.device_address()
    }

    /// The instance record the TLAS was built from.
    pub fn instance(&self) -> &vk::AccelerationStructureInstanceKHR {
        &self.instance
    }
}

/// Instance record for a single, fully visible, cull-disabled BLAS instance.
pub fn instance_record(
    transform: &InstanceTransform,
    blas_address: vk::DeviceAddress,
) -> vk::AccelerationStructureInstanceKHR {
    vk::AccelerationStructureInstanceKHR {
        transform: vk::TransformMatrixKHR {
            matrix: transform.to_row_major_3x4(),
        },
        instance_custom_index_and_mask: vk::Packed24_8::new(0, FULL_VISIBILITY_MASK),
        instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
            0,
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
        ),
        acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
            device_handle: blas_address,
        },
    }
}

fn instance_bytes(instance: &vk::AccelerationStructureInstanceKHR) -> &[u8] {
    // SAFETY: the instance is a `repr(C)` plain-data struct with no padding.
    unsafe {
        std::slice::from_raw_parts(
            (instance as *const vk::AccelerationStructureInstanceKHR).cast::<u8>(),
            std::mem::size_of::<vk::AccelerationStructureInstanceKHR>(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_core::glam::Vec3;

    #[test]
    fn instance_record_size() {
        assert_eq!(std::mem::size_of::<vk::AccelerationStructureInstanceKHR>(), 64);
    }

    #[test]
    fn instance_references_blas_address() {
        let record = instance_record(&InstanceTransform::IDENTITY, 0xDEAD_BEEF_0000);
        let reference = unsafe { record.acceleration_structure_reference.device_handle };
        assert_eq!(reference, 0xDEAD_BEEF_0000);
    }

    #[test]
    fn instance_is_visible_and_cull_disabled() {
        let record = instance_record(&InstanceTransform::IDENTITY, 0x1000);
        assert_eq!(record.instance_custom_index_and_mask.low_24(), 0);
        assert_eq!(record.instance_custom_index_and_mask.high_8(), 0xFF);
        assert_eq!(
            record
                .instance_shader_binding_table_record_offset_and_flags
                .low_24(),
            0
        );
        assert_eq!(
            record
                .instance_shader_binding_table_record_offset_and_flags
                .high_8(),
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8
        );
    }

    #[test]
    fn instance_transform_is_row_major() {
        let transform = InstanceTransform::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let record = instance_record(&transform, 0x1000);
        assert_eq!(
            record.transform.matrix,
            [1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 2.0, 0.0, 0.0, 1.0, 3.0]
        );
    }

    #[test]
    fn instance_bytes_cover_the_record() {
        let record = instance_record(&InstanceTransform::IDENTITY, 0x1234_5678);
        let bytes = instance_bytes(&record);
        assert_eq!(bytes.len(), 64);
        // The reference is the last eight bytes.
        assert_eq!(&bytes[56..], &0x1234_5678u64.to_ne_bytes());
    }
}
