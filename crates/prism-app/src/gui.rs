//! imgui overlay.
//!
//! [`ImguiOverlay`] builds a small debug window each frame and draws it over
//! the traced image with its own graphics pipeline inside the overlay pass.
//! Window events reach imgui through `imgui-winit-support`.
//!
//! Geometry is flattened into one vertex and one index buffer per frame,
//! both host visible. Only one frame is ever in flight, so they are
//! rewritten in place.

use std::mem::{offset_of, size_of};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use imgui_winit_support::{HiDpiMode, WinitPlatform};
use prism_gpu::{
    cmd_transition_image, color_subresource_range, find_memory_type, BufferDesc, CommandPool,
    DescriptorSetLayoutBuilder, GpuBuffer, GpuError, Result,
};
use prism_rt::load_spirv;
use prism_rt::shader::ENTRY_POINT;
use tracing::{debug, info, trace, warn};
use winit::event::Event;
use winit::window::Window;

use crate::overlay::{Overlay, OverlayInit};

/// Compiled overlay vertex stage, relative to the shader directory.
pub const OVERLAY_VERTEX_SHADER: &str = "imgui.vert.spv";
/// Compiled overlay fragment stage, relative to the shader directory.
pub const OVERLAY_FRAGMENT_SHADER: &str = "imgui.frag.spv";

const FONT_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;
const FONT_TEXTURE_ID: usize = 0;
const FONT_SIZE_PIXELS: f32 = 13.0;
const MIN_GEOMETRY_BYTES: u64 = 4096;

/// One overlay vertex as the pipeline reads it.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct OverlayVertex {
    pub pos: [f32; 2],
    pub uv: [f32; 2],
    /// RGBA8, normalized in the shader.
    pub color: [u8; 4],
}

impl From<&imgui::DrawVert> for OverlayVertex {
    fn from(vertex: &imgui::DrawVert) -> Self {
        Self {
            pos: vertex.pos,
            uv: vertex.uv,
            color: vertex.col,
        }
    }
}

/// Vertex buffer binding and attribute layout of [`OverlayVertex`].
pub fn vertex_input() -> (
    vk::VertexInputBindingDescription,
    [vk::VertexInputAttributeDescription; 3],
) {
    let binding = vk::VertexInputBindingDescription {
        binding: 0,
        stride: size_of::<OverlayVertex>() as u32,
        input_rate: vk::VertexInputRate::VERTEX,
    };
    let attribute = |location, format, offset: usize| vk::VertexInputAttributeDescription {
        location,
        binding: 0,
        format,
        offset: offset as u32,
    };
    (
        binding,
        [
            attribute(0, vk::Format::R32G32_SFLOAT, offset_of!(OverlayVertex, pos)),
            attribute(1, vk::Format::R32G32_SFLOAT, offset_of!(OverlayVertex, uv)),
            attribute(2, vk::Format::R8G8B8A8_UNORM, offset_of!(OverlayVertex, color)),
        ],
    )
}

/// Index type matching `imgui::DrawIdx`.
pub const fn index_type() -> vk::IndexType {
    if size_of::<imgui::DrawIdx>() == 2 {
        vk::IndexType::UINT16
    } else {
        vk::IndexType::UINT32
    }
}

/// Map imgui display coordinates (origin top left, y down) to clip space.
pub fn ortho_projection(display_pos: [f32; 2], display_size: [f32; 2]) -> Mat4 {
    Mat4::orthographic_rh(
        display_pos[0],
        display_pos[0] + display_size[0],
        display_pos[1],
        display_pos[1] + display_size[1],
        -1.0,
        1.0,
    )
}

/// Scissor for a clip rectangle in display coordinates, clamped to the framebuffer.
///
/// Returns `None` when nothing of the rectangle is visible.
pub fn clip_scissor(
    clip_rect: [f32; 4],
    display_pos: [f32; 2],
    framebuffer_scale: [f32; 2],
    framebuffer: vk::Extent2D,
) -> Option<vk::Rect2D> {
    let min_x = ((clip_rect[0] - display_pos[0]) * framebuffer_scale[0]).max(0.0);
    let min_y = ((clip_rect[1] - display_pos[1]) * framebuffer_scale[1]).max(0.0);
    let max_x =
        ((clip_rect[2] - display_pos[0]) * framebuffer_scale[0]).min(framebuffer.width as f32);
    let max_y =
        ((clip_rect[3] - display_pos[1]) * framebuffer_scale[1]).min(framebuffer.height as f32);

    if max_x <= min_x || max_y <= min_y {
        return None;
    }

    Some(vk::Rect2D {
        offset: vk::Offset2D {
            x: min_x as i32,
            y: min_y as i32,
        },
        extent: vk::Extent2D {
            width: (max_x - min_x) as u32,
            height: (max_y - min_y) as u32,
        },
    })
}

/// One indexed draw into the overlay pass.
#[derive(Debug, Clone, Copy)]
pub struct OverlayDraw {
    pub scissor: vk::Rect2D,
    pub index_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
}

/// A frame's overlay geometry with every imgui draw list appended in order.
#[derive(Debug, Default)]
pub struct OverlayMesh {
    pub vertices: Vec<OverlayVertex>,
    pub indices: Vec<imgui::DrawIdx>,
    pub draws: Vec<OverlayDraw>,
    pub projection: Mat4,
}

impl OverlayMesh {
    /// Flatten `draw_data` for a framebuffer of size `framebuffer`.
    ///
    /// Draw offsets are rebased onto the combined buffers. Commands clipped
    /// away entirely are dropped.
    pub fn from_draw_data(draw_data: &imgui::DrawData, framebuffer: vk::Extent2D) -> Self {
        let mut mesh = Self {
            projection: ortho_projection(draw_data.display_pos, draw_data.display_size),
            ..Self::default()
        };
        if draw_data.display_size[0] <= 0.0 || draw_data.display_size[1] <= 0.0 {
            return mesh;
        }

        for list in draw_data.draw_lists() {
            let list_first_index = mesh.indices.len() as u32;
            let list_first_vertex = mesh.vertices.len() as i32;

            for command in list.commands() {
                match command {
                    imgui::DrawCmd::Elements {
                        count,
                        cmd_params:
                            imgui::DrawCmdParams {
                                clip_rect,
                                vtx_offset,
                                idx_offset,
                                ..
                            },
                    } => {
                        let Some(scissor) = clip_scissor(
                            clip_rect,
                            draw_data.display_pos,
                            draw_data.framebuffer_scale,
                            framebuffer,
                        ) else {
                            continue;
                        };
                        mesh.draws.push(OverlayDraw {
                            scissor,
                            index_count: count as u32,
                            first_index: list_first_index + idx_offset as u32,
                            vertex_offset: list_first_vertex + vtx_offset as i32,
                        });
                    }
                    imgui::DrawCmd::ResetRenderState => {}
                    imgui::DrawCmd::RawCallback { .. } => trace!("ignoring imgui raw callback"),
                }
            }

            mesh.vertices
                .extend(list.vtx_buffer().iter().map(OverlayVertex::from));
            mesh.indices.extend_from_slice(list.idx_buffer());
        }

        mesh
    }
}

/// The window the overlay shows: a draggable value, a toggle and a status line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DemoWindow {
    pub drag: f32,
    pub checked: bool,
}

impl DemoWindow {
    pub const TITLE: &'static str = "Hello, world!";

    /// Emit the window into `ui`.
    pub fn build(&mut self, ui: &imgui::Ui) {
        ui.window(Self::TITLE)
            .position([16.0, 16.0], imgui::Condition::FirstUseEver)
            .size([260.0, 110.0], imgui::Condition::FirstUseEver)
            .build(|| {
                imgui::Drag::new("Drag").speed(0.05).build(ui, &mut self.drag);
                ui.checkbox("Check Box", &mut self.checked);
                ui.text(format!("Yeah ({:.0} fps)", ui.io().framerate));
            });
    }
}

/// Overlay backed by imgui.
pub struct ImguiOverlay {
    gpu: Option<OverlayGpu>,
    platform: WinitPlatform,
    context: imgui::Context,
    demo: DemoWindow,
    shader_dir: PathBuf,
    last_frame: Instant,
    frame_open: bool,
}

impl ImguiOverlay {
    /// Create the imgui context. The overlay stages are loaded from `shader_dir` in `init`.
    pub fn new(shader_dir: impl Into<PathBuf>) -> Self {
        let mut context = imgui::Context::create();
        context.set_ini_filename(None);
        context.style_mut().use_dark_colors();
        let platform = WinitPlatform::new(&mut context);

        Self {
            gpu: None,
            platform,
            context,
            demo: DemoWindow::default(),
            shader_dir: shader_dir.into(),
            last_frame: Instant::now(),
            frame_open: false,
        }
    }

    pub fn demo(&self) -> &DemoWindow {
        &self.demo
    }
}

impl Overlay for ImguiOverlay {
    fn attach(&mut self, window: &Window) {
        self.platform
            .attach_window(self.context.io_mut(), window, HiDpiMode::Default);

        let hidpi_factor = self.platform.hidpi_factor() as f32;
        self.context
            .fonts()
            .add_font(&[imgui::FontSource::DefaultFontData {
                config: Some(imgui::FontConfig {
                    size_pixels: FONT_SIZE_PIXELS * hidpi_factor,
                    ..imgui::FontConfig::default()
                }),
            }]);
        self.context.io_mut().font_global_scale = 1.0 / hidpi_factor;
    }

    fn init(&mut self, init: &OverlayInit<'_>) -> anyhow::Result<()> {
        let gpu = {
            let fonts = self.context.fonts();
            let atlas = fonts.build_rgba32_texture();
            // SAFETY: every handle in `init` is live for the renderer's lifetime.
            unsafe { OverlayGpu::new(init, &atlas, &self.shader_dir)? }
        };
        self.context.fonts().tex_id = imgui::TextureId::new(FONT_TEXTURE_ID);
        self.gpu = Some(gpu);

        info!("imgui overlay ready");
        Ok(())
    }

    fn handle_event(&mut self, window: &Window, event: &Event<()>) {
        self.platform
            .handle_event(self.context.io_mut(), window, event);
    }

    fn begin_frame(&mut self, window: &Window) {
        if self.gpu.is_none() {
            return;
        }

        let now = Instant::now();
        self.context
            .io_mut()
            .update_delta_time(now - self.last_frame);
        self.last_frame = now;

        if let Err(e) = self.platform.prepare_frame(self.context.io_mut(), window) {
            warn!("imgui frame setup failed: {e}");
        }

        let ui = self.context.new_frame();
        self.demo.build(ui);
        self.platform.prepare_render(ui, window);
        self.frame_open = true;
    }

    fn end_frame(&mut self) -> Result<()> {
        if !std::mem::take(&mut self.frame_open) {
            return Ok(());
        }

        let draw_data = self.context.render();
        if let Some(gpu) = &mut self.gpu {
            let mesh = OverlayMesh::from_draw_data(draw_data, gpu.extent);
            gpu.upload(mesh)?;
        }
        Ok(())
    }

    fn record_draw(&mut self, device: &ash::Device, cmd: vk::CommandBuffer) {
        if let Some(gpu) = &self.gpu {
            // SAFETY: called inside the overlay pass with a recording command buffer.
            unsafe { gpu.record(device, cmd) };
        }
    }
}

/// Sampled font atlas image.
struct FontTexture {
    device: Arc<ash::Device>,
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
    sampler: vk::Sampler,
}

impl FontTexture {
    /// Upload the atlas and leave it in `SHADER_READ_ONLY_OPTIMAL`.
    ///
    /// # Safety
    /// Every handle in `init` must be valid.
    unsafe fn upload(
        init: &OverlayInit<'_>,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        atlas: &imgui::FontAtlasTexture<'_>,
    ) -> Result<Self> {
        let device = init.device;
        let extent = vk::Extent3D {
            width: atlas.width,
            height: atlas.height,
            depth: 1,
        };

        // Null until created; Drop destroys whatever exists.
        let mut font = Self {
            device: Arc::clone(device),
            image: vk::Image::null(),
            memory: vk::DeviceMemory::null(),
            view: vk::ImageView::null(),
            sampler: vk::Sampler::null(),
        };

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(FONT_FORMAT)
            .extent(extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        unsafe {
            font.image = device.create_image(&image_info, None)?;

            let requirements = device.get_image_memory_requirements(font.image);
            let memory_type_index = find_memory_type(
                memory_properties,
                requirements.memory_type_bits,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )?;
            let alloc_info = vk::MemoryAllocateInfo::default()
                .allocation_size(requirements.size)
                .memory_type_index(memory_type_index);
            font.memory = device.allocate_memory(&alloc_info, None)?;
            device.bind_image_memory(font.image, font.memory, 0)?;

            let staging = GpuBuffer::new(
                Arc::clone(device),
                memory_properties,
                &BufferDesc::host_visible(
                    "overlay font staging",
                    atlas.data.len() as u64,
                    vk::BufferUsageFlags::TRANSFER_SRC,
                ),
                Some(atlas.data),
            )?;

            let pool = CommandPool::new(
                Arc::clone(device),
                init.queue_family,
                vk::CommandPoolCreateFlags::TRANSIENT,
            )?;
            let image = font.image;
            pool.one_time_submit(init.queue, |device, cmd| {
                cmd_transition_image(
                    device,
                    cmd,
                    image,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::PipelineStageFlags2::TOP_OF_PIPE,
                    vk::AccessFlags2::NONE,
                    vk::PipelineStageFlags2::TRANSFER,
                    vk::AccessFlags2::TRANSFER_WRITE,
                );

                let region = vk::BufferImageCopy::default()
                    .image_subresource(
                        vk::ImageSubresourceLayers::default()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .layer_count(1),
                    )
                    .image_extent(extent);
                device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.handle(),
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );

                cmd_transition_image(
                    device,
                    cmd,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    vk::PipelineStageFlags2::TRANSFER,
                    vk::AccessFlags2::TRANSFER_WRITE,
                    vk::PipelineStageFlags2::FRAGMENT_SHADER,
                    vk::AccessFlags2::SHADER_SAMPLED_READ,
                );
                Ok(())
            })?;

            let view_info = vk::ImageViewCreateInfo::default()
                .image(font.image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(FONT_FORMAT)
                .subresource_range(color_subresource_range());
            font.view = device.create_image_view(&view_info, None)?;

            let sampler_info = vk::SamplerCreateInfo::default()
                .mag_filter(vk::Filter::LINEAR)
                .min_filter(vk::Filter::LINEAR)
                .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
                .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                .max_lod(1.0);
            font.sampler = device.create_sampler(&sampler_info, None)?;
        }

        debug!("Uploaded overlay font atlas: {}x{}", atlas.width, atlas.height);
        Ok(font)
    }
}

impl Drop for FontTexture {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_sampler(self.sampler, None);
            self.device.destroy_image_view(self.view, None);
            self.device.destroy_image(self.image, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

/// GPU side of the overlay: pipeline, font atlas and per-frame geometry.
struct OverlayGpu {
    device: Arc<ash::Device>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    extent: vk::Extent2D,
    mesh: OverlayMesh,
    vertex_buffer: Option<GpuBuffer>,
    index_buffer: Option<GpuBuffer>,
    pipeline: vk::Pipeline,
    pipeline_layout: vk::PipelineLayout,
    set_layout: vk::DescriptorSetLayout,
    descriptor_set: vk::DescriptorSet,
    font: FontTexture,
}

impl OverlayGpu {
    /// # Safety
    /// Every handle in `init` must be valid.
    unsafe fn new(
        init: &OverlayInit<'_>,
        atlas: &imgui::FontAtlasTexture<'_>,
        shader_dir: &Path,
    ) -> Result<Self> {
        let memory_properties = unsafe {
            init.instance
                .get_physical_device_memory_properties(init.physical_device)
        };
        let font = unsafe { FontTexture::upload(init, &memory_properties, atlas)? };

        let mut gpu = Self {
            device: Arc::clone(init.device),
            memory_properties,
            extent: init.extent,
            mesh: OverlayMesh::default(),
            vertex_buffer: None,
            index_buffer: None,
            pipeline: vk::Pipeline::null(),
            pipeline_layout: vk::PipelineLayout::null(),
            set_layout: vk::DescriptorSetLayout::null(),
            descriptor_set: vk::DescriptorSet::null(),
            font,
        };
        let device = Arc::clone(&gpu.device);

        unsafe {
            gpu.set_layout = DescriptorSetLayoutBuilder::new()
                .binding(
                    0,
                    vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    1,
                    vk::ShaderStageFlags::FRAGMENT,
                )
                .build(&device)?;

            let set_layouts = [gpu.set_layout];
            let alloc_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(init.descriptor_pool)
                .set_layouts(&set_layouts);
            gpu.descriptor_set = device
                .allocate_descriptor_sets(&alloc_info)?
                .into_iter()
                .next()
                .ok_or(GpuError::NullHandle("overlay descriptor set"))?;

            let image_infos = [vk::DescriptorImageInfo {
                sampler: gpu.font.sampler,
                image_view: gpu.font.view,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            }];
            let write = vk::WriteDescriptorSet::default()
                .dst_set(gpu.descriptor_set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(&image_infos);
            device.update_descriptor_sets(&[write], &[]);

            let push_constant_ranges = [vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::VERTEX,
                offset: 0,
                size: size_of::<Mat4>() as u32,
            }];
            let layout_info = vk::PipelineLayoutCreateInfo::default()
                .set_layouts(&set_layouts)
                .push_constant_ranges(&push_constant_ranges);
            gpu.pipeline_layout = device.create_pipeline_layout(&layout_info, None)?;

            let vertex_code = load_spirv(&shader_dir.join(OVERLAY_VERTEX_SHADER))?;
            let fragment_code = load_spirv(&shader_dir.join(OVERLAY_FRAGMENT_SHADER))?;
            gpu.pipeline = create_pipeline(
                &device,
                init.render_pass,
                gpu.pipeline_layout,
                &vertex_code,
                &fragment_code,
            )?;
        }

        info!(
            "Created overlay pipeline for {}x{}",
            gpu.extent.width, gpu.extent.height
        );
        Ok(gpu)
    }

    /// Copy `mesh` into the geometry buffers, growing them when needed.
    fn upload(&mut self, mesh: OverlayMesh) -> Result<()> {
        // The previous frame has finished on the GPU by the time this runs.
        write_geometry(
            &mut self.vertex_buffer,
            &self.device,
            &self.memory_properties,
            "overlay vertices",
            vk::BufferUsageFlags::VERTEX_BUFFER,
            bytemuck::cast_slice(&mesh.vertices),
        )?;
        write_geometry(
            &mut self.index_buffer,
            &self.device,
            &self.memory_properties,
            "overlay indices",
            vk::BufferUsageFlags::INDEX_BUFFER,
            bytemuck::cast_slice(&mesh.indices),
        )?;
        self.mesh = mesh;
        Ok(())
    }

    /// Record the staged draws.
    ///
    /// # Safety
    /// `cmd` must be recording inside the overlay render pass.
    unsafe fn record(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        if self.mesh.draws.is_empty() {
            return;
        }
        let (Some(vertex_buffer), Some(index_buffer)) = (&self.vertex_buffer, &self.index_buffer)
        else {
            return;
        };

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: self.extent.width as f32,
            height: self.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };

        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline);
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline_layout,
                0,
                &[self.descriptor_set],
                &[],
            );
            device.cmd_push_constants(
                cmd,
                self.pipeline_layout,
                vk::ShaderStageFlags::VERTEX,
                0,
                bytemuck::bytes_of(&self.mesh.projection),
            );
            device.cmd_bind_vertex_buffers(cmd, 0, &[vertex_buffer.handle()], &[0]);
            device.cmd_bind_index_buffer(cmd, index_buffer.handle(), 0, index_type());

            for draw in &self.mesh.draws {
                device.cmd_set_scissor(cmd, 0, &[draw.scissor]);
                device.cmd_draw_indexed(
                    cmd,
                    draw.index_count,
                    1,
                    draw.first_index,
                    draw.vertex_offset,
                    0,
                );
            }
        }
    }
}

impl Drop for OverlayGpu {
    fn drop(&mut self) {
        // The descriptor set goes back with the overlay pool.
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device
                .destroy_pipeline_layout(self.pipeline_layout, None);
            self.device
                .destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

/// Capacity for `bytes` of geometry: the next power of two, at least 4 KiB.
fn geometry_capacity(bytes: u64) -> u64 {
    bytes.next_power_of_two().max(MIN_GEOMETRY_BYTES)
}

fn write_geometry(
    slot: &mut Option<GpuBuffer>,
    device: &Arc<ash::Device>,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    name: &str,
    usage: vk::BufferUsageFlags,
    bytes: &[u8],
) -> Result<()> {
    if bytes.is_empty() {
        return Ok(());
    }

    let needed = bytes.len() as u64;
    if !slot.as_ref().is_some_and(|buffer| buffer.size() >= needed) {
        let desc = BufferDesc::host_visible(name, geometry_capacity(needed), usage);
        // SAFETY: the memory properties belong to the device's physical device.
        *slot = Some(unsafe { GpuBuffer::new(Arc::clone(device), memory_properties, &desc, None)? });
        debug!("Resized {name} to {} bytes", geometry_capacity(needed));
    }

    match slot {
        Some(buffer) => buffer.write_bytes(0, bytes),
        None => Err(GpuError::NullHandle("overlay geometry buffer")),
    }
}

/// Alpha-blended triangle pipeline for the overlay pass, with dynamic viewport and scissor.
///
/// # Safety
/// The render pass and layout must be valid and created on `device`.
unsafe fn create_pipeline(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    layout: vk::PipelineLayout,
    vertex_code: &[u32],
    fragment_code: &[u32],
) -> Result<vk::Pipeline> {
    let vertex_module = unsafe {
        device.create_shader_module(&vk::ShaderModuleCreateInfo::default().code(vertex_code), None)?
    };
    let fragment_module = match unsafe {
        device.create_shader_module(&vk::ShaderModuleCreateInfo::default().code(fragment_code), None)
    } {
        Ok(module) => module,
        Err(e) => {
            unsafe { device.destroy_shader_module(vertex_module, None) };
            return Err(e.into());
        }
    };

    let stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vertex_module)
            .name(ENTRY_POINT),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(fragment_module)
            .name(ENTRY_POINT),
    ];

    let (binding, attributes) = vertex_input();
    let bindings = [binding];
    let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST);
    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);
    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(vk::CullModeFlags::NONE)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .line_width(1.0);
    let multisample = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);
    let blend_attachments = [blend_attachment()];
    let color_blend =
        vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);
    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let create_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages)
        .vertex_input_state(&vertex_input_state)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(0);

    let result = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
    };

    unsafe {
        device.destroy_shader_module(vertex_module, None);
        device.destroy_shader_module(fragment_module, None);
    }

    result
        .map_err(|(_, e)| GpuError::PipelineCreation(format!("overlay pipeline: {e}")))?
        .into_iter()
        .next()
        .ok_or_else(|| GpuError::PipelineCreation("overlay pipeline: none returned".to_string()))
}

/// Straight alpha over the traced image.
fn blend_attachment() -> vk::PipelineColorBlendAttachmentState {
    vk::PipelineColorBlendAttachmentState::default()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(true)
        .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
        .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
        .color_blend_op(vk::BlendOp::ADD)
        .src_alpha_blend_factor(vk::BlendFactor::ONE)
        .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
        .alpha_blend_op(vk::BlendOp::ADD)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn vertex_layout_matches_imgui() {
        assert_eq!(size_of::<OverlayVertex>(), size_of::<imgui::DrawVert>());

        let (binding, attributes) = vertex_input();
        assert_eq!(binding.stride, 20);
        assert_eq!(
            attributes.map(|a| (a.location, a.format, a.offset)),
            [
                (0, vk::Format::R32G32_SFLOAT, 0),
                (1, vk::Format::R32G32_SFLOAT, 8),
                (2, vk::Format::R8G8B8A8_UNORM, 16),
            ]
        );
        assert_eq!(index_type(), vk::IndexType::UINT16);
    }

    #[test]
    fn projection_maps_display_corners_to_clip_corners() {
        let projection = ortho_projection([10.0, 20.0], [800.0, 600.0]);

        let top_left = projection * Vec4::new(10.0, 20.0, 0.0, 1.0);
        let bottom_right = projection * Vec4::new(810.0, 620.0, 0.0, 1.0);

        assert!(top_left.truncate().truncate().abs_diff_eq(glam::Vec2::new(-1.0, -1.0), 1e-6));
        assert!(bottom_right.truncate().truncate().abs_diff_eq(glam::Vec2::new(1.0, 1.0), 1e-6));
        assert!((0.0..=1.0).contains(&top_left.z));
    }

    #[test]
    fn scissor_is_scaled_and_clamped() {
        let scissor =
            clip_scissor([10.0, 20.0, 110.0, 70.0], [0.0, 0.0], [2.0, 2.0], extent(800, 600))
                .unwrap();
        assert_eq!((scissor.offset.x, scissor.offset.y), (20, 40));
        assert_eq!((scissor.extent.width, scissor.extent.height), (200, 100));

        // Offset display and a rectangle hanging off the framebuffer.
        let scissor =
            clip_scissor([-50.0, 550.0, 900.0, 700.0], [-10.0, 0.0], [1.0, 1.0], extent(800, 600))
                .unwrap();
        assert_eq!((scissor.offset.x, scissor.offset.y), (0, 550));
        assert_eq!((scissor.extent.width, scissor.extent.height), (800, 50));
    }

    #[test]
    fn fully_clipped_rect_has_no_scissor() {
        assert!(clip_scissor([900.0, 0.0, 950.0, 10.0], [0.0, 0.0], [1.0, 1.0], extent(800, 600))
            .is_none());
        assert!(clip_scissor([5.0, 5.0, 5.0, 50.0], [0.0, 0.0], [1.0, 1.0], extent(800, 600))
            .is_none());
    }

    #[test]
    fn geometry_capacity_grows_in_powers_of_two() {
        assert_eq!(geometry_capacity(1), 4096);
        assert_eq!(geometry_capacity(4096), 4096);
        assert_eq!(geometry_capacity(4097), 8192);
    }

    #[test]
    fn blend_is_straight_alpha() {
        let blend = blend_attachment();
        assert_eq!(blend.blend_enable, vk::TRUE);
        assert_eq!(blend.src_color_blend_factor, vk::BlendFactor::SRC_ALPHA);
        assert_eq!(
            blend.dst_color_blend_factor,
            vk::BlendFactor::ONE_MINUS_SRC_ALPHA
        );
    }

    // The only test that creates an imgui context; imgui allows one at a time.
    #[test]
    fn demo_window_flattens_into_drawable_mesh() {
        let mut context = imgui::Context::create();
        context.set_ini_filename(None);
        context.io_mut().display_size = [800.0, 600.0];
        context.io_mut().display_framebuffer_scale = [1.0, 1.0];
        context.fonts().build_rgba32_texture();

        let mut demo = DemoWindow::default();
        let ui = context.new_frame();
        demo.build(ui);
        let draw_data = context.render();

        let mesh = OverlayMesh::from_draw_data(draw_data, extent(800, 600));

        assert!(!mesh.draws.is_empty());
        assert_eq!(mesh.vertices.len(), draw_data.total_vtx_count as usize);
        assert_eq!(mesh.indices.len(), draw_data.total_idx_count as usize);
        for draw in &mesh.draws {
            assert!((draw.first_index + draw.index_count) as usize <= mesh.indices.len());
            assert!((draw.vertex_offset as usize) < mesh.vertices.len());
            assert!(draw.scissor.offset.x as u32 + draw.scissor.extent.width <= 800);
            assert!(draw.scissor.offset.y as u32 + draw.scissor.extent.height <= 600);
        }
        assert_eq!(demo, DemoWindow::default());
    }
}
