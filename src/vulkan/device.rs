use super::instance::{self, QueueFamilies, other};
use crate::device::{Device, FenceStatus, PhysicalBuffer, PhysicalDeviceInfo, PhysicalImage};
use crate::error::{FrameGraphError, Result};
use crate::pipeline_cache::{ComputePipelineState, GraphicsPipelineState, PipelineObject};
use crate::render_pass::RenderPassDescription;
use crate::resource::{ImageDescription, aspect_mask_from_format};
use crate::resource_cache::{Descriptor, DescriptorSetLayoutBinding, RenderPass};
use ash::{ext::debug_utils, vk};
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};
use rustc_hash::FxHashMap;
use std::ffi::{CStr, CString};
use std::sync::{Mutex, MutexGuard};

const DESCRIPTOR_POOL_SETS: u32 = 1024;

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| FrameGraphError::Other("vulkan device lock poisoned".to_string()))
}

struct ImageAllocation {
    view: vk::ImageView,
    allocation: Allocation,
}

/// ash backed [`Device`]. Owns the instance, the logical device, the memory
/// allocator and every image and buffer created through it.
pub struct VulkanDevice {
    _entry: ash::Entry,
    instance: ash::Instance,
    debug_utils: Option<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    debug_utils_device: Option<debug_utils::Device>,
    surface_loader: ash::khr::surface::Instance,
    physical_device: vk::PhysicalDevice,
    info: PhysicalDeviceInfo,
    device: ash::Device,
    families: QueueFamilies,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    command_pool: Mutex<vk::CommandPool>,
    descriptor_pool: Mutex<vk::DescriptorPool>,
    allocator: Option<Mutex<Allocator>>,
    images: Mutex<FxHashMap<vk::Image, ImageAllocation>>,
    buffers: Mutex<FxHashMap<vk::Buffer, Allocation>>,
}

impl VulkanDevice {
    /// Brings up Vulkan for `window` and returns the device together with
    /// the window surface it was selected for.
    pub fn new<W>(window: &W, application_name: &CStr, validation: bool) -> Result<(Self, vk::SurfaceKHR)>
    where
        W: raw_window_handle::HasDisplayHandle + raw_window_handle::HasWindowHandle,
    {
        log::info!("Creating vulkan device");

        let entry = instance::load_entry()?;
        let (instance, validation) =
            instance::create_instance(window, &entry, application_name, validation)?;
        log::info!("Loaded vulkan instance");

        let (surface_loader, surface_khr) = instance::create_surface(window, &entry, &instance)?;
        let debug_utils = if validation {
            Some(instance::create_debug_utils(&entry, &instance)?)
        } else {
            None
        };

        let (physical_device, families) =
            instance::find_physical_device(&instance, &surface_loader, surface_khr)?;
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let info = PhysicalDeviceInfo {
            name: properties
                .device_name_as_c_str()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown device".to_string()),
            vendor_id: properties.vendor_id,
            device_id: properties.device_id,
            pipeline_cache_uuid: properties.pipeline_cache_uuid,
        };
        log::info!("Using physical device {}", info.name);

        let device = instance::create_device(&instance, physical_device, &families)?;
        let graphics_queue = unsafe { device.get_device_queue(families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(families.present, 0) };

        let command_pool = {
            let create_info = vk::CommandPoolCreateInfo::default()
                .queue_family_index(families.graphics)
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
            unsafe { device.create_command_pool(&create_info, None)? }
        };

        let descriptor_pool = {
            let pool_sizes = [
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::DescriptorType::STORAGE_BUFFER,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::DescriptorType::SAMPLED_IMAGE,
                vk::DescriptorType::STORAGE_IMAGE,
            ]
            .map(|ty| vk::DescriptorPoolSize {
                ty,
                descriptor_count: DESCRIPTOR_POOL_SETS,
            });
            let create_info = vk::DescriptorPoolCreateInfo::default()
                .max_sets(DESCRIPTOR_POOL_SETS)
                .pool_sizes(&pool_sizes);
            unsafe { device.create_descriptor_pool(&create_info, None)? }
        };

        let allocator = instance::create_allocator(&instance, physical_device, &device)?;
        log::info!("Created gpu memory allocator");

        let debug_utils_device = debug_utils
            .as_ref()
            .map(|_| debug_utils::Device::new(&instance, &device));

        Ok((
            Self {
                _entry: entry,
                instance,
                debug_utils,
                debug_utils_device,
                surface_loader,
                physical_device,
                info,
                device,
                families,
                graphics_queue,
                present_queue,
                command_pool: Mutex::new(command_pool),
                descriptor_pool: Mutex::new(descriptor_pool),
                allocator: Some(Mutex::new(allocator)),
                images: Mutex::new(FxHashMap::default()),
                buffers: Mutex::new(FxHashMap::default()),
            },
            surface_khr,
        ))
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub(crate) fn surface_loader(&self) -> &ash::khr::surface::Instance {
        &self.surface_loader
    }

    pub(crate) fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    pub(crate) fn queue_family_indices(&self) -> [u32; 2] {
        [self.families.graphics, self.families.present]
    }

    fn allocator(&self) -> Result<MutexGuard<'_, Allocator>> {
        let allocator = self
            .allocator
            .as_ref()
            .ok_or_else(|| FrameGraphError::Other("allocator already released".to_string()))?;
        lock(allocator)
    }

    fn free_allocation(&self, allocation: Allocation) {
        match self.allocator() {
            Ok(mut allocator) => {
                if let Err(error) = allocator.free(allocation) {
                    log::error!("Failed to free allocation: {error}");
                }
            }
            Err(error) => log::error!("Failed to free allocation: {error}"),
        }
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_size: u32,
        stages: vk::ShaderStageFlags,
    ) -> Result<vk::PipelineLayout> {
        let push_constant_ranges = [vk::PushConstantRange {
            stage_flags: stages,
            offset: 0,
            size: push_constant_size,
        }];
        let ranges: &[vk::PushConstantRange] = if push_constant_size > 0 {
            &push_constant_ranges
        } else {
            &[]
        };
        let create_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(set_layouts)
            .push_constant_ranges(ranges);
        Ok(unsafe { self.device.create_pipeline_layout(&create_info, None)? })
    }
}

fn entry_point(name: &str) -> Result<CString> {
    CString::new(name).map_err(other)
}

fn view_type(description: &ImageDescription) -> vk::ImageViewType {
    match description.image_type {
        vk::ImageType::TYPE_1D if description.layers > 1 => vk::ImageViewType::TYPE_1D_ARRAY,
        vk::ImageType::TYPE_1D => vk::ImageViewType::TYPE_1D,
        vk::ImageType::TYPE_3D => vk::ImageViewType::TYPE_3D,
        _ if description.layers > 1 => vk::ImageViewType::TYPE_2D_ARRAY,
        _ => vk::ImageViewType::TYPE_2D,
    }
}

fn attachment_reference(reference: &crate::render_pass::AttachmentRef) -> vk::AttachmentReference {
    vk::AttachmentReference {
        attachment: reference.attachment,
        layout: reference.layout,
    }
}

impl Device for VulkanDevice {
    fn physical_device_info(&self) -> PhysicalDeviceInfo {
        self.info.clone()
    }

    fn raw(&self) -> Option<&ash::Device> {
        Some(&self.device)
    }

    fn set_debug_name(&self, object_type: vk::ObjectType, raw_handle: u64, name: &str) {
        let Some(debug_utils) = self.debug_utils_device.as_ref() else {
            return;
        };
        let Ok(name) = CString::new(name) else {
            return;
        };
        let mut name_info = vk::DebugUtilsObjectNameInfoEXT::default().object_name(&name);
        name_info.object_type = object_type;
        name_info.object_handle = raw_handle;
        if let Err(error) = unsafe { debug_utils.set_debug_utils_object_name(&name_info) } {
            log::warn!("Failed to name {object_type:?}: {error}");
        }
    }

    fn create_image(
        &self,
        description: &ImageDescription,
        usage: vk::ImageUsageFlags,
    ) -> Result<PhysicalImage> {
        let image_create_info = vk::ImageCreateInfo::default()
            .image_type(description.image_type)
            .extent(description.extent)
            .mip_levels(1)
            .array_layers(description.layers)
            .format(description.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .samples(description.samples);

        let image = unsafe { self.device.create_image(&image_create_info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = self.allocator()?.allocate(&AllocationCreateDesc {
            name: "frame_graph_image",
            requirements,
            location: gpu_allocator::MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::DedicatedImage(image),
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(error) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(error.into());
            }
        };

        unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())?;
        }

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(view_type(description))
            .format(description.format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect_mask_from_format(description.format))
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(description.layers),
            );
        let view = unsafe { self.device.create_image_view(&view_info, None)? };

        lock(&self.images)?.insert(image, ImageAllocation { view, allocation });

        Ok(PhysicalImage {
            image,
            view,
            format: description.format,
            extent: description.extent,
        })
    }

    fn destroy_image(&self, image: PhysicalImage) {
        let tracked = match lock(&self.images) {
            Ok(mut images) => images.remove(&image.image),
            Err(error) => {
                log::error!("Failed to destroy image: {error}");
                return;
            }
        };
        unsafe {
            self.device.destroy_image_view(image.view, None);
            self.device.destroy_image(image.image, None);
        }
        if let Some(tracked) = tracked {
            self.free_allocation(tracked.allocation);
        }
    }

    fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: gpu_allocator::MemoryLocation,
    ) -> Result<PhysicalBuffer> {
        let create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&create_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = self.allocator()?.allocate(&AllocationCreateDesc {
            name: "frame_graph_buffer",
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::DedicatedBuffer(buffer),
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(error) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(error.into());
            }
        };

        unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())?;
        }
        lock(&self.buffers)?.insert(buffer, allocation);

        Ok(PhysicalBuffer { buffer, size })
    }

    fn write_buffer(&self, buffer: &PhysicalBuffer, offset: u64, data: &[u8]) -> Result<()> {
        let mut buffers = lock(&self.buffers)?;
        let allocation = buffers
            .get_mut(&buffer.buffer)
            .ok_or_else(|| FrameGraphError::Other("buffer is not owned by this device".into()))?;
        let mapped = allocation
            .mapped_slice_mut()
            .ok_or_else(|| FrameGraphError::Other("buffer is not host visible".into()))?;

        let start = offset as usize;
        let target = mapped
            .get_mut(start..start + data.len())
            .ok_or_else(|| FrameGraphError::Other("write past the end of the buffer".into()))?;
        target.copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&self, buffer: PhysicalBuffer) {
        let allocation = match lock(&self.buffers) {
            Ok(mut buffers) => buffers.remove(&buffer.buffer),
            Err(error) => {
                log::error!("Failed to destroy buffer: {error}");
                return;
            }
        };
        unsafe { self.device.destroy_buffer(buffer.buffer, None) };
        if let Some(allocation) = allocation {
            self.free_allocation(allocation);
        }
    }

    fn create_render_pass(&self, description: &RenderPassDescription) -> Result<vk::RenderPass> {
        let attachments = description
            .attachments
            .iter()
            .map(|attachment| {
                vk::AttachmentDescription::default()
                    .format(attachment.format)
                    .samples(attachment.samples)
                    .load_op(attachment.load_op)
                    .store_op(attachment.store_op)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(attachment.initial_layout)
                    .final_layout(attachment.final_layout)
            })
            .collect::<Vec<_>>();

        let references = description
            .subpasses
            .iter()
            .map(|subpass| {
                let colors = subpass
                    .color_refs()
                    .map(attachment_reference)
                    .collect::<Vec<_>>();
                let depth = subpass.depth_ref().map(attachment_reference);
                (colors, depth)
            })
            .collect::<Vec<_>>();

        let subpasses = description
            .subpasses
            .iter()
            .zip(&references)
            .map(|(subpass, (colors, depth))| {
                let info = vk::SubpassDescription::default()
                    .pipeline_bind_point(subpass.bind_point)
                    .color_attachments(colors);
                match depth {
                    Some(depth) => info.depth_stencil_attachment(depth),
                    None => info,
                }
            })
            .collect::<Vec<_>>();

        let dependencies = [description.external_dependency()];
        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        Ok(unsafe { self.device.create_render_pass(&create_info, None)? })
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        unsafe { self.device.destroy_render_pass(render_pass, None) };
    }

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        extent: vk::Extent2D,
        attachments: &[vk::ImageView],
    ) -> Result<vk::Framebuffer> {
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        Ok(unsafe { self.device.create_framebuffer(&create_info, None)? })
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) };
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorSetLayoutBinding],
    ) -> Result<vk::DescriptorSetLayout> {
        let bindings = bindings
            .iter()
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding.binding)
                    .descriptor_type(binding.descriptor_type)
                    .descriptor_count(binding.count)
                    .stage_flags(binding.stages)
            })
            .collect::<Vec<_>>();
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        Ok(unsafe { self.device.create_descriptor_set_layout(&create_info, None)? })
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn allocate_descriptor_set(&self, layout: vk::DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        let pool = lock(&self.descriptor_pool)?;
        let layouts = [layout];
        let allocate_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(*pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&allocate_info)? };
        sets.into_iter()
            .next()
            .ok_or_else(|| FrameGraphError::Other("no descriptor set allocated".into()))
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, descriptors: &[Descriptor]) {
        let buffer_infos = descriptors
            .iter()
            .filter_map(|descriptor| match *descriptor {
                Descriptor::Buffer {
                    buffer,
                    offset,
                    range,
                    ..
                } => Some(vk::DescriptorBufferInfo {
                    buffer,
                    offset,
                    range,
                }),
                Descriptor::Image { .. } => None,
            })
            .collect::<Vec<_>>();
        let image_infos = descriptors
            .iter()
            .filter_map(|descriptor| match *descriptor {
                Descriptor::Image {
                    view,
                    sampler,
                    layout,
                    ..
                } => Some(vk::DescriptorImageInfo {
                    sampler,
                    image_view: view,
                    image_layout: layout,
                }),
                Descriptor::Buffer { .. } => None,
            })
            .collect::<Vec<_>>();

        let mut buffer_index = 0;
        let mut image_index = 0;
        let mut writes = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let write = match *descriptor {
                Descriptor::Buffer {
                    binding,
                    descriptor_type,
                    ..
                } => {
                    buffer_index += 1;
                    vk::WriteDescriptorSet::default()
                        .dst_set(set)
                        .dst_binding(binding)
                        .descriptor_type(descriptor_type)
                        .buffer_info(&buffer_infos[buffer_index - 1..buffer_index])
                }
                Descriptor::Image {
                    binding,
                    descriptor_type,
                    ..
                } => {
                    image_index += 1;
                    vk::WriteDescriptorSet::default()
                        .dst_set(set)
                        .dst_binding(binding)
                        .descriptor_type(descriptor_type)
                        .image_info(&image_infos[image_index - 1..image_index])
                }
            };
            writes.push(write);
        }

        unsafe { self.device.update_descriptor_sets(&writes, &[]) };
    }

    fn create_shader_module(&self, bytecode: &[u32]) -> Result<vk::ShaderModule> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(bytecode);
        Ok(unsafe { self.device.create_shader_module(&create_info, None)? })
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.device.destroy_shader_module(module, None) };
    }

    fn create_pipeline_cache(&self, initial_data: &[u8]) -> Result<vk::PipelineCache> {
        let create_info = vk::PipelineCacheCreateInfo::default().initial_data(initial_data);
        Ok(unsafe { self.device.create_pipeline_cache(&create_info, None)? })
    }

    fn pipeline_cache_data(&self, cache: vk::PipelineCache) -> Result<Vec<u8>> {
        Ok(unsafe { self.device.get_pipeline_cache_data(cache)? })
    }

    fn destroy_pipeline_cache(&self, cache: vk::PipelineCache) {
        unsafe { self.device.destroy_pipeline_cache(cache, None) };
    }

    fn create_graphics_pipeline(
        &self,
        state: &GraphicsPipelineState,
        render_pass: &RenderPass,
        cache: vk::PipelineCache,
    ) -> Result<PipelineObject> {
        let layout = self.create_pipeline_layout(
            &state.descriptor_set_layouts,
            state.push_constant_size,
            vk::ShaderStageFlags::ALL_GRAPHICS,
        )?;

        let entry_points = state
            .shader_stages
            .iter()
            .map(|stage| entry_point(&stage.entry_point))
            .collect::<Result<Vec<_>>>()?;
        let stages = state
            .shader_stages
            .iter()
            .zip(&entry_points)
            .map(|(stage, name)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage.stage)
                    .module(stage.module)
                    .name(name)
            })
            .collect::<Vec<_>>();

        let vertex_bindings = state
            .vertex_bindings
            .iter()
            .map(|binding| vk::VertexInputBindingDescription {
                binding: binding.binding,
                stride: binding.stride,
                input_rate: binding.input_rate,
            })
            .collect::<Vec<_>>();
        let vertex_attributes = state
            .vertex_attributes
            .iter()
            .map(|attribute| vk::VertexInputAttributeDescription {
                location: attribute.location,
                binding: attribute.binding,
                format: attribute.format,
                offset: attribute.offset,
            })
            .collect::<Vec<_>>();
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attributes);
        let input_assembly_info = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(state.topology)
            .primitive_restart_enable(false);
        let viewport_info = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterizer_info = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(state.polygon_mode)
            .line_width(1.0)
            .cull_mode(state.cull_mode)
            .front_face(state.front_face)
            .depth_bias_enable(false);

        let samples = render_pass
            .description
            .attachments
            .first()
            .map_or(vk::SampleCountFlags::TYPE_1, |attachment| attachment.samples);
        let multisampling_info = vk::PipelineMultisampleStateCreateInfo::default()
            .sample_shading_enable(false)
            .rasterization_samples(samples)
            .min_sample_shading(1.0);
        let depth_stencil_info = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(state.depth_test)
            .depth_write_enable(state.depth_write)
            .depth_compare_op(state.depth_compare_op)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let color_count = render_pass
            .description
            .subpasses
            .first()
            .map_or(0, |subpass| subpass.color_refs().count());
        let blend_attachment = if state.blend_enable {
            vk::PipelineColorBlendAttachmentState::default()
                .color_write_mask(vk::ColorComponentFlags::RGBA)
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
                .alpha_blend_op(vk::BlendOp::ADD)
        } else {
            vk::PipelineColorBlendAttachmentState::default()
                .color_write_mask(vk::ColorComponentFlags::RGBA)
                .blend_enable(false)
        };
        let blend_attachments = vec![blend_attachment; color_count];
        let color_blending_info = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .logic_op(vk::LogicOp::COPY)
            .attachments(&blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_info = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly_info)
            .viewport_state(&viewport_info)
            .rasterization_state(&rasterizer_info)
            .multisample_state(&multisampling_info)
            .depth_stencil_state(&depth_stencil_info)
            .color_blend_state(&color_blending_info)
            .dynamic_state(&dynamic_info)
            .layout(layout)
            .render_pass(render_pass.handle)
            .subpass(0);

        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(cache, std::slice::from_ref(&pipeline_info), None)
        };
        match pipelines {
            Ok(pipelines) => Ok(PipelineObject {
                pipeline: pipelines[0],
                layout,
            }),
            Err((_, error)) => {
                unsafe { self.device.destroy_pipeline_layout(layout, None) };
                Err(error.into())
            }
        }
    }

    fn create_compute_pipeline(
        &self,
        state: &ComputePipelineState,
        cache: vk::PipelineCache,
    ) -> Result<PipelineObject> {
        let layout = self.create_pipeline_layout(
            &state.descriptor_set_layouts,
            state.push_constant_size,
            vk::ShaderStageFlags::COMPUTE,
        )?;
        let name = entry_point(&state.shader.entry_point)?;
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(state.shader.module)
            .name(&name);
        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout);

        let pipelines = unsafe {
            self.device
                .create_compute_pipelines(cache, std::slice::from_ref(&pipeline_info), None)
        };
        match pipelines {
            Ok(pipelines) => Ok(PipelineObject {
                pipeline: pipelines[0],
                layout,
            }),
            Err((_, error)) => {
                unsafe { self.device.destroy_pipeline_layout(layout, None) };
                Err(error.into())
            }
        }
    }

    fn destroy_pipeline(&self, pipeline: PipelineObject) {
        unsafe {
            self.device.destroy_pipeline(pipeline.pipeline, None);
            self.device.destroy_pipeline_layout(pipeline.layout, None);
        }
    }

    fn allocate_command_buffers(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let pool = lock(&self.command_pool)?;
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        Ok(unsafe { self.device.allocate_command_buffers(&allocate_info)? })
    }

    fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]) {
        if command_buffers.is_empty() {
            return;
        }
        match lock(&self.command_pool) {
            Ok(pool) => unsafe { self.device.free_command_buffers(*pool, command_buffers) },
            Err(error) => log::error!("Failed to free command buffers: {error}"),
        }
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        Ok(unsafe { self.device.create_fence(&create_info, None)? })
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool> {
        Ok(unsafe { self.device.get_fence_status(fence)? })
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<FenceStatus> {
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(FenceStatus::Signaled),
            Err(vk::Result::TIMEOUT) => Ok(FenceStatus::Timeout),
            Err(error) => Err(error.into()),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        Ok(unsafe { self.device.reset_fences(&[fence])? })
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::default();
        Ok(unsafe { self.device.create_semaphore(&create_info, None)? })
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn wait_idle(&self) -> Result<()> {
        Ok(unsafe { self.device.device_wait_idle()? })
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, one_time_submit: bool) -> Result<()> {
        let flags = if one_time_submit {
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
        } else {
            vk::CommandBufferUsageFlags::empty()
        };
        let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())?;
            self.device.begin_command_buffer(cmd, &begin_info)?;
        }
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        Ok(unsafe { self.device.end_command_buffer(cmd)? })
    }

    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        image_barriers: &[vk::ImageMemoryBarrier2<'_>],
        buffer_barriers: &[vk::BufferMemoryBarrier2<'_>],
    ) {
        let dependency_info = vk::DependencyInfo::default()
            .image_memory_barriers(image_barriers)
            .buffer_memory_barriers(buffer_barriers);
        unsafe { self.device.cmd_pipeline_barrier2(cmd, &dependency_info) };
    }

    /// Also sets the dynamic viewport and scissor to the full render area.
    fn cmd_begin_render_pass(
        &self,
        cmd: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_values: &[vk::ClearValue],
    ) {
        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(render_area)
            .clear_values(clear_values);
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as _,
            height: extent.height as _,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        unsafe {
            self.device
                .cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE);
            self.device.cmd_set_viewport(cmd, 0, &[viewport]);
            self.device.cmd_set_scissor(cmd, 0, &[render_area]);
        }
    }

    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_render_pass(cmd) };
    }

    fn cmd_bind_pipeline(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        unsafe { self.device.cmd_bind_pipeline(cmd, bind_point, pipeline) };
    }

    fn cmd_blit_image(
        &self,
        cmd: vk::CommandBuffer,
        source: &PhysicalImage,
        destination: vk::Image,
        destination_extent: vk::Extent2D,
    ) {
        let subresource = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let region = vk::ImageBlit::default()
            .src_subresource(subresource)
            .src_offsets([
                vk::Offset3D::default(),
                vk::Offset3D {
                    x: source.extent.width as i32,
                    y: source.extent.height as i32,
                    z: 1,
                },
            ])
            .dst_subresource(subresource)
            .dst_offsets([
                vk::Offset3D::default(),
                vk::Offset3D {
                    x: destination_extent.width as i32,
                    y: destination_extent.height as i32,
                    z: 1,
                },
            ]);
        unsafe {
            self.device.cmd_blit_image(
                cmd,
                source.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                destination,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
                vk::Filter::LINEAR,
            )
        };
    }

    fn submit(
        &self,
        command_buffers: &[vk::CommandBuffer],
        wait_semaphores: &[(vk::Semaphore, vk::PipelineStageFlags2)],
        signal_semaphores: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> Result<()> {
        let wait_infos = wait_semaphores
            .iter()
            .map(|(semaphore, stage)| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(*semaphore)
                    .stage_mask(*stage)
            })
            .collect::<Vec<_>>();
        let signal_infos = signal_semaphores
            .iter()
            .map(|semaphore| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(*semaphore)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            })
            .collect::<Vec<_>>();
        let command_buffer_infos = command_buffers
            .iter()
            .map(|cmd| vk::CommandBufferSubmitInfo::default().command_buffer(*cmd))
            .collect::<Vec<_>>();

        let submit_info = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&wait_infos)
            .signal_semaphore_infos(&signal_infos)
            .command_buffer_infos(&command_buffer_infos);
        unsafe {
            self.device.queue_submit2(
                self.graphics_queue,
                std::slice::from_ref(&submit_info),
                fence,
            )?
        };
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
        }

        let leaked_images = self
            .images
            .get_mut()
            .map(|images| images.drain().collect::<Vec<_>>())
            .unwrap_or_default();
        let leaked_buffers = self
            .buffers
            .get_mut()
            .map(|buffers| buffers.drain().collect::<Vec<_>>())
            .unwrap_or_default();
        if !leaked_images.is_empty() || !leaked_buffers.is_empty() {
            log::warn!(
                "Destroying {} images and {} buffers still alive at device shutdown",
                leaked_images.len(),
                leaked_buffers.len()
            );
        }
        for (image, tracked) in leaked_images {
            unsafe {
                self.device.destroy_image_view(tracked.view, None);
                self.device.destroy_image(image, None);
            }
            self.free_allocation(tracked.allocation);
        }
        for (buffer, allocation) in leaked_buffers {
            unsafe { self.device.destroy_buffer(buffer, None) };
            self.free_allocation(allocation);
        }

        self.allocator = None;

        unsafe {
            if let Ok(pool) = self.descriptor_pool.get_mut() {
                self.device.destroy_descriptor_pool(*pool, None);
            }
            if let Ok(pool) = self.command_pool.get_mut() {
                self.device.destroy_command_pool(*pool, None);
            }
            self.device.destroy_device(None);
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

