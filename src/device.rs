use crate::error::Result;
use crate::pipeline_cache::{ComputePipelineState, GraphicsPipelineState, PipelineObject};
use crate::render_pass::RenderPassDescription;
use crate::resource::ImageDescription;
use crate::resource_cache::{Descriptor, DescriptorSetLayoutBinding, RenderPass};
use ash::vk;

/// Identity of the physical device, used to validate persisted pipeline caches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalDeviceInfo {
    pub name: String,
    pub vendor_id: u32,
    pub device_id: u32,
    pub pipeline_cache_uuid: [u8; vk::UUID_SIZE],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysicalImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysicalBuffer {
    pub buffer: vk::Buffer,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysicalResource {
    Image(PhysicalImage),
    Buffer(PhysicalBuffer),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    Signaled,
    Timeout,
}

/// GPU capabilities the frame graph consumes. Implementations own every
/// allocation behind the returned handles and free them on `destroy_*`.
pub trait Device {
    fn physical_device_info(&self) -> PhysicalDeviceInfo;

    /// Raw ash device for execute callbacks that record their own commands.
    fn raw(&self) -> Option<&ash::Device> {
        None
    }

    fn set_debug_name(&self, _object_type: vk::ObjectType, _raw_handle: u64, _name: &str) {}

    fn create_image(
        &self,
        description: &ImageDescription,
        usage: vk::ImageUsageFlags,
    ) -> Result<PhysicalImage>;
    fn destroy_image(&self, image: PhysicalImage);

    fn create_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: gpu_allocator::MemoryLocation,
    ) -> Result<PhysicalBuffer>;
    fn write_buffer(&self, buffer: &PhysicalBuffer, offset: u64, data: &[u8]) -> Result<()>;
    fn destroy_buffer(&self, buffer: PhysicalBuffer);

    fn create_render_pass(&self, description: &RenderPassDescription) -> Result<vk::RenderPass>;
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        extent: vk::Extent2D,
        attachments: &[vk::ImageView],
    ) -> Result<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorSetLayoutBinding],
    ) -> Result<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn allocate_descriptor_set(&self, layout: vk::DescriptorSetLayout) -> Result<vk::DescriptorSet>;
    fn update_descriptor_set(&self, set: vk::DescriptorSet, descriptors: &[Descriptor]);

    fn create_shader_module(&self, bytecode: &[u32]) -> Result<vk::ShaderModule>;
    fn destroy_shader_module(&self, module: vk::ShaderModule);

    fn create_pipeline_cache(&self, initial_data: &[u8]) -> Result<vk::PipelineCache>;
    fn pipeline_cache_data(&self, cache: vk::PipelineCache) -> Result<Vec<u8>>;
    fn destroy_pipeline_cache(&self, cache: vk::PipelineCache);
    fn create_graphics_pipeline(
        &self,
        state: &GraphicsPipelineState,
        render_pass: &RenderPass,
        cache: vk::PipelineCache,
    ) -> Result<PipelineObject>;
    fn create_compute_pipeline(
        &self,
        state: &ComputePipelineState,
        cache: vk::PipelineCache,
    ) -> Result<PipelineObject>;
    fn destroy_pipeline(&self, pipeline: PipelineObject);

    fn allocate_command_buffers(&self, count: u32) -> Result<Vec<vk::CommandBuffer>>;
    fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]);

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool>;
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<FenceStatus>;
    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;
    fn create_semaphore(&self) -> Result<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn wait_idle(&self) -> Result<()>;

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, one_time_submit: bool) -> Result<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;
    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        image_barriers: &[vk::ImageMemoryBarrier2<'_>],
        buffer_barriers: &[vk::BufferMemoryBarrier2<'_>],
    );
    fn cmd_begin_render_pass(
        &self,
        cmd: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_values: &[vk::ClearValue],
    );
    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer);
    fn cmd_bind_pipeline(
        &self,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );
    /// Blits `source` (TRANSFER_SRC_OPTIMAL) into `destination` (TRANSFER_DST_OPTIMAL).
    fn cmd_blit_image(
        &self,
        cmd: vk::CommandBuffer,
        source: &PhysicalImage,
        destination: vk::Image,
        destination_extent: vk::Extent2D,
    );

    fn submit(
        &self,
        command_buffers: &[vk::CommandBuffer],
        wait_semaphores: &[(vk::Semaphore, vk::PipelineStageFlags2)],
        signal_semaphores: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct Frame {
    /// Ring index in `0..frames_in_flight`.
    pub current_frame: usize,
    pub image_index: u32,
    pub image: vk::Image,
    pub extent: vk::Extent2D,
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight: vk::Fence,
}

pub trait Surface {
    fn extent(&self) -> vk::Extent2D;
    fn format(&self) -> vk::Format;
    fn frames_in_flight(&self) -> usize;

    /// Waits (bounded by `timeout_ns`) for the slot's fence, then acquires
    /// the next image. A timeout or an out-of-date surface is retryable.
    fn acquire_next_frame(&mut self, device: &dyn Device, timeout_ns: u64) -> Result<Frame>;
    fn present(&mut self, frame: &Frame) -> Result<()>;

    fn needs_recreate(&self) -> bool;
    fn recreate(&mut self, device: &dyn Device, extent: vk::Extent2D) -> Result<()>;
}
