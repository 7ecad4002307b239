use crate::device::{
    Device, FenceStatus, Frame, PhysicalBuffer, PhysicalDeviceInfo, PhysicalImage, Surface,
};
use crate::error::{FrameGraphError, Result};
use crate::pipeline_cache::{ComputePipelineState, GraphicsPipelineState, PipelineObject};
use crate::render_pass::RenderPassDescription;
use crate::resource::ImageDescription;
use crate::resource_cache::{Descriptor, DescriptorSetLayoutBinding, RenderPass};
use ash::vk;
use ash::vk::Handle;
use rustc_hash::FxHashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockCounters {
    pub images_created: usize,
    pub images_destroyed: usize,
    pub buffers_created: usize,
    pub buffers_destroyed: usize,
    pub render_passes_created: usize,
    pub render_passes_destroyed: usize,
    pub framebuffers_created: usize,
    pub framebuffers_destroyed: usize,
    pub descriptor_set_layouts_created: usize,
    pub descriptor_sets_allocated: usize,
    pub descriptor_set_updates: usize,
    pub shader_modules_created: usize,
    pub shader_modules_destroyed: usize,
    pub pipeline_caches_destroyed: usize,
    pub pipelines_created: usize,
    pub pipelines_destroyed: usize,
    pub command_buffers_allocated: usize,
    pub command_buffers_freed: usize,
    pub fences_destroyed: usize,
    pub semaphores_destroyed: usize,
    pub submits: usize,
    pub wait_idle: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCommand {
    Begin(vk::CommandBuffer),
    End(vk::CommandBuffer),
    Barrier {
        cmd: vk::CommandBuffer,
        layouts: Vec<(vk::ImageLayout, vk::ImageLayout)>,
        buffers: usize,
    },
    BeginRenderPass {
        cmd: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        clear_values: usize,
    },
    EndRenderPass(vk::CommandBuffer),
    BindPipeline(vk::CommandBuffer, vk::Pipeline),
    Blit {
        cmd: vk::CommandBuffer,
        source: vk::Image,
        destination: vk::Image,
    },
    Submit {
        command_buffers: Vec<vk::CommandBuffer>,
        waits: usize,
        signals: usize,
        fence: vk::Fence,
    },
}

#[derive(Default)]
struct MockState {
    counters: MockCounters,
    commands: Vec<MockCommand>,
    fences: FxHashMap<vk::Fence, bool>,
    pipeline_cache_data: Vec<u8>,
    hang_submissions: bool,
    fail_buffer_writes: bool,
}

/// In-memory stand-in for a GPU. Handles are unique non-null integers,
/// submissions signal their fence immediately unless told to hang.
pub struct MockDevice {
    info: PhysicalDeviceInfo,
    next_handle: AtomicU64,
    state: Mutex<MockState>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::with_info(PhysicalDeviceInfo {
            name: "Mock GPU".to_string(),
            vendor_id: 0x10DE,
            device_id: 0x2684,
            pipeline_cache_uuid: [7; vk::UUID_SIZE],
        })
    }

    pub fn with_info(info: PhysicalDeviceInfo) -> Self {
        Self {
            info,
            next_handle: AtomicU64::new(1),
            state: Mutex::new(MockState {
                pipeline_cache_data: b"mock pipeline cache".to_vec(),
                ..Default::default()
            }),
        }
    }

    fn handle<H: Handle>(&self) -> H {
        H::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn counters(&self) -> MockCounters {
        self.with_state(|state| state.counters.clone())
    }

    pub fn commands(&self) -> Vec<MockCommand> {
        self.with_state(|state| state.commands.clone())
    }

    pub fn clear_commands(&self) {
        self.with_state(|state| state.commands.clear());
    }

    pub fn signal_fence(&self, fence: vk::Fence) {
        self.with_state(|state| {
            state.fences.insert(fence, true);
        });
    }

    /// Submissions stop signaling their fences.
    pub fn hang_submissions(&self, hang: bool) {
        self.with_state(|state| state.hang_submissions = hang);
    }

    pub fn fail_buffer_writes(&self, fail: bool) {
        self.with_state(|state| state.fail_buffer_writes = fail);
    }

    fn record(&self, command: MockCommand) {
        self.with_state(|state| state.commands.push(command));
    }
}

impl Device for MockDevice {
    fn physical_device_info(&self) -> PhysicalDeviceInfo {
        self.info.clone()
    }

    fn create_image(
        &self,
        description: &ImageDescription,
        _usage: vk::ImageUsageFlags,
    ) -> Result<PhysicalImage> {
        self.with_state(|state| state.counters.images_created += 1);
        Ok(PhysicalImage {
            image: self.handle(),
            view: self.handle(),
            format: description.format,
            extent: description.extent,
        })
    }

    fn destroy_image(&self, _image: PhysicalImage) {
        self.with_state(|state| state.counters.images_destroyed += 1);
    }

    fn create_buffer(
        &self,
        size: u64,
        _usage: vk::BufferUsageFlags,
        _location: gpu_allocator::MemoryLocation,
    ) -> Result<PhysicalBuffer> {
        self.with_state(|state| state.counters.buffers_created += 1);
        Ok(PhysicalBuffer {
            buffer: self.handle(),
            size,
        })
    }

    fn write_buffer(&self, buffer: &PhysicalBuffer, offset: u64, data: &[u8]) -> Result<()> {
        if self.with_state(|state| state.fail_buffer_writes) {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED.into());
        }
        if offset + data.len() as u64 > buffer.size {
            return Err(FrameGraphError::Other(format!(
                "write of {} bytes at {offset} overflows buffer of {}",
                data.len(),
                buffer.size
            )));
        }
        Ok(())
    }

    fn destroy_buffer(&self, _buffer: PhysicalBuffer) {
        self.with_state(|state| state.counters.buffers_destroyed += 1);
    }

    fn create_render_pass(&self, _description: &RenderPassDescription) -> Result<vk::RenderPass> {
        self.with_state(|state| state.counters.render_passes_created += 1);
        Ok(self.handle())
    }

    fn destroy_render_pass(&self, _render_pass: vk::RenderPass) {
        self.with_state(|state| state.counters.render_passes_destroyed += 1);
    }

    fn create_framebuffer(
        &self,
        _render_pass: vk::RenderPass,
        _extent: vk::Extent2D,
        _attachments: &[vk::ImageView],
    ) -> Result<vk::Framebuffer> {
        self.with_state(|state| state.counters.framebuffers_created += 1);
        Ok(self.handle())
    }

    fn destroy_framebuffer(&self, _framebuffer: vk::Framebuffer) {
        self.with_state(|state| state.counters.framebuffers_destroyed += 1);
    }

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[DescriptorSetLayoutBinding],
    ) -> Result<vk::DescriptorSetLayout> {
        self.with_state(|state| state.counters.descriptor_set_layouts_created += 1);
        Ok(self.handle())
    }

    fn destroy_descriptor_set_layout(&self, _layout: vk::DescriptorSetLayout) {}

    fn allocate_descriptor_set(&self, _layout: vk::DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        self.with_state(|state| state.counters.descriptor_sets_allocated += 1);
        Ok(self.handle())
    }

    fn update_descriptor_set(&self, _set: vk::DescriptorSet, _descriptors: &[Descriptor]) {
        self.with_state(|state| state.counters.descriptor_set_updates += 1);
    }

    fn create_shader_module(&self, _bytecode: &[u32]) -> Result<vk::ShaderModule> {
        self.with_state(|state| state.counters.shader_modules_created += 1);
        Ok(self.handle())
    }

    fn destroy_shader_module(&self, _module: vk::ShaderModule) {
        self.with_state(|state| state.counters.shader_modules_destroyed += 1);
    }

    fn create_pipeline_cache(&self, initial_data: &[u8]) -> Result<vk::PipelineCache> {
        if !initial_data.is_empty() {
            self.with_state(|state| state.pipeline_cache_data = initial_data.to_vec());
        }
        Ok(self.handle())
    }

    fn pipeline_cache_data(&self, _cache: vk::PipelineCache) -> Result<Vec<u8>> {
        Ok(self.with_state(|state| state.pipeline_cache_data.clone()))
    }

    fn destroy_pipeline_cache(&self, _cache: vk::PipelineCache) {
        self.with_state(|state| state.counters.pipeline_caches_destroyed += 1);
    }

    fn create_graphics_pipeline(
        &self,
        _state: &GraphicsPipelineState,
        _render_pass: &RenderPass,
        _cache: vk::PipelineCache,
    ) -> Result<PipelineObject> {
        self.with_state(|state| state.counters.pipelines_created += 1);
        Ok(PipelineObject {
            pipeline: self.handle(),
            layout: self.handle(),
        })
    }

    fn create_compute_pipeline(
        &self,
        _state: &ComputePipelineState,
        _cache: vk::PipelineCache,
    ) -> Result<PipelineObject> {
        self.with_state(|state| state.counters.pipelines_created += 1);
        Ok(PipelineObject {
            pipeline: self.handle(),
            layout: self.handle(),
        })
    }

    fn destroy_pipeline(&self, _pipeline: PipelineObject) {
        self.with_state(|state| state.counters.pipelines_destroyed += 1);
    }

    fn allocate_command_buffers(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        self.with_state(|state| state.counters.command_buffers_allocated += count as usize);
        Ok((0..count).map(|_| self.handle()).collect())
    }

    fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]) {
        self.with_state(|state| state.counters.command_buffers_freed += command_buffers.len());
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let fence = self.handle();
        self.with_state(|state| {
            state.fences.insert(fence, signaled);
        });
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.with_state(|state| {
            state.fences.remove(&fence);
            state.counters.fences_destroyed += 1;
        });
    }

    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool> {
        self.with_state(|state| {
            state
                .fences
                .get(&fence)
                .copied()
                .ok_or(FrameGraphError::VulkanError(vk::Result::ERROR_UNKNOWN))
        })
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> Result<FenceStatus> {
        if self.fence_signaled(fence)? {
            Ok(FenceStatus::Signaled)
        } else {
            Ok(FenceStatus::Timeout)
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        self.with_state(|state| {
            state.fences.insert(fence, false);
        });
        Ok(())
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        Ok(self.handle())
    }

    fn destroy_semaphore(&self, _semaphore: vk::Semaphore) {
        self.with_state(|state| state.counters.semaphores_destroyed += 1);
    }

    fn wait_idle(&self) -> Result<()> {
        self.with_state(|state| {
            state.counters.wait_idle += 1;
            if !state.hang_submissions {
                state.fences.values_mut().for_each(|signaled| *signaled = true);
            }
        });
        Ok(())
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, _one_time_submit: bool) -> Result<()> {
        self.record(MockCommand::Begin(cmd));
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        self.record(MockCommand::End(cmd));
        Ok(())
    }

    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        image_barriers: &[vk::ImageMemoryBarrier2<'_>],
        buffer_barriers: &[vk::BufferMemoryBarrier2<'_>],
    ) {
        self.record(MockCommand::Barrier {
            cmd,
            layouts: image_barriers
                .iter()
                .map(|barrier| (barrier.old_layout, barrier.new_layout))
                .collect(),
            buffers: buffer_barriers.len(),
        });
    }

    fn cmd_begin_render_pass(
        &self,
        cmd: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        _extent: vk::Extent2D,
        clear_values: &[vk::ClearValue],
    ) {
        self.record(MockCommand::BeginRenderPass {
            cmd,
            render_pass,
            framebuffer,
            clear_values: clear_values.len(),
        });
    }

    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer) {
        self.record(MockCommand::EndRenderPass(cmd));
    }

    fn cmd_bind_pipeline(
        &self,
        cmd: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        self.record(MockCommand::BindPipeline(cmd, pipeline));
    }

    fn cmd_blit_image(
        &self,
        cmd: vk::CommandBuffer,
        source: &PhysicalImage,
        destination: vk::Image,
        _destination_extent: vk::Extent2D,
    ) {
        self.record(MockCommand::Blit {
            cmd,
            source: source.image,
            destination,
        });
    }

    fn submit(
        &self,
        command_buffers: &[vk::CommandBuffer],
        wait_semaphores: &[(vk::Semaphore, vk::PipelineStageFlags2)],
        signal_semaphores: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> Result<()> {
        self.with_state(|state| {
            state.counters.submits += 1;
            state.commands.push(MockCommand::Submit {
                command_buffers: command_buffers.to_vec(),
                waits: wait_semaphores.len(),
                signals: signal_semaphores.len(),
                fence,
            });
            if fence != vk::Fence::null() && !state.hang_submissions {
                state.fences.insert(fence, true);
            }
        });
        Ok(())
    }
}

struct MockFrameSync {
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
    in_flight: vk::Fence,
}

pub struct MockSurface {
    extent: vk::Extent2D,
    format: vk::Format,
    images: Vec<vk::Image>,
    sync: Vec<MockFrameSync>,
    current_frame: usize,
    next_image: u32,
    pub out_of_date: bool,
    pub presents: usize,
    pub recreations: usize,
}

impl MockSurface {
    pub fn new(device: &dyn Device, extent: vk::Extent2D, frames_in_flight: usize) -> Result<Self> {
        let mut sync = Vec::with_capacity(frames_in_flight);
        for _ in 0..frames_in_flight {
            sync.push(MockFrameSync {
                image_available: device.create_semaphore()?,
                render_finished: device.create_semaphore()?,
                in_flight: device.create_fence(true)?,
            });
        }

        Ok(Self {
            extent,
            format: vk::Format::B8G8R8A8_UNORM,
            images: (1..=3).map(|raw| vk::Image::from_raw(0xFFFF_0000 + raw)).collect(),
            sync,
            current_frame: 0,
            next_image: 0,
            out_of_date: false,
            presents: 0,
            recreations: 0,
        })
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }
}

impl Surface for MockSurface {
    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn format(&self) -> vk::Format {
        self.format
    }

    fn frames_in_flight(&self) -> usize {
        self.sync.len()
    }

    fn acquire_next_frame(&mut self, device: &dyn Device, timeout_ns: u64) -> Result<Frame> {
        let sync = &self.sync[self.current_frame];
        if device.wait_for_fence(sync.in_flight, timeout_ns)? == FenceStatus::Timeout {
            return Err(FrameGraphError::FenceTimeout { timeout_ns });
        }
        if self.out_of_date {
            return Err(FrameGraphError::SurfaceOutOfDate);
        }
        device.reset_fence(sync.in_flight)?;

        let image_index = self.next_image;
        self.next_image = (self.next_image + 1) % self.images.len() as u32;

        Ok(Frame {
            current_frame: self.current_frame,
            image_index,
            image: self.images[image_index as usize],
            extent: self.extent,
            image_available: sync.image_available,
            render_finished: sync.render_finished,
            in_flight: sync.in_flight,
        })
    }

    fn present(&mut self, frame: &Frame) -> Result<()> {
        self.presents += 1;
        self.current_frame = (frame.current_frame + 1) % self.sync.len();
        Ok(())
    }

    fn needs_recreate(&self) -> bool {
        self.out_of_date
    }

    fn recreate(&mut self, _device: &dyn Device, extent: vk::Extent2D) -> Result<()> {
        self.extent = extent;
        self.out_of_date = false;
        self.recreations += 1;
        Ok(())
    }
}
