use crate::bake::{BakePlan, PhysicalDescription};
use crate::barrier::{Barrier, record_barriers};
use crate::builder::FrameGraphBuilder;
use crate::config::BakeOptions;
use crate::deletion_queue::DeletionQueue;
use crate::device::{Device, Frame, PhysicalBuffer, PhysicalImage, PhysicalResource};
use crate::error::{FrameGraphError, Result};
use crate::pipeline_cache::{PipelineCache, PipelineObject};
use crate::resource::{ClearValue, GraphId, GraphResource, RetainedBinding};
use crate::resource_cache::{RenderPass, ResourceCache};
use crate::task::{GraphTask, PassContext, TaskType};
use ash::vk;
use ash::vk::Handle;
use rustc_hash::FxHashMap;
use std::sync::Arc;

pub struct BakeContext<'a> {
    pub device: &'a Arc<dyn Device>,
    pub resource_cache: &'a mut ResourceCache,
    pub pipeline_cache: &'a mut PipelineCache,
    pub deletion_queue: &'a mut DeletionQueue,
    /// Signals once no submitted work can reference a retired graph.
    pub retire_fence: vk::Fence,
    pub frames_in_flight: usize,
    pub transient_budget_bytes: u64,
    pub options: BakeOptions,
}

struct Step {
    task_id: GraphId,
    task_type: TaskType,
    command_buffers: Vec<vk::CommandBuffer>,
    render_pass: Option<Arc<RenderPass>>,
    attachments: Vec<GraphId>,
    framebuffers: FxHashMap<Vec<vk::ImageView>, vk::Framebuffer>,
    pipeline: Option<PipelineObject>,
    clear_values: Vec<ClearValue>,
    extent: vk::Extent2D,
    barriers_before: Vec<Barrier>,
    barriers_after: Vec<Barrier>,
    present_step: bool,
}

struct Transient {
    description: PhysicalDescription,
    resource: PhysicalResource,
}

#[derive(Default)]
struct OwnedObjects {
    images: Vec<PhysicalImage>,
    buffers: Vec<PhysicalBuffer>,
    framebuffers: Vec<vk::Framebuffer>,
    command_buffers: Vec<vk::CommandBuffer>,
}

impl OwnedObjects {
    fn is_empty(&self) -> bool {
        self.images.is_empty()
            && self.buffers.is_empty()
            && self.framebuffers.is_empty()
            && self.command_buffers.is_empty()
    }

    fn destroy(self, device: &dyn Device) {
        for framebuffer in self.framebuffers {
            device.destroy_framebuffer(framebuffer);
        }
        if !self.command_buffers.is_empty() {
            device.free_command_buffers(&self.command_buffers);
        }
        for image in self.images {
            device.destroy_image(image);
        }
        for buffer in self.buffers {
            device.destroy_buffer(buffer);
        }
    }
}

/// A baked graph bound to device objects: ordered steps with their command
/// buffers, render passes, pipelines and barriers, plus the transient
/// resources it allocated. Re-executing it only re-records commands.
pub struct BakedFrameGraph {
    device: Arc<dyn Device>,
    hash: u64,
    final_resource: GraphId,
    frames_in_flight: usize,
    steps: Vec<Step>,
    transients: FxHashMap<GraphId, Transient>,
    allocated_bytes: u64,
}

impl BakedFrameGraph {
    pub(crate) fn new(
        plan: &BakePlan,
        tasks: &[GraphTask],
        ctx: &mut BakeContext,
        mut old: Option<BakedFrameGraph>,
    ) -> Result<Self> {
        let frames_in_flight = ctx.frames_in_flight.max(1);

        let same_shape = old
            .as_ref()
            .is_some_and(|old| old.hash == plan.hash && old.frames_in_flight == frames_in_flight);
        let mut recycled = old
            .as_mut()
            .map(|old| old.transients.drain().collect::<Vec<_>>())
            .unwrap_or_default();
        let mut old_steps = match old.as_mut() {
            Some(old) if same_shape => std::mem::take(&mut old.steps),
            _ => Vec::new(),
        };

        let mut graph = Self {
            device: Arc::clone(ctx.device),
            hash: plan.hash,
            final_resource: plan.final_resource,
            frames_in_flight,
            steps: Vec::with_capacity(plan.steps.len()),
            transients: FxHashMap::default(),
            allocated_bytes: 0,
        };
        let populated = graph.populate(plan, tasks, ctx, &mut recycled, &mut old_steps);

        // whatever `old` did not hand over may still be in flight
        let mut leftovers = OwnedObjects::default();
        for (_, transient) in recycled {
            match transient.resource {
                PhysicalResource::Image(image) => leftovers.images.push(image),
                PhysicalResource::Buffer(buffer) => leftovers.buffers.push(buffer),
            }
        }
        if !leftovers.is_empty() {
            ctx.deletion_queue
                .push(ctx.retire_fence, move |device| leftovers.destroy(device));
        }
        if let Some(mut old) = old {
            old.steps.append(&mut old_steps);
            old.retire(ctx.deletion_queue, ctx.retire_fence);
        }

        match populated {
            Ok(reused) => {
                if ctx.options.log_aliasing_report {
                    plan.log_aliasing_report();
                }
                log::debug!(
                    "Created frame graph {:#018x}: {} steps, {} transients ({} reused), {} KiB",
                    graph.hash,
                    graph.steps.len(),
                    graph.transients.len(),
                    reused,
                    graph.allocated_bytes / 1024
                );
                Ok(graph)
            }
            Err(error) => {
                graph.retire(ctx.deletion_queue, ctx.retire_fence);
                Err(error)
            }
        }
    }

    /// Binds transients and builds steps. Returns how many transients were
    /// taken over from the previous graph.
    fn populate(
        &mut self,
        plan: &BakePlan,
        tasks: &[GraphTask],
        ctx: &mut BakeContext,
        recycled: &mut Vec<(GraphId, Transient)>,
        old_steps: &mut [Step],
    ) -> Result<usize> {
        let mut reused = 0usize;
        for info in plan.physical.iter().filter(|info| !info.retained) {
            // the same logical resource first, so it keeps its old image
            let position = recycled
                .iter()
                .position(|(id, transient)| {
                    *id == info.resource && transient.description == info.description
                })
                .or_else(|| {
                    recycled
                        .iter()
                        .position(|(_, transient)| transient.description == info.description)
                });

            let transient = match position {
                Some(position) => {
                    reused += 1;
                    recycled.swap_remove(position).1
                }
                None => self.allocate_transient(info.description, &info.name, ctx)?,
            };
            self.allocated_bytes += estimate_size(&transient.description);
            self.transients.insert(info.resource, transient);
        }

        for (index, planned) in plan.steps.iter().enumerate() {
            let task = &tasks[planned.task_id.index()];

            let render_pass = match &planned.render_pass {
                Some(description) => Some(ctx.resource_cache.request_render_pass(description)?),
                None => None,
            };
            let pipeline = match (task.pipeline_state(), render_pass.as_ref()) {
                (Some(state), Some(render_pass)) => {
                    Some(ctx.pipeline_cache.get_graphics_pipeline(state, render_pass)?)
                }
                _ => None,
            };

            let recycled_step = old_steps
                .get_mut(index)
                .filter(|step| step.task_id == planned.task_id);
            let (command_buffers, framebuffers) = match recycled_step {
                Some(step) => (
                    std::mem::take(&mut step.command_buffers),
                    std::mem::take(&mut step.framebuffers),
                ),
                None => (
                    self.device
                        .allocate_command_buffers(self.frames_in_flight as u32)?,
                    FxHashMap::default(),
                ),
            };

            if ctx.options.debug_names {
                for cmd in &command_buffers {
                    self.device.set_debug_name(
                        vk::ObjectType::COMMAND_BUFFER,
                        cmd.as_raw(),
                        task.name(),
                    );
                }
            }

            self.steps.push(Step {
                task_id: planned.task_id,
                task_type: planned.task_type,
                command_buffers,
                render_pass,
                attachments: planned.attachments.clone(),
                framebuffers,
                pipeline,
                clear_values: planned.clear_values.clone(),
                extent: planned.extent,
                barriers_before: planned.barriers_before.clone(),
                barriers_after: planned.barriers_after.clone(),
                present_step: planned.present_step,
            });
        }

        Ok(reused)
    }

    fn allocate_transient(
        &mut self,
        description: PhysicalDescription,
        name: &str,
        ctx: &BakeContext,
    ) -> Result<Transient> {
        let requested = estimate_size(&description);
        let budget = ctx.transient_budget_bytes;
        if budget > 0 && self.allocated_bytes + requested > budget {
            return Err(FrameGraphError::BudgetExceeded {
                current: self.allocated_bytes / 1_000_000,
                requested: requested / 1_000_000,
                budget: budget / 1_000_000,
            });
        }

        let resource = match description {
            PhysicalDescription::Image { description, usage } => {
                let image = self.device.create_image(&description, usage)?;
                if ctx.options.debug_names {
                    self.device
                        .set_debug_name(vk::ObjectType::IMAGE, image.image.as_raw(), name);
                }
                PhysicalResource::Image(image)
            }
            PhysicalDescription::Buffer { description, usage } => {
                let buffer = self.device.create_buffer(
                    description.size,
                    usage,
                    gpu_allocator::MemoryLocation::GpuOnly,
                )?;
                if ctx.options.debug_names {
                    self.device
                        .set_debug_name(vk::ObjectType::BUFFER, buffer.buffer.as_raw(), name);
                }
                PhysicalResource::Buffer(buffer)
            }
        };

        Ok(Transient {
            description,
            resource,
        })
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn final_resource(&self) -> GraphId {
        self.final_resource
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn step_task_ids(&self) -> Vec<GraphId> {
        self.steps.iter().map(|step| step.task_id).collect()
    }

    pub fn present_task(&self) -> Option<GraphId> {
        self.steps
            .iter()
            .find(|step| step.present_step)
            .map(|step| step.task_id)
    }

    pub fn transient_count(&self) -> usize {
        self.transients.len()
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes
    }

    pub fn transient_resource(&self, id: GraphId) -> Option<PhysicalResource> {
        self.transients.get(&id).map(|transient| transient.resource)
    }

    fn physical_resources(
        &self,
        resources: &[GraphResource],
    ) -> FxHashMap<GraphId, PhysicalResource> {
        let mut physical = self
            .transients
            .iter()
            .map(|(id, transient)| (*id, transient.resource))
            .collect::<FxHashMap<_, _>>();

        for resource in resources {
            match resource.retained_binding() {
                Some(RetainedBinding::Image { image, .. }) => {
                    physical.insert(resource.id(), PhysicalResource::Image(*image));
                }
                Some(RetainedBinding::Buffer { buffer }) => {
                    physical.insert(resource.id(), PhysicalResource::Buffer(*buffer));
                }
                None => {}
            }
        }

        physical
    }

    /// Records every step into its command buffer for `frame` and submits
    /// them in one batch that waits on the frame's acquire semaphore and
    /// signals its render semaphore and fence.
    pub fn execute(&mut self, builder: &mut FrameGraphBuilder, frame: &Frame) -> Result<()> {
        match builder.plan() {
            Some(plan) if plan.hash == self.hash => {}
            _ => {
                return Err(FrameGraphError::InvalidGraphState(
                    "baked frame graph does not match the builder's current bake".to_string(),
                ));
            }
        }

        let frame_index = frame.current_frame % self.frames_in_flight;
        let physical = self.physical_resources(builder.resources());
        let device = self.device.as_ref();
        let final_resource = self.final_resource;
        let mut submitted = Vec::with_capacity(self.steps.len());

        for step in &mut self.steps {
            let cmd = step.command_buffers[frame_index];
            device.begin_command_buffer(cmd, true)?;
            record_barriers(device, cmd, &step.barriers_before, &physical);

            let mut ctx = PassContext::new(cmd, device, &physical, step.extent, frame_index);

            if let Some(render_pass) = &step.render_pass {
                let views = step
                    .attachments
                    .iter()
                    .map(|id| match physical.get(id) {
                        Some(PhysicalResource::Image(image)) => Ok(image.view),
                        _ => Err(FrameGraphError::InvalidResourceId {
                            id: *id,
                            reason: "attachment has no physical image".to_string(),
                        }),
                    })
                    .collect::<Result<Vec<_>>>()?;

                let framebuffer = match step.framebuffers.get(&views) {
                    Some(framebuffer) => *framebuffer,
                    None => {
                        let framebuffer =
                            device.create_framebuffer(render_pass.handle, step.extent, &views)?;
                        step.framebuffers.insert(views, framebuffer);
                        framebuffer
                    }
                };

                let clear_values = step
                    .clear_values
                    .iter()
                    .map(|value| value.to_vk())
                    .collect::<Vec<_>>();
                device.cmd_begin_render_pass(
                    cmd,
                    render_pass.handle,
                    framebuffer,
                    step.extent,
                    &clear_values,
                );

                ctx.render_pass = Some(render_pass.handle);
                ctx.framebuffer = Some(framebuffer);
            }

            if let (Some(pipeline), Some(bind_point)) = (step.pipeline, step.task_type.bind_point()) {
                device.cmd_bind_pipeline(cmd, bind_point, pipeline.pipeline);
                ctx.pipeline = Some(pipeline);
            }

            let task = builder
                .task_mut(step.task_id)
                .ok_or_else(|| FrameGraphError::InvalidTaskId {
                    id: step.task_id,
                    reason: "task vanished from the builder".to_string(),
                })?;
            task.run(&mut ctx)?;

            if step.render_pass.is_some() {
                device.cmd_end_render_pass(cmd);
            }
            record_barriers(device, cmd, &step.barriers_after, &physical);

            if step.present_step {
                if let Some(PhysicalResource::Image(source)) =
                    self.transients.get(&final_resource).map(|transient| transient.resource)
                {
                    blit_to_swapchain(device, cmd, &source, frame);
                }
            }

            device.end_command_buffer(cmd)?;
            submitted.push(cmd);
        }

        device.submit(
            &submitted,
            &[(
                frame.image_available,
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags2::BLIT,
            )],
            &[frame.render_finished],
            frame.in_flight,
        )
    }

    fn take_owned(&mut self) -> OwnedObjects {
        let mut owned = OwnedObjects::default();

        for step in &mut self.steps {
            owned.command_buffers.append(&mut step.command_buffers);
            owned
                .framebuffers
                .extend(step.framebuffers.drain().map(|(_, framebuffer)| framebuffer));
        }
        self.steps.clear();

        for (_, transient) in self.transients.drain() {
            match transient.resource {
                PhysicalResource::Image(image) => owned.images.push(image),
                PhysicalResource::Buffer(buffer) => owned.buffers.push(buffer),
            }
        }

        owned
    }

    /// Hands every object this graph owns to `queue`, to be destroyed once
    /// `fence` signals.
    pub fn retire(mut self, queue: &mut DeletionQueue, fence: vk::Fence) {
        let owned = self.take_owned();
        if !owned.is_empty() {
            queue.push(fence, move |device| owned.destroy(device));
        }
    }
}

impl Drop for BakedFrameGraph {
    fn drop(&mut self) {
        let owned = self.take_owned();
        owned.destroy(self.device.as_ref());
    }
}

fn swapchain_barrier(
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src: (vk::PipelineStageFlags2, vk::AccessFlags2),
    dst: (vk::PipelineStageFlags2, vk::AccessFlags2),
) -> vk::ImageMemoryBarrier2<'static> {
    vk::ImageMemoryBarrier2::default()
        .image(image)
        .src_stage_mask(src.0)
        .src_access_mask(src.1)
        .dst_stage_mask(dst.0)
        .dst_access_mask(dst.1)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        })
}

/// Copies a transient backbuffer (already in TRANSFER_SRC_OPTIMAL) into the
/// acquired swapchain image and leaves the latter ready to present.
fn blit_to_swapchain(device: &dyn Device, cmd: vk::CommandBuffer, source: &PhysicalImage, frame: &Frame) {
    if frame.image == vk::Image::null() {
        return;
    }

    device.cmd_pipeline_barrier(
        cmd,
        &[swapchain_barrier(
            frame.image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            (vk::PipelineStageFlags2::BLIT, vk::AccessFlags2::NONE),
            (vk::PipelineStageFlags2::BLIT, vk::AccessFlags2::TRANSFER_WRITE),
        )],
        &[],
    );
    device.cmd_blit_image(cmd, source, frame.image, frame.extent);
    device.cmd_pipeline_barrier(
        cmd,
        &[swapchain_barrier(
            frame.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
            (vk::PipelineStageFlags2::BLIT, vk::AccessFlags2::TRANSFER_WRITE),
            (vk::PipelineStageFlags2::BOTTOM_OF_PIPE, vk::AccessFlags2::NONE),
        )],
        &[],
    );
}

fn estimate_size(description: &PhysicalDescription) -> u64 {
    match description {
        PhysicalDescription::Image { description, .. } => {
            let bytes_per_pixel = match description.format {
                vk::Format::R16G16B16A16_SFLOAT | vk::Format::D32_SFLOAT_S8_UINT => 8,
                vk::Format::R32G32B32A32_SFLOAT => 16,
                vk::Format::R8_UNORM => 1,
                _ => 4,
            };
            description.extent.width as u64
                * description.extent.height as u64
                * description.extent.depth as u64
                * description.layers as u64
                * description.samples.as_raw() as u64
                * bytes_per_pixel
        }
        PhysicalDescription::Buffer { description, .. } => description.size,
    }
}
