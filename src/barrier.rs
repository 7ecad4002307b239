use crate::device::{Device, PhysicalResource};
use crate::resource::GraphId;
use crate::task::TaskType;
use ash::vk;
use rustc_hash::FxHashMap;

/// Layout, access and stages one task needs a resource in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceState {
    pub layout: vk::ImageLayout,
    pub access_mask: vk::AccessFlags2,
    pub stage_mask: vk::PipelineStageFlags2,
}

const WRITE_ACCESS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
    vk::AccessFlags2::SHADER_WRITE.as_raw()
        | vk::AccessFlags2::SHADER_STORAGE_WRITE.as_raw()
        | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags2::TRANSFER_WRITE.as_raw()
        | vk::AccessFlags2::HOST_WRITE.as_raw()
        | vk::AccessFlags2::MEMORY_WRITE.as_raw(),
);

impl ResourceState {
    pub fn new(
        layout: vk::ImageLayout,
        access_mask: vk::AccessFlags2,
        stage_mask: vk::PipelineStageFlags2,
    ) -> Self {
        Self {
            layout,
            access_mask,
            stage_mask,
        }
    }

    pub fn is_write(&self) -> bool {
        self.access_mask.intersects(WRITE_ACCESS)
    }

    pub fn for_image(task_type: TaskType, access: Access, depth: bool) -> Self {
        match (task_type, access) {
            (TaskType::Graphics, Access::Attachment) if depth => Self::new(
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
                vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
            ),
            (TaskType::Graphics, Access::Attachment) => Self::new(
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            ),
            (TaskType::Graphics, _) => Self::new(
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::AccessFlags2::SHADER_SAMPLED_READ,
                vk::PipelineStageFlags2::FRAGMENT_SHADER,
            ),
            (TaskType::Compute, Access::Read) => Self::new(
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::AccessFlags2::SHADER_SAMPLED_READ,
                vk::PipelineStageFlags2::COMPUTE_SHADER,
            ),
            (TaskType::Compute, _) => Self::new(
                vk::ImageLayout::GENERAL,
                vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE,
                vk::PipelineStageFlags2::COMPUTE_SHADER,
            ),
            (TaskType::Transfer, Access::Read) => Self::new(
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::AccessFlags2::TRANSFER_READ,
                vk::PipelineStageFlags2::ALL_TRANSFER,
            ),
            (TaskType::Transfer, _) => Self::new(
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::AccessFlags2::TRANSFER_WRITE,
                vk::PipelineStageFlags2::ALL_TRANSFER,
            ),
        }
    }

    pub fn for_buffer(task_type: TaskType, access: Access) -> Self {
        let stage_mask = match task_type {
            TaskType::Graphics => {
                vk::PipelineStageFlags2::VERTEX_SHADER | vk::PipelineStageFlags2::FRAGMENT_SHADER
            }
            TaskType::Compute => vk::PipelineStageFlags2::COMPUTE_SHADER,
            TaskType::Transfer => vk::PipelineStageFlags2::ALL_TRANSFER,
        };
        let access_mask = match (task_type, access) {
            (TaskType::Transfer, Access::Read) => vk::AccessFlags2::TRANSFER_READ,
            (TaskType::Transfer, _) => vk::AccessFlags2::TRANSFER_WRITE,
            (_, Access::Read) => vk::AccessFlags2::SHADER_STORAGE_READ,
            _ => vk::AccessFlags2::SHADER_STORAGE_WRITE,
        };
        Self::new(vk::ImageLayout::UNDEFINED, access_mask, stage_mask)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    /// Created or written as a render pass attachment.
    Attachment,
}

/// Synchronization history of one resource along the step timeline: the
/// last write, and every stage that has been made to wait on it since.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceTrack {
    pub layout: vk::ImageLayout,
    write_stage: vk::PipelineStageFlags2,
    write_access: vk::AccessFlags2,
    read_stages: vk::PipelineStageFlags2,
    read_access: vk::AccessFlags2,
}

/// One execution and memory dependency, before it is bound to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependency {
    pub src_stage: vk::PipelineStageFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_access: vk::AccessFlags2,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
}

impl ResourceTrack {
    pub fn new(layout: vk::ImageLayout) -> Self {
        Self {
            layout,
            write_stage: vk::PipelineStageFlags2::NONE,
            write_access: vk::AccessFlags2::NONE,
            read_stages: vk::PipelineStageFlags2::NONE,
            read_access: vk::AccessFlags2::NONE,
        }
    }

    fn is_untouched(&self) -> bool {
        self.write_stage == vk::PipelineStageFlags2::NONE
            && self.read_stages == vk::PipelineStageFlags2::NONE
    }

    pub fn needs_barrier(&self, required: &ResourceState) -> bool {
        if self.layout != required.layout {
            return true;
        }
        if required.is_write() {
            return !self.is_untouched();
        }

        // a read only waits if it has not yet been ordered after the last write
        self.write_stage != vk::PipelineStageFlags2::NONE
            && !(self.read_stages.contains(required.stage_mask)
                && self.read_access.contains(required.access_mask))
    }

    /// Dependency from everything recorded so far to `required`. The source
    /// covers the last write and every reader since, so the chain reaches
    /// earlier layout transitions too.
    pub fn dependency(&self, required: &ResourceState) -> Dependency {
        let src_stage = self.write_stage | self.read_stages;
        Dependency {
            src_stage: if src_stage == vk::PipelineStageFlags2::NONE {
                vk::PipelineStageFlags2::TOP_OF_PIPE
            } else {
                src_stage
            },
            dst_stage: required.stage_mask,
            src_access: self.write_access & WRITE_ACCESS,
            dst_access: required.access_mask,
            old_layout: self.layout,
            new_layout: required.layout,
        }
    }

    /// Records that `required` happened after whatever barrier it needed.
    pub fn record(&mut self, required: &ResourceState) {
        if required.is_write() {
            self.write_stage = required.stage_mask;
            self.write_access = required.access_mask;
            self.read_stages = vk::PipelineStageFlags2::NONE;
            self.read_access = vk::AccessFlags2::NONE;
        } else if self.layout != required.layout {
            // the transition is ordered before this reader only, and later
            // readers have to chain on it like on a write
            if self.write_stage == vk::PipelineStageFlags2::NONE {
                self.write_stage = required.stage_mask;
            }
            self.read_stages = required.stage_mask;
            self.read_access = required.access_mask;
        } else {
            self.read_stages |= required.stage_mask;
            self.read_access |= required.access_mask;
        }
        self.layout = required.layout;
    }

    pub fn transition(&mut self, required: &ResourceState) -> Option<Dependency> {
        let dependency = self
            .needs_barrier(required)
            .then(|| self.dependency(required));
        self.record(required);
        dependency
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Barrier {
    Image {
        resource: GraphId,
        src_stage: vk::PipelineStageFlags2,
        dst_stage: vk::PipelineStageFlags2,
        src_access: vk::AccessFlags2,
        dst_access: vk::AccessFlags2,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        aspect_mask: vk::ImageAspectFlags,
    },
    Buffer {
        resource: GraphId,
        src_stage: vk::PipelineStageFlags2,
        dst_stage: vk::PipelineStageFlags2,
        src_access: vk::AccessFlags2,
        dst_access: vk::AccessFlags2,
    },
}

impl Barrier {
    pub fn image(resource: GraphId, dependency: Dependency, aspect_mask: vk::ImageAspectFlags) -> Self {
        Barrier::Image {
            resource,
            src_stage: dependency.src_stage,
            dst_stage: dependency.dst_stage,
            src_access: dependency.src_access,
            dst_access: dependency.dst_access,
            old_layout: dependency.old_layout,
            new_layout: dependency.new_layout,
            aspect_mask,
        }
    }

    pub fn buffer(resource: GraphId, dependency: Dependency) -> Self {
        Barrier::Buffer {
            resource,
            src_stage: dependency.src_stage,
            dst_stage: dependency.dst_stage,
            src_access: dependency.src_access,
            dst_access: dependency.dst_access,
        }
    }

    pub fn resource(&self) -> GraphId {
        match self {
            Barrier::Image { resource, .. } | Barrier::Buffer { resource, .. } => *resource,
        }
    }

    pub fn new_layout(&self) -> Option<vk::ImageLayout> {
        match self {
            Barrier::Image { new_layout, .. } => Some(*new_layout),
            Barrier::Buffer { .. } => None,
        }
    }

    pub fn old_layout(&self) -> Option<vk::ImageLayout> {
        match self {
            Barrier::Image { old_layout, .. } => Some(*old_layout),
            Barrier::Buffer { .. } => None,
        }
    }
}

/// Resolves logical barriers against bound physical resources and records
/// them as one synchronization2 dependency.
pub fn record_barriers(
    device: &dyn Device,
    cmd: vk::CommandBuffer,
    barriers: &[Barrier],
    resources: &FxHashMap<GraphId, PhysicalResource>,
) {
    let mut image_barriers = Vec::new();
    let mut buffer_barriers = Vec::new();

    for barrier in barriers {
        match (barrier, resources.get(&barrier.resource())) {
            (
                Barrier::Image {
                    src_stage,
                    dst_stage,
                    src_access,
                    dst_access,
                    old_layout,
                    new_layout,
                    aspect_mask,
                    ..
                },
                Some(PhysicalResource::Image(image)),
            ) => {
                if image.image == vk::Image::null() {
                    continue;
                }

                image_barriers.push(
                    vk::ImageMemoryBarrier2::default()
                        .image(image.image)
                        .src_stage_mask(*src_stage)
                        .dst_stage_mask(*dst_stage)
                        .src_access_mask(*src_access)
                        .dst_access_mask(*dst_access)
                        .old_layout(*old_layout)
                        .new_layout(*new_layout)
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .subresource_range(vk::ImageSubresourceRange {
                            aspect_mask: *aspect_mask,
                            base_mip_level: 0,
                            level_count: vk::REMAINING_MIP_LEVELS,
                            base_array_layer: 0,
                            layer_count: vk::REMAINING_ARRAY_LAYERS,
                        }),
                );
            }
            (
                Barrier::Buffer {
                    src_stage,
                    dst_stage,
                    src_access,
                    dst_access,
                    ..
                },
                Some(PhysicalResource::Buffer(buffer)),
            ) => {
                if buffer.buffer == vk::Buffer::null() {
                    continue;
                }

                buffer_barriers.push(
                    vk::BufferMemoryBarrier2::default()
                        .buffer(buffer.buffer)
                        .src_stage_mask(*src_stage)
                        .dst_stage_mask(*dst_stage)
                        .src_access_mask(*src_access)
                        .dst_access_mask(*dst_access)
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .offset(0)
                        .size(vk::WHOLE_SIZE),
                );
            }
            (barrier, _) => {
                log::warn!(
                    "Skipping barrier for resource {} with no matching physical binding",
                    barrier.resource()
                );
            }
        }
    }

    if !image_barriers.is_empty() || !buffer_barriers.is_empty() {
        device.cmd_pipeline_barrier(cmd, &image_barriers, &buffer_barriers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment() -> ResourceState {
        ResourceState::for_image(TaskType::Graphics, Access::Attachment, false)
    }

    fn sampled(task_type: TaskType) -> ResourceState {
        ResourceState::for_image(task_type, Access::Read, false)
    }

    fn written_attachment() -> ResourceTrack {
        let mut track = ResourceTrack::new(vk::ImageLayout::UNDEFINED);
        track.record(&attachment());
        track
    }

    #[test]
    fn test_same_stage_reread_needs_no_barrier() {
        let mut track = written_attachment();
        assert!(track.transition(&sampled(TaskType::Graphics)).is_some());
        assert!(track.transition(&sampled(TaskType::Graphics)).is_none());
    }

    #[test]
    fn test_layout_change_needs_barrier() {
        let mut track = written_attachment();
        let dependency = track.transition(&sampled(TaskType::Graphics)).unwrap();
        assert_eq!(dependency.old_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(dependency.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(dependency.src_stage, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(dependency.src_access, vk::AccessFlags2::COLOR_ATTACHMENT_WRITE);
        assert_eq!(dependency.dst_stage, vk::PipelineStageFlags2::FRAGMENT_SHADER);
    }

    #[test]
    fn test_reader_in_new_stage_waits_on_last_write() {
        let mut track = written_attachment();
        track.transition(&sampled(TaskType::Graphics)).unwrap();

        let dependency = track.transition(&sampled(TaskType::Compute)).unwrap();
        assert_eq!(dependency.old_layout, dependency.new_layout);
        assert!(dependency
            .src_stage
            .contains(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT));
        // chains through the earlier transition
        assert!(dependency.src_stage.contains(vk::PipelineStageFlags2::FRAGMENT_SHADER));
        assert_eq!(dependency.src_access, vk::AccessFlags2::COLOR_ATTACHMENT_WRITE);
        assert_eq!(dependency.dst_stage, vk::PipelineStageFlags2::COMPUTE_SHADER);

        assert!(track.transition(&sampled(TaskType::Compute)).is_none());
        assert!(track.transition(&sampled(TaskType::Graphics)).is_none());
    }

    #[test]
    fn test_write_waits_on_every_reader() {
        let mut track = written_attachment();
        track.transition(&sampled(TaskType::Graphics));
        track.transition(&sampled(TaskType::Compute));

        let write = ResourceState::for_image(TaskType::Transfer, Access::Write, false);
        let dependency = track.transition(&write).unwrap();
        assert!(dependency.src_stage.contains(
            vk::PipelineStageFlags2::FRAGMENT_SHADER | vk::PipelineStageFlags2::COMPUTE_SHADER
        ));
        assert_eq!(dependency.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);

        // the write resets the reader set
        let dependency = track.transition(&sampled(TaskType::Compute)).unwrap();
        assert_eq!(dependency.src_stage, vk::PipelineStageFlags2::ALL_TRANSFER);
        assert_eq!(dependency.src_access, vk::AccessFlags2::TRANSFER_WRITE);
    }

    #[test]
    fn test_readers_chain_on_initial_transition() {
        let mut track = ResourceTrack::new(vk::ImageLayout::UNDEFINED);
        let dependency = track.transition(&sampled(TaskType::Graphics)).unwrap();
        assert_eq!(dependency.src_stage, vk::PipelineStageFlags2::TOP_OF_PIPE);

        let dependency = track.transition(&sampled(TaskType::Compute)).unwrap();
        assert_eq!(dependency.src_stage, vk::PipelineStageFlags2::FRAGMENT_SHADER);
        assert_eq!(dependency.src_access, vk::AccessFlags2::NONE);
    }

    #[test]
    fn test_write_after_read_on_buffer() {
        let read = ResourceState::for_buffer(TaskType::Compute, Access::Read);
        let write = ResourceState::for_buffer(TaskType::Compute, Access::Write);

        let mut track = ResourceTrack::new(vk::ImageLayout::UNDEFINED);
        assert!(track.transition(&read).is_none());
        let dependency = track.transition(&write).unwrap();
        assert_eq!(dependency.src_stage, vk::PipelineStageFlags2::COMPUTE_SHADER);
        assert_eq!(dependency.src_access, vk::AccessFlags2::NONE);

        let Barrier::Buffer { src_access, .. } = Barrier::buffer(GraphId::new(1), dependency) else {
            panic!("expected a buffer barrier");
        };
        assert_eq!(src_access, vk::AccessFlags2::NONE);
    }

    #[test]
    fn test_untouched_source_uses_top_of_pipe() {
        let required = ResourceState::for_image(TaskType::Compute, Access::Write, false);
        let track = ResourceTrack::new(vk::ImageLayout::UNDEFINED);
        let Barrier::Image { src_stage, .. } = Barrier::image(
            GraphId::new(2),
            track.dependency(&required),
            vk::ImageAspectFlags::COLOR,
        ) else {
            panic!("expected an image barrier");
        };
        assert_eq!(src_stage, vk::PipelineStageFlags2::TOP_OF_PIPE);
    }
}
