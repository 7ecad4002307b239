use crate::device::{Device, PhysicalResource};
use crate::error::{FrameGraphError, Result};
use crate::pipeline_cache::{GraphicsPipelineState, PipelineObject};
use crate::resource::{
    BufferDescription, GraphId, GraphResource, ImageDescription, ResourceDescription,
    ResourceHandle,
};
use ash::vk;
use rustc_hash::FxHashMap;
use std::any::Any;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    Graphics,
    Compute,
    Transfer,
}

impl TaskType {
    pub fn bind_point(self) -> Option<vk::PipelineBindPoint> {
        match self {
            TaskType::Graphics => Some(vk::PipelineBindPoint::GRAPHICS),
            TaskType::Compute => Some(vk::PipelineBindPoint::COMPUTE),
            TaskType::Transfer => None,
        }
    }
}

/// What an execute callback sees while its step is being recorded.
pub struct PassContext<'a> {
    pub cmd: vk::CommandBuffer,
    pub device: &'a dyn Device,
    pub render_pass: Option<vk::RenderPass>,
    pub framebuffer: Option<vk::Framebuffer>,
    pub pipeline: Option<PipelineObject>,
    pub extent: vk::Extent2D,
    pub frame_index: usize,
    resources: &'a FxHashMap<GraphId, PhysicalResource>,
}

impl<'a> PassContext<'a> {
    pub(crate) fn new(
        cmd: vk::CommandBuffer,
        device: &'a dyn Device,
        resources: &'a FxHashMap<GraphId, PhysicalResource>,
        extent: vk::Extent2D,
        frame_index: usize,
    ) -> Self {
        Self {
            cmd,
            device,
            render_pass: None,
            framebuffer: None,
            pipeline: None,
            extent,
            frame_index,
            resources,
        }
    }

    pub fn get_image(&self, handle: ResourceHandle) -> Result<(vk::Image, vk::ImageView)> {
        match self.resources.get(&handle.id) {
            Some(PhysicalResource::Image(image)) => Ok((image.image, image.view)),
            Some(PhysicalResource::Buffer(_)) => Err(FrameGraphError::InvalidResourceId {
                id: handle.id,
                reason: "Resource is a buffer, not an image".to_string(),
            }),
            None => Err(FrameGraphError::InvalidResourceId {
                id: handle.id,
                reason: "Resource not found in pass context".to_string(),
            }),
        }
    }

    pub fn get_buffer(&self, handle: ResourceHandle) -> Result<vk::Buffer> {
        match self.resources.get(&handle.id) {
            Some(PhysicalResource::Buffer(buffer)) => Ok(buffer.buffer),
            Some(PhysicalResource::Image(_)) => Err(FrameGraphError::InvalidResourceId {
                id: handle.id,
                reason: "Resource is an image, not a buffer".to_string(),
            }),
            None => Err(FrameGraphError::InvalidResourceId {
                id: handle.id,
                reason: "Resource not found in pass context".to_string(),
            }),
        }
    }
}

pub type TaskExecuteFn = Box<dyn FnMut(&dyn Any, &mut PassContext) -> Result<()>>;

/// A node of the frame graph. The payload is type-erased; the typed view is
/// recovered with [`GraphTask::data`].
pub struct GraphTask {
    id: GraphId,
    name: String,
    task_type: TaskType,
    cull_immune: bool,
    creates: Vec<GraphId>,
    reads: Vec<ResourceHandle>,
    writes: Vec<ResourceHandle>,
    pipeline_state: Option<GraphicsPipelineState>,
    data: Box<dyn Any>,
    execute: Option<TaskExecuteFn>,
}

impl GraphTask {
    pub(crate) fn new(
        id: GraphId,
        name: &str,
        task_type: TaskType,
        cull_immune: bool,
        data: Box<dyn Any>,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            task_type,
            cull_immune,
            creates: Vec::new(),
            reads: Vec::new(),
            writes: Vec::new(),
            pipeline_state: None,
            data,
            execute: None,
        }
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    pub fn is_cull_immune(&self) -> bool {
        self.cull_immune
    }

    pub fn creates(&self) -> &[GraphId] {
        &self.creates
    }

    pub fn reads(&self) -> &[ResourceHandle] {
        &self.reads
    }

    pub fn writes(&self) -> &[ResourceHandle] {
        &self.writes
    }

    pub fn reads_resource(&self, id: GraphId) -> bool {
        self.reads.iter().any(|handle| handle.id == id)
    }

    pub fn writes_resource(&self, id: GraphId) -> bool {
        self.writes.iter().any(|handle| handle.id == id)
    }

    pub fn touches(&self, id: GraphId) -> bool {
        self.creates.contains(&id) || self.reads_resource(id) || self.writes_resource(id)
    }

    pub fn pipeline_state(&self) -> Option<&GraphicsPipelineState> {
        self.pipeline_state.as_ref()
    }

    pub fn data<T: 'static>(&self) -> Option<&T> {
        self.data.downcast_ref()
    }

    pub(crate) fn set_data(&mut self, data: Box<dyn Any>) {
        self.data = data;
    }

    pub(crate) fn set_execute(&mut self, execute: TaskExecuteFn) {
        self.execute = Some(execute);
    }

    pub(crate) fn run(&mut self, ctx: &mut PassContext) -> Result<()> {
        match self.execute.as_mut() {
            Some(execute) => execute(&*self.data, ctx),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for GraphTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphTask")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("task_type", &self.task_type)
            .field("cull_immune", &self.cull_immune)
            .field("creates", &self.creates)
            .field("reads", &self.reads)
            .field("writes", &self.writes)
            .finish_non_exhaustive()
    }
}

pub struct GraphTaskBuilder<'a> {
    task: &'a mut GraphTask,
    resources: &'a mut Vec<GraphResource>,
    next_resource_id: &'a mut u32,
}

impl<'a> GraphTaskBuilder<'a> {
    pub(crate) fn new(
        task: &'a mut GraphTask,
        resources: &'a mut Vec<GraphResource>,
        next_resource_id: &'a mut u32,
    ) -> Self {
        Self {
            task,
            resources,
            next_resource_id,
        }
    }

    pub fn task_id(&self) -> GraphId {
        self.task.id
    }

    pub fn create(&mut self, name: &str, description: ResourceDescription) -> Result<ResourceHandle> {
        if self.resources.iter().any(|resource| resource.name() == name) {
            return Err(FrameGraphError::InvalidGraphState(format!(
                "resource '{name}' is already declared in this cycle"
            )));
        }

        let id = GraphId::new(*self.next_resource_id);
        *self.next_resource_id += 1;

        let resource = GraphResource::new_transient(id, name, description, self.task.id);
        let handle = resource.handle();
        self.resources.push(resource);
        self.task.creates.push(id);
        Ok(handle)
    }

    pub fn create_image(&mut self, name: &str, description: ImageDescription) -> Result<ResourceHandle> {
        self.create(name, ResourceDescription::Image(description))
    }

    pub fn create_buffer(
        &mut self,
        name: &str,
        description: BufferDescription,
    ) -> Result<ResourceHandle> {
        self.create(name, ResourceDescription::Buffer(description))
    }

    /// Declares a read of the version `handle` names. Reads never bump versions.
    pub fn read(&mut self, handle: ResourceHandle) -> Result<ResourceHandle> {
        let task_id = self.task.id;
        let resource = Self::lookup(self.resources.as_mut_slice(), handle)?;
        if handle.version > resource.version() {
            return Err(FrameGraphError::InvalidResourceId {
                id: handle.id,
                reason: format!(
                    "version {} of '{}' does not exist yet",
                    handle.version,
                    resource.name()
                ),
            });
        }

        resource.record_read(task_id, handle.version);
        if !self.task.reads.contains(&handle) {
            self.task.reads.push(handle);
        }
        Ok(handle)
    }

    /// Declares a write and returns the handle of the new version.
    pub fn write(&mut self, handle: ResourceHandle) -> Result<ResourceHandle> {
        let task_id = self.task.id;
        let resource = Self::lookup(self.resources.as_mut_slice(), handle)?;
        if handle.version != resource.version() {
            return Err(FrameGraphError::StaleResourceVersion {
                id: handle.id,
                current: resource.version(),
                got: handle.version,
            });
        }

        let written = resource.record_write(task_id);
        self.task.writes.push(written);
        Ok(written)
    }

    pub fn resource(&self, name: &str) -> Option<ResourceHandle> {
        self.resources
            .iter()
            .find(|resource| resource.name() == name)
            .map(GraphResource::handle)
    }

    pub fn description(&self, handle: ResourceHandle) -> Option<&ResourceDescription> {
        self.resources
            .get(handle.id.index())
            .map(GraphResource::description)
    }

    pub fn set_graphics_pipeline(&mut self, state: GraphicsPipelineState) {
        self.task.pipeline_state = Some(state);
    }

    fn lookup(
        resources: &mut [GraphResource],
        handle: ResourceHandle,
    ) -> Result<&mut GraphResource> {
        resources
            .get_mut(handle.id.index())
            .filter(|resource| resource.id() == handle.id)
            .ok_or_else(|| FrameGraphError::InvalidResourceId {
                id: handle.id,
                reason: "resource was never created or retained in the current cycle".to_string(),
            })
    }
}
