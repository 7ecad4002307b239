use crate::device::{PhysicalBuffer, PhysicalImage};
use ash::vk;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GraphId(u32);

pub const INVALID_ID: GraphId = GraphId(u32::MAX);

impl GraphId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn is_valid(self) -> bool {
        self != INVALID_ID
    }
}

impl Default for GraphId {
    fn default() -> Self {
        INVALID_ID
    }
}

impl std::fmt::Display for GraphId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "#{}", self.0)
        } else {
            write!(f, "#invalid")
        }
    }
}

/// A resource as seen at one version. Writing through a handle yields a new
/// handle with the next version; older handles keep naming older versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceHandle {
    pub id: GraphId,
    pub version: u32,
}

impl ResourceHandle {
    pub fn new(id: GraphId, version: u32) -> Self {
        Self { id, version }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

impl ClearValue {
    pub fn default_for(format: vk::Format) -> Self {
        if is_depth_format(format) {
            ClearValue::DepthStencil {
                depth: 1.0,
                stencil: 0,
            }
        } else {
            ClearValue::Color([0.0, 0.0, 0.0, 1.0])
        }
    }

    pub fn to_vk(self) -> vk::ClearValue {
        match self {
            ClearValue::Color(float32) => vk::ClearValue {
                color: vk::ClearColorValue { float32 },
            },
            ClearValue::DepthStencil { depth, stencil } => vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
            },
        }
    }
}

impl Eq for ClearValue {}

impl Hash for ClearValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            ClearValue::Color(color) => {
                0u8.hash(state);
                color.iter().for_each(|c| c.to_bits().hash(state));
            }
            ClearValue::DepthStencil { depth, stencil } => {
                1u8.hash(state);
                depth.to_bits().hash(state);
                stencil.hash(state);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageDescription {
    pub extent: vk::Extent3D,
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub layers: u32,
    pub samples: vk::SampleCountFlags,
    pub clear_value: ClearValue,
}

impl ImageDescription {
    pub fn new_2d(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            image_type: vk::ImageType::TYPE_2D,
            format,
            layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            clear_value: ClearValue::default_for(format),
        }
    }

    pub fn with_clear_value(mut self, clear_value: ClearValue) -> Self {
        self.clear_value = clear_value;
        self
    }

    pub fn extent_2d(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.extent.width,
            height: self.extent.height,
        }
    }

    pub fn is_depth(&self) -> bool {
        is_depth_format(self.format)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferDescription {
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceDescription {
    Image(ImageDescription),
    Buffer(BufferDescription),
}

impl ResourceDescription {
    pub fn as_image(&self) -> Option<&ImageDescription> {
        match self {
            ResourceDescription::Image(description) => Some(description),
            ResourceDescription::Buffer(_) => None,
        }
    }

    pub fn as_buffer(&self) -> Option<&BufferDescription> {
        match self {
            ResourceDescription::Buffer(description) => Some(description),
            ResourceDescription::Image(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetainedBinding {
    Image {
        image: PhysicalImage,
        initial_layout: vk::ImageLayout,
    },
    Buffer {
        buffer: PhysicalBuffer,
    },
}

#[derive(Debug, Clone)]
pub struct GraphResource {
    id: GraphId,
    name: String,
    description: ResourceDescription,
    retained: Option<RetainedBinding>,
    creator: Option<GraphId>,
    // producer of each version, indexed by version
    producers: Vec<Option<GraphId>>,
    // (task, version read)
    readers: Vec<(GraphId, u32)>,
    writers: Vec<GraphId>,
    first_task: Option<GraphId>,
    last_task: Option<GraphId>,
}

impl GraphResource {
    pub(crate) fn new_transient(
        id: GraphId,
        name: &str,
        description: ResourceDescription,
        creator: GraphId,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            description,
            retained: None,
            creator: Some(creator),
            producers: vec![Some(creator)],
            readers: Vec::new(),
            writers: Vec::new(),
            first_task: Some(creator),
            last_task: Some(creator),
        }
    }

    pub(crate) fn new_retained(
        id: GraphId,
        name: &str,
        description: ResourceDescription,
        binding: RetainedBinding,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            description,
            retained: Some(binding),
            creator: None,
            producers: vec![None],
            readers: Vec::new(),
            writers: Vec::new(),
            first_task: None,
            last_task: None,
        }
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &ResourceDescription {
        &self.description
    }

    pub fn is_retained(&self) -> bool {
        self.retained.is_some()
    }

    pub fn is_transient(&self) -> bool {
        self.retained.is_none()
    }

    pub fn retained_binding(&self) -> Option<&RetainedBinding> {
        self.retained.as_ref()
    }

    pub fn version(&self) -> u32 {
        (self.producers.len() - 1) as u32
    }

    pub fn handle(&self) -> ResourceHandle {
        ResourceHandle::new(self.id, self.version())
    }

    /// Task that wrote the current version, `None` for an untouched retained resource.
    pub fn producer_task_id(&self) -> Option<GraphId> {
        self.producer_of(self.version())
    }

    pub fn producer_of(&self, version: u32) -> Option<GraphId> {
        self.producers.get(version as usize).copied().flatten()
    }

    pub fn creator(&self) -> Option<GraphId> {
        self.creator
    }

    pub fn readers(&self) -> &[(GraphId, u32)] {
        &self.readers
    }

    pub fn readers_of(&self, version: u32) -> impl Iterator<Item = GraphId> + '_ {
        self.readers
            .iter()
            .filter(move |(_, read_version)| *read_version == version)
            .map(|(task, _)| *task)
    }

    pub fn writers(&self) -> &[GraphId] {
        &self.writers
    }

    pub fn first_task_id(&self) -> Option<GraphId> {
        self.first_task
    }

    pub fn last_task_id(&self) -> Option<GraphId> {
        self.last_task
    }

    pub(crate) fn has_readers(&self) -> bool {
        !self.readers.is_empty()
    }

    pub(crate) fn rebind(&mut self, binding: RetainedBinding) {
        self.retained = Some(binding);
    }

    pub(crate) fn record_read(&mut self, task: GraphId, version: u32) {
        if !self.readers.contains(&(task, version)) {
            self.readers.push((task, version));
        }
        self.touch(task);
    }

    pub(crate) fn record_write(&mut self, task: GraphId) -> ResourceHandle {
        self.producers.push(Some(task));
        self.writers.push(task);
        self.touch(task);
        self.handle()
    }

    pub(crate) fn set_task_range(&mut self, first: Option<GraphId>, last: Option<GraphId>) {
        self.first_task = first;
        self.last_task = last;
    }

    fn touch(&mut self, task: GraphId) {
        self.first_task = Some(self.first_task.map_or(task, |first| first.min(task)));
        self.last_task = Some(self.last_task.map_or(task, |last| last.max(task)));
    }
}

pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D32_SFLOAT
            | vk::Format::S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

pub fn aspect_mask_from_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D32_SFLOAT | vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D32_SFLOAT_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D16_UNORM_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}
