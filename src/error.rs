use crate::resource::GraphId;
use ash::vk;

#[derive(Debug, thiserror::Error)]
pub enum FrameGraphError {
    #[error("Invalid graph state: {0}")]
    InvalidGraphState(String),

    #[error("Invalid resource {id}: {reason}")]
    InvalidResourceId { id: GraphId, reason: String },

    #[error("Invalid task {id}: {reason}")]
    InvalidTaskId { id: GraphId, reason: String },

    #[error("Stale resource {id}: current version is {current} but got {got}")]
    StaleResourceVersion { id: GraphId, current: u32, got: u32 },

    #[error("Conflicting description for resource '{name}': {reason}")]
    ConflictingDescription { name: String, reason: String },

    #[error("Dependency cycle detected: {message}")]
    DependencyCycle { tasks: Vec<GraphId>, message: String },

    #[error("Fence wait timed out after {timeout_ns}ns")]
    FenceTimeout { timeout_ns: u64 },

    #[error("Surface is out of date and must be recreated")]
    SurfaceOutOfDate,

    #[error("Memory budget exceeded: {current}MB + {requested}MB > {budget}MB")]
    BudgetExceeded {
        current: u64,
        requested: u64,
        budget: u64,
    },

    #[error("{0}")]
    Other(String),

    #[error("Vulkan error: {0}")]
    VulkanError(#[from] vk::Result),

    #[error("GPU allocator error: {0}")]
    GpuAllocatorError(#[from] gpu_allocator::AllocationError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameGraphError {
    /// Errors after which the same frame can simply be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FrameGraphError::FenceTimeout { .. }
                | FrameGraphError::SurfaceOutOfDate
                | FrameGraphError::VulkanError(vk::Result::ERROR_OUT_OF_DATE_KHR)
                | FrameGraphError::VulkanError(vk::Result::SUBOPTIMAL_KHR)
        )
    }
}

impl From<&str> for FrameGraphError {
    fn from(s: &str) -> Self {
        FrameGraphError::Other(s.to_string())
    }
}

impl From<String> for FrameGraphError {
    fn from(s: String) -> Self {
        FrameGraphError::Other(s)
    }
}

pub type Result<T> = std::result::Result<T, FrameGraphError>;
