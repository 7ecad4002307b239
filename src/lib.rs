//! Frame graph for Vulkan: tasks declare the resources they create, read and
//! write; the graph is culled, ordered and baked into barriers, render passes
//! and command buffers that are reused while its shape stays the same.

pub mod bake;
pub mod baked;
pub mod barrier;
pub mod builder;
pub mod config;
pub mod deletion_queue;
pub mod device;
pub mod engine;
pub mod error;
pub mod hash;
pub mod pipeline_cache;
pub mod render_pass;
pub mod resource;
pub mod resource_cache;
pub mod task;
pub mod vulkan;

#[cfg(test)]
pub(crate) mod testing;

pub use baked::{BakeContext, BakedFrameGraph};
pub use builder::FrameGraphBuilder;
pub use config::{BakeOptions, EngineConfig};
pub use device::{Device, Frame, PhysicalBuffer, PhysicalImage, Surface};
pub use engine::{Engine, FrameStatus};
pub use error::{FrameGraphError, Result};
pub use pipeline_cache::{GraphicsPipelineState, PipelineCache};
pub use resource::{BufferDescription, ClearValue, GraphId, ImageDescription, ResourceHandle};
pub use resource_cache::ResourceCache;
pub use task::{GraphTask, GraphTaskBuilder, PassContext, TaskType};
