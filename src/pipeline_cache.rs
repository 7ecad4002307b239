use crate::device::{Device, PhysicalDeviceInfo};
use crate::error::Result;
use crate::hash::bytes_hash;
use crate::render_pass::RenderPassDescription;
use crate::resource_cache::RenderPass;
use ash::vk;
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const CACHE_MAGIC: u32 = 0xDEAD_BEEF;
const CACHE_VERSION: u32 = 1;
const HEADER_SIZE: usize = 48;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShaderStage {
    pub stage: vk::ShaderStageFlags,
    pub module: vk::ShaderModule,
    pub entry_point: String,
}

impl ShaderStage {
    pub fn new(stage: vk::ShaderStageFlags, module: vk::ShaderModule) -> Self {
        Self {
            stage,
            module,
            entry_point: "main".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexBinding {
    pub binding: u32,
    pub stride: u32,
    pub input_rate: vk::VertexInputRate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: vk::Format,
    pub offset: u32,
}

/// Fixed function and shader state of a graphics pipeline. Viewport and
/// scissor are always dynamic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GraphicsPipelineState {
    pub shader_stages: Vec<ShaderStage>,
    pub vertex_bindings: Vec<VertexBinding>,
    pub vertex_attributes: Vec<VertexAttribute>,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare_op: vk::CompareOp,
    pub blend_enable: bool,
    pub descriptor_set_layouts: Vec<vk::DescriptorSetLayout>,
    pub push_constant_size: u32,
}

impl Default for GraphicsPipelineState {
    fn default() -> Self {
        Self {
            shader_stages: Vec::new(),
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: false,
            depth_write: false,
            depth_compare_op: vk::CompareOp::LESS,
            blend_enable: false,
            descriptor_set_layouts: Vec::new(),
            push_constant_size: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComputePipelineState {
    pub shader: ShaderStage,
    pub descriptor_set_layouts: Vec<vk::DescriptorSetLayout>,
    pub push_constant_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineObject {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

/// On-disk prefix of a persisted pipeline cache, packed little endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CacheHeader {
    magic: u32,
    data_size: u64,
    data_hash: u64,
    version: u32,
    vendor_id: u32,
    device_id: u32,
    uuid: [u8; vk::UUID_SIZE],
}

impl CacheHeader {
    fn for_data(info: &PhysicalDeviceInfo, data: &[u8]) -> Self {
        Self {
            magic: CACHE_MAGIC,
            data_size: data.len() as u64,
            data_hash: bytes_hash(data),
            version: CACHE_VERSION,
            vendor_id: info.vendor_id,
            device_id: info.device_id,
            uuid: info.pipeline_cache_uuid,
        }
    }

    fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic.to_le_bytes());
        bytes[4..12].copy_from_slice(&self.data_size.to_le_bytes());
        bytes[12..20].copy_from_slice(&self.data_hash.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.version.to_le_bytes());
        bytes[24..28].copy_from_slice(&self.vendor_id.to_le_bytes());
        bytes[28..32].copy_from_slice(&self.device_id.to_le_bytes());
        bytes[32..48].copy_from_slice(&self.uuid);
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let header = bytes.get(..HEADER_SIZE)?;
        let u32_at = |offset: usize| {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&header[offset..offset + 4]);
            u32::from_le_bytes(raw)
        };
        let u64_at = |offset: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&header[offset..offset + 8]);
            u64::from_le_bytes(raw)
        };
        let mut uuid = [0u8; vk::UUID_SIZE];
        uuid.copy_from_slice(&header[32..48]);

        Some(Self {
            magic: u32_at(0),
            data_size: u64_at(4),
            data_hash: u64_at(12),
            version: u32_at(20),
            vendor_id: u32_at(24),
            device_id: u32_at(28),
            uuid,
        })
    }

    /// Returns the reason the header cannot be used with `info`, if any.
    fn validate(&self, info: &PhysicalDeviceInfo, data: &[u8]) -> Option<&'static str> {
        if self.magic != CACHE_MAGIC {
            Some("Invalid pipeline cache magic number")
        } else if self.version != CACHE_VERSION {
            Some("Mismatch pipeline cache version")
        } else if self.vendor_id != info.vendor_id {
            Some("Mismatch pipeline cache vendor id")
        } else if self.device_id != info.device_id {
            Some("Mismatch pipeline cache device id")
        } else if self.uuid != info.pipeline_cache_uuid {
            Some("Mismatch pipeline cache UUID")
        } else if self.data_size != data.len() as u64 || self.data_hash != bytes_hash(data) {
            Some("Corrupted pipeline cache data")
        } else {
            None
        }
    }
}

/// Graphics and compute pipelines, keyed by state, backed by a driver
/// pipeline cache that persists across runs.
pub struct PipelineCache {
    device: Arc<dyn Device>,
    cache: vk::PipelineCache,
    path: Option<PathBuf>,
    loaded_from_disk: bool,
    graphics: FxHashMap<GraphicsPipelineState, Vec<(RenderPassDescription, PipelineObject)>>,
    compute: FxHashMap<ComputePipelineState, PipelineObject>,
}

impl PipelineCache {
    pub fn new(device: Arc<dyn Device>, path: Option<PathBuf>) -> Result<Self> {
        let initial_data = match path.as_deref() {
            Some(path) => Self::read_cache_file(device.as_ref(), path),
            None => None,
        };

        let (cache, loaded_from_disk) = match initial_data {
            Some(data) => match device.create_pipeline_cache(&data) {
                Ok(cache) => {
                    log::info!("Loaded pipeline cache ({} bytes)", data.len());
                    (cache, true)
                }
                Err(error) => {
                    log::error!("Driver rejected pipeline cache data: {error}");
                    (device.create_pipeline_cache(&[])?, false)
                }
            },
            None => (device.create_pipeline_cache(&[])?, false),
        };

        Ok(Self {
            device,
            cache,
            path,
            loaded_from_disk,
            graphics: FxHashMap::default(),
            compute: FxHashMap::default(),
        })
    }

    fn read_cache_file(device: &dyn Device, path: &Path) -> Option<Vec<u8>> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(error) => {
                log::info!(
                    "No pipeline cache at {} ({error}), creating a new one",
                    path.display()
                );
                return None;
            }
        };

        let Some(header) = CacheHeader::from_bytes(&bytes) else {
            log::error!("Pipeline cache at {} is truncated", path.display());
            return None;
        };

        let data = &bytes[HEADER_SIZE..];
        if let Some(reason) = header.validate(&device.physical_device_info(), data) {
            log::error!("{reason}, creating a new pipeline cache");
            return None;
        }

        Some(data.to_vec())
    }

    pub fn loaded_from_disk(&self) -> bool {
        self.loaded_from_disk
    }

    pub fn handle(&self) -> vk::PipelineCache {
        self.cache
    }

    /// Pipelines are shared between render passes that are compatible.
    pub fn get_graphics_pipeline(
        &mut self,
        state: &GraphicsPipelineState,
        render_pass: &RenderPass,
    ) -> Result<PipelineObject> {
        if let Some(pipeline) = self.graphics.get(state).and_then(|bucket| {
            bucket
                .iter()
                .find(|(description, _)| description.is_compatible(&render_pass.description))
                .map(|(_, pipeline)| *pipeline)
        }) {
            return Ok(pipeline);
        }

        let pipeline =
            self.device
                .create_graphics_pipeline(state, render_pass, self.cache)?;
        log::debug!(
            "Created graphics pipeline with {} shader stages",
            state.shader_stages.len()
        );
        self.graphics
            .entry(state.clone())
            .or_default()
            .push((render_pass.description.clone(), pipeline));
        Ok(pipeline)
    }

    pub fn get_compute_pipeline(&mut self, state: &ComputePipelineState) -> Result<PipelineObject> {
        if let Some(pipeline) = self.compute.get(state) {
            return Ok(*pipeline);
        }

        let pipeline = self.device.create_compute_pipeline(state, self.cache)?;
        self.compute.insert(state.clone(), pipeline);
        Ok(pipeline)
    }

    pub fn pipeline_count(&self) -> usize {
        self.graphics.values().map(Vec::len).sum::<usize>() + self.compute.len()
    }

    pub fn save_cache(&self) -> Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };

        let data = self.device.pipeline_cache_data(self.cache)?;
        let header = CacheHeader::for_data(&self.device.physical_device_info(), &data);

        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut bytes = Vec::with_capacity(HEADER_SIZE + data.len());
        bytes.extend_from_slice(&header.to_bytes());
        bytes.extend_from_slice(&data);
        std::fs::write(path, bytes)?;

        log::info!(
            "Saved pipeline cache ({} bytes) to {}",
            data.len(),
            path.display()
        );
        Ok(())
    }
}

impl Drop for PipelineCache {
    fn drop(&mut self) {
        if let Err(error) = self.save_cache() {
            log::error!("Failed to save pipeline cache: {error}");
        }

        for (_, bucket) in self.graphics.drain() {
            for (_, pipeline) in bucket {
                self.device.destroy_pipeline(pipeline);
            }
        }
        for (_, pipeline) in self.compute.drain() {
            self.device.destroy_pipeline(pipeline);
        }
        self.device.destroy_pipeline_cache(self.cache);
    }
}
