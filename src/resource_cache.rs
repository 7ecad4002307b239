use crate::device::{Device, PhysicalBuffer};
use crate::error::Result;
use crate::hash::{bytes_hash, content_hash, hash_combine};
use crate::render_pass::RenderPassDescription;
use ash::vk;
use rustc_hash::FxHashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorSetLayoutBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Descriptor {
    Buffer {
        binding: u32,
        descriptor_type: vk::DescriptorType,
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    Image {
        binding: u32,
        descriptor_type: vk::DescriptorType,
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    },
}

impl Descriptor {
    pub fn binding(&self) -> u32 {
        match self {
            Descriptor::Buffer { binding, .. } | Descriptor::Image { binding, .. } => *binding,
        }
    }
}

#[derive(Debug)]
pub struct DescriptorSetLayout {
    pub handle: vk::DescriptorSetLayout,
    pub bindings: Vec<DescriptorSetLayoutBinding>,
    pub hash: u64,
}

#[derive(Debug)]
pub struct DescriptorSet {
    pub handle: vk::DescriptorSet,
    pub layout: vk::DescriptorSetLayout,
    pub descriptors: Vec<Descriptor>,
}

#[derive(Debug)]
pub struct Shader {
    pub module: vk::ShaderModule,
    pub stage: vk::ShaderStageFlags,
    pub hash: u64,
}

/// Vertex bytes followed by 4-byte aligned `u32` indices in one buffer.
#[derive(Debug)]
pub struct GeometryBuffer {
    pub buffer: PhysicalBuffer,
    pub vertex_size: u64,
    pub index_offset: u64,
    pub index_count: u32,
}

#[derive(Debug)]
pub struct RenderPass {
    pub handle: vk::RenderPass,
    pub description: RenderPassDescription,
}

/// Objects keyed by content hash. A hash hit is confirmed with a full key
/// comparison so two different keys that collide both get their own object.
struct Cache<K, V> {
    entries: FxHashMap<u64, Vec<(K, Arc<V>)>>,
}

impl<K: PartialEq, V> Cache<K, V> {
    fn new() -> Self {
        Self {
            entries: FxHashMap::default(),
        }
    }

    fn get(&self, hash: u64, key: &K) -> Option<&Arc<V>> {
        self.entries
            .get(&hash)?
            .iter()
            .find(|(candidate, _)| candidate == key)
            .map(|(_, value)| value)
    }

    fn get_or_try_insert(
        &mut self,
        hash: u64,
        key: K,
        make: impl FnOnce(&K) -> Result<V>,
    ) -> Result<Arc<V>> {
        if let Some(value) = self.get(hash, &key) {
            return Ok(Arc::clone(value));
        }

        let value = Arc::new(make(&key)?);
        let bucket = self.entries.entry(hash).or_default();
        if !bucket.is_empty() {
            log::warn!("Content hash collision on {hash:#018x}, keeping both entries");
        }
        bucket.push((key, Arc::clone(&value)));
        Ok(value)
    }

    fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    fn drain(&mut self) -> impl Iterator<Item = Arc<V>> + '_ {
        self.entries
            .drain()
            .flat_map(|(_, bucket)| bucket.into_iter().map(|(_, value)| value))
    }
}

/// Content-addressed store of long lived GPU objects. Identical requests
/// return the same `Arc`. Everything is destroyed when the cache drops.
pub struct ResourceCache {
    device: Arc<dyn Device>,
    layouts: Cache<Vec<DescriptorSetLayoutBinding>, DescriptorSetLayout>,
    descriptor_sets: Cache<(vk::DescriptorSetLayout, Vec<Descriptor>), DescriptorSet>,
    shaders: Cache<(vk::ShaderStageFlags, Vec<u32>), Shader>,
    geometry: Cache<(Vec<u8>, Vec<u32>), GeometryBuffer>,
    render_passes: Cache<RenderPassDescription, RenderPass>,
}

impl ResourceCache {
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self {
            device,
            layouts: Cache::new(),
            descriptor_sets: Cache::new(),
            shaders: Cache::new(),
            geometry: Cache::new(),
            render_passes: Cache::new(),
        }
    }

    pub fn request_descriptor_set_layout(
        &mut self,
        bindings: &[DescriptorSetLayoutBinding],
    ) -> Result<Arc<DescriptorSetLayout>> {
        let hash = content_hash(bindings);
        let device = &self.device;
        self.layouts
            .get_or_try_insert(hash, bindings.to_vec(), |bindings| {
                let handle = device.create_descriptor_set_layout(bindings)?;
                log::debug!("Created descriptor set layout {hash:#018x}");
                Ok(DescriptorSetLayout {
                    handle,
                    bindings: bindings.clone(),
                    hash,
                })
            })
    }

    /// Returns the set for `descriptors` under `layout`, allocating and
    /// writing it on first request. `force_update` rewrites a cached set,
    /// for when the objects behind the handles were recreated in place.
    pub fn request_descriptor_set(
        &mut self,
        layout: &DescriptorSetLayout,
        descriptors: &[Descriptor],
        force_update: bool,
    ) -> Result<Arc<DescriptorSet>> {
        let mut hash = layout.hash;
        hash_combine(&mut hash, content_hash(descriptors));

        let key = (layout.handle, descriptors.to_vec());
        if let Some(set) = self.descriptor_sets.get(hash, &key) {
            if force_update {
                self.device.update_descriptor_set(set.handle, descriptors);
            }
            return Ok(Arc::clone(set));
        }

        let device = &self.device;
        self.descriptor_sets
            .get_or_try_insert(hash, key, |(layout, descriptors)| {
                let handle = device.allocate_descriptor_set(*layout)?;
                device.update_descriptor_set(handle, descriptors);
                Ok(DescriptorSet {
                    handle,
                    layout: *layout,
                    descriptors: descriptors.clone(),
                })
            })
    }

    pub fn request_shader(
        &mut self,
        stage: vk::ShaderStageFlags,
        bytecode: &[u32],
    ) -> Result<Arc<Shader>> {
        let mut hash = content_hash(&stage);
        hash_combine(&mut hash, content_hash(bytecode));

        let device = &self.device;
        self.shaders
            .get_or_try_insert(hash, (stage, bytecode.to_vec()), |(stage, bytecode)| {
                let module = device.create_shader_module(bytecode)?;
                log::debug!("Created {stage:?} shader module {hash:#018x}");
                Ok(Shader {
                    module,
                    stage: *stage,
                    hash,
                })
            })
    }

    pub fn request_geometry_buffer(
        &mut self,
        vertices: &[u8],
        indices: &[u32],
    ) -> Result<Arc<GeometryBuffer>> {
        let mut hash = bytes_hash(vertices);
        hash_combine(&mut hash, content_hash(indices));

        let device = &self.device;
        self.geometry.get_or_try_insert(
            hash,
            (vertices.to_vec(), indices.to_vec()),
            |(vertices, indices)| {
                let vertex_size = vertices.len() as u64;
                let index_offset = vertex_size.next_multiple_of(4);
                let index_bytes = indices
                    .iter()
                    .flat_map(|index| index.to_le_bytes())
                    .collect::<Vec<_>>();
                let size = (index_offset + index_bytes.len() as u64).max(4);

                let buffer = device.create_buffer(
                    size,
                    vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::INDEX_BUFFER,
                    gpu_allocator::MemoryLocation::CpuToGpu,
                )?;
                let written = device
                    .write_buffer(&buffer, 0, vertices)
                    .and_then(|()| device.write_buffer(&buffer, index_offset, &index_bytes));
                if let Err(error) = written {
                    device.destroy_buffer(buffer);
                    return Err(error);
                }

                Ok(GeometryBuffer {
                    buffer,
                    vertex_size,
                    index_offset,
                    index_count: indices.len() as u32,
                })
            },
        )
    }

    pub fn request_render_pass(
        &mut self,
        description: &RenderPassDescription,
    ) -> Result<Arc<RenderPass>> {
        let hash = description.hash();
        let device = &self.device;
        self.render_passes
            .get_or_try_insert(hash, description.clone(), |description| {
                let handle = device.create_render_pass(description)?;
                log::debug!(
                    "Created render pass {hash:#018x} with {} attachments",
                    description.attachments.len()
                );
                Ok(RenderPass {
                    handle,
                    description: description.clone(),
                })
            })
    }

    pub fn len(&self) -> usize {
        self.layouts.len()
            + self.descriptor_sets.len()
            + self.shaders.len()
            + self.geometry.len()
            + self.render_passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn render_pass_count(&self) -> usize {
        self.render_passes.len()
    }
}

impl Drop for ResourceCache {
    fn drop(&mut self) {
        // descriptor sets go back with their pool
        self.descriptor_sets.drain().for_each(drop);

        for render_pass in self.render_passes.drain() {
            self.device.destroy_render_pass(render_pass.handle);
        }
        for shader in self.shaders.drain() {
            self.device.destroy_shader_module(shader.module);
        }
        for geometry in self.geometry.drain() {
            self.device.destroy_buffer(geometry.buffer);
        }
        for layout in self.layouts.drain() {
            self.device.destroy_descriptor_set_layout(layout.handle);
        }
    }
}
