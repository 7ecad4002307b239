use crate::barrier::{Access, Barrier, ResourceState, ResourceTrack};
use crate::error::{FrameGraphError, Result};
use crate::hash::{content_hash, hash_combine};
use crate::render_pass::{
    AttachmentDescription, AttachmentRef, RenderPassDescription, Subpass, attachment_layout,
};
use crate::resource::{
    BufferDescription, ClearValue, GraphId, GraphResource, ImageDescription, ResourceDescription,
    RetainedBinding, aspect_mask_from_format,
};
use crate::task::{GraphTask, TaskType};
use ash::vk;
use rustc_hash::{FxHashMap, FxHashSet};
use std::cmp::Reverse;
use std::collections::BinaryHeap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhysicalDescription {
    Image {
        description: ImageDescription,
        usage: vk::ImageUsageFlags,
    },
    Buffer {
        description: BufferDescription,
        usage: vk::BufferUsageFlags,
    },
}

impl PhysicalDescription {
    /// Same physical shape; the clear value is per use, not per allocation.
    fn interchangeable(&self, other: &PhysicalDescription) -> bool {
        match (self, other) {
            (
                PhysicalDescription::Image { description, usage },
                PhysicalDescription::Image {
                    description: other_description,
                    usage: other_usage,
                },
            ) => {
                usage == other_usage
                    && description.extent == other_description.extent
                    && description.image_type == other_description.image_type
                    && description.format == other_description.format
                    && description.layers == other_description.layers
                    && description.samples == other_description.samples
            }
            (
                PhysicalDescription::Buffer { description, usage },
                PhysicalDescription::Buffer {
                    description: other_description,
                    usage: other_usage,
                },
            ) => description == other_description && usage == other_usage,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalResourceInfo {
    pub resource: GraphId,
    pub name: String,
    pub retained: bool,
    pub description: PhysicalDescription,
}

#[derive(Debug, Clone)]
pub struct PlannedStep {
    pub task_id: GraphId,
    pub task_type: TaskType,
    pub render_pass: Option<RenderPassDescription>,
    /// Resources bound as render pass attachments, in attachment order.
    pub attachments: Vec<GraphId>,
    pub clear_values: Vec<ClearValue>,
    pub extent: vk::Extent2D,
    pub barriers_before: Vec<Barrier>,
    pub barriers_after: Vec<Barrier>,
    pub present_step: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLifetime {
    pub resource: GraphId,
    pub first_step: usize,
    pub last_step: usize,
}

impl ResourceLifetime {
    pub fn overlaps(&self, other: &ResourceLifetime) -> bool {
        self.last_step >= other.first_step && self.first_step <= other.last_step
    }
}

#[derive(Debug, Clone)]
pub struct AliasingGroup {
    pub description: PhysicalDescription,
    pub resources: Vec<GraphId>,
}

#[derive(Debug, Clone)]
pub struct BakePlan {
    pub hash: u64,
    pub final_resource: GraphId,
    pub steps: Vec<PlannedStep>,
    pub culled_tasks: Vec<GraphId>,
    pub physical: Vec<PhysicalResourceInfo>,
    pub resource_link: FxHashMap<GraphId, usize>,
    pub lifetimes: Vec<ResourceLifetime>,
    pub aliasing_groups: Vec<AliasingGroup>,
    /// First and last surviving task touching each live resource, in step order.
    pub task_ranges: FxHashMap<GraphId, (GraphId, GraphId)>,
}

impl BakePlan {
    pub fn step_index(&self, task_id: GraphId) -> Option<usize> {
        self.steps.iter().position(|step| step.task_id == task_id)
    }

    pub fn physical_description(&self, resource: GraphId) -> Option<&PhysicalResourceInfo> {
        self.resource_link
            .get(&resource)
            .and_then(|index| self.physical.get(*index))
    }

    pub fn log_aliasing_report(&self) {
        log::info!("=== Resource Aliasing Report ===");

        for (group_index, group) in self.aliasing_groups.iter().enumerate() {
            log::info!("Physical Resource {group_index}:");
            for resource in &group.resources {
                let name = self
                    .physical_description(*resource)
                    .map(|info| info.name.as_str())
                    .unwrap_or("?");
                log::info!("  - {resource} '{name}'");
            }
        }

        let logical_count = self.lifetimes.len();
        let physical_count = self.aliasing_groups.len();
        let savings = if logical_count > 0 {
            (1.0 - physical_count as f32 / logical_count as f32) * 100.0
        } else {
            0.0
        };
        log::info!(
            "Total: {logical_count} logical → {physical_count} physical ({savings:.1}% savings)"
        );
    }
}

pub(crate) fn bake_plan(
    tasks: &[GraphTask],
    resources: &[GraphResource],
    final_resource: GraphId,
) -> Result<BakePlan> {
    let hash = topology_hash(tasks, resources, final_resource);

    let live = cull(tasks, resources, final_resource);
    let culled_tasks = tasks
        .iter()
        .zip(&live)
        .filter(|(_, alive)| !**alive)
        .map(|(task, _)| task.id())
        .collect::<Vec<_>>();
    for task in culled_tasks.iter().map(|id| &tasks[id.index()]) {
        log::debug!("Culled task '{}'", task.name());
    }

    let order = topological_order(tasks, resources, &live)?;
    let live_resources = live_resources(tasks, &live, final_resource);
    let (physical, resource_link) = synthesize_physical(tasks, resources, &live, &live_resources);
    let steps = synthesize_steps(tasks, resources, &order, final_resource)?;

    let mut task_ranges = FxHashMap::default();
    for step in &steps {
        let task = &tasks[step.task_id.index()];
        for id in touched_resources(task) {
            task_ranges
                .entry(id)
                .and_modify(|range: &mut (GraphId, GraphId)| range.1 = task.id())
                .or_insert((task.id(), task.id()));
        }
    }

    let lifetimes = analyze_lifetimes(tasks, resources, &steps);
    let aliasing_groups = compute_aliasing_groups(&lifetimes, &physical, &resource_link);

    log::debug!(
        "Baked frame graph {hash:#018x}: {} steps, {} culled tasks, {} physical resources",
        steps.len(),
        culled_tasks.len(),
        physical.len()
    );

    Ok(BakePlan {
        hash,
        final_resource,
        steps,
        culled_tasks,
        physical,
        resource_link,
        lifetimes,
        aliasing_groups,
        task_ranges,
    })
}

/// Hash of the declared shape: tasks, their accesses, resource descriptions
/// and the final resource. Physical bindings of retained resources are not
/// part of it so a new swapchain image does not force a rebake.
pub(crate) fn topology_hash(
    tasks: &[GraphTask],
    resources: &[GraphResource],
    final_resource: GraphId,
) -> u64 {
    let mut hash = 0u64;

    for task in tasks {
        hash_combine(&mut hash, content_hash(task.name()));
        hash_combine(&mut hash, content_hash(&task.task_type()));
        hash_combine(&mut hash, content_hash(&task.is_cull_immune()));
        hash_combine(&mut hash, content_hash(task.creates()));
        hash_combine(&mut hash, content_hash(task.reads()));
        hash_combine(&mut hash, content_hash(task.writes()));
        hash_combine(&mut hash, content_hash(&task.pipeline_state()));
    }

    for resource in resources {
        hash_combine(&mut hash, content_hash(resource.name()));
        hash_combine(&mut hash, content_hash(resource.description()));
        hash_combine(&mut hash, content_hash(&resource.is_retained()));
    }

    hash_combine(&mut hash, content_hash(&final_resource));
    hash
}

/// Backward reachability from the final resource. A task survives if it
/// produces a version some surviving task (or the final resource) needs, or
/// if it is cull immune.
fn cull(tasks: &[GraphTask], resources: &[GraphResource], final_resource: GraphId) -> Vec<bool> {
    let mut live = vec![false; tasks.len()];
    let mut visited = FxHashSet::default();

    let mut pending_versions = Vec::new();
    if let Some(resource) = resources.get(final_resource.index()) {
        pending_versions.push((final_resource, resource.version()));
    }
    let mut pending_tasks = tasks
        .iter()
        .filter(|task| task.is_cull_immune())
        .map(|task| task.id().index())
        .collect::<Vec<_>>();

    while !pending_versions.is_empty() || !pending_tasks.is_empty() {
        while let Some((id, version)) = pending_versions.pop() {
            if !visited.insert((id, version)) {
                continue;
            }
            if let Some(producer) = resources[id.index()].producer_of(version) {
                pending_tasks.push(producer.index());
            }
        }

        while let Some(index) = pending_tasks.pop() {
            if live[index] {
                continue;
            }
            live[index] = true;

            let task = &tasks[index];
            for read in task.reads() {
                pending_versions.push((read.id, read.version));
            }
            // writes load the previous contents
            for write in task.writes() {
                if write.version > 0 {
                    pending_versions.push((write.id, write.version - 1));
                }
            }
        }
    }

    live
}

fn live_resources(tasks: &[GraphTask], live: &[bool], final_resource: GraphId) -> FxHashSet<GraphId> {
    let mut used = FxHashSet::default();
    used.insert(final_resource);

    for (task, _) in tasks.iter().zip(live).filter(|(_, alive)| **alive) {
        used.extend(touched_resources(task));
    }

    used
}

fn touched_resources(task: &GraphTask) -> impl Iterator<Item = GraphId> + '_ {
    task.creates()
        .iter()
        .copied()
        .chain(task.writes().iter().map(|handle| handle.id))
        .chain(task.reads().iter().map(|handle| handle.id))
}

/// Producer before readers, readers of a version before the writer of the
/// next one, writers in version order.
fn dependency_edges(
    tasks: &[GraphTask],
    resources: &[GraphResource],
    live: &[bool],
) -> Vec<FxHashSet<usize>> {
    let mut successors = vec![FxHashSet::default(); tasks.len()];
    let is_live = |id: GraphId| live.get(id.index()).copied().unwrap_or(false);

    let mut add_edge = |from: GraphId, to: GraphId| {
        if from != to && is_live(from) && is_live(to) {
            successors[from.index()].insert(to.index());
        }
    };

    for resource in resources {
        for version in 0..=resource.version() {
            let producer = resource.producer_of(version);
            let next_producer = resource.producer_of(version + 1);

            for reader in resource.readers_of(version) {
                if let Some(producer) = producer {
                    add_edge(producer, reader);
                }
                if let Some(next_producer) = next_producer {
                    add_edge(reader, next_producer);
                }
            }

            if let (Some(producer), Some(next_producer)) = (producer, next_producer) {
                add_edge(producer, next_producer);
            }
        }
    }

    successors
}

fn topological_order(
    tasks: &[GraphTask],
    resources: &[GraphResource],
    live: &[bool],
) -> Result<Vec<usize>> {
    let successors = dependency_edges(tasks, resources, live);

    let mut in_degree = vec![0usize; tasks.len()];
    for targets in &successors {
        for &target in targets {
            in_degree[target] += 1;
        }
    }

    let mut ready = (0..tasks.len())
        .filter(|&index| live[index] && in_degree[index] == 0)
        .map(Reverse)
        .collect::<BinaryHeap<_>>();

    let mut order = Vec::with_capacity(tasks.len());
    while let Some(Reverse(index)) = ready.pop() {
        order.push(index);
        for &target in &successors[index] {
            in_degree[target] -= 1;
            if in_degree[target] == 0 {
                ready.push(Reverse(target));
            }
        }
    }

    let live_count = live.iter().filter(|alive| **alive).count();
    if order.len() < live_count {
        let stuck = (0..tasks.len())
            .filter(|&index| live[index] && in_degree[index] > 0)
            .collect::<Vec<_>>();
        let names = stuck
            .iter()
            .map(|&index| format!("'{}'", tasks[index].name()))
            .collect::<Vec<_>>();
        return Err(FrameGraphError::DependencyCycle {
            tasks: stuck.iter().map(|&index| tasks[index].id()).collect(),
            message: format!("Cycle detected between tasks {}", names.join(" → ")),
        });
    }

    Ok(order)
}

fn synthesize_physical(
    tasks: &[GraphTask],
    resources: &[GraphResource],
    live: &[bool],
    live_resources: &FxHashSet<GraphId>,
) -> (Vec<PhysicalResourceInfo>, FxHashMap<GraphId, usize>) {
    let mut physical = Vec::new();
    let mut resource_link = FxHashMap::default();

    for resource in resources.iter().filter(|r| live_resources.contains(&r.id())) {
        let users = tasks
            .iter()
            .zip(live)
            .filter(|(task, alive)| **alive && task.touches(resource.id()))
            .map(|(task, _)| task);

        let description = match resource.description() {
            ResourceDescription::Image(description) => {
                let mut usage = if description.is_depth() {
                    vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC
                } else {
                    vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC
                };
                for task in users {
                    let produces = task.creates().contains(&resource.id())
                        || task.writes_resource(resource.id());
                    usage |= match (task.task_type(), produces) {
                        (TaskType::Graphics, false) => vk::ImageUsageFlags::SAMPLED,
                        (TaskType::Graphics, true) => vk::ImageUsageFlags::empty(),
                        (TaskType::Compute, false) => vk::ImageUsageFlags::SAMPLED,
                        (TaskType::Compute, true) => vk::ImageUsageFlags::STORAGE,
                        (TaskType::Transfer, false) => vk::ImageUsageFlags::TRANSFER_SRC,
                        (TaskType::Transfer, true) => vk::ImageUsageFlags::TRANSFER_DST,
                    };
                }
                PhysicalDescription::Image {
                    description: *description,
                    usage,
                }
            }
            ResourceDescription::Buffer(description) => {
                let mut usage =
                    vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::STORAGE_BUFFER;
                for task in users {
                    if task.task_type() == TaskType::Transfer
                        && (task.creates().contains(&resource.id())
                            || task.writes_resource(resource.id()))
                    {
                        usage |= vk::BufferUsageFlags::TRANSFER_DST;
                    }
                }
                PhysicalDescription::Buffer {
                    description: *description,
                    usage,
                }
            }
        };

        resource_link.insert(resource.id(), physical.len());
        physical.push(PhysicalResourceInfo {
            resource: resource.id(),
            name: resource.name().to_string(),
            retained: resource.is_retained(),
            description,
        });
    }

    (physical, resource_link)
}

fn initial_track(resource: &GraphResource) -> ResourceTrack {
    match resource.retained_binding() {
        Some(RetainedBinding::Image { initial_layout, .. }) => ResourceTrack::new(*initial_layout),
        _ => ResourceTrack::new(vk::ImageLayout::UNDEFINED),
    }
}

fn synthesize_steps(
    tasks: &[GraphTask],
    resources: &[GraphResource],
    order: &[usize],
    final_resource: GraphId,
) -> Result<Vec<PlannedStep>> {
    let mut tracks: FxHashMap<GraphId, ResourceTrack> = FxHashMap::default();
    let mut steps = Vec::with_capacity(order.len());

    for &task_index in order {
        let task = &tasks[task_index];
        let mut step = PlannedStep {
            task_id: task.id(),
            task_type: task.task_type(),
            render_pass: None,
            attachments: Vec::new(),
            clear_values: Vec::new(),
            extent: vk::Extent2D::default(),
            barriers_before: Vec::new(),
            barriers_after: Vec::new(),
            present_step: false,
        };

        let mut accesses: Vec<(GraphId, Access, bool)> = Vec::new();
        for &id in task.creates() {
            accesses.push((id, Access::Write, true));
        }
        for write in task.writes() {
            if !accesses.iter().any(|(id, _, _)| *id == write.id) {
                accesses.push((write.id, Access::Write, false));
            }
        }
        for read in task.reads() {
            if !accesses.iter().any(|(id, _, _)| *id == read.id) {
                accesses.push((read.id, Access::Read, false));
            }
        }

        for (id, access, created) in accesses {
            let resource = &resources[id.index()];
            let track = tracks
                .entry(id)
                .or_insert_with(|| initial_track(resource));

            match resource.description() {
                ResourceDescription::Image(description) => {
                    let access = if task.task_type() == TaskType::Graphics && access == Access::Write
                    {
                        step.attachments.push(id);
                        Access::Attachment
                    } else {
                        access
                    };
                    let required =
                        ResourceState::for_image(task.task_type(), access, description.is_depth());

                    // the render pass itself moves created attachments out of UNDEFINED
                    if created && access == Access::Attachment {
                        track.record(&required);
                    } else if let Some(dependency) = track.transition(&required) {
                        step.barriers_before.push(Barrier::image(
                            id,
                            dependency,
                            aspect_mask_from_format(description.format),
                        ));
                    }
                }
                ResourceDescription::Buffer(_) => {
                    let required = ResourceState::for_buffer(task.task_type(), access);
                    if let Some(dependency) = track.transition(&required) {
                        step.barriers_before.push(Barrier::buffer(id, dependency));
                    }
                }
            }
        }

        if !step.attachments.is_empty() {
            build_render_pass(task, resources, &mut step)?;
        }

        steps.push(step);
    }

    let present_index = steps
        .iter()
        .rposition(|step| tasks[step.task_id.index()].touches(final_resource))
        .ok_or_else(|| {
            let name = resources
                .get(final_resource.index())
                .map(GraphResource::name)
                .unwrap_or("?");
            FrameGraphError::InvalidGraphState(format!(
                "final resource '{name}' is not produced by any task"
            ))
        })?;

    let final_entry = &resources[final_resource.index()];
    let present_step = &mut steps[present_index];
    present_step.present_step = true;
    if let ResourceDescription::Image(description) = final_entry.description() {
        let track = tracks
            .get(&final_resource)
            .copied()
            .unwrap_or_else(|| initial_track(final_entry));
        let required = if final_entry.is_retained() {
            ResourceState::new(
                vk::ImageLayout::PRESENT_SRC_KHR,
                vk::AccessFlags2::NONE,
                vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
            )
        } else {
            ResourceState::new(
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::AccessFlags2::TRANSFER_READ,
                vk::PipelineStageFlags2::BLIT,
            )
        };
        present_step.barriers_after.push(Barrier::image(
            final_resource,
            track.dependency(&required),
            aspect_mask_from_format(description.format),
        ));
    }

    Ok(steps)
}

fn build_render_pass(
    task: &GraphTask,
    resources: &[GraphResource],
    step: &mut PlannedStep,
) -> Result<()> {
    let mut attachments = Vec::with_capacity(step.attachments.len());
    let mut references = Vec::with_capacity(step.attachments.len());
    let mut extent: Option<vk::Extent2D> = None;

    for (index, id) in step.attachments.iter().enumerate() {
        let resource = &resources[id.index()];
        let Some(description) = resource.description().as_image() else {
            continue;
        };

        let attachment_extent = description.extent_2d();
        match extent {
            Some(extent) if extent != attachment_extent => {
                return Err(FrameGraphError::ConflictingDescription {
                    name: resource.name().to_string(),
                    reason: format!(
                        "attachment extent {}x{} differs from {}x{} in task '{}'",
                        attachment_extent.width,
                        attachment_extent.height,
                        extent.width,
                        extent.height,
                        task.name()
                    ),
                });
            }
            _ => extent = Some(attachment_extent),
        }

        let created = task.creates().contains(id);
        let layout = attachment_layout(description.format);
        attachments.push(AttachmentDescription {
            format: description.format,
            samples: description.samples,
            load_op: if created {
                vk::AttachmentLoadOp::CLEAR
            } else {
                vk::AttachmentLoadOp::LOAD
            },
            store_op: vk::AttachmentStoreOp::STORE,
            initial_layout: if created {
                vk::ImageLayout::UNDEFINED
            } else {
                layout
            },
            final_layout: layout,
        });
        references.push(AttachmentRef {
            attachment: index as u32,
            layout,
        });
        step.clear_values.push(description.clear_value);
    }

    step.extent = extent.unwrap_or_default();
    step.render_pass = Some(RenderPassDescription {
        attachments,
        subpasses: vec![Subpass {
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            attachment_refs: references,
        }],
    });
    Ok(())
}

fn analyze_lifetimes(
    tasks: &[GraphTask],
    resources: &[GraphResource],
    steps: &[PlannedStep],
) -> Vec<ResourceLifetime> {
    let mut lifetimes = Vec::new();

    for resource in resources.iter().filter(|resource| {
        resource.is_transient() && resource.description().as_image().is_some()
    }) {
        let mut first_step = None;
        let mut last_step = None;

        for (step_index, step) in steps.iter().enumerate() {
            if tasks[step.task_id.index()].touches(resource.id()) {
                if first_step.is_none() {
                    first_step = Some(step_index);
                }
                last_step = Some(step_index);
            }
        }

        if let (Some(first_step), Some(last_step)) = (first_step, last_step) {
            lifetimes.push(ResourceLifetime {
                resource: resource.id(),
                first_step,
                last_step,
            });
        }
    }

    lifetimes
}

/// Greedy grouping of transient images whose lifetimes never overlap and
/// whose physical descriptions match.
fn compute_aliasing_groups(
    lifetimes: &[ResourceLifetime],
    physical: &[PhysicalResourceInfo],
    resource_link: &FxHashMap<GraphId, usize>,
) -> Vec<AliasingGroup> {
    let mut sorted = lifetimes.to_vec();
    sorted.sort_by_key(|lifetime| lifetime.first_step);

    let mut groups: Vec<(AliasingGroup, Vec<ResourceLifetime>)> = Vec::new();

    for lifetime in sorted {
        let Some(info) = resource_link
            .get(&lifetime.resource)
            .and_then(|index| physical.get(*index))
        else {
            continue;
        };

        let slot = groups.iter_mut().find(|(group, members)| {
            group.description.interchangeable(&info.description)
                && members.iter().all(|member| !member.overlaps(&lifetime))
        });

        match slot {
            Some((group, members)) => {
                group.resources.push(lifetime.resource);
                members.push(lifetime);
            }
            None => groups.push((
                AliasingGroup {
                    description: info.description,
                    resources: vec![lifetime.resource],
                },
                vec![lifetime],
            )),
        }
    }

    groups.into_iter().map(|(group, _)| group).collect()
}
