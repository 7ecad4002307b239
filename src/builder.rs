use crate::bake::{BakePlan, bake_plan, topology_hash};
use crate::baked::{BakeContext, BakedFrameGraph};
use crate::device::{PhysicalBuffer, PhysicalImage};
use crate::error::{FrameGraphError, Result};
use crate::resource::{
    BufferDescription, GraphId, GraphResource, ImageDescription, ResourceDescription,
    ResourceHandle, RetainedBinding,
};
use crate::task::{GraphTask, GraphTaskBuilder, PassContext, TaskType};
use ash::vk;
use std::any::Any;

/// Collects one frame's tasks and resources and bakes them into an
/// executable [`BakedFrameGraph`].
///
/// Setup callbacks run inside [`FrameGraphBuilder::add_task`], so every
/// resource a task declares is visible to the tasks added after it.
#[derive(Debug, Default)]
pub struct FrameGraphBuilder {
    tasks: Vec<GraphTask>,
    resources: Vec<GraphResource>,
    next_resource_id: u32,
    final_resource: Option<GraphId>,
    plan: Option<BakePlan>,
}

impl FrameGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_mutable(&self, action: &str) -> Result<()> {
        if self.plan.is_some() {
            return Err(FrameGraphError::InvalidGraphState(format!(
                "cannot {action} after bake, call reset() first"
            )));
        }
        Ok(())
    }

    pub fn add_task<T, S, E>(
        &mut self,
        name: &str,
        setup: S,
        mut execute: E,
        task_type: TaskType,
        cull_immune: bool,
    ) -> Result<&GraphTask>
    where
        T: Default + 'static,
        S: FnOnce(&mut T, &mut GraphTaskBuilder) -> Result<()>,
        E: FnMut(&T, &mut PassContext) -> Result<()> + 'static,
    {
        self.ensure_mutable("add a task")?;
        if self.tasks.iter().any(|task| task.name() == name) {
            return Err(FrameGraphError::InvalidGraphState(format!(
                "task '{name}' is already declared"
            )));
        }

        let id = GraphId::new(self.tasks.len() as u32);
        let mut task = GraphTask::new(id, name, task_type, cull_immune, Box::new(()));
        let mut data = T::default();

        // a failed setup must not leave half-declared accesses behind
        let snapshot = (self.resources.clone(), self.next_resource_id);
        let outcome = {
            let mut builder =
                GraphTaskBuilder::new(&mut task, &mut self.resources, &mut self.next_resource_id);
            setup(&mut data, &mut builder)
        };
        if let Err(error) = outcome {
            (self.resources, self.next_resource_id) = snapshot;
            return Err(error);
        }

        task.set_data(Box::new(data));
        let task_name = name.to_string();
        task.set_execute(Box::new(move |data: &dyn Any, ctx: &mut PassContext| {
            match data.downcast_ref::<T>() {
                Some(data) => execute(data, ctx),
                None => Err(FrameGraphError::Other(format!(
                    "task '{task_name}' carries data of an unexpected type"
                ))),
            }
        }));

        self.tasks.push(task);
        Ok(&self.tasks[id.index()])
    }

    fn add_retained(
        &mut self,
        name: &str,
        description: ResourceDescription,
        binding: RetainedBinding,
    ) -> Result<ResourceHandle> {
        self.ensure_mutable("retain a resource")?;
        if self.resources.iter().any(|resource| resource.name() == name) {
            return Err(FrameGraphError::InvalidGraphState(format!(
                "resource '{name}' is already declared in this cycle"
            )));
        }

        let id = GraphId::new(self.next_resource_id);
        self.next_resource_id += 1;
        let resource = GraphResource::new_retained(id, name, description, binding);
        let handle = resource.handle();
        self.resources.push(resource);
        Ok(handle)
    }

    /// Registers an externally owned image, such as the acquired swapchain
    /// image. The graph never allocates or frees it.
    pub fn set_retained_image(
        &mut self,
        name: &str,
        description: ImageDescription,
        image: PhysicalImage,
        initial_layout: vk::ImageLayout,
    ) -> Result<ResourceHandle> {
        self.add_retained(
            name,
            ResourceDescription::Image(description),
            RetainedBinding::Image {
                image,
                initial_layout,
            },
        )
    }

    pub fn set_retained_buffer(
        &mut self,
        name: &str,
        description: BufferDescription,
        buffer: PhysicalBuffer,
    ) -> Result<ResourceHandle> {
        self.add_retained(
            name,
            ResourceDescription::Buffer(description),
            RetainedBinding::Buffer { buffer },
        )
    }

    /// Points an already declared retained resource at a new physical
    /// object. Allowed after bake since bindings are not part of the topology.
    pub fn rebind_retained(&mut self, id: GraphId, binding: RetainedBinding) -> Result<()> {
        let resource = self
            .resources
            .get_mut(id.index())
            .filter(|resource| resource.is_retained())
            .ok_or_else(|| FrameGraphError::InvalidResourceId {
                id,
                reason: "not a retained resource".to_string(),
            })?;
        resource.rebind(binding);
        Ok(())
    }

    pub fn set_final_resource(&mut self, id: GraphId) -> Result<()> {
        self.ensure_mutable("change the final resource")?;
        if !self.has_resource(id) {
            return Err(FrameGraphError::InvalidResourceId {
                id,
                reason: "final resource was never declared".to_string(),
            });
        }
        self.final_resource = Some(id);
        Ok(())
    }

    pub fn final_resource(&self) -> Option<GraphId> {
        self.final_resource
    }

    pub fn reset(&mut self) {
        self.tasks.clear();
        self.resources.clear();
        self.next_resource_id = 0;
        self.final_resource = None;
        self.plan = None;
    }

    pub fn tasks(&self) -> &[GraphTask] {
        &self.tasks
    }

    pub fn resources(&self) -> &[GraphResource] {
        &self.resources
    }

    pub fn has_task(&self, id: GraphId) -> bool {
        id.index() < self.tasks.len()
    }

    pub fn has_task_named(&self, name: &str) -> bool {
        self.tasks.iter().any(|task| task.name() == name)
    }

    pub fn has_resource(&self, id: GraphId) -> bool {
        id.index() < self.resources.len()
    }

    pub fn has_resource_named(&self, name: &str) -> bool {
        self.resources.iter().any(|resource| resource.name() == name)
    }

    pub fn get_task(&self, id: GraphId) -> Result<&GraphTask> {
        self.tasks
            .get(id.index())
            .ok_or_else(|| FrameGraphError::InvalidTaskId {
                id,
                reason: "task was never declared".to_string(),
            })
    }

    pub fn get_task_by_name(&self, name: &str) -> Option<&GraphTask> {
        self.tasks.iter().find(|task| task.name() == name)
    }

    pub fn get_resource(&self, id: GraphId) -> Result<&GraphResource> {
        self.resources
            .get(id.index())
            .ok_or_else(|| FrameGraphError::InvalidResourceId {
                id,
                reason: "resource was never declared".to_string(),
            })
    }

    pub fn get_resource_by_name(&self, name: &str) -> Option<&GraphResource> {
        self.resources.iter().find(|resource| resource.name() == name)
    }

    pub fn resource_handle(&self, name: &str) -> Option<ResourceHandle> {
        self.get_resource_by_name(name).map(GraphResource::handle)
    }

    pub(crate) fn task_mut(&mut self, id: GraphId) -> Option<&mut GraphTask> {
        self.tasks.get_mut(id.index())
    }

    pub fn topology_hash(&self) -> Result<u64> {
        let final_resource = self.require_final_resource()?;
        Ok(topology_hash(&self.tasks, &self.resources, final_resource))
    }

    fn require_final_resource(&self) -> Result<GraphId> {
        self.final_resource.ok_or_else(|| {
            FrameGraphError::InvalidGraphState("final resource is not set".to_string())
        })
    }

    /// Culls, orders and plans the declared graph. Baking twice without a
    /// reset returns the existing plan.
    pub fn bake(&mut self) -> Result<&BakePlan> {
        let final_resource = self.require_final_resource()?;

        if self.plan.is_none() {
            let plan = bake_plan(&self.tasks, &self.resources, final_resource)?;
            for resource in &mut self.resources {
                let range = plan.task_ranges.get(&resource.id());
                resource.set_task_range(range.map(|range| range.0), range.map(|range| range.1));
            }
            self.plan = Some(plan);
        }

        self.plan
            .as_ref()
            .ok_or_else(|| FrameGraphError::InvalidGraphState("bake produced no plan".to_string()))
    }

    pub fn plan(&self) -> Option<&BakePlan> {
        self.plan.as_ref()
    }

    pub fn is_baked(&self) -> bool {
        self.plan.is_some()
    }

    /// Realizes the current plan on the device. Physical transient resources
    /// of `old` are taken over when the topology hash is unchanged; whatever
    /// `old` still owns is retired through the deletion queue.
    pub fn create_frame_graph(
        &self,
        ctx: &mut BakeContext,
        old: Option<BakedFrameGraph>,
    ) -> Result<BakedFrameGraph> {
        let plan = self.plan.as_ref().ok_or_else(|| {
            FrameGraphError::InvalidGraphState("create_frame_graph called before bake".to_string())
        })?;
        BakedFrameGraph::new(plan, &self.tasks, ctx, old)
    }

    pub fn export_graphviz(&self) -> String {
        let mut dot = String::from("digraph FrameGraph {\n");
        dot.push_str("  rankdir=LR;\n");

        let culled = self
            .plan
            .as_ref()
            .map(|plan| plan.culled_tasks.as_slice())
            .unwrap_or_default();

        for task in &self.tasks {
            let style = if culled.contains(&task.id()) {
                "dashed"
            } else {
                "solid"
            };
            dot.push_str(&format!(
                "  t{} [label=\"{} ({:?})\", shape=box, style={}];\n",
                task.id().index(),
                task.name(),
                task.task_type(),
                style
            ));
        }

        for resource in &self.resources {
            let shape = if resource.is_retained() {
                "doubleoctagon"
            } else {
                "ellipse"
            };
            let pen = if Some(resource.id()) == self.final_resource {
                ", penwidth=2"
            } else {
                ""
            };
            dot.push_str(&format!(
                "  r{} [label=\"{}\", shape={}{}];\n",
                resource.id().index(),
                resource.name(),
                shape,
                pen
            ));
        }

        for task in &self.tasks {
            let t = task.id().index();
            for id in task.creates() {
                dot.push_str(&format!("  t{t} -> r{} [style=bold, label=\"v0\"];\n", id.index()));
            }
            for handle in task.writes() {
                dot.push_str(&format!(
                    "  t{t} -> r{} [style=bold, label=\"v{}\"];\n",
                    handle.id.index(),
                    handle.version
                ));
            }
            for handle in task.reads() {
                dot.push_str(&format!(
                    "  r{} -> t{t} [label=\"v{}\"];\n",
                    handle.id.index(),
                    handle.version
                ));
            }
        }

        dot.push_str("}\n");
        dot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::Barrier;

    #[derive(Default)]
    struct NoData;

    fn color() -> ImageDescription {
        ImageDescription::new_2d(800, 600, vk::Format::R8G8B8A8_UNORM)
    }

    fn noop(_: &NoData, _: &mut PassContext) -> Result<()> {
        Ok(())
    }

    fn creator(builder: &mut FrameGraphBuilder, task: &str, resource: &str) -> GraphId {
        let resource = resource.to_string();
        builder
            .add_task(
                task,
                move |_: &mut NoData, task| {
                    task.create_image(&resource, color())?;
                    Ok(())
                },
                noop,
                TaskType::Graphics,
                false,
            )
            .unwrap()
            .id()
    }

    fn step_ids(plan: &BakePlan) -> Vec<GraphId> {
        plan.steps.iter().map(|step| step.task_id).collect()
    }

    #[test]
    fn test_single_forward_task() {
        let mut builder = FrameGraphBuilder::new();
        creator(&mut builder, "Forward", "Backbuffer");
        let backbuffer = builder.resource_handle("Backbuffer").unwrap();
        builder.set_final_resource(backbuffer.id).unwrap();

        let plan = builder.bake().unwrap();
        assert_eq!(plan.steps.len(), 1);

        let step = &plan.steps[0];
        assert!(step.barriers_before.is_empty());
        assert!(step.present_step);
        assert_eq!(step.barriers_after.len(), 1);
        assert_eq!(step.barriers_after[0].resource(), backbuffer.id);
        assert_eq!(
            step.barriers_after[0].old_layout(),
            Some(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        );
        assert_eq!(
            step.barriers_after[0].new_layout(),
            Some(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
        );

        let render_pass = step.render_pass.as_ref().unwrap();
        assert_eq!(render_pass.attachments[0].load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(step.extent, vk::Extent2D { width: 800, height: 600 });
    }

    #[test]
    fn test_sampled_dependency_gets_layout_transition() {
        let mut builder = FrameGraphBuilder::new();
        let a = creator(&mut builder, "A", "R");
        let r = builder.resource_handle("R").unwrap();
        let b = builder
            .add_task(
                "B",
                move |_: &mut NoData, task| {
                    task.read(r)?;
                    task.create_image("S", color())?;
                    Ok(())
                },
                noop,
                TaskType::Graphics,
                false,
            )
            .unwrap()
            .id();
        let s = builder.resource_handle("S").unwrap();
        builder.set_final_resource(s.id).unwrap();

        let plan = builder.bake().unwrap();
        assert_eq!(step_ids(plan), vec![a, b]);

        let transition = plan.steps[1]
            .barriers_before
            .iter()
            .find(|barrier| barrier.resource() == r.id)
            .unwrap();
        assert_eq!(
            transition.old_layout(),
            Some(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        );
        assert_eq!(
            transition.new_layout(),
            Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        );
        assert!(plan.steps[0].barriers_after.is_empty());
        assert!(plan.steps[1].present_step);
    }

    fn barrier_on(plan: &BakePlan, step: usize, resource: GraphId) -> Option<Barrier> {
        plan.steps[step]
            .barriers_before
            .iter()
            .copied()
            .find(|barrier| barrier.resource() == resource)
    }

    #[test]
    fn test_readers_in_several_stages_are_synchronized() {
        let mut builder = FrameGraphBuilder::new();
        let a = creator(&mut builder, "A", "R");
        let r = builder.resource_handle("R").unwrap();
        let b = builder
            .add_task(
                "B",
                move |_: &mut NoData, task| {
                    task.read(r)?;
                    task.create_image("S", color())?;
                    Ok(())
                },
                noop,
                TaskType::Graphics,
                false,
            )
            .unwrap()
            .id();
        let s = builder.resource_handle("S").unwrap();
        let c = builder
            .add_task(
                "C",
                move |_: &mut NoData, task| {
                    task.read(r)?;
                    task.write(s)?;
                    Ok(())
                },
                noop,
                TaskType::Compute,
                false,
            )
            .unwrap()
            .id();
        let s = builder.resource_handle("S").unwrap();
        let d = builder
            .add_task(
                "D",
                move |_: &mut NoData, task| {
                    task.read(s)?;
                    task.write(r)?;
                    Ok(())
                },
                noop,
                TaskType::Transfer,
                false,
            )
            .unwrap()
            .id();
        let r = builder.resource_handle("R").unwrap();
        builder.set_final_resource(r.id).unwrap();

        let plan = builder.bake().unwrap();
        assert_eq!(step_ids(plan), vec![a, b, c, d]);

        // the compute read must wait on A's color write even though B already
        // moved R into the sampled layout
        let Some(Barrier::Image {
            src_stage,
            dst_stage,
            src_access,
            old_layout,
            new_layout,
            ..
        }) = barrier_on(plan, 2, r.id)
        else {
            panic!("compute read of R has no barrier");
        };
        assert!(src_stage.contains(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT));
        assert!(src_access.contains(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE));
        assert!(dst_stage.contains(vk::PipelineStageFlags2::COMPUTE_SHADER));
        assert_eq!(old_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

        // the transfer write must wait on both earlier readers
        let Some(Barrier::Image {
            src_stage,
            new_layout,
            ..
        }) = barrier_on(plan, 3, r.id)
        else {
            panic!("transfer write of R has no barrier");
        };
        assert!(src_stage.contains(
            vk::PipelineStageFlags2::FRAGMENT_SHADER | vk::PipelineStageFlags2::COMPUTE_SHADER
        ));
        assert_eq!(new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    }

    #[test]
    fn test_unreachable_task_is_culled() {
        let mut builder = FrameGraphBuilder::new();
        let a = creator(&mut builder, "A", "R");
        let b = creator(&mut builder, "B", "Final");
        let unused = builder.resource_handle("R").unwrap().id;
        let final_id = builder.resource_handle("Final").unwrap().id;
        builder.set_final_resource(final_id).unwrap();

        let plan = builder.bake().unwrap();
        assert_eq!(step_ids(plan), vec![b]);
        assert_eq!(plan.culled_tasks, vec![a]);
        assert!(plan.physical_description(unused).is_none());
    }

    #[test]
    fn test_cull_immune_task_survives() {
        let mut builder = FrameGraphBuilder::new();
        let stats = builder
            .add_task(
                "Stats",
                |_: &mut NoData, task| {
                    task.create_buffer("Counters", BufferDescription { size: 256 })?;
                    Ok(())
                },
                noop,
                TaskType::Compute,
                true,
            )
            .unwrap()
            .id();
        let forward = creator(&mut builder, "Forward", "Backbuffer");
        let final_id = builder.resource_handle("Backbuffer").unwrap().id;
        builder.set_final_resource(final_id).unwrap();

        let plan = builder.bake().unwrap();
        assert_eq!(step_ids(plan), vec![stats, forward]);
        assert!(plan.culled_tasks.is_empty());
    }

    #[test]
    fn test_producers_precede_readers() {
        let mut builder = FrameGraphBuilder::new();
        creator(&mut builder, "GBuffer", "Albedo");
        creator(&mut builder, "Shadows", "ShadowMap");
        let albedo = builder.resource_handle("Albedo").unwrap();
        let shadow = builder.resource_handle("ShadowMap").unwrap();
        builder
            .add_task(
                "Lighting",
                move |_: &mut NoData, task| {
                    task.read(albedo)?;
                    task.read(shadow)?;
                    task.create_image("Lit", color())?;
                    Ok(())
                },
                noop,
                TaskType::Graphics,
                false,
            )
            .unwrap();
        let lit = builder.resource_handle("Lit").unwrap();
        builder
            .add_task(
                "Tonemap",
                move |_: &mut NoData, task| {
                    task.read(lit)?;
                    task.create_image("Backbuffer", color())?;
                    Ok(())
                },
                noop,
                TaskType::Graphics,
                false,
            )
            .unwrap();
        let final_id = builder.resource_handle("Backbuffer").unwrap().id;
        builder.set_final_resource(final_id).unwrap();

        let plan = builder.bake().unwrap().clone();
        for resource in builder.resources() {
            for version in 0..=resource.version() {
                let Some(producer) = resource.producer_of(version) else {
                    continue;
                };
                let Some(producer_step) = plan.step_index(producer) else {
                    continue;
                };
                for reader in resource.readers_of(version) {
                    if let Some(reader_step) = plan.step_index(reader) {
                        assert!(producer_step < reader_step);
                    }
                }
            }
        }

        let names = plan
            .steps
            .iter()
            .map(|step| builder.get_task(step.task_id).unwrap().name().to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, ["GBuffer", "Shadows", "Lighting", "Tonemap"]);
    }

    #[test]
    fn test_read_of_old_version_keeps_old_producer() {
        let mut builder = FrameGraphBuilder::new();
        let first = creator(&mut builder, "First", "R");
        let original = builder.resource_handle("R").unwrap();

        let overwrite = builder
            .add_task(
                "Overwrite",
                move |_: &mut NoData, task| {
                    task.write(original)?;
                    Ok(())
                },
                noop,
                TaskType::Graphics,
                false,
            )
            .unwrap()
            .id();
        let late = builder
            .add_task(
                "LateReader",
                move |_: &mut NoData, task| {
                    task.read(original)?;
                    Ok(())
                },
                noop,
                TaskType::Compute,
                true,
            )
            .unwrap()
            .id();
        builder.set_final_resource(original.id).unwrap();

        let resource = builder.get_resource(original.id).unwrap();
        assert_eq!(resource.version(), 1);
        assert_eq!(resource.producer_of(0), Some(first));
        assert_eq!(resource.producer_of(1), Some(overwrite));
        assert_eq!(resource.readers_of(0).collect::<Vec<_>>(), vec![late]);

        let plan = builder.bake().unwrap();
        assert_eq!(step_ids(plan), vec![first, late, overwrite]);
    }

    #[test]
    fn test_write_of_stale_handle_fails() {
        let mut builder = FrameGraphBuilder::new();
        creator(&mut builder, "First", "R");
        let original = builder.resource_handle("R").unwrap();
        builder
            .add_task(
                "Second",
                move |_: &mut NoData, task| {
                    task.write(original)?;
                    Ok(())
                },
                noop,
                TaskType::Graphics,
                false,
            )
            .unwrap();

        let error = builder
            .add_task(
                "Third",
                move |_: &mut NoData, task| {
                    task.write(original)?;
                    Ok(())
                },
                noop,
                TaskType::Graphics,
                false,
            )
            .unwrap_err();
        assert!(matches!(
            error,
            FrameGraphError::StaleResourceVersion {
                current: 1,
                got: 0,
                ..
            }
        ));
        assert!(!builder.has_task_named("Third"));
        assert_eq!(builder.get_resource(original.id).unwrap().writers().len(), 1);
    }

    #[test]
    fn test_failed_setup_rolls_back_resources() {
        let mut builder = FrameGraphBuilder::new();
        let result = builder.add_task(
            "Broken",
            |_: &mut NoData, task| {
                task.create_image("Scratch", color())?;
                Err(FrameGraphError::Other("setup failed".to_string()))
            },
            noop,
            TaskType::Graphics,
            false,
        );
        assert!(result.is_err());
        assert!(!builder.has_resource_named("Scratch"));
        assert!(builder.tasks().is_empty());
    }

    #[test]
    fn test_undeclared_read_is_rejected() {
        let mut builder = FrameGraphBuilder::new();
        let bogus = ResourceHandle::new(GraphId::new(42), 0);
        let error = builder
            .add_task(
                "Reader",
                move |_: &mut NoData, task| {
                    task.read(bogus)?;
                    Ok(())
                },
                noop,
                TaskType::Graphics,
                false,
            )
            .unwrap_err();
        assert!(matches!(error, FrameGraphError::InvalidResourceId { .. }));
    }

    #[test]
    fn test_bake_without_final_resource_fails() {
        let mut builder = FrameGraphBuilder::new();
        creator(&mut builder, "Forward", "Backbuffer");
        assert!(matches!(
            builder.bake(),
            Err(FrameGraphError::InvalidGraphState(_))
        ));
    }

    #[test]
    fn test_add_task_after_bake_fails_until_reset() {
        let mut builder = FrameGraphBuilder::new();
        creator(&mut builder, "Forward", "Backbuffer");
        let final_id = builder.resource_handle("Backbuffer").unwrap().id;
        builder.set_final_resource(final_id).unwrap();
        builder.bake().unwrap();

        let error = builder
            .add_task(
                "Late",
                |_: &mut NoData, _| Ok(()),
                noop,
                TaskType::Graphics,
                false,
            )
            .unwrap_err();
        assert!(matches!(error, FrameGraphError::InvalidGraphState(_)));

        builder.reset();
        assert!(!builder.is_baked());
        creator(&mut builder, "Late", "Backbuffer");
        assert!(builder.has_task_named("Late"));
    }

    #[test]
    fn test_topology_hash_is_stable_across_rebuilds() {
        let declare = |builder: &mut FrameGraphBuilder, image: u64| {
            use ash::vk::Handle;
            let swapchain = builder
                .set_retained_image(
                    "Swapchain",
                    ImageDescription::new_2d(800, 600, vk::Format::B8G8R8A8_UNORM),
                    PhysicalImage {
                        image: vk::Image::from_raw(image),
                        view: vk::ImageView::from_raw(image + 100),
                        format: vk::Format::B8G8R8A8_UNORM,
                        extent: vk::Extent3D {
                            width: 800,
                            height: 600,
                            depth: 1,
                        },
                    },
                    vk::ImageLayout::UNDEFINED,
                )
                .unwrap();
            builder
                .add_task(
                    "Forward",
                    move |_: &mut NoData, task| {
                        task.write(swapchain)?;
                        Ok(())
                    },
                    noop,
                    TaskType::Graphics,
                    false,
                )
                .unwrap();
            builder.set_final_resource(swapchain.id).unwrap();
            builder.bake().unwrap().hash
        };

        let mut builder = FrameGraphBuilder::new();
        let first = declare(&mut builder, 1);
        builder.reset();
        let second = declare(&mut builder, 2);
        assert_eq!(first, second);

        builder.reset();
        creator(&mut builder, "Forward", "Backbuffer");
        let final_id = builder.resource_handle("Backbuffer").unwrap().id;
        builder.set_final_resource(final_id).unwrap();
        assert_ne!(builder.bake().unwrap().hash, first);
    }

    #[test]
    fn test_retained_final_resource_is_presented() {
        use ash::vk::Handle;
        let mut builder = FrameGraphBuilder::new();
        let swapchain = builder
            .set_retained_image(
                "Swapchain",
                ImageDescription::new_2d(640, 480, vk::Format::B8G8R8A8_UNORM),
                PhysicalImage {
                    image: vk::Image::from_raw(9),
                    view: vk::ImageView::from_raw(10),
                    format: vk::Format::B8G8R8A8_UNORM,
                    extent: vk::Extent3D {
                        width: 640,
                        height: 480,
                        depth: 1,
                    },
                },
                vk::ImageLayout::UNDEFINED,
            )
            .unwrap();
        builder
            .add_task(
                "Forward",
                move |_: &mut NoData, task| {
                    task.write(swapchain)?;
                    Ok(())
                },
                noop,
                TaskType::Graphics,
                false,
            )
            .unwrap();
        builder.set_final_resource(swapchain.id).unwrap();

        let plan = builder.bake().unwrap();
        let step = &plan.steps[0];
        let render_pass = step.render_pass.as_ref().unwrap();
        assert_eq!(render_pass.attachments[0].load_op, vk::AttachmentLoadOp::LOAD);
        assert!(matches!(
            step.barriers_before[..],
            [Barrier::Image {
                old_layout: vk::ImageLayout::UNDEFINED,
                new_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                ..
            }]
        ));
        assert_eq!(
            step.barriers_after[0].new_layout(),
            Some(vk::ImageLayout::PRESENT_SRC_KHR)
        );
    }

    #[test]
    fn test_mismatched_attachment_extents_conflict() {
        let mut builder = FrameGraphBuilder::new();
        builder
            .add_task(
                "Forward",
                |_: &mut NoData, task| {
                    task.create_image("Color", color())?;
                    task.create_image(
                        "Depth",
                        ImageDescription::new_2d(1024, 1024, vk::Format::D32_SFLOAT),
                    )?;
                    Ok(())
                },
                noop,
                TaskType::Graphics,
                false,
            )
            .unwrap();
        let final_id = builder.resource_handle("Color").unwrap().id;
        builder.set_final_resource(final_id).unwrap();

        assert!(matches!(
            builder.bake(),
            Err(FrameGraphError::ConflictingDescription { .. })
        ));
    }

    #[test]
    fn test_old_version_reader_of_dependent_resource_is_a_cycle() {
        let mut builder = FrameGraphBuilder::new();
        creator(&mut builder, "First", "X");
        let x0 = builder.resource_handle("X").unwrap();
        builder
            .add_task(
                "Second",
                move |_: &mut NoData, task| {
                    task.write(x0)?;
                    task.create_image("Y", color())?;
                    Ok(())
                },
                noop,
                TaskType::Graphics,
                false,
            )
            .unwrap();
        let y = builder.resource_handle("Y").unwrap();
        builder
            .add_task(
                "Third",
                move |_: &mut NoData, task| {
                    task.read(y)?;
                    task.read(x0)?;
                    task.create_image("Out", color())?;
                    Ok(())
                },
                noop,
                TaskType::Graphics,
                false,
            )
            .unwrap();
        let out = builder.resource_handle("Out").unwrap();
        builder.set_final_resource(out.id).unwrap();

        match builder.bake() {
            Err(FrameGraphError::DependencyCycle { tasks, .. }) => assert_eq!(tasks.len(), 2),
            other => panic!("expected a cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_usage_synthesis() {
        let mut builder = FrameGraphBuilder::new();
        creator(&mut builder, "Scene", "Hdr");
        let hdr = builder.resource_handle("Hdr").unwrap();
        builder
            .add_task(
                "Bloom",
                move |_: &mut NoData, task| {
                    task.read(hdr)?;
                    task.create_image("Bloom", color())?;
                    Ok(())
                },
                noop,
                TaskType::Compute,
                false,
            )
            .unwrap();
        let bloom = builder.resource_handle("Bloom").unwrap();
        builder.set_final_resource(bloom.id).unwrap();

        let plan = builder.bake().unwrap();
        let usage_of = |id: GraphId| match plan.physical_description(id).unwrap().description {
            crate::bake::PhysicalDescription::Image { usage, .. } => usage,
            crate::bake::PhysicalDescription::Buffer { .. } => unreachable!(),
        };
        assert!(usage_of(hdr.id).contains(
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED
        ));
        assert!(usage_of(bloom.id).contains(
            vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC
        ));
    }

    #[test]
    fn test_graphviz_export() {
        let mut builder = FrameGraphBuilder::new();
        creator(&mut builder, "Unused", "Scratch");
        creator(&mut builder, "Forward", "Backbuffer");
        let final_id = builder.resource_handle("Backbuffer").unwrap().id;
        builder.set_final_resource(final_id).unwrap();
        builder.bake().unwrap();

        let dot = builder.export_graphviz();
        assert!(dot.contains("digraph FrameGraph"));
        assert!(dot.contains("label=\"Unused (Graphics)\", shape=box, style=dashed"));
        assert!(dot.contains("label=\"Backbuffer\", shape=ellipse, penwidth=2"));
        assert!(dot.contains("t1 -> r1"));
    }

    #[test]
    fn test_lookup_accessors() {
        let mut builder = FrameGraphBuilder::new();
        let forward = creator(&mut builder, "Forward", "Backbuffer");

        assert!(builder.has_task(forward));
        assert!(!builder.has_task(GraphId::new(5)));
        assert_eq!(builder.get_task_by_name("Forward").unwrap().id(), forward);
        assert!(builder.get_task(GraphId::new(5)).is_err());

        let backbuffer = builder.get_resource_by_name("Backbuffer").unwrap();
        assert_eq!(backbuffer.creator(), Some(forward));
        assert!(builder.has_resource(backbuffer.id()));
        assert!(builder.get_resource(GraphId::new(9)).is_err());
    }
}
