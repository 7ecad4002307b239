use crate::baked::{BakeContext, BakedFrameGraph};
use crate::builder::FrameGraphBuilder;
use crate::config::EngineConfig;
use crate::deletion_queue::DeletionQueue;
use crate::device::{Device, FenceStatus, Frame, Surface};
use crate::error::{FrameGraphError, Result};
use crate::pipeline_cache::PipelineCache;
use crate::resource_cache::ResourceCache;
use ash::vk;
use std::sync::Arc;

#[derive(Debug)]
pub enum FrameStatus {
    Presented { rebaked: bool },
    /// Nothing was rendered; the condition clears by itself or after a resize.
    Skipped(FrameGraphError),
}

/// Drives one surface: acquires a frame, lets the caller declare the frame
/// graph, bakes it when its shape changed, executes and presents.
pub struct Engine<S: Surface> {
    device: Arc<dyn Device>,
    surface: S,
    config: EngineConfig,
    builder: FrameGraphBuilder,
    baked: Option<BakedFrameGraph>,
    resource_cache: ResourceCache,
    pipeline_cache: PipelineCache,
    deletion_queue: DeletionQueue,
    last_submitted: vk::Fence,
    upload_command_buffer: vk::CommandBuffer,
    upload_fence: vk::Fence,
    upload_pending: bool,
    pending_resize: Option<vk::Extent2D>,
    frame_count: u64,
    bake_count: u64,
    shut_down: bool,
}

impl<S: Surface> Engine<S> {
    pub fn new(device: Arc<dyn Device>, surface: S, config: EngineConfig) -> Result<Self> {
        let info = device.physical_device_info();
        log::info!(
            "Frame graph engine on {} ({} frames in flight)",
            info.name,
            config.frames_in_flight
        );

        let pipeline_cache =
            PipelineCache::new(Arc::clone(&device), config.pipeline_cache_path.clone())?;
        let upload_command_buffer = device
            .allocate_command_buffers(1)?
            .pop()
            .ok_or_else(|| FrameGraphError::Other("no upload command buffer".to_string()))?;
        let upload_fence = device.create_fence(false)?;

        Ok(Self {
            resource_cache: ResourceCache::new(Arc::clone(&device)),
            pipeline_cache,
            device,
            surface,
            config,
            builder: FrameGraphBuilder::new(),
            baked: None,
            deletion_queue: DeletionQueue::new(),
            last_submitted: vk::Fence::null(),
            upload_command_buffer,
            upload_fence,
            upload_pending: false,
            pending_resize: None,
            frame_count: 0,
            bake_count: 0,
            shut_down: false,
        })
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn builder(&self) -> &FrameGraphBuilder {
        &self.builder
    }

    pub fn baked_graph(&self) -> Option<&BakedFrameGraph> {
        self.baked.as_ref()
    }

    pub fn resource_cache(&mut self) -> &mut ResourceCache {
        &mut self.resource_cache
    }

    pub fn pipeline_cache(&mut self) -> &mut PipelineCache {
        &mut self.pipeline_cache
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn bake_count(&self) -> u64 {
        self.bake_count
    }

    pub fn resize(&mut self, extent: vk::Extent2D) {
        self.pending_resize = Some(extent);
    }

    fn recreate_surface(&mut self) -> Result<()> {
        let extent = self
            .pending_resize
            .take()
            .unwrap_or_else(|| self.surface.extent());
        if extent.width == 0 || extent.height == 0 {
            self.pending_resize = Some(extent);
            return Err(FrameGraphError::SurfaceOutOfDate);
        }

        self.device.wait_idle()?;
        self.deletion_queue.flush(self.device.as_ref());
        self.surface.recreate(self.device.as_ref(), extent)?;
        log::info!("Surface recreated at {}x{}", extent.width, extent.height);
        Ok(())
    }

    /// Renders one frame. `update` declares this frame's graph on a freshly
    /// reset builder. Retryable failures come back as [`FrameStatus::Skipped`].
    pub fn render_frame<F>(&mut self, update: F) -> Result<FrameStatus>
    where
        F: FnOnce(&mut FrameGraphBuilder, &Frame) -> Result<()>,
    {
        if self.shut_down {
            return Err(FrameGraphError::InvalidGraphState(
                "engine is shut down".to_string(),
            ));
        }

        if self.pending_resize.is_some() || self.surface.needs_recreate() {
            if let Err(error) = self.recreate_surface() {
                return skip_or_fail(error);
            }
        }

        self.deletion_queue.flush(self.device.as_ref());

        let frame = match self
            .surface
            .acquire_next_frame(self.device.as_ref(), self.config.fence_timeout_ns)
        {
            Ok(frame) => frame,
            Err(error) => return skip_or_fail(error),
        };

        let rebaked = match self.record_and_submit(update, &frame) {
            Ok(rebaked) => rebaked,
            Err(error) => {
                self.release_frame(&frame);
                return Err(error);
            }
        };
        self.last_submitted = frame.in_flight;

        match self.surface.present(&frame) {
            Ok(()) => {}
            Err(error) if error.is_retryable() => {
                log::warn!("Present reported {error}, recreating surface next frame");
            }
            Err(error) => return Err(error),
        }

        self.frame_count += 1;
        Ok(FrameStatus::Presented { rebaked })
    }

    fn record_and_submit<F>(&mut self, update: F, frame: &Frame) -> Result<bool>
    where
        F: FnOnce(&mut FrameGraphBuilder, &Frame) -> Result<()>,
    {
        self.builder.reset();
        update(&mut self.builder, frame)?;
        let hash = self.builder.bake()?.hash;

        let rebaked = self.baked.as_ref().is_none_or(|baked| baked.hash() != hash);
        if rebaked {
            let mut ctx = BakeContext {
                device: &self.device,
                resource_cache: &mut self.resource_cache,
                pipeline_cache: &mut self.pipeline_cache,
                deletion_queue: &mut self.deletion_queue,
                retire_fence: self.last_submitted,
                frames_in_flight: self.surface.frames_in_flight(),
                transient_budget_bytes: self.config.transient_budget_bytes,
                options: self.config.bake,
            };
            let baked = self
                .builder
                .create_frame_graph(&mut ctx, self.baked.take())?;
            self.bake_count += 1;
            log::debug!(
                "Rebaked frame graph {hash:#018x} at frame {}",
                self.frame_count
            );
            self.baked = Some(baked);
        }

        let baked = self.baked.as_mut().ok_or_else(|| {
            FrameGraphError::InvalidGraphState("no baked frame graph".to_string())
        })?;
        baked.execute(&mut self.builder, frame)?;
        Ok(rebaked)
    }

    /// Gives an acquired frame back after a failed recording so its fence
    /// and semaphores stay balanced.
    fn release_frame(&mut self, frame: &Frame) {
        let released = self
            .device
            .submit(
                &[],
                &[(frame.image_available, vk::PipelineStageFlags2::ALL_COMMANDS)],
                &[frame.render_finished],
                frame.in_flight,
            )
            .and_then(|()| self.surface.present(frame));
        if let Err(error) = released {
            log::error!("Failed to release frame {}: {error}", frame.current_frame);
        }
    }

    /// Records and submits one-off work, then blocks until it completed.
    pub fn immediate_submit<F>(&mut self, record: F) -> Result<()>
    where
        F: FnOnce(&dyn Device, vk::CommandBuffer) -> Result<()>,
    {
        let device = self.device.as_ref();
        let timeout_ns = self.config.fence_timeout_ns;

        if self.upload_pending {
            if device.wait_for_fence(self.upload_fence, timeout_ns)? == FenceStatus::Timeout {
                return Err(FrameGraphError::FenceTimeout { timeout_ns });
            }
            device.reset_fence(self.upload_fence)?;
            self.upload_pending = false;
        }

        let cmd = self.upload_command_buffer;
        device.begin_command_buffer(cmd, true)?;
        record(device, cmd)?;
        device.end_command_buffer(cmd)?;
        device.submit(&[cmd], &[], &[], self.upload_fence)?;
        self.upload_pending = true;

        match device.wait_for_fence(self.upload_fence, timeout_ns)? {
            FenceStatus::Signaled => {
                device.reset_fence(self.upload_fence)?;
                self.upload_pending = false;
                Ok(())
            }
            FenceStatus::Timeout => {
                log::warn!("Immediate submit still running after {timeout_ns} ns");
                Err(FrameGraphError::FenceTimeout { timeout_ns })
            }
        }
    }

    /// Waits for the GPU, releases every graph owned object and persists
    /// the pipeline cache. Also runs on drop.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        self.device.wait_idle()?;
        self.baked = None;
        self.deletion_queue.flush_all(self.device.as_ref());
        self.device
            .free_command_buffers(&[self.upload_command_buffer]);
        self.device.destroy_fence(self.upload_fence);
        self.pipeline_cache.save_cache()?;

        log::info!(
            "Engine shut down after {} frames and {} bakes",
            self.frame_count,
            self.bake_count
        );
        Ok(())
    }
}

impl<S: Surface> Drop for Engine<S> {
    fn drop(&mut self) {
        if let Err(error) = self.shutdown() {
            log::error!("Engine shutdown failed: {error}");
        }
    }
}

fn skip_or_fail(error: FrameGraphError) -> Result<FrameStatus> {
    if error.is_retryable() {
        log::warn!("Skipping frame: {error}");
        Ok(FrameStatus::Skipped(error))
    } else {
        Err(error)
    }
}
