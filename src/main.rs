use ash::vk;
use vulkan_framegraph::vulkan::{self, VulkanSurface};
use vulkan_framegraph::{
    ClearValue, Engine, EngineConfig, Frame, FrameGraphBuilder, FrameStatus, ImageDescription,
    Result, TaskType,
};

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let event_loop = winit::event_loop::EventLoop::builder().build()?;
    event_loop.set_control_flow(winit::event_loop::ControlFlow::Poll);
    event_loop.run_app(&mut Context::default())?;
    Ok(())
}

#[derive(Default)]
struct Context {
    window_handle: Option<winit::window::Window>,
    engine: Option<Engine<VulkanSurface>>,
}

impl winit::application::ApplicationHandler for Context {
    fn resumed(&mut self, event_loop: &winit::event_loop::ActiveEventLoop) {
        let mut attributes = winit::window::Window::default_attributes();
        attributes.title = "Vulkan Frame Graph".to_string();
        let window = match event_loop.create_window(attributes) {
            Ok(window) => window,
            Err(error) => {
                log::error!("Failed to create window: {error}");
                event_loop.exit();
                return;
            }
        };

        let size = window.inner_size();
        let extent = vk::Extent2D {
            width: size.width.max(1),
            height: size.height.max(1),
        };
        let config = EngineConfig::default();
        let created = vulkan::create_context(
            &window,
            c"Vulkan Frame Graph",
            extent,
            config.frames_in_flight,
        )
        .and_then(|(device, surface)| Engine::new(device, surface, config));
        match created {
            Ok(engine) => self.engine = Some(engine),
            Err(error) => {
                log::error!("Failed to create renderer: {error}");
                event_loop.exit();
                return;
            }
        }
        self.window_handle = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &winit::event_loop::ActiveEventLoop,
        _window_id: winit::window::WindowId,
        event: winit::event::WindowEvent,
    ) {
        match event {
            winit::event::WindowEvent::CloseRequested => {
                if let Some(mut engine) = self.engine.take() {
                    if let Err(error) = engine.shutdown() {
                        log::error!("Failed to shut down: {error}");
                    }
                }
                event_loop.exit();
            }
            winit::event::WindowEvent::Resized(winit::dpi::PhysicalSize { width, height }) => {
                if width > 0 && height > 0 {
                    if let Some(engine) = self.engine.as_mut() {
                        engine.resize(vk::Extent2D { width, height });
                    }
                }
            }
            winit::event::WindowEvent::RedrawRequested => {
                let (Some(window), Some(engine)) = (self.window_handle.as_ref(), self.engine.as_mut())
                else {
                    return;
                };

                let size = window.inner_size();
                if size.width > 0 && size.height > 0 {
                    match engine.render_frame(declare_frame) {
                        Ok(FrameStatus::Presented { rebaked: true }) => {
                            log::debug!("Frame graph rebaked");
                        }
                        Ok(FrameStatus::Presented { .. }) => {}
                        Ok(FrameStatus::Skipped(reason)) => log::debug!("Frame skipped: {reason}"),
                        Err(error) => log::error!("Failed to draw frame: {error}"),
                    }
                }
                window.request_redraw();
            }
            _ => {}
        }
    }

    fn exiting(&mut self, _event_loop: &winit::event_loop::ActiveEventLoop) {
        if let Some(mut engine) = self.engine.take() {
            if let Err(error) = engine.shutdown() {
                log::error!("Failed to shut down: {error}");
            }
        }
    }
}

/// Clears a color target, lets a second pass load and keep it, and declares
/// a debug pass nothing consumes so it gets culled.
fn declare_frame(builder: &mut FrameGraphBuilder, frame: &Frame) -> Result<()> {
    let extent = frame.extent;

    builder.add_task(
        "Clear",
        |_: &mut (), task| {
            task.create_image(
                "Color",
                ImageDescription::new_2d(extent.width, extent.height, vk::Format::R8G8B8A8_UNORM)
                    .with_clear_value(ClearValue::Color([0.1, 0.1, 0.1, 1.0])),
            )?;
            Ok(())
        },
        |_, _| Ok(()),
        TaskType::Graphics,
        false,
    )?;

    builder.add_task(
        "Overlay",
        |_: &mut (), task| {
            let color = task
                .resource("Color")
                .ok_or("Overlay needs the Color target")?;
            task.write(color)?;
            Ok(())
        },
        |_, pass| {
            log::trace!("Recording overlay at {}x{}", pass.extent.width, pass.extent.height);
            Ok(())
        },
        TaskType::Graphics,
        false,
    )?;

    builder.add_task(
        "Debug",
        |_: &mut (), task| {
            task.create_image(
                "DebugView",
                ImageDescription::new_2d(extent.width, extent.height, vk::Format::R8G8B8A8_UNORM),
            )?;
            Ok(())
        },
        |_, _| Ok(()),
        TaskType::Graphics,
        false,
    )?;

    let color = builder
        .resource_handle("Color")
        .ok_or("Color target was not declared")?;
    builder.set_final_resource(color.id)
}
