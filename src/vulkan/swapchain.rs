use super::device::VulkanDevice;
use crate::device::{Device, FenceStatus, Frame, Surface};
use crate::error::{FrameGraphError, Result};
use ash::{khr::swapchain, vk};
use std::sync::Arc;

#[derive(Clone, Copy)]
struct FrameSync {
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
    in_flight: vk::Fence,
}

struct Swapchain {
    swapchain_khr: vk::SwapchainKHR,
    extent: vk::Extent2D,
    format: vk::SurfaceFormatKHR,
    images: Vec<vk::Image>,
}

/// Window swapchain with `frames_in_flight` sets of per-frame sync objects.
/// Swapchain images are blit or render targets and always end in
/// `PRESENT_SRC_KHR`.
pub struct VulkanSurface {
    device: Arc<VulkanDevice>,
    surface_khr: vk::SurfaceKHR,
    loader: swapchain::Device,
    swapchain: Swapchain,
    sync: Vec<FrameSync>,
    current_frame: usize,
    is_swapchain_dirty: bool,
}

impl VulkanSurface {
    pub fn new(
        device: Arc<VulkanDevice>,
        surface_khr: vk::SurfaceKHR,
        extent: vk::Extent2D,
        frames_in_flight: usize,
    ) -> Result<Self> {
        let loader = swapchain::Device::new(device.instance(), device.handle());
        let swapchain = create_swapchain(
            &device,
            &loader,
            surface_khr,
            extent,
            vk::SwapchainKHR::null(),
        )?;
        log::info!("Created swapchain");

        let mut sync = Vec::with_capacity(frames_in_flight);
        for _ in 0..frames_in_flight.max(1) {
            sync.push(FrameSync {
                image_available: device.create_semaphore()?,
                render_finished: device.create_semaphore()?,
                in_flight: device.create_fence(true)?,
            });
        }

        Ok(Self {
            device,
            surface_khr,
            loader,
            swapchain,
            sync,
            current_frame: 0,
            is_swapchain_dirty: false,
        })
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.swapchain.images
    }

    pub fn mark_dirty(&mut self) {
        self.is_swapchain_dirty = true;
    }
}

impl Surface for VulkanSurface {
    fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent
    }

    fn format(&self) -> vk::Format {
        self.swapchain.format.format
    }

    fn frames_in_flight(&self) -> usize {
        self.sync.len()
    }

    fn acquire_next_frame(&mut self, device: &dyn Device, timeout_ns: u64) -> Result<Frame> {
        let sync = self.sync[self.current_frame];
        if device.wait_for_fence(sync.in_flight, timeout_ns)? == FenceStatus::Timeout {
            return Err(FrameGraphError::FenceTimeout { timeout_ns });
        }

        let acquired = unsafe {
            self.loader.acquire_next_image(
                self.swapchain.swapchain_khr,
                timeout_ns,
                sync.image_available,
                vk::Fence::null(),
            )
        };
        let image_index = match acquired {
            Ok((image_index, suboptimal)) => {
                if suboptimal {
                    self.is_swapchain_dirty = true;
                }
                image_index
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                log::info!("Swapchain is out of date");
                self.is_swapchain_dirty = true;
                return Err(FrameGraphError::SurfaceOutOfDate);
            }
            Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => {
                return Err(FrameGraphError::FenceTimeout { timeout_ns });
            }
            Err(error) => return Err(error.into()),
        };

        device.reset_fence(sync.in_flight)?;

        let image = self
            .swapchain
            .images
            .get(image_index as usize)
            .copied()
            .ok_or_else(|| FrameGraphError::Other(format!("invalid swapchain image {image_index}")))?;

        Ok(Frame {
            current_frame: self.current_frame,
            image_index,
            image,
            extent: self.swapchain.extent,
            image_available: sync.image_available,
            render_finished: sync.render_finished,
            in_flight: sync.in_flight,
        })
    }

    fn present(&mut self, frame: &Frame) -> Result<()> {
        self.current_frame = (frame.current_frame + 1) % self.sync.len();

        let wait_semaphores = [frame.render_finished];
        let swapchains = [self.swapchain.swapchain_khr];
        let image_indices = [frame.image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let presented = unsafe {
            self.loader
                .queue_present(self.device.present_queue(), &present_info)
        };
        match presented {
            Ok(false) => Ok(()),
            Ok(true) => {
                self.is_swapchain_dirty = true;
                Ok(())
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.is_swapchain_dirty = true;
                Err(FrameGraphError::SurfaceOutOfDate)
            }
            Err(error) => Err(error.into()),
        }
    }

    fn needs_recreate(&self) -> bool {
        self.is_swapchain_dirty
    }

    fn recreate(&mut self, device: &dyn Device, extent: vk::Extent2D) -> Result<()> {
        log::info!(
            "Recreating the swapchain with dimensions {}x{}",
            extent.width,
            extent.height
        );
        device.wait_idle()?;

        let swapchain = create_swapchain(
            &self.device,
            &self.loader,
            self.surface_khr,
            extent,
            self.swapchain.swapchain_khr,
        )?;
        let old = std::mem::replace(&mut self.swapchain, swapchain);
        unsafe { self.loader.destroy_swapchain(old.swapchain_khr, None) };

        self.is_swapchain_dirty = false;
        Ok(())
    }
}

impl Drop for VulkanSurface {
    fn drop(&mut self) {
        if let Err(error) = self.device.wait_idle() {
            log::error!("Failed to wait for the device before destroying the swapchain: {error}");
        }
        for sync in self.sync.drain(..) {
            self.device.destroy_semaphore(sync.image_available);
            self.device.destroy_semaphore(sync.render_finished);
            self.device.destroy_fence(sync.in_flight);
        }
        unsafe {
            self.loader
                .destroy_swapchain(self.swapchain.swapchain_khr, None);
            self.device
                .surface_loader()
                .destroy_surface(self.surface_khr, None);
        }
    }
}

fn create_swapchain(
    device: &VulkanDevice,
    loader: &swapchain::Device,
    surface_khr: vk::SurfaceKHR,
    requested: vk::Extent2D,
    old_swapchain: vk::SwapchainKHR,
) -> Result<Swapchain> {
    let surface = device.surface_loader();
    let physical_device = device.physical_device();

    let format = {
        let formats =
            unsafe { surface.get_physical_device_surface_formats(physical_device, surface_khr)? };
        let preferred = formats.iter().copied().find(|format| {
            format.format == vk::Format::B8G8R8A8_UNORM
                && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        });
        match (preferred, formats.first()) {
            (Some(format), _) => format,
            (None, Some(format)) if format.format != vk::Format::UNDEFINED => *format,
            _ => vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        }
    };
    log::info!("Swapchain format: {format:?}");

    let present_mode = {
        let present_modes = unsafe {
            surface.get_physical_device_surface_present_modes(physical_device, surface_khr)?
        };
        if present_modes.contains(&vk::PresentModeKHR::MAILBOX) {
            vk::PresentModeKHR::MAILBOX
        } else {
            vk::PresentModeKHR::FIFO
        }
    };
    log::info!("Swapchain present mode: {present_mode:?}");

    let capabilities = unsafe {
        surface.get_physical_device_surface_capabilities(physical_device, surface_khr)?
    };

    let extent = if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        let min = capabilities.min_image_extent;
        let max = capabilities.max_image_extent;
        vk::Extent2D {
            width: requested.width.clamp(min.width, max.width),
            height: requested.height.clamp(min.height, max.height),
        }
    };
    log::info!("Swapchain extent: {extent:?}");

    let mut image_count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        image_count = image_count.min(capabilities.max_image_count);
    }

    let family_indices = device.queue_family_indices();
    let create_info = vk::SwapchainCreateInfoKHR::default()
        .surface(surface_khr)
        .min_image_count(image_count)
        .image_format(format.format)
        .image_color_space(format.color_space)
        .image_extent(extent)
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST);
    let create_info = if family_indices[0] != family_indices[1] {
        create_info
            .image_sharing_mode(vk::SharingMode::CONCURRENT)
            .queue_family_indices(&family_indices)
    } else {
        create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
    }
    .pre_transform(capabilities.current_transform)
    .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
    .present_mode(present_mode)
    .clipped(true)
    .old_swapchain(old_swapchain);

    let swapchain_khr = unsafe { loader.create_swapchain(&create_info, None)? };
    let images = unsafe { loader.get_swapchain_images(swapchain_khr)? };
    log::info!("Swapchain image count: {}", images.len());

    Ok(Swapchain {
        swapchain_khr,
        extent,
        format,
        images,
    })
}
