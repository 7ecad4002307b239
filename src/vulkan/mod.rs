mod device;
mod instance;
mod swapchain;

pub use device::VulkanDevice;
pub use swapchain::VulkanSurface;

use crate::error::Result;
use ash::vk;
use std::ffi::CStr;
use std::sync::Arc;

pub fn create_context<W>(
    window: &W,
    application_name: &CStr,
    extent: vk::Extent2D,
    frames_in_flight: usize,
) -> Result<(Arc<VulkanDevice>, VulkanSurface)>
where
    W: raw_window_handle::HasDisplayHandle + raw_window_handle::HasWindowHandle,
{
    let (device, surface_khr) = VulkanDevice::new(window, application_name, cfg!(debug_assertions))?;
    let device = Arc::new(device);
    let surface = VulkanSurface::new(Arc::clone(&device), surface_khr, extent, frames_in_flight)?;
    Ok((device, surface))
}
