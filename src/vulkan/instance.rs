use crate::error::{FrameGraphError, Result};
use ash::{ext::debug_utils, khr::swapchain, vk};
use std::ffi::CStr;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

pub(crate) fn other(error: impl std::fmt::Display) -> FrameGraphError {
    FrameGraphError::Other(error.to_string())
}

pub(crate) fn load_entry() -> Result<ash::Entry> {
    unsafe { ash::Entry::load() }.map_err(other)
}

fn validation_available(entry: &ash::Entry) -> Result<bool> {
    let layers = unsafe { entry.enumerate_instance_layer_properties()? };
    Ok(layers
        .iter()
        .any(|layer| layer.layer_name_as_c_str() == Ok(VALIDATION_LAYER)))
}

/// Creates the instance. Returns whether validation ended up enabled.
pub(crate) fn create_instance(
    window_handle: &impl raw_window_handle::HasDisplayHandle,
    entry: &ash::Entry,
    application_name: &CStr,
    validation: bool,
) -> Result<(ash::Instance, bool)> {
    let app_info = vk::ApplicationInfo::default()
        .application_name(application_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"vulkan-framegraph")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::make_api_version(0, 1, 3, 0));

    let validation = validation && validation_available(entry)?;
    if !validation {
        log::info!("Vulkan validation layer is disabled");
    }
    let layer_names = if validation {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        Vec::new()
    };

    let display_handle = window_handle.display_handle().map_err(other)?;
    let mut extension_names =
        ash_window::enumerate_required_extensions(display_handle.as_raw())?.to_vec();
    if validation {
        extension_names.push(debug_utils::NAME.as_ptr());
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        extension_names.push(ash::khr::portability_enumeration::NAME.as_ptr());
        extension_names.push(ash::khr::get_physical_device_properties2::NAME.as_ptr());
    }

    let create_flags = if cfg!(any(target_os = "macos", target_os = "ios")) {
        vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR
    } else {
        vk::InstanceCreateFlags::default()
    };

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_layer_names(&layer_names)
        .enabled_extension_names(&extension_names)
        .flags(create_flags);

    let instance = unsafe { entry.create_instance(&create_info, None)? };
    Ok((instance, validation))
}

pub(crate) fn create_surface<W>(
    window_handle: &W,
    entry: &ash::Entry,
    instance: &ash::Instance,
) -> Result<(ash::khr::surface::Instance, vk::SurfaceKHR)>
where
    W: raw_window_handle::HasDisplayHandle + raw_window_handle::HasWindowHandle,
{
    let surface = ash::khr::surface::Instance::new(entry, instance);
    let surface_khr = unsafe {
        ash_window::create_surface(
            entry,
            instance,
            window_handle.display_handle().map_err(other)?.as_raw(),
            window_handle.window_handle().map_err(other)?.as_raw(),
            None,
        )?
    };
    Ok((surface, surface_khr))
}

pub(crate) fn create_debug_utils(
    entry: &ash::Entry,
    instance: &ash::Instance,
) -> Result<(debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .flags(vk::DebugUtilsMessengerCreateFlagsEXT::empty())
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
        )
        .pfn_user_callback(Some(vulkan_debug_callback));
    let debug_utils = debug_utils::Instance::new(entry, instance);
    let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None)? };
    Ok((debug_utils, messenger))
}

extern "system" fn vulkan_debug_callback(
    flag: vk::DebugUtilsMessageSeverityFlagsEXT,
    type_flag: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _: *mut std::os::raw::c_void,
) -> vk::Bool32 {
    use vk::DebugUtilsMessageSeverityFlagsEXT as Flag;
    let message = unsafe { CStr::from_ptr((*p_callback_data).p_message) };
    match flag {
        Flag::VERBOSE => log::trace!("{type_flag:?} - {message:?}"),
        Flag::INFO => log::debug!("{type_flag:?} - {message:?}"),
        Flag::WARNING => log::warn!("{type_flag:?} - {message:?}"),
        _ => log::error!("{type_flag:?} - {message:?}"),
    }
    vk::FALSE
}

pub(crate) struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

/// Prefers a discrete GPU, then an integrated one. The device must present
/// to `surface_khr` and support synchronization2.
pub(crate) fn find_physical_device(
    instance: &ash::Instance,
    surface: &ash::khr::surface::Instance,
    surface_khr: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, QueueFamilies)> {
    let devices = unsafe { instance.enumerate_physical_devices()? };
    let by_type = |device_type: vk::PhysicalDeviceType| {
        devices.iter().copied().find(|device| {
            let properties = unsafe { instance.get_physical_device_properties(*device) };
            properties.device_type == device_type
        })
    };

    let physical_device = match by_type(vk::PhysicalDeviceType::DISCRETE_GPU) {
        Some(device) => device,
        None => {
            let device = by_type(vk::PhysicalDeviceType::INTEGRATED_GPU).ok_or_else(|| {
                FrameGraphError::Other("No discrete GPU or integrated GPU is available".into())
            })?;
            log::info!("No discrete GPU is available, using integrated GPU");
            device
        }
    };

    let families = find_queue_families(instance, surface, surface_khr, physical_device)?;

    if !swapchain_supported(instance, physical_device)? {
        return Err("Physical device does not support swapchains".into());
    }

    let formats =
        unsafe { surface.get_physical_device_surface_formats(physical_device, surface_khr)? };
    if formats.is_empty() {
        return Err("Physical device does not have any surface formats".into());
    }

    let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
    let mut features = vk::PhysicalDeviceFeatures2::default().push_next(&mut features13);
    unsafe { instance.get_physical_device_features2(physical_device, &mut features) };
    if features13.synchronization2 != vk::TRUE {
        return Err("Physical device does not support synchronization2".into());
    }

    log::info!("Found graphics queue {}", families.graphics);
    log::info!("Found present queue {}", families.present);
    Ok((physical_device, families))
}

fn swapchain_supported(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Result<bool> {
    let extension_props =
        unsafe { instance.enumerate_device_extension_properties(physical_device)? };
    Ok(extension_props
        .iter()
        .any(|ext| ext.extension_name_as_c_str() == Ok(swapchain::NAME)))
}

fn find_queue_families(
    instance: &ash::Instance,
    surface: &ash::khr::surface::Instance,
    surface_khr: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
) -> Result<QueueFamilies> {
    let properties =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    let mut graphics = None;
    let mut present = None;
    for (index, family) in properties.iter().enumerate() {
        if family.queue_count == 0 {
            continue;
        }
        let index = index as u32;
        let flags = family.queue_flags;
        if graphics.is_none()
            && flags.contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        {
            graphics = Some(index);
        }

        let present_support = unsafe {
            surface.get_physical_device_surface_support(physical_device, index, surface_khr)?
        };
        if present.is_none() && present_support {
            present = Some(index);
        }
    }

    Ok(QueueFamilies {
        graphics: graphics.ok_or("No graphics queue family found")?,
        present: present.ok_or("No present queue family found")?,
    })
}

pub(crate) fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    families: &QueueFamilies,
) -> Result<ash::Device> {
    let mut queue_indices = vec![families.graphics, families.present];
    queue_indices.dedup();

    let priorities = [1.0f32];
    let queue_create_infos = queue_indices
        .iter()
        .map(|index| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(*index)
                .queue_priorities(&priorities)
        })
        .collect::<Vec<_>>();
    let extension_names = [
        swapchain::NAME.as_ptr(),
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        ash::khr::portability_subset::NAME.as_ptr(),
    ];
    let mut features13 = vk::PhysicalDeviceVulkan13Features::default().synchronization2(true);
    let mut features = vk::PhysicalDeviceFeatures2::default().push_next(&mut features13);
    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features);
    Ok(unsafe { instance.create_device(physical_device, &create_info, None)? })
}

pub(crate) fn create_allocator(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: &ash::Device,
) -> Result<gpu_allocator::vulkan::Allocator> {
    let create_info = gpu_allocator::vulkan::AllocatorCreateDesc {
        instance: instance.clone(),
        device: device.clone(),
        physical_device,
        debug_settings: gpu_allocator::AllocatorDebugSettings {
            log_memory_information: true,
            log_leaks_on_shutdown: true,
            ..Default::default()
        },
        buffer_device_address: false,
        allocation_sizes: gpu_allocator::AllocationSizes::default(),
    };
    Ok(gpu_allocator::vulkan::Allocator::new(&create_info)?)
}
