//! Instance creation and physical device selection.

use std::ffi::{CStr, CString};
use ash::{vk, Entry, Instance};
use crate::error::RhiError;

#[cfg(feature = "validation")]
const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

const SCORE_DISCRETE_GPU: u32 = 10000;
const SCORE_INTEGRATED_GPU: u32 = 1000;
const SCORE_PER_GB_VRAM: u32 = 100;
const SCORE_VULKAN_1_4: u32 = 600;
const SCORE_VULKAN_1_3: u32 = 400;

#[derive(Clone)]
pub struct PhysicalDevice {
    handle: vk::PhysicalDevice,
    name: String,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    graphics_queue_family: u32,
}

impl PhysicalDevice {
    pub fn handle(&self) -> vk::PhysicalDevice {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue_family
    }
}

/// Loader entry and instance. Outlives every device created from it.
pub struct VulkanCore {
    entry: Entry,
    instance: Instance,

    #[cfg(feature = "validation")]
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanCore {
    /// Load the Vulkan library and create a headless instance.
    #[profiling::function]
    pub fn new(app_name: &str) -> Result<Self, RhiError> {
        let entry = unsafe { Entry::load() }.map_err(|err| RhiError::Backend(format!("failed to load Vulkan: {}", err)))?;
        let instance = create_instance(&entry, app_name)?;

        #[cfg(feature = "validation")]
        let debug_utils = match setup_debug_messenger(&entry, &instance) {
            Ok(debug_utils) => Some(debug_utils),
            Err(err) => {
                log::warn!("Vulkan debug messenger is unavailable: {:?}", err);
                None
            }
        };

        Ok(Self {
            entry,
            instance,
            #[cfg(feature = "validation")]
            debug_utils,
        })
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// Pick the highest scoring device that has a graphics queue.
    pub fn select_physical_device(&self) -> Result<PhysicalDevice, RhiError> {
        let handles = unsafe { self.instance.enumerate_physical_devices() }
            .map_err(RhiError::native("vkEnumeratePhysicalDevices"))?;

        let mut best: Option<(u32, PhysicalDevice)> = None;
        for handle in handles {
            let properties = unsafe { self.instance.get_physical_device_properties(handle) };
            let memory_properties = unsafe { self.instance.get_physical_device_memory_properties(handle) };
            let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
                .to_string_lossy()
                .into_owned();

            if properties.api_version < vk::API_VERSION_1_3 {
                log::info!("Skipping GPU {}: Vulkan 1.3 is required", name);
                continue;
            }
            let Some(graphics_queue_family) = find_graphics_queue_family(&self.instance, handle) else {
                log::info!("Skipping GPU {}: no graphics queue", name);
                continue;
            };

            let score = score_physical_device(&properties, &memory_properties);
            log::info!("Found GPU: {} (score: {}, type: {:?})", name, score, properties.device_type);

            if best.as_ref().is_none_or(|(best_score, _)| score > *best_score) {
                best = Some((
                    score,
                    PhysicalDevice {
                        handle,
                        name,
                        properties,
                        memory_properties,
                        graphics_queue_family,
                    },
                ));
            }
        }

        best.map(|(_, device)| device)
            .ok_or_else(|| RhiError::Unsupported("no Vulkan 1.3 GPU with a graphics queue".to_owned()))
    }
}

impl Drop for VulkanCore {
    fn drop(&mut self) {
        unsafe {
            #[cfg(feature = "validation")]
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

fn create_instance(entry: &Entry, app_name: &str) -> Result<Instance, RhiError> {
    let app_name = CString::new(app_name).map_err(|_| RhiError::InvalidArgument("application name contains a nul byte".to_owned()))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 1, 0, 0))
        .engine_name(c"Meridian")
        .engine_version(vk::make_api_version(0, 1, 0, 0))
        .api_version(vk::API_VERSION_1_3);

    #[allow(unused_mut)]
    let mut extensions: Vec<*const std::ffi::c_char> = Vec::new();
    #[allow(unused_mut)]
    let mut layers: Vec<*const std::ffi::c_char> = Vec::new();

    #[cfg(feature = "validation")]
    {
        extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        let available = unsafe { entry.enumerate_instance_layer_properties() }.unwrap_or_default();
        let has_validation = available
            .iter()
            .any(|layer| layer.layer_name_as_c_str().is_ok_and(|name| name == VALIDATION_LAYER));
        if has_validation {
            layers.push(VALIDATION_LAYER.as_ptr());
        } else {
            log::warn!("Validation layer is not installed; continuing without it");
        }
    }

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layers);

    unsafe { entry.create_instance(&create_info, None) }.map_err(RhiError::native("vkCreateInstance"))
}

#[cfg(feature = "validation")]
fn setup_debug_messenger(
    entry: &Entry,
    instance: &Instance,
) -> Result<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT), vk::Result> {
    let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(vulkan_debug_callback));

    let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None)? };
    Ok((debug_utils, messenger))
}

#[cfg(feature = "validation")]
unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let callback_data = unsafe { *p_callback_data };
    if callback_data.p_message.is_null() {
        return vk::FALSE;
    }
    let message = unsafe { CStr::from_ptr(callback_data.p_message) }.to_string_lossy();

    let type_str = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "[General]",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "[Validation]",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "[Performance]",
        _ => "[Unknown]",
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::error!("Vulkan {}: {}", type_str, message),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::warn!("Vulkan {}: {}", type_str, message),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => log::info!("Vulkan {}: {}", type_str, message),
        _ => log::debug!("Vulkan {}: {}", type_str, message),
    }

    vk::FALSE
}

fn find_graphics_queue_family(instance: &Instance, physical_device: vk::PhysicalDevice) -> Option<u32> {
    let families = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    families
        .iter()
        .position(|family| {
            family
                .queue_flags
                .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
                && family.timestamp_valid_bits > 0
        })
        .map(|index| index as u32)
}

/// Higher is better.
fn score_physical_device(
    properties: &vk::PhysicalDeviceProperties,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
) -> u32 {
    let mut score = match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => SCORE_DISCRETE_GPU,
        vk::PhysicalDeviceType::INTEGRATED_GPU => SCORE_INTEGRATED_GPU,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 500,
        vk::PhysicalDeviceType::CPU => 100,
        _ => 10,
    };

    if properties.api_version >= vk::make_api_version(0, 1, 4, 0) {
        score += SCORE_VULKAN_1_4;
    } else if properties.api_version >= vk::API_VERSION_1_3 {
        score += SCORE_VULKAN_1_3;
    }

    let vram_bytes: u64 = memory_properties.memory_heaps[..memory_properties.memory_heap_count as usize]
        .iter()
        .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|heap| heap.size)
        .sum();
    score + (vram_bytes >> 30) as u32 * SCORE_PER_GB_VRAM
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(device_type: vk::PhysicalDeviceType, api_version: u32) -> vk::PhysicalDeviceProperties {
        vk::PhysicalDeviceProperties {
            device_type,
            api_version,
            ..Default::default()
        }
    }

    fn memory(vram_gb: u64) -> vk::PhysicalDeviceMemoryProperties {
        let mut memory = vk::PhysicalDeviceMemoryProperties {
            memory_heap_count: 1,
            ..Default::default()
        };
        memory.memory_heaps[0] = vk::MemoryHeap {
            size: vram_gb << 30,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        memory
    }

    #[test]
    fn discrete_beats_integrated() {
        let discrete = score_physical_device(
            &properties(vk::PhysicalDeviceType::DISCRETE_GPU, vk::API_VERSION_1_3),
            &memory(4),
        );
        let integrated = score_physical_device(
            &properties(vk::PhysicalDeviceType::INTEGRATED_GPU, vk::make_api_version(0, 1, 4, 0)),
            &memory(16),
        );
        assert!(discrete > integrated);
        assert_eq!(discrete, SCORE_DISCRETE_GPU + SCORE_VULKAN_1_3 + 4 * SCORE_PER_GB_VRAM);
    }
}
