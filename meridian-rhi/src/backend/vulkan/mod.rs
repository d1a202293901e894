//! Vulkan 1.3 backend: headless instance, one graphics queue, timeline-semaphore fences.

mod command;
mod core;
mod device;

pub use self::command::VulkanRecorder;
pub use self::core::{PhysicalDevice, VulkanCore};
pub use self::device::VulkanBackend;
