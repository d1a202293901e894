//! The native [`GpuBackend`]: one logical device, one graphics queue and a timeline semaphore
//! that every submission signals.

use std::sync::atomic::{AtomicU64, Ordering};
use ash::{vk, Device};
use meridian_core::collections::hashmap::HashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use crate::backend::vulkan::command::{CommandPool, VulkanRecorder};
use crate::backend::vulkan::core::{PhysicalDevice, VulkanCore};
use crate::backend::{CommandRecorder, GpuBackend, NativeBuffer, NativeImage, NativeObject, RenderPassKey};
use crate::error::RhiError;
use crate::query::{QueryType, PIPELINE_STATISTICS_FLAGS};
use crate::resource::{BufferDesc, TextureDesc, TextureDimension, TextureViewDesc};
use crate::state::{resource_state_to_image_layout, ResourceState};
use crate::utility::find_memory_type;

/// Persistent mapping of a host-visible buffer.
#[derive(Clone, Copy)]
struct Mapping {
    address: usize,
    size: vk::DeviceSize,
}

#[derive(Default)]
struct PoolRecycler {
    free: Vec<CommandPool>,
    /// Pools of submitted command buffers with the timeline value that retires them.
    in_flight: Vec<(u64, CommandPool)>,
}

pub struct VulkanBackend {
    device: Device,
    physical_device: PhysicalDevice,
    queue: Mutex<vk::Queue>,
    timeline: vk::Semaphore,
    submitted: AtomicU64,
    pools: Mutex<PoolRecycler>,
    mappings: Mutex<HashMap<vk::Buffer, Mapping>>,
    // Dropped after the device.
    core: VulkanCore,
}

impl VulkanBackend {
    /// Create an instance and a logical device on the best available GPU.
    #[profiling::function]
    pub fn new(app_name: &str) -> Result<Self, RhiError> {
        let core = VulkanCore::new(app_name)?;
        let physical_device = core.select_physical_device()?;
        log::info!("Using GPU {}", physical_device.name());

        let queue_family = physical_device.graphics_queue_family();
        let queue_priority = 1.0f32;
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(std::slice::from_ref(&queue_priority));

        let supported = unsafe { core.instance().get_physical_device_features(physical_device.handle()) };
        let features = vk::PhysicalDeviceFeatures::default()
            .pipeline_statistics_query(supported.pipeline_statistics_query == vk::TRUE)
            .occlusion_query_precise(supported.occlusion_query_precise == vk::TRUE);
        let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);
        let mut vulkan_13_features = vk::PhysicalDeviceVulkan13Features::default().synchronization2(true);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_features(&features)
            .push_next(&mut vulkan_12_features)
            .push_next(&mut vulkan_13_features);

        let device = unsafe { core.instance().create_device(physical_device.handle(), &create_info, None) }
            .map_err(RhiError::native("vkCreateDevice"))?;
        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        let mut timeline_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let semaphore_info = vk::SemaphoreCreateInfo::default().push_next(&mut timeline_info);
        let timeline = match unsafe { device.create_semaphore(&semaphore_info, None) } {
            Ok(timeline) => timeline,
            Err(result) => {
                unsafe { device.destroy_device(None) };
                return Err(RhiError::native("vkCreateSemaphore")(result));
            }
        };

        Ok(Self {
            device,
            physical_device,
            queue: Mutex::new(queue),
            timeline,
            submitted: AtomicU64::new(0),
            pools: Mutex::new(PoolRecycler::default()),
            mappings: Mutex::new(HashMap::default()),
            core,
        })
    }

    pub fn physical_device(&self) -> &PhysicalDevice {
        &self.physical_device
    }

    pub fn core(&self) -> &VulkanCore {
        &self.core
    }

    pub fn handle(&self) -> &Device {
        &self.device
    }

    /// A reset pool, recycling one whose submission has completed when possible.
    fn acquire_pool(&self) -> Result<CommandPool, RhiError> {
        let completed = self.completed_fence_value();
        let mut pools = self.pools.lock();
        let (retired, in_flight): (Vec<_>, Vec<_>) =
            pools.in_flight.drain(..).partition(|(value, _)| *value <= completed);
        pools.in_flight = in_flight;
        for (_, pool) in retired {
            pool.reset(&self.device)?;
            pools.free.push(pool);
        }
        match pools.free.pop() {
            Some(pool) => Ok(pool),
            None => CommandPool::new(&self.device, self.physical_device.graphics_queue_family()),
        }
    }

    fn allocate_memory(
        &self,
        requirements: vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
        what: &str,
    ) -> Result<vk::DeviceMemory, RhiError> {
        let memory_type_index = find_memory_type(
            self.physical_device.memory_properties(),
            requirements.memory_type_bits,
            flags,
        )
        .ok_or_else(|| RhiError::OutOfMemory(format!("no memory type with {:?} for {}", flags, what)))?;

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        unsafe { self.device.allocate_memory(&alloc_info, None) }.map_err(RhiError::native("vkAllocateMemory"))
    }
}

impl GpuBackend for VulkanBackend {
    fn name(&self) -> &str {
        "vulkan"
    }

    fn begin_commands(&self, name: &str) -> Result<Box<dyn CommandRecorder>, RhiError> {
        let pool = self.acquire_pool()?;
        Ok(Box::new(VulkanRecorder::begin(name, self.device.clone(), pool)?))
    }

    #[profiling::function]
    fn submit(&self, commands: Vec<Box<dyn CommandRecorder>>) -> Result<u64, RhiError> {
        let mut recorders = Vec::with_capacity(commands.len());
        for recorder in commands {
            let recorder = recorder
                .into_any()
                .downcast::<VulkanRecorder>()
                .map_err(|_| RhiError::Backend("foreign command buffer submitted to the Vulkan backend".into()))?;
            if !recorder.ended {
                return Err(RhiError::InvalidArgument(format!(
                    "command buffer '{}' submitted before it was ended",
                    recorder.name
                )));
            }
            recorders.push(recorder);
        }

        let command_infos: SmallVec<[vk::CommandBufferSubmitInfo; 4]> = recorders
            .iter()
            .map(|recorder| vk::CommandBufferSubmitInfo::default().command_buffer(recorder.cmd))
            .collect();

        let queue = self.queue.lock();
        let fence_value = self.submitted.load(Ordering::Acquire) + 1;
        let signal_info = vk::SemaphoreSubmitInfo::default()
            .semaphore(self.timeline)
            .value(fence_value)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS);
        let submit_info = vk::SubmitInfo2::default()
            .command_buffer_infos(&command_infos)
            .signal_semaphore_infos(std::slice::from_ref(&signal_info));
        unsafe { self.device.queue_submit2(*queue, &[submit_info], vk::Fence::null()) }
            .map_err(RhiError::native("vkQueueSubmit2"))?;
        self.submitted.store(fence_value, Ordering::Release);
        drop(queue);

        let mut pools = self.pools.lock();
        for mut recorder in recorders {
            if let Some(pool) = recorder.pool.take() {
                pools.in_flight.push((fence_value, pool));
            }
        }
        Ok(fence_value)
    }

    fn next_fence_value(&self) -> u64 {
        self.submitted.load(Ordering::Acquire) + 1
    }

    fn completed_fence_value(&self) -> u64 {
        match unsafe { self.device.get_semaphore_counter_value(self.timeline) } {
            Ok(value) => value,
            Err(result) => {
                log::error!("vkGetSemaphoreCounterValue failed: {:?}", result);
                0
            }
        }
    }

    fn wait_for_fence_value(&self, value: u64) -> Result<(), RhiError> {
        let value = value.min(self.submitted.load(Ordering::Acquire));
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(std::slice::from_ref(&self.timeline))
            .values(std::slice::from_ref(&value));
        unsafe { self.device.wait_semaphores(&wait_info, u64::MAX) }.map_err(RhiError::native("vkWaitSemaphores"))
    }

    fn wait_idle(&self) -> Result<(), RhiError> {
        let _queue = self.queue.lock();
        unsafe { self.device.device_wait_idle() }.map_err(RhiError::native("vkDeviceWaitIdle"))
    }

    fn create_buffer(&self, desc: &BufferDesc, host_visible: bool) -> Result<NativeBuffer, RhiError> {
        let create_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.bind_flags)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let handle = unsafe { self.device.create_buffer(&create_info, None) }.map_err(RhiError::native("vkCreateBuffer"))?;

        let flags = if host_visible {
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        } else {
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(handle) };
        let bound = self.allocate_memory(requirements, flags, &desc.name).and_then(|memory| {
            if let Err(result) = unsafe { self.device.bind_buffer_memory(handle, memory, 0) } {
                unsafe { self.device.free_memory(memory, None) };
                return Err(RhiError::native("vkBindBufferMemory")(result));
            }
            Ok(memory)
        });
        let memory = match bound {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { self.device.destroy_buffer(handle, None) };
                return Err(err);
            }
        };

        if host_visible {
            match unsafe { self.device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()) } {
                Ok(address) => {
                    self.mappings.lock().insert(
                        handle,
                        Mapping {
                            address: address as usize,
                            size: desc.size,
                        },
                    );
                }
                Err(result) => {
                    unsafe {
                        self.device.destroy_buffer(handle, None);
                        self.device.free_memory(memory, None);
                    }
                    return Err(RhiError::native("vkMapMemory")(result));
                }
            }
        }
        Ok(NativeBuffer { handle, memory })
    }

    fn create_image(&self, desc: &TextureDesc) -> Result<NativeImage, RhiError> {
        let flags = match desc.dimension {
            TextureDimension::Cube | TextureDimension::CubeArray => vk::ImageCreateFlags::CUBE_COMPATIBLE,
            _ => vk::ImageCreateFlags::empty(),
        };
        let create_info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(desc.dimension.image_type())
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: desc.depth.max(1),
            })
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(desc.samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let handle = unsafe { self.device.create_image(&create_info, None) }.map_err(RhiError::native("vkCreateImage"))?;

        let requirements = unsafe { self.device.get_image_memory_requirements(handle) };
        let memory = match self.allocate_memory(requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL, &desc.name) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { self.device.destroy_image(handle, None) };
                return Err(err);
            }
        };
        if let Err(result) = unsafe { self.device.bind_image_memory(handle, memory, 0) } {
            unsafe {
                self.device.destroy_image(handle, None);
                self.device.free_memory(memory, None);
            }
            return Err(RhiError::native("vkBindImageMemory")(result));
        }
        Ok(NativeImage { handle, memory })
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        texture: &TextureDesc,
        view: &TextureViewDesc,
    ) -> Result<vk::ImageView, RhiError> {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(view.native_view_type(texture))
            .format(view.format.unwrap_or(texture.format))
            .subresource_range(view.subresource_range(texture).to_vk());
        unsafe { self.device.create_image_view(&create_info, None) }.map_err(RhiError::native("vkCreateImageView"))
    }

    fn create_render_pass(&self, key: &RenderPassKey) -> Result<vk::RenderPass, RhiError> {
        let color_layout = resource_state_to_image_layout(ResourceState::RENDER_TARGET, false);
        let depth_layout = resource_state_to_image_layout(ResourceState::DEPTH_WRITE, false);

        let attachment = |format, layout| {
            vk::AttachmentDescription::default()
                .format(format)
                .samples(key.samples)
                .load_op(vk::AttachmentLoadOp::LOAD)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(vk::AttachmentLoadOp::LOAD)
                .stencil_store_op(vk::AttachmentStoreOp::STORE)
                .initial_layout(layout)
                .final_layout(layout)
        };
        let mut attachments: SmallVec<[vk::AttachmentDescription; 9]> = key
            .color_formats
            .iter()
            .map(|&format| attachment(format, color_layout))
            .collect();
        let color_refs: SmallVec<[vk::AttachmentReference; 8]> = (0..key.color_formats.len() as u32)
            .map(|index| vk::AttachmentReference {
                attachment: index,
                layout: color_layout,
            })
            .collect();
        let depth_ref = key.depth_format.map(|format| {
            attachments.push(attachment(format, depth_layout));
            vk::AttachmentReference {
                attachment: key.color_formats.len() as u32,
                layout: depth_layout,
            }
        });

        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if let Some(depth_ref) = depth_ref.as_ref() {
            subpass = subpass.depth_stencil_attachment(depth_ref);
        }

        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(std::slice::from_ref(&subpass));
        unsafe { self.device.create_render_pass(&create_info, None) }.map_err(RhiError::native("vkCreateRenderPass"))
    }

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        width: u32,
        height: u32,
        layers: u32,
    ) -> Result<vk::Framebuffer, RhiError> {
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(width)
            .height(height)
            .layers(layers);
        unsafe { self.device.create_framebuffer(&create_info, None) }.map_err(RhiError::native("vkCreateFramebuffer"))
    }

    fn create_query_pool(&self, ty: QueryType, count: u32) -> Result<vk::QueryPool, RhiError> {
        let mut create_info = vk::QueryPoolCreateInfo::default()
            .query_type(ty.native_type())
            .query_count(count);
        if ty == QueryType::PipelineStatistics {
            create_info = create_info.pipeline_statistics(PIPELINE_STATISTICS_FLAGS);
        }
        unsafe { self.device.create_query_pool(&create_info, None) }.map_err(RhiError::native("vkCreateQueryPool"))
    }

    fn destroy_query_pool(&self, pool: vk::QueryPool) {
        unsafe { self.device.destroy_query_pool(pool, None) }
    }

    fn destroy(&self, object: NativeObject) {
        unsafe {
            match object {
                NativeObject::Buffer(buffer) => {
                    self.mappings.lock().remove(&buffer.handle);
                    self.device.destroy_buffer(buffer.handle, None);
                    if buffer.memory != vk::DeviceMemory::null() {
                        self.device.free_memory(buffer.memory, None);
                    }
                }
                NativeObject::Image(image) => {
                    // Images without memory belong to someone else.
                    if image.memory != vk::DeviceMemory::null() {
                        self.device.destroy_image(image.handle, None);
                        self.device.free_memory(image.memory, None);
                    }
                }
                NativeObject::ImageView(view) => self.device.destroy_image_view(view, None),
                NativeObject::Framebuffer(framebuffer) => self.device.destroy_framebuffer(framebuffer, None),
                NativeObject::RenderPass(render_pass) => self.device.destroy_render_pass(render_pass, None),
                NativeObject::Pipeline(pipeline) => self.device.destroy_pipeline(pipeline, None),
            }
        }
    }

    fn write_buffer(&self, buffer: &NativeBuffer, offset: vk::DeviceSize, data: &[u8]) -> Result<(), RhiError> {
        let mapping = self
            .mappings
            .lock()
            .get(&buffer.handle)
            .copied()
            .ok_or_else(|| RhiError::InvalidArgument(format!("{:?} is not host visible", buffer.handle)))?;
        offset
            .checked_add(data.len() as vk::DeviceSize)
            .filter(|&end| end <= mapping.size)
            .ok_or_else(|| {
                RhiError::InvalidArgument(format!(
                    "write of {} bytes at {} overruns buffer of {} bytes",
                    data.len(),
                    offset,
                    mapping.size
                ))
            })?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), (mapping.address as *mut u8).add(offset as usize), data.len());
        }
        Ok(())
    }

    fn query_results(&self, pool: vk::QueryPool, first: u32, count: u32, values_per_query: u32) -> Option<Vec<u64>> {
        let mut values = vec![0u64; (count * values_per_query) as usize];
        let stride = (values_per_query as usize * std::mem::size_of::<u64>()) as vk::DeviceSize;
        // Queries with several values need a stride the typed wrapper can not express.
        let result = unsafe {
            (self.device.fp_v1_0().get_query_pool_results)(
                self.device.handle(),
                pool,
                first,
                count,
                std::mem::size_of_val(values.as_slice()),
                values.as_mut_ptr().cast(),
                stride,
                vk::QueryResultFlags::TYPE_64,
            )
        };
        match result {
            vk::Result::SUCCESS => Some(values),
            vk::Result::NOT_READY => None,
            result => {
                log::error!("vkGetQueryPoolResults failed: {:?}", result);
                None
            }
        }
    }

    fn timestamp_period(&self) -> f32 {
        self.physical_device.properties().limits.timestamp_period
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            if let Err(result) = self.device.device_wait_idle() {
                log::error!("vkDeviceWaitIdle failed during shutdown: {:?}", result);
            }
            let pools = self.pools.get_mut();
            for pool in pools.free.drain(..).chain(pools.in_flight.drain(..).map(|(_, pool)| pool)) {
                pool.destroy(&self.device);
            }
            self.device.destroy_semaphore(self.timeline, None);
            self.device.destroy_device(None);
        }
    }
}
