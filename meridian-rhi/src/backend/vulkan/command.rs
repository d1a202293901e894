//! Native command buffer recording.

use std::any::Any;
use ash::{vk, Device};
use smallvec::SmallVec;
use crate::backend::{CommandRecorder, RenderPassBegin};
use crate::barrier::{BufferBarrier, ImageBarrier, MemoryBarrier};
use crate::error::RhiError;

/// Transient pool holding the command buffers of one submission.
pub(super) struct CommandPool {
    pub(super) handle: vk::CommandPool,
}

impl CommandPool {
    pub(super) fn new(device: &Device, queue_family_index: u32) -> Result<Self, RhiError> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let handle = unsafe { device.create_command_pool(&create_info, None) }
            .map_err(RhiError::native("vkCreateCommandPool"))?;
        Ok(Self { handle })
    }

    pub(super) fn reset(&self, device: &Device) -> Result<(), RhiError> {
        unsafe { device.reset_command_pool(self.handle, vk::CommandPoolResetFlags::empty()) }
            .map_err(RhiError::native("vkResetCommandPool"))
    }

    pub(super) fn allocate(&self, device: &Device) -> Result<vk::CommandBuffer, RhiError> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.handle)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { device.allocate_command_buffers(&alloc_info) }
            .map_err(RhiError::native("vkAllocateCommandBuffers"))?;
        buffers
            .into_iter()
            .next()
            .ok_or_else(|| RhiError::Backend("vkAllocateCommandBuffers returned no command buffer".to_owned()))
    }

    pub(super) fn destroy(self, device: &Device) {
        unsafe { device.destroy_command_pool(self.handle, None) };
    }
}

/// A primary command buffer in the recording state, with the pool it came from.
pub struct VulkanRecorder {
    pub(super) name: String,
    pub(super) device: Device,
    pub(super) pool: Option<CommandPool>,
    pub(super) cmd: vk::CommandBuffer,
    pub(super) ended: bool,
}

impl VulkanRecorder {
    pub(super) fn begin(name: &str, device: Device, pool: CommandPool) -> Result<Self, RhiError> {
        let cmd = pool.allocate(&device)?;
        let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(cmd, &begin_info) }.map_err(RhiError::native("vkBeginCommandBuffer"))?;
        Ok(Self {
            name: name.to_owned(),
            device,
            pool: Some(pool),
            cmd,
            ended: false,
        })
    }
}

impl CommandRecorder for VulkanRecorder {
    fn handle(&self) -> vk::CommandBuffer {
        self.cmd
    }

    fn pipeline_barrier(&mut self, memory: &[MemoryBarrier], buffers: &[BufferBarrier], images: &[ImageBarrier]) {
        let memory: SmallVec<[vk::MemoryBarrier2; 2]> = memory.iter().map(MemoryBarrier::to_vk).collect();
        let buffers: SmallVec<[vk::BufferMemoryBarrier2; 8]> = buffers.iter().map(BufferBarrier::to_vk).collect();
        let images: SmallVec<[vk::ImageMemoryBarrier2; 8]> = images.iter().map(ImageBarrier::to_vk).collect();
        let dependency = vk::DependencyInfo::default()
            .memory_barriers(&memory)
            .buffer_memory_barriers(&buffers)
            .image_memory_barriers(&images);
        unsafe { self.device.cmd_pipeline_barrier2(self.cmd, &dependency) }
    }

    fn begin_render_pass(&mut self, begin: &RenderPassBegin<'_>) {
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(begin.render_pass)
            .framebuffer(begin.framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: begin.extent,
            })
            .clear_values(begin.clear_values);
        unsafe {
            self.device
                .cmd_begin_render_pass(self.cmd, &begin_info, vk::SubpassContents::INLINE)
        }
    }

    fn next_subpass(&mut self) {
        unsafe { self.device.cmd_next_subpass(self.cmd, vk::SubpassContents::INLINE) }
    }

    fn end_render_pass(&mut self) {
        unsafe { self.device.cmd_end_render_pass(self.cmd) }
    }

    fn bind_pipeline(&mut self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        unsafe { self.device.cmd_bind_pipeline(self.cmd, bind_point, pipeline) }
    }

    fn bind_descriptor_sets(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        unsafe {
            self.device
                .cmd_bind_descriptor_sets(self.cmd, bind_point, layout, first_set, sets, dynamic_offsets)
        }
    }

    fn push_constants(&mut self, layout: vk::PipelineLayout, stages: vk::ShaderStageFlags, offset: u32, data: &[u8]) {
        unsafe { self.device.cmd_push_constants(self.cmd, layout, stages, offset, data) }
    }

    fn bind_vertex_buffers(&mut self, first_binding: u32, buffers: &[vk::Buffer], offsets: &[vk::DeviceSize]) {
        unsafe { self.device.cmd_bind_vertex_buffers(self.cmd, first_binding, buffers, offsets) }
    }

    fn bind_index_buffer(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize, index_type: vk::IndexType) {
        unsafe { self.device.cmd_bind_index_buffer(self.cmd, buffer, offset, index_type) }
    }

    fn set_viewports(&mut self, first: u32, viewports: &[vk::Viewport]) {
        unsafe { self.device.cmd_set_viewport(self.cmd, first, viewports) }
    }

    fn set_scissors(&mut self, first: u32, scissors: &[vk::Rect2D]) {
        unsafe { self.device.cmd_set_scissor(self.cmd, first, scissors) }
    }

    fn set_stencil_reference(&mut self, reference: u32) {
        unsafe {
            self.device
                .cmd_set_stencil_reference(self.cmd, vk::StencilFaceFlags::FRONT_AND_BACK, reference)
        }
    }

    fn set_blend_constants(&mut self, constants: [f32; 4]) {
        unsafe { self.device.cmd_set_blend_constants(self.cmd, &constants) }
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        unsafe {
            self.device
                .cmd_draw(self.cmd, vertex_count, instance_count, first_vertex, first_instance)
        }
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw_indexed(
                self.cmd,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        }
    }

    fn draw_indirect(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize, draw_count: u32, stride: u32) {
        unsafe { self.device.cmd_draw_indirect(self.cmd, buffer, offset, draw_count, stride) }
    }

    fn draw_indexed_indirect(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize, draw_count: u32, stride: u32) {
        unsafe {
            self.device
                .cmd_draw_indexed_indirect(self.cmd, buffer, offset, draw_count, stride)
        }
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        unsafe { self.device.cmd_dispatch(self.cmd, x, y, z) }
    }

    fn dispatch_indirect(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize) {
        unsafe { self.device.cmd_dispatch_indirect(self.cmd, buffer, offset) }
    }

    fn clear_color_image(
        &mut self,
        image: vk::Image,
        layout: vk::ImageLayout,
        color: &vk::ClearColorValue,
        ranges: &[vk::ImageSubresourceRange],
    ) {
        unsafe { self.device.cmd_clear_color_image(self.cmd, image, layout, color, ranges) }
    }

    fn clear_depth_stencil_image(
        &mut self,
        image: vk::Image,
        layout: vk::ImageLayout,
        value: &vk::ClearDepthStencilValue,
        ranges: &[vk::ImageSubresourceRange],
    ) {
        unsafe {
            self.device
                .cmd_clear_depth_stencil_image(self.cmd, image, layout, value, ranges)
        }
    }

    fn clear_attachments(&mut self, attachments: &[vk::ClearAttachment], rects: &[vk::ClearRect]) {
        unsafe { self.device.cmd_clear_attachments(self.cmd, attachments, rects) }
    }

    fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        unsafe { self.device.cmd_copy_buffer(self.cmd, src, dst, regions) }
    }

    fn copy_image(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    ) {
        unsafe {
            self.device
                .cmd_copy_image(self.cmd, src, src_layout, dst, dst_layout, regions)
        }
    }

    fn copy_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device
                .cmd_copy_buffer_to_image(self.cmd, src, dst, dst_layout, regions)
        }
    }

    fn copy_image_to_buffer(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device
                .cmd_copy_image_to_buffer(self.cmd, src, src_layout, dst, regions)
        }
    }

    fn blit_image(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    ) {
        unsafe {
            self.device
                .cmd_blit_image(self.cmd, src, src_layout, dst, dst_layout, regions, filter)
        }
    }

    fn resolve_image(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageResolve],
    ) {
        unsafe {
            self.device
                .cmd_resolve_image(self.cmd, src, src_layout, dst, dst_layout, regions)
        }
    }

    fn begin_query(&mut self, pool: vk::QueryPool, index: u32, flags: vk::QueryControlFlags) {
        unsafe { self.device.cmd_begin_query(self.cmd, pool, index, flags) }
    }

    fn end_query(&mut self, pool: vk::QueryPool, index: u32) {
        unsafe { self.device.cmd_end_query(self.cmd, pool, index) }
    }

    fn write_timestamp(&mut self, stage: vk::PipelineStageFlags2, pool: vk::QueryPool, index: u32) {
        unsafe { self.device.cmd_write_timestamp2(self.cmd, stage, pool, index) }
    }

    fn reset_query_pool(&mut self, pool: vk::QueryPool, first: u32, count: u32) {
        unsafe { self.device.cmd_reset_query_pool(self.cmd, pool, first, count) }
    }

    fn copy_query_pool_results(
        &mut self,
        pool: vk::QueryPool,
        first: u32,
        count: u32,
        dst: vk::Buffer,
        dst_offset: vk::DeviceSize,
        stride: vk::DeviceSize,
        flags: vk::QueryResultFlags,
    ) {
        unsafe {
            self.device
                .cmd_copy_query_pool_results(self.cmd, pool, first, count, dst, dst_offset, stride, flags)
        }
    }

    fn end(&mut self) -> Result<(), RhiError> {
        if self.ended {
            return Err(RhiError::InvalidArgument(format!("command buffer '{}' already ended", self.name)));
        }
        unsafe { self.device.end_command_buffer(self.cmd) }.map_err(RhiError::native("vkEndCommandBuffer"))?;
        self.ended = true;
        Ok(())
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

impl Drop for VulkanRecorder {
    fn drop(&mut self) {
        // Only recorders that never reached submission still own their pool.
        if let Some(pool) = self.pool.take() {
            log::warn!("Command buffer '{}' dropped without being submitted", self.name);
            pool.destroy(&self.device);
        }
    }
}
