//! Stateful wrapper over a native command recorder.
//!
//! The wrapper elides redundant binds, keeps track of the open render pass, and defers barriers
//! until the next command that depends on them. It trusts its caller: contract violations are
//! `verify!` checks, not errors.

use ash::vk;
use crate::backend::{CommandRecorder, RenderPassBegin};
use crate::barrier::{BarrierBatch, BufferBarrier, ImageBarrier, MemoryBarrier, SubresourceRange};
use crate::error::{verify, RhiError};
use crate::query::{QueryManager, QueryType};

/// What is currently bound on the native command buffer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StateCache {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub framebuffer_extent: vk::Extent2D,
    pub graphics_pipeline: vk::Pipeline,
    pub compute_pipeline: vk::Pipeline,
    pub index_buffer: vk::Buffer,
    pub index_offset: vk::DeviceSize,
    pub index_type: vk::IndexType,
    /// One bit per [`QueryType`] begun inside the open render pass.
    pub inside_pass_queries: u32,
    /// One bit per [`QueryType`] begun outside any render pass.
    pub outside_pass_queries: u32,
}

impl Default for StateCache {
    fn default() -> Self {
        Self {
            render_pass: vk::RenderPass::null(),
            framebuffer: vk::Framebuffer::null(),
            framebuffer_extent: vk::Extent2D::default(),
            graphics_pipeline: vk::Pipeline::null(),
            compute_pipeline: vk::Pipeline::null(),
            index_buffer: vk::Buffer::null(),
            index_offset: 0,
            index_type: vk::IndexType::UINT32,
            inside_pass_queries: 0,
            outside_pass_queries: 0,
        }
    }
}

pub struct CommandBuffer {
    recorder: Box<dyn CommandRecorder>,
    state: StateCache,
    barriers: BarrierBatch,
    shader_stages: vk::PipelineStageFlags2,
    barrier_calls: u32,
}

impl CommandBuffer {
    pub fn new(recorder: Box<dyn CommandRecorder>, shader_stages: vk::PipelineStageFlags2) -> Self {
        Self {
            recorder,
            state: StateCache::default(),
            barriers: BarrierBatch::default(),
            shader_stages,
            barrier_calls: 0,
        }
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.recorder.handle()
    }

    #[inline]
    pub fn state(&self) -> &StateCache {
        &self.state
    }

    #[inline]
    pub fn is_in_render_pass(&self) -> bool {
        self.state.render_pass != vk::RenderPass::null()
    }

    /// Native barrier calls recorded so far.
    #[inline]
    pub fn barrier_calls(&self) -> u32 {
        self.barrier_calls
    }

    #[inline]
    pub fn has_pending_barriers(&self) -> bool {
        !self.barriers.is_empty()
    }

    /// Emit every pending barrier as one native call.
    pub fn flush_barriers(&mut self) {
        if self.barriers.is_empty() {
            return;
        }
        verify!(!self.is_in_render_pass(), "Barriers can not be flushed inside a render pass");
        log::trace!(
            "Emitting {} image, {} buffer and {} memory barriers",
            self.barriers.images().len(),
            self.barriers.buffers().len(),
            self.barriers.memory().len()
        );
        self.recorder
            .pipeline_barrier(self.barriers.memory(), self.barriers.buffers(), self.barriers.images());
        self.barriers.clear();
        self.barrier_calls += 1;
    }

    /// Begin `render_pass`. Does nothing if the same pass and framebuffer are already open.
    pub fn begin_render_pass(
        &mut self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_values: &[vk::ClearValue],
    ) {
        if self.state.render_pass == render_pass && self.state.framebuffer == framebuffer {
            return;
        }
        verify!(
            !self.is_in_render_pass(),
            "A render pass is already open; end it before beginning another one"
        );
        self.flush_barriers();
        self.recorder.begin_render_pass(&RenderPassBegin {
            render_pass,
            framebuffer,
            extent,
            clear_values,
        });
        self.state.render_pass = render_pass;
        self.state.framebuffer = framebuffer;
        self.state.framebuffer_extent = extent;
    }

    pub fn next_subpass(&mut self) {
        verify!(self.is_in_render_pass(), "next_subpass outside of a render pass");
        self.recorder.next_subpass();
    }

    pub fn end_render_pass(&mut self) {
        verify!(self.is_in_render_pass(), "end_render_pass without an open render pass");
        if self.state.inside_pass_queries != 0 {
            log::error!(
                "Ending a render pass with queries still active inside it (mask {:#b}); their results will be undefined",
                self.state.inside_pass_queries
            );
        }
        self.recorder.end_render_pass();
        self.state.render_pass = vk::RenderPass::null();
        self.state.framebuffer = vk::Framebuffer::null();
        self.state.framebuffer_extent = vk::Extent2D::default();
    }

    fn end_render_pass_if_open(&mut self) {
        if self.is_in_render_pass() {
            self.end_render_pass();
        }
    }

    pub fn bind_graphics_pipeline(&mut self, pipeline: vk::Pipeline) {
        if self.state.graphics_pipeline == pipeline {
            return;
        }
        self.recorder.bind_pipeline(vk::PipelineBindPoint::GRAPHICS, pipeline);
        self.state.graphics_pipeline = pipeline;
    }

    pub fn bind_compute_pipeline(&mut self, pipeline: vk::Pipeline) {
        if self.state.compute_pipeline == pipeline {
            return;
        }
        self.recorder.bind_pipeline(vk::PipelineBindPoint::COMPUTE, pipeline);
        self.state.compute_pipeline = pipeline;
    }

    pub fn bind_descriptor_sets(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        self.recorder
            .bind_descriptor_sets(bind_point, layout, first_set, sets, dynamic_offsets);
    }

    pub fn push_constants(&mut self, layout: vk::PipelineLayout, stages: vk::ShaderStageFlags, offset: u32, data: &[u8]) {
        self.recorder.push_constants(layout, stages, offset, data);
    }

    pub fn bind_vertex_buffers(&mut self, first_binding: u32, buffers: &[vk::Buffer], offsets: &[vk::DeviceSize]) {
        verify!(buffers.len() == offsets.len(), "Every vertex buffer needs an offset");
        self.recorder.bind_vertex_buffers(first_binding, buffers, offsets);
    }

    pub fn bind_index_buffer(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize, index_type: vk::IndexType) {
        if self.state.index_buffer == buffer && self.state.index_offset == offset && self.state.index_type == index_type {
            return;
        }
        self.recorder.bind_index_buffer(buffer, offset, index_type);
        self.state.index_buffer = buffer;
        self.state.index_offset = offset;
        self.state.index_type = index_type;
    }

    pub fn set_viewports(&mut self, first: u32, viewports: &[vk::Viewport]) {
        self.recorder.set_viewports(first, viewports);
    }

    pub fn set_scissors(&mut self, first: u32, scissors: &[vk::Rect2D]) {
        self.recorder.set_scissors(first, scissors);
    }

    pub fn set_stencil_reference(&mut self, reference: u32) {
        self.recorder.set_stencil_reference(reference);
    }

    pub fn set_blend_constants(&mut self, constants: [f32; 4]) {
        self.recorder.set_blend_constants(constants);
    }

    #[inline]
    fn verify_draw(&self) {
        verify!(self.is_in_render_pass(), "Draw commands must be recorded inside a render pass");
        verify!(
            self.state.graphics_pipeline != vk::Pipeline::null(),
            "No graphics pipeline is bound"
        );
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        self.verify_draw();
        self.recorder.draw(vertex_count, instance_count, first_vertex, first_instance);
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.verify_draw();
        verify!(self.state.index_buffer != vk::Buffer::null(), "No index buffer is bound");
        self.recorder
            .draw_indexed(index_count, instance_count, first_index, vertex_offset, first_instance);
    }

    pub fn draw_indirect(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize, draw_count: u32, stride: u32) {
        self.verify_draw();
        self.recorder.draw_indirect(buffer, offset, draw_count, stride);
    }

    pub fn draw_indexed_indirect(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize, draw_count: u32, stride: u32) {
        self.verify_draw();
        verify!(self.state.index_buffer != vk::Buffer::null(), "No index buffer is bound");
        self.recorder.draw_indexed_indirect(buffer, offset, draw_count, stride);
    }

    #[inline]
    fn verify_dispatch(&self) {
        verify!(!self.is_in_render_pass(), "Dispatch must be recorded outside of a render pass");
        verify!(
            self.state.compute_pipeline != vk::Pipeline::null(),
            "No compute pipeline is bound"
        );
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.verify_dispatch();
        self.flush_barriers();
        self.recorder.dispatch(x, y, z);
    }

    pub fn dispatch_indirect(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize) {
        self.verify_dispatch();
        self.flush_barriers();
        self.recorder.dispatch_indirect(buffer, offset);
    }

    #[inline]
    fn verify_outside_pass(&self, op: &str) {
        verify!(!self.is_in_render_pass(), "{} must be recorded outside of a render pass", op);
    }

    pub fn clear_color_image(
        &mut self,
        image: vk::Image,
        color: &vk::ClearColorValue,
        ranges: &[vk::ImageSubresourceRange],
    ) {
        self.verify_outside_pass("clear_color_image");
        self.flush_barriers();
        self.recorder
            .clear_color_image(image, vk::ImageLayout::TRANSFER_DST_OPTIMAL, color, ranges);
    }

    pub fn clear_depth_stencil_image(
        &mut self,
        image: vk::Image,
        value: &vk::ClearDepthStencilValue,
        ranges: &[vk::ImageSubresourceRange],
    ) {
        self.verify_outside_pass("clear_depth_stencil_image");
        self.flush_barriers();
        self.recorder
            .clear_depth_stencil_image(image, vk::ImageLayout::TRANSFER_DST_OPTIMAL, value, ranges);
    }

    pub fn clear_attachments(&mut self, attachments: &[vk::ClearAttachment], rects: &[vk::ClearRect]) {
        verify!(self.is_in_render_pass(), "clear_attachments must be recorded inside a render pass");
        self.recorder.clear_attachments(attachments, rects);
    }

    pub fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        self.verify_outside_pass("copy_buffer");
        self.flush_barriers();
        self.recorder.copy_buffer(src, dst, regions);
    }

    pub fn copy_image(&mut self, src: vk::Image, dst: vk::Image, regions: &[vk::ImageCopy]) {
        self.verify_outside_pass("copy_image");
        self.flush_barriers();
        self.recorder.copy_image(
            src,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            dst,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            regions,
        );
    }

    pub fn copy_buffer_to_image(&mut self, src: vk::Buffer, dst: vk::Image, regions: &[vk::BufferImageCopy]) {
        self.verify_outside_pass("copy_buffer_to_image");
        self.flush_barriers();
        self.recorder
            .copy_buffer_to_image(src, dst, vk::ImageLayout::TRANSFER_DST_OPTIMAL, regions);
    }

    pub fn copy_image_to_buffer(&mut self, src: vk::Image, dst: vk::Buffer, regions: &[vk::BufferImageCopy]) {
        self.verify_outside_pass("copy_image_to_buffer");
        self.flush_barriers();
        self.recorder
            .copy_image_to_buffer(src, vk::ImageLayout::TRANSFER_SRC_OPTIMAL, dst, regions);
    }

    pub fn blit_image(&mut self, src: vk::Image, dst: vk::Image, regions: &[vk::ImageBlit], filter: vk::Filter) {
        self.verify_outside_pass("blit_image");
        self.flush_barriers();
        self.recorder.blit_image(
            src,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            dst,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            regions,
            filter,
        );
    }

    pub fn resolve_image(&mut self, src: vk::Image, dst: vk::Image, regions: &[vk::ImageResolve]) {
        self.verify_outside_pass("resolve_image");
        self.flush_barriers();
        self.recorder.resolve_image(
            src,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            dst,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            regions,
        );
    }

    /// Queue a layout transition. An open render pass is ended first.
    pub fn transition_image_layout(
        &mut self,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        range: SubresourceRange,
    ) {
        verify!(
            new_layout != vk::ImageLayout::UNDEFINED && new_layout != vk::ImageLayout::PREINITIALIZED,
            "Images can not be transitioned to {:?}",
            new_layout
        );
        self.end_render_pass_if_open();

        let barrier = ImageBarrier::from_layouts(image, old_layout, new_layout, range, self.shader_stages);
        if self.barriers.conflicts_with_image(&barrier) {
            self.flush_barriers();
        }
        log::trace!("{:?}: {:?} -> {:?} {:?}", image, old_layout, new_layout, range);
        self.barriers.push_image(barrier);
    }

    /// Queue a buffer memory dependency. An open render pass is ended first.
    pub fn buffer_memory_barrier(
        &mut self,
        buffer: vk::Buffer,
        src_access: vk::AccessFlags2,
        dst_access: vk::AccessFlags2,
    ) {
        self.end_render_pass_if_open();

        let barrier = BufferBarrier::from_access(buffer, src_access, dst_access, self.shader_stages);
        if self.barriers.conflicts_with_buffer(&barrier) {
            self.flush_barriers();
        }
        log::trace!("{:?}: {:?} -> {:?}", buffer, src_access, dst_access);
        self.barriers.push_buffer(barrier);
    }

    pub fn memory_barrier(&mut self, barrier: MemoryBarrier) {
        self.end_render_pass_if_open();
        self.barriers.push_memory(barrier);
    }

    fn active_queries(&mut self) -> &mut u32 {
        if self.is_in_render_pass() {
            &mut self.state.inside_pass_queries
        } else {
            &mut self.state.outside_pass_queries
        }
    }

    /// Begin a scoped query. A second active query of the same type is rejected.
    pub fn begin_query(&mut self, ty: QueryType, pool: vk::QueryPool, index: u32, flags: vk::QueryControlFlags) -> bool {
        let bit = ty.bit();
        let active = *self.active_queries();
        if active & bit != 0 {
            log::error!(
                "Another {} query is already active in this command buffer; only one query of a type may be active at a time",
                ty
            );
            return false;
        }
        self.flush_barriers_outside_pass();
        *self.active_queries() |= bit;
        self.recorder.begin_query(pool, index, flags);
        true
    }

    pub fn end_query(&mut self, ty: QueryType, pool: vk::QueryPool, index: u32) {
        let bit = ty.bit();
        let active = self.active_queries();
        verify!(*active & bit != 0, "No {} query is active in this scope", ty);
        *active &= !bit;
        self.recorder.end_query(pool, index);
    }

    pub fn write_timestamp(&mut self, pool: vk::QueryPool, index: u32) {
        self.flush_barriers_outside_pass();
        self.recorder
            .write_timestamp(vk::PipelineStageFlags2::BOTTOM_OF_PIPE, pool, index);
    }

    pub fn reset_query_pool(&mut self, pool: vk::QueryPool, first: u32, count: u32) {
        self.verify_outside_pass("reset_query_pool");
        self.flush_barriers();
        self.recorder.reset_query_pool(pool, first, count);
    }

    /// Record resets for every stale slot of `manager`. Returns the number of slots reset.
    pub fn reset_stale_queries(&mut self, manager: &QueryManager) -> u32 {
        self.verify_outside_pass("reset_stale_queries");
        self.flush_barriers();
        manager.reset_stale_queries(self.recorder.as_mut())
    }

    fn flush_barriers_outside_pass(&mut self) {
        if !self.is_in_render_pass() {
            self.flush_barriers();
        }
    }

    /// Close the command buffer: end an open render pass, emit pending barriers, and hand back the recorder.
    pub fn end(mut self) -> Result<Box<dyn CommandRecorder>, RhiError> {
        self.end_render_pass_if_open();
        self.flush_barriers();
        if self.state.outside_pass_queries != 0 {
            log::error!(
                "Command buffer ended with active queries (mask {:#b})",
                self.state.outside_pass_queries
            );
        }
        self.recorder.end()?;
        Ok(self.recorder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::capture::{CaptureBackend, CaptureRecorder, Command};
    use crate::backend::GpuBackend;
    use ash::vk::Handle;

    const STAGES: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::from_raw(
        vk::PipelineStageFlags2::VERTEX_SHADER.as_raw()
            | vk::PipelineStageFlags2::FRAGMENT_SHADER.as_raw()
            | vk::PipelineStageFlags2::COMPUTE_SHADER.as_raw(),
    );

    fn command_buffer() -> CommandBuffer {
        let backend = CaptureBackend::new();
        CommandBuffer::new(backend.begin_commands("test").unwrap(), STAGES)
    }

    fn recorded(cmd: CommandBuffer) -> Vec<Command> {
        let recorder = cmd.end().unwrap();
        recorder
            .into_any()
            .downcast::<CaptureRecorder>()
            .unwrap()
            .commands()
            .to_vec()
    }

    fn color_range() -> SubresourceRange {
        SubresourceRange::whole(vk::ImageAspectFlags::COLOR, 1, 1)
    }

    #[test]
    fn layout_transition_ends_open_render_pass() {
        let mut cmd = command_buffer();
        let pass = vk::RenderPass::from_raw(1);
        let framebuffer = vk::Framebuffer::from_raw(2);
        cmd.begin_render_pass(pass, framebuffer, vk::Extent2D { width: 4, height: 4 }, &[]);
        assert!(cmd.is_in_render_pass());

        cmd.transition_image_layout(
            vk::Image::from_raw(3),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            color_range(),
        );
        assert_eq!(cmd.state().render_pass, vk::RenderPass::null());
        assert_eq!(cmd.state().framebuffer, vk::Framebuffer::null());

        let commands = recorded(cmd);
        let end = commands.iter().position(|c| *c == Command::EndRenderPass).unwrap();
        let barrier = commands.iter().position(Command::is_barrier).unwrap();
        assert!(end < barrier);
    }

    #[test]
    fn redundant_binds_are_elided() {
        let mut cmd = command_buffer();
        let pipeline = vk::Pipeline::from_raw(7);
        let pass = vk::RenderPass::from_raw(1);
        let framebuffer = vk::Framebuffer::from_raw(2);
        let extent = vk::Extent2D { width: 4, height: 4 };

        cmd.begin_render_pass(pass, framebuffer, extent, &[]);
        cmd.begin_render_pass(pass, framebuffer, extent, &[]);
        cmd.bind_graphics_pipeline(pipeline);
        cmd.bind_graphics_pipeline(pipeline);
        cmd.bind_index_buffer(vk::Buffer::from_raw(9), 0, vk::IndexType::UINT16);
        cmd.bind_index_buffer(vk::Buffer::from_raw(9), 0, vk::IndexType::UINT16);
        cmd.draw_indexed(3, 1, 0, 0, 0);

        let commands = recorded(cmd);
        let count = |f: fn(&Command) -> bool| commands.iter().filter(|c| f(c)).count();
        assert_eq!(count(|c| matches!(c, Command::BeginRenderPass { .. })), 1);
        assert_eq!(count(|c| matches!(c, Command::BindPipeline { .. })), 1);
        assert_eq!(count(|c| matches!(c, Command::BindIndexBuffer { .. })), 1);
    }

    #[test]
    fn barriers_are_batched_until_needed() {
        let mut cmd = command_buffer();
        for raw in 1..=3 {
            cmd.transition_image_layout(
                vk::Image::from_raw(raw),
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                color_range(),
            );
        }
        assert_eq!(cmd.barrier_calls(), 0);
        cmd.copy_buffer(vk::Buffer::from_raw(4), vk::Buffer::from_raw(5), &[]);
        assert_eq!(cmd.barrier_calls(), 1);

        let commands = recorded(cmd);
        match &commands[0] {
            Command::PipelineBarrier { images, .. } => assert_eq!(images.len(), 3),
            other => panic!("expected a barrier, got {:?}", other),
        }
    }

    #[test]
    fn conflicting_barriers_are_split() {
        let mut cmd = command_buffer();
        let image = vk::Image::from_raw(1);
        cmd.transition_image_layout(
            image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            color_range(),
        );
        cmd.transition_image_layout(
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            color_range(),
        );
        assert_eq!(cmd.barrier_calls(), 1);
        cmd.flush_barriers();
        assert_eq!(cmd.barrier_calls(), 2);
    }

    #[test]
    fn second_query_of_a_type_is_rejected() {
        let mut cmd = command_buffer();
        let pool = vk::QueryPool::from_raw(1);
        assert!(cmd.begin_query(QueryType::Occlusion, pool, 0, vk::QueryControlFlags::PRECISE));
        assert!(!cmd.begin_query(QueryType::Occlusion, pool, 1, vk::QueryControlFlags::PRECISE));
        assert!(cmd.begin_query(QueryType::PipelineStatistics, pool, 2, vk::QueryControlFlags::empty()));
        cmd.end_query(QueryType::Occlusion, pool, 0);
        cmd.end_query(QueryType::PipelineStatistics, pool, 2);

        let commands = recorded(cmd);
        assert_eq!(
            commands.iter().filter(|c| matches!(c, Command::BeginQuery { .. })).count(),
            2
        );
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "Dispatch must be recorded outside of a render pass")]
    fn dispatch_inside_render_pass_is_a_contract_violation() {
        let mut cmd = command_buffer();
        cmd.begin_render_pass(
            vk::RenderPass::from_raw(1),
            vk::Framebuffer::from_raw(2),
            vk::Extent2D { width: 1, height: 1 },
            &[],
        );
        cmd.bind_compute_pipeline(vk::Pipeline::from_raw(3));
        cmd.dispatch(1, 1, 1);
    }
}
