//! A backend that records instead of executing.
//!
//! Handles are synthetic, memory lives in host vectors, and timeline values complete only when
//! the owner says so (or when someone waits on them).

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use ash::vk;
use ash::vk::Handle;
use meridian_core::collections::hashmap::HashMap;
use parking_lot::Mutex;
use crate::backend::{
    CommandRecorder, GpuBackend, NativeBuffer, NativeImage, NativeObject, RenderPassBegin, RenderPassKey,
};
use crate::barrier::{BufferBarrier, ImageBarrier, MemoryBarrier};
use crate::error::RhiError;
use crate::query::QueryType;
use crate::resource::{BufferDesc, TextureDesc, TextureViewDesc};

/// One recorded native command.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    PipelineBarrier {
        memory: Vec<MemoryBarrier>,
        buffers: Vec<BufferBarrier>,
        images: Vec<ImageBarrier>,
    },
    BeginRenderPass {
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: (u32, u32),
        clear_values: usize,
    },
    NextSubpass,
    EndRenderPass,
    BindPipeline {
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    },
    BindDescriptorSets {
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: Vec<vk::DescriptorSet>,
        dynamic_offsets: Vec<u32>,
    },
    PushConstants {
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: Vec<u8>,
    },
    BindVertexBuffers {
        first_binding: u32,
        buffers: Vec<vk::Buffer>,
        offsets: Vec<vk::DeviceSize>,
    },
    BindIndexBuffer {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    },
    SetViewports {
        first: u32,
        count: usize,
    },
    SetScissors {
        first: u32,
        count: usize,
    },
    SetStencilReference(u32),
    SetBlendConstants([f32; 4]),
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    DrawIndirect {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        draw_count: u32,
        stride: u32,
    },
    DrawIndexedIndirect {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        draw_count: u32,
        stride: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    DispatchIndirect {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
    },
    ClearColorImage {
        image: vk::Image,
        layout: vk::ImageLayout,
        ranges: usize,
    },
    ClearDepthStencilImage {
        image: vk::Image,
        layout: vk::ImageLayout,
        ranges: usize,
    },
    ClearAttachments {
        attachments: usize,
        rects: usize,
    },
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        /// (src offset, dst offset, size) per region.
        regions: Vec<(vk::DeviceSize, vk::DeviceSize, vk::DeviceSize)>,
    },
    CopyImage {
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: usize,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: usize,
    },
    CopyImageToBuffer {
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: usize,
    },
    BlitImage {
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        /// (src mip, dst mip) per region.
        mips: Vec<(u32, u32)>,
        filter: vk::Filter,
    },
    ResolveImage {
        src: vk::Image,
        dst: vk::Image,
        regions: usize,
    },
    BeginQuery {
        pool: vk::QueryPool,
        index: u32,
        flags: vk::QueryControlFlags,
    },
    EndQuery {
        pool: vk::QueryPool,
        index: u32,
    },
    WriteTimestamp {
        pool: vk::QueryPool,
        index: u32,
    },
    ResetQueryPool {
        pool: vk::QueryPool,
        first: u32,
        count: u32,
    },
    CopyQueryPoolResults {
        pool: vk::QueryPool,
        first: u32,
        count: u32,
        dst: vk::Buffer,
    },
}

impl Command {
    pub fn is_barrier(&self) -> bool {
        matches!(self, Command::PipelineBarrier { .. })
    }
}

/// Commands of one recorder, in recording order.
#[derive(Clone, Debug)]
pub struct RecordedCommands {
    pub name: String,
    pub handle: vk::CommandBuffer,
    pub commands: Vec<Command>,
}

#[derive(Clone, Debug)]
pub struct Submission {
    pub fence_value: u64,
    pub command_buffers: Vec<RecordedCommands>,
}

pub struct CaptureRecorder {
    recorded: RecordedCommands,
    ended: bool,
}

impl CaptureRecorder {
    fn push(&mut self, command: Command) {
        debug_assert!(!self.ended, "Recording into ended command buffer '{}'", self.recorded.name);
        self.recorded.commands.push(command);
    }

    pub fn commands(&self) -> &[Command] {
        &self.recorded.commands
    }
}

impl CommandRecorder for CaptureRecorder {
    fn handle(&self) -> vk::CommandBuffer {
        self.recorded.handle
    }

    fn pipeline_barrier(&mut self, memory: &[MemoryBarrier], buffers: &[BufferBarrier], images: &[ImageBarrier]) {
        self.push(Command::PipelineBarrier {
            memory: memory.to_vec(),
            buffers: buffers.to_vec(),
            images: images.to_vec(),
        });
    }

    fn begin_render_pass(&mut self, begin: &RenderPassBegin<'_>) {
        self.push(Command::BeginRenderPass {
            render_pass: begin.render_pass,
            framebuffer: begin.framebuffer,
            extent: (begin.extent.width, begin.extent.height),
            clear_values: begin.clear_values.len(),
        });
    }

    fn next_subpass(&mut self) {
        self.push(Command::NextSubpass);
    }

    fn end_render_pass(&mut self) {
        self.push(Command::EndRenderPass);
    }

    fn bind_pipeline(&mut self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        self.push(Command::BindPipeline { bind_point, pipeline });
    }

    fn bind_descriptor_sets(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        self.push(Command::BindDescriptorSets {
            bind_point,
            layout,
            first_set,
            sets: sets.to_vec(),
            dynamic_offsets: dynamic_offsets.to_vec(),
        });
    }

    fn push_constants(&mut self, layout: vk::PipelineLayout, stages: vk::ShaderStageFlags, offset: u32, data: &[u8]) {
        self.push(Command::PushConstants {
            layout,
            stages,
            offset,
            data: data.to_vec(),
        });
    }

    fn bind_vertex_buffers(&mut self, first_binding: u32, buffers: &[vk::Buffer], offsets: &[vk::DeviceSize]) {
        self.push(Command::BindVertexBuffers {
            first_binding,
            buffers: buffers.to_vec(),
            offsets: offsets.to_vec(),
        });
    }

    fn bind_index_buffer(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize, index_type: vk::IndexType) {
        self.push(Command::BindIndexBuffer { buffer, offset, index_type });
    }

    fn set_viewports(&mut self, first: u32, viewports: &[vk::Viewport]) {
        self.push(Command::SetViewports { first, count: viewports.len() });
    }

    fn set_scissors(&mut self, first: u32, scissors: &[vk::Rect2D]) {
        self.push(Command::SetScissors { first, count: scissors.len() });
    }

    fn set_stencil_reference(&mut self, reference: u32) {
        self.push(Command::SetStencilReference(reference));
    }

    fn set_blend_constants(&mut self, constants: [f32; 4]) {
        self.push(Command::SetBlendConstants(constants));
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        self.push(Command::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.push(Command::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        });
    }

    fn draw_indirect(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize, draw_count: u32, stride: u32) {
        self.push(Command::DrawIndirect { buffer, offset, draw_count, stride });
    }

    fn draw_indexed_indirect(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize, draw_count: u32, stride: u32) {
        self.push(Command::DrawIndexedIndirect { buffer, offset, draw_count, stride });
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.push(Command::Dispatch { x, y, z });
    }

    fn dispatch_indirect(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize) {
        self.push(Command::DispatchIndirect { buffer, offset });
    }

    fn clear_color_image(
        &mut self,
        image: vk::Image,
        layout: vk::ImageLayout,
        _color: &vk::ClearColorValue,
        ranges: &[vk::ImageSubresourceRange],
    ) {
        self.push(Command::ClearColorImage { image, layout, ranges: ranges.len() });
    }

    fn clear_depth_stencil_image(
        &mut self,
        image: vk::Image,
        layout: vk::ImageLayout,
        _value: &vk::ClearDepthStencilValue,
        ranges: &[vk::ImageSubresourceRange],
    ) {
        self.push(Command::ClearDepthStencilImage { image, layout, ranges: ranges.len() });
    }

    fn clear_attachments(&mut self, attachments: &[vk::ClearAttachment], rects: &[vk::ClearRect]) {
        self.push(Command::ClearAttachments {
            attachments: attachments.len(),
            rects: rects.len(),
        });
    }

    fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        self.push(Command::CopyBuffer {
            src,
            dst,
            regions: regions.iter().map(|r| (r.src_offset, r.dst_offset, r.size)).collect(),
        });
    }

    fn copy_image(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    ) {
        self.push(Command::CopyImage {
            src,
            src_layout,
            dst,
            dst_layout,
            regions: regions.len(),
        });
    }

    fn copy_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        self.push(Command::CopyBufferToImage {
            src,
            dst,
            dst_layout,
            regions: regions.len(),
        });
    }

    fn copy_image_to_buffer(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        self.push(Command::CopyImageToBuffer {
            src,
            src_layout,
            dst,
            regions: regions.len(),
        });
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
        self.push(Command::BlitImage {
            src,
            src_layout,
            dst,
            dst_layout,
            mips: regions
                .iter()
                .map(|r| (r.src_subresource.mip_level, r.dst_subresource.mip_level))
                .collect(),
            filter,
        });
    }

    fn resolve_image(
        &mut self,
        src: vk::Image,
        _src_layout: vk::ImageLayout,
        dst: vk::Image,
        _dst_layout: vk::ImageLayout,
        regions: &[vk::ImageResolve],
    ) {
        self.push(Command::ResolveImage { src, dst, regions: regions.len() });
    }

    fn begin_query(&mut self, pool: vk::QueryPool, index: u32, flags: vk::QueryControlFlags) {
        self.push(Command::BeginQuery { pool, index, flags });
    }

    fn end_query(&mut self, pool: vk::QueryPool, index: u32) {
        self.push(Command::EndQuery { pool, index });
    }

    fn write_timestamp(&mut self, _stage: vk::PipelineStageFlags2, pool: vk::QueryPool, index: u32) {
        self.push(Command::WriteTimestamp { pool, index });
    }

    fn reset_query_pool(&mut self, pool: vk::QueryPool, first: u32, count: u32) {
        self.push(Command::ResetQueryPool { pool, first, count });
    }

    fn copy_query_pool_results(
        &mut self,
        pool: vk::QueryPool,
        first: u32,
        count: u32,
        dst: vk::Buffer,
        _dst_offset: vk::DeviceSize,
        _stride: vk::DeviceSize,
        _flags: vk::QueryResultFlags,
    ) {
        self.push(Command::CopyQueryPoolResults { pool, first, count, dst });
    }

    fn end(&mut self) -> Result<(), RhiError> {
        if self.ended {
            return Err(RhiError::InvalidArgument(format!(
                "command buffer '{}' already ended",
                self.recorded.name
            )));
        }
        self.ended = true;
        Ok(())
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

#[derive(Default)]
struct CaptureLog {
    submissions: Vec<Submission>,
    destroyed: Vec<NativeObject>,
    destroyed_query_pools: Vec<vk::QueryPool>,
}

struct CaptureState {
    next_handle: AtomicU64,
    submitted: AtomicU64,
    completed: AtomicU64,
    log: Mutex<CaptureLog>,
    memory: Mutex<HashMap<vk::Buffer, Vec<u8>>>,
    query_results: Mutex<HashMap<(vk::QueryPool, u32), Vec<u64>>>,
}

/// Recording backend. Cloning shares the same log, so a test can keep a handle while the device owns another.
#[derive(Clone)]
pub struct CaptureBackend {
    state: Arc<CaptureState>,
}

impl Default for CaptureBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(CaptureState {
                next_handle: AtomicU64::new(0x1000),
                submitted: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                log: Mutex::new(CaptureLog::default()),
                memory: Mutex::new(HashMap::default()),
                query_results: Mutex::new(HashMap::default()),
            }),
        }
    }

    fn next_raw(&self) -> u64 {
        self.state.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// Mark every timeline value up to `value` (bounded by what was submitted) as complete.
    pub fn complete_up_to(&self, value: u64) {
        let value = value.min(self.state.submitted.load(Ordering::Acquire));
        self.state.completed.fetch_max(value, Ordering::AcqRel);
    }

    pub fn complete_all(&self) {
        self.complete_up_to(u64::MAX);
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.log.lock().submissions.clone()
    }

    /// Every submitted command, in submission order.
    pub fn submitted_commands(&self) -> Vec<Command> {
        self.state
            .log
            .lock()
            .submissions
            .iter()
            .flat_map(|s| s.command_buffers.iter())
            .flat_map(|c| c.commands.iter().cloned())
            .collect()
    }

    pub fn destroyed_objects(&self) -> Vec<NativeObject> {
        self.state.log.lock().destroyed.clone()
    }

    pub fn destroyed_query_pools(&self) -> Vec<vk::QueryPool> {
        self.state.log.lock().destroyed_query_pools.clone()
    }

    /// Results `query_results` will report for one slot.
    pub fn set_query_result(&self, pool: vk::QueryPool, index: u32, values: Vec<u64>) {
        self.state.query_results.lock().insert((pool, index), values);
    }

    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        self.state.memory.lock().get(&buffer).cloned()
    }
}

impl GpuBackend for CaptureBackend {
    fn name(&self) -> &str {
        "capture"
    }

    fn begin_commands(&self, name: &str) -> Result<Box<dyn CommandRecorder>, RhiError> {
        Ok(Box::new(CaptureRecorder {
            recorded: RecordedCommands {
                name: name.to_owned(),
                handle: vk::CommandBuffer::from_raw(self.next_raw()),
                commands: Vec::new(),
            },
            ended: false,
        }))
    }

    fn submit(&self, commands: Vec<Box<dyn CommandRecorder>>) -> Result<u64, RhiError> {
        let mut command_buffers = Vec::with_capacity(commands.len());
        for recorder in commands {
            let recorder = recorder
                .into_any()
                .downcast::<CaptureRecorder>()
                .map_err(|_| RhiError::Backend("foreign command buffer submitted to capture backend".into()))?;
            if !recorder.ended {
                return Err(RhiError::InvalidArgument(format!(
                    "command buffer '{}' submitted before it was ended",
                    recorder.recorded.name
                )));
            }
            command_buffers.push(recorder.recorded);
        }

        let mut log = self.state.log.lock();
        let fence_value = self.state.submitted.fetch_add(1, Ordering::AcqRel) + 1;
        log.submissions.push(Submission { fence_value, command_buffers });
        Ok(fence_value)
    }

    fn next_fence_value(&self) -> u64 {
        self.state.submitted.load(Ordering::Acquire) + 1
    }

    fn completed_fence_value(&self) -> u64 {
        self.state.completed.load(Ordering::Acquire)
    }

    fn wait_for_fence_value(&self, value: u64) -> Result<(), RhiError> {
        self.complete_up_to(value);
        Ok(())
    }

    fn wait_idle(&self) -> Result<(), RhiError> {
        self.complete_all();
        Ok(())
    }

    fn create_buffer(&self, desc: &BufferDesc, host_visible: bool) -> Result<NativeBuffer, RhiError> {
        let handle = vk::Buffer::from_raw(self.next_raw());
        if host_visible {
            self.state.memory.lock().insert(handle, vec![0; desc.size as usize]);
        }
        Ok(NativeBuffer {
            handle,
            memory: vk::DeviceMemory::from_raw(self.next_raw()),
        })
    }

    fn create_image(&self, _desc: &TextureDesc) -> Result<NativeImage, RhiError> {
        Ok(NativeImage {
            handle: vk::Image::from_raw(self.next_raw()),
            memory: vk::DeviceMemory::from_raw(self.next_raw()),
        })
    }

    fn create_image_view(
        &self,
        _image: vk::Image,
        _texture: &TextureDesc,
        _view: &TextureViewDesc,
    ) -> Result<vk::ImageView, RhiError> {
        Ok(vk::ImageView::from_raw(self.next_raw()))
    }

    fn create_render_pass(&self, _key: &RenderPassKey) -> Result<vk::RenderPass, RhiError> {
        Ok(vk::RenderPass::from_raw(self.next_raw()))
    }

    fn create_framebuffer(
        &self,
        _render_pass: vk::RenderPass,
        _attachments: &[vk::ImageView],
        _width: u32,
        _height: u32,
        _layers: u32,
    ) -> Result<vk::Framebuffer, RhiError> {
        Ok(vk::Framebuffer::from_raw(self.next_raw()))
    }

    fn create_query_pool(&self, _ty: QueryType, _count: u32) -> Result<vk::QueryPool, RhiError> {
        Ok(vk::QueryPool::from_raw(self.next_raw()))
    }

    fn destroy_query_pool(&self, pool: vk::QueryPool) {
        self.state.log.lock().destroyed_query_pools.push(pool);
    }

    fn destroy(&self, object: NativeObject) {
        if let NativeObject::Buffer(buffer) = object {
            self.state.memory.lock().remove(&buffer.handle);
        }
        self.state.log.lock().destroyed.push(object);
    }

    fn write_buffer(&self, buffer: &NativeBuffer, offset: vk::DeviceSize, data: &[u8]) -> Result<(), RhiError> {
        let mut memory = self.state.memory.lock();
        let contents = memory
            .get_mut(&buffer.handle)
            .ok_or_else(|| RhiError::InvalidArgument(format!("{:?} is not host visible", buffer.handle)))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > contents.len() {
            return Err(RhiError::InvalidArgument(format!(
                "write of {} bytes at {} overruns buffer of {} bytes",
                data.len(),
                offset,
                contents.len()
            )));
        }
        contents[start..end].copy_from_slice(data);
        Ok(())
    }

    fn query_results(&self, pool: vk::QueryPool, first: u32, count: u32, values_per_query: u32) -> Option<Vec<u64>> {
        let results = self.state.query_results.lock();
        let mut values = Vec::with_capacity((count * values_per_query) as usize);
        for index in first..first + count {
            let slot = results.get(&(pool, index))?;
            values.extend((0..values_per_query as usize).map(|i| slot.get(i).copied().unwrap_or(0)));
        }
        Some(values)
    }

    fn timestamp_period(&self) -> f32 {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeline_completes_only_on_request() {
        let backend = CaptureBackend::new();
        let mut recorder = backend.begin_commands("test").unwrap();
        recorder.dispatch(1, 1, 1);
        recorder.end().unwrap();
        assert_eq!(backend.next_fence_value(), 1);
        let value = backend.submit(vec![recorder]).unwrap();
        assert_eq!(value, 1);
        assert_eq!(backend.completed_fence_value(), 0);

        backend.complete_up_to(5);
        assert_eq!(backend.completed_fence_value(), 1);
        assert_eq!(backend.submitted_commands(), vec![Command::Dispatch { x: 1, y: 1, z: 1 }]);
    }

    #[test]
    fn unended_recorder_is_rejected() {
        let backend = CaptureBackend::new();
        let recorder = backend.begin_commands("open").unwrap();
        assert!(backend.submit(vec![recorder]).is_err());
    }

    #[test]
    fn host_visible_writes_land_in_memory() {
        let backend = CaptureBackend::new();
        let desc = BufferDesc::uniform("constants", 16);
        let buffer = backend.create_buffer(&desc, true).unwrap();
        backend.write_buffer(&buffer, 4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(
            backend.buffer_contents(buffer.handle).unwrap(),
            vec![0, 0, 0, 0, 1, 2, 3, 4, 0, 0, 0, 0, 0, 0, 0, 0]
        );
        assert!(backend.write_buffer(&buffer, 12, &[0; 8]).is_err());
    }
}
