//! Native backend seam.
//!
//! The engine records through [`CommandRecorder`] and talks to the device through [`GpuBackend`].
//! [`vulkan::VulkanBackend`] drives a real GPU; [`capture::CaptureBackend`] records everything for
//! inspection and runs without one.

pub mod capture;
pub mod vulkan;

use std::any::Any;
use ash::vk;
use crate::barrier::{BufferBarrier, ImageBarrier, MemoryBarrier};
use crate::error::RhiError;
use crate::query::QueryType;
use crate::resource::{BufferDesc, TextureDesc, TextureViewDesc};

/// Native buffer plus the memory bound to it. `memory` is null when the backend manages it elsewhere.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct NativeBuffer {
    pub handle: vk::Buffer,
    pub memory: vk::DeviceMemory,
}

/// Native image plus its memory. `memory` is null for images the device does not own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct NativeImage {
    pub handle: vk::Image,
    pub memory: vk::DeviceMemory,
}

/// A native object waiting for the GPU to finish with it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NativeObject {
    Buffer(NativeBuffer),
    Image(NativeImage),
    ImageView(vk::ImageView),
    Framebuffer(vk::Framebuffer),
    RenderPass(vk::RenderPass),
    Pipeline(vk::Pipeline),
}

/// Parameters of a render pass instance.
pub struct RenderPassBegin<'a> {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub clear_values: &'a [vk::ClearValue],
}

/// Attachment formats a render pass is built for.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RenderPassKey {
    pub color_formats: smallvec::SmallVec<[vk::Format; 8]>,
    pub depth_format: Option<vk::Format>,
    pub samples: vk::SampleCountFlags,
}

/// One native command buffer in the recording state.
///
/// Implementations forward each call to the native API and keep no state of their own;
/// redundancy elimination and validation happen in [`crate::CommandBuffer`].
pub trait CommandRecorder: Send {
    fn handle(&self) -> vk::CommandBuffer;

    fn pipeline_barrier(&mut self, memory: &[MemoryBarrier], buffers: &[BufferBarrier], images: &[ImageBarrier]);

    fn begin_render_pass(&mut self, begin: &RenderPassBegin<'_>);
    fn next_subpass(&mut self);
    fn end_render_pass(&mut self);

    fn bind_pipeline(&mut self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline);
    fn bind_descriptor_sets(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    );
    fn push_constants(&mut self, layout: vk::PipelineLayout, stages: vk::ShaderStageFlags, offset: u32, data: &[u8]);
    fn bind_vertex_buffers(&mut self, first_binding: u32, buffers: &[vk::Buffer], offsets: &[vk::DeviceSize]);
    fn bind_index_buffer(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize, index_type: vk::IndexType);

    fn set_viewports(&mut self, first: u32, viewports: &[vk::Viewport]);
    fn set_scissors(&mut self, first: u32, scissors: &[vk::Rect2D]);
    fn set_stencil_reference(&mut self, reference: u32);
    fn set_blend_constants(&mut self, constants: [f32; 4]);

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32);
    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );
    fn draw_indirect(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize, draw_count: u32, stride: u32);
    fn draw_indexed_indirect(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize, draw_count: u32, stride: u32);
    fn dispatch(&mut self, x: u32, y: u32, z: u32);
    fn dispatch_indirect(&mut self, buffer: vk::Buffer, offset: vk::DeviceSize);

    fn clear_color_image(
        &mut self,
        image: vk::Image,
        layout: vk::ImageLayout,
        color: &vk::ClearColorValue,
        ranges: &[vk::ImageSubresourceRange],
    );
    fn clear_depth_stencil_image(
        &mut self,
        image: vk::Image,
        layout: vk::ImageLayout,
        value: &vk::ClearDepthStencilValue,
        ranges: &[vk::ImageSubresourceRange],
    );
    fn clear_attachments(&mut self, attachments: &[vk::ClearAttachment], rects: &[vk::ClearRect]);

    fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]);
    fn copy_image(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    );
    fn copy_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );
    fn copy_image_to_buffer(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    );
    fn blit_image(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    );
    fn resolve_image(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageResolve],
    );

    fn begin_query(&mut self, pool: vk::QueryPool, index: u32, flags: vk::QueryControlFlags);
    fn end_query(&mut self, pool: vk::QueryPool, index: u32);
    fn write_timestamp(&mut self, stage: vk::PipelineStageFlags2, pool: vk::QueryPool, index: u32);
    fn reset_query_pool(&mut self, pool: vk::QueryPool, first: u32, count: u32);
    fn copy_query_pool_results(
        &mut self,
        pool: vk::QueryPool,
        first: u32,
        count: u32,
        dst: vk::Buffer,
        dst_offset: vk::DeviceSize,
        stride: vk::DeviceSize,
        flags: vk::QueryResultFlags,
    );

    /// Close the command buffer. Nothing may be recorded afterwards.
    fn end(&mut self) -> Result<(), RhiError>;

    /// Hand the recorder back to the backend that created it, for submission.
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

/// Device-level services the engine needs from a native backend.
pub trait GpuBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Start recording a new command buffer.
    fn begin_commands(&self, name: &str) -> Result<Box<dyn CommandRecorder>, RhiError>;

    /// Submit ended command buffers in order. Returns the timeline value signaled when they complete.
    fn submit(&self, commands: Vec<Box<dyn CommandRecorder>>) -> Result<u64, RhiError>;

    /// The value the next submission will signal.
    fn next_fence_value(&self) -> u64;
    fn completed_fence_value(&self) -> u64;
    fn wait_for_fence_value(&self, value: u64) -> Result<(), RhiError>;
    fn wait_idle(&self) -> Result<(), RhiError>;

    fn create_buffer(&self, desc: &BufferDesc, host_visible: bool) -> Result<NativeBuffer, RhiError>;
    fn create_image(&self, desc: &TextureDesc) -> Result<NativeImage, RhiError>;
    fn create_image_view(
        &self,
        image: vk::Image,
        texture: &TextureDesc,
        view: &TextureViewDesc,
    ) -> Result<vk::ImageView, RhiError>;
    fn create_render_pass(&self, key: &RenderPassKey) -> Result<vk::RenderPass, RhiError>;
    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        width: u32,
        height: u32,
        layers: u32,
    ) -> Result<vk::Framebuffer, RhiError>;
    fn create_query_pool(&self, ty: QueryType, count: u32) -> Result<vk::QueryPool, RhiError>;
    fn destroy_query_pool(&self, pool: vk::QueryPool);

    /// Destroy an object the GPU no longer uses.
    fn destroy(&self, object: NativeObject);

    /// Copy `data` into a host-visible buffer.
    fn write_buffer(&self, buffer: &NativeBuffer, offset: vk::DeviceSize, data: &[u8]) -> Result<(), RhiError>;

    /// Read 64-bit results of `count` consecutive queries. `None` while any of them is not available.
    fn query_results(&self, pool: vk::QueryPool, first: u32, count: u32, values_per_query: u32) -> Option<Vec<u64>>;

    /// Nanoseconds per timestamp tick.
    fn timestamp_period(&self) -> f32;
}
