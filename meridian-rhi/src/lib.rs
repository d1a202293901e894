//! Meridian RHI - device contexts, command recording and resource state tracking on Vulkan.
//!
//! A [`RenderDevice`] owns resources, the shared caches and the release queue. Commands are recorded
//! through an [`ImmediateContext`] (one per device, submits to the queue) or any number of
//! [`DeferredContext`]s (record [`CommandList`]s on worker threads for the immediate context to execute).

extern crate self as meridian_rhi;

pub mod backend;
pub mod barrier;
pub mod command;
pub mod config;
pub mod context;
pub mod device;
pub mod dynamic_heap;
pub mod error;
pub mod fence;
pub mod framebuffer_cache;
pub mod generate_mips;
pub mod object_cache;
pub mod query;
mod release_queue;
pub mod resource;
pub mod state;
mod utility;

#[doc(hidden)]
pub use paste::paste;

pub use memoffset;
pub use meridian_rhi_derive::VertexLayout;

pub use ash::vk;
pub use backend::capture::CaptureBackend;
pub use backend::vulkan::VulkanBackend;
pub use backend::{CommandRecorder, GpuBackend, NativeObject};
pub use barrier::SubresourceRange;
pub use command::{CommandBuffer, StateCache};
pub use config::{DeviceConfig, DeviceConfigBuilder, DeviceConfigBuilderError, QueryPoolSizes};
pub use context::{
    CommandList, ContextKind, CopyTextureAttribs, Deferred, DeferredContext, DeviceContext, DrawAttribs,
    DrawIndexedAttribs, DrawIndirectAttribs, Immediate, ImmediateContext, MappedBuffer, RenderPassClear,
    ResolveTextureAttribs, ShaderResourceBinding, StateTransitionDesc, StateUpdate, TransitionResource,
};
pub use device::RenderDevice;
pub use dynamic_heap::DynamicAllocation;
pub use error::RhiError;
pub use fence::Fence;
pub use framebuffer_cache::FramebufferCacheStats;
pub use generate_mips::{MipComputeProvider, MipVariant};
pub use object_cache::{ObjectCacheStats, VertexStream};
pub use query::{PipelineStatistics, Query, QueryData, QueryType, StaleQueryReuse};
pub use resource::{
    BufferDesc, BufferId, LayoutElement, ObjectId, PipelineDesc, PipelineId, PipelineKind, TextureDesc,
    TextureDimension, TextureId, TextureViewDesc, TextureViewId, TextureViewType, Usage, VertexLayout,
    MAX_BUFFER_SLOTS, MAX_RENDER_TARGETS,
};
pub use state::{ResourceState, StateTransitionMode};
