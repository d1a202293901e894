//! Device contexts: the stateful recorders of one command stream.
//!
//! [`DeviceContext`] is generic over its [`ContextKind`]. Everything both flavors can do lives on
//! the generic impl; capabilities that mutate device-owned state are on `DeviceContext<Immediate>`
//! only, so a deferred context can not overwrite a resource's stored state by accident.

mod commands;
mod deferred;
mod immediate;
mod kind;
mod transition;

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use ash::vk;
use enumflags2::{bitflags, BitFlags};
use meridian_core::collections::hashmap::HashMap;
use smallvec::SmallVec;
use crate::command::CommandBuffer;
use crate::device::RenderDevice;
use crate::dynamic_heap::{DynamicAllocation, DynamicHeap};
use crate::error::verify;
use crate::fence::Fence;
use crate::object_cache::{VertexBindingSet, VertexStream};
use crate::resource::{BufferId, ObjectId, PipelineId, TextureViewId, MAX_BUFFER_SLOTS, MAX_RENDER_TARGETS};
use crate::state::ResourceState;

pub use commands::{
    CopyTextureAttribs, DrawAttribs, DrawIndexedAttribs, DrawIndirectAttribs, MappedBuffer, RenderPassClear,
    ResolveTextureAttribs, ShaderResourceBinding,
};
pub use deferred::CommandList;
pub use kind::{ContextKind, Deferred, DeferredContext, Immediate, ImmediateContext};
pub use transition::{StateTransitionDesc, StateUpdate, TransitionResource};

/// Bound state that must be re-recorded before the next draw or dispatch.
#[bitflags]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Dirty {
    VertexBuffers = 1 << 0,
    IndexBuffer = 1 << 1,
    Descriptors = 1 << 2,
    Viewports = 1 << 3,
    Scissors = 1 << 4,
    StencilRef = 1 << 5,
    BlendFactors = 1 << 6,
}

#[derive(Clone, Debug, Default)]
struct DescriptorBinding {
    sets: SmallVec<[vk::DescriptorSet; 4]>,
    first_set: u32,
    dynamic_offsets: SmallVec<[u32; 8]>,
}

pub struct DeviceContext<K: ContextKind> {
    name: String,
    device: Arc<RenderDevice>,
    cmd: Option<CommandBuffer>,

    pipeline: Option<PipelineId>,
    vertex_streams: [VertexStream; MAX_BUFFER_SLOTS],
    num_vertex_streams: usize,
    index_buffer: Option<BufferId>,
    index_offset: vk::DeviceSize,
    binding_set: Option<Arc<VertexBindingSet>>,
    descriptors: Option<DescriptorBinding>,

    render_targets: SmallVec<[TextureViewId; MAX_RENDER_TARGETS]>,
    depth_stencil: Option<TextureViewId>,
    render_pass: vk::RenderPass,
    framebuffer: vk::Framebuffer,
    framebuffer_extent: vk::Extent2D,
    framebuffer_layers: u32,
    /// Opened by `begin_render_pass`; transitions are a contract violation until it ends.
    explicit_pass: bool,

    viewports: SmallVec<[vk::Viewport; 4]>,
    scissors: SmallVec<[vk::Rect2D; 4]>,
    stencil_ref: u32,
    blend_factors: [f32; 4],
    dirty: BitFlags<Dirty>,

    dynamic_heap: DynamicHeap,
    dynamic_buffers: HashMap<BufferId, DynamicAllocation>,

    /// States this context has established since its last command list.
    local_states: HashMap<ObjectId, ResourceState>,
    state_updates: Vec<transition::StateUpdate>,

    pending_fence_signals: Vec<(Arc<Fence>, u64)>,
    /// End stamps of queries ended since the last submission.
    pending_queries: Vec<Arc<AtomicU64>>,
    commands_since_flush: u32,
    active_queries: u32,

    _kind: PhantomData<K>,
}

impl<K: ContextKind> DeviceContext<K> {
    pub(crate) fn new(name: &str, device: Arc<RenderDevice>) -> Self {
        let page_size = device.config().dynamic_heap_page_size;
        log::debug!("Created {} context '{}'", K::LABEL, name);
        Self {
            name: name.to_owned(),
            dynamic_heap: DynamicHeap::new(format!("{} dynamic heap", name), page_size),
            device,
            cmd: None,
            pipeline: None,
            vertex_streams: [VertexStream::default(); MAX_BUFFER_SLOTS],
            num_vertex_streams: 0,
            index_buffer: None,
            index_offset: 0,
            binding_set: None,
            descriptors: None,
            render_targets: SmallVec::new(),
            depth_stencil: None,
            render_pass: vk::RenderPass::null(),
            framebuffer: vk::Framebuffer::null(),
            framebuffer_extent: vk::Extent2D::default(),
            framebuffer_layers: 1,
            explicit_pass: false,
            viewports: SmallVec::new(),
            scissors: SmallVec::new(),
            stencil_ref: 0,
            blend_factors: [0.0; 4],
            dirty: BitFlags::all(),
            dynamic_buffers: HashMap::default(),
            local_states: HashMap::default(),
            state_updates: Vec::new(),
            pending_fence_signals: Vec::new(),
            pending_queries: Vec::new(),
            commands_since_flush: 0,
            active_queries: 0,
            _kind: PhantomData,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn device(&self) -> &Arc<RenderDevice> {
        &self.device
    }

    #[inline]
    pub fn is_deferred(&self) -> bool {
        K::DEFERRED
    }

    /// The open command buffer, if anything has been recorded since the last flush or command list.
    pub fn command_buffer_state(&self) -> Option<&crate::command::StateCache> {
        self.cmd.as_ref().map(CommandBuffer::state)
    }

    /// Native barrier calls recorded into the open command buffer.
    pub fn barrier_calls(&self) -> u32 {
        self.cmd.as_ref().map_or(0, CommandBuffer::barrier_calls)
    }

    /// The frame stamp of this context's dynamic allocations.
    pub fn frame(&self) -> u64 {
        self.dynamic_heap.frame()
    }

    /// Current allocation of a mapped dynamic buffer.
    pub fn dynamic_allocation(&self, buffer: BufferId) -> Option<DynamicAllocation> {
        self.dynamic_buffers.get(&buffer).copied()
    }

    /// The state this context believes `object` is in.
    ///
    /// Deferred contexts only know what they established themselves; the immediate context reads the
    /// device's stored state.
    pub fn known_state(&self, object: ObjectId) -> Option<ResourceState> {
        if K::DEFERRED {
            return self.local_states.get(&object).copied();
        }
        let state = match object {
            ObjectId::Buffer(id) => self.device.buffer_state(id),
            ObjectId::Texture(id) => self.device.texture_state(id),
            ObjectId::TextureView(_) | ObjectId::Pipeline(_) => None,
        };
        state.filter(|s| s.is_known())
    }

    fn command_buffer(&mut self) -> Option<&mut CommandBuffer> {
        if self.cmd.is_none() {
            match self.device.backend().begin_commands(&self.name) {
                Ok(recorder) => {
                    self.cmd = Some(CommandBuffer::new(recorder, self.device.config().shader_stages));
                    self.dirty = BitFlags::all();
                }
                Err(err) => {
                    log::error!("Context '{}' failed to begin a command buffer: {}", self.name, err);
                    return None;
                }
            }
        }
        self.cmd.as_mut()
    }

    /// End a render pass opened implicitly by a draw or clear. `op` must run outside of a pass.
    fn end_implicit_pass(&mut self, op: &str) {
        verify!(
            !self.explicit_pass,
            "{} is not allowed inside a render pass begun with begin_render_pass",
            op
        );
        if let Some(cmd) = self.cmd.as_mut() {
            if cmd.is_in_render_pass() {
                cmd.end_render_pass();
            }
        }
    }

    /// Native handle and base offset a command should use for `id`. Dynamic buffers resolve to their
    /// allocation in the current frame.
    fn resolve_buffer(&self, id: BufferId) -> Option<(vk::Buffer, vk::DeviceSize)> {
        let arena = self.device.arena();
        let Some(entry) = arena.buffers.get(&id) else {
            log::error!("{} is not registered with the device", id);
            return None;
        };
        if !entry.desc.is_dynamic() {
            return Some((entry.native.handle, 0));
        }
        match self.dynamic_buffers.get(&id) {
            Some(allocation) => {
                self.dynamic_heap.verify_allocation(allocation);
                Some((allocation.buffer, allocation.offset))
            }
            None => {
                log::error!(
                    "Dynamic buffer '{}' has not been mapped by context '{}' in this frame",
                    entry.desc.name,
                    self.name
                );
                None
            }
        }
    }

    fn invalidate_bindings(&mut self) {
        self.dirty = BitFlags::all();
        self.binding_set = None;
    }

    /// End the frame: dynamic allocations become invalid and their memory is returned once the GPU
    /// is past everything submitted so far.
    ///
    /// Call on every context once per frame, after its last command list was executed.
    pub fn finish_frame(&mut self) {
        if let Some(cmd) = self.cmd.as_ref() {
            if K::DEFERRED {
                log::error!(
                    "Deferred context '{}' finished its frame with commands that were never put into a command list",
                    self.name
                );
            } else {
                log::error!(
                    "Immediate context has outstanding commands when finishing the frame; flush before finish_frame"
                );
            }
            if cmd.is_in_render_pass() {
                log::error!("Context '{}' finished its frame inside a render pass", self.name);
            }
        }
        if self.active_queries > 0 {
            log::error!(
                "{} queries are still active in context '{}' at the end of the frame",
                self.active_queries,
                self.name
            );
        }

        self.device.release_master_blocks(self.dynamic_heap.release_master_blocks());
        self.dynamic_buffers.clear();
        self.invalidate_bindings();
        if !K::DEFERRED {
            self.device.purge_release_queue();
        }
    }
}

impl<K: ContextKind> Drop for DeviceContext<K> {
    fn drop(&mut self) {
        if self.cmd.is_some() {
            log::warn!("Context '{}' dropped with unsubmitted commands", self.name);
        }
        self.device.release_master_blocks(self.dynamic_heap.release_master_blocks());
        if !K::DEFERRED {
            self.device.release_immediate_context();
        }
    }
}

impl<K: ContextKind> std::fmt::Debug for DeviceContext<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("name", &self.name)
            .field("kind", &K::LABEL)
            .field("pipeline", &self.pipeline)
            .field("render_targets", &self.render_targets)
            .finish_non_exhaustive()
    }
}
