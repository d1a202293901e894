//! Commands shared by immediate and deferred contexts.

use ash::vk;
use derive_more::{Deref, DerefMut};
use smallvec::SmallVec;
use crate::context::{ContextKind, DescriptorBinding, DeviceContext, Dirty, TransitionResource};
use crate::dynamic_heap::DynamicAllocation;
use crate::error::verify;
use crate::framebuffer_cache::FramebufferKey;
use crate::backend::RenderPassKey;
use crate::barrier::SubresourceRange;
use crate::generate_mips::MipJob;
use crate::object_cache::VertexStream;
use crate::resource::{
    BufferId, ObjectId, PipelineId, PipelineKind, TextureId, TextureViewId, TextureViewType, MAX_BUFFER_SLOTS,
    MAX_RENDER_TARGETS,
};
use crate::state::{format_aspect_mask, resource_state_to_image_layout, ResourceState, StateTransitionMode};
use crate::utility::normalize_range_u64;

/// Offsets handed out by `map_buffer` satisfy every uniform and storage buffer alignment we target.
const MAP_ALIGNMENT: vk::DeviceSize = 256;
const UPLOAD_ALIGNMENT: vk::DeviceSize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrawAttribs {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

impl DrawAttribs {
    pub fn new(vertex_count: u32) -> Self {
        Self {
            vertex_count,
            instance_count: 1,
            first_vertex: 0,
            first_instance: 0,
        }
    }

    pub fn instanced(mut self, instance_count: u32) -> Self {
        self.instance_count = instance_count;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrawIndexedAttribs {
    pub index_count: u32,
    pub index_type: vk::IndexType,
    pub instance_count: u32,
    pub first_index: u32,
    pub base_vertex: i32,
    pub first_instance: u32,
}

impl DrawIndexedAttribs {
    pub fn new(index_count: u32, index_type: vk::IndexType) -> Self {
        Self {
            index_count,
            index_type,
            instance_count: 1,
            first_index: 0,
            base_vertex: 0,
            first_instance: 0,
        }
    }

    pub fn instanced(mut self, instance_count: u32) -> Self {
        self.instance_count = instance_count;
        self
    }
}

/// Arguments of an indirect draw. `index_type` selects the indexed variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrawIndirectAttribs {
    pub buffer: BufferId,
    pub offset: vk::DeviceSize,
    pub draw_count: u32,
    pub stride: u32,
    pub index_type: Option<vk::IndexType>,
    pub mode: StateTransitionMode,
}

/// Per-attachment clears applied when an explicit render pass begins. `None` loads the contents.
#[derive(Clone, Default)]
pub struct RenderPassClear {
    pub colors: SmallVec<[Option<vk::ClearColorValue>; MAX_RENDER_TARGETS]>,
    pub depth_stencil: Option<vk::ClearDepthStencilValue>,
}

/// Descriptor sets built by the caller, plus the resources they reference and the states the
/// shaders need them in.
#[derive(Clone, Copy, Debug, Default)]
pub struct ShaderResourceBinding<'a> {
    pub sets: &'a [vk::DescriptorSet],
    pub first_set: u32,
    pub dynamic_offsets: &'a [u32],
    pub buffers: &'a [(BufferId, ResourceState)],
    pub textures: &'a [(TextureId, ResourceState)],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CopyTextureAttribs {
    pub src: TextureId,
    pub src_mip: u32,
    pub src_slice: u32,
    pub src_mode: StateTransitionMode,
    pub dst: TextureId,
    pub dst_mip: u32,
    pub dst_slice: u32,
    pub dst_mode: StateTransitionMode,
}

impl CopyTextureAttribs {
    pub fn new(src: TextureId, dst: TextureId) -> Self {
        Self {
            src,
            src_mip: 0,
            src_slice: 0,
            src_mode: StateTransitionMode::Transition,
            dst,
            dst_mip: 0,
            dst_slice: 0,
            dst_mode: StateTransitionMode::Transition,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResolveTextureAttribs {
    pub src_mip: u32,
    pub src_slice: u32,
    pub dst_mip: u32,
    pub dst_slice: u32,
    pub src_mode: StateTransitionMode,
    pub dst_mode: StateTransitionMode,
}

/// CPU copy of a dynamic buffer's contents for this frame. Hand it back to `unmap_buffer`.
#[derive(Debug, Deref, DerefMut)]
pub struct MappedBuffer {
    buffer: BufferId,
    allocation: DynamicAllocation,
    #[deref]
    #[deref_mut]
    data: Vec<u8>,
}

impl MappedBuffer {
    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    pub fn allocation(&self) -> DynamicAllocation {
        self.allocation
    }
}

impl<K: ContextKind> DeviceContext<K> {
    pub fn set_pipeline_state(&mut self, pipeline: PipelineId) {
        if self.pipeline == Some(pipeline) {
            return;
        }
        if self.device.pipeline_desc(pipeline).is_none() {
            log::error!("{} is not registered with the device", pipeline);
            return;
        }
        self.pipeline = Some(pipeline);
        self.binding_set = None;
        self.dirty |= Dirty::VertexBuffers | Dirty::IndexBuffer | Dirty::Descriptors;
    }

    /// Bind vertex streams starting at `start_slot`. `reset` unbinds every other slot.
    pub fn set_vertex_buffers(
        &mut self,
        start_slot: u32,
        streams: &[VertexStream],
        reset: bool,
        mode: StateTransitionMode,
    ) {
        let start = start_slot as usize;
        if start + streams.len() > MAX_BUFFER_SLOTS {
            log::error!(
                "Vertex streams {}..{} exceed the {} available slots",
                start,
                start + streams.len(),
                MAX_BUFFER_SLOTS
            );
            return;
        }
        if reset {
            self.vertex_streams = [VertexStream::default(); MAX_BUFFER_SLOTS];
            self.num_vertex_streams = 0;
        }
        for (slot, stream) in streams.iter().enumerate() {
            self.vertex_streams[start + slot] = *stream;
            if let Some(buffer) = stream.buffer {
                self.transition_or_verify_buffer(buffer, mode, ResourceState::VERTEX_BUFFER, "set_vertex_buffers");
            }
        }
        self.num_vertex_streams = self.num_vertex_streams.max(start + streams.len());
        while self.num_vertex_streams > 0 && self.vertex_streams[self.num_vertex_streams - 1].buffer.is_none() {
            self.num_vertex_streams -= 1;
        }
        self.binding_set = None;
        self.dirty |= Dirty::VertexBuffers;
    }

    pub fn set_index_buffer(&mut self, buffer: BufferId, offset: vk::DeviceSize, mode: StateTransitionMode) {
        self.transition_or_verify_buffer(buffer, mode, ResourceState::INDEX_BUFFER, "set_index_buffer");
        if self.index_buffer != Some(buffer) {
            self.binding_set = None;
        }
        self.index_buffer = Some(buffer);
        self.index_offset = offset;
        self.dirty |= Dirty::IndexBuffer;
    }

    pub fn set_viewports(&mut self, viewports: &[vk::Viewport]) {
        self.viewports = viewports.iter().copied().collect();
        self.dirty |= Dirty::Viewports;
    }

    pub fn set_scissor_rects(&mut self, rects: &[vk::Rect2D]) {
        self.scissors = rects.iter().copied().collect();
        self.dirty |= Dirty::Scissors;
    }

    pub fn set_stencil_ref(&mut self, reference: u32) {
        if self.stencil_ref != reference {
            self.stencil_ref = reference;
            self.dirty |= Dirty::StencilRef;
        }
    }

    pub fn set_blend_factors(&mut self, factors: [f32; 4]) {
        if self.blend_factors != factors {
            self.blend_factors = factors;
            self.dirty |= Dirty::BlendFactors;
        }
    }

    /// Bind render targets and a depth-stencil view. The render pass opens lazily at the next draw.
    ///
    /// An empty set unbinds everything. Viewport and scissor are reset to cover the targets.
    #[profiling::function]
    pub fn set_render_targets(
        &mut self,
        targets: &[TextureViewId],
        depth_stencil: Option<TextureViewId>,
        mode: StateTransitionMode,
    ) -> bool {
        self.end_implicit_pass("set_render_targets");
        if targets.len() > MAX_RENDER_TARGETS {
            log::error!("{} render targets exceed the limit of {}", targets.len(), MAX_RENDER_TARGETS);
            return false;
        }
        if targets.is_empty() && depth_stencil.is_none() {
            self.render_targets.clear();
            self.depth_stencil = None;
            self.render_pass = vk::RenderPass::null();
            self.framebuffer = vk::Framebuffer::null();
            self.framebuffer_extent = vk::Extent2D::default();
            return true;
        }

        let mut color_formats = SmallVec::<[vk::Format; MAX_RENDER_TARGETS]>::new();
        let mut depth_format = None;
        let mut handles = SmallVec::<[vk::ImageView; MAX_RENDER_TARGETS + 1]>::new();
        let mut textures = SmallVec::<[(TextureId, ResourceState); MAX_RENDER_TARGETS + 1]>::new();
        let mut extent: Option<vk::Extent2D> = None;
        let mut samples = vk::SampleCountFlags::TYPE_1;
        let mut layers = 1;
        {
            let arena = self.device.arena();
            let attachments = targets
                .iter()
                .map(|&view| (view, TextureViewType::RenderTarget))
                .chain(depth_stencil.map(|view| (view, TextureViewType::DepthStencil)));
            for (view, expected) in attachments {
                let Some(entry) = arena.views.get(&view) else {
                    log::error!("{} is not registered with the device", view);
                    return false;
                };
                let Some(texture) = arena.textures.get(&entry.texture) else {
                    log::error!("{} of {} is not registered with the device", entry.texture, view);
                    return false;
                };
                verify!(
                    entry.desc.view_type == expected,
                    "View '{}' is a {} view and can not be bound as a {} view",
                    entry.desc.name,
                    entry.desc.view_type,
                    expected
                );
                let mip = texture.desc.mip_extent(entry.desc.most_detailed_mip);
                let view_extent = vk::Extent2D {
                    width: mip.width,
                    height: mip.height,
                };
                match extent {
                    None => extent = Some(view_extent),
                    Some(e) if e != view_extent => {
                        log::error!(
                            "View '{}' is {}x{}, other attachments are {}x{}",
                            entry.desc.name,
                            view_extent.width,
                            view_extent.height,
                            e.width,
                            e.height
                        );
                        return false;
                    }
                    Some(_) => {}
                }
                let format = entry.desc.format.unwrap_or(texture.desc.format);
                if expected == TextureViewType::DepthStencil {
                    depth_format = Some(format);
                    textures.push((entry.texture, ResourceState::DEPTH_WRITE));
                } else {
                    color_formats.push(format);
                    textures.push((entry.texture, ResourceState::RENDER_TARGET));
                }
                samples = texture.desc.samples;
                layers = entry.desc.num_slices.max(1);
                handles.push(entry.handle);
            }
        }
        let Some(extent) = extent else {
            return false;
        };

        for (texture, state) in textures {
            self.transition_or_verify_texture(texture, mode, state, "set_render_targets");
        }

        let backend = self.device.backend().clone();
        let pass_key = RenderPassKey {
            color_formats,
            depth_format,
            samples,
        };
        let render_pass = match self.device.render_passes().get_or_create(backend.as_ref(), &pass_key) {
            Ok(pass) => pass,
            Err(err) => {
                log::error!("Failed to create a render pass for {:?}: {}", pass_key, err);
                return false;
            }
        };
        let framebuffer_key = FramebufferKey {
            render_pass,
            attachments: targets.iter().copied().chain(depth_stencil).collect(),
            width: extent.width,
            height: extent.height,
            layers,
        };
        let framebuffer = match self
            .device
            .framebuffers()
            .get_or_create(backend.as_ref(), &framebuffer_key, &handles)
        {
            Ok(framebuffer) => framebuffer,
            Err(err) => {
                log::error!("Failed to create a framebuffer: {}", err);
                return false;
            }
        };

        self.render_targets = targets.iter().copied().collect();
        self.depth_stencil = depth_stencil;
        self.render_pass = render_pass;
        self.framebuffer = framebuffer;
        self.framebuffer_extent = extent;
        self.framebuffer_layers = layers;
        self.viewports = smallvec::smallvec![vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }];
        self.scissors = smallvec::smallvec![vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent,
        }];
        self.dirty |= Dirty::Viewports | Dirty::Scissors;
        true
    }

    /// Open the render pass of the bound targets unless it is already open.
    fn begin_bound_pass(&mut self) -> bool {
        if self.render_pass == vk::RenderPass::null() {
            log::error!("Context '{}' has no render targets bound", self.name);
            return false;
        }
        let (render_pass, framebuffer, extent) = (self.render_pass, self.framebuffer, self.framebuffer_extent);
        let Some(cmd) = self.command_buffer() else {
            return false;
        };
        cmd.begin_render_pass(render_pass, framebuffer, extent, &[]);
        true
    }

    fn full_clear_rect(&self) -> vk::ClearRect {
        vk::ClearRect {
            rect: vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: self.framebuffer_extent,
            },
            base_array_layer: 0,
            layer_count: self.framebuffer_layers,
        }
    }

    /// Begin an explicit render pass over the bound targets.
    ///
    /// Until [`Self::end_render_pass`], no state transition may be recorded: bind resources with
    /// `StateTransitionMode::Verify` or `None`.
    pub fn begin_render_pass(&mut self, clear: &RenderPassClear) -> bool {
        verify!(!self.explicit_pass, "begin_render_pass while another explicit render pass is open");
        if !self.begin_bound_pass() {
            return false;
        }
        self.explicit_pass = true;

        let mut attachments = SmallVec::<[vk::ClearAttachment; MAX_RENDER_TARGETS + 1]>::new();
        for (slot, color) in clear.colors.iter().enumerate().take(self.render_targets.len()) {
            if let Some(color) = color {
                attachments.push(vk::ClearAttachment {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    color_attachment: slot as u32,
                    clear_value: vk::ClearValue { color: *color },
                });
            }
        }
        if let (Some(value), Some(view)) = (clear.depth_stencil, self.depth_stencil) {
            let aspect_mask = self
                .device
                .texture_view_desc(view)
                .and_then(|(_, desc)| desc.format)
                .map_or(vk::ImageAspectFlags::DEPTH, format_aspect_mask);
            attachments.push(vk::ClearAttachment {
                aspect_mask,
                color_attachment: 0,
                clear_value: vk::ClearValue { depth_stencil: value },
            });
        }
        if !attachments.is_empty() {
            let rect = self.full_clear_rect();
            if let Some(cmd) = self.cmd.as_mut() {
                cmd.clear_attachments(&attachments, &[rect]);
            }
        }
        true
    }

    pub fn end_render_pass(&mut self) {
        verify!(self.explicit_pass, "end_render_pass without a matching begin_render_pass");
        self.explicit_pass = false;
        if let Some(cmd) = self.cmd.as_mut() {
            if cmd.is_in_render_pass() {
                cmd.end_render_pass();
            }
        }
    }

    /// Bind caller-built descriptor sets for the next draws and dispatches, bringing the resources
    /// they reference into the listed states per `mode`.
    pub fn commit_shader_resources(&mut self, binding: &ShaderResourceBinding<'_>, mode: StateTransitionMode) {
        for &(buffer, state) in binding.buffers {
            self.transition_or_verify_buffer(buffer, mode, state, "commit_shader_resources");
        }
        for &(texture, state) in binding.textures {
            self.transition_or_verify_texture(texture, mode, state, "commit_shader_resources");
        }
        self.descriptors = Some(DescriptorBinding {
            sets: binding.sets.iter().copied().collect(),
            first_set: binding.first_set,
            dynamic_offsets: binding.dynamic_offsets.iter().copied().collect(),
        });
        self.dirty |= Dirty::Descriptors;
    }

    fn bound_pipeline(&self, expected: PipelineKind) -> Option<(vk::Pipeline, vk::PipelineLayout)> {
        let Some(id) = self.pipeline else {
            log::error!("No pipeline is bound to context '{}'", self.name);
            return None;
        };
        let arena = self.device.arena();
        let Some(entry) = arena.pipelines.get(&id) else {
            log::error!("{} bound to context '{}' was destroyed", id, self.name);
            return None;
        };
        if entry.desc.kind != expected {
            log::error!(
                "Pipeline '{}' is a {} pipeline, but a {} pipeline is required",
                entry.desc.name,
                entry.desc.kind,
                expected
            );
            return None;
        }
        Some((entry.handle, entry.desc.layout))
    }

    /// Commit everything a draw depends on and open the render pass.
    fn prepare_for_draw(&mut self, index_type: Option<vk::IndexType>) -> bool {
        let Some((pipeline_handle, layout)) = self.bound_pipeline(PipelineKind::Graphics) else {
            return false;
        };
        let Some(pipeline) = self.pipeline else {
            return false;
        };
        if index_type.is_some() && self.index_buffer.is_none() {
            log::error!("Indexed draw in context '{}' without an index buffer", self.name);
            return false;
        }
        if self.command_buffer().is_none() {
            return false;
        }

        let index_key = index_type.and(self.index_buffer);
        let stale = self
            .binding_set
            .as_ref()
            .is_none_or(|set| set.key.pipeline != pipeline || set.key.index_buffer != index_key);
        if stale {
            let set = {
                let arena = self.device.arena();
                self.device.object_cache().get_or_create(
                    &arena,
                    pipeline,
                    index_key,
                    &self.vertex_streams[..self.num_vertex_streams],
                )
            };
            let Some(set) = set else {
                log::error!("Failed to resolve the vertex bindings of context '{}'", self.name);
                return false;
            };
            self.binding_set = Some(set);
            self.dirty |= Dirty::VertexBuffers | Dirty::IndexBuffer;
        }
        let Some(set) = self.binding_set.clone() else {
            return false;
        };

        let mut streams = SmallVec::<[(u32, vk::Buffer, vk::DeviceSize); MAX_BUFFER_SLOTS]>::new();
        if self.dirty.contains(Dirty::VertexBuffers) {
            for stream in set.streams.iter() {
                let (handle, base) = if stream.handle == vk::Buffer::null() {
                    match self.resolve_buffer(stream.buffer) {
                        Some(resolved) => resolved,
                        None => return false,
                    }
                } else {
                    (stream.handle, 0)
                };
                streams.push((stream.slot, handle, base + stream.offset));
            }
        }
        let index = match (index_type, self.index_buffer, set.index_buffer) {
            (Some(ty), Some(id), Some(handle)) => {
                let (handle, base) = if handle == vk::Buffer::null() {
                    match self.resolve_buffer(id) {
                        Some(resolved) => resolved,
                        None => return false,
                    }
                } else {
                    (handle, 0)
                };
                Some((handle, base + self.index_offset, ty))
            }
            _ => None,
        };

        let dirty = self.dirty;
        let descriptors = self.descriptors.clone();
        let viewports = self.viewports.clone();
        let scissors = self.scissors.clone();
        let (stencil_ref, blend_factors) = (self.stencil_ref, self.blend_factors);
        let (render_pass, framebuffer, extent) = (self.render_pass, self.framebuffer, self.framebuffer_extent);
        if render_pass == vk::RenderPass::null() {
            log::error!("Draw in context '{}' without render targets", self.name);
            return false;
        }
        let Some(cmd) = self.cmd.as_mut() else {
            return false;
        };

        cmd.bind_graphics_pipeline(pipeline_handle);
        let mut start = 0;
        while start < streams.len() {
            let mut end = start + 1;
            while end < streams.len() && streams[end].0 == streams[end - 1].0 + 1 {
                end += 1;
            }
            let buffers: SmallVec<[vk::Buffer; MAX_BUFFER_SLOTS]> = streams[start..end].iter().map(|s| s.1).collect();
            let offsets: SmallVec<[vk::DeviceSize; MAX_BUFFER_SLOTS]> = streams[start..end].iter().map(|s| s.2).collect();
            cmd.bind_vertex_buffers(streams[start].0, &buffers, &offsets);
            start = end;
        }
        if let Some((handle, offset, ty)) = index {
            cmd.bind_index_buffer(handle, offset, ty);
        }
        if dirty.contains(Dirty::Descriptors) {
            if let Some(descriptors) = descriptors.as_ref() {
                cmd.bind_descriptor_sets(
                    vk::PipelineBindPoint::GRAPHICS,
                    layout,
                    descriptors.first_set,
                    &descriptors.sets,
                    &descriptors.dynamic_offsets,
                );
            }
        }
        if dirty.contains(Dirty::Viewports) && !viewports.is_empty() {
            cmd.set_viewports(0, &viewports);
        }
        if dirty.contains(Dirty::Scissors) && !scissors.is_empty() {
            cmd.set_scissors(0, &scissors);
        }
        if dirty.contains(Dirty::StencilRef) {
            cmd.set_stencil_reference(stencil_ref);
        }
        if dirty.contains(Dirty::BlendFactors) {
            cmd.set_blend_constants(blend_factors);
        }
        cmd.begin_render_pass(render_pass, framebuffer, extent, &[]);

        self.dirty.remove(
            Dirty::VertexBuffers
                | Dirty::Descriptors
                | Dirty::Viewports
                | Dirty::Scissors
                | Dirty::StencilRef
                | Dirty::BlendFactors,
        );
        if index.is_some() {
            self.dirty.remove(Dirty::IndexBuffer);
        }
        true
    }

    fn prepare_for_dispatch(&mut self) -> bool {
        let Some((pipeline_handle, layout)) = self.bound_pipeline(PipelineKind::Compute) else {
            return false;
        };
        self.end_implicit_pass("dispatch");
        let descriptors = self.descriptors.clone();
        let Some(cmd) = self.command_buffer() else {
            return false;
        };
        cmd.bind_compute_pipeline(pipeline_handle);
        // Compute bindings are not tracked; bind on every dispatch.
        if let Some(descriptors) = descriptors.as_ref() {
            cmd.bind_descriptor_sets(
                vk::PipelineBindPoint::COMPUTE,
                layout,
                descriptors.first_set,
                &descriptors.sets,
                &descriptors.dynamic_offsets,
            );
        }
        true
    }

    #[profiling::function]
    pub fn draw(&mut self, attribs: &DrawAttribs) {
        if attribs.vertex_count == 0 || attribs.instance_count == 0 {
            return;
        }
        if !self.prepare_for_draw(None) {
            return;
        }
        if let Some(cmd) = self.cmd.as_mut() {
            cmd.draw(
                attribs.vertex_count,
                attribs.instance_count,
                attribs.first_vertex,
                attribs.first_instance,
            );
        }
        K::after_command(self);
    }

    #[profiling::function]
    pub fn draw_indexed(&mut self, attribs: &DrawIndexedAttribs) {
        if attribs.index_count == 0 || attribs.instance_count == 0 {
            return;
        }
        if !self.prepare_for_draw(Some(attribs.index_type)) {
            return;
        }
        if let Some(cmd) = self.cmd.as_mut() {
            cmd.draw_indexed(
                attribs.index_count,
                attribs.instance_count,
                attribs.first_index,
                attribs.base_vertex,
                attribs.first_instance,
            );
        }
        K::after_command(self);
    }

    /// Draw with arguments read from `attribs.buffer`. The argument buffer is brought into
    /// `INDIRECT_ARGUMENT` before the render pass opens.
    #[profiling::function]
    pub fn draw_indirect(&mut self, attribs: &DrawIndirectAttribs) {
        self.transition_or_verify_buffer(
            attribs.buffer,
            attribs.mode,
            ResourceState::INDIRECT_ARGUMENT,
            "draw_indirect",
        );
        let Some((buffer, base)) = self.resolve_buffer(attribs.buffer) else {
            return;
        };
        if !self.prepare_for_draw(attribs.index_type) {
            return;
        }
        if let Some(cmd) = self.cmd.as_mut() {
            match attribs.index_type {
                Some(_) => cmd.draw_indexed_indirect(buffer, base + attribs.offset, attribs.draw_count, attribs.stride),
                None => cmd.draw_indirect(buffer, base + attribs.offset, attribs.draw_count, attribs.stride),
            }
        }
        K::after_command(self);
    }

    /// Same as [`Self::draw_indirect`]; `attribs.index_type` must be set.
    pub fn draw_indexed_indirect(&mut self, attribs: &DrawIndirectAttribs) {
        verify!(attribs.index_type.is_some(), "draw_indexed_indirect needs an index type");
        self.draw_indirect(attribs);
    }

    #[profiling::function]
    pub fn dispatch_compute(&mut self, x: u32, y: u32, z: u32) {
        if x == 0 || y == 0 || z == 0 {
            return;
        }
        if !self.prepare_for_dispatch() {
            return;
        }
        if let Some(cmd) = self.cmd.as_mut() {
            cmd.dispatch(x, y, z);
        }
        K::after_command(self);
    }

    #[profiling::function]
    pub fn dispatch_compute_indirect(&mut self, buffer: BufferId, offset: vk::DeviceSize, mode: StateTransitionMode) {
        self.end_implicit_pass("dispatch_compute_indirect");
        self.transition_or_verify_buffer(buffer, mode, ResourceState::INDIRECT_ARGUMENT, "dispatch_compute_indirect");
        let Some((handle, base)) = self.resolve_buffer(buffer) else {
            return;
        };
        if !self.prepare_for_dispatch() {
            return;
        }
        if let Some(cmd) = self.cmd.as_mut() {
            cmd.dispatch_indirect(handle, base + offset);
        }
        K::after_command(self);
    }

    /// Texture, native image and subresources of a view, checked against `expected`.
    fn view_target(
        &self,
        view: TextureViewId,
        expected: TextureViewType,
    ) -> Option<(TextureId, vk::Image, SubresourceRange)> {
        let arena = self.device.arena();
        let Some(entry) = arena.views.get(&view) else {
            log::error!("{} is not registered with the device", view);
            return None;
        };
        let texture = arena.textures.get(&entry.texture)?;
        verify!(
            entry.desc.view_type == expected,
            "View '{}' is a {} view, a {} view is required",
            entry.desc.name,
            entry.desc.view_type,
            expected
        );
        Some((
            entry.texture,
            texture.native.handle,
            entry.desc.subresource_range(&texture.desc),
        ))
    }

    /// Clear a render target view. A bound target is cleared inside the render pass; any other
    /// view is brought into `COPY_DEST` and cleared outside of it.
    #[profiling::function]
    pub fn clear_render_target(&mut self, view: TextureViewId, color: vk::ClearColorValue, mode: StateTransitionMode) {
        let Some((texture, image, range)) = self.view_target(view, TextureViewType::RenderTarget) else {
            return;
        };
        if let Some(slot) = self.render_targets.iter().position(|&v| v == view) {
            if !self.explicit_pass {
                self.transition_or_verify_texture(texture, mode, ResourceState::RENDER_TARGET, "clear_render_target");
            }
            if !self.begin_bound_pass() {
                return;
            }
            let rect = self.full_clear_rect();
            if let Some(cmd) = self.cmd.as_mut() {
                cmd.clear_attachments(
                    &[vk::ClearAttachment {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        color_attachment: slot as u32,
                        clear_value: vk::ClearValue { color },
                    }],
                    &[rect],
                );
            }
        } else {
            self.end_implicit_pass("clear_render_target of an unbound view");
            self.transition_or_verify_texture(texture, mode, ResourceState::COPY_DEST, "clear_render_target");
            if let Some(cmd) = self.command_buffer() {
                cmd.clear_color_image(image, &color, &[range.to_vk()]);
            }
        }
    }

    /// Clear the depth and/or stencil aspects of a depth-stencil view.
    #[profiling::function]
    pub fn clear_depth_stencil(
        &mut self,
        view: TextureViewId,
        depth: Option<f32>,
        stencil: Option<u32>,
        mode: StateTransitionMode,
    ) {
        let Some((texture, image, range)) = self.view_target(view, TextureViewType::DepthStencil) else {
            return;
        };
        let mut aspect_mask = vk::ImageAspectFlags::empty();
        if depth.is_some() {
            aspect_mask |= vk::ImageAspectFlags::DEPTH;
        }
        if stencil.is_some() {
            aspect_mask |= range.aspect & vk::ImageAspectFlags::STENCIL;
        }
        if aspect_mask.is_empty() {
            return;
        }
        let value = vk::ClearDepthStencilValue {
            depth: depth.unwrap_or(1.0),
            stencil: stencil.unwrap_or(0),
        };

        if self.depth_stencil == Some(view) {
            if !self.explicit_pass {
                self.transition_or_verify_texture(texture, mode, ResourceState::DEPTH_WRITE, "clear_depth_stencil");
            }
            if !self.begin_bound_pass() {
                return;
            }
            let rect = self.full_clear_rect();
            if let Some(cmd) = self.cmd.as_mut() {
                cmd.clear_attachments(
                    &[vk::ClearAttachment {
                        aspect_mask,
                        color_attachment: 0,
                        clear_value: vk::ClearValue { depth_stencil: value },
                    }],
                    &[rect],
                );
            }
        } else {
            self.end_implicit_pass("clear_depth_stencil of an unbound view");
            self.transition_or_verify_texture(texture, mode, ResourceState::COPY_DEST, "clear_depth_stencil");
            let mut range = range.to_vk();
            range.aspect_mask = aspect_mask;
            if let Some(cmd) = self.command_buffer() {
                cmd.clear_depth_stencil_image(image, &value, &[range]);
            }
        }
    }

    /// Copy `size` bytes between buffers. A dynamic source reads its current allocation; dynamic
    /// destinations are rejected.
    #[profiling::function]
    #[allow(clippy::too_many_arguments)]
    pub fn copy_buffer(
        &mut self,
        src: BufferId,
        src_offset: vk::DeviceSize,
        src_mode: StateTransitionMode,
        dst: BufferId,
        dst_offset: vk::DeviceSize,
        size: vk::DeviceSize,
        dst_mode: StateTransitionMode,
    ) {
        self.end_implicit_pass("copy_buffer");
        let (Some(src_desc), Some(dst_desc)) = (self.device.buffer_desc(src), self.device.buffer_desc(dst)) else {
            log::error!("copy_buffer from {} to {}: buffer is not registered with the device", src, dst);
            return;
        };
        if dst_desc.is_dynamic() {
            log::error!("Dynamic buffer '{}' can not be a copy destination", dst_desc.name);
            return;
        }
        if let Err(err) = normalize_range_u64(src_offset..src_offset.saturating_add(size), src_desc.size) {
            log::error!("copy_buffer source '{}': {}", src_desc.name, err);
            return;
        }
        if let Err(err) = normalize_range_u64(dst_offset..dst_offset.saturating_add(size), dst_desc.size) {
            log::error!("copy_buffer destination '{}': {}", dst_desc.name, err);
            return;
        }

        self.transition_or_verify_buffer(src, src_mode, ResourceState::COPY_SOURCE, "copy_buffer");
        self.transition_or_verify_buffer(dst, dst_mode, ResourceState::COPY_DEST, "copy_buffer");
        let (Some((src_handle, src_base)), Some((dst_handle, _))) = (self.resolve_buffer(src), self.resolve_buffer(dst))
        else {
            return;
        };
        if let Some(cmd) = self.command_buffer() {
            cmd.copy_buffer(
                src_handle,
                dst_handle,
                &[vk::BufferCopy {
                    src_offset: src_base + src_offset,
                    dst_offset,
                    size,
                }],
            );
        }
    }

    /// Copy one whole subresource between textures.
    #[profiling::function]
    pub fn copy_texture(&mut self, attribs: &CopyTextureAttribs) {
        self.end_implicit_pass("copy_texture");
        let (Some(src_desc), Some(dst_desc)) = (
            self.device.texture_desc(attribs.src),
            self.device.texture_desc(attribs.dst),
        ) else {
            log::error!("copy_texture from {} to {}: texture is not registered", attribs.src, attribs.dst);
            return;
        };
        if attribs.src_mip >= src_desc.mip_levels
            || attribs.dst_mip >= dst_desc.mip_levels
            || attribs.src_slice >= src_desc.slice_count()
            || attribs.dst_slice >= dst_desc.slice_count()
        {
            log::error!(
                "copy_texture from '{}' to '{}' addresses a subresource outside of the textures",
                src_desc.name,
                dst_desc.name
            );
            return;
        }
        let src_extent = src_desc.mip_extent(attribs.src_mip);
        let dst_extent = dst_desc.mip_extent(attribs.dst_mip);
        let extent = vk::Extent3D {
            width: src_extent.width.min(dst_extent.width),
            height: src_extent.height.min(dst_extent.height),
            depth: src_extent.depth.min(dst_extent.depth),
        };

        self.transition_or_verify_texture(attribs.src, attribs.src_mode, ResourceState::COPY_SOURCE, "copy_texture");
        self.transition_or_verify_texture(attribs.dst, attribs.dst_mode, ResourceState::COPY_DEST, "copy_texture");
        let (Some(src_image), Some(dst_image)) = (
            self.device.texture_handle(attribs.src),
            self.device.texture_handle(attribs.dst),
        ) else {
            return;
        };
        let src_layers = SubresourceRange::new(src_desc.aspect(), attribs.src_mip, 1, attribs.src_slice, 1);
        let dst_layers = SubresourceRange::new(dst_desc.aspect(), attribs.dst_mip, 1, attribs.dst_slice, 1);
        if let Some(cmd) = self.command_buffer() {
            cmd.copy_image(
                src_image,
                dst_image,
                &[vk::ImageCopy {
                    src_subresource: src_layers.to_vk_layers(attribs.src_mip),
                    src_offset: vk::Offset3D::default(),
                    dst_subresource: dst_layers.to_vk_layers(attribs.dst_mip),
                    dst_offset: vk::Offset3D::default(),
                    extent,
                }],
            );
        }
    }

    /// Stage `data` in the dynamic heap and copy it into `buffer` at `offset`.
    #[profiling::function]
    pub fn update_buffer(&mut self, buffer: BufferId, offset: vk::DeviceSize, data: &[u8], mode: StateTransitionMode) {
        if data.is_empty() {
            return;
        }
        self.end_implicit_pass("update_buffer");
        let Some(desc) = self.device.buffer_desc(buffer) else {
            log::error!("{} is not registered with the device", buffer);
            return;
        };
        if desc.is_dynamic() {
            log::error!("Dynamic buffer '{}' must be updated with map_buffer", desc.name);
            return;
        }
        let size = data.len() as vk::DeviceSize;
        let (dst_offset, size) = match normalize_range_u64(offset..offset.saturating_add(size), desc.size) {
            Ok(range) => range,
            Err(err) => {
                log::error!("update_buffer of '{}': {}", desc.name, err);
                return;
            }
        };
        let Some(staging) = self.stage(data, UPLOAD_ALIGNMENT) else {
            return;
        };

        self.transition_or_verify_buffer(buffer, mode, ResourceState::COPY_DEST, "update_buffer");
        let Some(handle) = self.device.buffer_handle(buffer) else {
            return;
        };
        if let Some(cmd) = self.command_buffer() {
            cmd.copy_buffer(
                staging.buffer,
                handle,
                &[vk::BufferCopy {
                    src_offset: staging.offset,
                    dst_offset,
                    size,
                }],
            );
        }
    }

    /// Upload tightly packed texels of one subresource through the dynamic heap.
    #[profiling::function]
    pub fn update_texture(&mut self, texture: TextureId, mip: u32, slice: u32, data: &[u8], mode: StateTransitionMode) {
        if data.is_empty() {
            return;
        }
        self.end_implicit_pass("update_texture");
        let Some(desc) = self.device.texture_desc(texture) else {
            log::error!("{} is not registered with the device", texture);
            return;
        };
        if mip >= desc.mip_levels || slice >= desc.slice_count() {
            log::error!(
                "update_texture of '{}' addresses mip {} slice {} outside of the texture",
                desc.name,
                mip,
                slice
            );
            return;
        }
        let Some(staging) = self.stage(data, UPLOAD_ALIGNMENT) else {
            return;
        };

        self.transition_or_verify_texture(texture, mode, ResourceState::COPY_DEST, "update_texture");
        let Some(image) = self.device.texture_handle(texture) else {
            return;
        };
        let layers = SubresourceRange::new(desc.aspect(), mip, 1, slice, 1);
        if let Some(cmd) = self.command_buffer() {
            cmd.copy_buffer_to_image(
                staging.buffer,
                image,
                &[vk::BufferImageCopy {
                    buffer_offset: staging.offset,
                    buffer_row_length: 0,
                    buffer_image_height: 0,
                    image_subresource: layers.to_vk_layers(mip),
                    image_offset: vk::Offset3D::default(),
                    image_extent: desc.mip_extent(mip),
                }],
            );
        }
    }

    fn stage(&mut self, data: &[u8], alignment: vk::DeviceSize) -> Option<DynamicAllocation> {
        let allocation = self
            .dynamic_heap
            .allocate(&self.device, data.len() as vk::DeviceSize, alignment)?;
        if let Err(err) = self.device.dynamic_memory().write(allocation.offset, data) {
            log::error!("Failed to write {} bytes to the dynamic heap: {}", data.len(), err);
            return None;
        }
        Some(allocation)
    }

    /// Map a dynamic buffer for this frame with discard semantics. Every map returns fresh memory.
    pub fn map_buffer(&mut self, buffer: BufferId) -> Option<MappedBuffer> {
        let Some(desc) = self.device.buffer_desc(buffer) else {
            log::error!("{} is not registered with the device", buffer);
            return None;
        };
        if !desc.is_dynamic() {
            log::error!("Only dynamic buffers can be mapped; '{}' is {}", desc.name, desc.usage);
            return None;
        }
        let allocation = self.dynamic_heap.allocate(&self.device, desc.size, MAP_ALIGNMENT)?;
        self.dynamic_buffers.insert(buffer, allocation);
        Some(MappedBuffer {
            buffer,
            allocation,
            data: vec![0; desc.size as usize],
        })
    }

    pub fn unmap_buffer(&mut self, mapped: MappedBuffer) {
        self.dynamic_heap.verify_allocation(&mapped.allocation);
        if self.dynamic_buffers.get(&mapped.buffer) != Some(&mapped.allocation) {
            log::warn!(
                "{} was mapped again before this mapping was released; the older contents are ignored",
                mapped.buffer
            );
            return;
        }
        if let Err(err) = self.device.dynamic_memory().write(mapped.allocation.offset, &mapped.data) {
            log::error!("Failed to write mapped {}: {}", mapped.buffer, err);
            return;
        }
        self.dirty |= Dirty::VertexBuffers | Dirty::IndexBuffer | Dirty::Descriptors;
    }

    /// Resolve one subresource of a multisampled colour texture.
    #[profiling::function]
    pub fn resolve_texture_subresource(&mut self, src: TextureId, dst: TextureId, attribs: &ResolveTextureAttribs) {
        self.end_implicit_pass("resolve_texture_subresource");
        let (Some(src_desc), Some(dst_desc)) = (self.device.texture_desc(src), self.device.texture_desc(dst)) else {
            log::error!("resolve from {} to {}: texture is not registered", src, dst);
            return;
        };
        verify!(
            src_desc.samples != vk::SampleCountFlags::TYPE_1,
            "Resolve source '{}' is not multisampled",
            src_desc.name
        );
        verify!(
            dst_desc.samples == vk::SampleCountFlags::TYPE_1,
            "Resolve destination '{}' is multisampled",
            dst_desc.name
        );
        verify!(
            src_desc.format == dst_desc.format,
            "Resolve source format {:?} does not match destination format {:?}",
            src_desc.format,
            dst_desc.format
        );
        verify!(
            src_desc.aspect() == vk::ImageAspectFlags::COLOR,
            "Only colour textures can be resolved, '{}' is {:?}",
            src_desc.name,
            src_desc.format
        );

        self.transition_or_verify_texture(
            src,
            attribs.src_mode,
            ResourceState::RESOLVE_SOURCE,
            "resolve_texture_subresource",
        );
        self.transition_or_verify_texture(dst, attribs.dst_mode, ResourceState::RESOLVE_DEST, "resolve_texture_subresource");
        let (Some(src_image), Some(dst_image)) = (self.device.texture_handle(src), self.device.texture_handle(dst)) else {
            return;
        };
        let src_layers = SubresourceRange::new(vk::ImageAspectFlags::COLOR, attribs.src_mip, 1, attribs.src_slice, 1);
        let dst_layers = SubresourceRange::new(vk::ImageAspectFlags::COLOR, attribs.dst_mip, 1, attribs.dst_slice, 1);
        let extent = src_desc.mip_extent(attribs.src_mip);
        if let Some(cmd) = self.command_buffer() {
            cmd.resolve_image(
                src_image,
                dst_image,
                &[vk::ImageResolve {
                    src_subresource: src_layers.to_vk_layers(attribs.src_mip),
                    src_offset: vk::Offset3D::default(),
                    dst_subresource: dst_layers.to_vk_layers(attribs.dst_mip),
                    dst_offset: vk::Offset3D::default(),
                    extent,
                }],
            );
        }
    }

    /// Fill every mip below the most detailed one of a shader-resource view.
    ///
    /// The texture must be in a known state. A view over the whole texture leaves it in
    /// `SHADER_RESOURCE`; a partial view is returned to the state it was in.
    #[profiling::function]
    pub fn generate_mips(&mut self, view: TextureViewId) -> bool {
        self.end_implicit_pass("generate_mips");
        let (texture, image, texture_desc, view_desc, mip_views) = {
            let arena = self.device.arena();
            let Some(entry) = arena.views.get(&view) else {
                log::error!("{} is not registered with the device", view);
                return false;
            };
            let Some(texture) = arena.textures.get(&entry.texture) else {
                return false;
            };
            (
                entry.texture,
                texture.native.handle,
                texture.desc.clone(),
                entry.desc.clone(),
                entry.mip_views.clone(),
            )
        };
        verify!(
            view_desc.view_type == TextureViewType::ShaderResource,
            "Mips can only be generated through a shader resource view, '{}' is a {} view",
            view_desc.name,
            view_desc.view_type
        );
        verify!(
            view_desc.allow_mip_generation,
            "View '{}' was not created with mip generation enabled",
            view_desc.name
        );
        if view_desc.num_mips < 2 {
            return true;
        }

        let Some(mut original) = self.known_state(ObjectId::Texture(texture)) else {
            log::error!(
                "Can not generate mips of texture '{}' in context '{}': its state is unknown",
                texture_desc.name,
                self.name
            );
            return false;
        };
        if original == ResourceState::UNDEFINED {
            self.transition_texture(
                texture,
                ResourceState::UNDEFINED,
                ResourceState::SHADER_RESOURCE,
                true,
                None,
            );
            original = ResourceState::SHADER_RESOURCE;
        }
        let range = view_desc.subresource_range(&texture_desc);
        let job = MipJob {
            image,
            texture: &texture_desc,
            view: &view_desc,
            mip_views: &mip_views,
            original_layout: resource_state_to_image_layout(original, false),
        };

        if self.command_buffer().is_none() {
            return false;
        }
        let device = self.device.clone();
        let Some(cmd) = self.cmd.as_mut() else {
            return false;
        };
        device.mip_generator().generate(&device, cmd, &job);

        // The whole view range is now SHADER_READ_ONLY.
        if range == texture_desc.full_range() {
            if K::DEFERRED {
                self.record_state(TransitionResource::Texture(texture), ResourceState::SHADER_RESOURCE);
            } else {
                self.device.set_texture_state(texture, Some(ResourceState::SHADER_RESOURCE));
            }
        } else if original != ResourceState::SHADER_RESOURCE {
            cmd.transition_image_layout(
                image,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                job.original_layout,
                range,
            );
        }
        self.dirty |= Dirty::Descriptors;
        true
    }
}
