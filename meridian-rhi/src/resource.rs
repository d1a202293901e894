//! Resource descriptions, identities, and the device-owned arena that stores them.

use ash::vk;
use derive_more::{Display, From};
use meridian_core::collections::hashmap::HashMap;
use smallvec::SmallVec;
use crate::backend::{NativeBuffer, NativeImage};
use crate::barrier::SubresourceRange;
use crate::state::{format_aspect_mask, ResourceState};
use crate::utility::full_mip_count;

/// Most vertex buffer slots a pipeline can reference.
pub const MAX_BUFFER_SLOTS: usize = 16;
/// Most colour attachments of one render target set.
pub const MAX_RENDER_TARGETS: usize = 8;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u64);

        impl $name {
            #[inline]
            pub fn raw(self) -> u64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}#{}", $label, self.0)
            }
        }
    };
}

define_id!(
    /// Identity of a buffer. Never reused within a device.
    BufferId,
    "buffer"
);
define_id!(
    /// Identity of a texture.
    TextureId,
    "texture"
);
define_id!(TextureViewId, "view");
define_id!(PipelineId, "pipeline");

/// Any object the arena can hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, From, Display)]
pub enum ObjectId {
    Buffer(BufferId),
    Texture(TextureId),
    TextureView(TextureViewId),
    Pipeline(PipelineId),
}

/// How the CPU and GPU access a buffer over its lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Display)]
pub enum Usage {
    /// Device-local, updated through copies.
    #[default]
    Default,
    /// Device-local, written once at creation.
    Immutable,
    /// Rewritten every frame through `map_buffer`; lives in the context's dynamic heap.
    Dynamic,
    /// Host-visible, used as a copy source or for read-back.
    Staging,
}

#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub name: String,
    pub size: vk::DeviceSize,
    pub bind_flags: vk::BufferUsageFlags,
    pub usage: Usage,
    /// State recorded at creation.
    pub initial_state: ResourceState,
}

impl Default for BufferDesc {
    fn default() -> Self {
        Self {
            name: "Unnamed buffer".to_string(),
            size: 0,
            bind_flags: vk::BufferUsageFlags::empty(),
            usage: Usage::Default,
            initial_state: ResourceState::UNDEFINED,
        }
    }
}

impl BufferDesc {
    pub fn new(name: &str, size: vk::DeviceSize) -> Self {
        Self {
            name: name.to_owned(),
            size,
            ..Default::default()
        }
    }

    pub fn vertex(name: &str, size: vk::DeviceSize) -> Self {
        Self::new(name, size)
            .with_bind_flags(vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST)
    }

    pub fn index(name: &str, size: vk::DeviceSize) -> Self {
        Self::new(name, size)
            .with_bind_flags(vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST)
    }

    /// A per-frame constant buffer.
    pub fn uniform(name: &str, size: vk::DeviceSize) -> Self {
        Self::new(name, size)
            .with_bind_flags(vk::BufferUsageFlags::UNIFORM_BUFFER)
            .with_usage(Usage::Dynamic)
    }

    pub fn storage(name: &str, size: vk::DeviceSize) -> Self {
        Self::new(name, size).with_bind_flags(
            vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::TRANSFER_DST
                | vk::BufferUsageFlags::TRANSFER_SRC,
        )
    }

    pub fn indirect(name: &str, size: vk::DeviceSize) -> Self {
        Self::new(name, size).with_bind_flags(
            vk::BufferUsageFlags::INDIRECT_BUFFER
                | vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::TRANSFER_DST,
        )
    }

    /// CPU-visible upload source.
    pub fn staging(name: &str, size: vk::DeviceSize) -> Self {
        Self::new(name, size)
            .with_bind_flags(vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST)
            .with_usage(Usage::Staging)
            .with_initial_state(ResourceState::COPY_SOURCE)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_bind_flags(mut self, flags: vk::BufferUsageFlags) -> Self {
        self.bind_flags = flags;
        self
    }

    pub fn with_additional_bind_flags(mut self, flags: vk::BufferUsageFlags) -> Self {
        self.bind_flags |= flags;
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_initial_state(mut self, state: ResourceState) -> Self {
        self.initial_state = state;
        self
    }

    #[inline]
    pub fn is_dynamic(&self) -> bool {
        self.usage == Usage::Dynamic
    }

    #[inline]
    pub fn is_host_visible(&self) -> bool {
        self.usage == Usage::Staging
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Display)]
pub enum TextureDimension {
    Tex1D,
    Tex1DArray,
    #[default]
    Tex2D,
    Tex2DArray,
    Tex3D,
    Cube,
    CubeArray,
}

impl TextureDimension {
    pub fn image_type(self) -> vk::ImageType {
        match self {
            TextureDimension::Tex1D | TextureDimension::Tex1DArray => vk::ImageType::TYPE_1D,
            TextureDimension::Tex3D => vk::ImageType::TYPE_3D,
            _ => vk::ImageType::TYPE_2D,
        }
    }

    pub fn view_type(self) -> vk::ImageViewType {
        match self {
            TextureDimension::Tex1D => vk::ImageViewType::TYPE_1D,
            TextureDimension::Tex1DArray => vk::ImageViewType::TYPE_1D_ARRAY,
            TextureDimension::Tex2D => vk::ImageViewType::TYPE_2D,
            TextureDimension::Tex2DArray => vk::ImageViewType::TYPE_2D_ARRAY,
            TextureDimension::Tex3D => vk::ImageViewType::TYPE_3D,
            TextureDimension::Cube => vk::ImageViewType::CUBE,
            TextureDimension::CubeArray => vk::ImageViewType::CUBE_ARRAY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TextureDesc {
    pub name: String,
    pub dimension: TextureDimension,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub usage: vk::ImageUsageFlags,
    pub initial_state: ResourceState,
}

impl Default for TextureDesc {
    fn default() -> Self {
        Self {
            name: String::new(),
            dimension: TextureDimension::Tex2D,
            width: 1,
            height: 1,
            depth: 1,
            mip_levels: 1,
            array_layers: 1,
            format: vk::Format::R8G8B8A8_UNORM,
            samples: vk::SampleCountFlags::TYPE_1,
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            initial_state: ResourceState::UNDEFINED,
        }
    }
}

impl TextureDesc {
    pub fn new_2d(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            width,
            height,
            format,
            ..Default::default()
        }
    }

    pub fn new_2d_array(width: u32, height: u32, layers: u32, format: vk::Format) -> Self {
        Self {
            dimension: TextureDimension::Tex2DArray,
            array_layers: layers,
            ..Self::new_2d(width, height, format)
        }
    }

    pub fn new_3d(width: u32, height: u32, depth: u32, format: vk::Format) -> Self {
        Self {
            dimension: TextureDimension::Tex3D,
            depth,
            ..Self::new_2d(width, height, format)
        }
    }

    pub fn new_cube(size: u32, format: vk::Format) -> Self {
        Self {
            dimension: TextureDimension::Cube,
            array_layers: 6,
            ..Self::new_2d(size, size, format)
        }
    }

    pub fn new_color_attachment(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST,
            ..Self::new_2d(width, height, format)
        }
    }

    pub fn new_depth_attachment(width: u32, height: u32) -> Self {
        Self {
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            ..Self::new_2d(width, height, vk::Format::D32_SFLOAT)
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    /// Allocate every level down to 1x1.
    pub fn with_full_mip_chain(mut self) -> Self {
        self.mip_levels = full_mip_count(self.width, self.height, self.depth);
        self
    }

    pub fn with_usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_additional_usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage |= usage;
        self
    }

    pub fn with_samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
        self
    }

    pub fn with_initial_state(mut self, state: ResourceState) -> Self {
        self.initial_state = state;
        self
    }

    #[inline]
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        format_aspect_mask(self.format)
    }

    /// Array slices addressable by barriers. Depth slices of a 3D texture are not.
    #[inline]
    pub fn slice_count(&self) -> u32 {
        if self.dimension == TextureDimension::Tex3D {
            1
        } else {
            self.array_layers
        }
    }

    pub fn mip_extent(&self, mip: u32) -> vk::Extent3D {
        vk::Extent3D {
            width: (self.width >> mip).max(1),
            height: (self.height >> mip).max(1),
            depth: (self.depth >> mip).max(1),
        }
    }

    pub fn full_range(&self) -> SubresourceRange {
        SubresourceRange::whole(self.aspect(), self.mip_levels, self.slice_count())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Display)]
pub enum TextureViewType {
    #[default]
    ShaderResource,
    RenderTarget,
    DepthStencil,
    UnorderedAccess,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TextureViewDesc {
    pub name: String,
    pub view_type: TextureViewType,
    /// `None` uses the texture format.
    pub format: Option<vk::Format>,
    pub most_detailed_mip: u32,
    /// 0 selects every remaining mip.
    pub num_mips: u32,
    pub first_slice: u32,
    /// 0 selects every remaining slice.
    pub num_slices: u32,
    /// Create the per-mip views `generate_mips` needs.
    pub allow_mip_generation: bool,
}

impl Default for TextureViewDesc {
    fn default() -> Self {
        Self {
            name: String::new(),
            view_type: TextureViewType::ShaderResource,
            format: None,
            most_detailed_mip: 0,
            num_mips: 0,
            first_slice: 0,
            num_slices: 0,
            allow_mip_generation: false,
        }
    }
}

impl TextureViewDesc {
    pub fn shader_resource() -> Self {
        Self::default()
    }

    pub fn render_target() -> Self {
        Self {
            view_type: TextureViewType::RenderTarget,
            num_mips: 1,
            ..Default::default()
        }
    }

    pub fn depth_stencil() -> Self {
        Self {
            view_type: TextureViewType::DepthStencil,
            num_mips: 1,
            ..Default::default()
        }
    }

    pub fn unordered_access() -> Self {
        Self {
            view_type: TextureViewType::UnorderedAccess,
            num_mips: 1,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_mips(mut self, most_detailed_mip: u32, num_mips: u32) -> Self {
        self.most_detailed_mip = most_detailed_mip;
        self.num_mips = num_mips;
        self
    }

    pub fn with_slices(mut self, first_slice: u32, num_slices: u32) -> Self {
        self.first_slice = first_slice;
        self.num_slices = num_slices;
        self
    }

    pub fn with_format(mut self, format: vk::Format) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_mip_generation(mut self) -> Self {
        self.allow_mip_generation = true;
        self
    }

    /// Fill in defaulted counts and format from the texture.
    pub fn resolve(&self, texture: &TextureDesc) -> TextureViewDesc {
        let mut resolved = self.clone();
        resolved.format = Some(self.format.unwrap_or(texture.format));
        if resolved.num_mips == 0 {
            resolved.num_mips = texture.mip_levels.saturating_sub(self.most_detailed_mip);
        }
        if resolved.num_slices == 0 {
            resolved.num_slices = texture.slice_count().saturating_sub(self.first_slice);
        }
        resolved
    }

    /// Native view type for a view of `texture`.
    pub fn native_view_type(&self, texture: &TextureDesc) -> vk::ImageViewType {
        match (self.view_type, texture.dimension) {
            // Attachments and storage images see cube faces as array slices.
            (TextureViewType::ShaderResource, dim) => dim.view_type(),
            (_, TextureDimension::Cube | TextureDimension::CubeArray) => vk::ImageViewType::TYPE_2D_ARRAY,
            (_, dim) => dim.view_type(),
        }
    }

    /// Subresources covered by a resolved view.
    pub fn subresource_range(&self, texture: &TextureDesc) -> SubresourceRange {
        SubresourceRange::new(
            texture.aspect(),
            self.most_detailed_mip,
            self.num_mips,
            self.first_slice,
            self.num_slices,
        )
    }
}

/// One vertex attribute of a pipeline input layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LayoutElement {
    pub input_index: u32,
    pub buffer_slot: u32,
    pub format: vk::Format,
    pub offset: u32,
}

/// Implemented by `#[derive(VertexLayout)]` for `#[repr(C)]` vertex structs.
pub trait VertexLayout {
    fn stride() -> u32;
    fn layout_elements(buffer_slot: u32, first_input: u32) -> Vec<LayoutElement>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum PipelineKind {
    Graphics,
    Compute,
}

/// Everything the engine needs to know about a pipeline it did not build.
#[derive(Clone, Debug)]
pub struct PipelineDesc {
    pub name: String,
    pub kind: PipelineKind,
    pub layout: vk::PipelineLayout,
    pub input_layout: Vec<LayoutElement>,
    /// Vertex stride per buffer slot.
    pub strides: SmallVec<[u32; MAX_BUFFER_SLOTS]>,
    pub color_formats: SmallVec<[vk::Format; MAX_RENDER_TARGETS]>,
    pub depth_format: Option<vk::Format>,
    pub samples: vk::SampleCountFlags,
}

impl PipelineDesc {
    pub fn graphics(name: &str, layout: vk::PipelineLayout) -> Self {
        Self {
            name: name.to_owned(),
            kind: PipelineKind::Graphics,
            layout,
            input_layout: Vec::new(),
            strides: SmallVec::new(),
            color_formats: SmallVec::new(),
            depth_format: None,
            samples: vk::SampleCountFlags::TYPE_1,
        }
    }

    pub fn compute(name: &str, layout: vk::PipelineLayout) -> Self {
        Self {
            kind: PipelineKind::Compute,
            ..Self::graphics(name, layout)
        }
    }

    pub fn with_input_layout(mut self, elements: impl IntoIterator<Item = LayoutElement>) -> Self {
        self.input_layout.extend(elements);
        self
    }

    pub fn with_stride(mut self, slot: u32, stride: u32) -> Self {
        let slot = slot as usize;
        if self.strides.len() <= slot {
            self.strides.resize(slot + 1, 0);
        }
        self.strides[slot] = stride;
        self
    }

    /// Append the attributes of `V` read from `slot`.
    pub fn with_vertex<V: VertexLayout>(self, slot: u32) -> Self {
        let first_input = self.input_layout.len() as u32;
        self.with_input_layout(V::layout_elements(slot, first_input))
            .with_stride(slot, V::stride())
    }

    pub fn with_color_formats(mut self, formats: &[vk::Format]) -> Self {
        self.color_formats = formats.iter().copied().collect();
        self
    }

    pub fn with_depth_format(mut self, format: vk::Format) -> Self {
        self.depth_format = Some(format);
        self
    }

    /// Bit `n` is set when the input layout reads buffer slot `n`.
    pub fn referenced_slots(&self) -> u32 {
        self.input_layout.iter().fold(0, |mask, e| mask | (1 << e.buffer_slot))
    }

    pub fn stride(&self, slot: u32) -> u32 {
        self.strides.get(slot as usize).copied().unwrap_or(0)
    }

    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        match self.kind {
            PipelineKind::Graphics => vk::PipelineBindPoint::GRAPHICS,
            PipelineKind::Compute => vk::PipelineBindPoint::COMPUTE,
        }
    }
}

pub(crate) struct BufferEntry {
    pub desc: BufferDesc,
    /// Null for dynamic buffers.
    pub native: NativeBuffer,
    pub state: ResourceState,
}

pub(crate) struct TextureEntry {
    pub desc: TextureDesc,
    pub native: NativeImage,
    pub state: ResourceState,
    /// No transition has been recorded since creation.
    pub fresh: bool,
    /// Imported images are not destroyed with the texture.
    pub owned: bool,
}

/// Single-mip views used by the compute mip path.
#[derive(Clone, Copy, Debug)]
pub struct MipLevelViews {
    pub sampled: vk::ImageView,
    pub storage: vk::ImageView,
}

pub(crate) struct TextureViewEntry {
    pub texture: TextureId,
    /// Resolved: counts and format filled in.
    pub desc: TextureViewDesc,
    pub handle: vk::ImageView,
    pub mip_views: Vec<MipLevelViews>,
}

pub(crate) struct PipelineEntry {
    pub desc: PipelineDesc,
    pub handle: vk::Pipeline,
}

/// Storage for every live object of a device, keyed by identity.
#[derive(Default)]
pub(crate) struct ResourceArena {
    pub buffers: HashMap<BufferId, BufferEntry>,
    pub textures: HashMap<TextureId, TextureEntry>,
    pub views: HashMap<TextureViewId, TextureViewEntry>,
    pub pipelines: HashMap<PipelineId, PipelineEntry>,
}

impl ResourceArena {
    pub fn views_of(&self, texture: TextureId) -> Vec<TextureViewId> {
        self.views
            .iter()
            .filter(|(_, view)| view.texture == texture)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buffers.len() + self.textures.len() + self.views.len() + self.pipelines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_display_with_kind() {
        assert_eq!(BufferId(7).to_string(), "buffer#7");
        assert_eq!(ObjectId::from(PipelineId(3)).to_string(), "pipeline#3");
    }

    #[test]
    fn view_resolves_remaining_mips_and_slices() {
        let texture = TextureDesc::new_2d_array(64, 64, 4, vk::Format::R8G8B8A8_UNORM).with_full_mip_chain();
        assert_eq!(texture.mip_levels, 7);

        let view = TextureViewDesc::shader_resource().with_mips(2, 0).with_slices(1, 0).resolve(&texture);
        assert_eq!(view.num_mips, 5);
        assert_eq!(view.num_slices, 3);
        assert_eq!(view.format, Some(vk::Format::R8G8B8A8_UNORM));
    }

    #[test]
    fn cube_attachments_are_arrays() {
        let cube = TextureDesc::new_cube(32, vk::Format::R16G16B16A16_SFLOAT);
        assert_eq!(
            TextureViewDesc::shader_resource().native_view_type(&cube),
            vk::ImageViewType::CUBE
        );
        assert_eq!(
            TextureViewDesc::render_target().native_view_type(&cube),
            vk::ImageViewType::TYPE_2D_ARRAY
        );
    }

    #[test]
    fn referenced_slots_follow_input_layout() {
        let desc = PipelineDesc::graphics("p", vk::PipelineLayout::null())
            .with_input_layout([
                LayoutElement { input_index: 0, buffer_slot: 0, format: vk::Format::R32G32B32_SFLOAT, offset: 0 },
                LayoutElement { input_index: 1, buffer_slot: 2, format: vk::Format::R32G32_SFLOAT, offset: 0 },
            ])
            .with_stride(0, 12)
            .with_stride(2, 8);
        assert_eq!(desc.referenced_slots(), 0b101);
        assert_eq!(desc.stride(1), 0);
        assert_eq!(desc.stride(2), 8);
    }
}
