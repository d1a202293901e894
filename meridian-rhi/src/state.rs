//! Abstract resource states and their native (layout, access, stage) equivalents.

use ash::vk;
use enumflags2::{make_bitflags, BitFlags};
use crate::error::verify;

#[enumflags2::bitflags]
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StateFlag {
    Undefined = 1 << 0,
    VertexBuffer = 1 << 1,
    ConstantBuffer = 1 << 2,
    IndexBuffer = 1 << 3,
    RenderTarget = 1 << 4,
    UnorderedAccess = 1 << 5,
    DepthWrite = 1 << 6,
    DepthRead = 1 << 7,
    ShaderResource = 1 << 8,
    IndirectArgument = 1 << 9,
    CopyDest = 1 << 10,
    CopySource = 1 << 11,
    ResolveDest = 1 << 12,
    ResolveSource = 1 << 13,
    InputAttachment = 1 << 14,
    Present = 1 << 15,
    Common = 1 << 16,
}

/// Logical usage state of a buffer or texture.
///
/// The empty set is `UNKNOWN`: the state is not tracked, or the caller defers to the stored one.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ResourceState(BitFlags<StateFlag>);

impl ResourceState {
    pub const UNKNOWN: Self = Self(BitFlags::EMPTY);
    pub const UNDEFINED: Self = Self(make_bitflags!(StateFlag::{Undefined}));
    pub const VERTEX_BUFFER: Self = Self(make_bitflags!(StateFlag::{VertexBuffer}));
    pub const CONSTANT_BUFFER: Self = Self(make_bitflags!(StateFlag::{ConstantBuffer}));
    pub const INDEX_BUFFER: Self = Self(make_bitflags!(StateFlag::{IndexBuffer}));
    pub const RENDER_TARGET: Self = Self(make_bitflags!(StateFlag::{RenderTarget}));
    pub const UNORDERED_ACCESS: Self = Self(make_bitflags!(StateFlag::{UnorderedAccess}));
    pub const DEPTH_WRITE: Self = Self(make_bitflags!(StateFlag::{DepthWrite}));
    pub const DEPTH_READ: Self = Self(make_bitflags!(StateFlag::{DepthRead}));
    pub const SHADER_RESOURCE: Self = Self(make_bitflags!(StateFlag::{ShaderResource}));
    pub const INDIRECT_ARGUMENT: Self = Self(make_bitflags!(StateFlag::{IndirectArgument}));
    pub const COPY_DEST: Self = Self(make_bitflags!(StateFlag::{CopyDest}));
    pub const COPY_SOURCE: Self = Self(make_bitflags!(StateFlag::{CopySource}));
    pub const RESOLVE_DEST: Self = Self(make_bitflags!(StateFlag::{ResolveDest}));
    pub const RESOLVE_SOURCE: Self = Self(make_bitflags!(StateFlag::{ResolveSource}));
    pub const INPUT_ATTACHMENT: Self = Self(make_bitflags!(StateFlag::{InputAttachment}));
    pub const PRESENT: Self = Self(make_bitflags!(StateFlag::{Present}));
    pub const COMMON: Self = Self(make_bitflags!(StateFlag::{Common}));
    pub const GENERIC_READ: Self = Self(make_bitflags!(StateFlag::{
        VertexBuffer | ConstantBuffer | IndexBuffer | ShaderResource | IndirectArgument | CopySource
    }));

    #[inline]
    pub fn is_unknown(self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn is_known(self) -> bool {
        !self.is_unknown()
    }

    /// True if every flag of `other` is set in `self`.
    #[inline]
    pub fn contains(self, other: ResourceState) -> bool {
        self.0.contains(other.0)
    }

    #[inline]
    pub fn intersects(self, other: ResourceState) -> bool {
        self.0.intersects(other.0)
    }

    /// The single flag of this state, or `None` for unknown and combined states.
    #[inline]
    pub fn single(self) -> Option<StateFlag> {
        self.0.exactly_one()
    }

    pub fn flags(self) -> impl Iterator<Item = StateFlag> {
        self.0.iter()
    }
}

impl From<StateFlag> for ResourceState {
    fn from(flag: StateFlag) -> Self {
        Self(BitFlags::from_flag(flag))
    }
}

impl core::ops::BitOr for ResourceState {
    type Output = ResourceState;
    fn bitor(self, rhs: ResourceState) -> Self::Output {
        ResourceState(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for ResourceState {
    fn bitor_assign(&mut self, rhs: ResourceState) {
        self.0 |= rhs.0;
    }
}

impl std::fmt::Debug for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_unknown() {
            return f.write_str("Unknown");
        }
        for (i, flag) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" | ")?;
            }
            write!(f, "{:?}", flag)?;
        }
        Ok(())
    }
}

/// How an operation treats the state of a resource it touches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum StateTransitionMode {
    /// Do not look at the state at all.
    #[default]
    None,
    /// Emit a barrier when the resource is not already in the required state.
    Transition,
    /// Assert (debug builds only) that the caller already transitioned the resource.
    Verify,
}

/// Native image layout for a single-flag state.
pub fn resource_state_to_image_layout(state: ResourceState, inside_render_pass: bool) -> vk::ImageLayout {
    if state.is_unknown() {
        return vk::ImageLayout::UNDEFINED;
    }
    let Some(flag) = state.single() else {
        verify!(false, "Image state must be a single flag, got {}", state);
        return vk::ImageLayout::UNDEFINED;
    };
    match flag {
        StateFlag::Undefined => vk::ImageLayout::UNDEFINED,
        StateFlag::RenderTarget => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        StateFlag::UnorderedAccess | StateFlag::Common => vk::ImageLayout::GENERAL,
        StateFlag::DepthWrite => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        StateFlag::DepthRead => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        StateFlag::ShaderResource | StateFlag::InputAttachment => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        StateFlag::CopyDest => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        StateFlag::CopySource | StateFlag::ResolveSource => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        StateFlag::ResolveDest => {
            if inside_render_pass {
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
            } else {
                vk::ImageLayout::TRANSFER_DST_OPTIMAL
            }
        }
        StateFlag::Present => vk::ImageLayout::PRESENT_SRC_KHR,
        StateFlag::VertexBuffer
        | StateFlag::ConstantBuffer
        | StateFlag::IndexBuffer
        | StateFlag::IndirectArgument => {
            verify!(false, "{:?} is not a valid texture state", flag);
            vk::ImageLayout::UNDEFINED
        }
    }
}

/// Inverse of [`resource_state_to_image_layout`] for the layouts the engine produces.
pub fn image_layout_to_resource_state(layout: vk::ImageLayout) -> ResourceState {
    match layout {
        vk::ImageLayout::UNDEFINED => ResourceState::UNDEFINED,
        vk::ImageLayout::GENERAL => ResourceState::UNORDERED_ACCESS,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => ResourceState::RENDER_TARGET,
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => ResourceState::DEPTH_WRITE,
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL => ResourceState::DEPTH_READ,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => ResourceState::SHADER_RESOURCE,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => ResourceState::COPY_SOURCE,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => ResourceState::COPY_DEST,
        vk::ImageLayout::PRESENT_SRC_KHR => ResourceState::PRESENT,
        other => {
            verify!(false, "Image layout {:?} has no resource state", other);
            ResourceState::UNDEFINED
        }
    }
}

fn state_flag_to_access_flags(flag: StateFlag) -> vk::AccessFlags2 {
    match flag {
        StateFlag::Undefined => vk::AccessFlags2::NONE,
        StateFlag::VertexBuffer => vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
        StateFlag::ConstantBuffer => vk::AccessFlags2::UNIFORM_READ,
        StateFlag::IndexBuffer => vk::AccessFlags2::INDEX_READ,
        StateFlag::RenderTarget => vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        StateFlag::UnorderedAccess => vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE,
        StateFlag::DepthWrite => vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
        StateFlag::DepthRead => vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ,
        StateFlag::ShaderResource => vk::AccessFlags2::SHADER_READ,
        StateFlag::IndirectArgument => vk::AccessFlags2::INDIRECT_COMMAND_READ,
        StateFlag::CopyDest | StateFlag::ResolveDest => vk::AccessFlags2::TRANSFER_WRITE,
        StateFlag::CopySource | StateFlag::ResolveSource => vk::AccessFlags2::TRANSFER_READ,
        StateFlag::InputAttachment => vk::AccessFlags2::INPUT_ATTACHMENT_READ,
        StateFlag::Present => vk::AccessFlags2::NONE,
        StateFlag::Common => vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
    }
}

/// Access mask implied by a (possibly combined) state.
pub fn resource_state_to_access_flags(state: ResourceState) -> vk::AccessFlags2 {
    state
        .flags()
        .fold(vk::AccessFlags2::NONE, |acc, flag| acc | state_flag_to_access_flags(flag))
}

/// Canonical access mask of an image layout.
pub fn image_layout_to_access_flags(layout: vk::ImageLayout, is_destination: bool) -> vk::AccessFlags2 {
    match layout {
        vk::ImageLayout::UNDEFINED => {
            verify!(!is_destination, "The new layout must not be UNDEFINED");
            vk::AccessFlags2::NONE
        }
        vk::ImageLayout::GENERAL => vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => {
            vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE
        }
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => {
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE
        }
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL => vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => {
            vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::INPUT_ATTACHMENT_READ
        }
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => vk::AccessFlags2::TRANSFER_READ,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::AccessFlags2::TRANSFER_WRITE,
        vk::ImageLayout::PREINITIALIZED => {
            verify!(!is_destination, "The new layout must not be PREINITIALIZED");
            vk::AccessFlags2::HOST_WRITE
        }
        vk::ImageLayout::PRESENT_SRC_KHR => vk::AccessFlags2::MEMORY_READ,
        other => {
            verify!(false, "Unexpected image layout {:?}", other);
            vk::AccessFlags2::NONE
        }
    }
}

/// Minimal set of pipeline stages that can perform the given accesses.
///
/// `shader_stages` is the set of shader stages enabled on the device; shader reads and writes map to all of them.
pub fn access_flags_to_pipeline_stages(
    access: vk::AccessFlags2,
    shader_stages: vk::PipelineStageFlags2,
) -> vk::PipelineStageFlags2 {
    let mut stages = vk::PipelineStageFlags2::NONE;
    let mut bits = access.as_raw();
    while bits != 0 {
        let bit = bits & bits.wrapping_neg();
        bits &= bits - 1;

        stages |= match vk::AccessFlags2::from_raw(bit) {
            vk::AccessFlags2::INDIRECT_COMMAND_READ => vk::PipelineStageFlags2::DRAW_INDIRECT,
            vk::AccessFlags2::INDEX_READ | vk::AccessFlags2::VERTEX_ATTRIBUTE_READ => {
                vk::PipelineStageFlags2::VERTEX_INPUT
            }
            vk::AccessFlags2::UNIFORM_READ
            | vk::AccessFlags2::SHADER_READ
            | vk::AccessFlags2::SHADER_WRITE => shader_stages,
            vk::AccessFlags2::INPUT_ATTACHMENT_READ => vk::PipelineStageFlags2::FRAGMENT_SHADER,
            vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE => {
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT
            }
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
            | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE => {
                vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS
            }
            vk::AccessFlags2::TRANSFER_READ | vk::AccessFlags2::TRANSFER_WRITE => {
                vk::PipelineStageFlags2::TRANSFER
            }
            vk::AccessFlags2::HOST_READ | vk::AccessFlags2::HOST_WRITE => vk::PipelineStageFlags2::HOST,
            vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE => vk::PipelineStageFlags2::NONE,
            other => {
                verify!(false, "Unexpected access flag {:?}", other);
                vk::PipelineStageFlags2::NONE
            }
        };
    }
    stages
}

/// Aspect mask for an image format.
pub fn format_aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        vk::Format::D16_UNORM_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}
