mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use common::{commands_after, device, image_barriers};
use meridian_rhi::backend::capture::Command;
use meridian_rhi::vk::Handle;
use meridian_rhi::{
    vk, CaptureBackend, DeviceConfig, MipComputeProvider, MipVariant, RenderDevice, ResourceState, RhiError,
    StateTransitionDesc, TextureDesc, TextureViewDesc,
};

/// Hands out synthetic pipelines and the first `descriptor_sets` descriptor sets it is asked for.
struct Downsampler {
    descriptor_sets: u32,
    handed_out: AtomicU32,
    next: AtomicU64,
}

impl Downsampler {
    fn new(descriptor_sets: u32) -> Self {
        Self {
            descriptor_sets,
            handed_out: AtomicU32::new(0),
            next: AtomicU64::new(0x5000),
        }
    }
}

impl MipComputeProvider for Downsampler {
    fn pipeline_layout(&self) -> vk::PipelineLayout {
        vk::PipelineLayout::from_raw(0x4000)
    }

    fn create_pipeline(&self, _format: vk::Format, _variant: MipVariant) -> Result<vk::Pipeline, RhiError> {
        Ok(vk::Pipeline::from_raw(self.next.fetch_add(1, Ordering::Relaxed)))
    }

    fn descriptor_set(&self, _src: vk::ImageView, _dst: &[vk::ImageView; 4]) -> Option<vk::DescriptorSet> {
        if self.handed_out.fetch_add(1, Ordering::Relaxed) >= self.descriptor_sets {
            return None;
        }
        Some(vk::DescriptorSet::from_raw(self.next.fetch_add(1, Ordering::Relaxed)))
    }
}

fn compute_device(descriptor_sets: u32) -> (CaptureBackend, Arc<RenderDevice>) {
    let capture = CaptureBackend::new();
    let provider: Arc<dyn MipComputeProvider> = Arc::new(Downsampler::new(descriptor_sets));
    let device = RenderDevice::with_mip_provider(Arc::new(capture.clone()), DeviceConfig::default(), Some(provider))
        .unwrap();
    (capture, device)
}

fn storage_chain(device: &RenderDevice, size: u32) -> (meridian_rhi::TextureId, meridian_rhi::TextureViewId) {
    let texture = device
        .create_texture(
            &TextureDesc::new_color_attachment(size, size, vk::Format::R8G8B8A8_UNORM)
                .with_name("storage chain")
                .with_additional_usage(vk::ImageUsageFlags::STORAGE)
                .with_full_mip_chain(),
        )
        .unwrap();
    let view = device
        .create_texture_view(texture, &TextureViewDesc::shader_resource().with_mip_generation())
        .unwrap();
    (texture, view)
}

fn mip_chain(device: &meridian_rhi::RenderDevice, size: u32) -> meridian_rhi::TextureId {
    device
        .create_texture(
            &TextureDesc::new_color_attachment(size, size, vk::Format::R8G8B8A8_UNORM)
                .with_name("chain")
                .with_full_mip_chain(),
        )
        .unwrap()
}

fn blits(commands: &[Command]) -> Vec<(u32, u32)> {
    commands
        .iter()
        .filter_map(|c| match c {
            Command::BlitImage { mips, .. } => Some(mips.clone()),
            _ => None,
        })
        .flatten()
        .collect()
}

#[test]
fn full_view_blits_every_level_and_ends_in_shader_resource() {
    let (capture, device) = device();
    let texture = mip_chain(&device, 64);
    assert_eq!(device.texture_desc(texture).unwrap().mip_levels, 7);
    let view = device
        .create_texture_view(texture, &TextureViewDesc::shader_resource().with_mip_generation())
        .unwrap();
    let mut context = device.create_immediate_context().unwrap();
    context.transition_resource_states(&[StateTransitionDesc::texture(texture, ResourceState::COPY_DEST)]);
    context.flush().unwrap();
    let before = capture.submissions().len();

    assert!(context.generate_mips(view));
    context.flush().unwrap();

    let commands = commands_after(&capture, before);
    assert_eq!(blits(&commands), (1..7).map(|mip| (mip - 1, mip)).collect::<Vec<_>>());
    let image = device.texture_handle(texture).unwrap();
    let last = image_barriers(&commands, image).pop().unwrap();
    assert_eq!(last.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    assert_eq!(device.texture_state(texture), Some(ResourceState::SHADER_RESOURCE));
}

#[test]
fn undefined_contents_are_generated_from_shader_resource() {
    let (capture, device) = device();
    let texture = mip_chain(&device, 16);
    let view = device
        .create_texture_view(texture, &TextureViewDesc::shader_resource().with_mip_generation())
        .unwrap();
    let mut context = device.create_immediate_context().unwrap();

    assert!(context.generate_mips(view));
    context.flush().unwrap();
    assert_eq!(blits(&capture.submitted_commands()).len(), 4);
    assert_eq!(device.texture_state(texture), Some(ResourceState::SHADER_RESOURCE));
}

#[test]
fn partial_view_returns_to_the_original_state() {
    let (capture, device) = device();
    let texture = mip_chain(&device, 32);
    let view = device
        .create_texture_view(
            texture,
            &TextureViewDesc::shader_resource().with_mips(1, 3).with_mip_generation(),
        )
        .unwrap();
    let mut context = device.create_immediate_context().unwrap();
    context.transition_resource_states(&[StateTransitionDesc::texture(texture, ResourceState::COPY_DEST)]);
    context.flush().unwrap();
    let before = capture.submissions().len();

    assert!(context.generate_mips(view));
    context.flush().unwrap();

    let commands = commands_after(&capture, before);
    assert_eq!(blits(&commands), vec![(1, 2), (2, 3)]);
    let image = device.texture_handle(texture).unwrap();
    let last = image_barriers(&commands, image).pop().unwrap();
    assert_eq!(last.old_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    assert_eq!(last.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    assert_eq!((last.range.base_mip, last.range.mip_count), (1, 3));
    assert_eq!(device.texture_state(texture), Some(ResourceState::COPY_DEST));
}

#[test]
fn single_level_view_has_nothing_to_do() {
    let (capture, device) = device();
    let texture = mip_chain(&device, 32);
    let view = device
        .create_texture_view(
            texture,
            &TextureViewDesc::shader_resource().with_mips(2, 1).with_mip_generation(),
        )
        .unwrap();
    let mut context = device.create_immediate_context().unwrap();
    let before = capture.submissions().len();

    assert!(context.generate_mips(view));
    context.flush().unwrap();
    assert!(blits(&commands_after(&capture, before)).is_empty());
}

#[test]
fn texture_in_unknown_state_is_refused() {
    let (capture, device) = device();
    let desc = TextureDesc::new_color_attachment(32, 32, vk::Format::R8G8B8A8_UNORM).with_full_mip_chain();
    let texture = device.import_texture(&desc, vk::Image::null(), ResourceState::UNKNOWN);
    let view = device
        .create_texture_view(texture, &TextureViewDesc::shader_resource().with_mip_generation())
        .unwrap();
    let mut context = device.create_immediate_context().unwrap();

    assert!(!context.generate_mips(view));
    context.flush().unwrap();
    assert!(blits(&capture.submitted_commands()).is_empty());
    device.destroy_texture(texture).unwrap();
}

#[test]
fn compute_path_dispatches_up_to_four_levels_at_a_time() {
    let (capture, device) = compute_device(u32::MAX);
    let (texture, view) = storage_chain(&device, 64);
    let mut context = device.create_immediate_context().unwrap();
    context.transition_resource_states(&[StateTransitionDesc::texture(texture, ResourceState::COPY_DEST)]);
    context.flush().unwrap();
    let before = capture.submissions().len();

    assert!(context.generate_mips(view));
    context.flush().unwrap();

    let commands = commands_after(&capture, before);
    // 64 -> 4 in one dispatch, then 4 -> 1.
    let dispatches = commands.iter().filter(|c| matches!(c, Command::Dispatch { .. })).count();
    assert_eq!(dispatches, 2);
    assert!(blits(&commands).is_empty());
    assert_eq!(device.texture_state(texture), Some(ResourceState::SHADER_RESOURCE));
}

#[test]
fn missing_descriptor_set_falls_back_to_blits_before_touching_layouts() {
    // Enough for the first dispatch only.
    let (capture, device) = compute_device(1);
    let (texture, view) = storage_chain(&device, 64);
    let mut context = device.create_immediate_context().unwrap();
    context.transition_resource_states(&[StateTransitionDesc::texture(texture, ResourceState::COPY_DEST)]);
    context.flush().unwrap();
    let before = capture.submissions().len();

    assert!(context.generate_mips(view));
    context.flush().unwrap();

    let commands = commands_after(&capture, before);
    assert!(!commands.iter().any(|c| matches!(c, Command::Dispatch { .. })));
    assert_eq!(blits(&commands), (1..7).map(|mip| (mip - 1, mip)).collect::<Vec<_>>());
    let image = device.texture_handle(texture).unwrap();
    let barriers = image_barriers(&commands, image);
    assert!(barriers.iter().all(|b| b.new_layout != vk::ImageLayout::GENERAL));
    assert_eq!(barriers.last().unwrap().new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    assert_eq!(device.texture_state(texture), Some(ResourceState::SHADER_RESOURCE));
}
