#![allow(dead_code)]

use std::sync::Arc;
use meridian_rhi::backend::capture::Command;
use meridian_rhi::barrier::{BufferBarrier, ImageBarrier};
use meridian_rhi::vk::{self, Handle};
use meridian_rhi::{
    BufferDesc, BufferId, CaptureBackend, DeviceConfig, LayoutElement, PipelineDesc, PipelineId, RenderDevice,
    TextureDesc, TextureId, TextureViewDesc, TextureViewId,
};

pub fn device() -> (CaptureBackend, Arc<RenderDevice>) {
    device_with(DeviceConfig::default())
}

pub fn device_with(config: DeviceConfig) -> (CaptureBackend, Arc<RenderDevice>) {
    let capture = CaptureBackend::new();
    let device = RenderDevice::new(Arc::new(capture.clone()), config).unwrap();
    (capture, device)
}

/// Commands of every submission after the first `skip`.
pub fn commands_after(capture: &CaptureBackend, skip: usize) -> Vec<Command> {
    capture
        .submissions()
        .into_iter()
        .skip(skip)
        .flat_map(|s| s.command_buffers.into_iter())
        .flat_map(|c| c.commands.into_iter())
        .collect()
}

pub fn image_barriers(commands: &[Command], image: vk::Image) -> Vec<ImageBarrier> {
    commands
        .iter()
        .filter_map(|c| match c {
            Command::PipelineBarrier { images, .. } => Some(images.iter().filter(|b| b.image == image).cloned()),
            _ => None,
        })
        .flatten()
        .collect()
}

pub fn buffer_barriers(commands: &[Command], buffer: vk::Buffer) -> Vec<BufferBarrier> {
    commands
        .iter()
        .filter_map(|c| match c {
            Command::PipelineBarrier { buffers, .. } => Some(buffers.iter().filter(|b| b.buffer == buffer).cloned()),
            _ => None,
        })
        .flatten()
        .collect()
}

pub fn color_target(device: &RenderDevice, name: &str, size: u32) -> (TextureId, TextureViewId) {
    let texture = device
        .create_texture(&TextureDesc::new_color_attachment(size, size, vk::Format::R8G8B8A8_UNORM).with_name(name))
        .unwrap();
    let view = device
        .create_texture_view(texture, &TextureViewDesc::render_target())
        .unwrap();
    (texture, view)
}

/// A graphics pipeline reading a float3 position from slot 0.
pub fn position_pipeline(device: &RenderDevice, name: &str) -> PipelineId {
    let desc = PipelineDesc::graphics(name, vk::PipelineLayout::from_raw(0x77))
        .with_input_layout([LayoutElement {
            input_index: 0,
            buffer_slot: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: 0,
        }])
        .with_stride(0, 12)
        .with_color_formats(&[vk::Format::R8G8B8A8_UNORM]);
    device.register_pipeline(desc, vk::Pipeline::from_raw(0x7700 + name.len() as u64))
}

pub fn vertex_buffer(device: &RenderDevice, name: &str) -> BufferId {
    device.create_buffer(&BufferDesc::vertex(name, 1024), None).unwrap()
}
