mod common;

use common::{color_target, commands_after, device, position_pipeline, vertex_buffer};
use meridian_rhi::backend::capture::Command;
use meridian_rhi::{
    vk, BufferDesc, DrawAttribs, DrawIndirectAttribs, RenderPassClear, ResourceState, StateTransitionMode,
    VertexStream,
};

#[test]
fn explicit_pass_clears_attachments_and_keeps_draws_inside() {
    let (capture, device) = device();
    let (texture, view) = color_target(&device, "target", 64);
    let pipeline = position_pipeline(&device, "opaque");
    let buffer = vertex_buffer(&device, "mesh");
    let mut context = device.create_immediate_context().unwrap();
    context.set_vertex_buffers(0, &[VertexStream::new(buffer, 0)], true, StateTransitionMode::Transition);
    assert!(context.set_render_targets(&[view], None, StateTransitionMode::Transition));
    context.set_pipeline_state(pipeline);
    let before = capture.submissions().len();

    let clear = RenderPassClear {
        colors: smallvec::smallvec![Some(vk::ClearColorValue { float32: [0.0, 0.0, 0.0, 1.0] })],
        depth_stencil: None,
    };
    assert!(context.begin_render_pass(&clear));
    context.draw(&DrawAttribs::new(3));
    context.draw(&DrawAttribs::new(6).instanced(2));
    context.end_render_pass();
    context.flush().unwrap();

    let commands = commands_after(&capture, before);
    let begins = commands.iter().filter(|c| matches!(c, Command::BeginRenderPass { .. })).count();
    assert_eq!(begins, 1);
    let begin = commands
        .iter()
        .position(|c| matches!(c, Command::BeginRenderPass { extent: (64, 64), .. }))
        .unwrap();
    let end = commands.iter().position(|c| matches!(c, Command::EndRenderPass)).unwrap();
    assert!(matches!(commands[begin + 1], Command::ClearAttachments { attachments: 1, rects: 1 }));
    let draws: Vec<_> = commands
        .iter()
        .enumerate()
        .filter(|(_, c)| matches!(c, Command::Draw { .. }))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(draws.len(), 2);
    assert!(draws.iter().all(|&i| begin < i && i < end));
    assert_eq!(device.texture_state(texture), Some(ResourceState::RENDER_TARGET));
}

#[test]
fn framebuffers_are_shared_between_identical_target_sets() {
    let (_capture, device) = device();
    let (_, a) = color_target(&device, "a", 32);
    let (_, b) = color_target(&device, "b", 32);
    let mut context = device.create_immediate_context().unwrap();

    for _ in 0..3 {
        assert!(context.set_render_targets(&[a], None, StateTransitionMode::Transition));
        assert!(context.set_render_targets(&[b], None, StateTransitionMode::Transition));
    }
    assert_eq!(device.framebuffer_count(), 2);
    assert!(context.set_render_targets(&[a, b], None, StateTransitionMode::Transition));
    assert_eq!(device.framebuffer_count(), 3);

    // Destroying a view drops every framebuffer that references it.
    device.destroy_texture_view(a).unwrap();
    assert_eq!(device.framebuffer_count(), 1);
    context.flush().unwrap();
}

#[test]
fn mismatched_target_sizes_are_rejected() {
    let (_capture, device) = device();
    let (_, small) = color_target(&device, "small", 32);
    let (_, large) = color_target(&device, "large", 64);
    let mut context = device.create_immediate_context().unwrap();

    assert!(!context.set_render_targets(&[small, large], None, StateTransitionMode::Transition));
    assert_eq!(device.framebuffer_count(), 0);
}

#[test]
fn indirect_arguments_move_into_place_before_the_pass() {
    let (capture, device) = device();
    let (_, view) = color_target(&device, "target", 32);
    let pipeline = position_pipeline(&device, "opaque");
    let buffer = vertex_buffer(&device, "mesh");
    let arguments = device.create_buffer(&BufferDesc::indirect("arguments", 64), None).unwrap();
    let mut context = device.create_immediate_context().unwrap();
    assert!(context.set_render_targets(&[view], None, StateTransitionMode::Transition));
    context.set_pipeline_state(pipeline);
    context.set_vertex_buffers(0, &[VertexStream::new(buffer, 0)], true, StateTransitionMode::Transition);
    let before = capture.submissions().len();

    context.draw_indirect(&DrawIndirectAttribs {
        buffer: arguments,
        offset: 16,
        draw_count: 1,
        stride: 16,
        index_type: None,
        mode: StateTransitionMode::Transition,
    });
    context.flush().unwrap();

    assert_eq!(device.buffer_state(arguments), Some(ResourceState::INDIRECT_ARGUMENT));
    let commands = commands_after(&capture, before);
    let handle = device.buffer_handle(arguments).unwrap();
    let begin = commands
        .iter()
        .position(|c| matches!(c, Command::BeginRenderPass { .. }))
        .unwrap();
    let draw = commands
        .iter()
        .position(|c| matches!(c, Command::DrawIndirect { buffer, offset: 16, .. } if *buffer == handle))
        .unwrap();
    let last_barrier = commands.iter().rposition(|c| c.is_barrier()).unwrap();
    assert!(last_barrier < begin && begin < draw);
}
