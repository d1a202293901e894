mod common;

use common::{commands_after, device};
use meridian_rhi::backend::capture::Command;
use meridian_rhi::{BufferDesc, ResourceState, StateTransitionDesc, StateTransitionMode};

#[test]
fn every_map_returns_fresh_memory() {
    let (capture, device) = device();
    let constants = device.create_buffer(&BufferDesc::uniform("constants", 64), None).unwrap();
    let mut context = device.create_immediate_context().unwrap();

    let mut first = context.map_buffer(constants).unwrap();
    first.fill(0xab);
    let first_allocation = first.allocation();
    context.unmap_buffer(first);

    let mut second = context.map_buffer(constants).unwrap();
    second.fill(0xcd);
    let second_allocation = second.allocation();
    context.unmap_buffer(second);

    assert_ne!(first_allocation.offset, second_allocation.offset);
    assert_eq!(first_allocation.offset % 256, 0);
    assert_eq!(second_allocation.offset % 256, 0);
    assert_eq!(context.dynamic_allocation(constants), Some(second_allocation));

    let heap = capture.buffer_contents(device.dynamic_memory().buffer()).unwrap();
    let at = |offset: u64| &heap[offset as usize..offset as usize + 64];
    assert!(at(first_allocation.offset).iter().all(|&b| b == 0xab));
    assert!(at(second_allocation.offset).iter().all(|&b| b == 0xcd));
    context.finish_frame();
}

#[test]
fn only_dynamic_buffers_can_be_mapped() {
    let (_capture, device) = device();
    let storage = device.create_buffer(&BufferDesc::storage("storage", 64), None).unwrap();
    let mut context = device.create_immediate_context().unwrap();
    assert!(context.map_buffer(storage).is_none());
}

#[test]
fn dynamic_buffers_copy_from_their_current_allocation() {
    let (capture, device) = device();
    let constants = device.create_buffer(&BufferDesc::uniform("constants", 32), None).unwrap();
    let history = device.create_buffer(&BufferDesc::storage("history", 64), None).unwrap();
    let mut context = device.create_immediate_context().unwrap();
    let before = capture.submissions().len();

    let mapped = context.map_buffer(constants).unwrap();
    let allocation = mapped.allocation();
    context.unmap_buffer(mapped);
    context.copy_buffer(constants, 8, StateTransitionMode::None, history, 16, 16, StateTransitionMode::Transition);
    // Copies into dynamic memory are refused.
    context.copy_buffer(history, 0, StateTransitionMode::Transition, constants, 0, 16, StateTransitionMode::None);
    context.flush().unwrap();

    let copies: Vec<_> = commands_after(&capture, before)
        .into_iter()
        .filter_map(|c| match c {
            Command::CopyBuffer { src, dst, regions } => Some((src, dst, regions)),
            _ => None,
        })
        .collect();
    assert_eq!(copies.len(), 1);
    let (src, dst, regions) = &copies[0];
    assert_eq!(*src, device.dynamic_memory().buffer());
    assert_eq!(Some(*dst), device.buffer_handle(history));
    assert_eq!(regions, &vec![(allocation.offset + 8, 16, 16)]);
    // Dynamic buffers never take part in state tracking.
    assert_eq!(device.buffer_state(constants), Some(ResourceState::UNDEFINED));
    context.finish_frame();
}

#[test]
fn master_blocks_return_after_the_next_submission_completes() {
    let (capture, device) = device();
    let constants = device.create_buffer(&BufferDesc::uniform("constants", 64), None).unwrap();
    let storage = device.create_buffer(&BufferDesc::storage("storage", 64), None).unwrap();
    let mut context = device.create_immediate_context().unwrap();

    let mapped = context.map_buffer(constants).unwrap();
    context.unmap_buffer(mapped);
    context.copy_buffer(constants, 0, StateTransitionMode::None, storage, 0, 64, StateTransitionMode::Transition);
    let frame_fence = context.flush().unwrap();
    assert!(device.dynamic_memory().used_size() > 0);

    context.finish_frame();
    assert_eq!(context.dynamic_allocation(constants), None);
    assert!(device.pending_releases() > 0);

    // Everything recorded so far has completed, but the blocks wait for the submission after it.
    capture.complete_up_to(frame_fence);
    device.purge_release_queue();
    assert!(device.dynamic_memory().used_size() > 0);

    context.transition_resource_states(&[StateTransitionDesc::buffer(storage, ResourceState::COPY_SOURCE)]);
    let next_fence = context.flush().unwrap();
    assert_eq!(next_fence, frame_fence + 1);
    capture.complete_up_to(next_fence);
    device.purge_release_queue();
    assert_eq!(device.dynamic_memory().used_size(), 0);
    assert_eq!(device.pending_releases(), 0);
}

#[test]
fn deferred_contexts_keep_separate_heaps() {
    let (_capture, device) = device();
    let constants = device.create_buffer(&BufferDesc::uniform("constants", 64), None).unwrap();
    let mut immediate = device.create_immediate_context().unwrap();
    let mut deferred = device.create_deferred_context("worker");

    let a = immediate.map_buffer(constants).unwrap();
    let b = deferred.map_buffer(constants).unwrap();
    assert_ne!(a.allocation().offset, b.allocation().offset);
    immediate.unmap_buffer(a);
    deferred.unmap_buffer(b);

    assert_ne!(immediate.dynamic_allocation(constants), deferred.dynamic_allocation(constants));
    deferred.finish_frame();
    assert!(deferred.dynamic_allocation(constants).is_none());
    assert!(immediate.dynamic_allocation(constants).is_some());
    immediate.finish_frame();
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "map the buffer again")]
fn unmapping_after_the_frame_ended_panics() {
    let (_capture, device) = device();
    let constants = device.create_buffer(&BufferDesc::uniform("constants", 64), None).unwrap();
    let mut context = device.create_immediate_context().unwrap();

    let mapped = context.map_buffer(constants).unwrap();
    context.finish_frame();
    context.unmap_buffer(mapped);
}

#[test]
fn one_off_uploads_do_not_return_master_blocks() {
    let (capture, device) = device();
    let constants = device.create_buffer(&BufferDesc::uniform("constants", 64), None).unwrap();
    let storage = device.create_buffer(&BufferDesc::storage("storage", 64), None).unwrap();
    let mut context = device.create_immediate_context().unwrap();

    let mapped = context.map_buffer(constants).unwrap();
    context.unmap_buffer(mapped);
    context.copy_buffer(constants, 0, StateTransitionMode::None, storage, 0, 64, StateTransitionMode::Transition);
    context.flush().unwrap();
    context.finish_frame();

    device.create_buffer(&BufferDesc::storage("upload", 16), Some(&[7u8; 16])).unwrap();
    capture.complete_all();
    device.purge_release_queue();
    assert!(device.dynamic_memory().used_size() > 0);

    context.transition_resource_states(&[StateTransitionDesc::buffer(storage, ResourceState::COPY_SOURCE)]);
    let fence_value = context.flush().unwrap();
    capture.complete_up_to(fence_value);
    device.purge_release_queue();
    assert_eq!(device.dynamic_memory().used_size(), 0);
}
