mod common;

use common::{color_target, commands_after, device, image_barriers};
use meridian_rhi::backend::capture::Command;
use meridian_rhi::{
    vk, BufferDesc, CommandList, ObjectId, ResourceState, StateTransitionDesc, StateTransitionMode, TransitionResource,
};

#[test]
fn final_states_commit_when_the_list_executes() {
    let (_capture, device) = device();
    let (texture, view) = color_target(&device, "target", 64);
    let mut immediate = device.create_immediate_context().unwrap();
    let mut deferred = device.create_deferred_context("worker");

    deferred.transition_resource_states(&[
        StateTransitionDesc::texture(texture, ResourceState::RENDER_TARGET).with_old_state(ResourceState::UNDEFINED),
    ]);
    assert!(deferred.set_render_targets(&[view], None, StateTransitionMode::Verify));
    deferred.clear_render_target(view, vk::ClearColorValue { float32: [0.0; 4] }, StateTransitionMode::Verify);
    deferred.transition_resource_states(&[StateTransitionDesc::texture(texture, ResourceState::SHADER_RESOURCE)]);
    let list = deferred.finish_command_list().unwrap();

    assert_eq!(device.texture_state(texture), Some(ResourceState::UNDEFINED));
    assert_eq!(
        list.state_updates().last().map(|u| (u.resource, u.state)),
        Some((TransitionResource::Texture(texture), ResourceState::SHADER_RESOURCE))
    );

    immediate.execute_command_list(list).unwrap();
    assert_eq!(device.texture_state(texture), Some(ResourceState::SHADER_RESOURCE));
    deferred.finish_frame();
    immediate.finish_frame();
}

#[test]
fn lists_execute_in_submission_order() {
    let (_capture, device) = device();
    let (texture, _) = color_target(&device, "shared", 32);
    let mut immediate = device.create_immediate_context().unwrap();
    let mut first = device.create_deferred_context("first");
    let mut second = device.create_deferred_context("second");

    first.transition_resource_states(&[
        StateTransitionDesc::texture(texture, ResourceState::COPY_DEST).with_old_state(ResourceState::UNDEFINED),
    ]);
    second.transition_resource_states(&[
        StateTransitionDesc::texture(texture, ResourceState::SHADER_RESOURCE).with_old_state(ResourceState::COPY_DEST),
    ]);
    // Recorded in the opposite order of execution.
    let second_list = second.finish_command_list().unwrap();
    let first_list = first.finish_command_list().unwrap();

    immediate.execute_command_list(first_list).unwrap();
    assert_eq!(device.texture_state(texture), Some(ResourceState::COPY_DEST));
    immediate.execute_command_list(second_list).unwrap();
    assert_eq!(device.texture_state(texture), Some(ResourceState::SHADER_RESOURCE));
}

#[test]
fn deferred_context_refuses_unknown_old_states() {
    let (capture, device) = device();
    let (texture, _) = color_target(&device, "target", 16);
    let image = device.texture_handle(texture).unwrap();
    let mut immediate = device.create_immediate_context().unwrap();
    let mut deferred = device.create_deferred_context("worker");
    let before = capture.submissions().len();

    // The device knows the texture is UNDEFINED, but a deferred context can not rely on that.
    deferred.transition_resource_states(&[StateTransitionDesc::texture(texture, ResourceState::SHADER_RESOURCE)]);
    let list = deferred.finish_command_list().unwrap();
    assert!(list.state_updates().is_empty());

    immediate.execute_command_list(list).unwrap();
    assert!(image_barriers(&commands_after(&capture, before), image).is_empty());
    assert_eq!(device.texture_state(texture), Some(ResourceState::UNDEFINED));
}

#[test]
fn finishing_a_list_forgets_local_states() {
    let (_capture, device) = device();
    let buffer = device.create_buffer(&BufferDesc::storage("data", 64), None).unwrap();
    let mut deferred = device.create_deferred_context("worker");

    deferred.transition_resource_states(&[
        StateTransitionDesc::buffer(buffer, ResourceState::UNORDERED_ACCESS).with_old_state(ResourceState::UNDEFINED),
    ]);
    assert_eq!(
        deferred.known_state(ObjectId::Buffer(buffer)),
        Some(ResourceState::UNORDERED_ACCESS)
    );
    let list = deferred.finish_command_list().unwrap();
    assert_eq!(list.state_updates().len(), 1);
    assert_eq!(deferred.known_state(ObjectId::Buffer(buffer)), None);
    assert!(deferred.command_buffer_state().is_none());
}

#[test]
fn transitions_without_update_flag_are_still_recorded() {
    let (_capture, device) = device();
    let buffer = device.create_buffer(&BufferDesc::storage("data", 64), None).unwrap();
    let mut deferred = device.create_deferred_context("worker");

    deferred.transition_resource_states(&[StateTransitionDesc::buffer(buffer, ResourceState::COPY_DEST)
        .with_old_state(ResourceState::UNDEFINED)
        .with_update_state(false)]);
    let list = deferred.finish_command_list().unwrap();
    assert_eq!(list.state_updates().len(), 1);
    assert_eq!(list.state_updates()[0].state, ResourceState::COPY_DEST);
}

#[test]
fn outstanding_immediate_commands_are_submitted_first() {
    let (capture, device) = device();
    let (texture, view) = color_target(&device, "target", 32);
    let mut immediate = device.create_immediate_context().unwrap();
    let mut deferred = device.create_deferred_context("worker");

    immediate.clear_render_target(view, vk::ClearColorValue { float32: [1.0; 4] }, StateTransitionMode::Transition);
    deferred.transition_resource_states(&[
        StateTransitionDesc::texture(texture, ResourceState::SHADER_RESOURCE).with_old_state(ResourceState::COPY_DEST),
    ]);
    let list = deferred.finish_command_list().unwrap();
    let fence_value = immediate.execute_command_list(list).unwrap();

    let submission = capture.submissions().pop().unwrap();
    assert_eq!(submission.fence_value, fence_value);
    assert_eq!(submission.command_buffers.len(), 2);
    assert!(submission.command_buffers[0]
        .commands
        .iter()
        .any(|c| matches!(c, Command::ClearColorImage { .. })));
    assert_eq!(submission.command_buffers[1].name, "worker");
    assert_eq!(device.texture_state(texture), Some(ResourceState::SHADER_RESOURCE));
}

#[test]
fn workers_record_in_parallel() {
    const WORKERS: usize = 4;
    let (capture, device) = device();
    let targets: Vec<_> = (0..WORKERS)
        .map(|i| color_target(&device, &format!("worker {}", i), 32))
        .collect();
    let mut immediate = device.create_immediate_context().unwrap();
    let before = capture.submissions().len();

    let mut lists: Vec<(usize, CommandList)> = std::thread::scope(|scope| {
        let handles: Vec<_> = targets
            .iter()
            .enumerate()
            .map(|(index, &(texture, view))| {
                let mut context = device.create_deferred_context(&format!("worker {}", index));
                scope.spawn(move || {
                    context.transition_resource_states(&[StateTransitionDesc::texture(
                        texture,
                        ResourceState::COPY_DEST,
                    )
                    .with_old_state(ResourceState::UNDEFINED)]);
                    context.clear_render_target(
                        view,
                        vk::ClearColorValue {
                            float32: [index as f32; 4],
                        },
                        StateTransitionMode::Verify,
                    );
                    let list = context.finish_command_list().unwrap();
                    context.finish_frame();
                    (index, list)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    lists.sort_by_key(|(index, _)| *index);
    for (_, list) in lists {
        immediate.execute_command_list(list).unwrap();
    }
    assert_eq!(capture.submissions().len(), before + WORKERS);
    let clears = commands_after(&capture, before)
        .iter()
        .filter(|c| matches!(c, Command::ClearColorImage { .. }))
        .count();
    assert_eq!(clears, WORKERS);
    for (texture, _) in targets {
        assert_eq!(device.texture_state(texture), Some(ResourceState::COPY_DEST));
    }
}
