//! Records frames from several worker threads through deferred contexts and executes them on the
//! immediate context, on a real GPU or the capture backend.

use std::sync::mpsc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use anyhow::{anyhow, Context};
use clap::Parser;
use meridian_core::cli::{BackendKind, EngineArgs};
use meridian_rhi::{
    vk, BufferDesc, BufferId, CaptureBackend, CommandList, DeferredContext, DeviceConfig, GpuBackend, ImmediateContext,
    Query, QueryData, QueryType, RenderDevice, ResourceState, StateTransitionDesc, StateTransitionMode, TextureDesc,
    TextureId, TextureViewDesc, TextureViewId, VulkanBackend, Fence,
};

#[derive(Parser, Debug)]
#[command(name = "meridian-sandbox", about = "Deferred recording sandbox")]
struct Args {
    #[command(flatten)]
    engine: EngineArgs,

    /// Worker threads, one deferred context each
    #[arg(short = 'w', long, default_value_t = 4)]
    workers: usize,

    /// Frames to record
    #[arg(short = 'f', long, default_value_t = 8)]
    frames: u64,

    /// Size of each worker's render target
    #[arg(long, default_value_t = 256)]
    size: u32,
}

/// Resources one worker records into.
struct WorkerTarget {
    texture: TextureId,
    view: TextureViewId,
    constants: BufferId,
    storage: BufferId,
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct FrameConstants {
    frame: u64,
    worker: u64,
    tint: [f32; 4],
}

fn create_backend(kind: BackendKind) -> anyhow::Result<(Arc<dyn GpuBackend>, Option<CaptureBackend>)> {
    match kind {
        BackendKind::Vulkan => {
            let backend = VulkanBackend::new("meridian-sandbox").context("failed to create the Vulkan backend")?;
            Ok((Arc::new(backend), None))
        }
        BackendKind::Capture => {
            let capture = CaptureBackend::new();
            Ok((Arc::new(capture.clone()), Some(capture)))
        }
    }
}

fn create_worker_target(device: &RenderDevice, index: usize, size: u32) -> anyhow::Result<WorkerTarget> {
    let texture = device.create_texture(
        &TextureDesc::new_color_attachment(size, size, vk::Format::R8G8B8A8_UNORM).with_name(format!("worker {} target", index)),
    )?;
    let view = device.create_texture_view(texture, &TextureViewDesc::render_target())?;
    let constants = device.create_buffer(
        &BufferDesc::uniform(&format!("worker {} constants", index), size_of::<FrameConstants>() as vk::DeviceSize)
            .with_additional_bind_flags(vk::BufferUsageFlags::TRANSFER_SRC),
        None,
    )?;
    let storage = device.create_buffer(
        &BufferDesc::storage(&format!("worker {} history", index), size_of::<FrameConstants>() as vk::DeviceSize),
        None,
    )?;
    Ok(WorkerTarget {
        texture,
        view,
        constants,
        storage,
    })
}

/// One frame of a worker: clear its target, then stage its constants into the history buffer.
#[profiling::function]
fn record_worker_frame(
    context: &mut DeferredContext,
    target: &WorkerTarget,
    index: usize,
    frame: u64,
) -> anyhow::Result<CommandList> {
    // Deferred contexts only know what they establish, so old states are spelled out.
    let (texture_old, storage_old) = if frame == 0 {
        (ResourceState::UNDEFINED, ResourceState::UNDEFINED)
    } else {
        (ResourceState::SHADER_RESOURCE, ResourceState::COPY_DEST)
    };
    context.transition_resource_states(&[
        StateTransitionDesc::texture(target.texture, ResourceState::RENDER_TARGET).with_old_state(texture_old),
        StateTransitionDesc::buffer(target.storage, ResourceState::COPY_DEST).with_old_state(storage_old),
    ]);

    let shade = (frame % 16) as f32 / 15.0;
    let tint = [shade, index as f32 * 0.25, 1.0 - shade, 1.0];
    if !context.set_render_targets(&[target.view], None, StateTransitionMode::Verify) {
        return Err(anyhow!("worker {} could not bind its render target", index));
    }
    context.clear_render_target(target.view, vk::ClearColorValue { float32: tint }, StateTransitionMode::Verify);

    let mut mapped = context
        .map_buffer(target.constants)
        .ok_or_else(|| anyhow!("worker {} could not map its constants", index))?;
    mapped.copy_from_slice(bytemuck::bytes_of(&FrameConstants {
        frame,
        worker: index as u64,
        tint,
    }));
    context.unmap_buffer(mapped);
    context.copy_buffer(
        target.constants,
        0,
        StateTransitionMode::None,
        target.storage,
        0,
        size_of::<FrameConstants>() as vk::DeviceSize,
        StateTransitionMode::Verify,
    );

    context.transition_resource_states(&[StateTransitionDesc::texture(target.texture, ResourceState::SHADER_RESOURCE)]);
    Ok(context.finish_command_list()?)
}

struct Composite {
    texture: TextureId,
    target_view: TextureViewId,
    sampled_view: TextureViewId,
}

fn create_composite(device: &RenderDevice, size: u32) -> anyhow::Result<Composite> {
    let texture = device.create_texture(
        &TextureDesc::new_color_attachment(size, size, vk::Format::R8G8B8A8_UNORM)
            .with_name("composite")
            .with_full_mip_chain(),
    )?;
    let target_view = device.create_texture_view(texture, &TextureViewDesc::render_target())?;
    let sampled_view = device.create_texture_view(texture, &TextureViewDesc::shader_resource().with_mip_generation())?;
    Ok(Composite {
        texture,
        target_view,
        sampled_view,
    })
}

/// Work of the immediate context after the command lists of a frame have executed.
#[profiling::function]
fn record_composite(context: &mut ImmediateContext, composite: &Composite, frame: u64) {
    let shade = (frame % 8) as f32 / 7.0;
    context.clear_render_target(
        composite.target_view,
        vk::ClearColorValue {
            float32: [shade, shade, shade, 1.0],
        },
        StateTransitionMode::Transition,
    );
    if !context.generate_mips(composite.sampled_view) {
        log::warn!("Mip generation of the composite failed in frame {}", frame);
    }
    log::trace!(
        "Composite is in {:?} after frame {}",
        context.device().texture_state(composite.texture),
        frame
    );
}

/// Execute the command lists of one frame and the composite pass. Returns the submitted fence value.
fn run_frame(
    immediate: &mut ImmediateContext,
    receiver: &mpsc::Receiver<(usize, anyhow::Result<CommandList>)>,
    workers: usize,
    composite: &Composite,
    frame_time: &mut Query,
    frame_fence: &Arc<Fence>,
    frame: u64,
) -> anyhow::Result<u64> {
    immediate.begin_query(frame_time);

    let mut lists = Vec::with_capacity(workers);
    for _ in 0..workers {
        let (index, list) = receiver.recv().context("a worker stopped early")?;
        lists.push((index, list?));
    }
    // Executed in worker order so state updates commit deterministically.
    lists.sort_by_key(|(index, _)| *index);
    for (_, list) in lists {
        immediate.execute_command_list(list)?;
    }

    record_composite(immediate, composite, frame);
    immediate.end_query(frame_time);
    immediate.signal_fence(frame_fence, frame + 1);
    Ok(immediate.flush()?)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    meridian_core::log::initialize(args.engine.log_level.into())?;

    let _puffin_server = if args.engine.profile {
        profiling::puffin::set_scopes_on(true);
        let server_addr = format!("127.0.0.1:{}", puffin_http::DEFAULT_PORT);
        log::info!("Serving profiling data on {}", server_addr);
        Some(puffin_http::Server::new(&server_addr)?)
    } else {
        None
    };

    let (backend, capture) = create_backend(args.engine.backend)?;
    let device = RenderDevice::new(backend, DeviceConfig::default())?;
    let mut immediate = device.create_immediate_context()?;

    let workers = args.workers.max(1);
    let targets = (0..workers)
        .map(|index| create_worker_target(&device, index, args.size))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let composite = create_composite(&device, args.size)?;
    let frame_fence = device.create_fence("frame fence");
    let mut frame_time = device.create_query("frame time", QueryType::Duration);

    let (sender, receiver) = mpsc::channel::<(usize, anyhow::Result<CommandList>)>();
    // Workers plus the main thread: lists of a frame have executed before deferred heaps are recycled.
    let executed = Barrier::new(workers + 1);
    let stop = AtomicBool::new(false);

    std::thread::scope(|scope| -> anyhow::Result<()> {
        for (index, target) in targets.iter().enumerate() {
            let sender = sender.clone();
            let executed = &executed;
            let stop = &stop;
            let mut context = device.create_deferred_context(&format!("worker {}", index));
            scope.spawn(move || {
                profiling::register_thread!("sandbox worker");
                for frame in 0..args.frames {
                    let list = record_worker_frame(&mut context, target, index, frame);
                    if sender.send((index, list)).is_err() {
                        return;
                    }
                    executed.wait();
                    context.finish_frame();
                    if stop.load(Ordering::Acquire) {
                        return;
                    }
                }
            });
        }
        drop(sender);

        for frame in 0..args.frames {
            profiling::scope!("frame", &frame.to_string());
            let result = run_frame(&mut immediate, &receiver, workers, &composite, &mut frame_time, &frame_fence, frame)
                .and_then(|fence_value| {
                    if let Some(capture) = capture.as_ref() {
                        capture.complete_up_to(fence_value);
                    }
                    // Keep at most two frames in flight.
                    if frame >= 2 {
                        immediate.wait_for_fence(&frame_fence, frame - 1, false)?;
                    }
                    Ok(())
                });
            if result.is_err() {
                stop.store(true, Ordering::Release);
            }
            executed.wait();
            result?;

            immediate.finish_frame();
            profiling::finish_frame!();

            match immediate.get_query_data(&frame_time) {
                Some(QueryData::Duration { duration, frequency }) if frequency > 0 => {
                    log::info!(
                        "Frame {}: {:.3} ms on the GPU",
                        frame,
                        duration as f64 * 1000.0 / frequency as f64
                    );
                }
                _ => log::debug!("Frame {}: GPU time is not available yet", frame),
            }
        }
        Ok(())
    })?;

    immediate.wait_for_idle()?;
    immediate.finish_frame();

    let stats = device.object_cache().stats();
    log::info!(
        "Recorded {} frames on {} workers; {} framebuffers cached, vertex binding cache {:?}, {} releases pending",
        args.frames,
        workers,
        device.framebuffer_count(),
        stats,
        device.pending_releases()
    );
    if let Some(capture) = capture.as_ref() {
        log::info!("Capture backend received {} submissions", capture.submissions().len());
    }
    Ok(())
}
