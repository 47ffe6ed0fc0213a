//! Integration test: surface acquire/release handling and binary-semaphore mode.
//!
//! The headless device tracks pending signals of binary semaphores, so waiting
//! twice on one signal, or signalling one twice, is reported as a violation.

use std::sync::Arc;

use ash::vk;
use fenceline::{
    HeadlessDevice, Queue, QueueFamily, QueueMapping, QueueRole, RenderConfig, RenderError, Renderer, SignalRequest,
    WorkerToken,
};

fn queue(device: &HeadlessDevice, family: u32, flags: vk::QueueFlags) -> Arc<Queue> {
    Arc::new(Queue::new(
        QueueFamily::with_flags(family, flags, family == 0),
        device.create_queue(family),
    ))
}

fn separate_queues(device: &HeadlessDevice) -> QueueMapping {
    QueueMapping::new(
        queue(device, 0, vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
        queue(device, 1, vk::QueueFlags::COMPUTE),
        queue(device, 2, vk::QueueFlags::TRANSFER),
    )
}

fn renderer(device: &Arc<HeadlessDevice>) -> (Renderer, Vec<WorkerToken>) {
    Renderer::new(device.clone(), separate_queues(device), RenderConfig::default()).unwrap()
}

/// Submits one primary command buffer and returns its raw handle.
fn record(renderer: &Renderer, token: &mut WorkerToken, surface: bool) -> vk::CommandBuffer {
    let mut cmd = renderer.request_command_buffer(token, QueueRole::Primary).unwrap();
    if surface {
        cmd.touch_swapchain(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT);
    }
    cmd.end_recording().unwrap();
    let raw = cmd.raw();
    renderer.submit(cmd, SignalRequest::NONE).unwrap();
    raw
}

/// Simulates image acquisition and hands the semaphore to the renderer.
fn acquire(device: &HeadlessDevice, renderer: &Renderer) -> vk::Semaphore {
    let semaphore = renderer.request_semaphore().unwrap();
    let raw = semaphore.raw();
    device.acquire_image(raw);
    renderer.set_acquire_semaphore(semaphore).unwrap();
    raw
}

fn present(device: &HeadlessDevice, renderer: &Renderer) -> vk::Semaphore {
    let release = renderer.take_release_semaphore().unwrap();
    let raw = release.wait_external().unwrap();
    device.present(raw);
    raw
}

// ── Surface batching ─────────────────────────────────────────────────

#[test]
fn surface_work_is_split_into_a_waiting_batch() {
    let device = Arc::new(HeadlessDevice::default());
    let (renderer, mut tokens) = renderer(&device);

    let acquire_raw = acquire(&device, &renderer);
    let offscreen = record(&renderer, &mut tokens[0], false);
    let onscreen = record(&renderer, &mut tokens[0], true);
    let late = record(&renderer, &mut tokens[0], false);
    renderer.flush_frame(QueueRole::Primary).unwrap();

    let submission = device.submissions().last().cloned().unwrap();
    assert_eq!(submission.batches.len(), 2);

    let (early, surface) = (&submission.batches[0], &submission.batches[1]);
    assert_eq!(early.command_buffers, vec![offscreen]);
    assert!(early.waits.is_empty());
    assert!(early.signals.is_empty());

    assert_eq!(surface.command_buffers, vec![onscreen, late]);
    assert_eq!(surface.waits, vec![(acquire_raw, 0)]);

    let release_raw = present(&device, &renderer);
    assert!(surface.signals.contains(&(release_raw, 0)));
    assert_eq!(renderer.queue_stats(QueueRole::Primary).batches, 2);
    assert!(device.violations().is_empty(), "{:?}", device.violations());
}

#[test]
fn surface_work_first_needs_a_single_batch() {
    let device = Arc::new(HeadlessDevice::default());
    let (renderer, mut tokens) = renderer(&device);

    let acquire_raw = acquire(&device, &renderer);
    record(&renderer, &mut tokens[0], true);
    record(&renderer, &mut tokens[0], false);
    renderer.flush_frame(QueueRole::Primary).unwrap();

    let submission = device.submissions().last().cloned().unwrap();
    assert_eq!(submission.batches.len(), 1);
    assert_eq!(submission.batches[0].waits, vec![(acquire_raw, 0)]);

    present(&device, &renderer);
    assert!(device.violations().is_empty(), "{:?}", device.violations());
}

#[test]
fn acquire_waits_for_the_first_surface_batch() {
    let device = Arc::new(HeadlessDevice::default());
    let (renderer, mut tokens) = renderer(&device);

    let acquire_raw = acquire(&device, &renderer);
    record(&renderer, &mut tokens[0], false);
    renderer.flush_frame(QueueRole::Primary).unwrap();
    assert!(device.submissions().last().unwrap().batches[0].waits.is_empty());
    assert!(renderer.take_release_semaphore().is_none());

    record(&renderer, &mut tokens[0], true);
    renderer.flush_frame(QueueRole::Primary).unwrap();
    assert_eq!(device.submissions().last().unwrap().batches[0].waits, vec![(acquire_raw, 0)]);

    present(&device, &renderer);
    assert!(device.violations().is_empty(), "{:?}", device.violations());
}

#[test]
fn presenting_many_frames_recycles_semaphores() {
    let device = Arc::new(HeadlessDevice::default());
    let (renderer, mut tokens) = renderer(&device);

    let mut live = Vec::new();
    for _ in 0..12 {
        renderer.begin_frame().unwrap();
        acquire(&device, &renderer);
        record(&renderer, &mut tokens[0], true);
        renderer.flush_frame(QueueRole::Primary).unwrap();
        present(&device, &renderer);
        live.push(device.live_semaphores());
    }

    // Once the ring has turned over, the acquire and release semaphores come from the pool.
    assert_eq!(live[6..].iter().min(), live[6..].iter().max());
    assert!(device.violations().is_empty(), "{:?}", device.violations());
}

// ── Binary semaphores ────────────────────────────────────────────────

#[test]
fn binary_semaphore_signal_is_waited_once() {
    let device = Arc::new(HeadlessDevice::default());
    let (renderer, mut tokens) = renderer(&device);

    let semaphore = renderer.request_semaphore().unwrap();
    let err = renderer
        .add_wait_semaphore(QueueRole::Primary, semaphore.clone(), vk::PipelineStageFlags2::ALL_COMMANDS, false)
        .unwrap_err();
    assert_eq!(err.downcast_ref::<RenderError>(), Some(&RenderError::SemaphoreNotSignalled));

    device.acquire_image(semaphore.raw());
    semaphore.signal_external().unwrap();
    renderer
        .add_wait_semaphore(QueueRole::Primary, semaphore.clone(), vk::PipelineStageFlags2::ALL_COMMANDS, false)
        .unwrap();
    let err = renderer
        .add_wait_semaphore(QueueRole::AsyncCompute, semaphore, vk::PipelineStageFlags2::ALL_COMMANDS, false)
        .unwrap_err();
    assert_eq!(err.downcast_ref::<RenderError>(), Some(&RenderError::SemaphoreAlreadyConsumed));

    record(&renderer, &mut tokens[0], false);
    renderer.end_frame().unwrap();
    assert!(device.violations().is_empty(), "{:?}", device.violations());
}

#[test]
fn legacy_mode_uses_binary_fences() {
    let device = Arc::new(HeadlessDevice::legacy());
    let (renderer, mut tokens) = renderer(&device);
    assert!(!renderer.uses_timeline());

    let mut cmd = renderer.request_command_buffer(&mut tokens[0], QueueRole::Primary).unwrap();
    cmd.end_recording().unwrap();
    let fence = renderer.submit(cmd, SignalRequest::fence()).unwrap().fence.unwrap();

    assert_eq!(fence.timeline_value(), None);
    fence.wait().unwrap();
    assert!(fence.is_signalled().unwrap());
    assert_ne!(device.submissions().last().unwrap().fence, vk::Fence::null());
    assert_eq!(renderer.timeline_value(QueueRole::Primary), 0);
}

#[test]
fn legacy_mode_caps_signal_semaphores() {
    let device = Arc::new(HeadlessDevice::legacy());
    let (renderer, mut tokens) = renderer(&device);

    let mut cmd = renderer.request_command_buffer(&mut tokens[0], QueueRole::AsyncCompute).unwrap();
    cmd.end_recording().unwrap();
    let err = renderer.submit(cmd, SignalRequest::semaphores(5)).unwrap_err();
    assert_eq!(
        err.downcast_ref::<RenderError>(),
        Some(&RenderError::TooManySignalSemaphores {
            requested: 5,
            capacity: 4,
        })
    );

    // The command buffer stays queued and goes out with the next flush.
    let signals = renderer
        .submit_empty(QueueRole::AsyncCompute, SignalRequest::semaphores(4))
        .unwrap();
    assert_eq!(signals.semaphores.len(), 4);
    assert!(signals.semaphores.iter().all(|semaphore| semaphore.is_pending()));
    assert_eq!(renderer.queue_stats(QueueRole::AsyncCompute).command_buffers, 1);

    for semaphore in signals.semaphores {
        renderer
            .add_wait_semaphore(QueueRole::Primary, semaphore, vk::PipelineStageFlags2::ALL_COMMANDS, false)
            .unwrap();
    }
    let fence = renderer
        .submit_empty(QueueRole::Primary, SignalRequest::fence())
        .unwrap()
        .fence
        .unwrap();
    fence.wait().unwrap();
    assert_eq!(device.submissions().last().unwrap().batches[0].waits.len(), 4);
    assert!(device.violations().is_empty(), "{:?}", device.violations());
}

#[test]
fn legacy_signal_cap_counts_the_release_semaphore() {
    let device = Arc::new(HeadlessDevice::legacy());
    let (renderer, mut tokens) = renderer(&device);

    acquire(&device, &renderer);
    record(&renderer, &mut tokens[0], true);
    let err = renderer
        .submit_empty(QueueRole::Primary, SignalRequest::semaphores(4))
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<RenderError>(),
        Some(&RenderError::TooManySignalSemaphores {
            requested: 5,
            capacity: 4,
        })
    );

    // Three caller semaphores plus the release semaphore fit.
    let signals = renderer
        .submit_empty(QueueRole::Primary, SignalRequest::semaphores(3))
        .unwrap();
    let submission = device.submissions().last().cloned().unwrap();
    assert_eq!(submission.batches.len(), 1);
    assert_eq!(submission.batches[0].signals.len(), 4);
    present(&device, &renderer);

    for semaphore in signals.semaphores {
        renderer
            .add_wait_semaphore(QueueRole::AsyncCompute, semaphore, vk::PipelineStageFlags2::ALL_COMMANDS, false)
            .unwrap();
    }
    renderer
        .submit_empty(QueueRole::AsyncCompute, SignalRequest::fence())
        .unwrap()
        .fence
        .unwrap()
        .wait()
        .unwrap();
    assert!(device.violations().is_empty(), "{:?}", device.violations());
}

#[test]
fn legacy_staging_reaches_a_steady_object_count() {
    let device = Arc::new(HeadlessDevice::legacy());
    let (renderer, mut tokens) = renderer(&device);

    let mut frame = || {
        let mut upload = renderer
            .request_command_buffer(&mut tokens[0], QueueRole::AsyncTransfer)
            .unwrap();
        upload.end_recording().unwrap();
        renderer
            .submit_staging(upload, vk::PipelineStageFlags2::ALL_COMMANDS, false)
            .unwrap();
        for role in [QueueRole::Primary, QueueRole::AsyncCompute] {
            let mut cmd = renderer.request_command_buffer(&mut tokens[0], role).unwrap();
            cmd.end_recording().unwrap();
            renderer.submit(cmd, SignalRequest::NONE).unwrap();
        }
        renderer.begin_frame().unwrap();
        (device.live_semaphores(), device.live_fences())
    };

    for _ in 0..8 {
        frame();
    }
    let warm = frame();
    for _ in 0..8 {
        assert_eq!(frame(), warm);
    }
    assert!(renderer.free_semaphore_count() > 0);
    assert!(device.violations().is_empty(), "{:?}", device.violations());
}
