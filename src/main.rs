use std::sync::Arc;
use std::thread;

use ash::vk;
use ash::vk::Handle;
use color_eyre::Result;
use color_eyre::eyre::eyre;
use fenceline::{
    HeadlessDevice, ProgramLayout, ProgramStages, Queue, QueueFamily, QueueMapping, QueueRole, RenderConfig,
    RenderResourceType, Renderer, ResourceBinding, ShaderStageLayout, SignalRequest, WorkerToken,
};

const FRAMES: u64 = 6;
const WORKERS: usize = 3;

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let device = Arc::new(HeadlessDevice::default());
    let graphics = Arc::new(Queue::new(
        QueueFamily::with_flags(0, vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, true),
        device.create_queue(0),
    ));
    let transfer = Arc::new(Queue::new(
        QueueFamily::with_flags(1, vk::QueueFlags::TRANSFER, false),
        device.create_queue(1),
    ));
    let queues = QueueMapping::new(graphics.clone(), graphics, transfer);

    let config = RenderConfig {
        worker_threads: WORKERS,
        ..RenderConfig::default()
    };
    let (renderer, mut tokens) = Renderer::new(device.clone(), queues, config)?;

    let program = renderer.request_program_layout(&ProgramStages::Graphics {
        vertex: ShaderStageLayout::new(vk::ShaderStageFlags::VERTEX).add_binding(
            0,
            0,
            RenderResourceType::UniformBuffer,
            1,
        ),
        fragment: ShaderStageLayout::new(vk::ShaderStageFlags::FRAGMENT)
            .add_binding(0, 0, RenderResourceType::UniformBuffer, 1)
            .add_binding(1, 0, RenderResourceType::SampledImage, 1),
    })?;

    for frame in 0..FRAMES {
        renderer.begin_frame()?;

        let acquire = renderer.request_semaphore()?;
        device.acquire_image(acquire.raw());
        renderer.set_acquire_semaphore(acquire)?;

        // Uploads for this frame go out on the transfer queue.
        let mut upload = renderer.request_command_buffer(&mut tokens[0], QueueRole::AsyncTransfer)?;
        upload.end_recording()?;
        renderer.submit_staging(upload, vk::PipelineStageFlags2::VERTEX_SHADER, false)?;

        thread::scope(|scope| {
            let handles: Vec<_> = tokens
                .iter_mut()
                .map(|token| {
                    let renderer = &renderer;
                    let program = &program;
                    scope.spawn(move || record(renderer, token, program, frame))
                })
                .collect();

            handles
                .into_iter()
                .map(|handle| handle.join().map_err(|_| eyre!("worker thread panicked"))?)
                .collect::<Result<Vec<_>>>()
        })?;

        renderer.flush_frame(QueueRole::Primary)?;
        if let Some(release) = renderer.take_release_semaphore() {
            device.present(release.wait_external()?);
        }
    }

    let signals = renderer.submit_empty(QueueRole::Primary, SignalRequest::fence())?;
    if let Some(fence) = signals.fence {
        fence.wait()?;
    }
    renderer.wait_idle()?;

    for role in QueueRole::ALL {
        log::info!("{role:?}: {:?}", renderer.queue_stats(role));
    }
    for token in tokens.iter_mut() {
        let stats = program.set_allocator(0)?.stats(token)?;
        log::info!("Worker {} descriptor cache: {stats:?}", token.index());
    }

    let violations = device.violations();
    if !violations.is_empty() {
        return Err(eyre!("device reported {} violations: {violations:?}", violations.len()));
    }
    log::info!("Rendered {FRAMES} frames without device violations");
    Ok(())
}

fn record(renderer: &Renderer, token: &mut WorkerToken, program: &Arc<ProgramLayout>, frame: u64) -> Result<()> {
    let worker = token.index() as u64;
    let mut cmd = renderer.request_command_buffer(token, QueueRole::Primary)?;
    cmd.set_program_layout(program.clone());

    // Per-frame uniforms change every frame, the material texture never does.
    let uniforms = 1000 + frame % 2;
    *cmd.binding_slot(0, 0, 0)? = ResourceBinding::buffer(uniforms, vk::Buffer::from_raw(uniforms), worker * 256, 256);
    *cmd.binding_slot(1, 0, 0)? = ResourceBinding::image(
        7,
        vk::ImageView::from_raw(7),
        RenderResourceType::SampledImage.image_layout(),
    );

    for set in 0..2 {
        let flushed = renderer.flush_binding_table(token, &mut cmd, set)?;
        log::trace!("Worker {worker} set {set}: {:#x} rewritten={}", flushed.set.as_raw(), flushed.rewritten);
    }

    if worker == 0 {
        cmd.touch_swapchain(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT);
    }
    cmd.end_recording()?;
    renderer.submit(cmd, SignalRequest::NONE)?;
    Ok(())
}
