pub mod config;
pub mod contexts;
pub mod error;
pub mod hal;
pub mod internals;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use ash::vk;
use color_eyre::Result;
use parking_lot::RwLock;

use crate::renderer::config::RenderConfig;
use crate::renderer::contexts::device_ctx::RenderDeviceContext;
use crate::renderer::contexts::device_ctx::command_encoder::CommandBuffer;
use crate::renderer::contexts::device_ctx::queue::{QueueMapping, QueueRole};
use crate::renderer::contexts::device_ctx::submission::{QueueStats, QueueSubmission, SignalRequest, SubmitSignals};
use crate::renderer::contexts::device_ctx::sync::SemaphoreHandle;
use crate::renderer::contexts::frame_ctx::RenderFrameContext;
use crate::renderer::contexts::frame_ctx::frame::FrameQueue;
use crate::renderer::contexts::resource_ctx::RenderResourceContext;
use crate::renderer::contexts::resource_ctx::descriptor_set_cache::FlushedSet;
use crate::renderer::contexts::resource_ctx::program_layout::{ProgramLayout, ProgramStages};
use crate::renderer::error::RenderError;
use crate::renderer::hal::RenderHal;
use crate::renderer::internals::per_thread::{OwnerId, WorkerToken};

/// Stages a compute queue can wait in.
const COMPUTE_QUEUE_STAGES: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::from_raw(
    vk::PipelineStageFlags2::COMPUTE_SHADER.as_raw()
        | vk::PipelineStageFlags2::DRAW_INDIRECT.as_raw()
        | vk::PipelineStageFlags2::TRANSFER.as_raw(),
);

/// Entry point for recording and submitting work.
///
/// Recording and submission take `&self` and may run on any number of worker
/// threads, each holding its own [`WorkerToken`]. Frame boundaries take the
/// frame ring exclusively.
pub struct Renderer {
    // Field order is drop order: frames and resources release into the device context.
    frm: RwLock<RenderFrameContext>,
    res: RenderResourceContext,
    dev: RenderDeviceContext,
    owner: OwnerId,
    config: RenderConfig,
}

impl Renderer {
    /// Creates the renderer and one worker token per configured worker thread.
    pub fn new(
        hal: Arc<dyn RenderHal>,
        queues: QueueMapping,
        config: RenderConfig,
    ) -> Result<(Self, Vec<WorkerToken>)> {
        config.validate()?;
        queues.validate()?;

        let owner = OwnerId::next();
        let dev = RenderDeviceContext::new(hal.clone(), queues, &config)?;
        let res = RenderResourceContext::new(hal, owner, &config);
        let frm = RenderFrameContext::new(&dev, owner, &config)?;
        log::info!(
            "Renderer created with {} frames in flight and {} workers",
            config.frames_in_flight,
            config.worker_threads
        );

        let renderer = Self {
            frm: RwLock::new(frm),
            res,
            dev,
            owner,
            config: config.clone(),
        };
        Ok((renderer, WorkerToken::issue(owner, config.worker_threads)))
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    pub fn uses_timeline(&self) -> bool {
        self.dev.uses_timeline()
    }

    pub fn frame_serial(&self) -> u64 {
        self.frm.read().serial()
    }

    /// Hands out a command buffer in the recording state from this worker's pool.
    pub fn request_command_buffer(&self, token: &mut WorkerToken, role: QueueRole) -> Result<CommandBuffer> {
        let frm = self.frm.read();
        let frame = frm.current();
        let thread_index = token.index();

        let raw = frame.command_pools(role).get_mut(token)?.request()?;
        frame.outstanding().fetch_add(1, Ordering::AcqRel);

        Ok(CommandBuffer::new(
            raw,
            role,
            thread_index,
            frm.serial(),
            frame.outstanding().clone(),
            self.dev.hal.clone(),
        ))
    }

    /// Queues a finished command buffer on its role.
    ///
    /// Requesting any signal flushes the role immediately so the signal can be returned.
    pub fn submit(&self, command_buffer: CommandBuffer, signals: SignalRequest) -> Result<SubmitSignals> {
        if command_buffer.is_recording() {
            return Err(RenderError::StillRecording.into());
        }

        let frm = self.frm.read();
        if command_buffer.frame_serial() != frm.serial() {
            return Err(RenderError::StaleCommandBuffer {
                recorded: command_buffer.frame_serial(),
                current: frm.serial(),
            }
            .into());
        }

        let role = command_buffer.role();
        let mut queue = frm.current().queue(role).lock();
        queue.pending.push(QueueSubmission {
            raw: command_buffer.raw(),
            swapchain_stages: command_buffer.swapchain_stages(),
        });

        if signals.is_empty() {
            return Ok(SubmitSignals::default());
        }
        self.flush_queue(role, &mut queue, signals)
    }

    /// Flushes `role`, submitting an empty batch if nothing is pending, so the requested signals exist.
    pub fn submit_empty(&self, role: QueueRole, signals: SignalRequest) -> Result<SubmitSignals> {
        let frm = self.frm.read();
        let mut queue = frm.current().queue(role).lock();
        self.flush_queue(role, &mut queue, signals)
    }

    /// Submits transfer or compute work whose results the other roles consume.
    ///
    /// Each consuming role on a different physical queue gets a semaphore wait in `dst_stages`
    /// on its next submission. With `flush`, work already pending on those roles is submitted
    /// first so it does not wait.
    pub fn submit_staging(
        &self,
        command_buffer: CommandBuffer,
        dst_stages: vk::PipelineStageFlags2,
        flush: bool,
    ) -> Result<()> {
        let role = command_buffer.role();
        let consumers: Vec<QueueRole> = [QueueRole::Primary, QueueRole::AsyncCompute]
            .into_iter()
            .filter(|&consumer| consumer != role && !self.dev.queues.aliases(role, consumer))
            .collect();

        if consumers.is_empty() {
            self.submit(command_buffer, SignalRequest::NONE)?;
            return Ok(());
        }

        let signals = self.submit(command_buffer, SignalRequest::semaphores(consumers.len()))?;
        for (consumer, semaphore) in consumers.into_iter().zip(signals.semaphores) {
            let stages = match consumer {
                QueueRole::AsyncCompute => {
                    let stages = dst_stages & COMPUTE_QUEUE_STAGES;
                    if stages.is_empty() {
                        vk::PipelineStageFlags2::ALL_COMMANDS
                    } else {
                        stages
                    }
                }
                _ => dst_stages,
            };
            self.add_wait_semaphore(consumer, semaphore, stages, flush)?;
        }
        Ok(())
    }

    /// Makes the next submission on `role` wait for `semaphore` in `stages`.
    ///
    /// A binary semaphore can be waited on only once. With `flush`, work already
    /// pending on `role` is submitted first so it does not wait.
    pub fn add_wait_semaphore(
        &self,
        role: QueueRole,
        semaphore: SemaphoreHandle,
        stages: vk::PipelineStageFlags2,
        flush: bool,
    ) -> Result<()> {
        if flush {
            self.flush_frame(role)?;
        }
        self.dev.scheduler(role).add_wait(semaphore, stages)?;
        Ok(())
    }

    /// Submits everything pending on `role` now.
    pub fn flush_frame(&self, role: QueueRole) -> Result<()> {
        let frm = self.frm.read();
        let mut queue = frm.current().queue(role).lock();
        self.flush_queue(role, &mut queue, SignalRequest::NONE)?;
        Ok(())
    }

    /// Submits all pending work and closes the current frame.
    ///
    /// Fails if a command buffer from this frame is still recording.
    pub fn end_frame(&self) -> Result<()> {
        let frm = self.frm.write();
        self.end_frame_locked(&frm)
    }

    /// Ends the current frame and moves to the next one in the ring.
    ///
    /// Blocks until the work that last used the next frame has completed, then resets its pools.
    pub fn begin_frame(&self) -> Result<()> {
        let mut frm = self.frm.write();
        self.end_frame_locked(&frm)?;

        frm.advance();
        frm.current_mut().retire(&self.dev.sync)?;
        log::trace!("Frame {} began in slot {}", frm.serial(), frm.current_index());
        Ok(())
    }

    /// Submits all pending work and waits for every queue role to drain.
    ///
    /// Every frame is retired afterwards; command buffers from before the call become stale.
    pub fn wait_idle(&self) -> Result<()> {
        let mut frm = self.frm.write();
        self.end_frame_locked(&frm)?;

        for scheduler in self.dev.schedulers() {
            scheduler.wait_idle()?;
        }
        for frame in frm.frames_mut() {
            frame.retire(&self.dev.sync)?;
        }
        // Nothing is in flight any more, so whatever was released can be reused right away.
        self.dev.sync.recycle(self.dev.sync.take_released())?;
        frm.bump_serial();
        Ok(())
    }

    /// An unsignalled binary semaphore for an outside signaller such as image acquisition.
    pub fn request_semaphore(&self) -> Result<SemaphoreHandle> {
        let raw = self.dev.sync.raw_binary_semaphore()?;
        Ok(self.dev.sync.binary_semaphore(raw, false)?)
    }

    /// Supplies the semaphore the surface image acquisition signals.
    ///
    /// The first batch that touches the surface waits on it.
    pub fn set_acquire_semaphore(&self, semaphore: SemaphoreHandle) -> Result<()> {
        semaphore.signal_external()?;
        self.dev.present.lock().acquire = Some(semaphore);
        Ok(())
    }

    /// Takes the semaphore signalled by the last batch that touched the surface.
    pub fn take_release_semaphore(&self) -> Option<SemaphoreHandle> {
        self.dev.present.lock().release.take()
    }

    pub fn request_program_layout(&self, stages: &ProgramStages) -> Result<Arc<ProgramLayout>> {
        self.res.request_program_layout(stages)
    }

    /// Returns the descriptor set to bind for `set` of the command buffer's program layout.
    ///
    /// The command buffer must still be recording in the current frame, and `token` must be the
    /// worker it was requested with.
    pub fn flush_binding_table(
        &self,
        token: &mut WorkerToken,
        command_buffer: &mut CommandBuffer,
        set: u32,
    ) -> Result<FlushedSet> {
        let frm = self.frm.read();
        command_buffer.flush_binding_table(token, frm.serial(), set)
    }

    pub fn queue_stats(&self, role: QueueRole) -> QueueStats {
        self.dev.scheduler(role).stats()
    }

    /// Last value signalled on `role`'s timeline. Zero without timeline semaphores.
    pub fn timeline_value(&self, role: QueueRole) -> u64 {
        self.dev.scheduler(role).timeline_value()
    }

    /// Binary semaphores ready for reuse.
    pub fn free_semaphore_count(&self) -> usize {
        self.dev.sync.free_semaphore_count()
    }

    pub fn resources(&self) -> &RenderResourceContext {
        &self.res
    }

    fn flush_queue(&self, role: QueueRole, queue: &mut FrameQueue, signals: SignalRequest) -> Result<SubmitSignals> {
        let (signals, completion) =
            self.dev
                .scheduler(role)
                .flush(&mut queue.pending, signals, &self.dev.sync, &self.dev.present)?;
        if let Some(fence) = completion {
            queue.track(fence);
        }
        Ok(signals)
    }

    fn end_frame_locked(&self, frm: &RenderFrameContext) -> Result<()> {
        let frame = frm.current();
        let count = frame.outstanding_count();
        if count > 0 {
            return Err(RenderError::CommandBuffersOutstanding { count }.into());
        }

        for role in QueueRole::ALL {
            let mut queue = frame.queue(role).lock();
            self.flush_queue(role, &mut queue, SignalRequest::NONE)?;
        }
        frame.defer_release(self.dev.sync.take_released());
        Ok(())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(err) = self.wait_idle() {
            log::error!("Failed to drain the renderer on drop: {err}");
            for scheduler in self.dev.schedulers() {
                let _ = scheduler.wait_idle();
            }
        }
        log::debug!("Renderer {:?} dropped", self.owner);
    }
}
