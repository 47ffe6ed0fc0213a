//! Per-role submission scheduling.
//!
//! A [`QueueScheduler`] turns the pending command buffers of one queue role
//! into at most two hardware batches, attaches lazily registered waits and the
//! surface acquire/release semaphores, and signals either the role's timeline
//! semaphore or a pooled binary fence so the frame knows when its work is done.

use std::mem;
use std::ops::Range;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use smallvec::{SmallVec, smallvec};

use crate::renderer::contexts::device_ctx::queue::{Queue, QueueRole};
use crate::renderer::contexts::device_ctx::sync::{FenceHandle, SemaphoreHandle, SyncManager};
use crate::renderer::error::{HalResultExt, RenderError};
use crate::renderer::hal::{RenderHal, SemaphoreSubmit, SubmitBatch};

/// A recorded command buffer waiting for the next flush of its role.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueSubmission {
    pub raw: vk::CommandBuffer,
    /// Stages that touch the presentation surface. Empty if the surface is untouched.
    pub swapchain_stages: vk::PipelineStageFlags2,
}

impl QueueSubmission {
    pub fn touches_swapchain(&self) -> bool {
        !self.swapchain_stages.is_empty()
    }
}

/// How a pending list is cut into batches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchPlan {
    pub ranges: SmallVec<[Range<usize>; 2]>,
    /// Index of the batch that must wait for the surface.
    pub surface_batch: Option<usize>,
}

/// Cuts `pending` before the first command that touches the surface.
///
/// Everything before it goes out without waiting for the surface; everything
/// from it onwards forms a second batch that waits. Never more than two batches.
pub fn plan_batches(pending: &[QueueSubmission]) -> BatchPlan {
    if pending.is_empty() {
        return BatchPlan {
            ranges: SmallVec::new(),
            surface_batch: None,
        };
    }

    match pending.iter().position(QueueSubmission::touches_swapchain) {
        Some(0) => BatchPlan {
            ranges: smallvec![0..pending.len()],
            surface_batch: Some(0),
        },
        Some(first) => BatchPlan {
            ranges: smallvec![0..first, first..pending.len()],
            surface_batch: Some(1),
        },
        None => BatchPlan {
            ranges: smallvec![0..pending.len()],
            surface_batch: None,
        },
    }
}

/// Signals a caller wants from a submission.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SignalRequest {
    pub fence: bool,
    pub semaphores: usize,
}

impl SignalRequest {
    pub const NONE: Self = Self {
        fence: false,
        semaphores: 0,
    };

    pub fn fence() -> Self {
        Self {
            fence: true,
            semaphores: 0,
        }
    }

    pub fn semaphores(count: usize) -> Self {
        Self {
            fence: false,
            semaphores: count,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.fence && self.semaphores == 0
    }
}

/// Handles produced for a [`SignalRequest`].
#[derive(Debug, Default)]
pub struct SubmitSignals {
    pub fence: Option<FenceHandle>,
    pub semaphores: Vec<SemaphoreHandle>,
}

/// Surface synchronization shared by every role.
#[derive(Default)]
pub struct PresentState {
    /// Signalled by image acquisition, waited on by the first batch touching the surface.
    pub acquire: Option<SemaphoreHandle>,
    /// Signalled by the last batch touching the surface, waited on by presentation.
    pub release: Option<SemaphoreHandle>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Successful `vkQueueSubmit2` calls.
    pub submissions: u64,
    pub batches: u64,
    /// Submissions made only to attach a signal.
    pub empty_submissions: u64,
    pub failed_submissions: u64,
    pub command_buffers: u64,
}

struct PendingWait {
    // Keeps the semaphore out of the recycling pool until the wait is submitted.
    _handle: SemaphoreHandle,
    semaphore: vk::Semaphore,
    value: u64,
    stages: vk::PipelineStageFlags2,
}

struct SchedulerState {
    timeline_value: u64,
    waits: Vec<PendingWait>,
    /// Set once a submission on this role is only observable through a binary fence.
    needs_fence: bool,
    last_completion: Option<FenceHandle>,
    stats: QueueStats,
}

pub struct QueueScheduler {
    role: QueueRole,
    queue: Arc<Queue>,
    timeline: Option<vk::Semaphore>,
    max_signal_semaphores: usize,
    state: Mutex<SchedulerState>,
    hal: Arc<dyn RenderHal>,
}

impl QueueScheduler {
    pub fn new(
        hal: Arc<dyn RenderHal>,
        role: QueueRole,
        queue: Arc<Queue>,
        use_timeline: bool,
        max_signal_semaphores: usize,
    ) -> Result<Self, RenderError> {
        let timeline = if use_timeline {
            Some(hal.create_semaphore(Some(0)).hal_context("vkCreateSemaphore")?)
        } else {
            None
        };

        Ok(Self {
            role,
            queue,
            timeline,
            max_signal_semaphores,
            state: Mutex::new(SchedulerState {
                timeline_value: 0,
                waits: Vec::new(),
                needs_fence: false,
                last_completion: None,
                stats: QueueStats::default(),
            }),
            hal,
        })
    }

    pub fn role(&self) -> QueueRole {
        self.role
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    pub fn timeline_semaphore(&self) -> Option<vk::Semaphore> {
        self.timeline
    }

    /// Last value signalled on this role's timeline.
    pub fn timeline_value(&self) -> u64 {
        self.state.lock().timeline_value
    }

    pub fn needs_fence(&self) -> bool {
        self.state.lock().needs_fence
    }

    pub fn stats(&self) -> QueueStats {
        self.state.lock().stats
    }

    pub fn pending_waits(&self) -> usize {
        self.state.lock().waits.len()
    }

    /// Makes the next submission on this role wait for `semaphore`.
    ///
    /// The semaphore's signal is consumed now, so registering it twice fails.
    pub fn add_wait(&self, semaphore: SemaphoreHandle, stages: vk::PipelineStageFlags2) -> Result<(), RenderError> {
        let (raw, value) = semaphore.consume()?;
        self.state.lock().waits.push(PendingWait {
            _handle: semaphore,
            semaphore: raw,
            value,
            stages,
        });
        Ok(())
    }

    /// Submits `pending` and returns the requested signals plus a fence covering everything submitted.
    ///
    /// Nothing is submitted if `pending` is empty and no signal is wanted. The pending list is
    /// cleared even when the hardware rejects the submission.
    pub fn flush(
        &self,
        pending: &mut Vec<QueueSubmission>,
        signals: SignalRequest,
        sync: &SyncManager,
        present: &Mutex<PresentState>,
    ) -> Result<(SubmitSignals, Option<FenceHandle>), RenderError> {
        let mut state = self.state.lock();
        let plan = plan_batches(pending);

        // Surface work also signals the release semaphore.
        let binary_signals = signals.semaphores + usize::from(plan.surface_batch.is_some());
        if self.timeline.is_none() && binary_signals > self.max_signal_semaphores {
            return Err(RenderError::TooManySignalSemaphores {
                requested: binary_signals,
                capacity: self.max_signal_semaphores,
            });
        }
        if pending.is_empty() && signals.is_empty() {
            return Ok((SubmitSignals::default(), None));
        }

        let mut batches: SmallVec<[SubmitBatch; 2]> = plan
            .ranges
            .iter()
            .map(|range| SubmitBatch {
                command_buffers: pending[range.clone()].iter().map(|submission| submission.raw).collect(),
                ..SubmitBatch::default()
            })
            .collect();
        let empty = batches.is_empty();
        if empty {
            batches.push(SubmitBatch::default());
        }
        let last = batches.len() - 1;

        // Every object the submission signals exists before anything is consumed.
        let mut out = SubmitSignals::default();
        let (completion, fence, timeline_value) = match self.timeline {
            Some(timeline) => {
                let value = state.timeline_value + 1;
                batches[last].signal_semaphores.push(SemaphoreSubmit {
                    semaphore: timeline,
                    value,
                    stages: vk::PipelineStageFlags2::ALL_COMMANDS,
                });
                for _ in 0..signals.semaphores {
                    out.semaphores.push(sync.timeline_semaphore(timeline, value)?);
                }
                let completion = sync.timeline_fence(timeline, value)?;
                if signals.fence {
                    out.fence = Some(completion.clone());
                }
                (completion, vk::Fence::null(), value)
            }
            None => {
                for _ in 0..signals.semaphores {
                    let raw = sync.raw_binary_semaphore()?;
                    let semaphore = sync.binary_semaphore(raw, false)?;
                    batches[last].signal_semaphores.push(SemaphoreSubmit {
                        semaphore: raw,
                        value: 0,
                        stages: vk::PipelineStageFlags2::ALL_COMMANDS,
                    });
                    out.semaphores.push(semaphore);
                }
                let raw = sync.raw_fence()?;
                let completion = sync.binary_fence(raw)?;
                if signals.fence {
                    out.fence = Some(completion.clone());
                }
                (completion, raw, state.timeline_value)
            }
        };

        let mut present = present.lock();
        let mut release = None;
        let mut acquire = None;
        if let Some(surface_batch) = plan.surface_batch {
            let stages = pending[plan.ranges[surface_batch].clone()]
                .iter()
                .fold(vk::PipelineStageFlags2::NONE, |stages, submission| {
                    stages | submission.swapchain_stages
                });

            let raw = sync.raw_binary_semaphore()?;
            let semaphore = sync.binary_semaphore(raw, false)?;
            batches[surface_batch].signal_semaphores.push(SemaphoreSubmit {
                semaphore: raw,
                value: 0,
                stages,
            });
            release = Some(semaphore);

            if let Some(semaphore) = present.acquire.take() {
                match semaphore.consume() {
                    Ok((raw, value)) => {
                        batches[surface_batch].wait_semaphores.push(SemaphoreSubmit {
                            semaphore: raw,
                            value,
                            stages,
                        });
                        acquire = Some(semaphore);
                    }
                    Err(err) => {
                        present.acquire = Some(semaphore);
                        return Err(err);
                    }
                }
            }
        }

        let waits = mem::take(&mut state.waits);
        batches[0].wait_semaphores.extend(waits.iter().map(|wait| SemaphoreSubmit {
            semaphore: wait.semaphore,
            value: wait.value,
            stages: wait.stages,
        }));

        let command_buffers = pending.len() as u64;
        pending.clear();

        let result = {
            let _guard = self.queue.lock_submit();
            self.hal.queue_submit(self.queue.handle, &batches, fence)
        };

        if let Err(result) = result {
            log::error!("vkQueueSubmit2 on {:?} failed: {result}", self.role);
            state.stats.failed_submissions += 1;
            // The waits never reached the hardware; the next submission takes them over.
            state.waits = waits;
            if let Some(semaphore) = acquire {
                semaphore.restore_signalled();
                present.acquire.get_or_insert(semaphore);
            }
            return Err(RenderError::SubmissionFailed {
                role: self.role,
                result,
            });
        }

        for semaphore in out.semaphores.iter().chain(release.iter()) {
            semaphore.mark_signalled();
        }
        if let Some(release) = release {
            present.release = Some(release);
        }

        state.timeline_value = timeline_value;
        state.needs_fence = self.timeline.is_none();
        state.last_completion = Some(completion.clone());
        state.stats.submissions += 1;
        state.stats.batches += batches.len() as u64;
        state.stats.command_buffers += command_buffers;
        if empty {
            state.stats.empty_submissions += 1;
        }

        log::trace!(
            "Submitted {command_buffers} command buffers in {} batches on {:?}",
            batches.len(),
            self.role
        );

        Ok((out, Some(completion)))
    }

    /// Blocks until everything submitted on this role has completed.
    pub fn wait_idle(&self) -> Result<(), RenderError> {
        let last = self.state.lock().last_completion.clone();
        if let Some(fence) = last {
            fence.wait_ns(u64::MAX)?;
        }
        Ok(())
    }
}

impl Drop for QueueScheduler {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        state.waits.clear();
        state.last_completion = None;
        if let Some(timeline) = self.timeline.take() {
            self.hal.destroy_semaphore(timeline);
        }
    }
}
