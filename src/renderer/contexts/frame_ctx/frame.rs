use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::renderer::contexts::device_ctx::command_buffer_allocator::CommandPool;
use crate::renderer::contexts::device_ctx::queue::{QueueMapping, QueueRole};
use crate::renderer::contexts::device_ctx::submission::QueueSubmission;
use crate::renderer::contexts::device_ctx::sync::{FenceHandle, ReleasedObjects, SyncManager};
use crate::renderer::error::RenderError;
use crate::renderer::hal::RenderHal;
use crate::renderer::internals::per_thread::{OwnerId, PerThread};

/// Submission state of one queue role within a frame.
#[derive(Default)]
pub struct FrameQueue {
    pub pending: Vec<QueueSubmission>,
    /// Fences that must be signalled before this frame's pools can be reset.
    pub completion: Vec<FenceHandle>,
}

impl FrameQueue {
    /// Records the fence of a submission. A timeline fence covers every earlier one.
    pub fn track(&mut self, fence: FenceHandle) {
        if fence.timeline_value().is_some() {
            self.completion.clear();
        }
        self.completion.push(fence);
    }
}

/// Everything one in-flight frame owns.
pub struct Frame {
    command_pools: [PerThread<CommandPool>; QueueRole::COUNT],
    queues: [Mutex<FrameQueue>; QueueRole::COUNT],
    outstanding: Arc<AtomicUsize>,
    released: Mutex<ReleasedObjects>,
}

impl Frame {
    pub fn new(
        hal: &Arc<dyn RenderHal>,
        owner: OwnerId,
        worker_count: usize,
        queues: &QueueMapping,
    ) -> Result<Self, RenderError> {
        let pools = |role: QueueRole| {
            let family = queues.queue(role).family.index;
            PerThread::try_new(owner, worker_count, |_| CommandPool::new(hal.clone(), family))
        };

        Ok(Self {
            command_pools: [
                pools(QueueRole::Primary)?,
                pools(QueueRole::AsyncCompute)?,
                pools(QueueRole::AsyncTransfer)?,
            ],
            queues: Default::default(),
            outstanding: Arc::new(AtomicUsize::new(0)),
            released: Mutex::new(ReleasedObjects::default()),
        })
    }

    pub fn command_pools(&self, role: QueueRole) -> &PerThread<CommandPool> {
        &self.command_pools[role.index()]
    }

    pub fn queue(&self, role: QueueRole) -> &Mutex<FrameQueue> {
        &self.queues[role.index()]
    }

    /// Counter of command buffers from this frame that are still recording.
    pub fn outstanding(&self) -> &Arc<AtomicUsize> {
        &self.outstanding
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Parks objects released during this frame until it retires.
    pub fn defer_release(&self, mut released: ReleasedObjects) {
        if !released.is_empty() {
            self.released.lock().append(&mut released);
        }
    }

    /// Waits for this frame's previous work, then resets its pools and recycles what it released.
    pub fn retire(&mut self, sync: &SyncManager) -> Result<(), RenderError> {
        for queue in &mut self.queues {
            let queue = queue.get_mut();
            for fence in queue.completion.drain(..) {
                fence.wait_ns(u64::MAX)?;
            }
        }

        for pools in &mut self.command_pools {
            for pool in pools.slots_mut() {
                pool.reset()?;
            }
        }

        sync.recycle(mem::take(self.released.get_mut()))
    }
}
