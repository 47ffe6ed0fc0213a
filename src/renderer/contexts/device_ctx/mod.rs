pub mod command_buffer_allocator;
pub mod command_encoder;
pub mod queue;
pub mod submission;
pub mod sync;

use std::sync::Arc;

use color_eyre::Result;
use parking_lot::Mutex;

use crate::renderer::config::RenderConfig;
use crate::renderer::contexts::device_ctx::queue::{QueueMapping, QueueRole};
use crate::renderer::contexts::device_ctx::submission::{PresentState, QueueScheduler};
use crate::renderer::contexts::device_ctx::sync::SyncManager;
use crate::renderer::hal::RenderHal;

/// Responsibilities:
/// - Own the hardware abstraction and the queue each role submits to
/// - Schedule submissions per queue role
/// - Hand out and recycle synchronization primitives
pub struct RenderDeviceContext {
    // Schedulers and the present state hold handles, so they drop before the sync manager.
    schedulers: [QueueScheduler; QueueRole::COUNT],
    pub present: Mutex<PresentState>,
    pub sync: SyncManager,
    pub queues: QueueMapping,
    pub hal: Arc<dyn RenderHal>,
    timeline: bool,
}

impl RenderDeviceContext {
    pub fn new(hal: Arc<dyn RenderHal>, queues: QueueMapping, config: &RenderConfig) -> Result<Self> {
        let timeline = config.prefer_timeline_semaphores && hal.capabilities().timeline_semaphore;
        log::info!(
            "Using {} synchronization",
            if timeline { "timeline semaphore" } else { "binary fence" }
        );

        let scheduler = |role: QueueRole| {
            QueueScheduler::new(
                hal.clone(),
                role,
                queues.queue(role).clone(),
                timeline,
                config.max_signal_semaphores,
            )
        };
        let schedulers = [
            scheduler(QueueRole::Primary)?,
            scheduler(QueueRole::AsyncCompute)?,
            scheduler(QueueRole::AsyncTransfer)?,
        ];

        Ok(Self {
            schedulers,
            present: Mutex::new(PresentState::default()),
            sync: SyncManager::new(hal.clone()),
            queues,
            hal,
            timeline,
        })
    }

    pub fn scheduler(&self, role: QueueRole) -> &QueueScheduler {
        &self.schedulers[role.index()]
    }

    pub fn schedulers(&self) -> &[QueueScheduler] {
        &self.schedulers
    }

    /// Whether submissions signal timeline semaphores instead of binary fences.
    pub fn uses_timeline(&self) -> bool {
        self.timeline
    }
}
