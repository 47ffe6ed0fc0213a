//! Error types shared by the submission engine and the binding cache.
//!
//! Public entry points return [`color_eyre::Result`]; the reports they carry
//! are built from [`RenderError`] so callers can recover the exact failure
//! with `report.downcast_ref::<RenderError>()`.

use ash::vk;
use thiserror::Error;

use crate::renderer::contexts::device_ctx::queue::QueueRole;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    // ========================================================================
    // Resource exhaustion
    // ========================================================================
    /// Growing an object arena failed.
    #[error("out of host memory while growing an object arena")]
    OutOfHostMemory,

    /// A freshly allocated descriptor pool did not yield a usable set.
    #[error("descriptor pool allocation returned no usable sets")]
    DescriptorPoolExhausted,

    // ========================================================================
    // Hardware failures
    // ========================================================================
    #[error("{operation} failed: {result}")]
    Hardware {
        operation: &'static str,
        result: vk::Result,
    },

    /// Submission failed; the pending work for the role was discarded.
    #[error("submission to {role:?} queue failed: {result}")]
    SubmissionFailed { role: QueueRole, result: vk::Result },

    // ========================================================================
    // Protocol misuse
    // ========================================================================
    #[error("command buffer is still recording")]
    StillRecording,

    #[error("command buffer is not recording")]
    NotRecording,

    /// The command buffer was requested in a frame that has since ended.
    #[error("command buffer from frame {recorded} submitted during frame {current}")]
    StaleCommandBuffer { recorded: u64, current: u64 },

    #[error("binary semaphore was already consumed by a wait")]
    SemaphoreAlreadyConsumed,

    #[error("binary semaphore has no pending signal to wait on")]
    SemaphoreNotSignalled,

    #[error("binary semaphores cannot be waited on from the host")]
    HostWaitOnBinarySemaphore,

    #[error("requested {requested} signal semaphores, capacity is {capacity}")]
    TooManySignalSemaphores { requested: usize, capacity: usize },

    #[error("{count} command buffers are still recording at frame end")]
    CommandBuffersOutstanding { count: usize },

    #[error("worker token does not belong to this renderer")]
    ForeignWorkerToken,

    #[error("worker index {index} is out of range ({count} workers)")]
    WorkerIndexOutOfRange { index: usize, count: usize },

    /// A command buffer's bindings were flushed through another worker's cache.
    #[error("command buffer of worker {recorded} flushed with the token of worker {flushed}")]
    WorkerMismatch { recorded: usize, flushed: usize },

    #[error("descriptor set {set} is not part of the bound program layout")]
    UnknownDescriptorSet { set: u32 },

    #[error("binding slot ({set}, {binding}, {array_index}) is out of range")]
    BindingOutOfRange {
        set: u32,
        binding: u32,
        array_index: u32,
    },

    #[error("binding ({set}, {binding}, {array_index}) is unbound or has the wrong resource kind")]
    MissingBinding {
        set: u32,
        binding: u32,
        array_index: u32,
    },

    /// A cache entry was inserted under a key that is already cached.
    #[error("cache key {key:#x} is already present")]
    DuplicateCacheKey { key: u64 },

    #[error("queue family {family} cannot serve the {role:?} role")]
    UnsupportedQueueRole { role: QueueRole, family: u32 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Attaches an operation name to a raw hardware result and logs the failure.
pub trait HalResultExt<T> {
    fn hal_context(self, operation: &'static str) -> Result<T, RenderError>;
}

impl<T> HalResultExt<T> for Result<T, vk::Result> {
    fn hal_context(self, operation: &'static str) -> Result<T, RenderError> {
        self.map_err(|result| {
            log::error!("{operation} failed: {result}");
            RenderError::Hardware { operation, result }
        })
    }
}
