//! Fence and semaphore handles returned by submissions.
//!
//! Both come in two flavours. With timeline semaphores a fence or semaphore is
//! just `(queue timeline, value)`. Without them they wrap a disposable binary
//! object taken from a recycling pool. Handles are reference counted; once the
//! last one drops, the binary object is queued for release and comes back to
//! the pool when the frame it was released in has retired.

use std::fmt;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use ash::vk;
use color_eyre::Result;
use color_eyre::eyre::eyre;
use parking_lot::Mutex;

use crate::renderer::error::{HalResultExt, RenderError};
use crate::renderer::hal::RenderHal;
use crate::renderer::internals::handle::{Handle, HandlePool};

pub type FenceHandle = Handle<Fence>;
pub type SemaphoreHandle = Handle<Semaphore>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitStatus {
    Signalled,
    TimedOut,
}

fn timeout_ns(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}

#[derive(Debug)]
pub enum FenceKind {
    /// `observed` is set once a host wait has seen the fence signalled.
    Binary { fence: vk::Fence, observed: AtomicBool },
    Timeline { semaphore: vk::Semaphore, value: u64 },
}

pub struct Fence {
    kind: FenceKind,
    hal: Arc<dyn RenderHal>,
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence").field("kind", &self.kind).finish()
    }
}

impl Fence {
    pub fn kind(&self) -> &FenceKind {
        &self.kind
    }

    /// Target value on the queue timeline, if this fence is timeline based.
    pub fn timeline_value(&self) -> Option<u64> {
        match self.kind {
            FenceKind::Timeline { value, .. } => Some(value),
            FenceKind::Binary { .. } => None,
        }
    }

    /// Blocks until the fence is signalled.
    pub fn wait(&self) -> Result<()> {
        self.wait_ns(u64::MAX)?;
        Ok(())
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<WaitStatus> {
        Ok(self.wait_ns(timeout_ns(timeout))?)
    }

    pub fn is_signalled(&self) -> Result<bool> {
        Ok(self.wait_ns(0)? == WaitStatus::Signalled)
    }

    pub(crate) fn wait_ns(&self, timeout_ns: u64) -> Result<WaitStatus, RenderError> {
        let signalled = match &self.kind {
            FenceKind::Binary { fence, observed } => {
                if observed.load(Ordering::Acquire) {
                    return Ok(WaitStatus::Signalled);
                }
                let signalled = if timeout_ns == 0 {
                    self.hal.fence_status(*fence).hal_context("vkGetFenceStatus")?
                } else {
                    self.hal.wait_fence(*fence, timeout_ns).hal_context("vkWaitForFences")?
                };
                if signalled {
                    observed.store(true, Ordering::Release);
                }
                signalled
            }
            FenceKind::Timeline { semaphore, value } => self
                .hal
                .wait_semaphore(*semaphore, *value, timeout_ns)
                .hal_context("vkWaitSemaphores")?,
        };

        Ok(if signalled {
            WaitStatus::Signalled
        } else {
            WaitStatus::TimedOut
        })
    }
}

const UNSIGNALLED: u8 = 0;
const SIGNALLED: u8 = 1;
const CONSUMED: u8 = 2;

#[derive(Debug)]
pub enum SemaphoreKind {
    Binary { semaphore: vk::Semaphore, state: AtomicU8 },
    Timeline { semaphore: vk::Semaphore, value: u64 },
}

pub struct Semaphore {
    kind: SemaphoreKind,
    hal: Arc<dyn RenderHal>,
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore").field("kind", &self.kind).finish()
    }
}

impl Semaphore {
    pub fn raw(&self) -> vk::Semaphore {
        match self.kind {
            SemaphoreKind::Binary { semaphore, .. } | SemaphoreKind::Timeline { semaphore, .. } => semaphore,
        }
    }

    pub fn timeline_value(&self) -> Option<u64> {
        match self.kind {
            SemaphoreKind::Timeline { value, .. } => Some(value),
            SemaphoreKind::Binary { .. } => None,
        }
    }

    /// Whether a signal is pending that nobody has waited on yet.
    pub fn is_pending(&self) -> bool {
        match &self.kind {
            SemaphoreKind::Binary { state, .. } => state.load(Ordering::Acquire) == SIGNALLED,
            SemaphoreKind::Timeline { .. } => true,
        }
    }

    /// Host wait. Only timeline semaphores can be waited on from the host.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<WaitStatus> {
        let SemaphoreKind::Timeline { semaphore, value } = self.kind else {
            return Err(RenderError::HostWaitOnBinarySemaphore.into());
        };
        let signalled = self
            .hal
            .wait_semaphore(semaphore, value, timeout_ns(timeout))
            .hal_context("vkWaitSemaphores")?;
        Ok(if signalled {
            WaitStatus::Signalled
        } else {
            WaitStatus::TimedOut
        })
    }

    /// Records that something outside the renderer (e.g. swapchain image acquisition) signalled this semaphore.
    pub fn signal_external(&self) -> Result<()> {
        if let SemaphoreKind::Binary { state, .. } = &self.kind {
            if state.load(Ordering::Acquire) == SIGNALLED {
                return Err(eyre!("binary semaphore already has a pending signal"));
            }
            state.store(SIGNALLED, Ordering::Release);
        }
        Ok(())
    }

    /// Hands the semaphore to an outside waiter such as presentation, consuming its signal.
    pub fn wait_external(&self) -> Result<vk::Semaphore> {
        Ok(self.consume()?.0)
    }

    /// Takes the pending signal. Returns the raw semaphore and the value to wait for.
    pub(crate) fn consume(&self) -> Result<(vk::Semaphore, u64), RenderError> {
        match &self.kind {
            SemaphoreKind::Binary { semaphore, state } => {
                match state.compare_exchange(SIGNALLED, CONSUMED, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => Ok((*semaphore, 0)),
                    Err(CONSUMED) => Err(RenderError::SemaphoreAlreadyConsumed),
                    Err(_) => Err(RenderError::SemaphoreNotSignalled),
                }
            }
            SemaphoreKind::Timeline { semaphore, value } => Ok((*semaphore, *value)),
        }
    }

    /// Undoes [`consume`](Self::consume) after the wait never reached the hardware.
    pub(crate) fn restore_signalled(&self) {
        if let SemaphoreKind::Binary { state, .. } = &self.kind {
            let _ = state.compare_exchange(CONSUMED, SIGNALLED, Ordering::AcqRel, Ordering::Acquire);
        }
    }

    /// Marks a semaphore that was just attached to a submitted signal operation.
    pub(crate) fn mark_signalled(&self) {
        if let SemaphoreKind::Binary { state, .. } = &self.kind {
            state.store(SIGNALLED, Ordering::Release);
        }
    }
}

/// Binary objects whose last handle dropped, waiting for a frame to retire.
#[derive(Debug, Default)]
pub struct ReleasedObjects {
    /// Waited on or never signalled; safe to reuse.
    pub recycle_semaphores: Vec<vk::Semaphore>,
    /// Signalled but never waited on; must be destroyed.
    pub destroy_semaphores: Vec<vk::Semaphore>,
    pub fences: Vec<vk::Fence>,
}

impl ReleasedObjects {
    pub fn is_empty(&self) -> bool {
        self.recycle_semaphores.is_empty() && self.destroy_semaphores.is_empty() && self.fences.is_empty()
    }

    pub fn append(&mut self, other: &mut ReleasedObjects) {
        self.recycle_semaphores.append(&mut other.recycle_semaphores);
        self.destroy_semaphores.append(&mut other.destroy_semaphores);
        self.fences.append(&mut other.fences);
    }
}

/// Hands out fences and semaphores and recycles their binary objects.
pub struct SyncManager {
    hal: Arc<dyn RenderHal>,
    fences: HandlePool<Fence>,
    semaphores: HandlePool<Semaphore>,
    released: Arc<Mutex<ReleasedObjects>>,
    free_semaphores: Mutex<Vec<vk::Semaphore>>,
    free_fences: Mutex<Vec<vk::Fence>>,
}

impl SyncManager {
    pub fn new(hal: Arc<dyn RenderHal>) -> Self {
        let released = Arc::new(Mutex::new(ReleasedObjects::default()));

        let fences = {
            let released = released.clone();
            HandlePool::new(move |fence: Fence| {
                if let FenceKind::Binary { fence, .. } = fence.kind {
                    released.lock().fences.push(fence);
                }
            })
        };
        let semaphores = {
            let released = released.clone();
            HandlePool::new(move |semaphore: Semaphore| {
                if let SemaphoreKind::Binary { semaphore, state } = semaphore.kind {
                    let mut released = released.lock();
                    match state.into_inner() {
                        SIGNALLED => released.destroy_semaphores.push(semaphore),
                        _ => released.recycle_semaphores.push(semaphore),
                    }
                }
            })
        };

        Self {
            hal,
            fences,
            semaphores,
            released,
            free_semaphores: Mutex::new(Vec::new()),
            free_fences: Mutex::new(Vec::new()),
        }
    }

    /// An unsignalled binary semaphore, recycled when possible.
    pub fn raw_binary_semaphore(&self) -> Result<vk::Semaphore, RenderError> {
        if let Some(semaphore) = self.free_semaphores.lock().pop() {
            return Ok(semaphore);
        }
        self.hal.create_semaphore(None).hal_context("vkCreateSemaphore")
    }

    /// An unsignalled fence, recycled when possible.
    pub fn raw_fence(&self) -> Result<vk::Fence, RenderError> {
        if let Some(fence) = self.free_fences.lock().pop() {
            return Ok(fence);
        }
        self.hal.create_fence().hal_context("vkCreateFence")
    }

    pub fn timeline_fence(&self, semaphore: vk::Semaphore, value: u64) -> Result<FenceHandle, RenderError> {
        self.fences.allocate(Fence {
            kind: FenceKind::Timeline { semaphore, value },
            hal: self.hal.clone(),
        })
    }

    pub fn binary_fence(&self, fence: vk::Fence) -> Result<FenceHandle, RenderError> {
        self.fences.allocate(Fence {
            kind: FenceKind::Binary {
                fence,
                observed: AtomicBool::new(false),
            },
            hal: self.hal.clone(),
        })
    }

    pub fn timeline_semaphore(&self, semaphore: vk::Semaphore, value: u64) -> Result<SemaphoreHandle, RenderError> {
        self.semaphores.allocate(Semaphore {
            kind: SemaphoreKind::Timeline { semaphore, value },
            hal: self.hal.clone(),
        })
    }

    /// Wraps a binary semaphore. `signalled` says whether a signal operation is already pending.
    pub fn binary_semaphore(&self, semaphore: vk::Semaphore, signalled: bool) -> Result<SemaphoreHandle, RenderError> {
        let state = if signalled { SIGNALLED } else { UNSIGNALLED };
        self.semaphores.allocate(Semaphore {
            kind: SemaphoreKind::Binary {
                semaphore,
                state: AtomicU8::new(state),
            },
            hal: self.hal.clone(),
        })
    }

    /// Takes everything released since the last call.
    pub fn take_released(&self) -> ReleasedObjects {
        mem::take(&mut *self.released.lock())
    }

    /// Puts released objects back into circulation. Their last use must have completed.
    pub fn recycle(&self, released: ReleasedObjects) -> Result<(), RenderError> {
        for semaphore in released.destroy_semaphores {
            self.hal.destroy_semaphore(semaphore);
        }
        self.free_semaphores.lock().extend(released.recycle_semaphores);

        for fence in &released.fences {
            self.hal.reset_fence(*fence).hal_context("vkResetFences")?;
        }
        self.free_fences.lock().extend(released.fences);
        Ok(())
    }

    pub fn free_semaphore_count(&self) -> usize {
        self.free_semaphores.lock().len()
    }

    pub fn free_fence_count(&self) -> usize {
        self.free_fences.lock().len()
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        let released = self.take_released();
        let semaphores = self
            .free_semaphores
            .get_mut()
            .drain(..)
            .chain(released.recycle_semaphores)
            .chain(released.destroy_semaphores);
        for semaphore in semaphores {
            self.hal.destroy_semaphore(semaphore);
        }
        for fence in self.free_fences.get_mut().drain(..).chain(released.fences) {
            self.hal.destroy_fence(fence);
        }
    }
}
