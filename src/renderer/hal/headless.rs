//! In-memory device used by the demo binary and the tests.
//!
//! Submitted batches go into a FIFO of in-flight work that completes either
//! immediately (`auto_complete`) or when the owner calls
//! [`HeadlessDevice::complete_next`]. Every hardware call that a real driver
//! would reject is recorded as a violation instead of crashing.

use std::collections::VecDeque;
use std::mem;

use ash::prelude::VkResult;
use ash::vk;
use ash::vk::Handle;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::renderer::hal::{
    DescriptorInfo, DescriptorSetBlock, DescriptorWrite, HalCapabilities, LayoutBinding, RenderHal, SubmitBatch,
};

/// One batch as the device saw it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchRecord {
    pub waits: Vec<(vk::Semaphore, u64)>,
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub signals: Vec<(vk::Semaphore, u64)>,
}

/// One `queue_submit` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmitRecord {
    pub queue: vk::Queue,
    pub batches: Vec<BatchRecord>,
    pub fence: vk::Fence,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HalEvent {
    CreateSemaphore { semaphore: vk::Semaphore, timeline: bool },
    DestroySemaphore(vk::Semaphore),
    CreateFence(vk::Fence),
    DestroyFence(vk::Fence),
    ResetFence(vk::Fence),
    CreateCommandPool(vk::CommandPool),
    ResetCommandPool(vk::CommandPool),
    AllocateCommandBuffers { pool: vk::CommandPool, count: u32 },
    Submit(SubmitRecord),
    AllocateDescriptorSets { layout: vk::DescriptorSetLayout, count: u32 },
    UpdateDescriptorSet { set: vk::DescriptorSet, writes: usize },
    UpdateDescriptorSetWithTemplate { set: vk::DescriptorSet, descriptors: usize },
}

enum SimSemaphore {
    Binary { signal_pending: bool },
    Timeline { completed: u64, submitted: u64 },
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum BufferState {
    Initial,
    Recording,
    Executable,
}

struct SimCommandBuffer {
    state: BufferState,
    in_flight: usize,
}

struct InFlight {
    command_buffers: Vec<u64>,
    signals: Vec<(u64, u64)>,
    fence: Option<u64>,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    queues: FxHashMap<u64, u32>,
    semaphores: FxHashMap<u64, SimSemaphore>,
    fences: FxHashMap<u64, bool>,
    pools: FxHashMap<u64, Vec<u64>>,
    command_buffers: FxHashMap<u64, SimCommandBuffer>,
    layouts: FxHashMap<u64, Vec<LayoutBinding>>,
    templates: FxHashMap<u64, u64>,
    descriptor_blocks: FxHashMap<u64, Vec<u64>>,
    descriptor_writes: FxHashMap<u64, u64>,
    in_flight: VecDeque<InFlight>,
    journal: Vec<HalEvent>,
    violations: Vec<String>,
    auto_complete: bool,
    fail_next_submit: Option<vk::Result>,
}

impl State {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn violation(&mut self, message: String) {
        log::error!("Headless device violation: {message}");
        self.violations.push(message);
    }

    fn complete_next(&mut self) -> bool {
        let Some(work) = self.in_flight.pop_front() else {
            return false;
        };

        for raw in work.command_buffers {
            if let Some(buffer) = self.command_buffers.get_mut(&raw) {
                buffer.in_flight = buffer.in_flight.saturating_sub(1);
            }
        }
        for (semaphore, value) in work.signals {
            if let Some(SimSemaphore::Timeline { completed, .. }) = self.semaphores.get_mut(&semaphore) {
                *completed = (*completed).max(value);
            }
        }
        if let Some(fence) = work.fence {
            self.fences.insert(fence, true);
        }
        true
    }

    fn timeline_reached(&self, semaphore: u64, value: u64) -> Option<bool> {
        match self.semaphores.get(&semaphore)? {
            SimSemaphore::Timeline { completed, .. } => Some(*completed >= value),
            SimSemaphore::Binary { .. } => None,
        }
    }
}

/// Software [`RenderHal`].
pub struct HeadlessDevice {
    capabilities: HalCapabilities,
    state: Mutex<State>,
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new(HalCapabilities::default())
    }
}

impl HeadlessDevice {
    pub fn new(capabilities: HalCapabilities) -> Self {
        Self {
            capabilities,
            state: Mutex::new(State {
                auto_complete: true,
                ..State::default()
            }),
        }
    }

    /// A device without timeline semaphores or update templates.
    pub fn legacy() -> Self {
        Self::new(HalCapabilities {
            timeline_semaphore: false,
            descriptor_update_template: false,
        })
    }

    pub fn create_queue(&self, family_index: u32) -> vk::Queue {
        let mut state = self.state.lock();
        let raw = state.handle();
        state.queues.insert(raw, family_index);
        vk::Queue::from_raw(raw)
    }

    /// When disabled, submitted work stays in flight until completed explicitly.
    pub fn set_auto_complete(&self, enabled: bool) {
        self.state.lock().auto_complete = enabled;
    }

    /// Completes the oldest in-flight batch. Returns `false` if nothing was in flight.
    pub fn complete_next(&self) -> bool {
        self.state.lock().complete_next()
    }

    pub fn complete_all(&self) {
        let mut state = self.state.lock();
        while state.complete_next() {}
    }

    pub fn in_flight_batches(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Makes the next `queue_submit` fail with `result` without executing anything.
    pub fn fail_next_submit(&self, result: vk::Result) {
        self.state.lock().fail_next_submit = Some(result);
    }

    /// Signals a binary semaphore the way swapchain image acquisition would.
    pub fn acquire_image(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        let raw = semaphore.as_raw();
        let doubled = match state.semaphores.get_mut(&raw) {
            Some(SimSemaphore::Binary { signal_pending }) => mem::replace(signal_pending, true),
            _ => {
                state.violation(format!("acquire signalling unknown binary semaphore {raw:#x}"));
                return;
            }
        };
        if doubled {
            state.violation(format!("binary semaphore {raw:#x} signalled twice"));
        }
    }

    /// Consumes a binary semaphore signal the way presentation would.
    pub fn present(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        let raw = semaphore.as_raw();
        let had_signal = match state.semaphores.get_mut(&raw) {
            Some(SimSemaphore::Binary { signal_pending }) => mem::replace(signal_pending, false),
            _ => false,
        };
        if !had_signal {
            state.violation(format!("present waits on binary semaphore {raw:#x} with no pending signal"));
        }
    }

    pub fn journal(&self) -> Vec<HalEvent> {
        self.state.lock().journal.clone()
    }

    pub fn submissions(&self) -> Vec<SubmitRecord> {
        self.state
            .lock()
            .journal
            .iter()
            .filter_map(|event| match event {
                HalEvent::Submit(record) => Some(record.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }

    pub fn live_semaphores(&self) -> usize {
        self.state.lock().semaphores.len()
    }

    pub fn live_fences(&self) -> usize {
        self.state.lock().fences.len()
    }

    pub fn live_command_pools(&self) -> usize {
        self.state.lock().pools.len()
    }

    /// Number of descriptor sets currently allocated.
    pub fn live_descriptor_sets(&self) -> usize {
        self.state.lock().descriptor_blocks.values().map(Vec::len).sum()
    }

    /// How many times `set` has been written.
    pub fn descriptor_writes(&self, set: vk::DescriptorSet) -> u64 {
        self.state
            .lock()
            .descriptor_writes
            .get(&set.as_raw())
            .copied()
            .unwrap_or(0)
    }

    fn wait_until(&self, timeout_ns: u64, mut reached: impl FnMut(&State) -> Option<bool>) -> VkResult<bool> {
        let mut state = self.state.lock();
        loop {
            match reached(&*state) {
                None => {
                    state.violation("wait on an unknown or binary object".to_owned());
                    return Err(vk::Result::ERROR_UNKNOWN);
                }
                Some(true) => return Ok(true),
                Some(false) if timeout_ns != u64::MAX => return Ok(false),
                Some(false) => {
                    if !state.complete_next() {
                        state.violation("wait can never complete".to_owned());
                        return Err(vk::Result::ERROR_DEVICE_LOST);
                    }
                }
            }
        }
    }
}

impl RenderHal for HeadlessDevice {
    fn capabilities(&self) -> HalCapabilities {
        self.capabilities
    }

    fn create_semaphore(&self, initial_timeline_value: Option<u64>) -> VkResult<vk::Semaphore> {
        let mut state = self.state.lock();
        if initial_timeline_value.is_some() && !self.capabilities.timeline_semaphore {
            state.violation("timeline semaphore created without device support".to_owned());
            return Err(vk::Result::ERROR_FEATURE_NOT_PRESENT);
        }

        let raw = state.handle();
        let semaphore = match initial_timeline_value {
            Some(value) => SimSemaphore::Timeline {
                completed: value,
                submitted: value,
            },
            None => SimSemaphore::Binary { signal_pending: false },
        };
        state.semaphores.insert(raw, semaphore);
        state.journal.push(HalEvent::CreateSemaphore {
            semaphore: vk::Semaphore::from_raw(raw),
            timeline: initial_timeline_value.is_some(),
        });
        Ok(vk::Semaphore::from_raw(raw))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.lock();
        let raw = semaphore.as_raw();
        let referenced = state
            .in_flight
            .iter()
            .any(|work| work.signals.iter().any(|(signalled, _)| *signalled == raw));
        if referenced {
            state.violation(format!("semaphore {raw:#x} destroyed while in flight"));
        }
        if state.semaphores.remove(&raw).is_none() {
            state.violation(format!("destroying unknown semaphore {raw:#x}"));
        }
        state.journal.push(HalEvent::DestroySemaphore(semaphore));
    }

    fn semaphore_counter_value(&self, semaphore: vk::Semaphore) -> VkResult<u64> {
        let state = self.state.lock();
        match state.semaphores.get(&semaphore.as_raw()) {
            Some(SimSemaphore::Timeline { completed, .. }) => Ok(*completed),
            _ => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn wait_semaphore(&self, semaphore: vk::Semaphore, value: u64, timeout_ns: u64) -> VkResult<bool> {
        let raw = semaphore.as_raw();
        self.wait_until(timeout_ns, |state| state.timeline_reached(raw, value))
    }

    fn create_fence(&self) -> VkResult<vk::Fence> {
        let mut state = self.state.lock();
        let raw = state.handle();
        state.fences.insert(raw, false);
        state.journal.push(HalEvent::CreateFence(vk::Fence::from_raw(raw)));
        Ok(vk::Fence::from_raw(raw))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        let raw = fence.as_raw();
        if state.in_flight.iter().any(|work| work.fence == Some(raw)) {
            state.violation(format!("fence {raw:#x} destroyed while in flight"));
        }
        if state.fences.remove(&raw).is_none() {
            state.violation(format!("destroying unknown fence {raw:#x}"));
        }
        state.journal.push(HalEvent::DestroyFence(fence));
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        let raw = fence.as_raw();
        if state.in_flight.iter().any(|work| work.fence == Some(raw)) {
            state.violation(format!("fence {raw:#x} reset while in flight"));
        }
        match state.fences.get_mut(&raw) {
            Some(signalled) => *signalled = false,
            None => return Err(vk::Result::ERROR_UNKNOWN),
        }
        state.journal.push(HalEvent::ResetFence(fence));
        Ok(())
    }

    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        self.state
            .lock()
            .fences
            .get(&fence.as_raw())
            .copied()
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn wait_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<bool> {
        let raw = fence.as_raw();
        self.wait_until(timeout_ns, |state| state.fences.get(&raw).copied())
    }

    fn create_command_pool(&self, _queue_family_index: u32) -> VkResult<vk::CommandPool> {
        let mut state = self.state.lock();
        let raw = state.handle();
        state.pools.insert(raw, Vec::new());
        state.journal.push(HalEvent::CreateCommandPool(vk::CommandPool::from_raw(raw)));
        Ok(vk::CommandPool::from_raw(raw))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        let Some(buffers) = state.pools.remove(&pool.as_raw()) else {
            state.violation(format!("destroying unknown command pool {:#x}", pool.as_raw()));
            return;
        };
        for raw in buffers {
            if let Some(buffer) = state.command_buffers.remove(&raw) {
                if buffer.in_flight > 0 {
                    state.violation(format!("command pool {:#x} destroyed while in flight", pool.as_raw()));
                }
            }
        }
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> VkResult<()> {
        let mut state = self.state.lock();
        let raw_pool = pool.as_raw();
        let Some(buffers) = state.pools.get(&raw_pool).cloned() else {
            return Err(vk::Result::ERROR_UNKNOWN);
        };

        let busy = buffers
            .iter()
            .filter_map(|raw| state.command_buffers.get(raw))
            .any(|buffer| buffer.in_flight > 0);
        if busy {
            state.violation(format!("command pool {raw_pool:#x} reset while in flight"));
        }

        for raw in buffers {
            if let Some(buffer) = state.command_buffers.get_mut(&raw) {
                buffer.state = BufferState::Initial;
            }
        }
        state.journal.push(HalEvent::ResetCommandPool(pool));
        Ok(())
    }

    fn allocate_command_buffers(&self, pool: vk::CommandPool, count: u32) -> VkResult<Vec<vk::CommandBuffer>> {
        let mut state = self.state.lock();
        let raw_pool = pool.as_raw();
        if !state.pools.contains_key(&raw_pool) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }

        let mut allocated = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let raw = state.handle();
            state.command_buffers.insert(
                raw,
                SimCommandBuffer {
                    state: BufferState::Initial,
                    in_flight: 0,
                },
            );
            allocated.push(raw);
        }
        if let Some(buffers) = state.pools.get_mut(&raw_pool) {
            buffers.extend_from_slice(&allocated);
        }
        state.journal.push(HalEvent::AllocateCommandBuffers { pool, count });

        Ok(allocated.into_iter().map(vk::CommandBuffer::from_raw).collect())
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state.lock();
        let raw = command_buffer.as_raw();
        let Some(buffer) = state.command_buffers.get_mut(&raw) else {
            return Err(vk::Result::ERROR_UNKNOWN);
        };
        let previous = buffer.state;
        buffer.state = BufferState::Recording;
        if previous != BufferState::Initial {
            state.violation(format!("command buffer {raw:#x} begun without a pool reset"));
        }
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state.lock();
        let raw = command_buffer.as_raw();
        let Some(buffer) = state.command_buffers.get_mut(&raw) else {
            return Err(vk::Result::ERROR_UNKNOWN);
        };
        if buffer.state != BufferState::Recording {
            state.violation(format!("command buffer {raw:#x} ended while not recording"));
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        buffer.state = BufferState::Executable;
        Ok(())
    }

    fn queue_submit(&self, queue: vk::Queue, batches: &[SubmitBatch], fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.lock();
        if let Some(result) = state.fail_next_submit.take() {
            return Err(result);
        }
        if !state.queues.contains_key(&queue.as_raw()) {
            state.violation(format!("submit to unknown queue {:#x}", queue.as_raw()));
            return Err(vk::Result::ERROR_UNKNOWN);
        }

        let mut record = SubmitRecord {
            queue,
            batches: Vec::with_capacity(batches.len()),
            fence,
        };

        for (i, batch) in batches.iter().enumerate() {
            for wait in &batch.wait_semaphores {
                let raw = wait.semaphore.as_raw();
                let problem = match state.semaphores.get_mut(&raw) {
                    Some(SimSemaphore::Binary { signal_pending }) => {
                        let had_signal = *signal_pending;
                        *signal_pending = false;
                        (!had_signal).then(|| format!("wait on binary semaphore {raw:#x} with no pending signal"))
                    }
                    Some(SimSemaphore::Timeline { submitted, .. }) => (wait.value > *submitted)
                        .then(|| format!("wait on timeline {raw:#x} value {} before it was submitted", wait.value)),
                    None => Some(format!("wait on unknown semaphore {raw:#x}")),
                };
                if let Some(problem) = problem {
                    state.violation(problem);
                }
            }

            for command_buffer in &batch.command_buffers {
                let raw = command_buffer.as_raw();
                let problem = match state.command_buffers.get_mut(&raw) {
                    Some(buffer) if buffer.state == BufferState::Executable => {
                        buffer.in_flight += 1;
                        None
                    }
                    Some(_) => Some(format!("command buffer {raw:#x} submitted while not executable")),
                    None => Some(format!("submit of unknown command buffer {raw:#x}")),
                };
                if let Some(problem) = problem {
                    state.violation(problem);
                }
            }

            let mut signals = Vec::with_capacity(batch.signal_semaphores.len());
            for signal in &batch.signal_semaphores {
                let raw = signal.semaphore.as_raw();
                let problem = match state.semaphores.get_mut(&raw) {
                    Some(SimSemaphore::Binary { signal_pending }) => {
                        let doubled = *signal_pending;
                        *signal_pending = true;
                        doubled.then(|| format!("binary semaphore {raw:#x} signalled twice"))
                    }
                    Some(SimSemaphore::Timeline { submitted, .. }) => {
                        let stale = signal.value <= *submitted;
                        *submitted = (*submitted).max(signal.value);
                        stale.then(|| format!("timeline {raw:#x} signal value {} is not increasing", signal.value))
                    }
                    None => Some(format!("signal of unknown semaphore {raw:#x}")),
                };
                if let Some(problem) = problem {
                    state.violation(problem);
                }
                signals.push((raw, signal.value));
            }

            let last = i + 1 == batches.len();
            state.in_flight.push_back(InFlight {
                command_buffers: batch.command_buffers.iter().map(|cmd| cmd.as_raw()).collect(),
                signals,
                fence: (last && fence != vk::Fence::null()).then(|| fence.as_raw()),
            });

            record.batches.push(BatchRecord {
                waits: batch
                    .wait_semaphores
                    .iter()
                    .map(|wait| (wait.semaphore, wait.value))
                    .collect(),
                command_buffers: batch.command_buffers.to_vec(),
                signals: batch
                    .signal_semaphores
                    .iter()
                    .map(|signal| (signal.semaphore, signal.value))
                    .collect(),
            });
        }

        if batches.is_empty() && fence != vk::Fence::null() {
            state.in_flight.push_back(InFlight {
                command_buffers: Vec::new(),
                signals: Vec::new(),
                fence: Some(fence.as_raw()),
            });
        }

        state.journal.push(HalEvent::Submit(record));

        if state.auto_complete {
            while state.complete_next() {}
        }
        Ok(())
    }

    fn create_descriptor_set_layout(&self, bindings: &[LayoutBinding]) -> VkResult<vk::DescriptorSetLayout> {
        let mut state = self.state.lock();
        let raw = state.handle();
        state.layouts.insert(raw, bindings.to_vec());
        Ok(vk::DescriptorSetLayout::from_raw(raw))
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.state.lock().layouts.remove(&layout.as_raw());
    }

    fn create_descriptor_update_template(
        &self,
        layout: vk::DescriptorSetLayout,
        _bindings: &[LayoutBinding],
    ) -> VkResult<vk::DescriptorUpdateTemplate> {
        let mut state = self.state.lock();
        if !self.capabilities.descriptor_update_template {
            state.violation("update template created without device support".to_owned());
            return Err(vk::Result::ERROR_FEATURE_NOT_PRESENT);
        }
        let raw = state.handle();
        state.templates.insert(raw, layout.as_raw());
        Ok(vk::DescriptorUpdateTemplate::from_raw(raw))
    }

    fn destroy_descriptor_update_template(&self, template: vk::DescriptorUpdateTemplate) {
        self.state.lock().templates.remove(&template.as_raw());
    }

    fn allocate_descriptor_sets(
        &self,
        layout: vk::DescriptorSetLayout,
        _bindings: &[LayoutBinding],
        count: u32,
    ) -> VkResult<DescriptorSetBlock> {
        let mut state = self.state.lock();
        if !state.layouts.contains_key(&layout.as_raw()) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }

        let id = state.handle();
        let sets: Vec<u64> = (0..count).map(|_| state.handle()).collect();
        state.descriptor_blocks.insert(id, sets.clone());
        state.journal.push(HalEvent::AllocateDescriptorSets { layout, count });

        Ok(DescriptorSetBlock {
            id,
            sets: sets.into_iter().map(vk::DescriptorSet::from_raw).collect(),
        })
    }

    fn free_descriptor_sets(&self, block: DescriptorSetBlock) {
        let mut state = self.state.lock();
        if state.descriptor_blocks.remove(&block.id).is_none() {
            state.violation(format!("freeing unknown descriptor block {}", block.id));
        }
        for set in block.sets {
            state.descriptor_writes.remove(&set.as_raw());
        }
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        let mut state = self.state.lock();
        *state.descriptor_writes.entry(set.as_raw()).or_default() += 1;
        state.journal.push(HalEvent::UpdateDescriptorSet {
            set,
            writes: writes.len(),
        });
    }

    fn update_descriptor_set_with_template(
        &self,
        set: vk::DescriptorSet,
        template: vk::DescriptorUpdateTemplate,
        infos: &[DescriptorInfo],
    ) {
        let mut state = self.state.lock();
        if !state.templates.contains_key(&template.as_raw()) {
            state.violation(format!("update with unknown template {:#x}", template.as_raw()));
        }
        *state.descriptor_writes.entry(set.as_raw()).or_default() += 1;
        state.journal.push(HalEvent::UpdateDescriptorSetWithTemplate {
            set,
            descriptors: infos.len(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::hal::SemaphoreSubmit;
    use smallvec::smallvec;

    fn signal(semaphore: vk::Semaphore, value: u64) -> SemaphoreSubmit {
        SemaphoreSubmit {
            semaphore,
            value,
            stages: vk::PipelineStageFlags2::ALL_COMMANDS,
        }
    }

    #[test]
    fn finite_wait_times_out_until_work_completes() {
        let device = HeadlessDevice::default();
        device.set_auto_complete(false);
        let queue = device.create_queue(0);
        let timeline = device.create_semaphore(Some(0)).unwrap();

        let batch = SubmitBatch {
            signal_semaphores: smallvec![signal(timeline, 1)],
            ..SubmitBatch::default()
        };
        device.queue_submit(queue, &[batch], vk::Fence::null()).unwrap();

        assert_eq!(device.wait_semaphore(timeline, 1, 0), Ok(false));
        assert!(device.complete_next());
        assert_eq!(device.wait_semaphore(timeline, 1, 0), Ok(true));
        assert!(device.violations().is_empty());
    }

    #[test]
    fn infinite_wait_drains_in_flight_work() {
        let device = HeadlessDevice::default();
        device.set_auto_complete(false);
        let queue = device.create_queue(0);
        let fence = device.create_fence().unwrap();

        device.queue_submit(queue, &[SubmitBatch::default()], fence).unwrap();
        assert_eq!(device.fence_status(fence), Ok(false));
        assert_eq!(device.wait_fence(fence, u64::MAX), Ok(true));
        assert_eq!(device.in_flight_batches(), 0);
    }

    #[test]
    fn pool_reset_during_execution_is_a_violation() {
        let device = HeadlessDevice::default();
        device.set_auto_complete(false);
        let queue = device.create_queue(0);
        let pool = device.create_command_pool(0).unwrap();
        let cmd = device.allocate_command_buffers(pool, 1).unwrap()[0];
        device.begin_command_buffer(cmd).unwrap();
        device.end_command_buffer(cmd).unwrap();

        let batch = SubmitBatch {
            command_buffers: smallvec![cmd],
            ..SubmitBatch::default()
        };
        device.queue_submit(queue, &[batch], vk::Fence::null()).unwrap();
        device.reset_command_pool(pool).unwrap();

        assert_eq!(device.violations().len(), 1);
    }

    #[test]
    fn binary_semaphore_waited_twice_is_a_violation() {
        let device = HeadlessDevice::default();
        let queue = device.create_queue(0);
        let semaphore = device.create_semaphore(None).unwrap();

        let signal_batch = SubmitBatch {
            signal_semaphores: smallvec![signal(semaphore, 0)],
            ..SubmitBatch::default()
        };
        let wait_batch = SubmitBatch {
            wait_semaphores: smallvec![signal(semaphore, 0)],
            ..SubmitBatch::default()
        };
        device.queue_submit(queue, &[signal_batch], vk::Fence::null()).unwrap();
        device.queue_submit(queue, &[wait_batch.clone()], vk::Fence::null()).unwrap();
        assert!(device.violations().is_empty());

        device.queue_submit(queue, &[wait_batch], vk::Fence::null()).unwrap();
        assert_eq!(device.violations().len(), 1);
    }

    #[test]
    fn failed_submit_does_not_execute() {
        let device = HeadlessDevice::default();
        let queue = device.create_queue(0);
        device.fail_next_submit(vk::Result::ERROR_DEVICE_LOST);

        assert_eq!(
            device.queue_submit(queue, &[SubmitBatch::default()], vk::Fence::null()),
            Err(vk::Result::ERROR_DEVICE_LOST)
        );
        assert!(device.submissions().is_empty());
        assert!(device.queue_submit(queue, &[SubmitBatch::default()], vk::Fence::null()).is_ok());
    }
}
