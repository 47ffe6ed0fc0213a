//! Per-thread descriptor set caches for one set layout.
//!
//! Each worker owns a [`TemporalCache`] of descriptor sets keyed by the hash
//! of the bound resources. A hit means the set already holds exactly these
//! bindings. A miss takes a vacant set (one that fell off the ring) and
//! rewrites it, and only when no vacant set is left is another block of sets
//! allocated from the hardware.

use std::sync::Arc;

use ash::vk;
use smallvec::SmallVec;

use crate::renderer::contexts::resource_ctx::binding_state::{PreparedSet, SetBindings};
use crate::renderer::contexts::resource_ctx::descriptor_set_layout_builder::DescriptorSetLayout;
use crate::renderer::error::{HalResultExt, RenderError};
use crate::renderer::hal::{DescriptorSetBlock, RenderHal};
use crate::renderer::internals::per_thread::{OwnerId, PerThread, WorkerToken};
use crate::renderer::internals::temporal_cache::{EvictionPolicy, TemporalCache};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DescriptorCacheStats {
    /// Flushes answered by a set that already held the bindings.
    pub hits: u64,
    /// Flushes that had to write a vacant set.
    pub rewrites: u64,
    /// Blocks of sets allocated from the hardware.
    pub pool_allocations: u64,
}

/// A set ready to be bound.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlushedSet {
    pub set: vk::DescriptorSet,
    pub hash: u64,
    /// Whether the set was written by this flush.
    pub rewritten: bool,
    pub dynamic_offsets: SmallVec<[u32; 4]>,
}

struct ThreadSetCache {
    sets: TemporalCache<vk::DescriptorSet>,
    blocks: Vec<DescriptorSetBlock>,
    frame_serial: Option<u64>,
    stats: DescriptorCacheStats,
}

pub struct DescriptorSetAllocator {
    layout: Arc<DescriptorSetLayout>,
    threads: PerThread<ThreadSetCache>,
    pool_size: u32,
    hal: Arc<dyn RenderHal>,
}

impl DescriptorSetAllocator {
    pub fn new(
        hal: Arc<dyn RenderHal>,
        layout: Arc<DescriptorSetLayout>,
        owner: OwnerId,
        worker_count: usize,
        ring_depth: usize,
        pool_size: u32,
    ) -> Self {
        let threads = PerThread::new(owner, worker_count, |_| ThreadSetCache {
            sets: TemporalCache::new(ring_depth, EvictionPolicy::Recycle),
            blocks: Vec::new(),
            frame_serial: None,
            stats: DescriptorCacheStats::default(),
        });

        Self {
            layout,
            threads,
            pool_size,
            hal,
        }
    }

    pub fn layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.layout
    }

    /// Returns a descriptor set holding `bindings`, writing one only when no cached set matches.
    ///
    /// The first flush in a new frame advances this worker's ring by one generation. A flush
    /// from a frame older than the last one seen is rejected, since sets handed out since then
    /// may already be bound.
    pub fn flush(
        &self,
        token: &mut WorkerToken,
        frame_serial: u64,
        bindings: &SetBindings,
        set: u32,
    ) -> Result<FlushedSet, RenderError> {
        let prepared = bindings.prepare(set, &self.layout)?;
        let cache = self.threads.get_mut(token)?;

        match cache.frame_serial {
            Some(seen) if frame_serial < seen => {
                return Err(RenderError::StaleCommandBuffer {
                    recorded: frame_serial,
                    current: seen,
                });
            }
            Some(seen) if frame_serial > seen => {
                let evicted = cache.sets.begin_generation();
                if evicted > 0 {
                    log::trace!("Recycled {evicted} descriptor sets");
                }
                cache.frame_serial = Some(frame_serial);
            }
            Some(_) => {}
            None => cache.frame_serial = Some(frame_serial),
        }

        if let Some(raw) = cache.sets.find(prepared.hash).copied() {
            cache.stats.hits += 1;
            return Ok(FlushedSet {
                set: raw,
                hash: prepared.hash,
                rewritten: false,
                dynamic_offsets: prepared.dynamic_offsets,
            });
        }

        let raw = match cache.sets.insert_vacant(prepared.hash)?.copied() {
            Some(raw) => raw,
            None => {
                self.grow(cache)?;
                cache
                    .sets
                    .insert_vacant(prepared.hash)?
                    .copied()
                    .ok_or(RenderError::DescriptorPoolExhausted)?
            }
        };

        self.write(raw, &prepared);
        cache.stats.rewrites += 1;

        Ok(FlushedSet {
            set: raw,
            hash: prepared.hash,
            rewritten: true,
            dynamic_offsets: prepared.dynamic_offsets,
        })
    }

    pub fn stats(&self, token: &mut WorkerToken) -> Result<DescriptorCacheStats, RenderError> {
        Ok(self.threads.get_mut(token)?.stats)
    }

    fn grow(&self, cache: &mut ThreadSetCache) -> Result<(), RenderError> {
        let block = self
            .hal
            .allocate_descriptor_sets(self.layout.raw(), self.layout.bindings(), self.pool_size)
            .hal_context("vkAllocateDescriptorSets")?;
        log::debug!(
            "Allocated {} descriptor sets for layout {:#x}",
            block.sets.len(),
            self.layout.hash()
        );

        for set in &block.sets {
            cache.sets.push_vacant(*set)?;
        }
        cache.blocks.push(block);
        cache.stats.pool_allocations += 1;
        Ok(())
    }

    fn write(&self, set: vk::DescriptorSet, prepared: &PreparedSet) {
        match self.layout.update_template() {
            Some(template) => {
                self.hal
                    .update_descriptor_set_with_template(set, template, &prepared.template_infos());
            }
            None => self.hal.update_descriptor_set(set, &prepared.writes),
        }
    }
}

impl Drop for DescriptorSetAllocator {
    fn drop(&mut self) {
        for cache in self.threads.slots_mut() {
            for block in cache.blocks.drain(..) {
                self.hal.free_descriptor_sets(block);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;

    use super::*;
    use crate::renderer::contexts::resource_ctx::binding_state::ResourceBinding;
    use crate::renderer::contexts::resource_ctx::descriptor_set_layout_builder::DescriptorSetLayoutBuilder;
    use crate::renderer::contexts::resource_ctx::resource_type::RenderResourceType;
    use crate::renderer::hal::headless::{HalEvent, HeadlessDevice};

    struct Fixture {
        device: Arc<HeadlessDevice>,
        allocator: DescriptorSetAllocator,
        token: WorkerToken,
    }

    fn fixture(device: HeadlessDevice, pool_size: u32) -> Fixture {
        let device = Arc::new(device);
        let layout = DescriptorSetLayoutBuilder::new()
            .add_binding_for_resource_type(0, RenderResourceType::UniformBuffer, 1)
            .build(device.clone())
            .unwrap();
        let owner = OwnerId::next();
        let allocator = DescriptorSetAllocator::new(device.clone(), Arc::new(layout), owner, 1, 8, pool_size);
        let token = WorkerToken::issue(owner, 1).pop().unwrap();
        Fixture {
            device,
            allocator,
            token,
        }
    }

    fn bindings(cookie: u64, range: u64) -> SetBindings {
        let mut bindings = SetBindings::default();
        *bindings.slot_mut(0, 0).unwrap() = ResourceBinding::buffer(cookie, vk::Buffer::from_raw(cookie), 0, range);
        bindings
    }

    #[test]
    fn identical_bindings_reuse_the_set_without_rewrite() {
        let mut f = fixture(HeadlessDevice::default(), 16);
        let first = f.allocator.flush(&mut f.token, 1, &bindings(1, 64), 0).unwrap();
        let second = f.allocator.flush(&mut f.token, 1, &bindings(1, 64), 0).unwrap();

        assert!(first.rewritten);
        assert!(!second.rewritten);
        assert_eq!(first.set, second.set);
        assert_eq!(f.device.descriptor_writes(first.set), 1);

        let changed = f.allocator.flush(&mut f.token, 1, &bindings(1, 32), 0).unwrap();
        assert!(changed.rewritten);
        assert_ne!(changed.hash, first.hash);
        assert_ne!(changed.set, first.set);
    }

    #[test]
    fn legacy_device_writes_discrete_descriptors() {
        let mut f = fixture(HeadlessDevice::legacy(), 16);
        f.allocator.flush(&mut f.token, 1, &bindings(1, 64), 0).unwrap();

        let journal = f.device.journal();
        assert!(journal.iter().any(|event| matches!(event, HalEvent::UpdateDescriptorSet { writes: 1, .. })));
        assert!(!journal
            .iter()
            .any(|event| matches!(event, HalEvent::UpdateDescriptorSetWithTemplate { .. })));
    }

    #[test]
    fn evicted_sets_are_reused_before_a_new_pool() {
        let mut f = fixture(HeadlessDevice::default(), 16);

        // Sixteen distinct states fill the first pool.
        for cookie in 0..16 {
            f.allocator.flush(&mut f.token, cookie + 1, &bindings(cookie, 64), 0).unwrap();
        }
        assert_eq!(f.allocator.stats(&mut f.token).unwrap().pool_allocations, 1);

        // The oldest states have fallen off the ring by now and keep feeding new ones.
        for cookie in 16..64 {
            f.allocator.flush(&mut f.token, cookie + 1, &bindings(cookie, 64), 0).unwrap();
        }
        let stats = f.allocator.stats(&mut f.token).unwrap();
        assert_eq!(stats.pool_allocations, 1);
        assert_eq!(stats.rewrites, 64);
        assert_eq!(f.device.live_descriptor_sets(), 16);
    }

    #[test]
    fn exhausted_vacants_allocate_another_pool() {
        let mut f = fixture(HeadlessDevice::default(), 4);
        for cookie in 0..5 {
            f.allocator.flush(&mut f.token, 1, &bindings(cookie, 64), 0).unwrap();
        }
        assert_eq!(f.allocator.stats(&mut f.token).unwrap().pool_allocations, 2);
        assert_eq!(f.device.live_descriptor_sets(), 8);

        drop(f.allocator);
        assert_eq!(f.device.live_descriptor_sets(), 0);
    }

    #[test]
    fn touched_sets_survive_the_ring() {
        let mut f = fixture(HeadlessDevice::default(), 16);
        let kept = f.allocator.flush(&mut f.token, 1, &bindings(100, 64), 0).unwrap();
        for serial in 2..40 {
            let again = f.allocator.flush(&mut f.token, serial, &bindings(100, 64), 0).unwrap();
            assert_eq!(again.set, kept.set);
            assert!(!again.rewritten);
        }
    }

    #[test]
    fn older_frames_cannot_advance_the_ring() {
        let mut f = fixture(HeadlessDevice::default(), 16);
        f.allocator.flush(&mut f.token, 1, &bindings(1, 64), 0).unwrap();
        let current = f.allocator.flush(&mut f.token, 2, &bindings(100, 64), 0).unwrap();

        assert_eq!(
            f.allocator.flush(&mut f.token, 1, &bindings(2, 64), 0).unwrap_err(),
            RenderError::StaleCommandBuffer {
                recorded: 1,
                current: 2,
            }
        );

        let again = f.allocator.flush(&mut f.token, 2, &bindings(100, 64), 0).unwrap();
        assert_eq!(again.set, current.set);
        assert!(!again.rewritten);
        assert_eq!(f.device.descriptor_writes(current.set), 1);
        assert_eq!(f.allocator.stats(&mut f.token).unwrap().rewrites, 2);
    }

    #[test]
    fn foreign_tokens_are_rejected() {
        let f = fixture(HeadlessDevice::default(), 16);
        let mut stranger = WorkerToken::issue(OwnerId::next(), 1).pop().unwrap();
        assert_eq!(
            f.allocator.flush(&mut stranger, 1, &bindings(1, 64), 0).unwrap_err(),
            RenderError::ForeignWorkerToken
        );
    }
}
