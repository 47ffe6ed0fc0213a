//! Generational cache keyed by precomputed 64-bit hashes.
//!
//! Entries live in an [`ObjectPool`] and are threaded onto one of `R`
//! doubly-linked ring lists by index. Every [`TemporalCache::begin_generation`]
//! advances to the next ring slot and evicts whatever is still linked there,
//! which is exactly the set of entries nobody touched for `R` generations.
//! [`TemporalCache::find`] moves a hit onto the current slot, resetting its
//! deadline.

use rustc_hash::FxHashMap;

use crate::renderer::error::RenderError;
use crate::renderer::internals::object_pool::{ObjectPool, PoolIndex};

/// What happens to an entry that falls off the ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Keep the value on the vacant list so it can be re-keyed by `insert_vacant`.
    Recycle,
    /// Drop the value.
    Destroy,
}

struct Entry<T> {
    key: u64,
    ring: Option<usize>,
    prev: Option<PoolIndex>,
    next: Option<PoolIndex>,
    value: T,
}

#[derive(Clone, Copy, Default)]
struct RingList {
    head: Option<PoolIndex>,
    tail: Option<PoolIndex>,
}

pub struct TemporalCache<T> {
    entries: ObjectPool<Entry<T>>,
    rings: Box<[RingList]>,
    index: FxHashMap<u64, PoolIndex>,
    vacant: Vec<PoolIndex>,
    current: usize,
    generation: u64,
    policy: EvictionPolicy,
}

impl<T> TemporalCache<T> {
    pub fn new(ring_depth: usize, policy: EvictionPolicy) -> Self {
        Self {
            entries: ObjectPool::new(),
            rings: vec![RingList::default(); ring_depth.max(1)].into_boxed_slice(),
            index: FxHashMap::default(),
            vacant: Vec::new(),
            current: 0,
            generation: 0,
            policy,
        }
    }

    /// Advances to the next ring slot and evicts the entries left in it.
    ///
    /// Returns the number of evicted entries.
    pub fn begin_generation(&mut self) -> usize {
        self.generation += 1;
        self.current = (self.current + 1) % self.rings.len();

        let mut cursor = self.rings[self.current].head.take();
        self.rings[self.current].tail = None;

        let mut evicted = 0;
        while let Some(index) = cursor {
            let entry = &mut self.entries[index];
            cursor = entry.next.take();
            entry.prev = None;
            entry.ring = None;
            let key = entry.key;

            self.index.remove(&key);
            match self.policy {
                EvictionPolicy::Recycle => self.vacant.push(index),
                EvictionPolicy::Destroy => drop(self.entries.free(index)),
            }
            evicted += 1;
        }

        if evicted > 0 {
            log::trace!("Generation {} evicted {} entries", self.generation, evicted);
        }
        evicted
    }

    /// Looks up `key` and promotes a hit to the current generation.
    pub fn find(&mut self, key: u64) -> Option<&mut T> {
        let index = *self.index.get(&key)?;
        if self.entries[index].ring != Some(self.current) {
            self.unlink(index);
            self.link(index);
        }
        Some(&mut self.entries[index].value)
    }

    /// Looks up `key` without touching it.
    pub fn get(&self, key: u64) -> Option<&T> {
        let index = *self.index.get(&key)?;
        Some(&self.entries[index].value)
    }

    pub fn contains(&self, key: u64) -> bool {
        self.index.contains_key(&key)
    }

    /// Stores `value` under `key` in a newly allocated entry.
    ///
    /// Fails if `key` is already cached; one key maps to one entry.
    pub fn insert_new(&mut self, key: u64, value: T) -> Result<&mut T, RenderError> {
        if self.contains(key) {
            return Err(RenderError::DuplicateCacheKey { key });
        }

        let index = self.entries.allocate(Entry {
            key,
            ring: None,
            prev: None,
            next: None,
            value,
        })?;
        self.link(index);
        self.index.insert(key, index);

        Ok(&mut self.entries[index].value)
    }

    /// Re-keys a vacant entry to `key`. Its value still holds whatever it held before.
    ///
    /// Returns `None` when no vacant entry is left.
    pub fn insert_vacant(&mut self, key: u64) -> Result<Option<&mut T>, RenderError> {
        if self.contains(key) {
            return Err(RenderError::DuplicateCacheKey { key });
        }

        let Some(index) = self.vacant.pop() else {
            return Ok(None);
        };
        self.entries[index].key = key;
        self.link(index);
        self.index.insert(key, index);

        Ok(Some(&mut self.entries[index].value))
    }

    /// Adds a value that is not yet associated with any key.
    pub fn push_vacant(&mut self, value: T) -> Result<(), RenderError> {
        let index = self.entries.allocate(Entry {
            key: 0,
            ring: None,
            prev: None,
            next: None,
            value,
        })?;
        self.vacant.push(index);
        Ok(())
    }

    /// Number of keyed entries.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn vacant_len(&self) -> usize {
        self.vacant.len()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn ring_depth(&self) -> usize {
        self.rings.len()
    }

    /// Removes every entry, keyed and vacant, and returns their values.
    pub fn drain(&mut self) -> Vec<T> {
        let indices: Vec<PoolIndex> = self
            .index
            .drain()
            .map(|(_, index)| index)
            .chain(self.vacant.drain(..))
            .collect();
        self.rings.fill(RingList::default());

        indices
            .into_iter()
            .filter_map(|index| self.entries.free(index))
            .map(|entry| entry.value)
            .collect()
    }

    fn link(&mut self, index: PoolIndex) {
        let ring = self.current;
        let tail = self.rings[ring].tail;

        let entry = &mut self.entries[index];
        entry.ring = Some(ring);
        entry.prev = tail;
        entry.next = None;

        match tail {
            Some(tail) => self.entries[tail].next = Some(index),
            None => self.rings[ring].head = Some(index),
        }
        self.rings[ring].tail = Some(index);
    }

    fn unlink(&mut self, index: PoolIndex) {
        let entry = &mut self.entries[index];
        let Some(ring) = entry.ring.take() else {
            return;
        };
        let prev = entry.prev.take();
        let next = entry.next.take();

        match prev {
            Some(prev) => self.entries[prev].next = next,
            None => self.rings[ring].head = next,
        }
        match next {
            Some(next) => self.entries[next].prev = prev,
            None => self.rings[ring].tail = prev,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    #[test]
    fn untouched_entry_expires_after_ring_depth_generations() {
        let mut cache = TemporalCache::new(8, EvictionPolicy::Destroy);
        for key in 1..=9u64 {
            cache.begin_generation();
            cache.insert_new(key, key * 10).unwrap();
        }

        assert!(cache.find(1).is_none());
        for key in 2..=9u64 {
            assert_eq!(cache.find(key).copied(), Some(key * 10), "key {key}");
        }
    }

    #[test]
    fn find_resets_the_deadline() {
        let mut cache = TemporalCache::new(4, EvictionPolicy::Destroy);
        cache.insert_new(1, ()).unwrap();

        for _ in 0..3 {
            cache.begin_generation();
        }
        assert!(cache.find(1).is_some());

        for _ in 0..3 {
            cache.begin_generation();
        }
        assert!(cache.contains(1));

        cache.begin_generation();
        assert!(!cache.contains(1));
    }

    #[test]
    fn recycled_entries_keep_their_value() {
        let mut cache = TemporalCache::new(2, EvictionPolicy::Recycle);
        cache.insert_new(1, "set-a").unwrap();
        cache.begin_generation();
        assert_eq!(cache.begin_generation(), 1);

        assert_eq!(cache.len(), 0);
        assert_eq!(cache.vacant_len(), 1);
        assert_eq!(cache.insert_vacant(2).unwrap().copied(), Some("set-a"));
        assert_eq!(cache.get(2).copied(), Some("set-a"));
        assert!(cache.insert_vacant(3).unwrap().is_none());
    }

    #[test]
    fn destroy_policy_drops_values() {
        let tracker = std::rc::Rc::new(());
        let mut cache = TemporalCache::new(1, EvictionPolicy::Destroy);
        cache.insert_new(5, tracker.clone()).unwrap();
        assert_eq!(std::rc::Rc::strong_count(&tracker), 2);

        cache.begin_generation();
        assert_eq!(std::rc::Rc::strong_count(&tracker), 1);
        assert_eq!(cache.vacant_len(), 0);
    }

    #[test]
    fn pushed_vacants_are_handed_out() {
        let mut cache = TemporalCache::new(8, EvictionPolicy::Recycle);
        for value in 0..3 {
            cache.push_vacant(value).unwrap();
        }
        let mut seen: Vec<i32> = (10..13).map(|key| *cache.insert_vacant(key).unwrap().unwrap()).collect();
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let mut cache = TemporalCache::new(4, EvictionPolicy::Recycle);
        cache.insert_new(7, 1).unwrap();
        cache.push_vacant(2).unwrap();

        assert_eq!(cache.insert_new(7, 3).unwrap_err(), RenderError::DuplicateCacheKey { key: 7 });
        assert_eq!(cache.insert_vacant(7).unwrap_err(), RenderError::DuplicateCacheKey { key: 7 });

        // The original entry and the vacant one are untouched.
        assert_eq!(cache.find(7).copied(), Some(1));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.vacant_len(), 1);
    }

    #[test]
    fn drain_returns_keyed_and_vacant_values() {
        let mut cache = TemporalCache::new(2, EvictionPolicy::Recycle);
        cache.insert_new(1, 1).unwrap();
        cache.push_vacant(2).unwrap();
        cache.begin_generation();
        cache.insert_new(3, 3).unwrap();

        let mut values = cache.drain();
        values.sort();
        assert_eq!(values, vec![1, 2, 3]);
        assert!(cache.is_empty());
        assert_eq!(cache.vacant_len(), 0);
    }

    #[derive(Clone, Debug)]
    enum Op {
        Begin,
        Find(u64),
        Insert(u64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Begin),
            (0..12u64).prop_map(Op::Find),
            (0..12u64).prop_map(Op::Insert),
        ]
    }

    proptest! {
        #[test]
        fn entries_live_exactly_ring_depth_generations(
            depth in 1..6usize,
            ops in proptest::collection::vec(op(), 0..200),
        ) {
            let mut cache = TemporalCache::new(depth, EvictionPolicy::Recycle);
            let mut last_touch: HashMap<u64, u64> = HashMap::new();
            let mut generation = 0u64;

            for op in ops {
                match op {
                    Op::Begin => {
                        generation += 1;
                        let before = last_touch.len();
                        last_touch.retain(|_, touched| generation - *touched < depth as u64);
                        prop_assert_eq!(cache.begin_generation(), before - last_touch.len());
                    }
                    Op::Find(key) => {
                        let hit = cache.find(key).is_some();
                        prop_assert_eq!(hit, last_touch.contains_key(&key));
                        if hit {
                            last_touch.insert(key, generation);
                        }
                    }
                    Op::Insert(key) => {
                        if !cache.contains(key) {
                            prop_assert!(!last_touch.contains_key(&key));
                            if cache.insert_vacant(key).unwrap().is_none() {
                                cache.insert_new(key, ()).unwrap();
                            }
                            last_touch.insert(key, generation);
                        }
                    }
                }
                prop_assert_eq!(cache.len(), last_touch.len());
            }
        }
    }
}
