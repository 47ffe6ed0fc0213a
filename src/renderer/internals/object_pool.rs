//! Block-allocated object storage with stable slot addresses.
//!
//! An [`ObjectPool`] bump-allocates slots out of blocks whose size doubles
//! each time the pool grows. Blocks are never moved or released before the
//! pool itself is dropped, so a slot keeps its address for as long as the
//! object in it is alive. Freed slots go onto a vacant list and are handed
//! out again before the pool grows.

use std::mem::MaybeUninit;
use std::ops::{Index, IndexMut};
use std::ptr::NonNull;

use parking_lot::{Mutex, MutexGuard};

use crate::renderer::error::RenderError;

/// Size of the first block. Every later block is twice the previous one.
pub const MIN_BLOCK_SIZE: usize = 64;

/// Location of a slot inside an [`ObjectPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PoolIndex {
    block: u32,
    slot: u32,
}

struct Block<T> {
    slots: NonNull<MaybeUninit<T>>,
    occupied: Vec<bool>,
}

impl<T> Block<T> {
    fn new(len: usize) -> Result<Self, RenderError> {
        let mut storage: Vec<MaybeUninit<T>> = Vec::new();
        storage
            .try_reserve_exact(len)
            .map_err(|_| RenderError::OutOfHostMemory)?;
        storage.resize_with(len, MaybeUninit::uninit);

        let slots = NonNull::from(Box::leak(storage.into_boxed_slice())).cast::<MaybeUninit<T>>();

        Ok(Self {
            slots,
            occupied: vec![false; len],
        })
    }

    fn len(&self) -> usize {
        self.occupied.len()
    }

    fn slot(&self, slot: usize) -> *mut T {
        debug_assert!(slot < self.len());
        // In bounds of the leaked boxed slice created in `new`.
        unsafe { self.slots.as_ptr().add(slot).cast::<T>() }
    }
}

impl<T> Drop for Block<T> {
    fn drop(&mut self) {
        for (slot, occupied) in self.occupied.iter().enumerate() {
            if *occupied {
                unsafe { std::ptr::drop_in_place(self.slot(slot)) };
            }
        }

        let slice = std::ptr::slice_from_raw_parts_mut(self.slots.as_ptr(), self.len());
        drop(unsafe { Box::from_raw(slice) });
    }
}

/// Single-threaded arena of `T` with stable addresses and a free list.
pub struct ObjectPool<T> {
    blocks: Vec<Block<T>>,
    vacant: Vec<PoolIndex>,
    live: usize,
}

// Slots are only reached through `&self`/`&mut self`, like a `Vec<T>`.
unsafe impl<T: Send> Send for ObjectPool<T> {}
unsafe impl<T: Sync> Sync for ObjectPool<T> {}

impl<T> Default for ObjectPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ObjectPool<T> {
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            vacant: Vec::new(),
            live: 0,
        }
    }

    /// Moves `value` into a free slot, growing the arena if none is left.
    pub fn allocate(&mut self, value: T) -> Result<PoolIndex, RenderError> {
        self.allocate_with(|_| value)
    }

    /// Like [`allocate`](Self::allocate), but builds the value from the index it will live at.
    pub fn allocate_with(&mut self, init: impl FnOnce(PoolIndex) -> T) -> Result<PoolIndex, RenderError> {
        let index = match self.vacant.pop() {
            Some(index) => index,
            None => {
                self.grow()?;
                self.vacant.pop().ok_or(RenderError::OutOfHostMemory)?
            }
        };

        let block = &mut self.blocks[index.block as usize];
        unsafe { block.slot(index.slot as usize).write(init(index)) };
        block.occupied[index.slot as usize] = true;
        self.live += 1;

        Ok(index)
    }

    /// Moves the object out of its slot and returns the slot to the free list.
    ///
    /// Returns `None` if the slot is not occupied.
    pub fn free(&mut self, index: PoolIndex) -> Option<T> {
        let block = self.blocks.get_mut(index.block as usize)?;
        let occupied = block.occupied.get_mut(index.slot as usize)?;
        if !*occupied {
            return None;
        }
        *occupied = false;

        let value = unsafe { block.slot(index.slot as usize).read() };
        self.vacant.push(index);
        self.live -= 1;

        Some(value)
    }

    pub fn get(&self, index: PoolIndex) -> Option<&T> {
        self.slot_ptr(index).map(|ptr| unsafe { &*ptr.as_ptr() })
    }

    pub fn get_mut(&mut self, index: PoolIndex) -> Option<&mut T> {
        self.slot_ptr(index).map(|ptr| unsafe { &mut *ptr.as_ptr() })
    }

    /// Address of a live object. Stays valid until the object is freed or the pool is dropped.
    pub fn slot_ptr(&self, index: PoolIndex) -> Option<NonNull<T>> {
        let block = self.blocks.get(index.block as usize)?;
        if !*block.occupied.get(index.slot as usize)? {
            return None;
        }
        NonNull::new(block.slot(index.slot as usize))
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Total number of slots across all blocks.
    pub fn capacity(&self) -> usize {
        self.blocks.iter().map(Block::len).sum()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    fn grow(&mut self) -> Result<(), RenderError> {
        let block_index = self.blocks.len();
        let len = u32::try_from(block_index)
            .ok()
            .and_then(|shift| MIN_BLOCK_SIZE.checked_shl(shift))
            .filter(|len| *len <= u32::MAX as usize)
            .ok_or(RenderError::OutOfHostMemory)?;

        self.vacant
            .try_reserve(len)
            .map_err(|_| RenderError::OutOfHostMemory)?;
        self.blocks.push(Block::new(len)?);

        log::debug!("Object pool grew to {} blocks ({} slots)", self.blocks.len(), self.capacity());

        // Reverse order so the lowest slot is handed out first.
        self.vacant.extend((0..len).rev().map(|slot| PoolIndex {
            block: block_index as u32,
            slot: slot as u32,
        }));

        Ok(())
    }
}

impl<T> Index<PoolIndex> for ObjectPool<T> {
    type Output = T;

    fn index(&self, index: PoolIndex) -> &T {
        match self.get(index) {
            Some(value) => value,
            None => panic!("stale pool index {index:?}"),
        }
    }
}

impl<T> IndexMut<PoolIndex> for ObjectPool<T> {
    fn index_mut(&mut self, index: PoolIndex) -> &mut T {
        match self.get_mut(index) {
            Some(value) => value,
            None => panic!("stale pool index {index:?}"),
        }
    }
}

/// [`ObjectPool`] guarded by a single lock for use from several threads.
pub struct ThreadSafeObjectPool<T> {
    inner: Mutex<ObjectPool<T>>,
}

impl<T> Default for ThreadSafeObjectPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ThreadSafeObjectPool<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ObjectPool::new()),
        }
    }

    pub fn allocate(&self, value: T) -> Result<PoolIndex, RenderError> {
        self.inner.lock().allocate(value)
    }

    pub fn allocate_with(&self, init: impl FnOnce(PoolIndex) -> T) -> Result<PoolIndex, RenderError> {
        self.inner.lock().allocate_with(init)
    }

    pub fn free(&self, index: PoolIndex) -> Option<T> {
        self.inner.lock().free(index)
    }

    pub fn slot_ptr(&self, index: PoolIndex) -> Option<NonNull<T>> {
        self.inner.lock().slot_ptr(index)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity()
    }

    pub fn lock(&self) -> MutexGuard<'_, ObjectPool<T>> {
        self.inner.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn first_block_has_minimum_size() {
        let mut pool = ObjectPool::new();
        pool.allocate(1u32).unwrap();
        assert_eq!(pool.capacity(), MIN_BLOCK_SIZE);
        assert_eq!(pool.block_count(), 1);
    }

    #[test]
    fn blocks_double_when_full() {
        let mut pool = ObjectPool::new();
        for i in 0..(MIN_BLOCK_SIZE + 1) {
            pool.allocate(i).unwrap();
        }
        assert_eq!(pool.block_count(), 2);
        assert_eq!(pool.capacity(), MIN_BLOCK_SIZE * 3);

        for i in 0..(MIN_BLOCK_SIZE * 2) {
            pool.allocate(i).unwrap();
        }
        assert_eq!(pool.block_count(), 3);
        assert_eq!(pool.capacity(), MIN_BLOCK_SIZE * 7);
    }

    #[test]
    fn addresses_survive_growth() {
        let mut pool = ObjectPool::new();
        let first = pool.allocate(String::from("first")).unwrap();
        let before = pool.slot_ptr(first).unwrap();

        for i in 0..(MIN_BLOCK_SIZE * 4) {
            pool.allocate(i.to_string()).unwrap();
        }

        assert_eq!(pool.slot_ptr(first).unwrap(), before);
        assert_eq!(pool[first], "first");
    }

    #[test]
    fn freed_slot_is_reused_before_growing() {
        let mut pool = ObjectPool::new();
        let a = pool.allocate(1).unwrap();
        let _b = pool.allocate(2).unwrap();
        assert_eq!(pool.free(a), Some(1));
        assert_eq!(pool.len(), 1);

        let c = pool.allocate(3).unwrap();
        assert_eq!(c, a);
        assert_eq!(pool[c], 3);
        assert_eq!(pool.block_count(), 1);
    }

    #[test]
    fn double_free_is_rejected() {
        let mut pool = ObjectPool::new();
        let a = pool.allocate(7).unwrap();
        assert_eq!(pool.free(a), Some(7));
        assert_eq!(pool.free(a), None);
        assert!(pool.get(a).is_none());
    }

    #[test]
    fn drop_runs_destructors_of_live_objects() {
        let tracker = Rc::new(());
        {
            let mut pool = ObjectPool::new();
            for _ in 0..10 {
                pool.allocate(tracker.clone()).unwrap();
            }
            let freed = pool.allocate(tracker.clone()).unwrap();
            drop(pool.free(freed));
            assert_eq!(Rc::strong_count(&tracker), 11);
        }
        assert_eq!(Rc::strong_count(&tracker), 1);
    }

    #[test]
    fn allocate_with_sees_its_own_index() {
        let mut pool = ObjectPool::new();
        let index = pool.allocate_with(|index| index).unwrap();
        assert_eq!(pool[index], index);
    }

    #[test]
    fn thread_safe_pool_is_shared_across_threads() {
        let pool = std::sync::Arc::new(ThreadSafeObjectPool::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|i| pool.allocate(t * 1000 + i).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let indices: Vec<_> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        assert_eq!(pool.len(), 400);

        let mut unique = indices.clone();
        unique.sort_by_key(|i| (i.block, i.slot));
        unique.dedup();
        assert_eq!(unique.len(), indices.len());
    }
}
