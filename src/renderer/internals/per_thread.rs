//! Per-worker storage addressed by explicit worker tokens.
//!
//! A renderer hands out one [`WorkerToken`] per worker index when it is
//! created. Mutable access to a [`PerThread`] slot requires `&mut` on the
//! token, so two threads can never reach the same slot at once and the hot
//! path needs no lock.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::renderer::error::RenderError;

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// Identifies the renderer that issued a set of worker tokens.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OwnerId(u64);

impl OwnerId {
    pub fn next() -> Self {
        Self(NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Exclusive right to use one worker index of a renderer.
#[derive(Debug)]
pub struct WorkerToken {
    owner: OwnerId,
    index: usize,
}

impl WorkerToken {
    pub(crate) fn issue(owner: OwnerId, count: usize) -> Vec<Self> {
        (0..count).map(|index| Self { owner, index }).collect()
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

pub struct PerThread<T> {
    owner: OwnerId,
    slots: Box<[UnsafeCell<T>]>,
}

// Slot `i` is only reachable through `&mut WorkerToken` with index `i`, or through `&mut self`.
unsafe impl<T: Send> Sync for PerThread<T> {}

impl<T> PerThread<T> {
    pub fn new(owner: OwnerId, count: usize, mut init: impl FnMut(usize) -> T) -> Self {
        Self {
            owner,
            slots: (0..count).map(|index| UnsafeCell::new(init(index))).collect(),
        }
    }

    pub fn try_new<E>(
        owner: OwnerId,
        count: usize,
        mut init: impl FnMut(usize) -> Result<T, E>,
    ) -> Result<Self, E> {
        let slots = (0..count)
            .map(|index| init(index).map(UnsafeCell::new))
            .collect::<Result<Box<[_]>, E>>()?;
        Ok(Self { owner, slots })
    }

    pub fn get_mut<'a>(&'a self, token: &'a mut WorkerToken) -> Result<&'a mut T, RenderError> {
        if token.owner != self.owner {
            return Err(RenderError::ForeignWorkerToken);
        }
        let slot = self
            .slots
            .get(token.index)
            .ok_or(RenderError::WorkerIndexOutOfRange {
                index: token.index,
                count: self.slots.len(),
            })?;
        Ok(unsafe { &mut *slot.get() })
    }

    pub fn slots_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut().map(UnsafeCell::get_mut)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_reach_their_own_slot() {
        let owner = OwnerId::next();
        let storage = PerThread::new(owner, 3, |index| index * 100);
        let mut tokens = WorkerToken::issue(owner, 3);

        *storage.get_mut(&mut tokens[1]).unwrap() += 1;
        assert_eq!(*storage.get_mut(&mut tokens[1]).unwrap(), 101);
        assert_eq!(*storage.get_mut(&mut tokens[2]).unwrap(), 200);
    }

    #[test]
    fn foreign_tokens_are_rejected() {
        let storage = PerThread::new(OwnerId::next(), 1, |_| ());
        let mut tokens = WorkerToken::issue(OwnerId::next(), 1);
        assert_eq!(storage.get_mut(&mut tokens[0]), Err(RenderError::ForeignWorkerToken));
    }

    #[test]
    fn extra_tokens_are_out_of_range() {
        let owner = OwnerId::next();
        let storage = PerThread::new(owner, 1, |_| 0u8);
        let mut tokens = WorkerToken::issue(owner, 2);
        assert_eq!(
            storage.get_mut(&mut tokens[1]),
            Err(RenderError::WorkerIndexOutOfRange { index: 1, count: 1 })
        );
    }

    #[test]
    fn workers_mutate_in_parallel() {
        let owner = OwnerId::next();
        let storage = PerThread::new(owner, 4, |_| 0u64);
        let tokens = WorkerToken::issue(owner, 4);

        std::thread::scope(|scope| {
            for mut token in tokens {
                let storage = &storage;
                scope.spawn(move || {
                    for _ in 0..1000 {
                        *storage.get_mut(&mut token).unwrap() += 1;
                    }
                });
            }
        });

        let mut storage = storage;
        assert!(storage.slots_mut().all(|count| *count == 1000));
    }
}
