//! Intrusively reference-counted handles to objects living in an [`ObjectPool`].
//!
//! The count lives inside the pooled node next to the object. When the last
//! [`Handle`] goes away the node is freed back to its pool and the object is
//! passed to the pool's deleter, which decides what happens to the wrapped
//! hardware object (recycle, destroy, defer to the end of a frame, ...).

use std::cell::Cell;
use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering, fence};

use crate::renderer::error::RenderError;
use crate::renderer::internals::object_pool::{PoolIndex, ThreadSafeObjectPool};

/// Counter policy for [`Handle`].
pub trait RefCount {
    /// A counter holding a single reference.
    fn one() -> Self;
    fn acquire(&self);
    /// Drops one reference. Returns `true` if it was the last one.
    fn release(&self) -> bool;
    fn count(&self) -> usize;
}

/// Non-atomic counter. Handles using it stay on one thread.
pub struct LocalCount(Cell<usize>);

impl RefCount for LocalCount {
    fn one() -> Self {
        Self(Cell::new(1))
    }

    fn acquire(&self) {
        self.0.set(self.0.get() + 1);
    }

    fn release(&self) -> bool {
        let count = self.0.get() - 1;
        self.0.set(count);
        count == 0
    }

    fn count(&self) -> usize {
        self.0.get()
    }
}

/// Atomic counter, same ordering scheme as `Arc`.
pub struct AtomicCount(AtomicUsize);

impl RefCount for AtomicCount {
    fn one() -> Self {
        Self(AtomicUsize::new(1))
    }

    fn acquire(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    fn release(&self) -> bool {
        if self.0.fetch_sub(1, Ordering::Release) != 1 {
            return false;
        }
        fence(Ordering::Acquire);
        true
    }

    fn count(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

struct Node<T, C> {
    count: C,
    index: PoolIndex,
    pool: Arc<PoolShared<T, C>>,
    value: T,
}

struct PoolShared<T, C> {
    slots: ThreadSafeObjectPool<Node<T, C>>,
    deleter: Box<dyn Fn(T) + Send + Sync>,
}

/// Allocates [`Handle`]s. Cloning the pool shares the same storage.
pub struct HandlePool<T, C: RefCount = AtomicCount> {
    shared: Arc<PoolShared<T, C>>,
}

impl<T, C: RefCount> Clone for HandlePool<T, C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T, C: RefCount> HandlePool<T, C> {
    /// Creates a pool whose objects are handed to `deleter` once their last handle drops.
    pub fn new(deleter: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                slots: ThreadSafeObjectPool::new(),
                deleter: Box::new(deleter),
            }),
        }
    }

    pub fn allocate(&self, value: T) -> Result<Handle<T, C>, RenderError> {
        let mut slots = self.shared.slots.lock();
        let index = slots.allocate_with(|index| Node {
            count: C::one(),
            index,
            pool: self.shared.clone(),
            value,
        })?;
        let node = slots.slot_ptr(index).ok_or(RenderError::OutOfHostMemory)?;

        Ok(Handle { node })
    }

    /// Number of objects that still have at least one handle.
    pub fn live(&self) -> usize {
        self.shared.slots.len()
    }
}

/// Shared reference to a pooled object.
pub struct Handle<T, C: RefCount = AtomicCount> {
    node: NonNull<Node<T, C>>,
}

// A handle only exposes `&T`, and the count is shared between threads only if `C` is.
unsafe impl<T: Send + Sync, C: RefCount + Send + Sync> Send for Handle<T, C> {}
unsafe impl<T: Send + Sync, C: RefCount + Send + Sync> Sync for Handle<T, C> {}

impl<T, C: RefCount> Handle<T, C> {
    fn node(&self) -> &Node<T, C> {
        // The node outlives every handle pointing at it.
        unsafe { self.node.as_ref() }
    }

    pub fn strong_count(this: &Self) -> usize {
        this.node().count.count()
    }

    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.node == other.node
    }
}

impl<T, C: RefCount> Clone for Handle<T, C> {
    fn clone(&self) -> Self {
        self.node().count.acquire();
        Self { node: self.node }
    }
}

impl<T, C: RefCount> Deref for Handle<T, C> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.node().value
    }
}

impl<T: fmt::Debug, C: RefCount> fmt::Debug for Handle<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handle").field(&**self).finish()
    }
}

impl<T, C: RefCount> Drop for Handle<T, C> {
    fn drop(&mut self) {
        let (pool, index) = {
            let node = self.node();
            if !node.count.release() {
                return;
            }
            (node.pool.clone(), node.index)
        };

        let freed = pool.slots.free(index);
        if let Some(node) = freed {
            let Node { value, .. } = node;
            (pool.deleter)(value);
        }
    }
}
