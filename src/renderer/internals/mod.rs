//! "Internals" are the in-memory building blocks the contexts are made of.
//! They never talk to the hardware.

pub mod handle;
pub mod object_pool;
pub mod per_thread;
pub mod temporal_cache;
