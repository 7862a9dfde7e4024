//! Lock-free, per-thread-owned slab pool that tolerates cross-thread
//! deallocation.
//!
//! Size classes are the nine powers of two from 16 B to 4096 B; anything
//! larger is served as a single dedicated chunk. A chunk is owned by
//! exactly the pool that created it — only the owner touches its
//! non-atomic bookkeeping — while objects freed by any other pool instance
//! land on a compare-and-swap-managed "threaded" free list that the owner
//! periodically drains back into rotation.

mod bucket;
mod chunk;
mod pool;

pub use pool::{
    bucket_index, size_of_bucket, Pool, CHUNK_BOUNDARY, MAX_SIZE_CLASS, MIN_SIZE_CLASS,
    NUM_SIZE_CLASSES, PAGE_SIZE, REACTIVATE_THRESHOLD,
};
