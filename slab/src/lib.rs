//! Thread-aware slab memory allocators for freestanding environments.
//!
//! Two pool types are exposed, sharing the same observable contract —
//! `allocate`/`deallocate`/`reallocate`/`get_size` — but differing in
//! internal architecture:
//!
//! - [`sharded`]: a lock-free, per-thread-owned pool that tolerates
//!   cross-thread deallocation.
//! - [`classic`]: a jemalloc-inspired bucketed pool with a superblock
//!   layout, optional poisoning, optional allocation tracing, and a
//!   large-object fallback.
//!
//! Both are generic over a [`policy::MapPolicy`] supplying page-granular
//! virtual memory; the classic pool additionally recognizes the optional
//! [`policy::PoisonPolicy`]/[`policy::TracePolicy`] capabilities behind the
//! `poison`/`trace` Cargo features.

#![no_std]

#[cfg(test)]
extern crate std;

pub mod classic;
pub mod policy;
pub mod sharded;
pub mod trace;

pub use policy::MapPolicy;
