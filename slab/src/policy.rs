//! External collaborator contracts.
//!
//! Neither pool owns a way to obtain memory from the environment: both are
//! generic over a `MapPolicy` that supplies page-granular `map`/`unmap`. The
//! classic pool additionally recognizes two optional capabilities —
//! poisoning and allocation tracing — gated behind the `poison` and `trace`
//! Cargo features respectively, so that a policy which implements neither
//! compiles a pool with zero overhead for them.

use core::ptr::NonNull;

use frigg_support::align_up_usize;

/// Page-granular virtual memory provider.
///
/// `map` returns `None` on failure (the allocator surfaces this as a null
/// allocation); `unmap` must accept exactly the `(base, size)` pair returned
/// by a prior successful `map`.
pub trait MapPolicy {
    fn map(&self, size: usize) -> Option<NonNull<u8>>;

    /// # Safety
    /// `base`/`size` must be exactly the pair returned by a `map` call that
    /// has not already been unmapped.
    unsafe fn unmap(&self, base: NonNull<u8>, size: usize);

    /// Request a region whose base is aligned to `align` (a power of two).
    ///
    /// Policies that can service this natively (e.g. a `mmap` variant that
    /// accepts an alignment hint) should override it. The default
    /// overallocates by `align` extra bytes and aligns up within that
    /// extent, which is what the classic pool falls back to when no native
    /// aligned-mapping support exists.
    ///
    /// Returns `(extent_base, extent_size, aligned_base)`.
    fn map_aligned(&self, size: usize, align: usize) -> Option<(NonNull<u8>, usize, NonNull<u8>)> {
        let reservation = size.saturating_add(align.saturating_sub(1));
        let extent = self.map(reservation)?;
        let aligned_addr = align_up_usize(extent.as_ptr() as usize, align);
        // SAFETY: aligned_addr lies within [extent, extent + reservation) and is non-null.
        let aligned = unsafe { NonNull::new_unchecked(aligned_addr as *mut u8) };
        Some((extent, reservation, aligned))
    }
}

/// Optional poisoning capability: mark ranges inaccessible to
/// debuggers/sanitizers while keeping them mapped. Used only by the classic
/// pool.
///
/// The trait itself is always in scope so `Pool` can name it as a bound
/// unconditionally; when the `poison` feature is off, a blanket impl below
/// supplies a no-op implementation for every `MapPolicy`, so a policy that
/// doesn't care about poisoning needs to write nothing extra.
pub trait PoisonPolicy {
    fn poison(&self, p: NonNull<u8>, len: usize);
    fn unpoison(&self, p: NonNull<u8>, len: usize);
    /// Reveal memory the allocator itself must touch while the region is
    /// still logically considered freed (e.g. to relink a freelist node).
    fn unpoison_expand(&self, p: NonNull<u8>, len: usize);
}

#[cfg(not(feature = "poison"))]
impl<P: MapPolicy> PoisonPolicy for P {
    fn poison(&self, _p: NonNull<u8>, _len: usize) {}
    fn unpoison(&self, _p: NonNull<u8>, _len: usize) {}
    fn unpoison_expand(&self, _p: NonNull<u8>, _len: usize) {}
}

/// Optional allocation tracing capability. Used only by the classic pool.
///
/// Same shape as [`PoisonPolicy`]: always in scope, with a no-op blanket
/// impl when the `trace` feature is off so `enable_trace` is always `false`
/// and no record is ever built.
pub trait TracePolicy {
    fn enable_trace(&self) -> bool;
    fn output_trace(&self, buf: &[u8]);
    /// Invoke `visit` with up to 12 return addresses, innermost frame first.
    /// Backends that cannot unwind may call `visit` zero times.
    fn walk_stack(&self, visit: &mut dyn FnMut(usize));
}

#[cfg(not(feature = "trace"))]
impl<P: MapPolicy> TracePolicy for P {
    fn enable_trace(&self) -> bool {
        false
    }
    fn output_trace(&self, _buf: &[u8]) {}
    fn walk_stack(&self, _visit: &mut dyn FnMut(usize)) {}
}
