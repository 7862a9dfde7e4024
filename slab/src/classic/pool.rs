//! Jemalloc-inspired bucketed allocator.
//!
//! Unlike [`crate::sharded::Pool`], which is owned per-thread, a single
//! `Pool` here is meant to be reached concurrently through a shared
//! reference: every field that can change after construction lives behind
//! its own [`TicketMutex`], and the mapping policy's `map`/`unmap` are
//! always called with the relevant mutex released.

use core::ptr::{self, NonNull};

use frigg_support::TicketMutex;

use crate::policy::{MapPolicy, PoisonPolicy, TracePolicy};

use super::bucket::Bucket;
use super::frame::{Frame, FrameKind, FreeNode, SlabFrame};
use super::rbtree::{RbState, RbTree};
use super::size_class::{bucket_to_size, size_to_bucket, MAX_BUCKET_SIZE, NUM_BUCKETS};

/// Page granularity the mapping policy operates at.
pub const PAGE_SIZE: usize = 4096;
/// Superblock alignment boundary; also the content size of a freshly carved
/// slab.
pub const SB_SIZE: usize = 1 << 18;
const SLAB_CONTENT_SIZE: usize = SB_SIZE;
/// Large frames reserve one page ahead of the object for their header.
const HUGE_PADDING: usize = PAGE_SIZE;

struct TreeState {
    #[cfg(feature = "track-regions")]
    frame_tree: RbTree<Frame>,
    used_pages: usize,
}

pub struct Pool<P: MapPolicy + PoisonPolicy + TracePolicy> {
    policy: P,
    tree: TicketMutex<TreeState>,
    buckets: [Bucket; NUM_BUCKETS],
}

// SAFETY: every field that outlives construction is behind a `TicketMutex`;
// the buckets array and `policy` are themselves `Sync` whenever `P` is.
unsafe impl<P: MapPolicy + PoisonPolicy + TracePolicy + Sync> Sync for Pool<P> {}

impl<P: MapPolicy + PoisonPolicy + TracePolicy> Pool<P> {
    pub fn new(policy: P) -> Self {
        Pool {
            policy,
            tree: TicketMutex::new(TreeState {
                #[cfg(feature = "track-regions")]
                frame_tree: RbTree::new(),
                used_pages: 0,
            }),
            buckets: core::array::from_fn(|i| Bucket::new(bucket_to_size(i))),
        }
    }

    pub fn used_pages(&self) -> usize {
        self.tree.lock().used_pages
    }

    pub fn allocate(&self, length: usize) -> Option<NonNull<u8>> {
        let length = if length == 0 { 1 } else { length };

        if length <= MAX_BUCKET_SIZE {
            self.slab_allocate(size_to_bucket(length), length)
        } else {
            let area_size = (length + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
            self.large_allocate(area_size, length)
        }
    }

    pub fn reallocate(&self, pointer: Option<NonNull<u8>>, new_size: usize) -> Option<NonNull<u8>> {
        let p = match pointer {
            None => return self.allocate(new_size),
            Some(p) => p,
        };
        if new_size == 0 {
            self.free(Some(p));
            return None;
        }

        let sup = self.frame_of(p.as_ptr() as usize);
        let current_size = unsafe {
            match (*sup).kind {
                FrameKind::Slab => {
                    let slb = sup as *mut SlabFrame;
                    if self.reallocate_in_slab(slb, p, new_size) {
                        return Some(p);
                    }
                    bucket_to_size((*slb).index)
                }
                FrameKind::Large => {
                    if self.reallocate_huge(sup, p, new_size) {
                        return Some(p);
                    }
                    (*sup).length
                }
            }
        };
        assert!(current_size < new_size);

        let new_p = self.allocate(new_size)?;
        unsafe {
            ptr::copy_nonoverlapping(p.as_ptr(), new_p.as_ptr(), current_size);
        }
        self.free(Some(p));
        Some(new_p)
    }

    /// Frees a pointer produced by `allocate`/`reallocate` without
    /// re-checking the caller's notion of its size.
    pub fn free(&self, pointer: Option<NonNull<u8>>) {
        crate::trace::emit(&self.policy, b'f', pointer.map_or(0, |p| p.as_ptr() as usize), None);

        let Some(p) = pointer else {
            return;
        };

        let sup = self.frame_of(p.as_ptr() as usize);
        unsafe {
            match (*sup).kind {
                FrameKind::Slab => self.free_in_slab(sup as *mut SlabFrame, p),
                FrameKind::Large => self.free_huge(sup, p),
            }
        }
    }

    /// Frees a pointer allocated with a known size, asserting `size` fits
    /// the object's size class (not necessarily its exact requested size:
    /// a grow-in-place `reallocate` widens the class without narrowing the
    /// assertion, so this check is lenient by design).
    pub fn deallocate(&self, pointer: Option<NonNull<u8>>, size: usize) {
        crate::trace::emit(&self.policy, b'f', pointer.map_or(0, |p| p.as_ptr() as usize), None);

        let Some(p) = pointer else {
            return;
        };

        let sup = self.frame_of(p.as_ptr() as usize);
        unsafe {
            match (*sup).kind {
                FrameKind::Slab => {
                    let slb = sup as *mut SlabFrame;
                    assert!(size <= bucket_to_size((*slb).index));
                    self.free_in_slab(slb, p);
                }
                FrameKind::Large => {
                    assert!(size <= (*sup).length);
                    self.free_huge(sup, p);
                }
            }
        }
    }

    pub fn get_size(&self, pointer: Option<NonNull<u8>>) -> usize {
        let Some(p) = pointer else {
            return 0;
        };

        let sup = self.frame_of(p.as_ptr() as usize);
        unsafe {
            match (*sup).kind {
                FrameKind::Slab => bucket_to_size((*(sup as *mut SlabFrame)).index),
                FrameKind::Large => (*sup).length,
            }
        }
    }

    fn frame_of(&self, address: usize) -> *mut Frame {
        ((address - 1) & !(SB_SIZE - 1)) as *mut Frame
    }

    //----------------------------------------------------------------
    // Slab handling.
    //----------------------------------------------------------------

    fn slab_allocate(&self, index: usize, length: usize) -> Option<NonNull<u8>> {
        let bkt = &self.buckets[index];
        let mut guard = bkt.state.lock();

        let object: *mut FreeNode = if !guard.head_slb.is_null() {
            let slb = guard.head_slb;
            unsafe {
                let obj = (*slb).available;
                assert!(!obj.is_null());
                assert!((*slb).frame.contains(obj as usize));
                (*slb).available = (*obj).link;
                (*slb).num_reserved += 1;

                if (*slb).available.is_null() {
                    guard.partial_tree.remove(slb);
                    guard.head_slb = guard.partial_tree.first();
                }
                obj
            }
        } else {
            // Call into the policy without holding the bucket lock.
            drop(guard);

            let slb = self.construct_slab(index)?;

            let obj = unsafe {
                let obj = (*slb).available;
                assert!(!obj.is_null());
                (*slb).available = (*obj).link;
                (*slb).num_reserved += 1;
                obj
            };

            {
                let mut tree = self.tree.lock();
                #[cfg(feature = "track-regions")]
                unsafe {
                    tree.frame_tree.insert(&mut (*slb).frame as *mut Frame);
                }
                tree.used_pages += (unsafe { (*slb).frame.length } + HUGE_PADDING) / PAGE_SIZE;
            }

            guard = bkt.state.lock();
            unsafe {
                assert!(!(*slb).available.is_null());
                guard.partial_tree.insert(slb);
                if guard.head_slb.is_null() || (*slb).frame.address < (*guard.head_slb).frame.address {
                    guard.head_slb = slb;
                }
            }
            obj
        };

        drop(guard);

        // SAFETY: `object` was just popped live from a slab's freelist.
        let object_ptr = unsafe { NonNull::new_unchecked(object as *mut u8) };
        self.policy.poison(object_ptr, core::mem::size_of::<FreeNode>());
        self.policy.unpoison(object_ptr, length);

        crate::trace::emit(&self.policy, b'a', object as usize, Some(length));

        NonNull::new(object as *mut u8)
    }

    fn reallocate_in_slab(&self, slb: *mut SlabFrame, p: NonNull<u8>, new_size: usize) -> bool {
        let item_size = bucket_to_size(unsafe { (*slb).index });
        assert!(unsafe { (*slb).frame.contains(p.as_ptr() as usize) });

        if new_size > item_size {
            return false;
        }

        self.policy.unpoison_expand(p, item_size);
        self.policy.poison(p, item_size);
        self.policy.unpoison(p, new_size);
        true
    }

    fn free_in_slab(&self, slb: *mut SlabFrame, p: NonNull<u8>) {
        let item_size = bucket_to_size(unsafe { (*slb).index });
        assert!(unsafe { (*slb).frame.contains(p.as_ptr() as usize) });

        self.policy.unpoison_expand(p, item_size);
        self.policy.poison(p, item_size);
        self.policy.unpoison(p, core::mem::size_of::<FreeNode>());

        let object = p.as_ptr() as *mut FreeNode;
        let index = unsafe { (*slb).index };
        let bkt = &self.buckets[index];
        let mut guard = bkt.state.lock();

        unsafe {
            let reinsert = (*slb).available.is_null();
            assert!((*slb).num_reserved > 0);

            assert!((*slb).available.is_null() || (*slb).frame.contains((*slb).available as usize));
            (*object).link = (*slb).available;
            (*slb).available = object;

            if reinsert {
                guard.partial_tree.insert(slb);
                if guard.head_slb.is_null() || (*slb).frame.address < (*guard.head_slb).frame.address {
                    guard.head_slb = slb;
                }
            }
        }
    }

    fn construct_slab(&self, index: usize) -> Option<*mut SlabFrame> {
        let (extent_base, extent_size, base) = self.policy.map_aligned(SLAB_CONTENT_SIZE, SB_SIZE)?;
        let address = base.as_ptr() as usize;

        let item_size = bucket_to_size(index);
        let mut overhead = 0usize;
        while overhead < core::mem::size_of::<SlabFrame>() {
            overhead += item_size;
        }
        assert!(overhead < SLAB_CONTENT_SIZE);

        self.policy.unpoison(base, core::mem::size_of::<SlabFrame>());

        let slb = base.as_ptr() as *mut SlabFrame;
        unsafe {
            ptr::write(
                slb,
                SlabFrame {
                    frame: Frame {
                        kind: FrameKind::Slab,
                        sb_base: extent_base,
                        sb_reservation: extent_size,
                        address: address + overhead,
                        length: SLAB_CONTENT_SIZE - overhead,
                        #[cfg(feature = "track-regions")]
                        region_link: RbState::new(),
                    },
                    index,
                    num_reserved: 0,
                    available: ptr::null_mut(),
                    partial_link: RbState::new(),
                },
            );
        }

        let (length, content_base) = unsafe { ((*slb).frame.length, (*slb).frame.address) };
        let mut first: *mut FreeNode = ptr::null_mut();
        let mut off = 0usize;
        while off < length {
            let obj_addr = content_base + off;
            // SAFETY: `obj_addr` lies within the just-mapped extent.
            let obj_ptr = unsafe { NonNull::new_unchecked(obj_addr as *mut u8) };
            self.policy.unpoison(obj_ptr, core::mem::size_of::<FreeNode>());

            let obj = obj_addr as *mut FreeNode;
            unsafe {
                ptr::write(obj, FreeNode { link: first });
            }
            first = obj;
            off += item_size;
        }
        unsafe {
            (*slb).available = first;
        }

        Some(slb)
    }

    //----------------------------------------------------------------
    // Large superblock handling.
    //----------------------------------------------------------------

    fn large_allocate(&self, area_size: usize, length: usize) -> Option<NonNull<u8>> {
        let fra = self.construct_large(area_size)?;

        {
            let mut tree = self.tree.lock();
            #[cfg(feature = "track-regions")]
            unsafe {
                tree.frame_tree.insert(fra);
            }
            tree.used_pages += (area_size + HUGE_PADDING) / PAGE_SIZE;
        }

        let address = unsafe { (*fra).address };
        crate::trace::emit(&self.policy, b'a', address, Some(length));

        NonNull::new(address as *mut u8)
    }

    fn reallocate_huge(&self, sup: *mut Frame, p: NonNull<u8>, new_size: usize) -> bool {
        assert_eq!(unsafe { (*sup).address }, p.as_ptr() as usize);

        let length = unsafe { (*sup).length };
        if new_size > length {
            return false;
        }

        self.policy.unpoison_expand(p, length);
        self.policy.poison(p, length);
        self.policy.unpoison(p, new_size);
        true
    }

    fn free_huge(&self, sup: *mut Frame, p: NonNull<u8>) {
        assert_eq!(unsafe { (*sup).address }, p.as_ptr() as usize);

        {
            let mut tree = self.tree.lock();
            #[cfg(feature = "track-regions")]
            unsafe {
                tree.frame_tree.remove(sup);
            }
            tree.used_pages -= (unsafe { (*sup).length } + HUGE_PADDING) / PAGE_SIZE;
        }

        let sb_base = unsafe { (*sup).sb_base };
        let sb_reservation = unsafe { (*sup).sb_reservation };
        let obj_address = unsafe { (*sup).address };
        let obj_size = unsafe { (*sup).length };

        // Note: `sup` must not be dereferenced again once poisoned.
        self.policy.poison(unsafe { NonNull::new_unchecked(sup as *mut u8) }, core::mem::size_of::<Frame>());
        self.policy.poison(unsafe { NonNull::new_unchecked(obj_address as *mut u8) }, obj_size);

        unsafe {
            self.policy.unmap(sb_base, sb_reservation);
        }
    }

    fn construct_large(&self, area_size: usize) -> Option<*mut Frame> {
        assert!(area_size & (PAGE_SIZE - 1) == 0);

        let (extent_base, extent_size, base) = self.policy.map_aligned(area_size + HUGE_PADDING, SB_SIZE)?;
        let address = base.as_ptr() as usize;

        self.policy.unpoison(base, core::mem::size_of::<Frame>());
        self.policy.unpoison(
            unsafe { NonNull::new_unchecked((address + HUGE_PADDING) as *mut u8) },
            area_size,
        );

        let fra = base.as_ptr() as *mut Frame;
        unsafe {
            ptr::write(
                fra,
                Frame {
                    kind: FrameKind::Large,
                    sb_base: extent_base,
                    sb_reservation: extent_size,
                    address: address + HUGE_PADDING,
                    length: area_size,
                    #[cfg(feature = "track-regions")]
                    region_link: RbState::new(),
                },
            );
        }

        Some(fra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    pub(super) struct MmapPolicy;

    impl MapPolicy for MmapPolicy {
        fn map(&self, size: usize) -> Option<NonNull<u8>> {
            unsafe {
                let p = libc::mmap(
                    ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                );
                if p == libc::MAP_FAILED {
                    None
                } else {
                    NonNull::new(p as *mut u8)
                }
            }
        }

        unsafe fn unmap(&self, base: NonNull<u8>, size: usize) {
            unsafe {
                libc::munmap(base.as_ptr() as *mut core::ffi::c_void, size);
            }
        }
    }

    // Enabling a capability feature raises it to a crate-wide requirement
    // on every policy (see DESIGN.md Open Question 7), so the plain test
    // fixture needs a no-op impl whenever that feature is turned on for a
    // `cargo test` run that also exercises these non-feature-specific
    // tests.
    #[cfg(feature = "poison")]
    impl PoisonPolicy for MmapPolicy {
        fn poison(&self, _p: NonNull<u8>, _len: usize) {}
        fn unpoison(&self, _p: NonNull<u8>, _len: usize) {}
        fn unpoison_expand(&self, _p: NonNull<u8>, _len: usize) {}
    }

    #[cfg(feature = "trace")]
    impl TracePolicy for MmapPolicy {
        fn enable_trace(&self) -> bool {
            false
        }
        fn output_trace(&self, _buf: &[u8]) {}
        fn walk_stack(&self, _visit: &mut dyn FnMut(usize)) {}
    }

    #[test]
    fn multiple_sizes() {
        let pool = Pool::new(MmapPolicy);
        for shift in 0..31u32 {
            let size = 1usize << shift;
            let p = pool.allocate(size).expect("allocation failed");
            unsafe {
                ptr::write_bytes(p.as_ptr(), 0xFF, size);
            }
            assert!(pool.get_size(Some(p)) >= size);
            pool.free(Some(p));
        }
    }

    #[test]
    fn exhaust_one_bucket() {
        let pool = Pool::new(MmapPolicy);
        for _ in 0..5 {
            let mut ptrs = Vec::new();
            for _ in 0..20_000 {
                let p = pool.allocate(128).expect("allocation failed");
                unsafe {
                    ptr::write_bytes(p.as_ptr(), 0x11, 128);
                }
                ptrs.push(p);
            }
            for w in ptrs.windows(2) {
                assert_ne!(w[0], w[1]);
            }
            for p in ptrs {
                pool.free(Some(p));
            }
        }
    }

    #[test]
    fn reallocate_grow_then_shrink() {
        let pool = Pool::new(MmapPolicy);
        for &size in &[241usize, 1_048_561usize] {
            let p = pool.allocate(size).unwrap();
            unsafe {
                ptr::write_bytes(p.as_ptr(), 0x42, size);
            }

            let grown = pool.reallocate(Some(p), size + 15).unwrap();
            unsafe {
                ptr::write_bytes(grown.as_ptr().add(size), 0x42, 15);
                let bytes = core::slice::from_raw_parts(grown.as_ptr(), size + 15);
                assert!(bytes.iter().all(|&b| b == 0x42));
            }

            let shrunk = pool.reallocate(Some(grown), size / 2).unwrap();
            assert_eq!(shrunk, grown);

            assert!(pool.reallocate(Some(shrunk), 0).is_none());
        }
    }

    #[test]
    fn used_pages_tracks_slab_and_large_construction() {
        let pool = Pool::new(MmapPolicy);
        assert_eq!(pool.used_pages(), 0);

        let p = pool.allocate(32).unwrap();
        assert!(pool.used_pages() > 0);
        pool.free(Some(p));
    }
}

#[cfg(all(test, feature = "poison"))]
mod poison_tests {
    use super::tests::MmapPolicy;
    use super::*;
    use core::cell::RefCell;
    use std::vec::Vec;

    /// Tracks poisoned/unpoisoned state as a merged list of *unpoisoned*
    /// byte ranges, so a test can assert exactly which ranges are
    /// currently readable.
    struct IntervalPoisonPolicy {
        map: MmapPolicy,
        unpoisoned: RefCell<Vec<(usize, usize)>>,
    }

    impl IntervalPoisonPolicy {
        fn new() -> Self {
            IntervalPoisonPolicy {
                map: MmapPolicy,
                unpoisoned: RefCell::new(Vec::new()),
            }
        }

        fn has_exact_range(&self, start: usize, len: usize) -> bool {
            self.unpoisoned.borrow().iter().any(|&(s, l)| s == start && l == len)
        }
    }

    impl MapPolicy for IntervalPoisonPolicy {
        fn map(&self, size: usize) -> Option<NonNull<u8>> {
            self.map.map(size)
        }
        unsafe fn unmap(&self, base: NonNull<u8>, size: usize) {
            unsafe { self.map.unmap(base, size) }
        }
    }

    impl PoisonPolicy for IntervalPoisonPolicy {
        fn poison(&self, p: NonNull<u8>, len: usize) {
            let start = p.as_ptr() as usize;
            let end = start + len;
            let mut v = self.unpoisoned.borrow_mut();
            let mut next = Vec::new();
            for &(s, l) in v.iter() {
                let e = s + l;
                if e <= start || s >= end {
                    next.push((s, l));
                    continue;
                }
                if s < start {
                    next.push((s, start - s));
                }
                if e > end {
                    next.push((end, e - end));
                }
            }
            *v = next;
        }

        fn unpoison(&self, p: NonNull<u8>, len: usize) {
            if len == 0 {
                return;
            }
            let start = p.as_ptr() as usize;
            self.unpoisoned.borrow_mut().push((start, len));
        }

        fn unpoison_expand(&self, p: NonNull<u8>, len: usize) {
            self.unpoison(p, len);
        }
    }

    // Only needed to satisfy `Pool`'s bound when the `trace` feature is also
    // on; otherwise the blanket no-op impl in `policy.rs` already covers it.
    #[cfg(feature = "trace")]
    impl TracePolicy for IntervalPoisonPolicy {
        fn enable_trace(&self) -> bool {
            false
        }
        fn output_trace(&self, _buf: &[u8]) {}
        fn walk_stack(&self, _visit: &mut dyn FnMut(usize)) {}
    }

    #[test]
    fn allocate_then_free_transitions_poisoned_range() {
        let pool = Pool::new(IntervalPoisonPolicy::new());

        let p = pool.allocate(128).unwrap();
        assert!(pool.policy.has_exact_range(p.as_ptr() as usize, 128));

        pool.free(Some(p));
        assert!(!pool.policy.has_exact_range(p.as_ptr() as usize, 128));
    }
}

#[cfg(all(test, feature = "trace"))]
mod trace_tests {
    use super::tests::MmapPolicy;
    use super::*;
    use core::cell::RefCell;
    use std::vec::Vec;

    struct RecordingTracePolicy {
        map: MmapPolicy,
        out: RefCell<Vec<u8>>,
    }

    impl RecordingTracePolicy {
        fn new() -> Self {
            RecordingTracePolicy {
                map: MmapPolicy,
                out: RefCell::new(Vec::new()),
            }
        }
    }

    impl MapPolicy for RecordingTracePolicy {
        fn map(&self, size: usize) -> Option<NonNull<u8>> {
            self.map.map(size)
        }
        unsafe fn unmap(&self, base: NonNull<u8>, size: usize) {
            unsafe { self.map.unmap(base, size) }
        }
    }

    // Only needed to satisfy `Pool`'s bound when the `poison` feature is
    // also on; otherwise the blanket no-op impl in `policy.rs` covers it.
    #[cfg(feature = "poison")]
    impl PoisonPolicy for RecordingTracePolicy {
        fn poison(&self, _p: NonNull<u8>, _len: usize) {}
        fn unpoison(&self, _p: NonNull<u8>, _len: usize) {}
        fn unpoison_expand(&self, _p: NonNull<u8>, _len: usize) {}
    }

    impl TracePolicy for RecordingTracePolicy {
        fn enable_trace(&self) -> bool {
            true
        }
        fn output_trace(&self, buf: &[u8]) {
            self.out.borrow_mut().extend_from_slice(buf);
        }
        fn walk_stack(&self, visit: &mut dyn FnMut(usize)) {
            visit(0x1234);
        }
    }

    #[test]
    fn allocation_and_free_emit_matching_records() {
        let pool = Pool::new(RecordingTracePolicy::new());

        let p = pool.allocate(128).unwrap();
        {
            let out = pool.policy.out.borrow();
            assert_eq!(out.len(), 33);
            assert_eq!(out[0], b'a');
            assert_eq!(
                u64::from_le_bytes(out[1..9].try_into().unwrap()),
                p.as_ptr() as u64
            );
            assert_eq!(u64::from_le_bytes(out[9..17].try_into().unwrap()), 128);
            assert_eq!(u64::from_le_bytes(out[17..25].try_into().unwrap()), 0x1234);
            assert_eq!(
                u64::from_le_bytes(out[25..33].try_into().unwrap()),
                0xA5A5_A5A5_A5A5_A5A5
            );
        }
        pool.policy.out.borrow_mut().clear();

        pool.free(Some(p));
        let out = pool.policy.out.borrow();
        assert_eq!(out.len(), 25);
        assert_eq!(out[0], b'f');
        assert_eq!(
            u64::from_le_bytes(out[1..9].try_into().unwrap()),
            p.as_ptr() as u64
        );
        assert_eq!(u64::from_le_bytes(out[9..17].try_into().unwrap()), 0x1234);
        assert_eq!(
            u64::from_le_bytes(out[17..25].try_into().unwrap()),
            0xA5A5_A5A5_A5A5_A5A5
        );
    }
}
