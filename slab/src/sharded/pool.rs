use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicU64, Ordering};

use frigg_support::{align_up_usize, ceil_log2_usize, log_debug};

use crate::policy::MapPolicy;

use super::bucket::Bucket;
use super::chunk::{
    ChunkHeader, ChunkState, ChunkType, CompressedAddress, FreeObject, MAX_OBJECTS_IN_CHUNK,
    NULL_ADDRESS,
};

pub const PAGE_SIZE: usize = 4096;
pub const CHUNK_BOUNDARY: usize = 1 << 18;
pub const CHUNK_SIZE: usize = CHUNK_BOUNDARY;
pub const REACTIVATE_THRESHOLD: u32 = 8;

const MIN_SHIFT: u32 = 4;
const MAX_SHIFT: u32 = 12;
pub const MIN_SIZE_CLASS: usize = 1 << MIN_SHIFT;
pub const MAX_SIZE_CLASS: usize = 1 << MAX_SHIFT;
pub const NUM_SIZE_CLASSES: usize = (MAX_SHIFT - MIN_SHIFT + 1) as usize;

/// Maps a request to the index of the smallest size class that fits it.
pub fn bucket_index(size: usize) -> usize {
    assert!(size <= MAX_SIZE_CLASS);
    if size < MIN_SIZE_CLASS {
        0
    } else {
        (ceil_log2_usize(size) - MIN_SHIFT) as usize
    }
}

/// Inverse of [`bucket_index`].
pub const fn size_of_bucket(index: usize) -> usize {
    MIN_SIZE_CLASS << index
}

/// Byte offset of a large object's data past its chunk header, page-aligned
/// so that large objects never share a page with allocator metadata.
const fn large_data_offset() -> usize {
    let header = core::mem::size_of::<ChunkHeader>();
    (header + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// A lock-free, per-thread-owned slab pool.
///
/// Objects allocated from one `Pool` instance may be freed through a
/// *different* `Pool` instance (typically one owned by another thread), as
/// long as both use an identical `P`. A pool is not internally
/// synchronized against concurrent calls on the *same* instance: `allocate`
/// and `deallocate` both take `&mut self`, so the borrow checker enforces
/// the single-owner-thread discipline the algorithm depends on; only the
/// cross-instance (foreign free) path touches shared state, through atomics
/// alone.
///
/// # Pinning
/// Chunks created by a pool store a raw pointer back into that pool's
/// bucket array (`ChunkHeader::bkt`) and the pool's own address
/// (`ChunkHeader::owner`), captured at chunk-creation time. A `Pool` must
/// therefore not move in memory after its first successful `allocate()`
/// call — keep it in a `Box`, a thread-local, or a stack slot that lives
/// for the remainder of the thread.
pub struct Pool<P: MapPolicy> {
    policy: P,
    buckets: [Bucket; NUM_SIZE_CLASSES],
}

impl<P: MapPolicy> Pool<P> {
    pub fn new(policy: P) -> Self {
        Pool {
            policy,
            buckets: core::array::from_fn(|i| Bucket::new(size_of_bucket(i))),
        }
    }

    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size > MAX_SIZE_CLASS {
            self.large_allocate(size)
        } else {
            let idx = bucket_index(size);
            self.slab_allocate(idx)
        }
    }

    pub fn deallocate(&mut self, object: Option<NonNull<u8>>) {
        let Some(obj) = object else { return };
        let chunk_ptr = Self::chunk_header_of(obj);
        let kind = unsafe { (*chunk_ptr).kind };
        match kind {
            ChunkType::Large => self.large_free(chunk_ptr),
            ChunkType::Slab => {
                let owner = self as *const Self as usize;
                let chunk_owner = unsafe { (*chunk_ptr).owner };
                if chunk_owner == owner {
                    Self::slab_deallocate_owned(chunk_ptr, obj);
                } else {
                    Self::slab_deallocate_threaded(chunk_ptr, obj);
                }
            }
        }
    }

    pub fn reallocate(&mut self, object: Option<NonNull<u8>>, new_size: usize) -> Option<NonNull<u8>> {
        let Some(obj) = object else {
            return self.allocate(new_size);
        };
        if new_size == 0 {
            self.deallocate(Some(obj));
            return None;
        }

        let chunk_ptr = Self::chunk_header_of(obj);
        let (fits, capacity) = unsafe {
            match (*chunk_ptr).kind {
                ChunkType::Large => {
                    let cap = (*chunk_ptr).extent_size - large_data_offset();
                    (new_size <= cap, cap)
                }
                ChunkType::Slab => {
                    let cap = (*(*chunk_ptr).bkt).object_size;
                    (new_size <= cap, cap)
                }
            }
        };
        if fits {
            return Some(obj);
        }

        let new_obj = self.allocate(new_size)?;
        unsafe {
            ptr::copy_nonoverlapping(obj.as_ptr(), new_obj.as_ptr(), capacity.min(new_size));
        }
        self.deallocate(Some(obj));
        Some(new_obj)
    }

    pub fn get_size(&self, object: Option<NonNull<u8>>) -> usize {
        let Some(obj) = object else { return 0 };
        let chunk_ptr = Self::chunk_header_of(obj);
        unsafe {
            match (*chunk_ptr).kind {
                ChunkType::Large => (*chunk_ptr).extent_size - large_data_offset(),
                ChunkType::Slab => (*(*chunk_ptr).bkt).object_size,
            }
        }
    }

    fn chunk_header_of(object: NonNull<u8>) -> *mut ChunkHeader {
        let addr = object.as_ptr() as usize;
        let aligned = addr & !(CHUNK_BOUNDARY - 1);
        aligned as *mut ChunkHeader
    }

    fn slab_chunk_create(&mut self, idx: usize) -> Option<()> {
        assert!(self.buckets[idx].head_chunk.is_null());

        let extent_size = align_up_usize(CHUNK_SIZE + CHUNK_BOUNDARY - 1, PAGE_SIZE);
        let extent_ptr = self.policy.map(extent_size)?;

        let raw_addr = extent_ptr.as_ptr() as usize;
        let aligned_addr = align_up_usize(raw_addr, CHUNK_BOUNDARY);
        let chunk_ptr = aligned_addr as *mut ChunkHeader;

        let owner = self as *const Self as usize;
        let object_size = self.buckets[idx].object_size;
        let bkt_ptr = &mut self.buckets[idx] as *mut Bucket;

        unsafe {
            chunk_ptr.write(ChunkHeader {
                kind: ChunkType::Slab,
                owner,
                bkt: bkt_ptr,
                owner_free: NULL_ADDRESS,
                owner_count: 0,
                state: AtomicU64::new(ChunkState::EMPTY_ACTIVE.pack()),
                next_in_list: ptr::null_mut(),
                extent_ptr,
                extent_size,
            });

            let chunk = &mut *chunk_ptr;
            let first_offset = align_up_usize(core::mem::size_of::<ChunkHeader>(), object_size);

            let mut prev: CompressedAddress = NULL_ADDRESS;
            let mut count: usize = 0;
            let mut offset = first_offset;
            while offset + object_size <= CHUNK_SIZE {
                let obj = chunk.object_from_address(offset as CompressedAddress);
                obj.cast::<FreeObject>()
                    .as_ptr()
                    .write(FreeObject { next: prev });
                prev = offset as CompressedAddress;
                count += 1;
                offset += object_size;
            }
            assert!(count <= MAX_OBJECTS_IN_CHUNK);
            chunk.owner_free = prev;
            chunk.owner_count = count as u32;
        }

        log_debug!("sharded slab: created chunk for object_size={}", object_size);
        self.buckets[idx].head_chunk = chunk_ptr;
        Some(())
    }

    fn slab_chunk_update(bkt: &mut Bucket) {
        if bkt.owner_pending_list.is_null() {
            if bkt.threaded_pending_list.load(Ordering::Relaxed).is_null() {
                return;
            }
            let stolen = bkt.threaded_pending_list.swap(ptr::null_mut(), Ordering::Acquire);
            assert!(!stolen.is_null());
            bkt.owner_pending_list = stolen;
        }

        let chunk_ptr = bkt.owner_pending_list;
        unsafe {
            bkt.owner_pending_list = (*chunk_ptr).next_in_list;
            (*chunk_ptr).next_in_list = bkt.active_list;
        }
        bkt.active_list = chunk_ptr;
    }

    fn slab_chunk_refresh(&mut self, idx: usize) -> Option<()> {
        assert!(self.buckets[idx].head_chunk.is_null());

        if self.buckets[idx].active_list.is_null() {
            return self.slab_chunk_create(idx);
        }

        let chunk_ptr = self.buckets[idx].active_list;
        unsafe {
            self.buckets[idx].active_list = (*chunk_ptr).next_in_list;

            let chunk = &mut *chunk_ptr;
            let prev = ChunkState::unpack(
                chunk.state.swap(ChunkState::EMPTY_ACTIVE.pack(), Ordering::Acquire),
            );
            assert!(!prev.inactive);

            if prev.threaded_free != NULL_ADDRESS {
                let mut tail_ca = prev.threaded_free;
                let mut objs_seen: u32 = 1;
                loop {
                    let tail = chunk.object_from_address(tail_ca).cast::<FreeObject>();
                    let next = (*tail.as_ptr()).next;
                    if next == NULL_ADDRESS {
                        break;
                    }
                    tail_ca = next;
                    objs_seen += 1;
                }
                assert_eq!(objs_seen, prev.threaded_count);

                let tail = chunk.object_from_address(tail_ca).cast::<FreeObject>();
                (*tail.as_ptr()).next = chunk.owner_free;
                chunk.owner_free = prev.threaded_free;
                chunk.owner_count += prev.threaded_count;
            }
            assert!(chunk.owner_free != NULL_ADDRESS);
            assert!(chunk.owner_count != 0);
        }

        self.buckets[idx].head_chunk = chunk_ptr;
        Some(())
    }

    fn slab_chunk_retire(bkt: &mut Bucket) {
        assert!(!bkt.head_chunk.is_null());
        let chunk_ptr = bkt.head_chunk;
        bkt.head_chunk = ptr::null_mut();

        let chunk = unsafe { &*chunk_ptr };
        let mut current_bits = chunk.state.load(Ordering::Relaxed);
        loop {
            let current = ChunkState::unpack(current_bits);
            if current.threaded_count >= REACTIVATE_THRESHOLD {
                unsafe {
                    (*chunk_ptr).next_in_list = bkt.active_list;
                }
                bkt.active_list = chunk_ptr;
                return;
            }

            let new_state = ChunkState {
                threaded_free: current.threaded_free,
                threaded_count: current.threaded_count,
                inactive: true,
            };
            match chunk.state.compare_exchange_weak(
                current_bits,
                new_state.pack(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current_bits = observed,
            }
        }
    }

    fn slab_allocate(&mut self, idx: usize) -> Option<NonNull<u8>> {
        Self::slab_chunk_update(&mut self.buckets[idx]);

        if self.buckets[idx].head_chunk.is_null() {
            self.slab_chunk_refresh(idx)?;
        }
        assert!(!self.buckets[idx].head_chunk.is_null());

        let chunk_ptr = self.buckets[idx].head_chunk;
        let obj = unsafe {
            let chunk = &mut *chunk_ptr;
            assert!(chunk.owner_free != NULL_ADDRESS);
            assert!(chunk.owner_count != 0);

            let ca = chunk.owner_free;
            let obj = chunk.object_from_address(ca);
            let next = (*obj.cast::<FreeObject>().as_ptr()).next;
            chunk.owner_free = next;
            chunk.owner_count -= 1;
            obj
        };

        if unsafe { (*chunk_ptr).owner_free } == NULL_ADDRESS {
            Self::slab_chunk_retire(&mut self.buckets[idx]);
        }

        Some(obj)
    }

    fn slab_deallocate_owned(chunk_ptr: *mut ChunkHeader, object: NonNull<u8>) {
        unsafe {
            let chunk = &mut *chunk_ptr;
            let ca = chunk.object_to_address(object);
            object
                .cast::<FreeObject>()
                .as_ptr()
                .write(FreeObject { next: chunk.owner_free });
            chunk.owner_free = ca;
            chunk.owner_count += 1;

            if chunk.owner_count < REACTIVATE_THRESHOLD {
                return;
            }

            let mut current_bits = chunk.state.load(Ordering::Relaxed);
            loop {
                let current = ChunkState::unpack(current_bits);
                if !current.inactive {
                    return;
                }
                let new_state = ChunkState {
                    threaded_free: current.threaded_free,
                    threaded_count: current.threaded_count,
                    inactive: false,
                };
                match chunk.state.compare_exchange_weak(
                    current_bits,
                    new_state.pack(),
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(observed) => current_bits = observed,
                }
            }

            let bkt = &mut *chunk.bkt;
            chunk.next_in_list = bkt.owner_pending_list;
            bkt.owner_pending_list = chunk_ptr;
        }
    }

    /// Push `object` onto `chunk`'s threaded (CAS-managed) free list. Safe
    /// to call from any thread: every write this function performs to the
    /// chunk is either atomic, or (the `next_in_list` link) only reachable
    /// by the single caller whose CAS wins the inactive→active transition
    /// for this chunk, which the loop below guarantees is unique.
    fn slab_deallocate_threaded(chunk_ptr: *mut ChunkHeader, object: NonNull<u8>) {
        let chunk = unsafe { &*chunk_ptr };
        let ca = chunk.object_to_address(object);

        let mut current_bits = chunk.state.load(Ordering::Relaxed);
        let transitioned;
        loop {
            let current = ChunkState::unpack(current_bits);
            unsafe {
                object
                    .cast::<FreeObject>()
                    .as_ptr()
                    .write(FreeObject { next: current.threaded_free });
            }
            let mut new_state = ChunkState {
                threaded_free: ca,
                threaded_count: current.threaded_count + 1,
                inactive: current.inactive,
            };
            if current.inactive && new_state.threaded_count >= REACTIVATE_THRESHOLD {
                new_state.inactive = false;
            }
            match chunk.state.compare_exchange_weak(
                current_bits,
                new_state.pack(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    transitioned = current.inactive && !new_state.inactive;
                    break;
                }
                Err(observed) => current_bits = observed,
            }
        }

        if !transitioned {
            return;
        }

        unsafe {
            let bkt = &*chunk.bkt;
            let mut current_list = bkt.threaded_pending_list.load(Ordering::Relaxed);
            loop {
                (*chunk_ptr).next_in_list = current_list;
                match bkt.threaded_pending_list.compare_exchange_weak(
                    current_list,
                    chunk_ptr,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(observed) => current_list = observed,
                }
            }
        }
    }

    fn large_allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let first_offset = large_data_offset();
        let data_size = first_offset + size;
        let extent_size = align_up_usize(data_size + CHUNK_BOUNDARY - 1, PAGE_SIZE);
        let extent_ptr = self.policy.map(extent_size)?;

        let raw_addr = extent_ptr.as_ptr() as usize;
        let aligned_addr = align_up_usize(raw_addr, CHUNK_BOUNDARY);
        let chunk_ptr = aligned_addr as *mut ChunkHeader;
        let owner = self as *const Self as usize;

        unsafe {
            chunk_ptr.write(ChunkHeader {
                kind: ChunkType::Large,
                owner,
                bkt: ptr::null_mut(),
                owner_free: NULL_ADDRESS,
                owner_count: 0,
                state: AtomicU64::new(ChunkState::EMPTY_ACTIVE.pack()),
                next_in_list: ptr::null_mut(),
                extent_ptr,
                extent_size,
            });
        }

        log_debug!("sharded slab: large allocation of {} bytes", size);
        let data_addr = aligned_addr + first_offset;
        Some(unsafe { NonNull::new_unchecked(data_addr as *mut u8) })
    }

    fn large_free(&mut self, chunk_ptr: *mut ChunkHeader) {
        let (extent_ptr, extent_size) = unsafe { ((*chunk_ptr).extent_ptr, (*chunk_ptr).extent_size) };
        unsafe { self.policy.unmap(extent_ptr, extent_size) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::ptr::NonNull;
    use std::boxed::Box;
    use std::vec::Vec;

    struct MmapPolicy;

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

    fn boxed_pool() -> Box<Pool<MmapPolicy>> {
        Box::new(Pool::new(MmapPolicy))
    }

    #[test]
    fn bucket_index_boundaries() {
        assert_eq!(bucket_index(16), 0);
        assert_eq!(bucket_index(4096), 8);
        assert_eq!(bucket_index(1), 0);
    }

    #[test]
    fn multiple_sizes() {
        let mut pool = boxed_pool();
        for s in 0..=30u32 {
            let size = 1usize << s;
            let obj = pool.allocate(size).expect("allocation failed");
            unsafe { ptr::write_bytes(obj.as_ptr(), 0xFF, size) };
            pool.deallocate(Some(obj));
        }
    }

    #[test]
    fn exhaust_chunk() {
        let mut pool = boxed_pool();
        for _ in 0..5 {
            let mut objs = Vec::with_capacity(20_000);
            for _ in 0..20_000 {
                let obj = pool.allocate(128).expect("allocation failed");
                unsafe { ptr::write_bytes(obj.as_ptr(), 0x11, 128) };
                objs.push(obj);
            }
            for obj in objs {
                pool.deallocate(Some(obj));
            }
        }
    }

    #[test]
    fn cross_thread_deallocation() {
        use std::thread;

        let mut pool_a = boxed_pool();
        let mut objs = Vec::with_capacity(20_000);
        for _ in 0..20_000 {
            objs.push(pool_a.allocate(128).unwrap().as_ptr() as usize);
        }

        let handle = thread::spawn(move || {
            let mut pool_b = boxed_pool();
            for addr in &objs {
                pool_b.deallocate(Some(unsafe { NonNull::new_unchecked(*addr as *mut u8) }));
            }
        });
        handle.join().unwrap();

        let obj = pool_a.allocate(128).expect("owner pool must still allocate");
        unsafe { ptr::write_bytes(obj.as_ptr(), 0x22, 128) };
    }

    #[test]
    fn reallocate_grow_then_shrink() {
        for &size in &[241usize, 1_048_561usize] {
            let mut pool = boxed_pool();
            let p = pool.allocate(size).unwrap();
            unsafe { ptr::write_bytes(p.as_ptr(), 0x42, size) };

            let grow_size = size + 15;
            let p_grow = pool.reallocate(Some(p), grow_size).unwrap();
            unsafe {
                ptr::write_bytes(p_grow.as_ptr().add(size), 0x42, grow_size - size);
                for i in 0..grow_size {
                    assert_eq!(*p_grow.as_ptr().add(i), 0x42);
                }
            }

            let p_shrink = pool.reallocate(Some(p_grow), size / 2).unwrap();
            assert_eq!(p_shrink, p_grow);

            assert!(pool.reallocate(Some(p_shrink), 0).is_none());
        }
    }

    #[test]
    fn get_size_reports_class_and_extent() {
        let mut pool = boxed_pool();
        assert_eq!(pool.get_size(None), 0);

        let small_size = 30usize;
        let p_small = pool.allocate(small_size).unwrap();
        assert!(pool.get_size(Some(p_small)) >= small_size);

        let large_size = 1usize << 20;
        let p_large = pool.allocate(large_size).unwrap();
        assert!(pool.get_size(Some(p_large)) >= large_size);
    }
}
