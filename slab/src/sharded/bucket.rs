//! Per-size-class bookkeeping: the chunk currently being carved from, the
//! list of other active chunks, and the two pending lists chunks pass
//! through on their way back into rotation.

use core::ptr;
use core::sync::atomic::AtomicPtr;

use super::chunk::ChunkHeader;

pub struct Bucket {
    pub object_size: usize,
    pub head_chunk: *mut ChunkHeader,
    pub active_list: *mut ChunkHeader,
    pub owner_pending_list: *mut ChunkHeader,
    pub threaded_pending_list: AtomicPtr<ChunkHeader>,
}

impl Bucket {
    pub const fn new(object_size: usize) -> Self {
        Bucket {
            object_size,
            head_chunk: ptr::null_mut(),
            active_list: ptr::null_mut(),
            owner_pending_list: ptr::null_mut(),
            threaded_pending_list: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

// SAFETY: the non-atomic fields are only ever touched by the owning pool
// under its `&mut self` discipline; `threaded_pending_list` is the only
// field foreign pools access, and it is a plain atomic pointer.
unsafe impl Send for Bucket {}
unsafe impl Sync for Bucket {}
