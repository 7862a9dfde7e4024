//! One bucket per size class: a mutex-protected head slab plus the
//! red-black tree of other partially-full slabs, ordered so the lowest
//! address becomes the next head (reducing external fragmentation, as in
//! jemalloc).

use core::ptr;

use frigg_support::TicketMutex;

use super::frame::SlabFrame;
use super::rbtree::RbTree;

pub struct BucketState {
    pub head_slb: *mut SlabFrame,
    pub partial_tree: RbTree<SlabFrame>,
}

// SAFETY: all access to `head_slb`/`partial_tree` is through the bucket's
// `TicketMutex`, which provides the necessary exclusion.
unsafe impl Send for BucketState {}
unsafe impl Sync for BucketState {}

pub struct Bucket {
    pub object_size: usize,
    pub state: TicketMutex<BucketState>,
}

impl Bucket {
    pub const fn new(object_size: usize) -> Self {
        Bucket {
            object_size,
            state: TicketMutex::new(BucketState {
                head_slb: ptr::null_mut(),
                partial_tree: RbTree::new(),
            }),
        }
    }
}
