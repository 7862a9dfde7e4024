mod bucket;
mod frame;
mod pool;
mod rbtree;
mod size_class;

pub use pool::{Pool, PAGE_SIZE, SB_SIZE};
pub use size_class::{bucket_to_size, size_to_bucket, MAX_BUCKET_SIZE, NUM_BUCKETS, TINY_SIZES};
