#![no_std]

pub mod bitops;
pub mod log;
pub mod spinlock;

pub use bitops::{
    align_down_u64, align_down_usize, align_up_u64, align_up_usize, ceil_log2_u32,
    ceil_log2_u64, ceil_log2_usize, floor_log2_u32, floor_log2_u64, floor_log2_usize,
};
pub use log::{LogBackend, LogLevel, get_level, log_args, register_backend, set_level};
pub use spinlock::{TicketMutex, TicketMutexGuard};
