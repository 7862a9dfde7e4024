//! Diagnostic logging for freestanding callers.
//!
//! All output funnels through a single **backend** function pointer, exactly
//! like a host's `frg_log` hook: the backend receives the pre-formatted
//! arguments for one line and is responsible for writing it out atomically.
//! Until a backend is registered, log calls are silently dropped rather than
//! touching any hardware — there is no serial-port fallback here, since this
//! crate does not own any I/O.

use core::fmt;
use core::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

static CURRENT_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

#[inline(always)]
fn is_enabled(level: LogLevel) -> bool {
    level as u8 <= CURRENT_LEVEL.load(Ordering::Relaxed)
}

/// Signature of a log backend: receives one pre-formatted line (no trailing
/// newline) and must emit it atomically so lines from different threads do
/// not interleave.
pub type LogBackend = fn(fmt::Arguments<'_>);

static BACKEND: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Register the host's log backend. Typically called once during setup.
pub fn register_backend(backend: LogBackend) {
    BACKEND.store(backend as *mut (), Ordering::Release);
}

pub fn set_level(level: LogLevel) {
    CURRENT_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn get_level() -> LogLevel {
    LogLevel::from_raw(CURRENT_LEVEL.load(Ordering::Relaxed))
}

/// Dispatch a line through the active backend. No-op if none is registered.
#[inline]
pub fn log_args(level: LogLevel, args: fmt::Arguments<'_>) {
    if !is_enabled(level) {
        return;
    }
    let ptr = BACKEND.load(Ordering::Acquire);
    if ptr.is_null() {
        return;
    }
    // SAFETY: `register_backend` only stores valid `LogBackend` fn pointers,
    // which are the same size as `*mut ()` on all supported targets.
    let backend: LogBackend = unsafe { core::mem::transmute(ptr) };
    backend(args);
}

#[macro_export]
macro_rules! log {
    ($level:expr, $($arg:tt)*) => {{
        $crate::log::log_args($level, ::core::format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::log::log_args($crate::log::LogLevel::Error, ::core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::log::log_args($crate::log::LogLevel::Warn, ::core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::log::log_args($crate::log::LogLevel::Info, ::core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::log::log_args($crate::log::LogLevel::Debug, ::core::format_args!($($arg)*))
    };
}
