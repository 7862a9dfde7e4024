//! A FIFO ticket-lock mutex for environments without an OS-provided mutex.
//!
//! This is the "mutex capability" external collaborators are expected to
//! supply: blocking `lock()`/`unlock()` over a 32-bit next/serving ticket
//! pair, acquiring on the serving side. Unlike a host-OS mutex this never
//! parks a thread — callers spin, so critical sections protected by it must
//! stay short.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// A ticket-based spinning mutex.
///
/// Each `lock()` call takes the next ticket via `fetch_add(1)` and spins
/// until `now_serving` matches it, guaranteeing FIFO acquisition order and
/// eliminating starvation under contention.
pub struct TicketMutex<T> {
    next_ticket: AtomicU32,
    now_serving: AtomicU32,
    poisoned: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: TicketMutex provides exclusive access through ticket-lock
// acquisition, making it safe to share across threads.
unsafe impl<T: Send> Send for TicketMutex<T> {}
unsafe impl<T: Send> Sync for TicketMutex<T> {}

pub struct TicketMutexGuard<'a, T> {
    mutex: &'a TicketMutex<T>,
}

impl<T> TicketMutex<T> {
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            next_ticket: AtomicU32::new(0),
            now_serving: AtomicU32::new(0),
            poisoned: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Force the lock open without a guard.
    ///
    /// # Safety
    /// Only safe when the caller knows no other thread holds the lock, e.g.
    /// during panic recovery after a held guard was lost.
    #[inline]
    pub unsafe fn force_unlock(&self) {
        self.now_serving
            .store(self.next_ticket.load(Ordering::Relaxed), Ordering::Release);
    }

    /// Same as `force_unlock`, but also marks the mutex poisoned so that
    /// later lockers can detect the protected data may be inconsistent.
    ///
    /// # Safety
    /// Same requirements as `force_unlock`.
    #[inline]
    pub unsafe fn poison_unlock(&self) {
        self.poisoned.store(true, Ordering::Release);
        self.now_serving
            .store(self.next_ticket.load(Ordering::Relaxed), Ordering::Release);
    }

    #[inline]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    #[inline]
    pub fn clear_poison(&self) {
        self.poisoned.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.next_ticket.load(Ordering::Relaxed) != self.now_serving.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn lock(&self) -> TicketMutexGuard<'_, T> {
        let my_ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);

        loop {
            let serving = self.now_serving.load(Ordering::Acquire);
            if serving == my_ticket {
                break;
            }
            let distance = my_ticket.wrapping_sub(serving);
            for _ in 0..distance.min(64) {
                spin_loop();
            }
        }

        TicketMutexGuard { mutex: self }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<TicketMutexGuard<'_, T>> {
        let current = self.now_serving.load(Ordering::Relaxed);
        if self
            .next_ticket
            .compare_exchange(
                current,
                current.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            Some(TicketMutexGuard { mutex: self })
        } else {
            None
        }
    }
}

impl<T> Deref for TicketMutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for TicketMutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for TicketMutexGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.mutex.now_serving.fetch_add(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock_roundtrip() {
        let m = TicketMutex::new(0usize);
        {
            let mut g = m.lock();
            *g += 1;
        }
        assert_eq!(*m.lock(), 1);
        assert!(!m.is_locked());
    }

    #[test]
    fn try_lock_fails_while_held() {
        let m = TicketMutex::new(());
        let g = m.lock();
        assert!(m.try_lock().is_none());
        drop(g);
        assert!(m.try_lock().is_some());
    }
}
