//! Bounded-retry spin lock: a thin wrapper over [`spin::Mutex`] that adds
//! the design's "timeout returns failure to the caller rather than
//! deadlocking" rule (see Concurrency & Resource Model). `spin::Mutex`
//! alone spins forever; every shared structure named there (frame bitmap,
//! valloc contexts, the kmalloc arena, the VFS mount table, each pipe)
//! goes through this wrapper instead of the bare `spin` type.

use spin::{Mutex, MutexGuard};

const DEFAULT_RETRIES: u32 = 100_000;

pub struct BoundedSpinlock<T> {
    inner: Mutex<T>,
}

impl<T> BoundedSpinlock<T> {
    pub const fn new(value: T) -> Self {
        BoundedSpinlock { inner: Mutex::new(value) }
    }

    /// Acquires the lock, retrying up to [`DEFAULT_RETRIES`] times. Returns
    /// `None` rather than spinning forever if it never becomes free.
    pub fn lock(&self) -> Option<MutexGuard<'_, T>> {
        self.lock_bounded(DEFAULT_RETRIES)
    }

    pub fn lock_bounded(&self, retries: u32) -> Option<MutexGuard<'_, T>> {
        for _ in 0..retries {
            if let Some(guard) = self.inner.try_lock() {
                return Some(guard);
            }
            core::hint::spin_loop();
        }
        None
    }
}
