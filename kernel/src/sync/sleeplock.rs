//! Sleeping mutex.
//!
//! A spinlock protects the `locked` flag; a contended acquire releases the
//! spinlock and sleeps on the lock's address as a wait channel. The holder
//! pid is recorded for diagnostics. A thread force-terminated while holding
//! a sleeplock leaks it; the recorded holder makes that visible.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use spin::Mutex;

struct Inner {
    locked: bool,
    holder: i32,
}

/// A mutex whose acquirer suspends until release.
pub struct SleepLock<T> {
    inner: Mutex<Inner>,
    name: &'static str,
    data: UnsafeCell<T>,
}

// Data access is serialized by the locked flag.
unsafe impl<T: Send> Sync for SleepLock<T> {}
unsafe impl<T: Send> Send for SleepLock<T> {}

/// Exclusive access to the data of a [`SleepLock`]; released on drop.
pub struct SleepLockGuard<'a, T> {
    lock: &'a SleepLock<T>,
}

impl<T> SleepLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            inner: Mutex::new(Inner {
                locked: false,
                holder: 0,
            }),
            name,
            data: UnsafeCell::new(data),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The wait channel token for this lock.
    fn channel(&self) -> usize {
        self as *const _ as usize
    }

    /// Acquire the lock, sleeping while it is held elsewhere.
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        loop {
            let mut inner = self.inner.lock();
            if !inner.locked {
                inner.locked = true;
                inner.holder = current_holder_id();
                return SleepLockGuard { lock: self };
            }

            #[cfg(all(target_arch = "x86_64", target_os = "none"))]
            {
                let chan = self.channel();
                crate::sched::sleep_with(chan, move || drop(inner));
            }
            #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
            {
                let _ = self.channel();
                drop(inner);
                ::std::thread::yield_now();
            }
        }
    }

    /// True if the calling thread currently holds the lock.
    pub fn holding(&self) -> bool {
        let inner = self.inner.lock();
        inner.locked && inner.holder == current_holder_id()
    }

    fn unlock(&self) {
        let mut inner = self.inner.lock();
        inner.locked = false;
        inner.holder = 0;
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        crate::sched::wakeup(self.channel());
    }

    /// Raw pointer to the protected data.
    ///
    /// # Safety
    /// The caller must guarantee no guard exists and none can be created
    /// concurrently (e.g. a cache entry with refcount zero, claimed under
    /// the cache's own lock).
    pub unsafe fn data_ptr(&self) -> *mut T {
        self.data.get()
    }
}

fn current_holder_id() -> i32 {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        crate::sched::current_pid().unwrap_or(0)
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        1
    }
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
