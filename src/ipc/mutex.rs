use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam::utils::Backoff;

use crate::util::os::{current_thread_id, futex};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// A mutex whose whole state is a few 32-bit words, so it works when it lives in memory shared by
/// several processes.
///
/// The all-zero bit pattern is a valid unlocked mutex, which is what the shared region hands out.
/// A mutex must not be copied or moved once another process may be using it; it is only ever
/// accessed through a reference into the shared mapping.
#[repr(C)]
pub struct InterProcessMutex {
    /// The futex word. `UNLOCKED` or `LOCKED`.
    state: AtomicU32,
    /// Threads blocked (or about to block) in the kernel on `state`.
    num_contenders: AtomicU32,
    /// Kernel thread id of the holder, or 0. Thread ids are unique across processes.
    owner: AtomicU32,
}

unsafe impl bytemuck::Zeroable for InterProcessMutex {}

impl InterProcessMutex {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
            num_contenders: AtomicU32::new(0),
            owner: AtomicU32::new(0),
        }
    }

    /// Acquire the mutex. Spins briefly, then sleeps on the futex word.
    pub fn lock(&self) -> InterProcessMutexGuard<'_> {
        let backoff = Backoff::new();
        loop {
            if self
                .state
                .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
            if !backoff.is_completed() {
                backoff.snooze();
                continue;
            }
            self.num_contenders.fetch_add(1, Ordering::SeqCst);
            futex::wait(&self.state, LOCKED);
            self.num_contenders.fetch_sub(1, Ordering::SeqCst);
        }
        self.owner.store(current_thread_id(), Ordering::Relaxed);
        InterProcessMutexGuard { mutex: self }
    }

    /// Acquire the mutex if nobody holds it.
    pub fn try_lock(&self) -> Option<InterProcessMutexGuard<'_>> {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::SeqCst, Ordering::Relaxed)
            .ok()
            .map(|_| {
                self.owner.store(current_thread_id(), Ordering::Relaxed);
                InterProcessMutexGuard { mutex: self }
            })
    }

    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) == LOCKED
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.is_locked() && self.owner.load(Ordering::Relaxed) == current_thread_id()
    }

    pub fn assert_held(&self) {
        if !self.is_held_by_current_thread() {
            fatal!(
                "Mutex at {:p} is not held by thread {} (owner {})",
                self,
                current_thread_id(),
                self.owner.load(Ordering::Relaxed)
            );
        }
    }

    fn unlock(&self) {
        debug_assert!(self.is_held_by_current_thread());
        self.owner.store(0, Ordering::Relaxed);
        // The store and the contender check must not be reordered, or we could miss a thread that
        // saw LOCKED and is about to sleep.
        self.state.store(UNLOCKED, Ordering::SeqCst);
        if self.num_contenders.load(Ordering::SeqCst) > 0 {
            futex::wake(&self.state, 1);
        }
    }
}

impl Default for InterProcessMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InterProcessMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterProcessMutex")
            .field("locked", &self.is_locked())
            .field("owner", &self.owner.load(Ordering::Relaxed))
            .field("contenders", &self.num_contenders.load(Ordering::Relaxed))
            .finish()
    }
}

/// Releases the mutex when dropped.
#[must_use = "if unused the mutex will immediately unlock"]
pub struct InterProcessMutexGuard<'a> {
    pub(super) mutex: &'a InterProcessMutex,
}

impl InterProcessMutexGuard<'_> {
    pub fn mutex(&self) -> &InterProcessMutex {
        self.mutex
    }
}

impl Drop for InterProcessMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::panic_after;
    use std::sync::Arc;

    #[test]
    fn lock_excludes() {
        let m = InterProcessMutex::new();
        let guard = m.lock();
        assert!(m.is_held_by_current_thread());
        assert!(m.try_lock().is_none());
        drop(guard);
        assert!(!m.is_locked());
        assert!(m.try_lock().is_some());
    }

    #[test]
    fn zeroed_is_unlocked() {
        let m: InterProcessMutex = bytemuck::Zeroable::zeroed();
        assert!(!m.is_locked());
        let _g = m.lock();
    }

    #[test]
    fn contended_counter() {
        struct Shared {
            lock: InterProcessMutex,
            value: std::cell::UnsafeCell<usize>,
        }
        unsafe impl Sync for Shared {}

        let shared = Arc::new(Shared {
            lock: InterProcessMutex::new(),
            value: std::cell::UnsafeCell::new(0),
        });
        let result = panic_after(20_000, move || {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let shared = shared.clone();
                    std::thread::spawn(move || {
                        for _ in 0..2_000 {
                            let _g = shared.lock.lock();
                            unsafe { *shared.value.get() += 1 };
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            let _g = shared.lock.lock();
            unsafe { *shared.value.get() }
        });
        assert_eq!(result, 16_000);
    }

    #[test]
    #[should_panic]
    fn assert_held_fails_when_unlocked() {
        let m = InterProcessMutex::new();
        m.assert_held();
    }
}
