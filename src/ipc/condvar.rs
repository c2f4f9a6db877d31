use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use super::mutex::InterProcessMutexGuard;
use crate::util::os::futex;

/// A condition variable that lives in shared memory next to an [`InterProcessMutex`].
///
/// Waiters sleep on a generation counter that every notification bumps, so a notification sent
/// after a waiter released the mutex can never be lost. Wakeups may still be spurious. Every
/// waiter loops on its own predicate, preferably through [`Self::wait_while`].
///
/// Notifications must be sent while holding the paired mutex.
///
/// [`InterProcessMutex`]: super::InterProcessMutex
#[repr(C)]
pub struct InterProcessConditionVariable {
    /// The futex word. Incremented by every notification.
    sequence: AtomicU32,
    num_waiters: AtomicU32,
}

unsafe impl bytemuck::Zeroable for InterProcessConditionVariable {}

impl InterProcessConditionVariable {
    pub const fn new() -> Self {
        Self {
            sequence: AtomicU32::new(0),
            num_waiters: AtomicU32::new(0),
        }
    }

    /// Release the mutex held by `guard`, sleep until notified (or a spurious wakeup), and
    /// reacquire the mutex.
    pub fn wait<'a>(&self, guard: InterProcessMutexGuard<'a>) -> InterProcessMutexGuard<'a> {
        self.wait_impl(guard, None)
    }

    /// Like [`Self::wait`], but return after at most `timeout`.
    pub fn wait_timeout<'a>(
        &self,
        guard: InterProcessMutexGuard<'a>,
        timeout: Duration,
    ) -> InterProcessMutexGuard<'a> {
        self.wait_impl(guard, Some(timeout))
    }

    /// Wait until `condition` returns false. `condition` is evaluated with the mutex held.
    pub fn wait_while<'a, F>(
        &self,
        mut guard: InterProcessMutexGuard<'a>,
        mut condition: F,
    ) -> InterProcessMutexGuard<'a>
    where
        F: FnMut() -> bool,
    {
        while condition() {
            guard = self.wait(guard);
        }
        guard
    }

    fn wait_impl<'a>(
        &self,
        guard: InterProcessMutexGuard<'a>,
        timeout: Option<Duration>,
    ) -> InterProcessMutexGuard<'a> {
        guard.mutex.assert_held();
        let mutex = guard.mutex;
        self.num_waiters.fetch_add(1, Ordering::SeqCst);
        // Read the generation before releasing the mutex. Any notifier must take the mutex first,
        // so it will bump the generation we sleep on.
        let seq = self.sequence.load(Ordering::SeqCst);
        drop(guard);
        match timeout {
            Some(t) => futex::wait_timeout(&self.sequence, seq, t),
            None => futex::wait(&self.sequence, seq),
        }
        let guard = mutex.lock();
        self.num_waiters.fetch_sub(1, Ordering::SeqCst);
        guard
    }

    /// Wake one waiter.
    pub fn notify_one(&self) {
        self.sequence.fetch_add(1, Ordering::SeqCst);
        if self.num_waiters.load(Ordering::SeqCst) > 0 {
            futex::wake(&self.sequence, 1);
        }
    }

    /// Wake every waiter.
    pub fn notify_all(&self) {
        self.sequence.fetch_add(1, Ordering::SeqCst);
        if self.num_waiters.load(Ordering::SeqCst) > 0 {
            futex::wake_all(&self.sequence);
        }
    }

    /// Number of threads currently inside a wait.
    pub fn num_waiters(&self) -> u32 {
        self.num_waiters.load(Ordering::Relaxed)
    }
}

impl Default for InterProcessConditionVariable {
    fn default() -> Self {
        Self::new()
    }
}
