//! Wait/wake on a 32-bit word in (possibly shared) memory.
//!
//! A waiter blocks only while the word still holds `expected`. Every return from [`wait`] may be
//! spurious, so callers always loop on their real predicate.

use std::sync::atomic::AtomicU32;
use std::time::Duration;

use super::imp;

/// Block until `word` is woken, if it still holds `expected`.
pub fn wait(word: &AtomicU32, expected: u32) {
    imp::futex_wait(word, expected, None)
}

/// Like [`wait`], but give up after `timeout`.
pub fn wait_timeout(word: &AtomicU32, expected: u32, timeout: Duration) {
    imp::futex_wait(word, expected, Some(timeout))
}

/// Wake at most `count` waiters blocked on `word`. Returns the number of waiters woken, as far as
/// the platform can tell.
pub fn wake(word: &AtomicU32, count: u32) -> usize {
    imp::futex_wake(word, count)
}

/// Wake every waiter blocked on `word`.
pub fn wake_all(word: &AtomicU32) -> usize {
    imp::futex_wake(word, u32::MAX)
}
