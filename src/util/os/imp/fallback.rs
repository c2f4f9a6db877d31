use crate::util::address::Address;
use crate::util::os::*;
use std::io::Result;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

pub fn set_vma_name(_start: Address, _size: usize, _annotation: &MmapAnnotation) {}

pub fn create_shared_fd(_name: &str) -> Result<OwnedFd> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "named shared mappings are only supported on Linux",
    ))
}

pub fn current_thread_id() -> u32 {
    static NEXT_ID: AtomicU32 = AtomicU32::new(1);
    thread_local! {
        static ID: u32 = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    }
    ID.with(|id| *id)
}

// Without a futex, waiting degrades to yielding. Waiters always re-check their predicate, so an
// early return is just a spurious wakeup.

pub fn futex_wait(word: &AtomicU32, expected: u32, _timeout: Option<Duration>) {
    if word.load(Ordering::Acquire) == expected {
        std::thread::yield_now();
    }
}

pub fn futex_wake(_word: &AtomicU32, _count: u32) -> usize {
    0
}
