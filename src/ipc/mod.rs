//! Shared memory and the lock primitives that live in it.
//!
//! Everything here is usable from any process that inherited the [`SharedRegion`] mapping. The
//! mutex and condition variable are plain words in shared memory and never need reinitializing
//! after a fork.

mod condvar;
mod mutex;
mod shared_region;

pub use self::condvar::InterProcessConditionVariable;
pub use self::mutex::{InterProcessMutex, InterProcessMutexGuard};
pub use self::shared_region::{
    AtomicSharedOffset, SharedOffset, SharedRef, SharedRegion, SharedRegionError, SharedSlice,
};
