//! This module works around limitations of the Rust programming language, and provides missing
//! functionalities that we may expect the Rust programming language and its standard libraries
//! to provide.

use atomic_traits::Atomic;
use std::sync::atomic::Ordering;

/// The outcome of one [`atomically`] update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicUpdate<T> {
    /// `compute_new` returned the value already stored, so nothing was written.
    Unchanged(T),
    /// The value was replaced. Holds `(old, new)`.
    Changed(T, T),
}

impl<T: Copy> AtomicUpdate<T> {
    /// The value observed before the update.
    pub fn old(&self) -> T {
        match *self {
            AtomicUpdate::Unchanged(v) => v,
            AtomicUpdate::Changed(old, _) => old,
        }
    }
}

/// Replace the value in `loc` with `compute_new(expected)` using compare-and-swap, retrying with
/// the freshly observed value every time another thread (or process) wins the race.
///
/// No store is attempted if `compute_new` returns the current value. Retries are only caused by
/// concurrent writers, so the loop is bounded by the scheduler rather than by a counter.
pub fn atomically<A, F>(loc: &A, mut compute_new: F) -> AtomicUpdate<A::Type>
where
    A: Atomic,
    A::Type: Copy + PartialEq,
    F: FnMut(A::Type) -> A::Type,
{
    let mut expected = loc.load(Ordering::Relaxed);
    loop {
        let new = compute_new(expected);
        if new == expected {
            return AtomicUpdate::Unchanged(expected);
        }
        match loc.compare_exchange_weak(expected, new, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => return AtomicUpdate::Changed(expected, new),
            Err(actual) => expected = actual,
        }
    }
}
