use bytemuck::{NoUninit, Zeroable};

use std::fmt;
use std::ops::{Add, Range, Sub};

use crate::util::conversions;

/// A location in the address space: an object in the shared heap, a card, a bitmap word or a
/// byte inside a mapping. Only arithmetic is done here; nothing checks that the address is
/// mapped.
///
/// Heap addresses have the same value in every process that inherited the heap mapping. Private
/// structures do not, so shared records store [`crate::ipc::SharedOffset`] instead.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, Hash, PartialOrd, Ord, PartialEq, NoUninit, Zeroable)]
pub struct Address(usize);

impl Add<usize> for Address {
    type Output = Address;
    fn add(self, bytes: usize) -> Address {
        Address(self.0 + bytes)
    }
}

impl Sub<usize> for Address {
    type Output = Address;
    fn sub(self, bytes: usize) -> Address {
        Address(self.0 - bytes)
    }
}

/// The distance in bytes from `other` up to `self`.
impl Sub<Address> for Address {
    type Output = usize;
    fn sub(self, other: Address) -> usize {
        debug_assert!(self >= other, "{} - {} would be negative", self, other);
        self.0 - other.0
    }
}

impl Address {
    pub const ZERO: Self = Address(0);
    pub const MAX: Self = Address(usize::MAX);

    pub fn from_mut_ptr<T>(ptr: *mut T) -> Address {
        Address(ptr as usize)
    }

    /// # Safety
    /// The result is only meaningful for values that name real or reserved memory: heap
    /// addresses handed in by the runtime, or fixed test addresses.
    pub const unsafe fn from_usize(raw: usize) -> Address {
        Address(raw)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub const fn align_up(self, align: usize) -> Address {
        Address(conversions::raw_align_up(self.0, align))
    }

    pub const fn align_down(self, align: usize) -> Address {
        Address(conversions::raw_align_down(self.0, align))
    }

    pub const fn is_aligned_to(self, align: usize) -> bool {
        conversions::raw_is_aligned(self.0, align)
    }

    pub fn to_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    pub fn to_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// # Safety
    /// The address must be mapped and hold an initialized `T`.
    pub unsafe fn load<T: Copy>(self) -> T {
        *self.to_ptr::<T>()
    }

    /// Write `value` without dropping whatever the location held.
    ///
    /// # Safety
    /// The address must be mapped, writable and aligned for `T`.
    pub unsafe fn store<T>(self, value: T) {
        self.to_mut_ptr::<T>().write(value);
    }

    /// Whether two half-open ranges share at least one byte.
    pub fn ranges_overlap(r1: &Range<Address>, r2: &Range<Address>) -> bool {
        r1.start < r2.end && r2.start < r1.end
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
