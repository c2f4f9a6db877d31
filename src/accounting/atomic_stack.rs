use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::ipc::{SharedOffset, SharedRef, SharedRegion, SharedSlice};
use crate::util::Address;

/// The shared part of an [`ObjectStack`].
#[repr(C)]
pub struct ObjectStackRecord {
    capacity: usize,
    slots: SharedOffset,
    top: AtomicUsize,
}

/// A fixed-capacity stack of addresses in the shared region.
///
/// Pushes may race with each other. Pops, resets and iteration must not race with pushes: each
/// stack has one consumer at a time, and the phase protocol hands stacks between processes.
///
/// A push reserves its slot before storing into it. Slots are zeroed when they are popped or
/// reset, so a reserved slot that is not yet written reads as empty and is skipped.
#[derive(Clone)]
pub struct ObjectStack {
    record: SharedRef<ObjectStackRecord>,
    slots: SharedSlice<AtomicUsize>,
}

impl ObjectStack {
    pub fn create(region: &Arc<SharedRegion>, capacity: usize) -> ObjectStack {
        let slots = region.alloc_array::<AtomicUsize>(capacity);
        let record = region.alloc(ObjectStackRecord {
            capacity,
            slots: slots.offset(),
            top: AtomicUsize::new(0),
        });
        ObjectStack { record, slots }
    }

    /// Open the stack whose record is at `offset`.
    pub fn from_record(region: &Arc<SharedRegion>, offset: SharedOffset) -> ObjectStack {
        let record = unsafe { SharedRef::<ObjectStackRecord>::from_offset(region.clone(), offset) };
        let slots = unsafe { SharedSlice::from_offset(region.clone(), record.slots, record.capacity) };
        ObjectStack { record, slots }
    }

    pub fn record_offset(&self) -> SharedOffset {
        self.record.offset()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.record.top.load(Ordering::Acquire).min(self.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Push `addr`. Returns false if the stack is full.
    pub fn push(&self, addr: Address) -> bool {
        let capacity = self.capacity();
        match self
            .record
            .top
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |top| {
                (top < capacity).then_some(top + 1)
            }) {
            Ok(index) => {
                self.slots[index].store(addr.as_usize(), Ordering::Release);
                true
            }
            Err(_) => false,
        }
    }

    pub fn pop(&self) -> Option<Address> {
        self.record
            .top
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |top| top.checked_sub(1))
            .ok()
            .map(|top| unsafe { Address::from_usize(self.slots[top - 1].swap(0, Ordering::AcqRel)) })
    }

    pub fn reset(&self) {
        for slot in &self.slots[..self.len()] {
            slot.store(0, Ordering::Relaxed);
        }
        self.record.top.store(0, Ordering::Release);
    }

    /// The addresses on the stack, bottom first.
    pub fn iter(&self) -> impl Iterator<Item = Address> + '_ {
        self.slots[..self.len()]
            .iter()
            .map(|slot| slot.load(Ordering::Acquire))
            .filter(|&value| value != 0)
            .map(|value| unsafe { Address::from_usize(value) })
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.iter().any(|a| a == addr)
    }
}

impl std::fmt::Debug for ObjectStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStack")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}
