//! The records both processes read and write. Their layout must be identical in every process
//! sharing the region, so everything here is `#[repr(C)]` and refers to other records by offset or
//! index only.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};

use super::gc_type::GcType;
use crate::ipc::{AtomicSharedOffset, InterProcessConditionVariable, InterProcessMutex};
use crate::util::os::MemMapDescriptor;
use crate::util::Address;

pub const MAX_SPACES: usize = 16;
/// One session per collection kind, blocking and concurrent.
pub const MAX_COLLECTORS: usize = 8;

/// Index of the live heap bitmap record.
pub const LIVE_BITMAP: u32 = 0;
/// Index of the mark heap bitmap record.
pub const MARK_BITMAP: u32 = 1;

/// Indices of the object stacks.
pub const ALLOCATION_STACK_0: usize = 0;
pub const ALLOCATION_STACK_1: usize = 1;
pub const MARK_STACK: usize = 2;
pub const DEFERRED_STACK: usize = 3;
pub const NUM_OBJECT_STACKS: usize = 4;

/// For every registered space, which of its two bitmaps plays this role.
#[repr(C)]
#[derive(bytemuck::Zeroable)]
pub struct HeapBitmapRecord {
    slots: [AtomicU8; MAX_SPACES],
}

impl HeapBitmapRecord {
    pub fn slot(&self, space: usize) -> usize {
        self.slots[space].load(Ordering::Acquire) as usize
    }

    pub fn set_slot(&self, space: usize, slot: usize) {
        debug_assert!(slot < 2);
        self.slots[space].store(slot as u8, Ordering::Release);
    }
}

/// Where the card table lives. Written once.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct CardTableRecord {
    pub descriptor: MemMapDescriptor,
    pub heap_begin: Address,
    pub heap_limit: Address,
    pub biased_begin: Address,
}

/// The root of all shared state, at a fixed place in the shared region.
#[repr(C)]
#[derive(bytemuck::Zeroable)]
pub struct SharedHeapHeader {
    /// Guards `is_gc_running`. At most one cycle runs at any time across both processes.
    pub gc_lock: InterProcessMutex,
    pub gc_complete_cond: InterProcessConditionVariable,
    pub is_gc_running: AtomicBool,
    /// `GcType as u32 + 1` of the last completed cycle, or 0.
    pub last_gc_type: AtomicU32,
    pub gcs_completed: AtomicUsize,

    /// Guards `pending_request` and `shutdown`.
    pub request_lock: InterProcessMutex,
    pub request_cond: InterProcessConditionVariable,
    /// `GcType as u32 + 1` of a requested background collection, or 0.
    pub pending_request: AtomicU32,
    pub shutdown: AtomicBool,

    /// Guards `server_synchronize`, `service_attached` and `service_shutdown`.
    pub service_lock: InterProcessMutex,
    pub service_cond: InterProcessConditionVariable,
    /// `collector_index + 1` of the session the service should mark for, or 0.
    pub server_synchronize: AtomicU32,
    pub service_attached: AtomicBool,
    pub service_shutdown: AtomicBool,

    pub num_spaces: AtomicUsize,
    pub spaces: [AtomicSharedOffset; MAX_SPACES],
    /// Live and mark heap bitmaps, indexed by [`LIVE_BITMAP`] and [`MARK_BITMAP`].
    pub heap_bitmaps: [HeapBitmapRecord; 2],

    pub object_stacks: [AtomicSharedOffset; NUM_OBJECT_STACKS],
    /// Which of the two allocation stacks currently receives allocations. The other one is the
    /// live stack.
    pub allocation_stack_index: AtomicU32,

    pub card_table: AtomicSharedOffset,

    pub num_collectors: AtomicUsize,
    pub collectors: [AtomicSharedOffset; MAX_COLLECTORS],
}

impl SharedHeapHeader {
    pub fn last_gc_type(&self) -> Option<GcType> {
        match self.last_gc_type.load(Ordering::Acquire) {
            0 => None,
            v => GcType::from_u32(v - 1),
        }
    }

    pub fn pending_request(&self) -> Option<GcType> {
        match self.pending_request.load(Ordering::Acquire) {
            0 => None,
            v => GcType::from_u32(v - 1),
        }
    }

    pub fn set_pending_request(&self, request: Option<GcType>) {
        self.pending_request
            .store(request.map_or(0, |t| t as u32 + 1), Ordering::Release);
    }

    pub fn num_spaces(&self) -> usize {
        self.num_spaces.load(Ordering::Acquire)
    }

    pub fn live_bitmap(&self) -> &HeapBitmapRecord {
        &self.heap_bitmaps[LIVE_BITMAP as usize]
    }

    pub fn mark_bitmap(&self) -> &HeapBitmapRecord {
        &self.heap_bitmaps[MARK_BITMAP as usize]
    }

    /// The stacks receiving allocations and holding the allocations of the previous period.
    pub fn allocation_and_live_stacks(&self) -> (usize, usize) {
        match self.allocation_stack_index.load(Ordering::Acquire) {
            0 => (ALLOCATION_STACK_0, ALLOCATION_STACK_1),
            _ => (ALLOCATION_STACK_1, ALLOCATION_STACK_0),
        }
    }

    pub fn swap_allocation_stacks(&self) {
        self.allocation_stack_index.fetch_xor(1, Ordering::AcqRel);
    }
}
