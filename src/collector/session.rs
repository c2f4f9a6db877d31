use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use super::gc_type::GcType;
use super::phase::GcPhase;
use super::shared::{MARK_BITMAP, MAX_COLLECTORS};
use crate::ipc::{InterProcessConditionVariable, InterProcessMutex, SharedOffset, SharedRef, SharedRegion};
use crate::util::Address;

/// The shared state of one collector session.
#[repr(C)]
pub struct CollectorSessionRecord {
    phase_lock: InterProcessMutex,
    phase_cond: InterProcessConditionVariable,
    phase: AtomicU32,
    gc_type: u32,
    is_concurrent: bool,
    collector_index: u32,
    immune_begin: AtomicUsize,
    immune_end: AtomicUsize,
    /// Index of the heap bitmap record that marking writes to.
    active_mark_bitmap: AtomicU32,
    clear_soft_references: AtomicBool,
    /// Objects marked by the service process in the current cycle.
    service_marked_objects: AtomicUsize,
    transitions: AtomicUsize,
    cycles: AtomicUsize,
}

/// One instance of the phase machine. There is one session per (gc type, concurrency) pair, and
/// each is reused for every cycle of its kind.
///
/// The process that runs a cycle advances the phase with [`CollectorSession::set_phase`]. The
/// other process follows with [`CollectorSession::block_for_gc_phase`].
#[derive(Clone)]
pub struct CollectorSession {
    record: SharedRef<CollectorSessionRecord>,
}

impl CollectorSession {
    pub(crate) fn create(region: &Arc<SharedRegion>, gc_type: GcType, is_concurrent: bool) -> CollectorSession {
        let index = Self::index_for(gc_type, is_concurrent);
        let record = region.alloc(CollectorSessionRecord {
            phase_lock: InterProcessMutex::new(),
            phase_cond: InterProcessConditionVariable::new(),
            phase: AtomicU32::new(GcPhase::None as u32),
            gc_type: gc_type as u32,
            is_concurrent,
            collector_index: index as u32,
            immune_begin: AtomicUsize::new(0),
            immune_end: AtomicUsize::new(0),
            active_mark_bitmap: AtomicU32::new(MARK_BITMAP),
            clear_soft_references: AtomicBool::new(false),
            service_marked_objects: AtomicUsize::new(0),
            transitions: AtomicUsize::new(0),
            cycles: AtomicUsize::new(0),
        });
        CollectorSession { record }
    }

    pub(crate) fn open(region: &Arc<SharedRegion>, offset: SharedOffset) -> CollectorSession {
        let record = unsafe { SharedRef::<CollectorSessionRecord>::from_offset(region.clone(), offset) };
        if record.collector_index as usize >= MAX_COLLECTORS || GcType::from_u32(record.gc_type).is_none() {
            fatal!("Collector session record at {:?} is corrupt", offset);
        }
        CollectorSession { record }
    }

    /// The slot of the session for `gc_type` in the shared collector array.
    pub fn index_for(gc_type: GcType, is_concurrent: bool) -> usize {
        gc_type as usize * 2 + is_concurrent as usize
    }

    pub fn offset(&self) -> SharedOffset {
        self.record.offset()
    }

    pub fn collector_index(&self) -> usize {
        self.record.collector_index as usize
    }

    pub fn gc_type(&self) -> GcType {
        GcType::from_u32(self.record.gc_type).unwrap_or_else(|| fatal!("Corrupt session gc type"))
    }

    pub fn is_concurrent(&self) -> bool {
        self.record.is_concurrent
    }

    pub fn phase(&self) -> GcPhase {
        GcPhase::from_shared(self.record.phase.load(Ordering::Acquire))
    }

    /// Publish `phase`. It must be the successor of the current phase.
    pub fn set_phase(&self, phase: GcPhase) {
        let _guard = self.record.phase_lock.lock();
        let current = self.phase();
        if phase != current.next() {
            fatal!(
                "Collector {} ({}): illegal phase transition {} -> {}",
                self.collector_index(),
                self.gc_type(),
                current,
                phase
            );
        }
        self.record.phase.store(phase as u32, Ordering::Release);
        self.record.transitions.fetch_add(1, Ordering::Relaxed);
        if phase == GcPhase::None {
            self.record.cycles.fetch_add(1, Ordering::Relaxed);
        }
        debug!("Collector {}: {} -> {}", self.collector_index(), current, phase);
        self.record.phase_cond.notify_all();
    }

    /// Wait until the shared phase is `phase`.
    pub fn block_for_gc_phase(&self, phase: GcPhase) {
        let guard = self.record.phase_lock.lock();
        let _guard = self
            .record
            .phase_cond
            .wait_while(guard, || self.phase() != phase);
        trace!("Collector {}: reached {}", self.collector_index(), phase);
    }

    /// Objects in this range count as marked.
    pub fn immune_range(&self) -> Range<Address> {
        let begin = self.record.immune_begin.load(Ordering::Acquire);
        let end = self.record.immune_end.load(Ordering::Acquire);
        unsafe { Address::from_usize(begin)..Address::from_usize(end) }
    }

    pub(crate) fn set_immune_range(&self, range: Range<Address>) {
        self.record.immune_begin.store(range.start.as_usize(), Ordering::Release);
        self.record.immune_end.store(range.end.as_usize(), Ordering::Release);
    }

    pub fn active_mark_bitmap(&self) -> u32 {
        self.record.active_mark_bitmap.load(Ordering::Acquire)
    }

    pub(crate) fn set_active_mark_bitmap(&self, index: u32) {
        self.record.active_mark_bitmap.store(index, Ordering::Release);
    }

    pub fn clear_soft_references(&self) -> bool {
        self.record.clear_soft_references.load(Ordering::Acquire)
    }

    pub(crate) fn set_clear_soft_references(&self, clear: bool) {
        self.record.clear_soft_references.store(clear, Ordering::Release);
    }

    pub fn service_marked_objects(&self) -> usize {
        self.record.service_marked_objects.load(Ordering::Acquire)
    }

    pub(crate) fn add_service_marked_objects(&self, count: usize) {
        self.record.service_marked_objects.fetch_add(count, Ordering::AcqRel);
    }

    /// Number of phase changes ever published by this session.
    pub fn transitions(&self) -> usize {
        self.record.transitions.load(Ordering::Relaxed)
    }

    /// Number of completed cycles.
    pub fn cycles(&self) -> usize {
        self.record.cycles.load(Ordering::Relaxed)
    }

    /// Put the per-cycle fields back to their initial values.
    pub(crate) fn reset(&self) {
        self.set_immune_range(Address::ZERO..Address::ZERO);
        self.set_active_mark_bitmap(MARK_BITMAP);
        self.set_clear_soft_references(false);
        self.record.service_marked_objects.store(0, Ordering::Release);
    }
}

impl std::fmt::Debug for CollectorSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorSession")
            .field("index", &self.collector_index())
            .field("gc_type", &self.gc_type())
            .field("concurrent", &self.is_concurrent())
            .field("phase", &self.phase())
            .finish()
    }
}
