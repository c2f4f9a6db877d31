use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use strum::IntoEnumIterator;

use super::gc_type::{CollectorConfig, GcRetentionPolicy, GcType};
use super::marking::Marker;
use super::phase::GcPhase;
use super::session::CollectorSession;
use super::shared::*;
use super::space::Space;
use crate::accounting::card_table::{age_card, BYTES_IN_CARD, CARD_AGED, CARD_DIRTY};
use crate::accounting::{CardTable, HeapBitmap, ObjectSet, ObjectStack, SpaceBitmap};
use crate::gc_context::GcContext;
use crate::vm::VMBinding;
use crate::util::Address;

/// Why an allocation could not be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationError {
    /// Collections of every kind did not free enough memory.
    HeapOutOfMemory,
    /// The allocator could not map more memory. Collecting does not help.
    MmapOutOfMemory,
}

impl std::fmt::Display for AllocationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AllocationError::HeapOutOfMemory => write!(f, "heap out of memory"),
            AllocationError::MmapOutOfMemory => write!(f, "out of memory for mappings"),
        }
    }
}

impl std::error::Error for AllocationError {}

/// What one cycle did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleStats {
    pub freed_objects: usize,
    pub freed_bytes: usize,
    /// Objects marked by this cycle, in either process.
    pub marked_objects: usize,
    /// Cards that went from dirty to aged.
    pub aged_cards: usize,
}

struct ContinuousSpace {
    space: Space,
    bitmaps: [Arc<SpaceBitmap>; 2],
}

struct LargeObjectSpace {
    space: Space,
    live: Arc<ObjectSet>,
    mark: Arc<ObjectSet>,
}

/// The mutator side of the collector: owns the card table, the spaces and the collector sessions,
/// and runs collection cycles, handing recursive marking to the service process when one is
/// attached.
pub struct IPCHeap<VM: VMBinding> {
    context: GcContext<VM>,
    card_table: CardTable,
    spaces: RwLock<Vec<ContinuousSpace>>,
    large_object_space: RwLock<Option<LargeObjectSpace>>,
    stacks: [ObjectStack; NUM_OBJECT_STACKS],
    /// Indexed by collector index.
    sessions: Vec<CollectorSession>,
    /// Cards of long-lived spaces that were dirty. Those spaces are not traced by partial and
    /// sticky cycles, so their references into collected spaces are found through these cards.
    /// Full cycles forget the cards that no longer hold such references.
    remembered_cards: Mutex<BTreeSet<Address>>,
    daemon: Mutex<Option<JoinHandle<()>>>,
}

impl<VM: VMBinding> IPCHeap<VM> {
    /// Set up the heap covering `[heap_begin, heap_begin + heap_capacity)` and all its shared
    /// structures. Must be called before the service process is forked.
    pub fn new(context: GcContext<VM>, heap_begin: Address, heap_capacity: usize) -> Arc<Self> {
        let region = context.region().clone();
        let header = context.header();
        let options = context.options();

        let card_table = CardTable::create(heap_begin, heap_capacity);
        let card_record = region.alloc(CardTableRecord {
            descriptor: card_table.descriptor(),
            heap_begin: card_table.heap_begin(),
            heap_limit: card_table.heap_limit(),
            biased_begin: card_table.biased_begin(),
        });
        header.card_table.store(card_record.offset());

        let stacks = [
            ObjectStack::create(&region, options.allocation_stack_capacity),
            ObjectStack::create(&region, options.allocation_stack_capacity),
            ObjectStack::create(&region, options.mark_stack_capacity),
            ObjectStack::create(&region, options.mark_stack_capacity),
        ];
        for (slot, stack) in header.object_stacks.iter().zip(stacks.iter()) {
            slot.store(stack.record_offset());
        }

        let mut sessions = vec![];
        for gc_type in GcType::iter() {
            for concurrent in [false, true] {
                let session = CollectorSession::create(&region, gc_type, concurrent);
                debug_assert_eq!(session.collector_index(), sessions.len());
                header.collectors[session.collector_index()].store(session.offset());
                sessions.push(session);
            }
        }
        header.num_collectors.store(sessions.len(), Ordering::Release);

        info!(
            "IPCHeap [{}, {}): {} collector sessions, shared region {} of {} bytes used",
            heap_begin,
            heap_begin + heap_capacity,
            sessions.len(),
            region.used(),
            region.size()
        );
        Arc::new(IPCHeap {
            context,
            card_table,
            spaces: RwLock::new(vec![]),
            large_object_space: RwLock::new(None),
            stacks,
            sessions,
            remembered_cards: Mutex::new(BTreeSet::new()),
            daemon: Mutex::new(None),
        })
    }

    pub fn context(&self) -> &GcContext<VM> {
        &self.context
    }

    fn header(&self) -> &SharedHeapHeader {
        self.context.header()
    }

    pub fn card_table(&self) -> &CardTable {
        &self.card_table
    }

    pub fn session(&self, gc_type: GcType, concurrent: bool) -> &CollectorSession {
        &self.sessions[CollectorSession::index_for(gc_type, concurrent)]
    }

    pub fn sessions(&self) -> &[CollectorSession] {
        &self.sessions
    }

    /// Register a continuous space. Its range must lie inside the heap and must not overlap any
    /// other space.
    pub fn add_continuous_space(
        &self,
        name: &str,
        begin: Address,
        capacity: usize,
        alignment: usize,
        retention: GcRetentionPolicy,
    ) -> Space {
        let limit = begin + capacity;
        if begin < self.card_table.heap_begin() || limit > self.card_table.heap_limit() {
            fatal!("Space {} [{}, {}) is outside the heap", name, begin, limit);
        }
        let mut spaces = self.spaces.write().unwrap();
        if let Some(other) = spaces
            .iter()
            .find(|s| Address::ranges_overlap(&s.space.range(), &(begin..limit)))
        {
            fatal!("Space {} [{}, {}) overlaps {}", name, begin, limit, other.space);
        }
        let header = self.header();
        let index = header.num_spaces();
        if index >= MAX_SPACES {
            fatal!("Too many spaces: cannot add {}", name);
        }
        let space = Space::new_continuous(index, name, begin, limit, alignment, retention);
        let (bitmaps, record) = space.create_bitmaps(self.context.region());
        let record = self.context.region().alloc(record);
        header.spaces[index].store(record.offset());
        header.live_bitmap().set_slot(index, 0);
        header.mark_bitmap().set_slot(index, 1);
        header.num_spaces.store(index + 1, Ordering::Release);
        info!("Added space {}", space);
        spaces.push(ContinuousSpace {
            space: space.clone(),
            bitmaps,
        });
        space
    }

    /// Register the space for objects outside every continuous space. Its mark information is
    /// private to this process, so the service process defers such objects back to the mutator.
    pub fn set_large_object_space(&self, name: &str, alignment: usize, retention: GcRetentionPolicy) -> Space {
        let space = Space::new_discontinuous(name, alignment, retention);
        let mut los = self.large_object_space.write().unwrap();
        if los.is_some() {
            fatal!("Large object space already set");
        }
        info!("Added space {}", space);
        *los = Some(LargeObjectSpace {
            space: space.clone(),
            live: Arc::new(ObjectSet::new(&format!("{} live", name))),
            mark: Arc::new(ObjectSet::new(&format!("{} mark", name))),
        });
        space
    }

    pub fn spaces(&self) -> Vec<Space> {
        let mut all: Vec<Space> = self.spaces.read().unwrap().iter().map(|s| s.space.clone()).collect();
        if let Some(los) = self.large_object_space.read().unwrap().as_ref() {
            all.push(los.space.clone());
        }
        all
    }

    fn stack(&self, index: usize) -> &ObjectStack {
        &self.stacks[index]
    }

    pub fn allocation_stack(&self) -> &ObjectStack {
        self.stack(self.header().allocation_and_live_stacks().0)
    }

    pub fn live_stack(&self) -> &ObjectStack {
        self.stack(self.header().allocation_and_live_stacks().1)
    }

    /// Record a newly allocated object. A full allocation stack triggers a sticky collection.
    pub fn record_allocation(&self, object: Address) {
        if !self.spaces.read().unwrap().iter().any(|s| s.space.contains(object))
            && self.large_object_space.read().unwrap().is_none()
        {
            fatal!("Allocated object {} is in no space", object);
        }
        while !self.allocation_stack().push(object) {
            debug!("Allocation stack full");
            self.collect(GcType::Sticky, false, false);
        }
    }

    /// The write barrier, called after a reference field of `object` is written.
    #[inline(always)]
    pub fn write_barrier(&self, object: Address) {
        self.card_table.mark_card(object);
    }

    /// Whether `object` was live at the end of the last cycle.
    pub fn is_live(&self, object: Address) -> bool {
        let spaces = self.spaces.read().unwrap();
        let los = self.large_object_space.read().unwrap();
        self.build_heap_bitmap(LIVE_BITMAP, &spaces, los.as_ref(), false).test(object)
    }

    pub fn is_gc_running(&self) -> bool {
        self.header().is_gc_running.load(Ordering::Acquire)
    }

    pub fn gcs_completed(&self) -> usize {
        self.header().gcs_completed.load(Ordering::Acquire)
    }

    pub fn last_gc_type(&self) -> Option<GcType> {
        self.header().last_gc_type()
    }

    /// Block until no cycle is running. Returns the type of the last completed cycle.
    pub fn wait_for_gc_to_complete(&self) -> Option<GcType> {
        let header = self.header();
        let guard = header.gc_lock.lock();
        let _guard = header
            .gc_complete_cond
            .wait_while(guard, || header.is_gc_running.load(Ordering::Acquire));
        header.last_gc_type()
    }

    /// Run one cycle. Waits for a running cycle (from either process) to finish first.
    pub fn collect(&self, gc_type: GcType, concurrent: bool, clear_soft_references: bool) -> CycleStats {
        let options = self.context.options();
        let gc_type = if gc_type == GcType::Sticky && !options.enable_sticky_gc {
            GcType::Partial
        } else {
            gc_type
        };
        let concurrent = concurrent && options.concurrent_gc;

        self.start_gc();
        let session = self.session(gc_type, concurrent);
        let stats = self.run_cycle(session, clear_soft_references);
        self.finish_gc(gc_type);
        info!(
            "{} GC{}: freed {} objects ({} bytes), marked {}, aged {} cards",
            gc_type,
            if concurrent { " (concurrent)" } else { "" },
            stats.freed_objects,
            stats.freed_bytes,
            stats.marked_objects,
            stats.aged_cards
        );
        stats
    }

    fn start_gc(&self) {
        let header = self.header();
        let guard = header.gc_lock.lock();
        let _guard = header
            .gc_complete_cond
            .wait_while(guard, || header.is_gc_running.load(Ordering::Acquire));
        header.is_gc_running.store(true, Ordering::Release);
    }

    fn finish_gc(&self, gc_type: GcType) {
        let header = self.header();
        let _guard = header.gc_lock.lock();
        header.is_gc_running.store(false, Ordering::Release);
        header.last_gc_type.store(gc_type as u32 + 1, Ordering::Release);
        header.gcs_completed.fetch_add(1, Ordering::AcqRel);
        header.gc_complete_cond.notify_all();
    }

    /// Allocate with `try_alloc`, collecting with increasing thoroughness while it reports
    /// [`AllocationError::HeapOutOfMemory`]. The last attempt also clears soft references.
    pub fn allocate_with_gc<F>(&self, mut try_alloc: F) -> Result<Address, AllocationError>
    where
        F: FnMut() -> Result<Address, AllocationError>,
    {
        match try_alloc() {
            Err(AllocationError::HeapOutOfMemory) => {}
            result => return result,
        }
        let first = if self.context.options().enable_sticky_gc {
            GcType::Sticky
        } else {
            GcType::Partial
        };
        let attempts = std::iter::successors(Some(first), |t| t.escalation())
            .map(|t| (t, false))
            .chain(std::iter::once((GcType::Full, true)));
        for (gc_type, clear_soft) in attempts {
            debug!("Allocation failed, trying {} GC (clear soft: {})", gc_type, clear_soft);
            self.collect(gc_type, false, clear_soft);
            match try_alloc() {
                Err(AllocationError::HeapOutOfMemory) => {}
                result => return result,
            }
        }
        warn!("Out of memory after collections of every kind");
        Err(AllocationError::HeapOutOfMemory)
    }

    /// Ask the daemon for a background collection. A pending request of a weaker kind is upgraded.
    pub fn request_concurrent_gc(&self, gc_type: GcType) {
        let header = self.header();
        let _guard = header.request_lock.lock();
        let request = match header.pending_request() {
            Some(pending) if pending >= gc_type => pending,
            _ => gc_type,
        };
        header.set_pending_request(Some(request));
        header.request_cond.notify_all();
    }

    /// Serve background collection requests until [`IPCHeap::shutdown`].
    pub fn run_gc_daemon(&self) {
        let header = self.header();
        loop {
            let guard = header.request_lock.lock();
            let guard = header.request_cond.wait_while(guard, || {
                header.pending_request().is_none() && !header.shutdown.load(Ordering::Acquire)
            });
            if header.shutdown.load(Ordering::Acquire) {
                break;
            }
            let Some(gc_type) = header.pending_request() else {
                continue;
            };
            header.set_pending_request(None);
            drop(guard);
            self.collect(gc_type, true, false);
        }
        debug!("GC daemon exiting");
    }

    pub fn spawn_gc_daemon(self: &Arc<Self>) {
        let heap = self.clone();
        let handle = std::thread::Builder::new()
            .name("gc-daemon".to_string())
            .spawn(move || heap.run_gc_daemon())
            .unwrap_or_else(|e| fatal!("Failed to spawn the GC daemon: {}", e));
        *self.daemon.lock().unwrap() = Some(handle);
    }

    /// Stop the daemon and the service loop. Neither is interrupted mid-cycle.
    pub fn shutdown(&self) {
        let header = self.header();
        {
            let _guard = header.request_lock.lock();
            header.shutdown.store(true, Ordering::Release);
            header.request_cond.notify_all();
        }
        {
            let _guard = header.service_lock.lock();
            header.service_shutdown.store(true, Ordering::Release);
            header.service_cond.notify_all();
        }
        if let Some(handle) = self.daemon.lock().unwrap().take() {
            if handle.join().is_err() {
                error!("GC daemon panicked");
            }
        }
    }

    /// Raise the server-synchronize flag for `session` if a service is attached. Returns whether
    /// this cycle's recursive marking is handed to the service.
    fn request_service_marking(&self, session: &CollectorSession) -> bool {
        if !self.context.options().use_gc_service {
            return false;
        }
        let header = self.header();
        let _guard = header.service_lock.lock();
        if !header.service_attached.load(Ordering::Acquire)
            || header.service_shutdown.load(Ordering::Acquire)
        {
            return false;
        }
        let raised = header
            .server_synchronize
            .compare_exchange(
                0,
                session.collector_index() as u32 + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if raised {
            debug!("Collector {}: handing marking to the service", session.collector_index());
            header.service_cond.notify_all();
        }
        raised
    }

    fn build_heap_bitmap(
        &self,
        which: u32,
        spaces: &[ContinuousSpace],
        los: Option<&LargeObjectSpace>,
        los_bound: bool,
    ) -> HeapBitmap {
        let record = &self.header().heap_bitmaps[which as usize];
        let mut heap_bitmap = HeapBitmap::new();
        for (i, s) in spaces.iter().enumerate() {
            heap_bitmap.add_continuous_space_bitmap(s.bitmaps[record.slot(i)].clone());
        }
        if let Some(los) = los {
            let set = if which == LIVE_BITMAP || los_bound {
                &los.live
            } else {
                &los.mark
            };
            heap_bitmap.add_object_set(set.clone());
        }
        heap_bitmap
    }

    /// Bind the mark bitmap of every space this kind of collection does not collect to its live
    /// bitmap, and publish the immune range. Returns which spaces are bound.
    fn bind_bitmaps(
        &self,
        session: &CollectorSession,
        config: &CollectorConfig,
        spaces: &[ContinuousSpace],
    ) -> Vec<bool> {
        let header = self.header();
        let bound: Vec<bool> = spaces
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let bound = config.is_bound(s.space.retention());
                if bound {
                    header.mark_bitmap().set_slot(i, header.live_bitmap().slot(i));
                }
                bound
            })
            .collect();

        let mut immune: Vec<&Space> = spaces
            .iter()
            .map(|s| &s.space)
            .filter(|s| config.is_immune(s.retention()))
            .collect();
        immune.sort_by_key(|s| s.begin());
        let mut range: Option<Range<Address>> = None;
        for space in immune {
            match range.as_mut() {
                None => range = Some(space.range()),
                Some(r) if r.end == space.begin() => r.end = space.limit(),
                Some(r) => warn!(
                    "Space {} is not adjacent to the immune range [{}, {}); it is not immune",
                    space, r.start, r.end
                ),
            }
        }
        session.set_immune_range(range.unwrap_or(Address::ZERO..Address::ZERO));
        session.set_active_mark_bitmap(MARK_BITMAP);
        bound
    }

    /// After sweeping: the mark bitmap of every collected space becomes its live bitmap and the
    /// old live bitmap is cleared for the next cycle. Bound spaces get their own mark bitmap back.
    fn swap_and_unbind_bitmaps(&self, spaces: &[ContinuousSpace], bound: &[bool]) {
        let header = self.header();
        let (live, mark) = (header.live_bitmap(), header.mark_bitmap());
        for (i, s) in spaces.iter().enumerate() {
            let live_slot = live.slot(i);
            if bound[i] {
                mark.set_slot(i, 1 - live_slot);
            } else {
                let mark_slot = mark.slot(i);
                live.set_slot(i, mark_slot);
                mark.set_slot(i, live_slot);
                s.bitmaps[live_slot].clear_all();
            }
        }
    }

    /// Scan the objects of bound spaces on aged or dirty cards, and on remembered cards.
    fn scan_bound_cards(
        &self,
        marker: &mut Marker<'_, VM>,
        spaces: &[ContinuousSpace],
        bound: &[bool],
        mark_bitmap: &HeapBitmap,
    ) -> usize {
        let remembered = self.remembered_cards.lock().unwrap();
        let mut cards = 0;
        for (s, _) in spaces.iter().zip(bound).filter(|(_, b)| **b) {
            let Some(bitmap) = mark_bitmap.get_continuous_space_bitmap(s.space.begin()) else {
                continue;
            };
            cards += self.card_table.scan(
                bitmap,
                s.space.begin(),
                s.space.limit(),
                |object| marker.scan_object(object),
                CARD_AGED,
            );
            for &card in remembered.range(s.space.range()) {
                let end = (card + BYTES_IN_CARD).min(s.space.limit());
                bitmap.visit_marked_range(card, end, |object| marker.scan_object(object));
                cards += 1;
            }
        }
        trace!("Scanned {} cards of bound spaces", cards);
        cards
    }

    /// Rescan marked objects on cards dirtied while marking ran concurrently.
    fn rescan_dirty_cards(&self, marker: &mut Marker<'_, VM>, spaces: &[ContinuousSpace], mark_bitmap: &HeapBitmap) {
        for s in spaces {
            if let Some(bitmap) = mark_bitmap.get_continuous_space_bitmap(s.space.begin()) {
                self.card_table.scan(
                    bitmap,
                    s.space.begin(),
                    s.space.limit(),
                    |object| marker.scan_object(object),
                    CARD_DIRTY,
                );
            }
        }
    }

    /// dirty -> aged, everything else -> clean. Dirty cards of long-lived spaces are remembered.
    fn age_cards(&self, spaces: &[ContinuousSpace]) -> usize {
        let mut aged = 0;
        let mut remembered = self.remembered_cards.lock().unwrap();
        self.card_table.modify_cards_atomic(
            self.card_table.heap_begin(),
            self.card_table.heap_limit(),
            age_card,
            |addr, old, new| {
                if new == CARD_AGED {
                    aged += 1;
                }
                if old == CARD_DIRTY
                    && spaces.iter().any(|s| {
                        s.space.contains(addr) && s.space.retention() != GcRetentionPolicy::AlwaysCollect
                    })
                {
                    remembered.insert(addr);
                }
            },
        );
        if self.context.options().verify_card_table {
            self.card_table.verify();
        }
        aged
    }

    /// Forget remembered cards whose marked objects no longer refer outside the long-lived
    /// spaces. Mutators must be stopped. Returns how many cards were forgotten.
    fn prune_remembered_cards(&self, spaces: &[ContinuousSpace], mark_bitmap: &HeapBitmap) -> usize {
        let binding = self.context.binding();
        let long_lived = |addr: Address| {
            spaces
                .iter()
                .any(|s| s.space.retention() != GcRetentionPolicy::AlwaysCollect && s.space.contains(addr))
        };
        let mut remembered = self.remembered_cards.lock().unwrap();
        let before = remembered.len();
        remembered.retain(|&card| {
            let Some(bitmap) = mark_bitmap.get_continuous_space_bitmap(card) else {
                return false;
            };
            let end = (card + BYTES_IN_CARD).min(bitmap.heap_limit());
            let mut refers_out = false;
            bitmap.visit_marked_range(card, end, |object| {
                if !refers_out {
                    binding.scan_object(object, &mut |child| {
                        refers_out |= !child.is_zero() && !long_lived(child);
                    });
                }
            });
            refers_out
        });
        let forgotten = before - remembered.len();
        debug!("Forgot {} of {} remembered cards", forgotten, before);
        forgotten
    }

    /// Hand `objects` of `space` to the runtime in batches. Returns the bytes freed.
    fn free_objects(&self, space: &Space, objects: &[Address]) -> usize {
        let batch = self.context.options().sweep_buffer_capacity;
        objects
            .chunks(batch)
            .map(|chunk| self.context.binding().sweep_objects(space, chunk))
            .sum()
    }

    /// Free the objects allocated since the last cycle that were not marked. Survivors in the
    /// immune range become live.
    fn sweep_live_stack(
        &self,
        mark_bitmap: &HeapBitmap,
        immune: &Range<Address>,
        spaces: &[ContinuousSpace],
        los: Option<&LargeObjectSpace>,
        stats: &mut CycleStats,
    ) {
        let mut garbage: BTreeMap<usize, Vec<Address>> = BTreeMap::new();
        for object in self.live_stack().iter() {
            // Immune spaces are bound, so this makes the object live.
            if immune.contains(&object) {
                mark_bitmap.set(object);
                continue;
            }
            if mark_bitmap.test(object) {
                continue;
            }
            let owner = spaces
                .iter()
                .position(|s| s.space.contains(object))
                .unwrap_or(usize::MAX);
            garbage.entry(owner).or_default().push(object);
        }
        for (owner, mut objects) in garbage {
            objects.sort();
            objects.dedup();
            let space = match owner {
                usize::MAX => match los {
                    Some(los) => &los.space,
                    None => fatal!("Allocated objects {:?} are in no space", &objects[..1]),
                },
                i => &spaces[i].space,
            };
            stats.freed_bytes += self.free_objects(space, &objects);
            stats.freed_objects += objects.len();
        }
    }

    /// Free everything live but unmarked in the spaces this cycle collects.
    fn sweep_spaces(
        &self,
        spaces: &[ContinuousSpace],
        bound: &[bool],
        los: Option<&LargeObjectSpace>,
        los_bound: bool,
        stats: &mut CycleStats,
    ) {
        let header = self.header();
        let batch = self.context.options().sweep_buffer_capacity;
        for (i, s) in spaces.iter().enumerate() {
            if bound[i] {
                continue;
            }
            let live = &s.bitmaps[header.live_bitmap().slot(i)];
            let mark = &s.bitmaps[header.mark_bitmap().slot(i)];
            SpaceBitmap::sweep_walk(live, mark, s.space.begin(), s.space.limit(), batch, |objects| {
                stats.freed_bytes += self.context.binding().sweep_objects(&s.space, objects);
                stats.freed_objects += objects.len();
            });
        }
        if let Some(los) = los.filter(|_| !los_bound) {
            let mut garbage = vec![];
            los.live.walk(|object| {
                if !los.mark.test(object) {
                    garbage.push(object);
                }
            });
            stats.freed_bytes += self.free_objects(&los.space, &garbage);
            stats.freed_objects += garbage.len();
            los.live.swap(&los.mark);
            los.mark.clear_all();
        }
    }

    fn run_cycle(&self, session: &CollectorSession, clear_soft_references: bool) -> CycleStats {
        let gc_type = session.gc_type();
        let config = gc_type.config();
        let concurrent = session.is_concurrent();
        let binding = self.context.binding();
        let header = self.header();
        let mut stats = CycleStats::default();

        session.set_phase(GcPhase::PreInit);
        session.set_clear_soft_references(clear_soft_references);
        if !concurrent {
            binding.stop_all_mutators();
        }

        session.set_phase(GcPhase::Init);
        let spaces = self.spaces.read().unwrap();
        let los_guard = self.large_object_space.read().unwrap();
        let los = los_guard.as_ref();
        let bound = self.bind_bitmaps(session, config, &spaces);
        let los_bound = los.is_some_and(|l| config.is_bound(l.space.retention()));
        // No allocation may be half recorded while the stacks trade places.
        if concurrent {
            binding.stop_all_mutators();
        }
        header.swap_allocation_stacks();
        if concurrent {
            binding.resume_mutators();
        }
        if gc_type != GcType::Sticky {
            let live_bitmap = self.build_heap_bitmap(LIVE_BITMAP, &spaces, los, false);
            for object in self.live_stack().iter() {
                live_bitmap.set(object);
            }
        }
        let mark_bitmap = self.build_heap_bitmap(session.active_mark_bitmap(), &spaces, los, los_bound);
        let immune = session.immune_range();
        let mark_stack = self.stack(MARK_STACK);
        mark_stack.reset();
        let mut marker = Marker::new(binding, &mark_bitmap, immune.clone(), mark_stack, None);

        session.set_phase(GcPhase::RootMark);
        binding.scan_thread_roots(&mut |root| marker.mark_object(root));

        session.set_phase(GcPhase::RootConcMark);
        if clear_soft_references {
            binding.clear_soft_references();
        } else {
            binding.scan_soft_references(&mut |referent| marker.mark_object(referent));
        }
        binding.scan_global_roots(&mut |root| marker.mark_object(root));

        session.set_phase(GcPhase::PreConcRootMark);
        self.scan_bound_cards(&mut marker, &spaces, &bound, &mark_bitmap);

        let handed_off = self.request_service_marking(session);
        session.set_phase(GcPhase::ConcMark);
        if handed_off {
            session.block_for_gc_phase(GcPhase::MarkRecursive);
            let deferred = self.stack(DEFERRED_STACK);
            while let Some(object) = deferred.pop() {
                marker.mark_object(object);
            }
            marker.process_mark_stack();
        } else {
            marker.process_mark_stack();
            session.set_phase(GcPhase::MarkRecursive);
        }

        session.set_phase(GcPhase::MarkReachables);
        if concurrent {
            binding.stop_all_mutators();
            binding.scan_thread_roots(&mut |root| marker.mark_object(root));
            binding.scan_global_roots(&mut |root| marker.mark_object(root));
            self.rescan_dirty_cards(&mut marker, &spaces, &mark_bitmap);
            marker.process_mark_stack();
        }
        stats.marked_objects = marker.marked() + session.service_marked_objects();
        drop(marker);

        stats.aged_cards = self.age_cards(&spaces);
        if gc_type == GcType::Full {
            self.prune_remembered_cards(&spaces, &mark_bitmap);
        }
        if gc_type == GcType::Sticky {
            self.sweep_live_stack(&mark_bitmap, &immune, &spaces, los, &mut stats);
        } else {
            self.sweep_spaces(&spaces, &bound, los, los_bound, &mut stats);
        }
        self.swap_and_unbind_bitmaps(&spaces, &bound);
        self.live_stack().reset();
        binding.resume_mutators();

        session.set_phase(GcPhase::Finish);
        session.reset();
        session.set_phase(GcPhase::None);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::card_table::CARD_CLEAN;
    use crate::collector::GcService;
    use crate::gc_context::GcContextBuilder;
    use crate::util::test_util::mock_vm::{MockVM, MOCK_OBJECT_SIZE};
    use crate::util::test_util::{panic_after, serial_test, TEST_HEAP_BEGIN};
    use std::time::Duration;

    const SPACE_SIZE: usize = 1 << 20;
    const ALIGN: usize = 8;

    struct TestHeap {
        heap: Arc<IPCHeap<MockVM>>,
        image: Space,
        zygote: Space,
        main: Space,
    }

    impl TestHeap {
        fn vm(&self) -> &MockVM {
            self.heap.context().binding()
        }

        fn alloc(&self, space: &Space, index: usize) -> Address {
            let object = space.begin() + index * 64;
            self.heap.record_allocation(object);
            object
        }
    }

    fn test_heap_with(configure: impl FnOnce(&mut GcContextBuilder)) -> TestHeap {
        let mut builder = GcContextBuilder::new();
        builder.options_mut().mark_stack_capacity = 1024;
        builder.options_mut().allocation_stack_capacity = 1024;
        configure(&mut builder);
        let heap = IPCHeap::new(builder.build(MockVM::default()), TEST_HEAP_BEGIN, 4 * SPACE_SIZE);
        let image = heap.add_continuous_space("image", TEST_HEAP_BEGIN, SPACE_SIZE, ALIGN, GcRetentionPolicy::NeverCollect);
        let zygote = heap.add_continuous_space(
            "zygote",
            TEST_HEAP_BEGIN + SPACE_SIZE,
            SPACE_SIZE,
            ALIGN,
            GcRetentionPolicy::FullCollect,
        );
        let main = heap.add_continuous_space(
            "main",
            TEST_HEAP_BEGIN + 2 * SPACE_SIZE,
            SPACE_SIZE,
            ALIGN,
            GcRetentionPolicy::AlwaysCollect,
        );
        TestHeap {
            heap,
            image,
            zygote,
            main,
        }
    }

    fn test_heap() -> TestHeap {
        test_heap_with(|_| {})
    }

    #[test]
    fn cycle_walks_every_phase() {
        let t = test_heap();
        t.heap.collect(GcType::Partial, false, false);
        let session = t.heap.session(GcType::Partial, false);
        assert_eq!(session.transitions(), GcPhase::ALL.len());
        assert_eq!(session.cycles(), 1);
        assert_eq!(session.phase(), GcPhase::None);
        assert_eq!(t.heap.gcs_completed(), 1);
        assert_eq!(t.heap.last_gc_type(), Some(GcType::Partial));
        assert!(!t.heap.is_gc_running());
    }

    #[test]
    fn partial_collection_frees_unreachable_objects() {
        let t = test_heap();
        let a = t.alloc(&t.main, 0);
        let b = t.alloc(&t.main, 1);
        let c = t.alloc(&t.main, 2);
        t.vm().add_thread_root(a);
        t.vm().add_edge(a, b);

        let stats = t.heap.collect(GcType::Partial, false, false);
        assert_eq!(t.vm().freed(), vec![c]);
        assert_eq!(stats.freed_objects, 1);
        assert_eq!(stats.freed_bytes, MOCK_OBJECT_SIZE);
        assert_eq!(stats.marked_objects, 2);
        assert!(t.heap.is_live(a));
        assert!(t.heap.is_live(b));
        assert!(!t.heap.is_live(c));

        // The survivors stay live through the next cycle, which then finds them dead.
        t.vm().clear_roots();
        t.heap.collect(GcType::Partial, false, false);
        assert_eq!(t.vm().freed(), vec![c, a, b]);
        assert!(!t.heap.is_live(a));
    }

    #[test]
    fn sticky_collection_keeps_old_objects() {
        let t = test_heap();
        let old = t.alloc(&t.main, 0);
        let unrooted_old = t.alloc(&t.main, 1);
        t.vm().add_thread_root(old);
        t.vm().add_thread_root(unrooted_old);
        t.heap.collect(GcType::Partial, false, false);
        assert!(t.vm().freed().is_empty());

        t.vm().clear_roots();
        t.vm().add_thread_root(old);
        let young_garbage = t.alloc(&t.main, 2);
        let young = t.alloc(&t.main, 3);
        t.vm().add_edge(old, young);
        t.heap.write_barrier(old);

        let stats = t.heap.collect(GcType::Sticky, false, false);
        assert_eq!(t.vm().freed(), vec![young_garbage]);
        assert_eq!(stats.aged_cards, 1);
        assert!(t.heap.is_live(young));
        assert!(t.heap.is_live(unrooted_old));
        assert_eq!(t.heap.card_table().get_card(old), CARD_AGED);
    }

    #[test]
    fn concurrent_cycle_swaps_stacks_in_a_pause() {
        let t = test_heap_with(|builder| builder.options_mut().concurrent_gc = true);
        let garbage = t.alloc(&t.main, 0);
        t.heap.collect(GcType::Partial, true, false);
        // One pause to swap the stacks, one to finish marking.
        assert_eq!(t.vm().pauses(), 2);
        assert_eq!(t.vm().max_overlapping_pauses(), 1);
        assert_eq!(t.vm().freed(), vec![garbage]);
        assert!(t.heap.allocation_stack().is_empty());
        assert!(t.heap.live_stack().is_empty());
    }

    #[test]
    fn long_lived_spaces_survive_until_full_collection() {
        let t = test_heap();
        let image_object = t.alloc(&t.image, 0);
        let zygote_object = t.alloc(&t.zygote, 0);

        t.heap.collect(GcType::Partial, false, false);
        assert!(t.vm().freed().is_empty());
        assert!(t.heap.is_live(zygote_object));

        t.heap.collect(GcType::Full, false, false);
        assert_eq!(t.vm().freed(), vec![zygote_object]);
        assert!(t.heap.is_live(image_object));
    }

    #[test]
    fn remembered_cards_keep_referents_alive() {
        let t = test_heap();
        let holder = t.alloc(&t.zygote, 0);
        let held = t.alloc(&t.main, 0);
        t.vm().add_edge(holder, held);
        t.heap.write_barrier(holder);

        // Dirty, then aged, then clean but remembered.
        for _ in 0..3 {
            t.heap.collect(GcType::Partial, false, false);
            assert!(t.vm().freed().is_empty());
            assert!(t.heap.is_live(held));
        }
        assert_eq!(t.heap.card_table().get_card(holder), CARD_CLEAN);
    }

    #[test]
    fn full_collection_forgets_stale_remembered_cards() {
        let t = test_heap();
        let cards_per_object = BYTES_IN_CARD / 64;
        let stale_holder = t.alloc(&t.zygote, 0);
        let holder = t.alloc(&t.zygote, 2 * cards_per_object);
        let dropped = t.alloc(&t.main, 0);
        let held = t.alloc(&t.main, 1);
        t.vm().add_thread_root(stale_holder);
        t.vm().add_thread_root(holder);
        t.vm().add_edge(stale_holder, dropped);
        t.vm().add_edge(holder, held);
        t.heap.write_barrier(stale_holder);
        t.heap.write_barrier(holder);

        t.heap.collect(GcType::Partial, false, false);
        assert_eq!(t.heap.remembered_cards.lock().unwrap().len(), 2);

        t.vm().clear_edges(stale_holder);
        t.heap.collect(GcType::Full, false, false);
        assert_eq!(t.vm().freed(), vec![dropped]);
        assert_eq!(
            t.heap.remembered_cards.lock().unwrap().iter().copied().collect::<Vec<_>>(),
            vec![holder.align_down(BYTES_IN_CARD)]
        );

        // The card that is left still keeps its referent alive without any root.
        t.vm().clear_roots();
        t.heap.collect(GcType::Partial, false, false);
        assert_eq!(t.vm().freed(), vec![dropped]);
        assert!(t.heap.is_live(held));
    }

    #[test]
    fn soft_references_are_kept_unless_cleared() {
        let t = test_heap();
        let referent = t.alloc(&t.main, 0);
        t.vm().add_soft_referent(referent);

        t.heap.collect(GcType::Partial, false, false);
        assert!(t.heap.is_live(referent));

        t.heap.collect(GcType::Partial, false, true);
        assert!(t.vm().soft_references_cleared());
        assert_eq!(t.vm().freed(), vec![referent]);
    }

    #[test]
    fn full_allocation_stack_triggers_collection() {
        let t = test_heap_with(|builder| builder.options_mut().allocation_stack_capacity = 4);
        for i in 0..5 {
            t.alloc(&t.main, i);
        }
        assert_eq!(t.heap.gcs_completed(), 1);
        assert_eq!(t.heap.last_gc_type(), Some(GcType::Sticky));
        assert_eq!(t.vm().freed().len(), 4);
        assert_eq!(t.heap.allocation_stack().len(), 1);
    }

    #[test]
    fn sticky_disabled_collects_partially() {
        let t = test_heap_with(|builder| builder.options_mut().enable_sticky_gc = false);
        t.heap.collect(GcType::Sticky, false, false);
        assert_eq!(t.heap.last_gc_type(), Some(GcType::Partial));
    }

    #[test]
    fn allocation_escalates_before_failing() {
        let t = test_heap();
        let result = t.heap.allocate_with_gc(|| Err(AllocationError::HeapOutOfMemory));
        assert_eq!(result, Err(AllocationError::HeapOutOfMemory));
        assert_eq!(t.heap.gcs_completed(), 4);
        assert_eq!(t.heap.last_gc_type(), Some(GcType::Full));
        assert!(t.vm().soft_references_cleared());
        assert_eq!(t.heap.session(GcType::Sticky, false).cycles(), 1);
        assert_eq!(t.heap.session(GcType::Partial, false).cycles(), 1);
        assert_eq!(t.heap.session(GcType::Full, false).cycles(), 2);
    }

    #[test]
    fn allocation_stops_escalating_on_success() {
        let t = test_heap();
        let object = t.main.begin();
        let mut attempts = 0;
        let result = t.heap.allocate_with_gc(|| {
            attempts += 1;
            if attempts == 3 {
                Ok(object)
            } else {
                Err(AllocationError::HeapOutOfMemory)
            }
        });
        assert_eq!(result, Ok(object));
        assert_eq!(t.heap.gcs_completed(), 2);
        assert_eq!(t.heap.last_gc_type(), Some(GcType::Partial));
        assert!(!t.vm().soft_references_cleared());
    }

    #[test]
    fn mapping_failure_is_not_retried() {
        let t = test_heap();
        let result = t.heap.allocate_with_gc(|| Err(AllocationError::MmapOutOfMemory));
        assert_eq!(result, Err(AllocationError::MmapOutOfMemory));
        assert_eq!(t.heap.gcs_completed(), 0);
    }

    #[test]
    fn collections_never_overlap() {
        let t = test_heap();
        let heap = t.heap.clone();
        panic_after(10_000, move || {
            let threads: Vec<_> = (0..4)
                .map(|i| {
                    let heap = heap.clone();
                    std::thread::spawn(move || {
                        for _ in 0..5 {
                            heap.collect(GcType::from_u32(i % 3).unwrap(), false, false);
                        }
                    })
                })
                .collect();
            for thread in threads {
                thread.join().unwrap();
            }
            assert_eq!(heap.gcs_completed(), 20);
            assert_eq!(heap.context().binding().max_overlapping_pauses(), 1);
        });
    }

    #[test]
    fn daemon_serves_requests() {
        let t = test_heap();
        let heap = t.heap.clone();
        panic_after(10_000, move || {
            heap.spawn_gc_daemon();
            heap.request_concurrent_gc(GcType::Sticky);
            heap.request_concurrent_gc(GcType::Full);
            // The sticky request is either upgraded while pending or served first.
            while heap.wait_for_gc_to_complete() != Some(GcType::Full) {
                std::thread::sleep(Duration::from_millis(1));
            }
            heap.shutdown();
            assert!(heap.gcs_completed() <= 2);
            assert_eq!(heap.session(GcType::Full, true).cycles(), 1);
        });
    }

    #[test]
    fn service_marks_for_the_mutator() {
        serial_test(|| {
            let t = test_heap_with(|builder| builder.options_mut().use_gc_service = true);
            let los = t.heap.set_large_object_space("los", ALIGN, GcRetentionPolicy::AlwaysCollect);
            let heap = t.heap.clone();
            let service = GcService::new(heap.context().clone());
            let service_thread = std::thread::spawn(move || service.run_loop());
            while !heap.context().header().service_attached.load(Ordering::Acquire) {
                std::thread::yield_now();
            }

            let a = t.alloc(&t.main, 0);
            let b = t.alloc(&t.main, 1);
            let c = t.alloc(&t.main, 2);
            // Outside every continuous space, so the service cannot mark it.
            let large = TEST_HEAP_BEGIN + 8 * SPACE_SIZE;
            assert!(los.is_discontinuous());
            assert!([&t.image, &t.zygote, &t.main].iter().all(|s| !s.contains(large)));
            heap.record_allocation(large);
            let garbage = t.alloc(&t.main, 3);
            t.vm().add_thread_root(a);
            t.vm().add_edge(a, b);
            t.vm().add_edge(b, c);
            t.vm().add_edge(b, large);

            let stats = panic_after(10_000, {
                let heap = heap.clone();
                move || heap.collect(GcType::Partial, false, false)
            });
            // The mutator marks the root and the deferred large object, the service the rest.
            assert_eq!(stats.marked_objects, 4);
            assert_eq!(t.vm().freed(), vec![garbage]);
            for object in [a, b, c, large] {
                assert!(heap.is_live(object));
            }

            heap.shutdown();
            assert_eq!(service_thread.join().unwrap(), 1);
            assert!(!heap.context().header().service_attached.load(Ordering::Acquire));
        })
    }

    #[test]
    fn shutdown_before_the_service_starts_is_kept() {
        let t = test_heap();
        t.heap.shutdown();
        let service = GcService::new(t.heap.context().clone());
        assert_eq!(panic_after(2_000, move || service.run_loop()), 0);
        let header = t.heap.context().header();
        assert!(!header.service_attached.load(Ordering::Acquire));
        assert!(header.service_shutdown.load(Ordering::Acquire));

        // No handoff is attempted once the service is gone.
        let stats = t.heap.collect(GcType::Partial, false, false);
        assert_eq!(stats.marked_objects, 0);
        assert_eq!(t.heap.gcs_completed(), 1);
    }

    #[test]
    #[should_panic]
    fn overlapping_spaces_are_fatal() {
        let t = test_heap();
        t.heap.add_continuous_space(
            "overlap",
            t.main.begin() + SPACE_SIZE / 2,
            SPACE_SIZE,
            ALIGN,
            GcRetentionPolicy::AlwaysCollect,
        );
    }
}
