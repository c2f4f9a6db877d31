use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::marking::Marker;
use super::phase::GcPhase;
use super::session::CollectorSession;
use super::shared::{SharedHeapHeader, DEFERRED_STACK, MARK_STACK};
use super::space::{Space, SpaceRecord};
use crate::accounting::{HeapBitmap, ObjectStack, SpaceBitmap};
use crate::gc_context::GcContext;
use crate::ipc::SharedRef;
use crate::vm::VMBinding;

/// The marking side of the protocol, run by the GC service process (or a thread standing in for
/// it). It waits for a mutator to raise the server-synchronize flag, drains the shared mark stack
/// into the shared mark bitmaps, and hands the cycle back at `MARK_RECURSIVE`.
///
/// Everything it touches is reached through the shared header inherited at fork. Objects outside
/// every continuous space are pushed to the deferred stack for the mutator to mark.
pub struct GcService<VM: VMBinding> {
    context: GcContext<VM>,
}

impl<VM: VMBinding> GcService<VM> {
    pub fn new(context: GcContext<VM>) -> Self {
        GcService { context }
    }

    fn header(&self) -> &SharedHeapHeader {
        self.context.header()
    }

    /// Announce that the service accepts handoffs. Does nothing once shutdown was requested, so a
    /// shutdown that happens before the service starts is not lost.
    pub fn attach(&self) -> bool {
        let header = self.header();
        let _guard = header.service_lock.lock();
        if header.service_shutdown.load(Ordering::Acquire) {
            info!("GC service not attached: shutdown already requested");
            return false;
        }
        header.service_attached.store(true, Ordering::Release);
        header.service_cond.notify_all();
        info!("GC service attached");
        true
    }

    /// Ask [`GcService::run_loop`] to return once no handoff is pending.
    pub fn detach(&self) {
        let header = self.header();
        let _guard = header.service_lock.lock();
        header.service_shutdown.store(true, Ordering::Release);
        header.service_cond.notify_all();
    }

    /// Serve handoffs until shut down. A raised flag is always served before shutting down, and
    /// the service is marked detached under the same lock that mutators check before raising it.
    /// Returns the number of cycles served.
    pub fn run_loop(&self) -> usize {
        if !self.attach() {
            return 0;
        }
        let header = self.header();
        let mut served = 0;
        loop {
            let guard = header.service_lock.lock();
            let guard = header.service_cond.wait_while(guard, || {
                header.server_synchronize.load(Ordering::Acquire) == 0
                    && !header.service_shutdown.load(Ordering::Acquire)
            });
            let flag = header.server_synchronize.load(Ordering::Acquire);
            if flag == 0 {
                header.service_attached.store(false, Ordering::Release);
                header.service_cond.notify_all();
                break;
            }
            drop(guard);
            self.serve(flag as usize - 1);
            served += 1;
        }
        info!("GC service detached after {} cycles", served);
        served
    }

    fn open_session(&self, index: usize) -> CollectorSession {
        let header = self.header();
        if index >= header.num_collectors.load(Ordering::Acquire) {
            fatal!("Server synchronize flag names unknown collector {}", index);
        }
        CollectorSession::open(self.context.region(), header.collectors[index].load())
    }

    fn open_stack(&self, index: usize) -> ObjectStack {
        ObjectStack::from_record(self.context.region(), self.header().object_stacks[index].load())
    }

    /// Views of the registered spaces' bitmaps, as the mark heap bitmap `which` assigns them.
    fn open_mark_bitmap(&self, which: u32) -> HeapBitmap {
        let header = self.header();
        let region = self.context.region();
        let record = &header.heap_bitmaps[which as usize];
        let mut heap_bitmap = HeapBitmap::new();
        for i in 0..header.num_spaces() {
            // SAFETY: space records are written once by the mutator before the offset is
            // published, and never freed.
            let space_record: SharedRef<SpaceRecord> =
                unsafe { SharedRef::from_offset(region.clone(), header.spaces[i].load()) };
            let (space, bitmaps): (Space, [Arc<SpaceBitmap>; 2]) = Space::open(region, i, &space_record);
            trace!("Service opened space {}", space);
            let [first, second] = bitmaps;
            heap_bitmap.add_continuous_space_bitmap(if record.slot(i) == 0 { first } else { second });
        }
        heap_bitmap
    }

    fn serve(&self, index: usize) {
        let session = self.open_session(index);
        debug!("Service marking for collector {} ({})", index, session.gc_type());
        session.block_for_gc_phase(GcPhase::ConcMark);

        let mark_bitmap = self.open_mark_bitmap(session.active_mark_bitmap());
        let mark_stack = self.open_stack(MARK_STACK);
        let deferred = self.open_stack(DEFERRED_STACK);
        let mut marker = Marker::new(
            self.context.binding(),
            &mark_bitmap,
            session.immune_range(),
            &mark_stack,
            Some(&deferred),
        );
        marker.process_mark_stack();
        session.add_service_marked_objects(marker.marked());
        debug!(
            "Service marked {} objects, deferred {}",
            marker.marked(),
            deferred.len()
        );

        {
            let header = self.header();
            let _guard = header.service_lock.lock();
            header.server_synchronize.store(0, Ordering::Release);
        }
        session.set_phase(GcPhase::MarkRecursive);
    }
}
