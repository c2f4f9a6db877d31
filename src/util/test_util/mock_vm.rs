//! A binding for unit tests. Objects are addresses in a fake heap that is never dereferenced: the
//! object graph lives in a side table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::collector::Space;
use crate::util::Address;
use crate::vm::{Collection, Scanning};

/// Bytes reported freed for every swept object.
pub(crate) const MOCK_OBJECT_SIZE: usize = 16;

#[derive(Default)]
pub(crate) struct MockVM {
    thread_roots: Mutex<Vec<Address>>,
    global_roots: Mutex<Vec<Address>>,
    soft_referents: Mutex<Vec<Address>>,
    edges: Mutex<HashMap<Address, Vec<Address>>>,
    freed: Mutex<Vec<Address>>,
    stopped: AtomicUsize,
    max_stopped: AtomicUsize,
    pauses: AtomicUsize,
    soft_references_cleared: AtomicBool,
}

impl MockVM {
    pub fn add_thread_root(&self, object: Address) {
        self.thread_roots.lock().unwrap().push(object);
    }

    pub fn add_global_root(&self, object: Address) {
        self.global_roots.lock().unwrap().push(object);
    }

    pub fn add_soft_referent(&self, object: Address) {
        self.soft_referents.lock().unwrap().push(object);
    }

    pub fn clear_roots(&self) {
        self.thread_roots.lock().unwrap().clear();
        self.global_roots.lock().unwrap().clear();
    }

    pub fn add_edge(&self, from: Address, to: Address) {
        self.edges.lock().unwrap().entry(from).or_default().push(to);
    }

    pub fn clear_edges(&self, from: Address) {
        self.edges.lock().unwrap().remove(&from);
    }

    /// Everything swept so far, in order.
    pub fn freed(&self) -> Vec<Address> {
        self.freed.lock().unwrap().clone()
    }

    /// The most stop-the-world pauses that overlapped.
    pub fn max_overlapping_pauses(&self) -> usize {
        self.max_stopped.load(Ordering::SeqCst)
    }

    /// Stop-the-world pauses started so far.
    pub fn pauses(&self) -> usize {
        self.pauses.load(Ordering::SeqCst)
    }

    pub fn soft_references_cleared(&self) -> bool {
        self.soft_references_cleared.load(Ordering::SeqCst)
    }
}

impl Collection for MockVM {
    fn stop_all_mutators(&self) {
        self.pauses.fetch_add(1, Ordering::SeqCst);
        let stopped = self.stopped.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_stopped.fetch_max(stopped, Ordering::SeqCst);
    }

    fn resume_mutators(&self) {
        self.stopped.fetch_sub(1, Ordering::SeqCst);
    }

    fn sweep_objects(&self, _space: &Space, objects: &[Address]) -> usize {
        self.freed.lock().unwrap().extend_from_slice(objects);
        let mut edges = self.edges.lock().unwrap();
        for object in objects {
            edges.remove(object);
        }
        objects.len() * MOCK_OBJECT_SIZE
    }

    fn clear_soft_references(&self) {
        self.soft_referents.lock().unwrap().clear();
        self.soft_references_cleared.store(true, Ordering::SeqCst);
    }
}

impl Scanning for MockVM {
    fn scan_thread_roots(&self, visitor: &mut dyn FnMut(Address)) {
        let roots = self.thread_roots.lock().unwrap().clone();
        roots.into_iter().for_each(visitor);
    }

    fn scan_global_roots(&self, visitor: &mut dyn FnMut(Address)) {
        let roots = self.global_roots.lock().unwrap().clone();
        roots.into_iter().for_each(visitor);
    }

    fn scan_soft_references(&self, visitor: &mut dyn FnMut(Address)) {
        let referents = self.soft_referents.lock().unwrap().clone();
        referents.into_iter().for_each(visitor);
    }

    fn scan_object(&self, object: Address, visitor: &mut dyn FnMut(Address)) {
        let children = self.edges.lock().unwrap().get(&object).cloned().unwrap_or_default();
        children.into_iter().for_each(visitor);
    }
}
