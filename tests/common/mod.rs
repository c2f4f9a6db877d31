#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use gcservice::collector::{CollectorSession, GcPhase, GcRetentionPolicy, IPCHeap, Space};
use gcservice::vm::{Collection, Scanning};
use gcservice::{Address, GcContextBuilder};

pub const HEAP_BEGIN: Address = unsafe { Address::from_usize(0x2000_0000) };
pub const SPACE_SIZE: usize = 1 << 20;
pub const ALIGN: usize = 8;
pub const OBJECT_SIZE: usize = 32;

/// A runtime whose objects are never dereferenced. References live in a side table.
#[derive(Default)]
pub struct TestRuntime {
    roots: Mutex<Vec<Address>>,
    edges: Mutex<HashMap<Address, Vec<Address>>>,
    freed: Mutex<Vec<Address>>,
    /// The session to observe. Every callback records the phase it ran in.
    observed: Mutex<Option<CollectorSession>>,
    callbacks: Mutex<Vec<(&'static str, GcPhase)>>,
    paused: AtomicUsize,
    max_paused: AtomicUsize,
}

impl TestRuntime {
    pub fn add_root(&self, object: Address) {
        self.roots.lock().unwrap().push(object);
    }

    pub fn add_edge(&self, from: Address, to: Address) {
        self.edges.lock().unwrap().entry(from).or_default().push(to);
    }

    pub fn freed(&self) -> Vec<Address> {
        self.freed.lock().unwrap().clone()
    }

    pub fn observe(&self, session: &CollectorSession) {
        *self.observed.lock().unwrap() = Some(session.clone());
    }

    pub fn callbacks(&self) -> Vec<(&'static str, GcPhase)> {
        self.callbacks.lock().unwrap().clone()
    }

    pub fn max_overlapping_pauses(&self) -> usize {
        self.max_paused.load(Ordering::SeqCst)
    }

    fn record(&self, callback: &'static str) {
        if let Some(session) = self.observed.lock().unwrap().as_ref() {
            self.callbacks.lock().unwrap().push((callback, session.phase()));
        }
    }
}

impl Collection for TestRuntime {
    fn stop_all_mutators(&self) {
        self.record("stop");
        let paused = self.paused.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_paused.fetch_max(paused, Ordering::SeqCst);
    }

    fn resume_mutators(&self) {
        self.paused.fetch_sub(1, Ordering::SeqCst);
        self.record("resume");
    }

    fn sweep_objects(&self, _space: &Space, objects: &[Address]) -> usize {
        self.record("sweep");
        self.freed.lock().unwrap().extend_from_slice(objects);
        objects.len() * OBJECT_SIZE
    }
}

impl Scanning for TestRuntime {
    fn scan_thread_roots(&self, visitor: &mut dyn FnMut(Address)) {
        self.record("thread_roots");
        let roots = self.roots.lock().unwrap().clone();
        roots.into_iter().for_each(visitor);
    }

    fn scan_global_roots(&self, _visitor: &mut dyn FnMut(Address)) {
        self.record("global_roots");
    }

    fn scan_object(&self, object: Address, visitor: &mut dyn FnMut(Address)) {
        let children = self.edges.lock().unwrap().get(&object).cloned().unwrap_or_default();
        children.into_iter().for_each(visitor);
    }
}

pub struct TestHeap {
    pub heap: Arc<IPCHeap<TestRuntime>>,
    pub zygote: Space,
    pub main: Space,
}

impl TestHeap {
    pub fn new(configure: impl FnOnce(&mut GcContextBuilder)) -> TestHeap {
        let mut builder = GcContextBuilder::new();
        assert!(builder.set_option("mark_stack_capacity", "4096"));
        assert!(builder.set_option("allocation_stack_capacity", "4096"));
        configure(&mut builder);
        let heap = IPCHeap::new(builder.build(TestRuntime::default()), HEAP_BEGIN, 2 * SPACE_SIZE);
        let zygote = heap.add_continuous_space("zygote", HEAP_BEGIN, SPACE_SIZE, ALIGN, GcRetentionPolicy::FullCollect);
        let main = heap.add_continuous_space(
            "main",
            HEAP_BEGIN + SPACE_SIZE,
            SPACE_SIZE,
            ALIGN,
            GcRetentionPolicy::AlwaysCollect,
        );
        TestHeap { heap, zygote, main }
    }

    pub fn runtime(&self) -> &TestRuntime {
        self.heap.context().binding()
    }

    /// Record the `index`th object of `space`.
    pub fn alloc(&self, space: &Space, index: usize) -> Address {
        let object = space.begin() + index * OBJECT_SIZE;
        self.heap.record_allocation(object);
        object
    }
}
