mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use common::*;
use gcservice::collector::{AllocationError, GcPhase, GcType};
use rand::Rng;

#[test]
fn blocking_cycle_runs_callbacks_in_their_phases() {
    let t = TestHeap::new(|_| {});
    let session = t.heap.session(GcType::Partial, false);
    t.runtime().observe(session);
    let garbage = t.alloc(&t.main, 0);

    t.heap.collect(GcType::Partial, false, false);

    assert_eq!(
        t.runtime().callbacks(),
        vec![
            ("stop", GcPhase::PreInit),
            ("thread_roots", GcPhase::RootMark),
            ("global_roots", GcPhase::RootConcMark),
            ("sweep", GcPhase::MarkReachables),
            ("resume", GcPhase::MarkReachables),
        ]
    );
    assert_eq!(t.runtime().freed(), vec![garbage]);
    assert_eq!(session.transitions(), GcPhase::ALL.len());
    assert_eq!(session.phase(), GcPhase::None);
}

#[test]
fn concurrent_cycle_pauses_to_swap_stacks_and_finish_marking() {
    let t = TestHeap::new(|builder| assert!(builder.set_option("concurrent_gc", "true")));
    let session = t.heap.session(GcType::Full, true);
    t.runtime().observe(session);

    t.heap.collect(GcType::Full, true, false);

    assert_eq!(
        t.runtime().callbacks(),
        vec![
            ("stop", GcPhase::Init),
            ("resume", GcPhase::Init),
            ("thread_roots", GcPhase::RootMark),
            ("global_roots", GcPhase::RootConcMark),
            ("stop", GcPhase::MarkReachables),
            ("thread_roots", GcPhase::MarkReachables),
            ("global_roots", GcPhase::MarkReachables),
            ("resume", GcPhase::MarkReachables),
        ]
    );
    assert_eq!(session.cycles(), 1);
}

#[test]
fn concurrent_cycle_ages_dirty_cards() {
    let t = TestHeap::new(|builder| assert!(builder.set_option("concurrent_gc", "true")));
    let old = t.alloc(&t.main, 0);
    t.runtime().add_root(old);
    t.heap.collect(GcType::Partial, false, false);

    let young = t.alloc(&t.main, 1);
    t.runtime().add_edge(old, young);
    t.heap.write_barrier(old);
    let stats = t.heap.collect(GcType::Partial, true, false);

    assert!(t.runtime().freed().is_empty());
    assert!(t.heap.is_live(young));
    assert_eq!(stats.aged_cards, 1);
}

#[test]
fn at_most_one_cycle_runs_at_a_time() {
    let t = TestHeap::new(|_| {});
    let heap = t.heap.clone();
    let stop_watching = Arc::new(AtomicBool::new(false));

    let watcher = {
        let heap = heap.clone();
        let stop_watching = stop_watching.clone();
        thread::spawn(move || {
            while !stop_watching.load(Ordering::Acquire) {
                heap.wait_for_gc_to_complete();
                thread::yield_now();
            }
        })
    };

    let collectors: Vec<_> = (0..6)
        .map(|_| {
            let heap = heap.clone();
            thread::spawn(move || {
                let mut rng = rand::rng();
                for _ in 0..10 {
                    let gc_type = GcType::from_u32(rng.random_range(0..3)).unwrap();
                    heap.collect(gc_type, rng.random_bool(0.5), rng.random_bool(0.1));
                }
            })
        })
        .collect();
    for collector in collectors {
        collector.join().unwrap();
    }
    stop_watching.store(true, Ordering::Release);
    watcher.join().unwrap();

    assert_eq!(heap.gcs_completed(), 60);
    assert_eq!(t.runtime().max_overlapping_pauses(), 1);
    let cycles: usize = heap.sessions().iter().map(|s| s.cycles()).sum();
    assert_eq!(cycles, 60);
    assert!(!heap.is_gc_running());
}

#[test]
fn allocation_failure_is_reported_after_every_kind_of_collection() {
    let t = TestHeap::new(|_| {});
    let mut attempts = 0;
    let result = t.heap.allocate_with_gc(|| {
        attempts += 1;
        Err(AllocationError::HeapOutOfMemory)
    });
    assert_eq!(result, Err(AllocationError::HeapOutOfMemory));
    assert_eq!(attempts, 5);
    assert_eq!(t.heap.gcs_completed(), 4);
    assert_eq!(t.heap.last_gc_type(), Some(GcType::Full));
}

#[test]
fn long_lived_space_is_collected_by_full_cycles_only() {
    let t = TestHeap::new(|_| {});
    let long_lived = t.alloc(&t.zygote, 0);

    t.heap.collect(GcType::Sticky, false, false);
    t.heap.collect(GcType::Partial, false, false);
    assert!(t.runtime().freed().is_empty());

    t.heap.collect(GcType::Full, false, false);
    assert_eq!(t.runtime().freed(), vec![long_lived]);
}
