//! Integration tests for the marker: fixed point, write barrier, objects
//! under construction and deadline-bounded steps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cogc::gc::{
    HeapConsistency, MarkerPhase, MarkingConfig, MarkingType, StackState, WriteBarrier,
    WriteBarrierParams, WriteBarrierType,
};
use cogc::stack::{ManualStack, StackScanner};
use cogc::{
    Gc, GcConfig, GarbageCollected, GlobalCollectorState, HeapBase, HeapConfig, Member,
    Persistent, Trace, Visitor,
};

#[derive(Trace, GarbageCollected)]
struct Node {
    next: Member<Node>,
    id: usize,
}

impl Node {
    fn new(id: usize) -> Self {
        Self {
            next: Member::null(),
            id,
        }
    }

    fn linked(id: usize, next: Gc<Self>) -> Self {
        Self {
            next: Member::new(Some(next)),
            id,
        }
    }
}

fn heap_with_workers(workers: usize) -> (Arc<HeapBase>, Arc<ManualStack>) {
    let stack = Arc::new(ManualStack::new());
    let heap = HeapBase::with_state(
        HeapConfig::default().with_concurrent_marking_workers(workers),
        Arc::new(GlobalCollectorState::new()),
        Arc::clone(&stack) as Arc<dyn StackScanner>,
    )
    .expect("create heap");
    (heap, stack)
}

fn is_marked<T: GarbageCollected>(gc: &Gc<T>) -> bool {
    Gc::header(gc).is_marked()
}

#[test]
fn test_cycle_reaches_fixed_point() {
    let (heap, _stack) = heap_with_workers(0);
    let a = heap.allocate(Node::new(1));
    let b = heap.allocate(Node::linked(2, a));
    a.next.set(Some(b));
    let _root = Persistent::new(&heap, a);

    let marker = heap.marker();
    marker.start_marking(MarkingConfig::new(
        MarkingType::Atomic,
        StackState::NoHeapPointers,
    ));
    assert_eq!(marker.phase(), MarkerPhase::Marking);
    assert!(marker.advance_marking_with_deadline(Duration::MAX).is_complete());
    marker.finish_marking_for_testing(StackState::NoHeapPointers);

    assert!(is_marked(&a));
    assert!(is_marked(&b));
    // Each object was traced exactly once.
    let expected = Gc::header(&a).size() + Gc::header(&b).size();
    assert_eq!(marker.marked_bytes(), expected);
    assert!(marker.worklists().marking.is_empty());
    assert!(marker.worklists().write_barrier.is_empty());

    marker.process_weakness();
    assert_eq!(marker.phase(), MarkerPhase::Finished);
}

#[test]
fn test_write_barrier_marks_new_target() {
    let (heap, _stack) = heap_with_workers(0);
    let root = heap.allocate(Node::new(0));
    let _persistent = Persistent::new(&heap, root);

    heap.start_incremental_garbage_collection(GcConfig::precise_incremental().without_sweeping());
    assert!(heap
        .advance_incremental_garbage_collection(Duration::MAX)
        .is_complete());
    assert!(is_marked(&root));

    // The root is black now; the new object is white.
    let target = heap.allocate(Node::new(1));
    assert!(!is_marked(&target));
    root.next.set(Some(target));

    heap.finalize_incremental_garbage_collection_if_running(StackState::NoHeapPointers)
        .expect("cycle was running");
    assert!(is_marked(&target));
}

#[test]
fn test_missing_write_barrier_loses_target() {
    let (heap, _stack) = heap_with_workers(0);
    let root = heap.allocate(Node::new(0));
    let _persistent = Persistent::new(&heap, root);

    heap.start_incremental_garbage_collection(GcConfig::precise_incremental().without_sweeping());
    assert!(heap
        .advance_incremental_garbage_collection(Duration::MAX)
        .is_complete());

    let target = heap.allocate(Node::new(1));
    // SAFETY: deliberately skips the barrier; the cycle does not sweep.
    unsafe { root.next.set_without_barrier(Some(target)) };

    heap.finalize_incremental_garbage_collection_if_running(StackState::NoHeapPointers)
        .expect("cycle was running");
    assert!(is_marked(&root));
    assert!(!is_marked(&target));
}

static TRACED_EARLY: AtomicBool = AtomicBool::new(false);

struct Probe {
    constructed: bool,
    child: Member<Node>,
}

unsafe impl Trace for Probe {
    fn trace(&self, visitor: &mut dyn cogc::Visitor) {
        if !self.constructed {
            TRACED_EARLY.store(true, Ordering::SeqCst);
        }
        self.child.trace(visitor);
    }
}

cogc::impl_garbage_collected!(Probe);

fn in_construction_scenario(config: GcConfig, workers: usize) {
    let (heap, stack) = heap_with_workers(workers);
    let child = heap.allocate(Node::new(7));
    let uninit = heap.allocate_uninit::<Probe>();
    stack.push(uninit.payload() as usize);

    heap.start_incremental_garbage_collection(config.without_sweeping());
    while !heap
        .advance_incremental_garbage_collection(Duration::from_millis(1))
        .is_complete()
    {}
    assert!(uninit.header().is_marked());
    assert!(uninit.header().is_in_construction());

    let probe = uninit.finish(Probe {
        constructed: true,
        child: Member::new(Some(child)),
    });
    stack.clear();

    heap.finalize_incremental_garbage_collection_if_running(StackState::NoHeapPointers)
        .expect("cycle was running");
    assert!(is_marked(&probe));
    assert!(is_marked(&child));
    assert!(!TRACED_EARLY.load(Ordering::SeqCst));
}

#[test]
fn test_object_under_construction_is_marked_without_tracing() {
    in_construction_scenario(GcConfig::conservative_incremental(), 0);
}

#[test]
fn test_object_under_construction_with_concurrent_workers() {
    in_construction_scenario(GcConfig::conservative_incremental_and_concurrent(), 2);
}

#[test]
fn test_atomic_cycle_keeps_object_under_construction() {
    let (heap, stack) = heap_with_workers(0);
    let uninit = heap.allocate_uninit::<Probe>();
    stack.push(uninit.payload() as usize);

    let event = heap.collect_garbage(GcConfig::conservative_atomic());
    assert_eq!(event.finalized_objects, 0);
    assert!(!uninit.header().is_free());
    assert!(!TRACED_EARLY.load(Ordering::SeqCst));
    drop(uninit);
}

#[test]
fn test_deadline_bounds_marking_steps() {
    const LENGTH: usize = 20_000;

    let (heap, _stack) = heap_with_workers(0);
    let mut head = heap.allocate(Node::new(0));
    for id in 1..LENGTH {
        head = heap.allocate(Node::linked(id, head));
    }
    let _root = Persistent::new(&heap, head);

    heap.start_incremental_garbage_collection(GcConfig::precise_incremental().without_sweeping());
    let step = heap.advance_incremental_garbage_collection(Duration::from_nanos(1));
    assert!(!step.is_complete());
    assert!(!heap.marker().worklists().marking.is_empty());
    assert!(heap.marker().marked_bytes() < LENGTH * Gc::header(&head).size());

    let step = heap.advance_incremental_garbage_collection(Duration::MAX);
    assert!(step.is_complete());
    assert!(heap.marker().worklists().marking.is_empty());
    assert_eq!(
        heap.marker().marked_bytes(),
        LENGTH * Gc::header(&head).size()
    );

    let event = heap
        .finalize_incremental_garbage_collection_if_running(StackState::NoHeapPointers)
        .expect("cycle was running");
    assert_eq!(event.marked_bytes, LENGTH * Gc::header(&head).size());
}

#[test]
fn test_finalize_without_running_cycle_is_none() {
    let (heap, _stack) = heap_with_workers(0);
    assert!(heap
        .finalize_incremental_garbage_collection_if_running(StackState::NoHeapPointers)
        .is_none());
    assert!(heap
        .advance_incremental_garbage_collection(Duration::ZERO)
        .is_complete());
}

#[test]
fn test_end_to_end_mark_and_verify() {
    let stack = Arc::new(ManualStack::new());
    let heap = HeapBase::with_state(
        HeapConfig::default().with_verify_marking(true),
        Arc::new(GlobalCollectorState::new()),
        Arc::clone(&stack) as Arc<dyn StackScanner>,
    )
    .expect("create heap");

    let b = heap.allocate(Node::new(2));
    let a = heap.allocate(Node::linked(1, b));
    let r = heap.allocate(Node::linked(0, a));
    let c = heap.allocate(Node::new(3));
    let _root = Persistent::new(&heap, r);

    let event = heap.collect_garbage(GcConfig::precise_atomic().without_sweeping());
    assert!(is_marked(&r));
    assert!(is_marked(&a));
    assert!(is_marked(&b));
    assert!(!is_marked(&c));
    assert_eq!(event.marked_bytes, 3 * Gc::header(&r).size());

    #[cfg(any(debug_assertions, feature = "verify-heap"))]
    cogc::gc::MarkingVerifier::new(&heap).run(StackState::NoHeapPointers);

    // The next cycle clears the stale marks first and then sweeps `c`.
    let event = heap.collect_garbage(GcConfig::precise_atomic());
    assert_eq!(event.swept_bytes, Gc::header(&r).size());
    assert_eq!(r.next.get().map(|a| a.id), Some(1));
}

/// Starts a cycle that has already traced everything reachable from the
/// roots, so that every root is black.
fn start_with_black_roots(heap: &HeapBase) {
    heap.start_incremental_garbage_collection(GcConfig::precise_incremental().without_sweeping());
    assert!(heap
        .advance_incremental_garbage_collection(Duration::MAX)
        .is_complete());
}

#[test]
fn test_steele_barrier_retraces_black_object() {
    let (heap, _stack) = heap_with_workers(0);
    let root = heap.allocate(Node::new(0));
    let _persistent = Persistent::new(&heap, root);
    start_with_black_roots(&heap);
    assert!(is_marked(&root));

    let target = heap.allocate(Node::new(1));
    // SAFETY: the Steele barrier below stands in for the skipped one.
    unsafe { root.next.set_without_barrier(Some(target)) };

    let slot = std::ptr::from_ref(&root.next).cast::<u8>();
    let object = Gc::as_ptr(&root).cast::<u8>();
    let mut params = WriteBarrierParams::default();
    assert_eq!(
        WriteBarrier::get_write_barrier_type(slot, object, &mut params),
        WriteBarrierType::Marking
    );
    // SAFETY: `object` is a payload on this heap.
    unsafe { WriteBarrier::steele_marking_barrier(&params, object) };
    assert!(!heap.marker().worklists().write_barrier.is_empty());
    assert!(!is_marked(&target));

    heap.finalize_incremental_garbage_collection_if_running(StackState::NoHeapPointers)
        .expect("cycle was running");
    assert!(is_marked(&target));
}

#[test]
fn test_steele_barrier_ignores_white_object() {
    let (heap, _stack) = heap_with_workers(0);
    let _root = Persistent::new(&heap, heap.allocate(Node::new(0)));
    start_with_black_roots(&heap);

    let white = heap.allocate(Node::new(1));
    let slot = std::ptr::from_ref(&white.next).cast::<u8>();
    let object = Gc::as_ptr(&white).cast::<u8>();
    let mut params = WriteBarrierParams::default();
    assert_eq!(
        HeapConsistency::get_write_barrier_type(slot, object, &mut params),
        WriteBarrierType::Marking
    );
    // SAFETY: `object` is a payload on this heap.
    unsafe { HeapConsistency::steele_write_barrier(&params, object) };
    assert!(heap.marker().worklists().write_barrier.is_empty());
    assert!(!is_marked(&white));

    heap.finalize_incremental_garbage_collection_if_running(StackState::NoHeapPointers)
        .expect("cycle was running");
}

#[derive(Trace, GarbageCollected)]
struct Table {
    slots: [Member<Node>; 4],
}

impl Table {
    fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| Member::null()),
        }
    }
}

unsafe fn trace_member(visitor: &mut dyn Visitor, slot: *const u8) {
    // SAFETY: callers pass slots of `Member<Node>`.
    unsafe { (*slot.cast::<Member<Node>>()).trace(visitor) };
}

fn fill_without_barrier(heap: &HeapBase, table: Gc<Table>) -> Vec<Gc<Node>> {
    table
        .slots
        .iter()
        .enumerate()
        .map(|(id, slot)| {
            let node = heap.allocate(Node::new(id));
            // SAFETY: the range barrier covers these stores.
            unsafe { slot.set_without_barrier(Some(node)) };
            node
        })
        .collect()
}

#[test]
fn test_range_barrier_marks_every_element() {
    let (heap, _stack) = heap_with_workers(0);
    let table = heap.allocate(Table::new());
    let _persistent = Persistent::new(&heap, table);
    start_with_black_roots(&heap);

    let nodes = fill_without_barrier(&heap, table);
    let first = table.slots.as_ptr().cast::<u8>();
    let mut params = WriteBarrierParams::default();
    assert_eq!(
        WriteBarrier::get_write_barrier_type_for_slot(first, &mut params),
        WriteBarrierType::Marking
    );
    // SAFETY: `first` starts an array of four initialized members.
    unsafe {
        HeapConsistency::dijkstra_write_barrier_range(
            &params,
            first,
            std::mem::size_of::<Member<Node>>(),
            table.slots.len(),
            trace_member,
        );
    }
    assert!(nodes.iter().all(is_marked));

    heap.finalize_incremental_garbage_collection_if_running(StackState::NoHeapPointers)
        .expect("cycle was running");
    assert!(nodes.iter().all(is_marked));
}

#[test]
fn test_range_barrier_after_marking_does_nothing() {
    let (heap, _stack) = heap_with_workers(0);
    let table = heap.allocate(Table::new());
    let _persistent = Persistent::new(&heap, table);
    start_with_black_roots(&heap);

    let first = table.slots.as_ptr().cast::<u8>();
    let mut params = WriteBarrierParams::default();
    assert_eq!(
        WriteBarrier::get_write_barrier_type_for_slot(first, &mut params),
        WriteBarrierType::Marking
    );
    heap.finalize_incremental_garbage_collection_if_running(StackState::NoHeapPointers)
        .expect("cycle was running");
    assert!(!heap.is_marking());
    assert_ne!(
        WriteBarrier::get_write_barrier_type_for_slot(first, &mut WriteBarrierParams::default()),
        WriteBarrierType::Marking
    );

    let nodes = fill_without_barrier(&heap, table);
    // SAFETY: as above; the marker is idle.
    unsafe {
        WriteBarrier::dijkstra_marking_barrier_range(
            &params,
            first,
            std::mem::size_of::<Member<Node>>(),
            table.slots.len(),
            trace_member,
        );
    }
    assert!(nodes.iter().all(|node| !is_marked(node)));
    assert!(heap.marker().worklists().marking.is_empty());
}

#[test]
fn test_collector_state_tracks_marking_heaps() {
    let state = Arc::new(GlobalCollectorState::new());
    let heaps: Vec<_> = (0..2)
        .map(|_| {
            HeapBase::with_state(
                HeapConfig::default(),
                Arc::clone(&state),
                Arc::new(ManualStack::new()) as Arc<dyn StackScanner>,
            )
            .expect("create heap")
        })
        .collect();
    assert!(!state.is_any_incremental_or_concurrent_marking());

    heaps[0].collect_garbage(GcConfig::precise_atomic());
    assert!(!state.is_any_incremental_or_concurrent_marking());

    for heap in &heaps {
        heap.start_incremental_garbage_collection(GcConfig::precise_incremental());
    }
    heaps[0]
        .finalize_incremental_garbage_collection_if_running(StackState::NoHeapPointers)
        .expect("cycle was running");
    assert!(state.is_any_incremental_or_concurrent_marking());
    assert!(std::ptr::eq(heaps[0].state(), heaps[1].state()));

    heaps[1]
        .finalize_incremental_garbage_collection_if_running(StackState::NoHeapPointers)
        .expect("cycle was running");
    assert!(!state.is_any_incremental_or_concurrent_marking());
}
